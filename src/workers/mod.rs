pub mod reconciler;
pub mod transcoder;
