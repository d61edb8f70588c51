pub mod jobs;
pub mod transcoding;
