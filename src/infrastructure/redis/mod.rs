pub mod client;
pub mod lock;
