pub mod error;
pub mod response;
pub mod retry;
pub mod upload;
