pub mod coordinator;
pub mod executor;
pub mod lock;
pub mod manifest;
pub mod pipeline;
pub mod profile;
pub mod progress;
pub mod storage;
