pub mod db;
pub mod encoder;
pub mod queue;
pub mod redis;
pub mod storage;
