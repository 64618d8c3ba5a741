pub mod chunk;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod memory;
pub mod output;
pub mod queue;
pub mod sink;
