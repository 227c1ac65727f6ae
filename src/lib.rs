pub mod config;
pub mod device;
pub mod error;
pub mod job;
pub mod persist;
pub mod protocol;
pub mod runtime;
pub mod transport;

pub use error::{BenchError, Result};
