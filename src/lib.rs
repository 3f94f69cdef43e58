pub mod client;
pub mod config;
pub mod error;
pub mod jobqueue;
pub mod jobs;
pub mod server;

pub use error::{BrokerError, Result};
