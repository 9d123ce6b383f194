pub mod buffer;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod parser;
pub mod pipeline;
pub mod reader;
pub mod server;
pub mod session;
pub mod upstream;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;
