pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod scheduler;
pub mod server;
pub mod shutdown;
