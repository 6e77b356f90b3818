pub mod config;
pub mod discovery;
pub mod error;
pub mod nat;
pub mod node;
pub mod session;
pub mod utils;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;
