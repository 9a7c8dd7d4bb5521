pub mod chain;
pub mod config;
pub mod error;
pub mod exchange;
pub mod lightning;
pub mod logging;
pub mod retry;
pub mod swap;
