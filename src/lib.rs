pub mod cache;
pub mod config;
pub mod http;
pub mod logging;
