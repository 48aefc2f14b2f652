pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod store;
