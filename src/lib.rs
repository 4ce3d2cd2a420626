pub mod client;
pub mod config;
pub mod error;
pub mod gate;
pub mod identity;
pub mod progress;
pub mod quota;
pub mod rate_limit;
pub mod resolver;
pub mod routes;
pub mod transfer;
