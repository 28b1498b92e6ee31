pub mod client;
pub mod config;
pub mod http;
pub mod llm;
pub mod proxy;
pub mod store;
pub mod telemetry;
pub mod ulid;
pub mod vault;
