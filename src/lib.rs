pub mod config;
pub mod errors;
pub mod extraction;
pub mod harvest;
pub mod job;
pub mod orchestrator;
pub mod queue;
pub mod search;
pub mod server;
pub mod store;
