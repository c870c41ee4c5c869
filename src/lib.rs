pub mod agent;
pub mod broker;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod executor;
pub mod models;
pub mod result_store;
pub mod routes;
pub mod signing;
pub mod sweeper;
pub mod task_queue;
pub mod telemetry;
pub mod worker_registry;
