pub mod config;
pub mod engine;
pub mod error;
pub mod model_loader;
pub mod pooled_engine;
pub mod registry;
pub mod routes;
pub mod transformer_engine;
pub mod types;
