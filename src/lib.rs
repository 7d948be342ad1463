pub mod bars;
pub mod breaker;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod orchestrator;
pub mod persist;
pub mod sizing;
pub mod state;
pub mod tws;
pub mod vstop;
