pub mod audio;
pub mod commands;
pub mod config;
pub mod engine;
pub mod telemetry;

pub use engine::Engine;
