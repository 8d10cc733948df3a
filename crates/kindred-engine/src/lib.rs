//! kindred-engine — the canonical facade.
//!
//! Exactly one path to centroids and suggestions, shared by request
//! handlers, background workers, and batch jobs. Callers never reimplement
//! the trimming or clustering algorithm; they pass configuration in and get
//! the same numbers everyone else gets.

pub mod config;
pub mod engine;
mod suggest;

pub use config::{
    CentroidConfig, SuggestionOptions, CURRENT_CENTROID_VERSION, DEFAULT_MODEL_VERSION,
};
pub use engine::{BlockingEngine, Engine, EngineError};
