pub mod boundary;
pub mod cli;
pub mod engine;
pub mod error;
pub mod listener;
pub mod logging;
pub mod resolver;
pub mod service;
pub mod settings;
pub mod utils;

pub use engine::{Engine, EngineOptions, EngineSnapshot};
pub use error::EngineError;
