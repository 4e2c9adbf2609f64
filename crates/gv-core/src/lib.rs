//! Core types shared by the gpuvas crates
//!
//! Holds the error taxonomy, configuration and logging setup.

pub mod config;
pub mod error;
pub mod logging;

pub use config::Config;
pub use error::{EmulatorError, MemoryError, Result, VmError};
