//! slidepipe Core Engine
//!
//! Conversion orchestration for whole-slide images.
//! Handles directory watching, admission, queueing, worker supervision and event fan-out.

pub mod admission;
pub mod events;
pub mod jobs;
pub mod pipeline;
pub mod process;
pub mod remote;
pub mod settings;
pub mod tasks;
pub mod workspace;

// Re-export common types
mod types;
pub use types::*;

mod error;
pub use error::*;
