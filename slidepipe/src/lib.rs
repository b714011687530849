//! slidepipe Core Library
//!
//! Watches a drop directory for whole-slide images and converts each one into a
//! tiled pyramid by supervising external imaging tools.
//!
//! ## Layout
//!
//! - [`core::workspace`] observes the watch root and wires the service together.
//! - [`core::admission`] decides which detected files become tasks.
//! - [`core::jobs`] owns the queue and the bounded worker pool.
//! - [`core::pipeline`] runs the two-stage subprocess conversion.
//! - [`core::remote`] delegates conversions to a remote service instead.
//! - [`core::events`] fans lifecycle and progress events out to listeners.

pub mod core;

pub use crate::core::settings::{Settings, SettingsManager};
pub use crate::core::workspace::service::ConversionService;
pub use crate::core::{CoreError, CoreResult};
