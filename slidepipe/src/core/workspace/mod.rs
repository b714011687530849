//! Watch Folder Module
//!
//! Observes the watch root for new and deleted slides. The watcher scans the
//! root at startup, follows `notify` events afterwards and only reports a file
//! once it has stopped changing. The service wires the watcher into the worker
//! pool.

pub mod ignore;
pub mod scanner;
pub mod service;
pub mod stability;
pub mod watcher;
