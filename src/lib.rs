//! Quill - streaming AI orchestration core
//!
//! This library talks to several chat-completion vendors, normalizes their
//! streams into one event model and drives the bounded multi-round
//! "model calls tool, tool result feeds back" loop for a note-taking host.

pub mod agent;
pub mod tools;
pub mod config;
pub mod error;
pub mod ui;

pub use error::{Error, Result};
