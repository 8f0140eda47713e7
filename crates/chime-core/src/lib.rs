//! # Chime Core
//!
//! Shared error type, configuration, and the collaborator traits the
//! scheduler is wired against:
//! - [`traits::storage::Storage`]: key-value blob store for tasks and markers
//! - [`traits::writer::Writer`]: durable sink for whole-state snapshots

pub mod config;
pub mod error;
pub mod traits;

pub use config::ChimeConfig;
pub use error::{ChimeError, Result};
