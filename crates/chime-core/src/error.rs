//! Error taxonomy shared by every Chime crate.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChimeError {
    /// Rule text could not be parsed at all.
    #[error("Invalid recurrence rule '{rule}': {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    /// A snapshot write exhausted its retry budget and was dropped.
    #[error("Write gave up after {attempts} attempts: {reason}")]
    WriteGaveUp { attempts: u32, reason: String },
}

impl ChimeError {
    pub fn invalid_rule(rule: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::InvalidRule {
            rule: rule.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ChimeError>;
