use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Health check not found: {name}")]
    CheckNotFound { name: String },

    #[error("Alert not found: {id}")]
    AlertNotFound { id: Uuid },

    #[error("Notification delivery not implemented for channel '{channel}'")]
    NotificationUnimplemented { channel: String },

    #[error("Notification delivery failed on channel '{channel}': {reason}")]
    NotificationFailed { channel: String, reason: String },

    #[error("Configuration error: {0}")]
    Configuration(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, MonitorError>;
