//! # SAP radio lifecycle core
//!
//! Access-point radio management: channel acquisition, Channel Availability
//! Check (CAC) on DFS channels, Automatic Channel Selection (ACS), and
//! channel switching triggered by radar, band restrictions or concurrent
//! interfaces.
//!
//! ## Architecture
//!
//! The implementation is organized into several modules:
//! - `channel`: Channel parameter calculation (bonding, fallback, puncturing)
//! - `regulatory`: Regulatory channel table
//! - `registry`: Radio interface registry and per-interface context
//! - `acs`: Automatic channel selection
//! - `dfs`: DFS/CAC manager and shared regulatory state
//! - `policy`: Concurrency policy for start and switch validation
//! - `csa`: Channel-switch coordinator
//! - `backend`: External collaborator interfaces
//! - `event`: Internal FSM events and external notifications
//! - `fsm`: AP state machine
//! - `daemon`: Configuration, daemon runtime and loopback collaborators

pub mod acs;
pub mod backend;
pub mod channel;
pub mod csa;
pub mod dfs;
pub mod event;
pub mod fsm;
pub mod policy;
pub mod registry;
pub mod regulatory;

// Daemon modules
pub mod daemon;

// Re-export commonly used types
pub use crate::{
    acs::{AcsConfig, AcsEngine, AcsResult},
    backend::*,
    channel::*,
    dfs::{CacState, DfsConfig, DfsManager},
    event::*,
    fsm::{ApStateMachine, MachineConfig},
    registry::*,
    regulatory::*,
};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SapError {
    #[error("Invalid channel {freq} MHz: {reason}")]
    InvalidChannel { freq: u32, reason: String },

    #[error("No channel available: {0}")]
    NoChannelAvailable(String),

    #[error("Concurrency rejected: {0}")]
    ConcurrencyRejected(String),

    #[error("Regulatory violation: {0}")]
    RegulatoryViolation(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Interface {0} is already in the requested state")]
    AlreadyInState(InterfaceId),

    #[error("Interface not found: {0}")]
    InterfaceNotFound(InterfaceId),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Firmware error: {0}")]
    Firmware(String),

    #[error("Scan error: {0}")]
    Scan(String),

    #[error("Event error: {0}")]
    Event(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

impl SapError {
    /// Build an `InvalidChannel` error
    pub fn invalid_channel(freq: u32, reason: impl Into<String>) -> Self {
        SapError::InvalidChannel {
            freq,
            reason: reason.into(),
        }
    }

    /// The requested operation cannot succeed with any retry
    pub fn is_terminal(&self) -> bool {
        matches!(self, SapError::NoChannelAvailable(_) | SapError::RegulatoryViolation(_))
    }

    /// The caller may retry with different parameters
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SapError::InvalidChannel { .. }
                | SapError::ConcurrencyRejected(_)
                | SapError::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SapError>;

// Constants
pub const DEFAULT_ACS_WEIGHT: u32 = 100;
pub const DEFAULT_CAC_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_NOL_TIMEOUT_SECS: i64 = 30 * 60;
pub const DEFAULT_2G_CHANNEL_FREQ: u32 = 2437;

// Utility functions
pub fn init_logging() {
    env_logger::init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(DEFAULT_ACS_WEIGHT, 100);
        assert_eq!(DEFAULT_CAC_TIMEOUT_MS, 60_000);
        assert_eq!(DEFAULT_NOL_TIMEOUT_SECS, 1800);
    }

    #[test]
    fn test_error_classes() {
        assert!(SapError::NoChannelAvailable("x".into()).is_terminal());
        assert!(SapError::RegulatoryViolation("x".into()).is_terminal());
        assert!(SapError::invalid_channel(5500, "nol").is_retryable());
        assert!(!SapError::invalid_channel(5500, "nol").is_terminal());
        assert!(SapError::Timeout("ack".into()).is_retryable());
        let msg = SapError::invalid_channel(5500, "in NOL").to_string();
        assert_eq!(msg, "Invalid channel 5500 MHz: in NOL");
    }
}
