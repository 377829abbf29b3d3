//! SAP Daemon module
//!
//! This module contains the daemon runtime around the AP state machine:
//! configuration management, the daemon core and loopback collaborators.

pub mod config;
pub mod core;
pub mod sim;

// Re-export main types
pub use self::config::{
    ConfigManager, ConfigWatcher, DaemonConfig, InterfaceConfig, ValidationResult,
};
pub use self::core::{DaemonCommand, DaemonResponse, DaemonState, DaemonStats, SapDaemon};

use crate::registry::SapConfig;
use crate::{Result, SapError};
use std::path::{Path, PathBuf};

/// Daemon builder for easy configuration
#[derive(Debug, Default)]
pub struct DaemonBuilder {
    config: Option<DaemonConfig>,
    config_path: Option<PathBuf>,
    auto_start: Option<SapConfig>,
}

impl DaemonBuilder {
    /// Create new daemon builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set daemon configuration
    pub fn with_config(mut self, config: DaemonConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Load the configuration from a file when building
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Start the first configured interface with `start` when the daemon starts
    pub fn with_auto_start(mut self, start: Option<SapConfig>) -> Self {
        self.auto_start = start;
        self
    }

    /// Build the daemon
    pub async fn build(self) -> Result<SapDaemon> {
        let mut config = match (self.config, self.config_path) {
            (Some(config), _) => config,
            (None, Some(path)) => ConfigManager::load_from_file(&path)?.get_config().clone(),
            (None, None) => DaemonConfig::default(),
        };

        if let Some(start) = self.auto_start {
            let iface = config
                .interfaces
                .first_mut()
                .ok_or_else(|| SapError::Config("No interface configured".to_string()))?;
            iface.start = start;
            iface.auto_start = true;
        }

        SapDaemon::new(config).await
    }
}

/// Daemon utilities
pub struct DaemonUtils;

impl DaemonUtils {
    /// Get daemon process ID
    pub fn get_pid() -> u32 {
        std::process::id()
    }

    /// Create PID file
    pub fn create_pid_file(path: &Path) -> Result<()> {
        use std::io::Write;

        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", Self::get_pid())?;
        Ok(())
    }

    /// Remove PID file
    pub fn remove_pid_file(path: &Path) -> Result<()> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Read the PID recorded in a PID file
    pub fn read_pid_file(path: &Path) -> Result<Option<u32>> {
        if !path.exists() {
            return Ok(None);
        }
        let pid_str = std::fs::read_to_string(path)?;
        let pid = pid_str
            .trim()
            .parse::<u32>()
            .map_err(|_| SapError::Config("Invalid PID in PID file".to_string()))?;
        Ok(Some(pid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelWidth;

    #[tokio::test]
    async fn test_daemon_builder() {
        let daemon = DaemonBuilder::new()
            .with_config(DaemonConfig::default())
            .with_auto_start(Some(SapConfig::fixed(5745, ChannelWidth::Bw80)))
            .build()
            .await
            .unwrap();
        let iface = &daemon.get_config().interfaces[0];
        assert!(iface.auto_start);
        assert_eq!(iface.start, SapConfig::fixed(5745, ChannelWidth::Bw80));
    }

    #[tokio::test]
    async fn test_builder_loads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.json");
        let mut config = DaemonConfig::default();
        config.general.name = "lab-ap".to_string();
        ConfigManager::with_config(config).save_to_file(&path).unwrap();

        let daemon = DaemonBuilder::new().with_config_file(&path).build().await.unwrap();
        assert_eq!(daemon.get_config().general.name, "lab-ap");
    }

    #[test]
    fn test_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sap.pid");
        assert_eq!(DaemonUtils::read_pid_file(&path).unwrap(), None);

        DaemonUtils::create_pid_file(&path).unwrap();
        assert_eq!(DaemonUtils::read_pid_file(&path).unwrap(), Some(DaemonUtils::get_pid()));

        DaemonUtils::remove_pid_file(&path).unwrap();
        assert!(!path.exists());
    }
}
