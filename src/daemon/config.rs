//! SAP Daemon Configuration module
//!
//! This module handles configuration management for the SAP daemon.
//! It provides configuration loading, validation, and management.

use crate::channel::Band;
use crate::dfs::DfsConfig;
use crate::fsm::MachineConfig;
use crate::policy::SccEnforcement;
use crate::registry::{
    parse_mac, ChannelSelection, InterfaceId, Persona, SapConfig, DEFAULT_MAX_INTERFACES,
};
use crate::regulatory::{DfsRegion, RegChannel, StaticRegulatoryTable};
use crate::{Result, SapError, DEFAULT_2G_CHANNEL_FREQ};

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// General daemon settings
    pub general: GeneralConfig,
    /// Regulatory domain
    pub regulatory: RegulatoryConfig,
    /// DFS/CAC settings
    pub dfs: DfsConfig,
    /// Concurrency settings
    pub concurrency: ConcurrencyConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// AP interfaces
    pub interfaces: Vec<InterfaceConfig>,
}

/// General daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Daemon name
    pub name: String,
    /// Daemon version
    pub version: String,
    /// PID file path
    pub pid_file: Option<PathBuf>,
    /// Firmware acknowledgement timeout (ms)
    pub firmware_timeout_ms: u64,
    /// Maximum number of AP interfaces
    pub max_interfaces: usize,
    /// Channel safety check interval (ms), 0 disables the check
    pub safety_check_interval_ms: u64,
    /// Statistics collection interval (ms)
    pub stats_interval_ms: u64,
}

/// Regulatory domain configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegulatoryConfig {
    /// Base table
    pub region: DfsRegion,
    /// Add the 6 GHz band
    pub enable_6ghz: bool,
    /// Per-channel overrides applied on top of the base table
    pub overrides: Vec<RegChannel>,
}

/// Concurrency configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Allow a forced channel on the avoid list when no station is connected
    pub coex_unsafe_override: bool,
    /// SCC enforcement for P2P GO
    pub go_scc_enforcement: SccEnforcement,
    /// Radio can run two bands simultaneously
    pub dbs_capable: bool,
    /// STA+SAP SCC allowed on DFS channels
    pub sta_sap_scc_on_dfs: bool,
    /// 2.4 GHz channel used by band restriction
    pub restricted_2g_freq: u32,
    /// Channels on the avoid list
    pub unsafe_channels: Vec<u32>,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log file path
    pub file: Option<PathBuf>,
    /// Enable console logging
    pub console: bool,
    /// Log format (json, text)
    pub format: String,
}

/// AP interface configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceConfig {
    /// Interface id
    pub id: u8,
    /// MAC address, `aa:bb:cc:dd:ee:ff`
    pub mac: String,
    /// Persona
    pub persona: Persona,
    /// Start the BSS when the daemon starts
    pub auto_start: bool,
    /// Start configuration
    pub start: SapConfig,
}

/// Configuration validation result
#[derive(Debug, Clone)]
pub struct ValidationResult {
    /// Whether configuration is valid
    pub valid: bool,
    /// Validation errors
    pub errors: Vec<String>,
    /// Validation warnings
    pub warnings: Vec<String>,
}

/// Configuration manager
pub struct ConfigManager {
    /// Current configuration
    config: DaemonConfig,
    /// Path to configuration file
    config_path: Option<PathBuf>,
    /// Configuration watchers
    watchers: Vec<Box<dyn ConfigWatcher>>,
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigManager")
            .field("config", &self.config)
            .field("config_path", &self.config_path)
            .field("watchers", &format!("[{} watchers]", self.watchers.len()))
            .finish()
    }
}

/// Configuration change watcher trait
pub trait ConfigWatcher: Send + Sync {
    /// Called when configuration changes
    fn on_config_changed(&self, old_config: &DaemonConfig, new_config: &DaemonConfig);

    /// Get watcher name
    fn name(&self) -> &str;
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            regulatory: RegulatoryConfig::default(),
            dfs: DfsConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            logging: LoggingConfig::default(),
            interfaces: vec![InterfaceConfig::default()],
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: "sap-daemon".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            pid_file: None,
            firmware_timeout_ms: 5_000,
            max_interfaces: DEFAULT_MAX_INTERFACES,
            safety_check_interval_ms: 0,
            stats_interval_ms: 60_000,
        }
    }
}

impl Default for RegulatoryConfig {
    fn default() -> Self {
        Self {
            region: DfsRegion::Fcc,
            enable_6ghz: false,
            overrides: Vec::new(),
        }
    }
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            coex_unsafe_override: false,
            go_scc_enforcement: SccEnforcement::Liberal,
            dbs_capable: true,
            sta_sap_scc_on_dfs: false,
            restricted_2g_freq: DEFAULT_2G_CHANNEL_FREQ,
            unsafe_channels: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            console: true,
            format: "text".to_string(),
        }
    }
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            id: 0,
            mac: "02:00:00:00:00:01".to_string(),
            persona: Persona::Sap,
            auto_start: false,
            start: SapConfig::default(),
        }
    }
}

impl RegulatoryConfig {
    /// Build the regulatory table
    pub fn build_table(&self) -> Result<StaticRegulatoryTable> {
        let mut table = match self.region {
            DfsRegion::Fcc => StaticRegulatoryTable::fcc(),
            DfsRegion::Etsi => StaticRegulatoryTable::etsi(),
            DfsRegion::Mkk => StaticRegulatoryTable::mkk(),
            DfsRegion::Unknown => {
                return Err(SapError::Config("Regulatory region must be set".to_string()));
            }
        };
        if self.enable_6ghz {
            table = table.with_6ghz();
        }
        for entry in &self.overrides {
            table.set_state(entry.freq, entry.state);
        }
        Ok(table)
    }
}

impl InterfaceConfig {
    /// Parsed interface id and MAC address
    pub fn identity(&self) -> Result<(InterfaceId, [u8; 6])> {
        Ok((InterfaceId(self.id), parse_mac(&self.mac)?))
    }
}

impl DaemonConfig {
    /// State machine configuration derived from this configuration
    pub fn machine_config(&self) -> MachineConfig {
        MachineConfig {
            firmware_timeout_ms: self.general.firmware_timeout_ms,
            max_interfaces: self.general.max_interfaces,
            dfs: self.dfs.clone(),
            coex_unsafe_override: self.concurrency.coex_unsafe_override,
            go_scc_enforcement: self.concurrency.go_scc_enforcement,
            restricted_2g_freq: self.concurrency.restricted_2g_freq,
        }
    }
}

impl ConfigManager {
    /// Create new configuration manager
    pub fn new() -> Self {
        Self {
            config: DaemonConfig::default(),
            config_path: None,
            watchers: Vec::new(),
        }
    }

    /// Create configuration manager with config
    pub fn with_config(config: DaemonConfig) -> Self {
        Self {
            config,
            config_path: None,
            watchers: Vec::new(),
        }
    }

    /// Load configuration from file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| SapError::Config(format!("Failed to read config file: {}", e)))?;

        let config: DaemonConfig = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| SapError::Config(format!("Failed to parse JSON config: {}", e)))?,
            Some("toml") => toml::from_str(&content)
                .map_err(|e| SapError::Config(format!("Failed to parse TOML config: {}", e)))?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .map_err(|e| SapError::Config(format!("Failed to parse YAML config: {}", e)))?,
            _ => return Err(SapError::Config("Unsupported config file format".to_string())),
        };

        Ok(Self {
            config,
            config_path: Some(path.to_path_buf()),
            watchers: Vec::new(),
        })
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        let content = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => self.to_json()?,
            Some("toml") => self.to_toml()?,
            Some("yaml") | Some("yml") => self.to_yaml()?,
            _ => return Err(SapError::Config("Unsupported config file format".to_string())),
        };

        fs::write(path, content)
            .map_err(|e| SapError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Get current configuration
    pub fn get_config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Update configuration
    pub fn update_config(&mut self, new_config: DaemonConfig) -> Result<()> {
        let validation = self.validate_config(&new_config)?;
        if !validation.valid {
            return Err(SapError::Config(format!(
                "Configuration validation failed: {}",
                validation.errors.join(", ")
            )));
        }

        let old_config = self.config.clone();
        self.config = new_config;

        for watcher in &self.watchers {
            watcher.on_config_changed(&old_config, &self.config);
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate_config(&self, config: &DaemonConfig) -> Result<ValidationResult> {
        let mut result = ValidationResult {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        };

        if config.general.name.is_empty() {
            result.errors.push("Daemon name cannot be empty".to_string());
        }

        if config.general.firmware_timeout_ms == 0 {
            result.errors.push("Firmware timeout cannot be 0".to_string());
        }

        if config.general.max_interfaces == 0 {
            result.errors.push("At least one interface must be allowed".to_string());
        }

        if config.regulatory.region == DfsRegion::Unknown {
            result.errors.push("Regulatory region must be set".to_string());
        }

        if config.dfs.cac_timeout_ms == 0 {
            result.warnings.push("CAC timeout is 0, DFS channels start without CAC".to_string());
        }

        if config.dfs.nol_timeout_secs <= 0 {
            result.errors.push("NOL timeout must be positive".to_string());
        }

        if Band::from_freq(config.concurrency.restricted_2g_freq) != Some(Band::Band2G) {
            result.errors.push(format!(
                "Band restriction channel {} MHz is not a 2.4 GHz channel",
                config.concurrency.restricted_2g_freq
            ));
        }

        if config.interfaces.len() > config.general.max_interfaces {
            result.errors.push(format!(
                "{} interfaces configured, at most {} allowed",
                config.interfaces.len(),
                config.general.max_interfaces
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for iface in &config.interfaces {
            if !seen.insert(iface.id) {
                result.errors.push(format!("Duplicate interface id {}", iface.id));
            }
            if parse_mac(&iface.mac).is_err() {
                result.errors.push(format!(
                    "Interface {} has invalid MAC '{}'",
                    iface.id, iface.mac
                ));
            }
            match iface.start.channel {
                ChannelSelection::Fixed { freq } if Band::from_freq(freq).is_none() => {
                    result.errors.push(format!(
                        "Interface {} fixed channel {} MHz is not a Wi-Fi channel",
                        iface.id, freq
                    ));
                }
                ChannelSelection::Auto if iface.start.acs.start_freq > iface.start.acs.end_freq => {
                    result.errors.push(format!("Interface {} ACS range is inverted", iface.id));
                }
                _ => {}
            }
            if iface.start.acs.dfs_weight_percent > 100 {
                result.errors.push(format!(
                    "Interface {} DFS weight {}% exceeds 100%",
                    iface.id, iface.start.acs.dfs_weight_percent
                ));
            }
            if iface.start.ignore_cac {
                result.warnings.push(format!("Interface {} skips CAC", iface.id));
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.logging.level.as_str()) {
            result.errors.push(format!(
                "Invalid log level '{}', must be one of: {}",
                config.logging.level,
                valid_levels.join(", ")
            ));
        }

        result.valid = result.errors.is_empty();

        Ok(result)
    }

    /// Add configuration watcher
    pub fn add_watcher(&mut self, watcher: Box<dyn ConfigWatcher>) {
        self.watchers.push(watcher);
    }

    /// Remove configuration watcher
    pub fn remove_watcher(&mut self, name: &str) {
        self.watchers.retain(|w| w.name() != name);
    }

    /// Reload configuration from file
    pub fn reload(&mut self) -> Result<()> {
        let path = self
            .config_path
            .clone()
            .ok_or_else(|| SapError::Config("No config file path set".to_string()))?;
        let new_manager = Self::load_from_file(path)?;
        self.update_config(new_manager.config)
    }

    /// Get configuration as JSON string
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.config)
            .map_err(|e| SapError::Config(format!("Failed to serialize config to JSON: {}", e)))
    }

    /// Get configuration as TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(&self.config)
            .map_err(|e| SapError::Config(format!("Failed to serialize config to TOML: {}", e)))
    }

    /// Get configuration as YAML string
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(&self.config)
            .map_err(|e| SapError::Config(format!("Failed to serialize config to YAML: {}", e)))
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelWidth;
    use crate::regulatory::{ChannelState, RegulatoryTable};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_daemon_config_default() {
        let config = DaemonConfig::default();
        assert_eq!(config.general.name, "sap-daemon");
        assert_eq!(config.regulatory.region, DfsRegion::Fcc);
        assert_eq!(config.dfs.cac_timeout_ms, 60_000);
        assert_eq!(config.interfaces.len(), 1);
    }

    #[test]
    fn test_config_validation() {
        let manager = ConfigManager::new();
        let result = manager.validate_config(&DaemonConfig::default()).unwrap();
        assert!(result.valid);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_config_validation_errors() {
        let manager = ConfigManager::new();
        let mut config = DaemonConfig::default();
        config.general.name = String::new();
        config.concurrency.restricted_2g_freq = 5180;
        config.interfaces.push(InterfaceConfig {
            mac: "not-a-mac".to_string(),
            ..InterfaceConfig::default()
        });

        let result = manager.validate_config(&config).unwrap();
        assert!(!result.valid);
        assert_eq!(result.errors.len(), 4);
    }

    #[test]
    fn test_dfs_weight_percent_bounded() {
        let manager = ConfigManager::new();
        let mut config = DaemonConfig::default();
        config.interfaces[0].start.acs.dfs_weight_percent = 250;

        let result = manager.validate_config(&config).unwrap();
        assert!(!result.valid);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("DFS weight"));
    }

    #[test]
    fn test_config_serialization() {
        let manager = ConfigManager::new();

        let json = manager.to_json().unwrap();
        assert!(json.contains("sap-daemon"));

        let toml = manager.to_toml().unwrap();
        assert!(toml.contains("sap-daemon"));

        let yaml = manager.to_yaml().unwrap();
        assert!(yaml.contains("sap-daemon"));
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DaemonConfig::default();
        config.dfs.prefer_non_dfs = true;
        config.interfaces[0].start = SapConfig::fixed(5745, ChannelWidth::Bw40);

        let manager = ConfigManager::with_config(config.clone());
        for name in ["sap.json", "sap.toml", "sap.yaml"] {
            let path = dir.path().join(name);
            manager.save_to_file(&path).unwrap();
            let loaded = ConfigManager::load_from_file(&path).unwrap();
            assert_eq!(loaded.get_config(), &config, "{}", name);
        }
        assert!(manager.save_to_file(dir.path().join("sap.ini")).is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.yaml");
        fs::write(&path, "regulatory:\n  region: Etsi\ndfs:\n  cac_timeout_ms: 1000\n").unwrap();

        let manager = ConfigManager::load_from_file(&path).unwrap();
        let config = manager.get_config();
        assert_eq!(config.regulatory.region, DfsRegion::Etsi);
        assert_eq!(config.dfs.cac_timeout_ms, 1000);
        assert_eq!(config.dfs.nol_timeout_secs, 1800);
        assert_eq!(config.general.name, "sap-daemon");
    }

    #[test]
    fn test_regulatory_overrides() {
        let config = RegulatoryConfig {
            region: DfsRegion::Fcc,
            enable_6ghz: false,
            overrides: vec![RegChannel::new(5180, ChannelState::Disabled)],
        };
        let table = config.build_table().unwrap();
        assert_eq!(table.channel_state(5180), ChannelState::Disabled);
        assert_eq!(table.channel_state(5200), ChannelState::Enabled);

        let unknown = RegulatoryConfig {
            region: DfsRegion::Unknown,
            ..RegulatoryConfig::default()
        };
        assert!(unknown.build_table().is_err());
    }

    struct CountingWatcher {
        name: String,
        calls: Arc<AtomicUsize>,
    }

    impl ConfigWatcher for CountingWatcher {
        fn on_config_changed(&self, _old_config: &DaemonConfig, _new_config: &DaemonConfig) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    #[test]
    fn test_config_watchers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut manager = ConfigManager::new();
        manager.add_watcher(Box::new(CountingWatcher {
            name: "counter".to_string(),
            calls: Arc::clone(&calls),
        }));

        let mut config = DaemonConfig::default();
        config.dfs.skip_cac = true;
        manager.update_config(config).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let mut invalid = DaemonConfig::default();
        invalid.logging.level = "loud".to_string();
        assert!(manager.update_config(invalid).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        manager.remove_watcher("counter");
        assert_eq!(manager.watchers.len(), 0);
    }

    #[test]
    fn test_reload_without_path() {
        let mut manager = ConfigManager::new();
        assert!(matches!(manager.reload(), Err(SapError::Config(_))));
    }
}
