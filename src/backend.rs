//! External collaborator interfaces
//!
//! The state machine never reaches for ambient globals: scan, concurrency
//! and firmware services are injected as trait objects at construction.
//! Completions re-enter the state machine as events (see `fsm`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channel::ChannelDescriptor;
use crate::registry::{InterfaceId, Persona};
use crate::Result;

/// Scan request identifier
pub type ScanId = Uuid;

/// Per-channel scan observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    /// Channel frequency in MHz
    pub freq: u32,
    /// Number of BSSs observed
    pub bss_count: u32,
    /// Strongest RSSI observed in dBm
    pub max_rssi: i8,
}

impl ScanResult {
    /// Create new scan observation
    pub fn new(freq: u32, bss_count: u32, max_rssi: i8) -> Self {
        Self { freq, bss_count, max_rssi }
    }
}

/// Scan service
#[async_trait]
pub trait ScanService: Send + Sync {
    /// Issue a scan restricted to `freqs`; results arrive through
    /// `ApStateMachine::on_scan_complete`
    async fn issue_scan(&self, interface: InterfaceId, freqs: &[u32]) -> Result<ScanId>;

    /// Abort an outstanding scan
    async fn cancel_scan(&self, _scan_id: ScanId) -> Result<()> {
        Ok(())
    }
}

/// Outcome of a hardware mode check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HwModeResult {
    /// Current hardware mode already supports the target
    NotRequired,
    /// Mode change accepted, completion arrives asynchronously
    RequestedAsync,
    /// Mode change impossible
    Failed,
}

/// Kind of a concurrent connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionMode {
    /// Station (client) connection
    Sta,
    /// Another soft AP
    Sap,
    /// P2P group owner
    P2pGo,
    /// P2P client
    P2pClient,
}

impl ConnectionMode {
    /// Check if the connection transmits beacons
    pub fn is_beaconing(&self) -> bool {
        matches!(self, ConnectionMode::Sap | ConnectionMode::P2pGo)
    }

    /// Check if the connection is a station-like client
    pub fn is_client(&self) -> bool {
        matches!(self, ConnectionMode::Sta | ConnectionMode::P2pClient)
    }

    /// Mode corresponding to an AP persona
    pub fn from_persona(persona: Persona) -> Self {
        match persona {
            Persona::Sap => ConnectionMode::Sap,
            Persona::P2pGo => ConnectionMode::P2pGo,
        }
    }
}

/// A connection reported by the concurrency manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcurrentConnection {
    /// Owning AP interface, `None` for non-AP connections
    pub interface: Option<InterfaceId>,
    /// Connection kind
    pub mode: ConnectionMode,
    /// Operating channel
    pub channel: ChannelDescriptor,
    /// Connected to an indoor-only AP
    #[serde(default)]
    pub indoor: bool,
}

/// Concurrency manager
#[async_trait]
pub trait ConcurrencyManager: Send + Sync {
    /// Check whether `target_freq` needs a hardware mode change and request it
    async fn check_and_request_hw_mode(
        &self,
        interface: InterfaceId,
        target_freq: u32,
    ) -> HwModeResult;

    /// Channel of the concurrent connection this interface should share, if any
    async fn get_concurrent_operating_channel(
        &self,
        interface: InterfaceId,
    ) -> Option<ChannelDescriptor>;

    /// Active connections other than `interface`
    async fn active_connections(&self, interface: InterfaceId) -> Vec<ConcurrentConnection>;

    /// Check a channel against the coexistence avoid list
    async fn is_safe_channel(&self, freq: u32) -> bool;

    /// Preferred channel list for `interface`, best first
    async fn preferred_channel_list(&self, interface: InterfaceId) -> Vec<u32>;

    /// Check if the hardware supports dual-band simultaneous operation
    fn is_dbs_capable(&self) -> bool;

    /// Check if a STA+SAP single-channel concurrency is allowed on DFS
    fn sta_sap_scc_on_dfs_allowed(&self) -> bool;
}

/// Parameters for a firmware BSS start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BssParams {
    /// Interface id
    pub interface: InterfaceId,
    /// Interface MAC address, used as BSSID
    pub bssid: [u8; 6],
    /// Network name
    pub ssid: String,
    /// Persona
    pub persona: Persona,
    /// Operating channel
    pub channel: ChannelDescriptor,
    /// CAC duration the firmware must observe before beaconing, 0 when none
    pub cac_duration_ms: u32,
    /// Beacon interval in TU
    pub beacon_interval: u16,
}

/// Firmware command channel
///
/// Each method returns once the firmware acknowledged the command. BSS start,
/// stop and channel switch completions arrive later through the
/// `ApStateMachine::on_*` callbacks.
#[async_trait]
pub trait FirmwareChannel: Send + Sync {
    /// Start a BSS
    async fn start_bss(&self, params: &BssParams) -> Result<()>;

    /// Stop a BSS
    async fn stop_bss(&self, interface: InterfaceId) -> Result<()>;

    /// Announce and perform a channel switch
    async fn channel_switch_announcement(
        &self,
        interface: InterfaceId,
        target: &ChannelDescriptor,
        cac_duration_ms: u32,
    ) -> Result<()>;

    /// Unblock beacon transmission
    async fn start_beacon(&self, interface: InterfaceId) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_mode_classes() {
        assert!(ConnectionMode::Sap.is_beaconing());
        assert!(ConnectionMode::P2pGo.is_beaconing());
        assert!(!ConnectionMode::Sta.is_beaconing());
        assert!(ConnectionMode::P2pClient.is_client());
        assert_eq!(ConnectionMode::from_persona(Persona::P2pGo), ConnectionMode::P2pGo);
    }

    #[test]
    fn test_bss_params_serialization() {
        let params = BssParams {
            interface: InterfaceId(0),
            bssid: [2, 0, 0, 0, 0, 1],
            ssid: "lab".to_string(),
            persona: Persona::Sap,
            channel: ChannelDescriptor::new_20(2437),
            cac_duration_ms: 0,
            beacon_interval: 100,
        };
        let json = serde_json::to_string(&params).unwrap();
        let parsed: BssParams = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, params);
    }
}
