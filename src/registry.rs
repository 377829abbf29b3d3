//! Radio interface registry
//!
//! Tracks every AP-like interface on the radio together with its persistent
//! per-interface context. Contexts are handed out as `Arc<Mutex<_>>` so an
//! interface's events can be serialized on its own lock. Other interfaces
//! only ever see the published `InterfaceSummary`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::acs::{AcsCandidate, AcsConfig};
use crate::backend::ScanId;
use crate::channel::{ChannelDescriptor, ChannelWidth};
use crate::csa::CsaReason;
use crate::policy::CcSwitchMode;
use crate::{Result, SapError};

/// Default number of AP interfaces a radio can host
pub const DEFAULT_MAX_INTERFACES: usize = 8;

/// Interface identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InterfaceId(pub u8);

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "if{}", self.0)
    }
}

/// Interface persona
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Persona {
    /// Soft access point
    Sap,
    /// P2P group owner
    P2pGo,
}

impl Default for Persona {
    fn default() -> Self {
        Persona::Sap
    }
}

/// AP state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SapState {
    /// Not operating
    Init = 0,
    /// BSS start in progress, including CAC wait
    Starting = 1,
    /// Beaconing
    Started = 2,
    /// Shutdown in progress
    Stopping = 3,
}

impl Default for SapState {
    fn default() -> Self {
        SapState::Init
    }
}

/// How the operating channel is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ChannelSelection {
    /// Operate on a fixed primary frequency
    Fixed { freq: u32 },
    /// Run automatic channel selection
    Auto,
}

impl Default for ChannelSelection {
    fn default() -> Self {
        ChannelSelection::Auto
    }
}

/// Band restriction applied by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BandRestriction {
    /// Any band
    All,
    /// 2.4 GHz only
    Only2G,
    /// 5 GHz only
    Only5G,
}

impl Default for BandRestriction {
    fn default() -> Self {
        BandRestriction::All
    }
}

/// Start configuration of an AP interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SapConfig {
    /// Network name, informational only
    pub ssid: String,
    /// Channel selection mode
    pub channel: ChannelSelection,
    /// Target width
    pub width: ChannelWidth,
    /// Second segment center for 80+80
    pub seg1_center: Option<u32>,
    /// ACS configuration
    pub acs: AcsConfig,
    /// Concurrency channel switch mode
    pub cc_switch_mode: CcSwitchMode,
    /// Channel explicitly forced by the user
    pub user_forced: bool,
    /// Skip CAC on this interface (test/bypass)
    pub ignore_cac: bool,
    /// Beacon interval in TU
    pub beacon_interval: u16,
}

impl Default for SapConfig {
    fn default() -> Self {
        Self {
            ssid: "sap".to_string(),
            channel: ChannelSelection::Auto,
            width: ChannelWidth::Bw80,
            seg1_center: None,
            acs: AcsConfig::default(),
            cc_switch_mode: CcSwitchMode::default(),
            user_forced: false,
            ignore_cac: false,
            beacon_interval: 100,
        }
    }
}

impl SapConfig {
    /// Configuration for a fixed channel
    pub fn fixed(freq: u32, width: ChannelWidth) -> Self {
        Self {
            channel: ChannelSelection::Fixed { freq },
            width,
            ..Self::default()
        }
    }

    /// Configuration for ACS over `[start_freq, end_freq]`
    pub fn auto(start_freq: u32, end_freq: u32, width: ChannelWidth) -> Self {
        Self {
            channel: ChannelSelection::Auto,
            width,
            acs: AcsConfig {
                start_freq,
                end_freq,
                ..AcsConfig::default()
            },
            ..Self::default()
        }
    }
}

/// Per-interface CAC flags
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacFlags {
    /// Waiting for CAC to finish before beaconing
    pub waiting: bool,
    /// `CacStarted` delivered for the current wait
    pub start_notified: bool,
    /// CAC end handled for the current wait
    pub end_notified: bool,
    /// When the wait began
    pub started_at: Option<DateTime<Utc>>,
    /// Expected wait duration
    pub duration: Option<Duration>,
    /// Shared CAC timer this interface waits on
    pub timer_id: Option<Uuid>,
    /// Wait entered after a channel switch rather than at bring-up
    pub after_switch: bool,
}

/// A channel change waiting for hardware mode or firmware confirmation
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChannelChange {
    /// Request id
    pub id: Uuid,
    /// Target descriptor, committed only on firmware confirmation
    pub target: ChannelDescriptor,
    /// Why the switch happens
    pub reason: CsaReason,
    /// Waiting for the concurrency manager to finish a hardware mode change
    pub hw_mode_pending: bool,
    /// CAC duration announced to the firmware
    pub cac_duration_ms: u32,
    /// When the request was accepted
    pub requested_at: DateTime<Utc>,
}

/// Persistent state of one AP interface
#[derive(Debug, Clone)]
pub struct RadioContext {
    /// Interface id
    pub id: InterfaceId,
    /// Interface MAC address
    pub mac: [u8; 6],
    /// Persona
    pub persona: Persona,
    /// Current FSM state
    pub state: SapState,
    /// Operating channel
    pub channel: Option<ChannelDescriptor>,
    /// Start configuration
    pub config: SapConfig,
    /// CAC flags
    pub cac: CacFlags,
    /// Radar was reported on the operating channel
    pub radar_found: bool,
    /// Outstanding ACS scan
    pub pending_scan: Option<ScanId>,
    /// Candidates of the outstanding ACS run
    pub acs_candidates: Vec<AcsCandidate>,
    /// Outstanding channel change
    pub pending_change: Option<PendingChannelChange>,
    /// Reason of the last channel switch
    pub csa_reason: CsaReason,
    /// Band restriction in force
    pub band_restriction: BandRestriction,
    /// Channel saved before a band restriction moved the interface
    pub saved_channel: Option<ChannelDescriptor>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last state transition time
    pub state_changed_at: DateTime<Utc>,
}

impl RadioContext {
    /// Create a context in `Init`
    pub fn new(id: InterfaceId, mac: [u8; 6], persona: Persona) -> Self {
        let now = Utc::now();
        Self {
            id,
            mac,
            persona,
            state: SapState::Init,
            channel: None,
            config: SapConfig::default(),
            cac: CacFlags::default(),
            radar_found: false,
            pending_scan: None,
            acs_candidates: Vec::new(),
            pending_change: None,
            csa_reason: CsaReason::Unknown,
            band_restriction: BandRestriction::All,
            saved_channel: None,
            created_at: now,
            state_changed_at: now,
        }
    }

    /// Set FSM state
    pub fn set_state(&mut self, state: SapState) {
        if self.state != state {
            log::info!("Interface {} state transition: {:?} -> {:?}", self.id, self.state, state);
            self.state = state;
            self.state_changed_at = Utc::now();
        }
    }

    /// Check if a channel switch is awaiting confirmation
    pub fn is_channel_change_in_progress(&self) -> bool {
        self.pending_change.is_some()
    }

    /// Check if the interface occupies a 5 GHz channel while active
    pub fn is_active_on_5ghz(&self) -> bool {
        self.state != SapState::Init && self.channel.map(|c| c.is_5ghz()).unwrap_or(false)
    }

    /// Clear every transient start/switch flag
    pub fn reset_transients(&mut self) {
        self.cac = CacFlags::default();
        self.radar_found = false;
        self.pending_scan = None;
        self.acs_candidates.clear();
        self.pending_change = None;
    }

    /// Snapshot visible to other interfaces
    pub fn summary(&self) -> InterfaceSummary {
        InterfaceSummary {
            id: self.id,
            mac: self.mac,
            persona: self.persona,
            state: self.state,
            channel: self.channel,
            cac_waiting: self.cac.waiting,
            channel_change_in_progress: self.is_channel_change_in_progress(),
        }
    }

    /// MAC address as a string
    pub fn mac_string(&self) -> String {
        format_mac(&self.mac)
    }
}

/// Format a MAC address
pub fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// Parse a MAC address in `aa:bb:cc:dd:ee:ff` form
pub fn parse_mac(text: &str) -> Result<[u8; 6]> {
    let parts: Vec<&str> = text.split(':').collect();
    if parts.len() != 6 {
        return Err(SapError::InvalidParameter(format!("Invalid MAC address: {}", text)));
    }
    let mut mac = [0u8; 6];
    for (byte, part) in mac.iter_mut().zip(parts) {
        *byte = u8::from_str_radix(part, 16)
            .map_err(|_| SapError::InvalidParameter(format!("Invalid MAC address: {}", text)))?;
    }
    Ok(mac)
}

/// Read-only view of an interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceSummary {
    pub id: InterfaceId,
    pub mac: [u8; 6],
    pub persona: Persona,
    pub state: SapState,
    pub channel: Option<ChannelDescriptor>,
    pub cac_waiting: bool,
    pub channel_change_in_progress: bool,
}

#[derive(Debug)]
struct RegistryEntry {
    context: Arc<Mutex<RadioContext>>,
    summary: InterfaceSummary,
}

/// Registry of AP interfaces on one radio
#[derive(Debug)]
pub struct InterfaceRegistry {
    entries: HashMap<InterfaceId, RegistryEntry>,
    five_ghz_users: HashSet<InterfaceId>,
    max_interfaces: usize,
}

impl InterfaceRegistry {
    /// Create new registry
    pub fn new(max_interfaces: usize) -> Self {
        Self {
            entries: HashMap::new(),
            five_ghz_users: HashSet::new(),
            max_interfaces,
        }
    }

    /// Register an interface
    pub fn open(
        &mut self,
        id: InterfaceId,
        mac: [u8; 6],
        persona: Persona,
    ) -> Result<Arc<Mutex<RadioContext>>> {
        if self.entries.contains_key(&id) {
            return Err(SapError::InvalidParameter(format!("Interface {} already open", id)));
        }
        if self.entries.len() >= self.max_interfaces {
            return Err(SapError::InvalidParameter(format!(
                "Interface limit {} reached",
                self.max_interfaces
            )));
        }
        let context = RadioContext::new(id, mac, persona);
        let summary = context.summary();
        let context = Arc::new(Mutex::new(context));
        self.entries.insert(
            id,
            RegistryEntry {
                context: Arc::clone(&context),
                summary,
            },
        );
        log::info!("Interface {} opened ({}, {:?})", id, format_mac(&mac), persona);
        Ok(context)
    }

    /// Unregister an interface, which must be in `Init`
    ///
    /// Returns true when this left no 5 GHz user behind.
    pub fn close(&mut self, id: InterfaceId) -> Result<bool> {
        let entry = self.entries.get(&id).ok_or(SapError::InterfaceNotFound(id))?;
        if entry.summary.state != SapState::Init {
            return Err(SapError::InvalidState(format!(
                "Interface {} cannot close in state {:?}",
                id, entry.summary.state
            )));
        }
        self.entries.remove(&id);
        let last_5g = self.release_5g(id);
        log::info!("Interface {} closed", id);
        Ok(last_5g)
    }

    /// Look up an interface context
    pub fn get(&self, id: InterfaceId) -> Result<Arc<Mutex<RadioContext>>> {
        self.entries
            .get(&id)
            .map(|e| Arc::clone(&e.context))
            .ok_or(SapError::InterfaceNotFound(id))
    }

    /// Publish the latest summary of an interface
    pub fn publish(&mut self, summary: InterfaceSummary) {
        if let Some(entry) = self.entries.get_mut(&summary.id) {
            entry.summary = summary;
        }
    }

    /// Get the published summary of an interface
    pub fn summary(&self, id: InterfaceId) -> Option<&InterfaceSummary> {
        self.entries.get(&id).map(|e| &e.summary)
    }

    /// Published summaries ordered by interface id
    pub fn summaries(&self) -> Vec<InterfaceSummary> {
        let mut all: Vec<InterfaceSummary> =
            self.entries.values().map(|e| e.summary.clone()).collect();
        all.sort_by_key(|s| s.id);
        all
    }

    /// Summaries of every interface except `id`
    pub fn peers_of(&self, id: InterfaceId) -> Vec<InterfaceSummary> {
        self.summaries().into_iter().filter(|s| s.id != id).collect()
    }

    /// Registered interface ids, ascending
    pub fn ids(&self) -> Vec<InterfaceId> {
        let mut ids: Vec<InterfaceId> = self.entries.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Number of registered interfaces
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no interface is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record that an interface operates on 5 GHz
    pub fn acquire_5g(&mut self, id: InterfaceId) -> usize {
        self.five_ghz_users.insert(id);
        self.five_ghz_users.len()
    }

    /// Drop an interface's 5 GHz reference
    ///
    /// Returns true when this was the last 5 GHz user.
    pub fn release_5g(&mut self, id: InterfaceId) -> bool {
        self.five_ghz_users.remove(&id) && self.five_ghz_users.is_empty()
    }

    /// Number of interfaces holding a 5 GHz reference
    pub fn five_ghz_user_count(&self) -> usize {
        self.five_ghz_users.len()
    }
}

impl Default for InterfaceRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_INTERFACES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_and_lookup() {
        let mut registry = InterfaceRegistry::default();
        let ctx = registry.open(InterfaceId(0), [0x02, 0, 0, 0, 0, 1], Persona::Sap).unwrap();
        assert_eq!(ctx.lock().await.state, SapState::Init);
        assert_eq!(registry.len(), 1);

        let again = registry.get(InterfaceId(0)).unwrap();
        assert!(Arc::ptr_eq(&ctx, &again));
        assert!(matches!(
            registry.get(InterfaceId(7)),
            Err(SapError::InterfaceNotFound(InterfaceId(7)))
        ));
        assert!(registry.open(InterfaceId(0), [0; 6], Persona::Sap).is_err());
    }

    #[test]
    fn test_interface_limit() {
        let mut registry = InterfaceRegistry::new(1);
        registry.open(InterfaceId(0), [0; 6], Persona::Sap).unwrap();
        assert!(registry.open(InterfaceId(1), [0; 6], Persona::P2pGo).is_err());
    }

    #[tokio::test]
    async fn test_close_requires_init() {
        let mut registry = InterfaceRegistry::default();
        let ctx = registry.open(InterfaceId(1), [0; 6], Persona::Sap).unwrap();
        {
            let mut guard = ctx.lock().await;
            guard.set_state(SapState::Started);
            registry.publish(guard.summary());
        }
        assert!(matches!(registry.close(InterfaceId(1)), Err(SapError::InvalidState(_))));

        {
            let mut guard = ctx.lock().await;
            guard.set_state(SapState::Init);
            registry.publish(guard.summary());
        }
        assert!(!registry.close(InterfaceId(1)).unwrap());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_five_ghz_refcount() {
        let mut registry = InterfaceRegistry::default();
        registry.open(InterfaceId(0), [0; 6], Persona::Sap).unwrap();
        registry.open(InterfaceId(1), [0; 6], Persona::Sap).unwrap();
        assert_eq!(registry.acquire_5g(InterfaceId(0)), 1);
        assert_eq!(registry.acquire_5g(InterfaceId(1)), 2);
        assert_eq!(registry.acquire_5g(InterfaceId(1)), 2);
        assert!(!registry.release_5g(InterfaceId(0)));
        assert!(!registry.release_5g(InterfaceId(0)));
        assert!(registry.release_5g(InterfaceId(1)));
        assert_eq!(registry.five_ghz_user_count(), 0);
    }

    #[test]
    fn test_summaries_sorted() {
        let mut registry = InterfaceRegistry::default();
        registry.open(InterfaceId(3), [0; 6], Persona::Sap).unwrap();
        registry.open(InterfaceId(1), [0; 6], Persona::P2pGo).unwrap();
        let ids: Vec<InterfaceId> = registry.summaries().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![InterfaceId(1), InterfaceId(3)]);
        assert_eq!(registry.peers_of(InterfaceId(1)).len(), 1);
    }

    #[test]
    fn test_mac_parse_format() {
        let mac = parse_mac("02:1a:2b:3c:4d:5e").unwrap();
        assert_eq!(mac, [0x02, 0x1a, 0x2b, 0x3c, 0x4d, 0x5e]);
        assert_eq!(format_mac(&mac), "02:1a:2b:3c:4d:5e");
        assert!(parse_mac("02:1a").is_err());
        assert!(parse_mac("zz:1a:2b:3c:4d:5e").is_err());
    }
}
