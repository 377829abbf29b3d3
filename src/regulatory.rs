//! Regulatory channel table
//!
//! The `RegulatoryTable` trait is the read-only channel-state lookup every
//! channel computation depends on. `StaticRegulatoryTable` is a table-driven
//! implementation with built-in FCC, ETSI and MKK profiles that can also be
//! loaded from configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::channel::{bonded_sub_channels, Band, ChannelWidth};

/// DSRC (vehicular) band, never used by an AP
pub const DSRC_BAND_START: u32 = 5850;
pub const DSRC_BAND_END: u32 = 5925;

/// Regulatory state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelState {
    /// Usable without restriction
    Enabled,
    /// Usable after radar detection obligations are met
    Dfs,
    /// Not allowed
    Disabled,
    /// Receive only, no initiated transmission
    Passive,
    /// Not a channel in this domain
    Invalid,
}

impl ChannelState {
    /// Check if an AP may operate on a channel in this state
    pub fn is_usable(&self) -> bool {
        matches!(self, ChannelState::Enabled | ChannelState::Dfs)
    }

    /// Severity used when combining sub-channel states, higher is worse
    fn severity(&self) -> u8 {
        match self {
            ChannelState::Enabled => 0,
            ChannelState::Dfs => 1,
            ChannelState::Passive => 2,
            ChannelState::Disabled => 3,
            ChannelState::Invalid => 4,
        }
    }
}

/// DFS regulatory region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DfsRegion {
    /// Region not set
    Unknown,
    /// FCC (US)
    Fcc,
    /// ETSI (EU)
    Etsi,
    /// MKK (Japan)
    Mkk,
}

impl Default for DfsRegion {
    fn default() -> Self {
        DfsRegion::Fcc
    }
}

/// Regulatory channel table lookups
pub trait RegulatoryTable: Send + Sync {
    /// State of a 20 MHz channel
    fn channel_state(&self, freq: u32) -> ChannelState;

    /// Combined state of the bonded group of `(freq, width)`
    fn bonded_channel_state(&self, freq: u32, width: ChannelWidth) -> ChannelState {
        match bonded_sub_channels(freq, width) {
            Some(subs) => combined_state(self, &subs),
            None => ChannelState::Invalid,
        }
    }

    /// DFS region of the current regulatory domain
    fn dfs_region(&self) -> DfsRegion;

    /// Every channel known to the domain, ascending by frequency
    fn channel_list(&self) -> Vec<u32>;

    /// Check if a channel is a short-range-device channel
    fn is_srd(&self, _freq: u32) -> bool {
        false
    }

    /// Check if a channel is in the DSRC band
    fn is_dsrc(&self, freq: u32) -> bool {
        (DSRC_BAND_START..=DSRC_BAND_END).contains(&freq)
    }
}

/// Worst state across a set of sub-channels
pub fn combined_state<R: RegulatoryTable + ?Sized>(reg: &R, freqs: &[u32]) -> ChannelState {
    freqs
        .iter()
        .map(|f| reg.channel_state(*f))
        .max_by_key(|s| s.severity())
        .unwrap_or(ChannelState::Invalid)
}

/// One channel entry of a static table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegChannel {
    /// Center frequency in MHz
    pub freq: u32,
    /// Channel state
    pub state: ChannelState,
    /// Short-range-device channel
    #[serde(default)]
    pub srd: bool,
}

impl RegChannel {
    /// Create a new channel entry
    pub fn new(freq: u32, state: ChannelState) -> Self {
        Self { freq, state, srd: false }
    }
}

/// Table-driven regulatory domain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticRegulatoryTable {
    region: DfsRegion,
    channels: BTreeMap<u32, RegChannel>,
}

impl StaticRegulatoryTable {
    /// Create a table from explicit entries
    pub fn new(region: DfsRegion, channels: Vec<RegChannel>) -> Self {
        Self {
            region,
            channels: channels.into_iter().map(|c| (c.freq, c)).collect(),
        }
    }

    /// US profile: channels 1-11, UNII-1 enabled, UNII-2/2e DFS, UNII-3 enabled
    pub fn fcc() -> Self {
        let mut table = Self::new(DfsRegion::Fcc, Vec::new());
        table.fill(2412, 2462, ChannelState::Enabled);
        table.fill(5180, 5240, ChannelState::Enabled);
        table.fill(5260, 5320, ChannelState::Dfs);
        table.fill(5500, 5720, ChannelState::Dfs);
        table.fill(5745, 5825, ChannelState::Enabled);
        table
    }

    /// EU profile: channels 1-13, UNII-2/2e DFS including weather channels,
    /// 5.8 GHz SRD channels
    pub fn etsi() -> Self {
        let mut table = Self::new(DfsRegion::Etsi, Vec::new());
        table.fill(2412, 2472, ChannelState::Enabled);
        table.fill(5180, 5240, ChannelState::Enabled);
        table.fill(5260, 5320, ChannelState::Dfs);
        table.fill(5500, 5700, ChannelState::Dfs);
        table.fill(5745, 5825, ChannelState::Enabled);
        for freq in (5745..=5825).step_by(20) {
            if let Some(channel) = table.channels.get_mut(&freq) {
                channel.srd = true;
            }
        }
        table
    }

    /// Japan profile: channels 1-13, W52 enabled, W53/W56 DFS
    pub fn mkk() -> Self {
        let mut table = Self::new(DfsRegion::Mkk, Vec::new());
        table.fill(2412, 2472, ChannelState::Enabled);
        table.fill(5180, 5240, ChannelState::Enabled);
        table.fill(5260, 5320, ChannelState::Dfs);
        table.fill(5500, 5720, ChannelState::Dfs);
        table
    }

    /// Add the 6 GHz channels as enabled
    pub fn with_6ghz(mut self) -> Self {
        self.fill(5955, 7115, ChannelState::Enabled);
        self
    }

    fn fill(&mut self, first: u32, last: u32, state: ChannelState) {
        let step = match Band::from_freq(first) {
            Some(Band::Band2G) => 5,
            _ => 20,
        };
        for freq in (first..=last).step_by(step) {
            self.channels.insert(freq, RegChannel::new(freq, state));
        }
    }

    /// Override the state of one channel, adding it if missing
    pub fn set_state(&mut self, freq: u32, state: ChannelState) {
        self.channels
            .entry(freq)
            .and_modify(|c| c.state = state)
            .or_insert_with(|| RegChannel::new(freq, state));
    }

    /// Mark every channel of `[first, last]` as `state`
    pub fn set_range_state(&mut self, first: u32, last: u32, state: ChannelState) {
        for channel in self.channels.range_mut(first..=last).map(|(_, c)| c) {
            channel.state = state;
        }
    }

    /// Get the table entries
    pub fn entries(&self) -> impl Iterator<Item = &RegChannel> {
        self.channels.values()
    }
}

impl RegulatoryTable for StaticRegulatoryTable {
    fn channel_state(&self, freq: u32) -> ChannelState {
        self.channels
            .get(&freq)
            .map(|c| c.state)
            .unwrap_or(ChannelState::Invalid)
    }

    fn dfs_region(&self) -> DfsRegion {
        self.region
    }

    fn channel_list(&self) -> Vec<u32> {
        self.channels.keys().copied().collect()
    }

    fn is_srd(&self, freq: u32) -> bool {
        self.channels.get(&freq).map(|c| c.srd).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fcc_profile() {
        let reg = StaticRegulatoryTable::fcc();
        assert_eq!(reg.dfs_region(), DfsRegion::Fcc);
        assert_eq!(reg.channel_state(2437), ChannelState::Enabled);
        assert_eq!(reg.channel_state(2472), ChannelState::Invalid);
        assert_eq!(reg.channel_state(5180), ChannelState::Enabled);
        assert_eq!(reg.channel_state(5500), ChannelState::Dfs);
        assert_eq!(reg.channel_state(5745), ChannelState::Enabled);
        assert!(!reg.is_srd(5745));
    }

    #[test]
    fn test_etsi_srd_and_weather() {
        let reg = StaticRegulatoryTable::etsi();
        assert!(reg.is_srd(5745));
        assert_eq!(reg.channel_state(5600), ChannelState::Dfs);
        assert_eq!(reg.channel_state(5720), ChannelState::Invalid);
        assert!(reg.is_dsrc(5860));
        assert!(!reg.is_dsrc(5825));
    }

    #[test]
    fn test_bonded_state_is_worst_member() {
        let mut reg = StaticRegulatoryTable::fcc();
        assert_eq!(reg.bonded_channel_state(5180, ChannelWidth::Bw80), ChannelState::Enabled);
        assert_eq!(reg.bonded_channel_state(5180, ChannelWidth::Bw160), ChannelState::Dfs);
        reg.set_state(5200, ChannelState::Passive);
        assert_eq!(reg.bonded_channel_state(5180, ChannelWidth::Bw80), ChannelState::Passive);
        assert_eq!(reg.bonded_channel_state(5180, ChannelWidth::Bw80P80), ChannelState::Invalid);
    }

    #[test]
    fn test_set_range_state() {
        let mut reg = StaticRegulatoryTable::fcc();
        reg.set_range_state(5260, 5320, ChannelState::Enabled);
        assert_eq!(reg.channel_state(5300), ChannelState::Enabled);
        assert_eq!(reg.channel_state(5500), ChannelState::Dfs);
    }

    #[test]
    fn test_table_serialization() {
        let reg = StaticRegulatoryTable::mkk();
        let json = serde_json::to_string(&reg).unwrap();
        let parsed: StaticRegulatoryTable = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.channel_list(), reg.channel_list());
        assert_eq!(parsed.dfs_region(), DfsRegion::Mkk);
    }
}
