//! DFS/CAC manager
//!
//! Owns the regulatory state shared by every interface of a radio: the
//! Non-Occupancy List, the single CAC timer, the CAC state and the radar
//! history. All mutation goes through one exclusive lock that is never held
//! across a collaborator call.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::channel::{
    is_weather_channel, leakage_adjusted_channels, Band, ChannelDescriptor, ChannelWidth,
};
use crate::event::{EventSender, SapEvent};
use crate::registry::InterfaceId;
use crate::regulatory::{ChannelState, DfsRegion, RegulatoryTable};
use crate::{Result, SapError, DEFAULT_CAC_TIMEOUT_MS, DEFAULT_NOL_TIMEOUT_SECS};

/// Japan W53 sub-band
const W53_START: u32 = 5260;
const W53_END: u32 = 5320;
/// Boundary between lower (UNII-1/2) and upper (UNII-2e/3) 5 GHz
const LOWER_5G_END: u32 = 5330;

/// CAC state of a regulatory domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacState {
    /// No CAC done yet, CAC must not be skipped
    NeverDone,
    /// CAC timer running
    InProgress,
    /// Last CAC completed without radar
    Done,
    /// CAC bypassed (test mode)
    Skip,
}

impl Default for CacState {
    fn default() -> Self {
        CacState::NeverDone
    }
}

/// Restriction of replacement channels to part of the 5 GHz band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreferredLocation {
    /// Whole band
    Any,
    /// Exclude upper 5 GHz
    NoUpper5G,
    /// Exclude lower 5 GHz
    NoLower5G,
}

impl Default for PreferredLocation {
    fn default() -> Self {
        PreferredLocation::Any
    }
}

/// DFS configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DfsConfig {
    /// Standard CAC duration (ms)
    pub cac_timeout_ms: u64,
    /// ETSI weather-channel CAC multiplier
    pub etsi_weather_multiplier: u32,
    /// Non-occupancy period after radar (seconds)
    pub nol_timeout_secs: i64,
    /// Radar history entries kept
    pub radar_history_size: usize,
    /// Pick non-DFS replacement channels when possible
    pub prefer_non_dfs: bool,
    /// Never move onto Japan W53 channels
    pub disable_japan_w53: bool,
    /// Sub-band restriction for replacement channels
    pub preferred_location: PreferredLocation,
    /// Replacement frequency tried before random selection
    pub preferred_target_freq: Option<u32>,
    /// Minimum spacing between a replacement channel and a NOL channel (MHz)
    pub leakage_guard_mhz: u32,
    /// Seed for replacement selection, random when unset
    pub rng_seed: Option<u64>,
    /// Start with CAC skipped
    pub skip_cac: bool,
    /// An interrupted CAC this close to its end still counts as done (ms)
    pub cac_credit_margin_ms: u64,
}

impl Default for DfsConfig {
    fn default() -> Self {
        Self {
            cac_timeout_ms: DEFAULT_CAC_TIMEOUT_MS,
            etsi_weather_multiplier: 10,
            nol_timeout_secs: DEFAULT_NOL_TIMEOUT_SECS,
            radar_history_size: 16,
            prefer_non_dfs: false,
            disable_japan_w53: false,
            preferred_location: PreferredLocation::Any,
            preferred_target_freq: None,
            leakage_guard_mhz: 0,
            rng_seed: None,
            skip_cac: false,
            cac_credit_margin_ms: 5_000,
        }
    }
}

/// The shared CAC timer
#[derive(Debug)]
pub struct CacTimer {
    /// Timer id carried by the expiry event
    pub id: Uuid,
    /// Interface the expiry is posted to
    owner: Arc<Mutex<InterfaceId>>,
    /// Channel under test
    pub channel: ChannelDescriptor,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// Dwell duration
    pub duration: Duration,
    handle: Option<JoinHandle<()>>,
}

impl CacTimer {
    /// Interface the expiry will be posted to
    pub async fn owner(&self) -> InterfaceId {
        *self.owner.lock().await
    }

    fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Outcome of a CAC start request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacStart {
    /// A new timer was armed
    Started(Uuid),
    /// The running timer already covers this channel
    Joined(Uuid),
    /// Zero duration, nothing to wait for
    NotNeeded,
}

impl CacStart {
    /// Id of the timer the caller waits on
    pub fn timer_id(&self) -> Option<Uuid> {
        match self {
            CacStart::Started(id) | CacStart::Joined(id) => Some(*id),
            CacStart::NotNeeded => None,
        }
    }
}

/// One radar history record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadarHistoryEntry {
    /// Sub-channel frequency
    pub freq: u32,
    /// When radar was seen, or CAC finished for clean entries
    pub timestamp: DateTime<Utc>,
    /// Radar seen on the channel
    pub radar_found: bool,
}

/// Result of a radar indication
#[derive(Debug, Default)]
pub struct RadarOutcome {
    /// Frequencies newly placed in the NOL
    pub nol_added: Vec<u32>,
    /// CAC timer cancelled because it tested an affected channel
    pub cac_cancelled: Option<CacTimer>,
}

/// Parameters of a replacement channel search
#[derive(Debug, Clone, Default)]
pub struct RandomChannelParams {
    /// Width of the channel being replaced
    pub width: ChannelWidth,
    /// Channel being replaced, never returned
    pub current: Option<ChannelDescriptor>,
    /// Extra frequencies to stay off, e.g. the coexistence avoid list
    pub avoid: Vec<u32>,
}

impl RandomChannelParams {
    /// Replace `current` at its own width
    pub fn replacing(current: ChannelDescriptor) -> Self {
        Self {
            width: current.width,
            current: Some(current),
            avoid: Vec::new(),
        }
    }

    /// Search at `width` with no channel to replace
    pub fn at_width(width: ChannelWidth) -> Self {
        Self {
            width,
            ..Self::default()
        }
    }

    /// Also stay off `freqs`
    pub fn with_avoid(mut self, freqs: Vec<u32>) -> Self {
        self.avoid = freqs;
        self
    }
}

/// Regulatory state shared by all interfaces of a radio
#[derive(Debug)]
pub struct RegulatoryState {
    /// Channel -> unusable-until
    pub nol: BTreeMap<u32, DateTime<Utc>>,
    /// The running CAC timer
    pub cac_timer: Option<CacTimer>,
    /// Domain CAC state
    pub cac_state: CacState,
    /// Bounded radar history
    pub radar_history: VecDeque<RadarHistoryEntry>,
    /// Channels proven radar-free by CAC or pre-CAC
    pub proven_safe: BTreeMap<u32, DateTime<Utc>>,
    rng: StdRng,
}

impl RegulatoryState {
    fn new(config: &DfsConfig) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            nol: BTreeMap::new(),
            cac_timer: None,
            cac_state: if config.skip_cac { CacState::Skip } else { CacState::NeverDone },
            radar_history: VecDeque::with_capacity(config.radar_history_size),
            proven_safe: BTreeMap::new(),
            rng,
        }
    }

    fn purge_expired(&mut self, now: DateTime<Utc>) -> Vec<u32> {
        let expired: Vec<u32> = self
            .nol
            .iter()
            .filter(|(_, until)| **until <= now)
            .map(|(freq, _)| *freq)
            .collect();
        for freq in &expired {
            self.nol.remove(freq);
            log::info!("Channel {} MHz left the NOL", freq);
        }
        expired
    }

    fn nol_freqs(&self) -> Vec<u32> {
        self.nol.keys().copied().collect()
    }
}

/// DFS/CAC manager
pub struct DfsManager {
    config: DfsConfig,
    regulatory: Arc<dyn RegulatoryTable>,
    state: Mutex<RegulatoryState>,
    events: EventSender,
}

impl std::fmt::Debug for DfsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DfsManager")
            .field("config", &self.config)
            .field("region", &self.regulatory.dfs_region())
            .field("state", &format!("[state]"))
            .finish()
    }
}

impl DfsManager {
    /// Create new DFS manager
    pub fn new(
        config: DfsConfig,
        regulatory: Arc<dyn RegulatoryTable>,
        events: EventSender,
    ) -> Self {
        let state = RegulatoryState::new(&config);
        Self {
            config,
            regulatory,
            state: Mutex::new(state),
            events,
        }
    }

    /// Get DFS configuration
    pub fn config(&self) -> &DfsConfig {
        &self.config
    }

    /// Current CAC state
    pub async fn cac_state(&self) -> CacState {
        self.state.lock().await.cac_state
    }

    /// Enable or disable CAC bypass
    pub async fn set_skip_cac(&self, skip: bool) {
        let mut state = self.state.lock().await;
        state.cac_state = if skip { CacState::Skip } else { CacState::NeverDone };
        log::info!("CAC state set to {:?}", state.cac_state);
    }

    /// Check if a frequency is currently in the NOL
    pub async fn is_in_nol(&self, freq: u32) -> bool {
        self.is_in_nol_at(freq, Utc::now()).await
    }

    /// Check if a frequency is in the NOL at `now`
    pub async fn is_in_nol_at(&self, freq: u32, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock().await;
        state.purge_expired(now);
        state.nol.contains_key(&freq)
    }

    /// Check if any sub-channel of a descriptor is in the NOL
    pub async fn descriptor_in_nol(&self, channel: &ChannelDescriptor) -> bool {
        let mut state = self.state.lock().await;
        state.purge_expired(Utc::now());
        channel.sub_channels().iter().any(|f| state.nol.contains_key(f))
    }

    /// Active NOL frequencies
    pub async fn nol_freqs(&self) -> Vec<u32> {
        let mut state = self.state.lock().await;
        state.purge_expired(Utc::now());
        state.nol_freqs()
    }

    /// Active NOL entries with their unusable-until time
    pub async fn nol_list(&self) -> Vec<(u32, DateTime<Utc>)> {
        let mut state = self.state.lock().await;
        state.purge_expired(Utc::now());
        state.nol.iter().map(|(f, t)| (*f, *t)).collect()
    }

    /// Place frequencies in the NOL as if radar was seen at `detected_at`
    pub async fn add_to_nol_at(&self, freqs: &[u32], detected_at: DateTime<Utc>) -> Vec<u32> {
        let until = detected_at + chrono::Duration::seconds(self.config.nol_timeout_secs);
        let mut state = self.state.lock().await;
        let mut added = Vec::new();
        for freq in freqs {
            if state.nol.insert(*freq, until).is_none() {
                added.push(*freq);
            }
        }
        added
    }

    /// Empty the NOL
    pub async fn clear_nol(&self) {
        let mut state = self.state.lock().await;
        log::info!("Clearing NOL ({} entries)", state.nol.len());
        state.nol.clear();
    }

    /// Drop NOL entries whose non-occupancy period ended at `now`
    pub async fn purge_expired_nol(&self, now: DateTime<Utc>) -> Vec<u32> {
        self.state.lock().await.purge_expired(now)
    }

    /// Check whether beaconing on `channel` must wait for CAC
    pub async fn is_cac_required(
        &self,
        channel: &ChannelDescriptor,
        ignore_cac: bool,
        sta_on_same_freq: bool,
    ) -> bool {
        if !channel.is_dfs(self.regulatory.as_ref()) || channel.band() == Some(Band::Band6G) {
            return false;
        }
        if ignore_cac || sta_on_same_freq {
            return false;
        }
        let state = self.state.lock().await;
        if state.cac_state == CacState::Skip {
            return false;
        }
        !self.dfs_sub_channels(channel).iter().all(|f| state.proven_safe.contains_key(f))
    }

    /// Check whether beacons may be transmitted on `channel`
    pub async fn beacon_permitted(&self, channel: &ChannelDescriptor, ignore_cac: bool) -> bool {
        !self.is_cac_required(channel, ignore_cac, false).await
    }

    /// CAC duration for a channel in the current region
    pub fn cac_duration(&self, channel: &ChannelDescriptor) -> Duration {
        let base = Duration::from_millis(self.config.cac_timeout_ms);
        let weather = channel.sub_channels().iter().any(|f| is_weather_channel(*f));
        if self.regulatory.dfs_region() == DfsRegion::Etsi && weather {
            base * self.config.etsi_weather_multiplier
        } else {
            base
        }
    }

    fn dfs_sub_channels(&self, channel: &ChannelDescriptor) -> Vec<u32> {
        channel
            .sub_channels()
            .into_iter()
            .filter(|f| self.regulatory.channel_state(*f) == ChannelState::Dfs)
            .collect()
    }

    /// Arm the shared CAC timer, or join the running one for the same channel
    pub async fn start_cac(
        &self,
        owner: InterfaceId,
        channel: ChannelDescriptor,
        duration: Duration,
    ) -> Result<CacStart> {
        if duration.is_zero() {
            return Ok(CacStart::NotNeeded);
        }

        let mut state = self.state.lock().await;
        if let Some(timer) = &state.cac_timer {
            if timer.channel.sub_channels() == channel.sub_channels() {
                log::debug!("Interface {} joins running CAC on {}", owner, channel);
                return Ok(CacStart::Joined(timer.id));
            }
            return Err(SapError::ConcurrencyRejected(format!(
                "CAC already running on {} for {}",
                timer.channel,
                timer.owner().await
            )));
        }

        let id = Uuid::new_v4();
        let events = self.events.clone();
        let owner_cell = Arc::new(Mutex::new(owner));
        let expiry_owner = owner_cell.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let target = *expiry_owner.lock().await;
            if let Err(e) = events.post(target, SapEvent::CacTimerExpired { timer_id: id }) {
                log::error!("Failed to post CAC expiry: {}", e);
            }
        });
        state.cac_timer = Some(CacTimer {
            id,
            owner: owner_cell,
            channel,
            started_at: Utc::now(),
            duration,
            handle: Some(handle),
        });
        state.cac_state = CacState::InProgress;
        log::info!("CAC started on {} for {:?} (owner {})", channel, duration, owner);
        Ok(CacStart::Started(id))
    }

    /// Check if the CAC timer is running
    pub async fn cac_timer_running(&self) -> bool {
        self.state.lock().await.cac_timer.is_some()
    }

    /// Id and channel of the running CAC timer
    pub async fn running_cac(&self) -> Option<(Uuid, ChannelDescriptor)> {
        self.state
            .lock()
            .await
            .cac_timer
            .as_ref()
            .map(|t| (t.id, t.channel))
    }

    /// Interface the running CAC expiry will be posted to
    pub async fn cac_owner(&self) -> Option<InterfaceId> {
        let state = self.state.lock().await;
        match &state.cac_timer {
            Some(timer) => Some(timer.owner().await),
            None => None,
        }
    }

    /// Move the running timer from `from` to another waiter
    ///
    /// Returns false when `timer_id` is not running or `from` does not own it.
    pub async fn hand_over_cac(&self, timer_id: Uuid, from: InterfaceId, to: InterfaceId) -> bool {
        let state = self.state.lock().await;
        let timer = match &state.cac_timer {
            Some(timer) if timer.id == timer_id => timer,
            _ => return false,
        };
        let mut owner = timer.owner.lock().await;
        if *owner != from {
            return false;
        }
        *owner = to;
        log::info!("CAC timer on {} handed from {} to {}", timer.channel, from, to);
        true
    }

    /// Stop the CAC timer
    pub async fn stop_cac_timer(&self) -> Option<Uuid> {
        let mut state = self.state.lock().await;
        let mut timer = state.cac_timer.take()?;
        timer.cancel();
        if state.cac_state == CacState::InProgress {
            state.cac_state = CacState::NeverDone;
        }
        log::info!("CAC timer on {} stopped", timer.channel);
        Some(timer.id)
    }

    /// Handle CAC timer expiry
    ///
    /// Returns the channel that passed CAC, or `None` for a stale timer.
    pub async fn on_cac_timer_expiry(&self, timer_id: Uuid) -> Option<ChannelDescriptor> {
        let dfs_subs;
        let channel;
        {
            let mut state = self.state.lock().await;
            match &state.cac_timer {
                Some(timer) if timer.id == timer_id => {}
                _ => {
                    log::debug!("Ignoring stale CAC expiry {}", timer_id);
                    return None;
                }
            }
            let timer = state.cac_timer.take()?;
            channel = timer.channel;
            dfs_subs = self.dfs_sub_channels(&channel);
            let now = Utc::now();
            for freq in &dfs_subs {
                state.proven_safe.insert(*freq, now);
            }
            if state.cac_state != CacState::Skip {
                state.cac_state = CacState::Done;
            }
        }
        log::info!("CAC completed on {} ({} DFS sub-channels)", channel, dfs_subs.len());
        Some(channel)
    }

    /// Credit an interrupted CAC that ran close enough to its full duration
    pub async fn credit_interrupted_cac(
        &self,
        channel: &ChannelDescriptor,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> bool {
        let elapsed = (Utc::now() - started_at).to_std().unwrap_or_default();
        let margin = Duration::from_millis(self.config.cac_credit_margin_ms);
        if elapsed + margin < duration {
            return false;
        }
        self.mark_pre_cac_complete(channel).await;
        true
    }

    /// Record a channel as proven radar-free by an out-of-band CAC
    pub async fn mark_pre_cac_complete(&self, channel: &ChannelDescriptor) {
        let subs = self.dfs_sub_channels(channel);
        let now = Utc::now();
        let mut state = self.state.lock().await;
        for freq in subs {
            state.proven_safe.insert(freq, now);
        }
        log::info!("Channel {} marked CAC complete", channel);
    }

    /// Handle radar seen on `freqs`
    pub async fn handle_radar(&self, freqs: &[u32]) -> RadarOutcome {
        let now = Utc::now();
        let until = now + chrono::Duration::seconds(self.config.nol_timeout_secs);
        let mut outcome = RadarOutcome::default();

        let mut state = self.state.lock().await;
        state.purge_expired(now);
        for freq in freqs {
            if state.nol.insert(*freq, until).is_none() {
                outcome.nol_added.push(*freq);
            }
            state.proven_safe.remove(freq);
            if state.radar_history.len() >= self.config.radar_history_size.max(1) {
                state.radar_history.pop_front();
            }
            state.radar_history.push_back(RadarHistoryEntry {
                freq: *freq,
                timestamp: now,
                radar_found: true,
            });
        }

        let hit = state
            .cac_timer
            .as_ref()
            .map(|t| t.channel.sub_channels().iter().any(|f| freqs.contains(f)))
            .unwrap_or(false);
        if hit {
            if let Some(mut timer) = state.cac_timer.take() {
                timer.cancel();
                log::warn!("Radar during CAC on {}", timer.channel);
                outcome.cac_cancelled = Some(timer);
            }
        }
        if state.cac_state != CacState::Skip {
            state.cac_state = CacState::NeverDone;
        }
        log::warn!("Radar on {:?}, NOL now {:?}", freqs, state.nol_freqs());
        outcome
    }

    /// Radar history followed by channels that passed CAC
    pub async fn radar_history(&self) -> Vec<RadarHistoryEntry> {
        let state = self.state.lock().await;
        let mut history: Vec<RadarHistoryEntry> = state.radar_history.iter().cloned().collect();
        history.extend(state.proven_safe.iter().map(|(freq, at)| RadarHistoryEntry {
            freq: *freq,
            timestamp: *at,
            radar_found: false,
        }));
        history
    }

    /// Pick a replacement channel after radar
    ///
    /// Candidates are 5 GHz channels that are enabled or DFS, outside the NOL
    /// and the current channel, at the current width or the widest narrower
    /// width that has any candidate.
    pub async fn select_random_channel(
        &self,
        params: RandomChannelParams,
    ) -> Option<ChannelDescriptor> {
        let reg = self.regulatory.as_ref();
        let current_subs = params.current.map(|c| c.sub_channels()).unwrap_or_default();
        let mut state = self.state.lock().await;
        state.purge_expired(Utc::now());
        let mut blocked = state.nol_freqs();
        blocked.extend(current_subs.iter().copied());
        blocked.extend(params.avoid.iter().copied());

        if let Some(preferred) = self.config.preferred_target_freq {
            let is_current = params.current.map(|c| c.primary_freq == preferred).unwrap_or(false);
            if !is_current {
                if let Ok(desc) = ChannelDescriptor::compute(reg, preferred, params.width) {
                    if desc.sub_channels().iter().all(|f| !blocked.contains(f)) {
                        log::info!("Replacement channel {} from preferred target", desc);
                        return Some(desc);
                    }
                }
            }
        }

        let region = reg.dfs_region();
        let candidates: Vec<u32> = reg
            .channel_list()
            .into_iter()
            .filter(|f| Band::from_freq(*f) == Some(Band::Band5G))
            .filter(|f| reg.channel_state(*f).is_usable())
            .filter(|f| !reg.is_dsrc(*f))
            .filter(|f| {
                !(self.config.disable_japan_w53
                    && region == DfsRegion::Mkk
                    && (W53_START..=W53_END).contains(f))
            })
            .filter(|f| match self.config.preferred_location {
                PreferredLocation::Any => true,
                PreferredLocation::NoUpper5G => *f <= LOWER_5G_END,
                PreferredLocation::NoLower5G => *f > LOWER_5G_END,
            })
            .collect();

        let mut width = params.width;
        loop {
            let clear = leakage_adjusted_channels(
                &candidates,
                width,
                &blocked,
                self.config.leakage_guard_mhz,
            );
            let mut descriptors: Vec<ChannelDescriptor> = clear
                .into_iter()
                .filter_map(|f| ChannelDescriptor::compute(reg, f, width).ok())
                .filter(|d| d.width == width || width == ChannelWidth::Bw20)
                .filter(|d| d.sub_channels().iter().all(|f| !blocked.contains(f)))
                .collect();
            if self.config.prefer_non_dfs && descriptors.iter().any(|d| !d.is_dfs(reg)) {
                descriptors.retain(|d| !d.is_dfs(reg));
            }
            if !descriptors.is_empty() {
                let pick = state.rng.gen_range(0..descriptors.len());
                let desc = descriptors[pick];
                log::info!(
                    "Replacement channel {} picked from {} candidates",
                    desc,
                    descriptors.len()
                );
                return Some(desc);
            }
            width = width.narrower()?;
        }
    }

    /// Reset the domain after the last 5 GHz interface went down
    ///
    /// The NOL and radar history survive, they bind regardless of activity.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        if let Some(mut timer) = state.cac_timer.take() {
            timer.cancel();
        }
        state.proven_safe.clear();
        state.cac_state = CacState::NeverDone;
        log::info!("Regulatory state reset, NOL keeps {} entries", state.nol.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventQueue;
    use crate::regulatory::StaticRegulatoryTable;

    fn manager(reg: StaticRegulatoryTable, config: DfsConfig) -> (DfsManager, EventQueue) {
        let queue = EventQueue::new();
        let dfs = DfsManager::new(config, Arc::new(reg), queue.sender());
        (dfs, queue)
    }

    fn seeded() -> DfsConfig {
        DfsConfig {
            rng_seed: Some(7),
            ..DfsConfig::default()
        }
    }

    #[tokio::test]
    async fn test_nol_add_and_expiry() {
        let (dfs, _queue) = manager(StaticRegulatoryTable::fcc(), seeded());
        let now = Utc::now();
        dfs.add_to_nol_at(&[5500], now).await;
        assert!(dfs.is_in_nol(5500).await);
        assert!(!dfs.is_in_nol(5520).await);

        let after = now + chrono::Duration::seconds(DEFAULT_NOL_TIMEOUT_SECS + 1);
        assert!(!dfs.is_in_nol_at(5500, after).await);
        assert!(dfs.nol_freqs().await.is_empty());
    }

    #[tokio::test]
    async fn test_cac_duration_weather() {
        let (etsi, _q1) = manager(StaticRegulatoryTable::etsi(), seeded());
        let reg = StaticRegulatoryTable::etsi();
        let weather = ChannelDescriptor::compute(&reg, 5600, ChannelWidth::Bw20).unwrap();
        let wide = ChannelDescriptor::compute(&reg, 5580, ChannelWidth::Bw80).unwrap();
        let plain = ChannelDescriptor::compute(&reg, 5500, ChannelWidth::Bw20).unwrap();
        assert_eq!(etsi.cac_duration(&weather), Duration::from_secs(600));
        assert_eq!(etsi.cac_duration(&wide), Duration::from_secs(600));
        assert_eq!(etsi.cac_duration(&plain), Duration::from_secs(60));

        let (fcc, _q2) = manager(StaticRegulatoryTable::fcc(), seeded());
        assert_eq!(fcc.cac_duration(&weather), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_cac_required_rules() {
        let reg = StaticRegulatoryTable::fcc();
        let (dfs, _queue) = manager(reg.clone(), seeded());
        let dfs_chan = ChannelDescriptor::compute(&reg, 5500, ChannelWidth::Bw80).unwrap();
        let plain = ChannelDescriptor::compute(&reg, 5180, ChannelWidth::Bw80).unwrap();

        assert!(!dfs.is_cac_required(&plain, false, false).await);
        assert!(dfs.is_cac_required(&dfs_chan, false, false).await);
        assert!(!dfs.is_cac_required(&dfs_chan, true, false).await);
        assert!(!dfs.is_cac_required(&dfs_chan, false, true).await);

        dfs.set_skip_cac(true).await;
        assert!(!dfs.is_cac_required(&dfs_chan, false, false).await);
        dfs.set_skip_cac(false).await;

        dfs.mark_pre_cac_complete(&dfs_chan).await;
        assert!(!dfs.is_cac_required(&dfs_chan, false, false).await);
        assert!(dfs.beacon_permitted(&dfs_chan, false).await);
    }

    #[tokio::test]
    async fn test_single_cac_timer() {
        let reg = StaticRegulatoryTable::fcc();
        let (dfs, _queue) = manager(reg.clone(), seeded());
        let chan = ChannelDescriptor::compute(&reg, 5500, ChannelWidth::Bw80).unwrap();
        let other = ChannelDescriptor::compute(&reg, 5260, ChannelWidth::Bw80).unwrap();

        let first = dfs.start_cac(InterfaceId(0), chan, Duration::from_secs(60)).await.unwrap();
        assert!(matches!(first, CacStart::Started(_)));
        assert_eq!(dfs.cac_state().await, CacState::InProgress);

        let joined = dfs.start_cac(InterfaceId(1), chan, Duration::from_secs(60)).await.unwrap();
        assert_eq!(joined, CacStart::Joined(first.timer_id().unwrap()));

        assert!(matches!(
            dfs.start_cac(InterfaceId(2), other, Duration::from_secs(60)).await,
            Err(SapError::ConcurrencyRejected(_))
        ));

        assert_eq!(dfs.stop_cac_timer().await, first.timer_id());
        assert!(!dfs.cac_timer_running().await);
        assert_eq!(dfs.cac_state().await, CacState::NeverDone);
        assert_eq!(
            dfs.start_cac(InterfaceId(0), chan, Duration::ZERO).await.unwrap(),
            CacStart::NotNeeded
        );
    }

    #[tokio::test]
    async fn test_cac_timer_expiry_posts_event() {
        let reg = StaticRegulatoryTable::fcc();
        let (dfs, queue) = manager(reg.clone(), seeded());
        let chan = ChannelDescriptor::compute(&reg, 5500, ChannelWidth::Bw20).unwrap();
        let start = dfs.start_cac(InterfaceId(3), chan, Duration::from_millis(10)).await.unwrap();

        let queued = tokio::time::timeout(Duration::from_secs(2), queue.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queued.interface, InterfaceId(3));
        let timer_id = match queued.event {
            SapEvent::CacTimerExpired { timer_id } => timer_id,
            other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(Some(timer_id), start.timer_id());

        assert_eq!(dfs.on_cac_timer_expiry(timer_id).await, Some(chan));
        assert_eq!(dfs.on_cac_timer_expiry(timer_id).await, None);
        assert_eq!(dfs.cac_state().await, CacState::Done);
        assert!(!dfs.is_cac_required(&chan, false, false).await);
    }

    #[tokio::test]
    async fn test_cac_hand_over_redirects_expiry() {
        let reg = StaticRegulatoryTable::fcc();
        let (dfs, queue) = manager(reg.clone(), seeded());
        let chan = ChannelDescriptor::compute(&reg, 5260, ChannelWidth::Bw20).unwrap();
        let start = dfs.start_cac(InterfaceId(0), chan, Duration::from_millis(50)).await.unwrap();
        let timer_id = start.timer_id().unwrap();
        assert_eq!(dfs.cac_owner().await, Some(InterfaceId(0)));

        assert!(!dfs.hand_over_cac(timer_id, InterfaceId(2), InterfaceId(1)).await);
        assert!(!dfs.hand_over_cac(Uuid::new_v4(), InterfaceId(0), InterfaceId(1)).await);
        assert!(dfs.hand_over_cac(timer_id, InterfaceId(0), InterfaceId(1)).await);
        assert_eq!(dfs.cac_owner().await, Some(InterfaceId(1)));

        let queued = tokio::time::timeout(Duration::from_secs(2), queue.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queued.interface, InterfaceId(1));
        assert!(matches!(
            queued.event,
            SapEvent::CacTimerExpired { timer_id: id } if id == timer_id
        ));
    }

    #[tokio::test]
    async fn test_radar_cancels_cac_and_fills_nol() {
        let reg = StaticRegulatoryTable::fcc();
        let (dfs, _queue) = manager(reg.clone(), seeded());
        let chan = ChannelDescriptor::compute(&reg, 5500, ChannelWidth::Bw80).unwrap();
        dfs.start_cac(InterfaceId(0), chan, Duration::from_secs(60)).await.unwrap();

        let outcome = dfs.handle_radar(&[5520]).await;
        assert_eq!(outcome.nol_added, vec![5520]);
        assert!(outcome.cac_cancelled.is_some());
        assert!(!dfs.cac_timer_running().await);
        assert!(dfs.descriptor_in_nol(&chan).await);

        let history = dfs.radar_history().await;
        assert_eq!(history.len(), 1);
        assert!(history[0].radar_found);
    }

    #[tokio::test]
    async fn test_radar_history_bounded() {
        let config = DfsConfig {
            radar_history_size: 2,
            ..seeded()
        };
        let (dfs, _queue) = manager(StaticRegulatoryTable::fcc(), config);
        dfs.handle_radar(&[5500]).await;
        dfs.handle_radar(&[5520]).await;
        dfs.handle_radar(&[5540]).await;
        let freqs: Vec<u32> = dfs.radar_history().await.iter().map(|e| e.freq).collect();
        assert_eq!(freqs, vec![5520, 5540]);
    }

    #[tokio::test]
    async fn test_random_selection_avoids_nol() {
        let reg = StaticRegulatoryTable::fcc();
        let current = ChannelDescriptor::compute(&reg, 5500, ChannelWidth::Bw80).unwrap();
        for seed in 0..32 {
            let config = DfsConfig {
                rng_seed: Some(seed),
                ..DfsConfig::default()
            };
            let (dfs, _queue) = manager(reg.clone(), config);
            dfs.handle_radar(&current.sub_channels()).await;
            let pick = dfs
                .select_random_channel(RandomChannelParams::replacing(current))
                .await
                .unwrap();
            assert_eq!(pick.width, ChannelWidth::Bw80);
            assert!(!pick.overlaps(&current));
            for freq in pick.sub_channels() {
                assert!(!dfs.is_in_nol(freq).await);
            }
        }
    }

    #[tokio::test]
    async fn test_random_selection_preferences() {
        let reg = StaticRegulatoryTable::fcc();
        let current = ChannelDescriptor::compute(&reg, 5500, ChannelWidth::Bw20).unwrap();
        let config = DfsConfig {
            prefer_non_dfs: true,
            ..seeded()
        };
        let (dfs, _queue) = manager(reg.clone(), config);
        let pick = dfs
            .select_random_channel(RandomChannelParams::replacing(current))
            .await
            .unwrap();
        assert!(!pick.is_dfs(&reg));

        let config = DfsConfig {
            preferred_target_freq: Some(5745),
            ..seeded()
        };
        let (dfs, _queue) = manager(reg.clone(), config);
        let pick = dfs
            .select_random_channel(RandomChannelParams::replacing(current))
            .await
            .unwrap();
        assert_eq!(pick.primary_freq, 5745);
    }

    #[tokio::test]
    async fn test_random_selection_w53_and_location() {
        let reg = StaticRegulatoryTable::mkk();
        let current = ChannelDescriptor::compute(&reg, 5500, ChannelWidth::Bw20).unwrap();
        for seed in 0..16 {
            let config = DfsConfig {
                disable_japan_w53: true,
                preferred_location: PreferredLocation::NoUpper5G,
                rng_seed: Some(seed),
                ..DfsConfig::default()
            };
            let (dfs, _queue) = manager(reg.clone(), config);
            let pick = dfs
                .select_random_channel(RandomChannelParams::replacing(current))
                .await
                .unwrap();
            assert!((5180..=5240).contains(&pick.primary_freq));
        }
    }

    #[tokio::test]
    async fn test_random_selection_exhausted() {
        let mut reg = StaticRegulatoryTable::fcc();
        reg.set_range_state(5180, 5825, ChannelState::Disabled);
        reg.set_state(5500, ChannelState::Dfs);
        let current = ChannelDescriptor::compute(&reg, 5500, ChannelWidth::Bw20).unwrap();
        let (dfs, _queue) = manager(reg, seeded());
        dfs.handle_radar(&[5500]).await;
        let pick = dfs
            .select_random_channel(RandomChannelParams {
                width: ChannelWidth::Bw80,
                current: Some(current),
                avoid: Vec::new(),
            })
            .await;
        assert!(pick.is_none());
    }

    #[tokio::test]
    async fn test_reset_keeps_nol() {
        let reg = StaticRegulatoryTable::fcc();
        let (dfs, _queue) = manager(reg.clone(), seeded());
        let chan = ChannelDescriptor::compute(&reg, 5260, ChannelWidth::Bw20).unwrap();
        dfs.mark_pre_cac_complete(&chan).await;
        dfs.handle_radar(&[5500]).await;
        dfs.start_cac(InterfaceId(0), chan, Duration::from_secs(60)).await.unwrap();

        dfs.reset().await;
        assert!(!dfs.cac_timer_running().await);
        assert!(dfs.is_cac_required(&chan, false, false).await);
        assert!(dfs.is_in_nol(5500).await);
        assert_eq!(dfs.cac_state().await, CacState::NeverDone);
    }

    #[tokio::test]
    async fn test_interrupted_cac_credit() {
        let reg = StaticRegulatoryTable::fcc();
        let (dfs, _queue) = manager(reg.clone(), seeded());
        let chan = ChannelDescriptor::compute(&reg, 5260, ChannelWidth::Bw20).unwrap();
        let long_ago = Utc::now() - chrono::Duration::seconds(58);
        assert!(dfs.credit_interrupted_cac(&chan, long_ago, Duration::from_secs(60)).await);
        assert!(!dfs.is_cac_required(&chan, false, false).await);

        let other = ChannelDescriptor::compute(&reg, 5280, ChannelWidth::Bw20).unwrap();
        assert!(!dfs.credit_interrupted_cac(&other, Utc::now(), Duration::from_secs(60)).await);
    }
}
