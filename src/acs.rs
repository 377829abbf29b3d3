//! Automatic channel selection
//!
//! Builds a weighted candidate list from the configured range, scans it and
//! picks the best channel. Scan results are cached so a restart within the
//! age-out window can skip the scan entirely.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::backend::ScanResult;
use crate::channel::{bonded_sub_channels, Band, ChannelDescriptor, ChannelWidth};
use crate::regulatory::{ChannelState, RegulatoryTable};
use crate::{Result, SapError, DEFAULT_ACS_WEIGHT};

/// Upper edge of 2.4 GHz when LTE coexistence is active
const LTE_COEX_2G_MAX: u32 = 2452;

/// Band the hardware mode allows ACS to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcsHwMode {
    /// Any band
    Any,
    /// 2.4 GHz only
    Band2G,
    /// 5 GHz only
    Band5G,
}

impl Default for AcsHwMode {
    fn default() -> Self {
        AcsHwMode::Any
    }
}

/// Weight override for a frequency range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightRange {
    /// First frequency (MHz)
    pub start_freq: u32,
    /// Last frequency (MHz)
    pub end_freq: u32,
    /// Weight, 0 excludes
    pub weight: u32,
}

/// Weight override for one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelWeight {
    /// Frequency (MHz)
    pub freq: u32,
    /// Weight, 0 excludes
    pub weight: u32,
}

/// ACS configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcsConfig {
    /// Start of the configured range (MHz)
    pub start_freq: u32,
    /// End of the configured range (MHz)
    pub end_freq: u32,
    /// Band allowed by the hardware mode
    pub hw_mode: AcsHwMode,
    /// DFS channels may be selected
    pub dfs_enabled: bool,
    /// DFS weight as a percentage of the default, capped at 100
    pub dfs_weight_percent: u32,
    /// Dynamic interference mitigation active, DFS weight not reduced
    pub dfs_interference_mitigation: bool,
    /// SRD channels may be selected
    pub srd_enabled: bool,
    /// Cap 2.4 GHz for LTE coexistence
    pub lte_coex: bool,
    /// Externally supplied allow list, empty allows all
    pub allow_list: Vec<u32>,
    /// Range weight overrides
    pub weight_ranges: Vec<WeightRange>,
    /// Per-channel weight overrides, applied after ranges
    pub channel_weights: Vec<ChannelWeight>,
    /// Results younger than this are reused (ms), 0 always scans
    pub scan_ageout_ms: u64,
    /// Weight lost per BSS observed on a candidate
    pub bss_penalty: u32,
}

impl Default for AcsConfig {
    fn default() -> Self {
        Self {
            start_freq: 2412,
            end_freq: 5825,
            hw_mode: AcsHwMode::Any,
            dfs_enabled: true,
            dfs_weight_percent: 50,
            dfs_interference_mitigation: false,
            srd_enabled: false,
            lte_coex: false,
            allow_list: Vec::new(),
            weight_ranges: Vec::new(),
            channel_weights: Vec::new(),
            scan_ageout_ms: 0,
            bss_penalty: 5,
        }
    }
}

/// A scored ACS candidate
#[derive(Debug, Clone, PartialEq)]
pub struct AcsCandidate {
    /// Channel at the configured width, or the widest the table allows
    pub channel: ChannelDescriptor,
    /// Configured weight
    pub weight: u32,
    /// DFS channel
    pub dfs: bool,
    /// Inside the configured range; edge channels added for bonding are
    /// scanned but never selected
    pub selectable: bool,
}

impl AcsCandidate {
    /// Primary frequency
    pub fn freq(&self) -> u32 {
        self.channel.primary_freq
    }
}

/// How the selection was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcsReason {
    /// Fresh scan results
    Scanned,
    /// Cached results, the scan was skipped
    ScanSkippedRecent,
    /// Static default after a scan failure
    DefaultFallback,
}

/// Outcome of one ACS run
#[derive(Debug, Clone)]
pub struct AcsResult {
    /// Selectable candidates with effective weight, best first
    pub candidates: Vec<(AcsCandidate, u32)>,
    /// Selected channel
    pub selected: ChannelDescriptor,
    /// Reason code
    pub reason: AcsReason,
}

/// Runtime inputs gathered from the DFS manager and concurrency manager
#[derive(Debug, Clone, Default)]
pub struct AcsInputs {
    /// Active NOL frequencies
    pub nol: Vec<u32>,
    /// Coexistence avoid list
    pub unsafe_channels: Vec<u32>,
    /// Preferred channel list, `None` when this is the only interface
    pub pcl: Option<Vec<u32>>,
}

/// What to scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanPlan {
    /// Every candidate has recent results
    Fresh,
    /// Scan these frequencies
    Scan(Vec<u32>),
}

#[derive(Debug, Clone)]
struct CachedResult {
    result: ScanResult,
    at: Instant,
}

/// ACS engine
pub struct AcsEngine {
    regulatory: Arc<dyn RegulatoryTable>,
    cache: RwLock<HashMap<u32, CachedResult>>,
}

impl AcsEngine {
    /// Create new ACS engine
    pub fn new(regulatory: Arc<dyn RegulatoryTable>) -> Self {
        Self {
            regulatory,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Expand the configured range to whole bonded groups at `width`
    ///
    /// Returns `(freq, in_range)` pairs in ascending order. Extension adds DFS
    /// channels only when a configured endpoint is itself DFS.
    pub fn expand_range(&self, config: &AcsConfig, width: ChannelWidth) -> Vec<(u32, bool)> {
        let reg = self.regulatory.as_ref();
        let (start, end) = (
            config.start_freq.min(config.end_freq),
            config.start_freq.max(config.end_freq),
        );
        let endpoint_dfs = reg.channel_state(start) == ChannelState::Dfs
            || reg.channel_state(end) == ChannelState::Dfs;

        let in_range: BTreeSet<u32> = reg
            .channel_list()
            .into_iter()
            .filter(|f| (start..=end).contains(f))
            .collect();
        let mut all = in_range.clone();
        for freq in &in_range {
            let group_width = match Band::from_freq(*freq) {
                Some(band) => width.clamp_to(band.max_width()),
                None => continue,
            };
            let group = match group_width {
                ChannelWidth::Bw40 if Band::from_freq(*freq) == Some(Band::Band2G) => {
                    vec![freq.saturating_sub(20), freq + 20]
                }
                w => bonded_sub_channels(*freq, w).unwrap_or_default(),
            };
            for sub in group {
                if all.contains(&sub) || !reg.channel_state(sub).is_usable() {
                    continue;
                }
                if reg.channel_state(sub) == ChannelState::Dfs && !endpoint_dfs {
                    continue;
                }
                all.insert(sub);
            }
        }
        all.into_iter().map(|f| (f, in_range.contains(&f))).collect()
    }

    /// Configured weight of a frequency
    pub fn weight_for(config: &AcsConfig, freq: u32, dfs: bool) -> u32 {
        let mut weight = DEFAULT_ACS_WEIGHT;
        if dfs && !config.dfs_interference_mitigation {
            weight = weight * config.dfs_weight_percent.min(100) / 100;
        }
        for range in &config.weight_ranges {
            if (range.start_freq..=range.end_freq).contains(&freq) {
                weight = range.weight;
            }
        }
        if let Some(w) = config.channel_weights.iter().find(|w| w.freq == freq) {
            weight = w.weight;
        }
        weight
    }

    /// Build the filtered, weighted candidate list
    pub fn build_candidates(
        &self,
        config: &AcsConfig,
        width: ChannelWidth,
        inputs: &AcsInputs,
    ) -> Result<Vec<AcsCandidate>> {
        let reg = self.regulatory.as_ref();
        let mut candidates = Vec::new();

        for (freq, in_range) in self.expand_range(config, width) {
            let state = reg.channel_state(freq);
            let dfs = state == ChannelState::Dfs;
            let band = Band::from_freq(freq);
            let allowed = match state {
                ChannelState::Enabled => true,
                ChannelState::Dfs => config.dfs_enabled,
                _ => false,
            };
            if !allowed
                || inputs.nol.contains(&freq)
                || reg.is_dsrc(freq)
                || (reg.is_srd(freq) && !config.srd_enabled)
                || (!config.allow_list.is_empty() && !config.allow_list.contains(&freq))
                || inputs.unsafe_channels.contains(&freq)
                || (config.lte_coex && band == Some(Band::Band2G) && freq > LTE_COEX_2G_MAX)
            {
                continue;
            }
            match (config.hw_mode, band) {
                (AcsHwMode::Band2G, Some(Band::Band2G))
                | (AcsHwMode::Band5G, Some(Band::Band5G))
                | (AcsHwMode::Any, _) => {}
                _ => continue,
            }
            let weight = Self::weight_for(config, freq, dfs);
            if weight == 0 {
                continue;
            }
            let channel = match self.clean_descriptor(freq, width, &inputs.nol) {
                Some(channel) => channel,
                None => continue,
            };
            candidates.push(AcsCandidate {
                channel,
                weight,
                dfs,
                selectable: in_range,
            });
        }

        if let Some(pcl) = inputs.pcl.as_ref().filter(|p| !p.is_empty()) {
            let intersects = candidates.iter().any(|c| c.selectable && pcl.contains(&c.freq()));
            if intersects {
                for candidate in candidates.iter_mut() {
                    if !pcl.contains(&candidate.freq()) {
                        candidate.selectable = false;
                    }
                }
            } else {
                log::warn!("ACS candidates do not intersect the PCL, ignoring it");
            }
        }

        if !candidates.iter().any(|c| c.selectable) {
            return Err(SapError::NoChannelAvailable(format!(
                "no ACS candidate in [{}, {}] MHz",
                config.start_freq, config.end_freq
            )));
        }
        log::debug!("ACS built {} candidates", candidates.len());
        Ok(candidates)
    }

    /// Widest descriptor at or below `width` with no sub-channel in the NOL
    fn clean_descriptor(
        &self,
        freq: u32,
        width: ChannelWidth,
        nol: &[u32],
    ) -> Option<ChannelDescriptor> {
        let reg = self.regulatory.as_ref();
        let mut width = width;
        loop {
            if let Ok(desc) = ChannelDescriptor::compute(reg, freq, width) {
                if desc.sub_channels().iter().all(|f| !nol.contains(f)) {
                    return Some(desc);
                }
                width = desc.width.narrower()?;
            } else {
                width = width.narrower()?;
            }
        }
    }

    /// Decide which candidate frequencies need scanning
    pub async fn scan_plan(&self, candidates: &[AcsCandidate], ageout_ms: u64) -> ScanPlan {
        let freqs: Vec<u32> = candidates.iter().map(|c| c.freq()).collect();
        if ageout_ms == 0 {
            return ScanPlan::Scan(freqs);
        }
        let ageout = Duration::from_millis(ageout_ms);
        let cache = self.cache.read().await;
        let stale: Vec<u32> = freqs
            .into_iter()
            .filter(|f| cache.get(f).map(|c| c.at.elapsed() >= ageout).unwrap_or(true))
            .collect();
        if stale.is_empty() {
            ScanPlan::Fresh
        } else {
            ScanPlan::Scan(stale)
        }
    }

    /// Store scan results
    pub async fn record_scan(&self, results: &[ScanResult]) {
        let now = Instant::now();
        let mut cache = self.cache.write().await;
        for result in results {
            cache.insert(result.freq, CachedResult { result: result.clone(), at: now });
        }
    }

    /// Cached results for every candidate frequency
    pub async fn cached_results(&self, candidates: &[AcsCandidate]) -> Vec<ScanResult> {
        let cache = self.cache.read().await;
        candidates
            .iter()
            .filter_map(|c| cache.get(&c.freq()).map(|r| r.result.clone()))
            .collect()
    }

    /// Drop every cached result
    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
    }

    /// Pick the best candidate given scan results
    pub fn select(
        &self,
        candidates: &[AcsCandidate],
        results: &[ScanResult],
        penalty: u32,
        reason: AcsReason,
    ) -> Result<AcsResult> {
        let bss_on = |channel: &ChannelDescriptor| -> u32 {
            results
                .iter()
                .filter(|r| channel.contains_freq(r.freq))
                .map(|r| r.bss_count)
                .sum()
        };
        let mut scored: Vec<(AcsCandidate, u32)> = candidates
            .iter()
            .filter(|c| c.selectable)
            .map(|c| {
                let effective = c
                    .weight
                    .saturating_sub(penalty.saturating_mul(bss_on(&c.channel)))
                    .max(1);
                (c.clone(), effective)
            })
            .collect();
        scored.sort_by(|(a, wa), (b, wb)| {
            wb.cmp(wa)
                .then(a.dfs.cmp(&b.dfs))
                .then(b.channel.is_5ghz().cmp(&a.channel.is_5ghz()))
                .then(a.freq().cmp(&b.freq()))
        });
        let selected = scored
            .first()
            .map(|(c, _)| c.channel)
            .ok_or_else(|| {
                SapError::NoChannelAvailable("no selectable ACS candidate".to_string())
            })?;
        log::info!("ACS selected {} ({:?}, {} candidates)", selected, reason, scored.len());
        Ok(AcsResult {
            candidates: scored,
            selected,
            reason,
        })
    }

    /// Static selection used when the scan cannot be issued
    ///
    /// First enabled 5 GHz, else first DFS 5 GHz, else first enabled, else
    /// first listed.
    pub fn default_selection(&self, candidates: &[AcsCandidate]) -> Result<AcsResult> {
        let selectable: Vec<&AcsCandidate> = candidates.iter().filter(|c| c.selectable).collect();
        let pick = selectable
            .iter()
            .find(|c| c.channel.is_5ghz() && !c.dfs)
            .or_else(|| selectable.iter().find(|c| c.channel.is_5ghz() && c.dfs))
            .or_else(|| selectable.iter().find(|c| !c.dfs))
            .or_else(|| selectable.first())
            .ok_or_else(|| SapError::NoChannelAvailable("no default channel".to_string()))?;
        log::warn!("ACS default selection {}", pick.channel);
        Ok(AcsResult {
            candidates: selectable.iter().map(|c| ((*c).clone(), c.weight)).collect(),
            selected: pick.channel,
            reason: AcsReason::DefaultFallback,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regulatory::StaticRegulatoryTable;

    fn engine(reg: StaticRegulatoryTable) -> AcsEngine {
        AcsEngine::new(Arc::new(reg))
    }

    fn config(start: u32, end: u32) -> AcsConfig {
        AcsConfig {
            start_freq: start,
            end_freq: end,
            ..AcsConfig::default()
        }
    }

    #[test]
    fn test_scenario_default_weight_selects_first() {
        let mut reg = StaticRegulatoryTable::fcc();
        reg.set_range_state(5180, 5320, ChannelState::Enabled);
        let acs = engine(reg);
        let candidates = acs
            .build_candidates(&config(5180, 5320), ChannelWidth::Bw80, &AcsInputs::default())
            .unwrap();
        assert_eq!(candidates.len(), 8);
        let result = acs.select(&candidates, &[], 5, AcsReason::Scanned).unwrap();
        assert_eq!(result.selected.primary_freq, 5180);
        assert_eq!(result.selected.width, ChannelWidth::Bw80);
    }

    #[test]
    fn test_range_expansion() {
        let acs = engine(StaticRegulatoryTable::fcc());
        let expanded = acs.expand_range(&config(5180, 5200), ChannelWidth::Bw80);
        let freqs: Vec<u32> = expanded.iter().map(|(f, _)| *f).collect();
        assert_eq!(freqs, vec![5180, 5200, 5220, 5240]);
        assert!(expanded[0].1 && expanded[1].1);
        assert!(!expanded[2].1 && !expanded[3].1);

        // 5240@80 sits in a non-DFS group, 5260 is not pulled back in
        let expanded = acs.expand_range(&config(5240, 5240), ChannelWidth::Bw160);
        assert!(expanded.iter().all(|(f, _)| *f < 5260));

        // DFS endpoint allows DFS extension
        let expanded = acs.expand_range(&config(5260, 5260), ChannelWidth::Bw80);
        assert_eq!(expanded.len(), 4);

        let expanded = acs.expand_range(&config(2437, 2437), ChannelWidth::Bw40);
        let freqs: Vec<u32> = expanded.iter().map(|(f, _)| *f).collect();
        assert_eq!(freqs, vec![2417, 2437, 2457]);
    }

    #[test]
    fn test_weights() {
        let mut cfg = config(5180, 5320);
        assert_eq!(AcsEngine::weight_for(&cfg, 5180, false), 100);
        assert_eq!(AcsEngine::weight_for(&cfg, 5260, true), 50);
        cfg.dfs_weight_percent = u32::MAX;
        assert_eq!(AcsEngine::weight_for(&cfg, 5260, true), 100);
        cfg.dfs_weight_percent = 50;
        cfg.dfs_interference_mitigation = true;
        assert_eq!(AcsEngine::weight_for(&cfg, 5260, true), 100);
        cfg.weight_ranges.push(WeightRange {
            start_freq: 5180,
            end_freq: 5240,
            weight: 30,
        });
        cfg.channel_weights.push(ChannelWeight { freq: 5200, weight: 0 });
        assert_eq!(AcsEngine::weight_for(&cfg, 5180, false), 30);
        assert_eq!(AcsEngine::weight_for(&cfg, 5200, false), 0);
    }

    #[test]
    fn test_filters() {
        let acs = engine(StaticRegulatoryTable::etsi());
        let mut cfg = config(2412, 5825);
        cfg.lte_coex = true;
        cfg.channel_weights.push(ChannelWeight { freq: 5180, weight: 0 });
        let inputs = AcsInputs {
            nol: vec![5500],
            unsafe_channels: vec![5200],
            pcl: None,
        };
        let candidates = acs.build_candidates(&cfg, ChannelWidth::Bw20, &inputs).unwrap();
        let freqs: Vec<u32> = candidates.iter().map(|c| c.freq()).collect();
        assert!(!freqs.contains(&5500));
        assert!(!freqs.contains(&5200));
        assert!(!freqs.contains(&5180));
        assert!(!freqs.contains(&5745), "SRD excluded by default");
        assert!(!freqs.contains(&2462));
        assert!(freqs.contains(&2452));

        cfg.dfs_enabled = false;
        let candidates = acs.build_candidates(&cfg, ChannelWidth::Bw20, &inputs).unwrap();
        assert!(candidates.iter().all(|c| !c.dfs));
    }

    #[test]
    fn test_nol_narrows_candidate() {
        let acs = engine(StaticRegulatoryTable::fcc());
        let inputs = AcsInputs {
            nol: vec![5540],
            ..AcsInputs::default()
        };
        let candidates = acs
            .build_candidates(&config(5500, 5500), ChannelWidth::Bw80, &inputs)
            .unwrap();
        let primary = candidates.iter().find(|c| c.freq() == 5500).unwrap();
        assert_eq!(primary.channel.width, ChannelWidth::Bw40);
        assert!(!primary.channel.sub_channels().contains(&5540));
    }

    #[test]
    fn test_empty_candidates() {
        let acs = engine(StaticRegulatoryTable::fcc());
        let mut cfg = config(5260, 5320);
        cfg.dfs_enabled = false;
        assert!(matches!(
            acs.build_candidates(&cfg, ChannelWidth::Bw20, &AcsInputs::default()),
            Err(SapError::NoChannelAvailable(_))
        ));
    }

    #[test]
    fn test_pcl_intersection() {
        let acs = engine(StaticRegulatoryTable::fcc());
        let cfg = config(5180, 5240);
        let inputs = AcsInputs {
            pcl: Some(vec![5220]),
            ..AcsInputs::default()
        };
        let candidates = acs.build_candidates(&cfg, ChannelWidth::Bw20, &inputs).unwrap();
        let result = acs.select(&candidates, &[], 5, AcsReason::Scanned).unwrap();
        assert_eq!(result.selected.primary_freq, 5220);

        let inputs = AcsInputs {
            pcl: Some(vec![2412]),
            ..AcsInputs::default()
        };
        let candidates = acs.build_candidates(&cfg, ChannelWidth::Bw20, &inputs).unwrap();
        let result = acs.select(&candidates, &[], 5, AcsReason::Scanned).unwrap();
        assert_eq!(result.selected.primary_freq, 5180);
    }

    #[test]
    fn test_scan_penalty_and_tie_break() {
        let acs = engine(StaticRegulatoryTable::fcc());
        let cfg = config(2412, 5240);
        let candidates = acs
            .build_candidates(&cfg, ChannelWidth::Bw20, &AcsInputs::default())
            .unwrap();
        let busy = vec![ScanResult::new(5180, 3, -40), ScanResult::new(5200, 1, -70)];
        let result = acs.select(&candidates, &busy, 5, AcsReason::Scanned).unwrap();
        // 5220 and 5240 tie at full weight, 5 GHz beats 2.4 GHz, lowest wins
        assert_eq!(result.selected.primary_freq, 5220);
        assert_eq!(result.candidates[0].1, 100);
    }

    #[test]
    fn test_default_selection_order() {
        let acs = engine(StaticRegulatoryTable::fcc());
        let all = acs
            .build_candidates(&config(2412, 5320), ChannelWidth::Bw20, &AcsInputs::default())
            .unwrap();
        assert_eq!(acs.default_selection(&all).unwrap().selected.primary_freq, 5180);

        let dfs_only = acs
            .build_candidates(&config(5260, 5320), ChannelWidth::Bw20, &AcsInputs::default())
            .unwrap();
        let mut mixed = dfs_only.clone();
        mixed.extend(
            acs.build_candidates(&config(2412, 2462), ChannelWidth::Bw20, &AcsInputs::default())
                .unwrap(),
        );
        let result = acs.default_selection(&mixed).unwrap();
        assert_eq!(result.selected.primary_freq, 5260);
        assert_eq!(result.reason, AcsReason::DefaultFallback);

        let only_2g = acs
            .build_candidates(&config(2412, 2462), ChannelWidth::Bw20, &AcsInputs::default())
            .unwrap();
        assert_eq!(acs.default_selection(&only_2g).unwrap().selected.primary_freq, 2412);
    }

    #[tokio::test]
    async fn test_scan_plan_ageout() {
        let acs = engine(StaticRegulatoryTable::fcc());
        let candidates = acs
            .build_candidates(&config(5180, 5200), ChannelWidth::Bw20, &AcsInputs::default())
            .unwrap();
        assert_eq!(acs.scan_plan(&candidates, 0).await, ScanPlan::Scan(vec![5180, 5200]));
        assert_eq!(acs.scan_plan(&candidates, 60_000).await, ScanPlan::Scan(vec![5180, 5200]));

        acs.record_scan(&[ScanResult::new(5180, 0, -90)]).await;
        assert_eq!(acs.scan_plan(&candidates, 60_000).await, ScanPlan::Scan(vec![5200]));
        acs.record_scan(&[ScanResult::new(5200, 2, -60)]).await;
        assert_eq!(acs.scan_plan(&candidates, 60_000).await, ScanPlan::Fresh);
        assert_eq!(acs.cached_results(&candidates).await.len(), 2);
    }
}
