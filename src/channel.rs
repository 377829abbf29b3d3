//! Channel parameter calculation
//!
//! Pure functions computing bonded-channel sets, bandwidth fallback,
//! puncture bitmaps and NOL/leakage-adjusted channel lists. The only
//! dependency is the regulatory channel table.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::regulatory::{combined_state, ChannelState, RegulatoryTable};
use crate::{Result, SapError};

/// 40 MHz center channel numbers in the 5 GHz band
const CENTERS_5G_40: [u8; 14] = [38, 46, 54, 62, 102, 110, 118, 126, 134, 142, 151, 159, 167, 175];
/// 80 MHz center channel numbers in the 5 GHz band
const CENTERS_5G_80: [u8; 7] = [42, 58, 106, 122, 138, 155, 171];
/// 160 MHz center channel numbers in the 5 GHz band
const CENTERS_5G_160: [u8; 3] = [50, 114, 163];

/// Highest 6 GHz channel number
const MAX_6G_CHANNEL: u32 = 233;

/// ETSI weather radar sub-band (MHz)
pub const WEATHER_BAND_START: u32 = 5600;
pub const WEATHER_BAND_END: u32 = 5650;

/// Radio band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Band {
    /// 2.4 GHz
    Band2G,
    /// 5 GHz
    Band5G,
    /// 6 GHz
    Band6G,
}

impl Band {
    /// Classify a frequency in MHz
    pub fn from_freq(freq: u32) -> Option<Self> {
        match freq {
            2412..=2484 => Some(Band::Band2G),
            5160..=5885 => Some(Band::Band5G),
            5955..=7115 => Some(Band::Band6G),
            _ => None,
        }
    }

    /// Widest channel the band supports as a single segment
    pub fn max_width(&self) -> ChannelWidth {
        match self {
            Band::Band2G => ChannelWidth::Bw40,
            Band::Band5G => ChannelWidth::Bw160,
            Band::Band6G => ChannelWidth::Bw320,
        }
    }

    /// Get band name
    pub fn name(&self) -> &'static str {
        match self {
            Band::Band2G => "2.4GHz",
            Band::Band5G => "5GHz",
            Band::Band6G => "6GHz",
        }
    }
}

/// Convert a frequency to its IEEE channel number
pub fn freq_to_channel(freq: u32) -> Option<u8> {
    let base = match Band::from_freq(freq)? {
        Band::Band2G if freq == 2484 => return Some(14),
        Band::Band2G => 2407,
        Band::Band5G => 5000,
        Band::Band6G => 5950,
    };
    if (freq - base) % 5 != 0 {
        return None;
    }
    u8::try_from((freq - base) / 5).ok()
}

/// Convert an IEEE channel number to a frequency
pub fn channel_to_freq(channel: u8, band: Band) -> Option<u32> {
    let channel = u32::from(channel);
    match band {
        Band::Band2G => match channel {
            1..=13 => Some(2407 + channel * 5),
            14 => Some(2484),
            _ => None,
        },
        Band::Band5G => (32..=177).contains(&channel).then(|| 5000 + channel * 5),
        Band::Band6G => (1..=MAX_6G_CHANNEL).contains(&channel).then(|| 5950 + channel * 5),
    }
}

/// Check whether a frequency lies in the ETSI weather radar sub-band
pub fn is_weather_channel(freq: u32) -> bool {
    (WEATHER_BAND_START..=WEATHER_BAND_END).contains(&freq)
}

/// Channel width class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChannelWidth {
    /// 20 MHz
    Bw20 = 0,
    /// 40 MHz
    Bw40 = 1,
    /// 80 MHz
    Bw80 = 2,
    /// 160 MHz contiguous
    Bw160 = 3,
    /// 80+80 MHz non-contiguous
    Bw80P80 = 4,
    /// 320 MHz
    Bw320 = 5,
}

impl ChannelWidth {
    /// Parse width from u8
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ChannelWidth::Bw20),
            1 => Ok(ChannelWidth::Bw40),
            2 => Ok(ChannelWidth::Bw80),
            3 => Ok(ChannelWidth::Bw160),
            4 => Ok(ChannelWidth::Bw80P80),
            5 => Ok(ChannelWidth::Bw320),
            _ => Err(SapError::InvalidParameter(format!("Invalid channel width: {}", value))),
        }
    }

    /// Parse a contiguous width from its size in MHz
    pub fn from_mhz(mhz: u32) -> Result<Self> {
        match mhz {
            20 => Ok(ChannelWidth::Bw20),
            40 => Ok(ChannelWidth::Bw40),
            80 => Ok(ChannelWidth::Bw80),
            160 => Ok(ChannelWidth::Bw160),
            320 => Ok(ChannelWidth::Bw320),
            _ => Err(SapError::InvalidParameter(format!("Invalid channel width: {} MHz", mhz))),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Total occupied bandwidth in MHz
    pub fn mhz(&self) -> u32 {
        match self {
            ChannelWidth::Bw20 => 20,
            ChannelWidth::Bw40 => 40,
            ChannelWidth::Bw80 => 80,
            ChannelWidth::Bw160 | ChannelWidth::Bw80P80 => 160,
            ChannelWidth::Bw320 => 320,
        }
    }

    /// Get width name
    pub fn name(&self) -> &'static str {
        match self {
            ChannelWidth::Bw20 => "20MHz",
            ChannelWidth::Bw40 => "40MHz",
            ChannelWidth::Bw80 => "80MHz",
            ChannelWidth::Bw160 => "160MHz",
            ChannelWidth::Bw80P80 => "80+80MHz",
            ChannelWidth::Bw320 => "320MHz",
        }
    }

    /// Next narrower width used for bandwidth fallback
    pub fn narrower(&self) -> Option<Self> {
        match self {
            ChannelWidth::Bw320 => Some(ChannelWidth::Bw160),
            ChannelWidth::Bw160 | ChannelWidth::Bw80P80 => Some(ChannelWidth::Bw80),
            ChannelWidth::Bw80 => Some(ChannelWidth::Bw40),
            ChannelWidth::Bw40 => Some(ChannelWidth::Bw20),
            ChannelWidth::Bw20 => None,
        }
    }

    /// Return the narrower of `self` and `limit`
    pub fn clamp_to(self, limit: ChannelWidth) -> Self {
        if self.mhz() <= limit.mhz() {
            self
        } else {
            limit
        }
    }
}

impl Default for ChannelWidth {
    fn default() -> Self {
        ChannelWidth::Bw20
    }
}

/// Position of the secondary 20 MHz channel relative to the primary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecondaryOffset {
    /// No secondary channel
    None,
    /// Secondary channel above the primary
    Above,
    /// Secondary channel below the primary
    Below,
}

impl Default for SecondaryOffset {
    fn default() -> Self {
        SecondaryOffset::None
    }
}

/// Operating channel descriptor
///
/// Always replaced as a whole value. Segment layout follows the width: no
/// segment for 20 MHz, `center_freq_seg0` for 40/80/160/320 MHz and both
/// segments for 80+80 MHz.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    /// Primary 20 MHz channel frequency
    pub primary_freq: u32,
    /// Channel width
    pub width: ChannelWidth,
    /// Secondary channel offset
    pub sec_offset: SecondaryOffset,
    /// Center frequency of the (first) segment
    pub center_freq_seg0: Option<u32>,
    /// Center frequency of the second 80 MHz segment (80+80 only)
    pub center_freq_seg1: Option<u32>,
    /// Punctured 20 MHz sub-channels, bit 0 is the lowest sub-channel
    pub puncture_bitmap: u16,
}

impl ChannelDescriptor {
    /// 20 MHz descriptor for a primary frequency
    pub fn new_20(primary_freq: u32) -> Self {
        Self {
            primary_freq,
            width: ChannelWidth::Bw20,
            sec_offset: SecondaryOffset::None,
            center_freq_seg0: None,
            center_freq_seg1: None,
            puncture_bitmap: 0,
        }
    }

    /// Compute the descriptor for `(primary_freq, width)`
    ///
    /// Falls back to narrower widths until every bonded sub-channel is usable.
    /// The primary channel itself must be enabled or DFS.
    pub fn compute(
        reg: &dyn RegulatoryTable,
        primary_freq: u32,
        width: ChannelWidth,
    ) -> Result<Self> {
        let band = Band::from_freq(primary_freq).ok_or_else(|| {
            SapError::invalid_channel(primary_freq, "frequency outside supported bands")
        })?;
        if !reg.channel_state(primary_freq).is_usable() {
            return Err(SapError::invalid_channel(
                primary_freq,
                "not usable in the regulatory table",
            ));
        }

        let requested = if width == ChannelWidth::Bw80P80 { ChannelWidth::Bw80 } else { width };
        let mut candidate = requested.clamp_to(band.max_width());
        loop {
            if candidate == ChannelWidth::Bw20 {
                return Ok(Self::new_20(primary_freq));
            }
            for &offset in Self::offsets_to_try(band) {
                if let Some(desc) = Self::bonded(primary_freq, candidate, offset) {
                    if combined_state(reg, &desc.sub_channels()).is_usable() {
                        return Ok(desc);
                    }
                }
            }
            match candidate.narrower() {
                Some(next) => {
                    log::debug!(
                        "Bandwidth fallback for {} MHz: {} -> {}",
                        primary_freq,
                        candidate.name(),
                        next.name()
                    );
                    candidate = next;
                }
                None => return Ok(Self::new_20(primary_freq)),
            }
        }
    }

    /// Compute an 80+80 descriptor with the second segment centered on `seg1_center`
    ///
    /// Falls back to plain 80 MHz when the second segment is unusable.
    pub fn compute_80p80(
        reg: &dyn RegulatoryTable,
        primary_freq: u32,
        seg1_center: u32,
    ) -> Result<Self> {
        let primary = Self::compute(reg, primary_freq, ChannelWidth::Bw80)?;
        if primary.width != ChannelWidth::Bw80 {
            return Ok(primary);
        }
        let seg0 = primary.center_freq_seg0.unwrap_or(primary_freq);
        let seg1_channel = freq_to_channel(seg1_center).filter(|c| CENTERS_5G_80.contains(c));
        if seg1_channel.is_none() || seg0.abs_diff(seg1_center) < 160 {
            log::debug!("80+80 second segment {} MHz rejected for seg0 {} MHz", seg1_center, seg0);
            return Ok(primary);
        }
        if !combined_state(reg, &span_freqs(seg1_center, 80)).is_usable() {
            return Ok(primary);
        }
        Ok(Self {
            width: ChannelWidth::Bw80P80,
            center_freq_seg1: Some(seg1_center),
            ..primary
        })
    }

    /// Descriptor for a bonded group without any regulatory check
    fn bonded(primary_freq: u32, width: ChannelWidth, offset: SecondaryOffset) -> Option<Self> {
        let band = Band::from_freq(primary_freq)?;
        let subs = bonded_sub_channels_with(primary_freq, width, offset)?;
        let center = (subs[0] + subs[subs.len() - 1]) / 2;
        let sec_offset = match band {
            Band::Band2G => offset,
            _ => {
                let center40 = group_center(primary_freq, ChannelWidth::Bw40)?;
                if primary_freq < center40 {
                    SecondaryOffset::Above
                } else {
                    SecondaryOffset::Below
                }
            }
        };
        Some(Self {
            primary_freq,
            width,
            sec_offset,
            center_freq_seg0: Some(center),
            center_freq_seg1: None,
            puncture_bitmap: 0,
        })
    }

    fn offsets_to_try(band: Band) -> &'static [SecondaryOffset] {
        match band {
            Band::Band2G => &[SecondaryOffset::Above, SecondaryOffset::Below],
            _ => &[SecondaryOffset::None],
        }
    }

    /// Band of the primary channel
    pub fn band(&self) -> Option<Band> {
        Band::from_freq(self.primary_freq)
    }

    /// IEEE channel number of the primary channel
    pub fn channel_number(&self) -> Option<u8> {
        freq_to_channel(self.primary_freq)
    }

    /// Check if the primary channel is in the 5 GHz band
    pub fn is_5ghz(&self) -> bool {
        self.band() == Some(Band::Band5G)
    }

    /// All 20 MHz sub-channel frequencies covered by this descriptor, ascending
    pub fn sub_channels(&self) -> Vec<u32> {
        match (self.width, self.center_freq_seg0) {
            (ChannelWidth::Bw20, _) | (_, None) => vec![self.primary_freq],
            (ChannelWidth::Bw80P80, Some(seg0)) => {
                let mut subs = span_freqs(seg0, 80);
                if let Some(seg1) = self.center_freq_seg1 {
                    subs.extend(span_freqs(seg1, 80));
                }
                subs.sort_unstable();
                subs
            }
            (width, Some(seg0)) => span_freqs(seg0, width.mhz()),
        }
    }

    /// Check whether `freq` is one of the occupied sub-channels
    pub fn contains_freq(&self, freq: u32) -> bool {
        self.sub_channels().contains(&freq)
    }

    /// Check whether two descriptors share at least one sub-channel
    pub fn overlaps(&self, other: &ChannelDescriptor) -> bool {
        let mine = self.sub_channels();
        other.sub_channels().iter().any(|f| mine.contains(f))
    }

    /// Check whether any sub-channel is DFS-regulated
    pub fn is_dfs(&self, reg: &dyn RegulatoryTable) -> bool {
        self.sub_channels().iter().any(|f| reg.channel_state(*f) == ChannelState::Dfs)
    }

    /// Verify the segment layout matches the width
    pub fn is_consistent(&self) -> bool {
        match self.width {
            ChannelWidth::Bw20 => {
                self.center_freq_seg0.is_none() && self.center_freq_seg1.is_none()
            }
            ChannelWidth::Bw80P80 => {
                self.center_freq_seg0.is_some() && self.center_freq_seg1.is_some()
            }
            _ => self.center_freq_seg0.is_some() && self.center_freq_seg1.is_none(),
        }
    }

    /// Derive a puncture bitmap that removes blocked sub-channels
    ///
    /// Returns `None` when the primary would be punctured or the pattern
    /// exceeds what the width allows.
    pub fn puncture_pattern<F: Fn(u32) -> bool>(&self, is_blocked: F) -> Option<u16> {
        let mut bitmap = 0u16;
        for (bit, freq) in self.sub_channels().into_iter().enumerate() {
            if is_blocked(freq) {
                if freq == self.primary_freq {
                    return None;
                }
                bitmap |= 1 << bit;
            }
        }
        if bitmap.count_ones() > max_punctured(self.width) {
            return None;
        }
        Some(bitmap)
    }

    /// Apply a puncture bitmap
    pub fn with_puncture(self, bitmap: u16) -> Result<Self> {
        let subs = self.sub_channels();
        if bitmap >> subs.len() != 0 || bitmap.count_ones() > max_punctured(self.width) {
            return Err(SapError::InvalidParameter(format!(
                "Puncture bitmap {:#06x} not allowed for {}",
                bitmap,
                self.width.name()
            )));
        }
        if let Some(bit) = subs.iter().position(|f| *f == self.primary_freq) {
            if bitmap & (1 << bit) != 0 {
                return Err(SapError::InvalidParameter(
                    "Primary channel cannot be punctured".to_string(),
                ));
            }
        }
        Ok(Self {
            puncture_bitmap: bitmap,
            ..self
        })
    }
}

impl fmt::Display for ChannelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} MHz/{}", self.primary_freq, self.width.name())?;
        if let Some(seg0) = self.center_freq_seg0 {
            write!(f, " seg0={}", seg0)?;
        }
        if let Some(seg1) = self.center_freq_seg1 {
            write!(f, " seg1={}", seg1)?;
        }
        if self.puncture_bitmap != 0 {
            write!(f, " punct={:#06x}", self.puncture_bitmap)?;
        }
        Ok(())
    }
}

fn max_punctured(width: ChannelWidth) -> u32 {
    match width {
        ChannelWidth::Bw80 => 1,
        ChannelWidth::Bw160 => 2,
        ChannelWidth::Bw320 => 4,
        _ => 0,
    }
}

/// 20 MHz sub-channel frequencies of a segment centered at `center`
fn span_freqs(center: u32, mhz: u32) -> Vec<u32> {
    let low = center - mhz / 2 + 10;
    (0..mhz / 20).map(|i| low + 20 * i).collect()
}

/// Center frequency of the 5/6 GHz bonded group that contains `primary_freq`
fn group_center(primary_freq: u32, width: ChannelWidth) -> Option<u32> {
    let channel = u32::from(freq_to_channel(primary_freq)?);
    let half = width.mhz() / 10;
    match Band::from_freq(primary_freq)? {
        Band::Band2G => None,
        Band::Band5G => {
            let centers: &[u8] = match width {
                ChannelWidth::Bw40 => &CENTERS_5G_40,
                ChannelWidth::Bw80 => &CENTERS_5G_80,
                ChannelWidth::Bw160 => &CENTERS_5G_160,
                _ => return None,
            };
            centers
                .iter()
                .map(|c| u32::from(*c))
                .find(|c| {
                    let low = c + 2 - half;
                    channel >= low && channel <= c + half - 2 && (channel - low) % 4 == 0
                })
                .map(|c| 5000 + c * 5)
        }
        Band::Band6G => {
            if channel % 4 != 1 {
                return None;
            }
            let per_group = width.mhz() / 20;
            let group = (channel - 1) / 4 / per_group;
            let first = group * per_group * 4 + 1;
            let last = first + (per_group - 1) * 4;
            if last > MAX_6G_CHANNEL {
                return None;
            }
            Some(5950 + (first + last) / 2 * 5)
        }
    }
}

fn bonded_sub_channels_with(
    primary_freq: u32,
    width: ChannelWidth,
    offset: SecondaryOffset,
) -> Option<Vec<u32>> {
    let band = Band::from_freq(primary_freq)?;
    match (band, width) {
        (_, ChannelWidth::Bw20) => Some(vec![primary_freq]),
        (_, ChannelWidth::Bw80P80) => None,
        (Band::Band2G, ChannelWidth::Bw40) => {
            let channel = freq_to_channel(primary_freq)?;
            let offset = match offset {
                SecondaryOffset::None if channel <= 9 => SecondaryOffset::Above,
                SecondaryOffset::None => SecondaryOffset::Below,
                other => other,
            };
            let secondary = match offset {
                SecondaryOffset::Above => channel_to_freq(channel.checked_add(4)?, Band::Band2G)?,
                _ => channel_to_freq(channel.checked_sub(4)?, Band::Band2G)?,
            };
            if secondary == 2484 || primary_freq == 2484 {
                return None;
            }
            let mut subs = vec![primary_freq, secondary];
            subs.sort_unstable();
            Some(subs)
        }
        (Band::Band2G, _) => None,
        (Band::Band5G, ChannelWidth::Bw320) => None,
        (_, width) => {
            group_center(primary_freq, width).map(|center| span_freqs(center, width.mhz()))
        }
    }
}

/// Sub-channels of the default bonded group of `(primary_freq, width)`
///
/// 80+80 has no single group and returns `None`.
pub fn bonded_sub_channels(primary_freq: u32, width: ChannelWidth) -> Option<Vec<u32>> {
    bonded_sub_channels_with(primary_freq, width, SecondaryOffset::None)
}

/// Keep the primaries of `freqs` whose bonded span at `width` stays clear of
/// every blocked frequency by more than `guard_mhz`
pub fn leakage_adjusted_channels(
    freqs: &[u32],
    width: ChannelWidth,
    blocked: &[u32],
    guard_mhz: u32,
) -> Vec<u32> {
    freqs
        .iter()
        .copied()
        .filter(|freq| {
            let subs = match bonded_sub_channels(*freq, width) {
                Some(subs) => subs,
                None => return false,
            };
            subs.iter().all(|s| {
                blocked
                    .iter()
                    .all(|b| *s != *b && (guard_mhz == 0 || s.abs_diff(*b) > guard_mhz))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regulatory::{DfsRegion, StaticRegulatoryTable};

    #[test]
    fn test_freq_channel_conversion() {
        assert_eq!(freq_to_channel(2412), Some(1));
        assert_eq!(freq_to_channel(2484), Some(14));
        assert_eq!(freq_to_channel(5180), Some(36));
        assert_eq!(freq_to_channel(5825), Some(165));
        assert_eq!(freq_to_channel(5955), Some(1));
        assert_eq!(freq_to_channel(3000), None);
        assert_eq!(channel_to_freq(149, Band::Band5G), Some(5745));
        assert_eq!(channel_to_freq(6, Band::Band2G), Some(2437));
        assert_eq!(channel_to_freq(15, Band::Band2G), None);
    }

    #[test]
    fn test_width_helpers() {
        assert_eq!(ChannelWidth::Bw80.mhz(), 80);
        assert_eq!(ChannelWidth::Bw80P80.mhz(), 160);
        assert_eq!(ChannelWidth::Bw160.narrower(), Some(ChannelWidth::Bw80));
        assert_eq!(ChannelWidth::Bw20.narrower(), None);
        assert_eq!(ChannelWidth::Bw80.clamp_to(ChannelWidth::Bw40), ChannelWidth::Bw40);
        assert_eq!(ChannelWidth::Bw20.clamp_to(ChannelWidth::Bw40), ChannelWidth::Bw20);
        assert!(ChannelWidth::from_u8(9).is_err());
        assert_eq!(ChannelWidth::from_mhz(160).unwrap(), ChannelWidth::Bw160);
    }

    #[test]
    fn test_bonded_80_segments() {
        let reg = StaticRegulatoryTable::fcc();
        let desc = ChannelDescriptor::compute(&reg, 5180, ChannelWidth::Bw80).unwrap();
        assert_eq!(desc.width, ChannelWidth::Bw80);
        assert_eq!(desc.center_freq_seg0, Some(5210));
        assert_eq!(desc.center_freq_seg1, None);
        assert_eq!(desc.sec_offset, SecondaryOffset::Above);
        assert_eq!(desc.sub_channels(), vec![5180, 5200, 5220, 5240]);
        assert!(desc.is_consistent());

        let upper = ChannelDescriptor::compute(&reg, 5240, ChannelWidth::Bw80).unwrap();
        assert_eq!(upper.center_freq_seg0, Some(5210));
        assert_eq!(upper.sec_offset, SecondaryOffset::Below);
    }

    #[test]
    fn test_descriptor_stability() {
        let reg = StaticRegulatoryTable::etsi();
        for (freq, width) in [
            (5500, ChannelWidth::Bw160),
            (5260, ChannelWidth::Bw80),
            (2437, ChannelWidth::Bw40),
            (5745, ChannelWidth::Bw80),
        ] {
            let first = ChannelDescriptor::compute(&reg, freq, width).unwrap();
            let second = ChannelDescriptor::compute(&reg, freq, width).unwrap();
            assert_eq!(first, second);
            assert!(first.is_consistent());
        }
    }

    #[test]
    fn test_bandwidth_fallback() {
        let mut reg = StaticRegulatoryTable::fcc();
        reg.set_state(5240, ChannelState::Disabled);
        let desc = ChannelDescriptor::compute(&reg, 5180, ChannelWidth::Bw80).unwrap();
        assert_eq!(desc.width, ChannelWidth::Bw40);
        assert_eq!(desc.center_freq_seg0, Some(5190));

        // 160 MHz on channel 149 would need channels above 165
        let desc = ChannelDescriptor::compute(&reg, 5745, ChannelWidth::Bw160).unwrap();
        assert_eq!(desc.width, ChannelWidth::Bw80);
        assert_eq!(desc.center_freq_seg0, Some(5775));
    }

    #[test]
    fn test_2ghz_40_offset() {
        let reg = StaticRegulatoryTable::fcc();
        let low = ChannelDescriptor::compute(&reg, 2412, ChannelWidth::Bw80).unwrap();
        assert_eq!(low.width, ChannelWidth::Bw40);
        assert_eq!(low.sec_offset, SecondaryOffset::Above);
        assert_eq!(low.center_freq_seg0, Some(2422));

        // Channel 9 above would need channel 13, which FCC disables
        let high = ChannelDescriptor::compute(&reg, 2452, ChannelWidth::Bw40).unwrap();
        assert_eq!(high.sec_offset, SecondaryOffset::Below);
        assert_eq!(high.sub_channels(), vec![2432, 2452]);
    }

    #[test]
    fn test_invalid_primary() {
        let reg = StaticRegulatoryTable::fcc();
        assert!(matches!(
            ChannelDescriptor::compute(&reg, 5000, ChannelWidth::Bw20),
            Err(SapError::InvalidChannel { .. })
        ));
        assert!(ChannelDescriptor::compute(&reg, 5865, ChannelWidth::Bw20).is_err());
    }

    #[test]
    fn test_80p80() {
        let reg = StaticRegulatoryTable::fcc();
        let desc = ChannelDescriptor::compute_80p80(&reg, 5180, 5775).unwrap();
        assert_eq!(desc.width, ChannelWidth::Bw80P80);
        assert_eq!(desc.center_freq_seg0, Some(5210));
        assert_eq!(desc.center_freq_seg1, Some(5775));
        assert_eq!(desc.sub_channels().len(), 8);
        assert!(desc.is_consistent());

        // Adjacent second segment collapses to 80 MHz
        let adjacent = ChannelDescriptor::compute_80p80(&reg, 5180, 5290).unwrap();
        assert_eq!(adjacent.width, ChannelWidth::Bw80);
    }

    #[test]
    fn test_6ghz_groups() {
        let reg = StaticRegulatoryTable::new(DfsRegion::Fcc, Vec::new()).with_6ghz();
        let desc = ChannelDescriptor::compute(&reg, 5955, ChannelWidth::Bw320).unwrap();
        assert_eq!(desc.width, ChannelWidth::Bw320);
        assert_eq!(desc.sub_channels().len(), 16);
        assert_eq!(desc.center_freq_seg0, Some(6105));
    }

    #[test]
    fn test_puncture_pattern() {
        let reg = StaticRegulatoryTable::fcc();
        let desc = ChannelDescriptor::compute(&reg, 5180, ChannelWidth::Bw80).unwrap();
        assert_eq!(desc.puncture_pattern(|f| f == 5220), Some(0b0100));
        assert_eq!(desc.puncture_pattern(|f| f == 5180), None);
        assert_eq!(desc.puncture_pattern(|f| f == 5200 || f == 5220), None);

        let punctured = desc.with_puncture(0b0100).unwrap();
        assert_eq!(punctured.puncture_bitmap, 0b0100);
        assert!(desc.with_puncture(0b0001).is_err());
        assert!(desc.with_puncture(0b1_0000).is_err());
    }

    #[test]
    fn test_leakage_adjusted_channels() {
        let freqs = [5180, 5200, 5260, 5280, 5500, 5520];
        let clear = leakage_adjusted_channels(&freqs, ChannelWidth::Bw80, &[5300], 0);
        assert_eq!(clear, vec![5180, 5200, 5500, 5520]);

        let guarded = leakage_adjusted_channels(&freqs, ChannelWidth::Bw20, &[5280], 20);
        assert_eq!(guarded, vec![5180, 5200, 5500, 5520]);
    }
}
