//! Concurrency policy
//!
//! Decides whether an AP may come up (or move) on a channel while other
//! connections are active on the same radio. The decision is an explicit
//! table keyed by persona, force flag and concurrency state.

use serde::{Deserialize, Serialize};

use crate::backend::{ConcurrentConnection, ConnectionMode};
use crate::channel::{Band, ChannelDescriptor};
use crate::registry::Persona;
use crate::regulatory::RegulatoryTable;

/// How an AP reacts to a concurrent connection on another channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CcSwitchMode {
    /// Keep the configured channel (MCC allowed)
    Disable,
    /// Move onto the concurrent channel
    ForceWithoutDisconnection,
    /// Move onto the concurrent channel only when it is in the preferred list
    ForcePreferredWithoutDisconnection,
}

impl Default for CcSwitchMode {
    fn default() -> Self {
        CcSwitchMode::Disable
    }
}

/// SCC enforcement applied to P2P GO interfaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SccEnforcement {
    /// A user-forced channel wins over SCC
    Liberal,
    /// SCC wins over a user-forced channel
    Strict,
}

impl Default for SccEnforcement {
    fn default() -> Self {
        SccEnforcement::Liberal
    }
}

/// Relation between the requested channel and the concurrent one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConcurrencyState {
    /// No concurrent connection
    Alone,
    /// Concurrent connection on the requested primary channel
    SameChannel,
    /// Concurrent connection on another channel of the same band
    SameBandMcc,
    /// Concurrent connection on another band, hardware can run both
    CrossBandDbs,
    /// Concurrent connection on another band without DBS support
    CrossBandMcc,
}

/// Policy verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Keep the requested channel
    Proceed,
    /// Move onto the given channel instead
    MoveTo(ChannelDescriptor),
    /// Refuse the request
    Reject(&'static str),
}

/// Inputs to a policy evaluation
#[derive(Debug, Clone)]
pub struct PolicyInput {
    /// Interface persona
    pub persona: Persona,
    /// Channel explicitly forced by the user
    pub user_forced: bool,
    /// Interface concurrency switch mode
    pub cc_switch_mode: CcSwitchMode,
    /// Requested channel
    pub requested: ChannelDescriptor,
    /// Channel of the connection to share, from the concurrency manager
    pub concurrent: Option<ChannelDescriptor>,
    /// Other active connections
    pub connections: Vec<ConcurrentConnection>,
    /// Preferred channel list
    pub pcl: Vec<u32>,
    /// Hardware supports dual-band simultaneous operation
    pub dbs_capable: bool,
    /// STA+SAP SCC on a DFS channel is allowed
    pub scc_on_dfs_allowed: bool,
}

/// One row of the decision table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Keep,
    Follow,
    FollowOrReject,
}

/// Concurrency policy table
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyPolicy {
    go_enforcement: SccEnforcement,
}

impl ConcurrencyPolicy {
    /// Create new policy
    pub fn new(go_enforcement: SccEnforcement) -> Self {
        Self { go_enforcement }
    }

    /// GO enforcement mode
    pub fn go_enforcement(&self) -> SccEnforcement {
        self.go_enforcement
    }

    /// Classify the requested channel against the concurrent one
    pub fn classify(
        requested: &ChannelDescriptor,
        concurrent: Option<&ChannelDescriptor>,
        dbs_capable: bool,
    ) -> ConcurrencyState {
        let Some(concurrent) = concurrent else {
            return ConcurrencyState::Alone;
        };
        if concurrent.primary_freq == requested.primary_freq {
            ConcurrencyState::SameChannel
        } else if concurrent.band() == requested.band() {
            ConcurrencyState::SameBandMcc
        } else if dbs_capable {
            ConcurrencyState::CrossBandDbs
        } else {
            ConcurrencyState::CrossBandMcc
        }
    }

    /// Look up the table row; the flag marks combinations with no agreed
    /// product definition
    fn lookup(
        &self,
        persona: Persona,
        user_forced: bool,
        state: ConcurrencyState,
    ) -> (Action, bool) {
        use ConcurrencyState::*;
        match (persona, user_forced, state) {
            (_, _, Alone) | (_, _, SameChannel) | (_, _, CrossBandDbs) => (Action::Keep, false),
            (Persona::Sap, true, _) => (Action::Keep, false),
            (Persona::Sap, false, _) => (Action::Follow, false),
            (Persona::P2pGo, false, _) => (Action::Follow, false),
            (Persona::P2pGo, true, _) => match self.go_enforcement {
                SccEnforcement::Liberal => (Action::Keep, false),
                SccEnforcement::Strict => (Action::FollowOrReject, true),
            },
        }
    }

    /// Evaluate a start or non-strict switch request
    pub fn evaluate(&self, reg: &dyn RegulatoryTable, input: &PolicyInput) -> PolicyDecision {
        if let Some(target) = self.dfs_scc_override(reg, input) {
            log::info!("DFS SCC override: {} -> {}", input.requested, target);
            return PolicyDecision::MoveTo(target);
        }

        let state = Self::classify(&input.requested, input.concurrent.as_ref(), input.dbs_capable);
        let (action, ambiguous) = self.lookup(input.persona, input.user_forced, state);
        if ambiguous {
            log::warn!(
                "Ambiguous concurrency policy for {:?} forced={} state={:?}, applying {:?}",
                input.persona,
                input.user_forced,
                state,
                action
            );
        }

        let Some(concurrent) = input.concurrent else {
            return PolicyDecision::Proceed;
        };
        match action {
            Action::Keep => PolicyDecision::Proceed,
            Action::Follow | Action::FollowOrReject => {
                if input.cc_switch_mode == CcSwitchMode::Disable && action == Action::Follow {
                    return PolicyDecision::Proceed;
                }
                match self.followable(reg, input, &concurrent) {
                    Some(target) => PolicyDecision::MoveTo(target),
                    None if action == Action::FollowOrReject => {
                        PolicyDecision::Reject("GO must share the concurrent channel")
                    }
                    None => PolicyDecision::Proceed,
                }
            }
        }
    }

    /// Concurrent channel reshaped for this AP, if the AP may use it
    fn followable(
        &self,
        reg: &dyn RegulatoryTable,
        input: &PolicyInput,
        concurrent: &ChannelDescriptor,
    ) -> Option<ChannelDescriptor> {
        if concurrent.band() == Some(Band::Band6G) && input.requested.band() != Some(Band::Band6G) {
            return None;
        }
        if concurrent.is_dfs(reg) && !input.scc_on_dfs_allowed {
            return None;
        }
        if input.cc_switch_mode == CcSwitchMode::ForcePreferredWithoutDisconnection
            && !input.pcl.is_empty()
            && !input.pcl.contains(&concurrent.primary_freq)
        {
            return None;
        }
        let width = input.requested.width.clamp_to(concurrent.width);
        ChannelDescriptor::compute(reg, concurrent.primary_freq, width).ok()
    }

    /// A concurrent AP already on a DFS channel pulls a 5 GHz request, or any
    /// request on non-DBS hardware, onto its channel
    fn dfs_scc_override(
        &self,
        reg: &dyn RegulatoryTable,
        input: &PolicyInput,
    ) -> Option<ChannelDescriptor> {
        if input.user_forced {
            return None;
        }
        let peer = input
            .connections
            .iter()
            .find(|c| c.mode.is_beaconing() && c.channel.is_dfs(reg))?;
        if peer.channel.primary_freq == input.requested.primary_freq {
            return None;
        }
        if !(input.requested.is_5ghz() || !input.dbs_capable) {
            return None;
        }
        let width = input.requested.width.clamp_to(peer.channel.width);
        ChannelDescriptor::compute(reg, peer.channel.primary_freq, width).ok()
    }
}

/// Narrowest width imposed by client connections sharing `target`
pub fn co_channel_client_limit(
    connections: &[ConcurrentConnection],
    target: &ChannelDescriptor,
) -> Option<crate::channel::ChannelWidth> {
    connections
        .iter()
        .filter(|c| c.mode.is_client() && c.channel.primary_freq == target.primary_freq)
        .map(|c| c.channel.width)
        .min_by_key(|w| w.mhz())
}

/// Check if any station is connected
pub fn any_client_connected(connections: &[ConcurrentConnection]) -> bool {
    connections.iter().any(|c| c.mode == ConnectionMode::Sta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelWidth;
    use crate::regulatory::StaticRegulatoryTable;

    fn input(
        persona: Persona,
        forced: bool,
        requested: u32,
        concurrent: Option<u32>,
    ) -> PolicyInput {
        let reg = StaticRegulatoryTable::fcc();
        PolicyInput {
            persona,
            user_forced: forced,
            cc_switch_mode: CcSwitchMode::ForceWithoutDisconnection,
            requested: ChannelDescriptor::compute(&reg, requested, ChannelWidth::Bw20).unwrap(),
            concurrent: concurrent
                .map(|f| ChannelDescriptor::compute(&reg, f, ChannelWidth::Bw20).unwrap()),
            connections: Vec::new(),
            pcl: Vec::new(),
            dbs_capable: false,
            scc_on_dfs_allowed: false,
        }
    }

    #[test]
    fn test_classify() {
        let a = ChannelDescriptor::new_20(5180);
        let b = ChannelDescriptor::new_20(5200);
        let g = ChannelDescriptor::new_20(2437);
        assert_eq!(ConcurrencyPolicy::classify(&a, None, false), ConcurrencyState::Alone);
        assert_eq!(ConcurrencyPolicy::classify(&a, Some(&a), false), ConcurrencyState::SameChannel);
        assert_eq!(ConcurrencyPolicy::classify(&a, Some(&b), true), ConcurrencyState::SameBandMcc);
        assert_eq!(ConcurrencyPolicy::classify(&a, Some(&g), true), ConcurrencyState::CrossBandDbs);
        assert_eq!(
            ConcurrencyPolicy::classify(&a, Some(&g), false),
            ConcurrencyState::CrossBandMcc
        );
    }

    #[test]
    fn test_sap_table() {
        let reg = StaticRegulatoryTable::fcc();
        let policy = ConcurrencyPolicy::default();

        assert_eq!(
            policy.evaluate(&reg, &input(Persona::Sap, false, 5180, None)),
            PolicyDecision::Proceed
        );
        assert_eq!(
            policy.evaluate(&reg, &input(Persona::Sap, true, 5180, Some(5200))),
            PolicyDecision::Proceed
        );
        match policy.evaluate(&reg, &input(Persona::Sap, false, 5180, Some(5200))) {
            PolicyDecision::MoveTo(d) => assert_eq!(d.primary_freq, 5200),
            other => panic!("unexpected {:?}", other),
        }

        let mut disabled = input(Persona::Sap, false, 5180, Some(5200));
        disabled.cc_switch_mode = CcSwitchMode::Disable;
        assert_eq!(policy.evaluate(&reg, &disabled), PolicyDecision::Proceed);
    }

    #[test]
    fn test_go_enforcement() {
        let reg = StaticRegulatoryTable::fcc();
        let liberal = ConcurrencyPolicy::new(SccEnforcement::Liberal);
        let strict = ConcurrencyPolicy::new(SccEnforcement::Strict);

        let forced = input(Persona::P2pGo, true, 5180, Some(5200));
        assert_eq!(liberal.evaluate(&reg, &forced), PolicyDecision::Proceed);
        assert!(matches!(strict.evaluate(&reg, &forced), PolicyDecision::MoveTo(_)));

        // Concurrent channel is DFS and SCC on DFS is not allowed
        let blocked = input(Persona::P2pGo, true, 5180, Some(5500));
        assert!(matches!(strict.evaluate(&reg, &blocked), PolicyDecision::Reject(_)));
        assert_eq!(liberal.evaluate(&reg, &blocked), PolicyDecision::Proceed);
    }

    #[test]
    fn test_preferred_list_gate() {
        let reg = StaticRegulatoryTable::fcc();
        let policy = ConcurrencyPolicy::default();
        let mut req = input(Persona::Sap, false, 5180, Some(5200));
        req.cc_switch_mode = CcSwitchMode::ForcePreferredWithoutDisconnection;
        req.pcl = vec![5745];
        assert_eq!(policy.evaluate(&reg, &req), PolicyDecision::Proceed);
        req.pcl = vec![5200];
        assert!(matches!(policy.evaluate(&reg, &req), PolicyDecision::MoveTo(_)));
    }

    #[test]
    fn test_dfs_scc_override() {
        let reg = StaticRegulatoryTable::fcc();
        let policy = ConcurrencyPolicy::default();
        let mut req = input(Persona::Sap, false, 5180, None);
        req.cc_switch_mode = CcSwitchMode::Disable;
        req.connections.push(ConcurrentConnection {
            interface: None,
            mode: ConnectionMode::Sap,
            channel: ChannelDescriptor::compute(&reg, 5500, ChannelWidth::Bw80).unwrap(),
            indoor: false,
        });
        match policy.evaluate(&reg, &req) {
            PolicyDecision::MoveTo(d) => {
                assert_eq!(d.primary_freq, 5500);
                assert_eq!(d.width, ChannelWidth::Bw20);
            }
            other => panic!("unexpected {:?}", other),
        }
        req.user_forced = true;
        assert_eq!(policy.evaluate(&reg, &req), PolicyDecision::Proceed);
    }

    #[test]
    fn test_client_width_limit() {
        let reg = StaticRegulatoryTable::fcc();
        let sta = ConcurrentConnection {
            interface: None,
            mode: ConnectionMode::Sta,
            channel: ChannelDescriptor::compute(&reg, 2437, ChannelWidth::Bw40).unwrap(),
            indoor: true,
        };
        let target = ChannelDescriptor::new_20(2437);
        assert_eq!(co_channel_client_limit(&[sta.clone()], &target), Some(ChannelWidth::Bw40));
        assert_eq!(co_channel_client_limit(&[sta.clone()], &ChannelDescriptor::new_20(2412)), None);
        assert!(any_client_connected(&[sta]));
    }
}
