//! Channel-switch coordinator
//!
//! Validates a target channel against the avoid list, the NOL, regulatory
//! state and concurrency rules, and negotiates the hardware mode before the
//! state machine announces the switch to the firmware.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::backend::{ConcurrencyManager, HwModeResult};
use crate::channel::{ChannelDescriptor, ChannelWidth};
use crate::dfs::DfsManager;
use crate::policy::{
    any_client_connected, co_channel_client_limit, CcSwitchMode, ConcurrencyPolicy, PolicyDecision,
    PolicyInput,
};
use crate::registry::{InterfaceId, Persona};
use crate::regulatory::{ChannelState, RegulatoryTable};
use crate::{Result, SapError};

/// Why a channel switch happens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CsaReason {
    Unknown,
    /// Concurrent STA connected on a DFS channel, move to non-DFS
    StaConnectDfsToNonDfs,
    /// Host request
    UserInitiated,
    /// Peer requested the switch
    PeerActionFrame,
    /// Pre-CAC finished on the target
    PreCacSuccess,
    /// Concurrent STA moved
    ConcurrentStaChangedChannel,
    /// Operating channel entered the avoid list
    UnsafeChannel,
    /// LTE coexistence
    LteCoex,
    /// Concurrent NAN event
    ConcurrentNanEvent,
    /// Band restriction changed
    BandRestricted,
    /// Radar seen on the operating channel
    RadarDetected,
}

impl Default for CsaReason {
    fn default() -> Self {
        CsaReason::Unknown
    }
}

/// A channel switch request
#[derive(Debug, Clone)]
pub struct SwitchRequest {
    /// Requesting interface
    pub interface: InterfaceId,
    /// Interface persona
    pub persona: Persona,
    /// Target primary frequency
    pub freq: u32,
    /// Requested width
    pub width: ChannelWidth,
    /// User forced, skip SCC/MCC validation
    pub strict: bool,
    /// Interface concurrency switch mode
    pub cc_switch_mode: CcSwitchMode,
    /// Current operating channel
    pub current: Option<ChannelDescriptor>,
}

/// Channel-switch coordinator
pub struct ChannelSwitchCoordinator {
    regulatory: Arc<dyn RegulatoryTable>,
    concurrency: Arc<dyn ConcurrencyManager>,
    policy: ConcurrencyPolicy,
    coex_unsafe_override: bool,
}

impl ChannelSwitchCoordinator {
    /// Create new coordinator
    pub fn new(
        regulatory: Arc<dyn RegulatoryTable>,
        concurrency: Arc<dyn ConcurrencyManager>,
        policy: ConcurrencyPolicy,
        coex_unsafe_override: bool,
    ) -> Self {
        Self {
            regulatory,
            concurrency,
            policy,
            coex_unsafe_override,
        }
    }

    /// Concurrency policy
    pub fn policy(&self) -> &ConcurrencyPolicy {
        &self.policy
    }

    /// Check if an unsafe channel may be used anyway
    pub async fn unsafe_allowed(&self, interface: InterfaceId, strict: bool) -> bool {
        if !(strict && self.coex_unsafe_override) {
            return false;
        }
        let connections = self.concurrency.active_connections(interface).await;
        !any_client_connected(&connections)
    }

    /// Validate a switch request and return the descriptor to switch to
    ///
    /// Nothing is changed on failure.
    pub async fn validate(
        &self,
        request: &SwitchRequest,
        dfs: &DfsManager,
    ) -> Result<ChannelDescriptor> {
        let reg = self.regulatory.as_ref();

        if !self.concurrency.is_safe_channel(request.freq).await
            && !self.unsafe_allowed(request.interface, request.strict).await
        {
            return Err(SapError::invalid_channel(request.freq, "channel is on the avoid list"));
        }

        let connections = self.concurrency.active_connections(request.interface).await;
        match reg.channel_state(request.freq) {
            ChannelState::Enabled => {}
            ChannelState::Dfs => {
                let client_on_5g = connections
                    .iter()
                    .any(|c| c.mode.is_client() && c.channel.is_5ghz());
                if client_on_5g && !self.concurrency.sta_sap_scc_on_dfs_allowed() {
                    return Err(SapError::invalid_channel(
                        request.freq,
                        "DFS channel not allowed with an active 5 GHz client",
                    ));
                }
            }
            state => {
                return Err(SapError::invalid_channel(
                    request.freq,
                    format!("channel state {:?}", state),
                ));
            }
        }

        let mut width = request.width;
        let primary = ChannelDescriptor::new_20(request.freq);
        if let Some(limit) = co_channel_client_limit(&connections, &primary) {
            if limit.mhz() < width.mhz() {
                log::info!("Width clamped to {} by co-channel client", limit.name());
                width = limit;
            }
        }
        let mut target = ChannelDescriptor::compute(reg, request.freq, width)?;

        if !request.strict {
            let input = PolicyInput {
                persona: request.persona,
                user_forced: false,
                cc_switch_mode: request.cc_switch_mode,
                requested: target,
                concurrent: self
                    .concurrency
                    .get_concurrent_operating_channel(request.interface)
                    .await,
                connections,
                pcl: self.concurrency.preferred_channel_list(request.interface).await,
                dbs_capable: self.concurrency.is_dbs_capable(),
                scc_on_dfs_allowed: self.concurrency.sta_sap_scc_on_dfs_allowed(),
            };
            match self.policy.evaluate(reg, &input) {
                PolicyDecision::Proceed => {}
                PolicyDecision::MoveTo(desc) => {
                    log::info!("Switch target {} overridden to {}", target, desc);
                    target = desc;
                }
                PolicyDecision::Reject(reason) => {
                    return Err(SapError::ConcurrencyRejected(reason.to_string()));
                }
            }
        }

        if dfs.descriptor_in_nol(&target).await {
            return Err(SapError::invalid_channel(target.primary_freq, "channel is in the NOL"));
        }
        if request.current == Some(target) {
            return Err(SapError::AlreadyInState(request.interface));
        }
        Ok(target)
    }

    /// Ask the concurrency manager for the hardware mode the target needs
    ///
    /// Returns true when the change is pending.
    pub async fn request_hw_mode(
        &self,
        interface: InterfaceId,
        target: &ChannelDescriptor,
    ) -> Result<bool> {
        match self.concurrency.check_and_request_hw_mode(interface, target.primary_freq).await {
            HwModeResult::NotRequired => Ok(false),
            HwModeResult::RequestedAsync => {
                log::info!("Interface {} waits for hardware mode change to {}", interface, target);
                Ok(true)
            }
            HwModeResult::Failed => Err(SapError::ConcurrencyRejected(format!(
                "hardware mode change for {} MHz failed",
                target.primary_freq
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ConcurrentConnection, ConnectionMode};
    use crate::daemon::sim::StaticConcurrencyManager;
    use crate::dfs::DfsConfig;
    use crate::event::EventQueue;
    use crate::regulatory::StaticRegulatoryTable;

    fn setup(
        concurrency: StaticConcurrencyManager,
        coex_override: bool,
    ) -> (ChannelSwitchCoordinator, DfsManager, EventQueue) {
        let reg: Arc<dyn RegulatoryTable> = Arc::new(StaticRegulatoryTable::fcc());
        let queue = EventQueue::new();
        let dfs = DfsManager::new(DfsConfig::default(), Arc::clone(&reg), queue.sender());
        let coordinator = ChannelSwitchCoordinator::new(
            reg,
            Arc::new(concurrency),
            ConcurrencyPolicy::default(),
            coex_override,
        );
        (coordinator, dfs, queue)
    }

    fn request(freq: u32, width: ChannelWidth, strict: bool) -> SwitchRequest {
        SwitchRequest {
            interface: InterfaceId(0),
            persona: Persona::Sap,
            freq,
            width,
            strict,
            cc_switch_mode: CcSwitchMode::Disable,
            current: Some(ChannelDescriptor::new_20(5180)),
        }
    }

    #[tokio::test]
    async fn test_width_clamped_by_station() {
        let reg = StaticRegulatoryTable::fcc();
        let concurrency = StaticConcurrencyManager::new();
        concurrency.add_connection(ConcurrentConnection {
            interface: None,
            mode: ConnectionMode::Sta,
            channel: ChannelDescriptor::compute(&reg, 2437, ChannelWidth::Bw40).unwrap(),
            indoor: true,
        });
        let (coordinator, dfs, _queue) = setup(concurrency, false);

        let narrow = coordinator
            .validate(&request(2437, ChannelWidth::Bw20, false), &dfs)
            .await
            .unwrap();
        assert_eq!(narrow.width, ChannelWidth::Bw20);

        let wide = coordinator
            .validate(&request(2437, ChannelWidth::Bw80, false), &dfs)
            .await
            .unwrap();
        assert_eq!(wide.width, ChannelWidth::Bw40);
    }

    #[tokio::test]
    async fn test_unsafe_channel_rules() {
        let concurrency = StaticConcurrencyManager::new();
        concurrency.set_unsafe(&[5745]);
        let (coordinator, dfs, _queue) = setup(concurrency, true);
        assert!(matches!(
            coordinator.validate(&request(5745, ChannelWidth::Bw20, false), &dfs).await,
            Err(SapError::InvalidChannel { freq: 5745, .. })
        ));
        assert!(coordinator.validate(&request(5745, ChannelWidth::Bw20, true), &dfs).await.is_ok());

        let concurrency = StaticConcurrencyManager::new();
        concurrency.set_unsafe(&[5745]);
        let (coordinator, dfs, _queue) = setup(concurrency, false);
        assert!(coordinator
            .validate(&request(5745, ChannelWidth::Bw20, true), &dfs)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_nol_and_regulatory_rejection() {
        let (coordinator, dfs, _queue) = setup(StaticConcurrencyManager::new(), false);
        dfs.handle_radar(&[5500]).await;
        assert!(matches!(
            coordinator.validate(&request(5500, ChannelWidth::Bw20, true), &dfs).await,
            Err(SapError::InvalidChannel { freq: 5500, .. })
        ));
        assert!(matches!(
            coordinator.validate(&request(5900, ChannelWidth::Bw20, true), &dfs).await,
            Err(SapError::InvalidChannel { .. })
        ));
        assert!(matches!(
            coordinator.validate(&request(5180, ChannelWidth::Bw20, true), &dfs).await,
            Err(SapError::AlreadyInState(_))
        ));
    }

    #[tokio::test]
    async fn test_dfs_with_5g_station() {
        let reg = StaticRegulatoryTable::fcc();
        let concurrency = StaticConcurrencyManager::new();
        concurrency.add_connection(ConcurrentConnection {
            interface: None,
            mode: ConnectionMode::Sta,
            channel: ChannelDescriptor::compute(&reg, 5745, ChannelWidth::Bw20).unwrap(),
            indoor: false,
        });
        let (coordinator, dfs, _queue) = setup(concurrency, false);
        assert!(coordinator
            .validate(&request(5260, ChannelWidth::Bw20, true), &dfs)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_hw_mode_outcomes() {
        let concurrency = StaticConcurrencyManager::new();
        concurrency.set_hw_mode(5745, HwModeResult::RequestedAsync);
        concurrency.set_hw_mode(5180, HwModeResult::Failed);
        let (coordinator, _dfs, _queue) = setup(concurrency, false);
        assert!(coordinator
            .request_hw_mode(InterfaceId(0), &ChannelDescriptor::new_20(5745))
            .await
            .unwrap());
        assert!(!coordinator
            .request_hw_mode(InterfaceId(0), &ChannelDescriptor::new_20(5200))
            .await
            .unwrap());
        assert!(matches!(
            coordinator.request_hw_mode(InterfaceId(0), &ChannelDescriptor::new_20(5180)).await,
            Err(SapError::ConcurrencyRejected(_))
        ));
    }
}
