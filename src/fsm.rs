//! AP state machine
//!
//! Drives every AP interface through `Init -> Starting -> Started ->
//! Stopping -> Init`. All inputs, host requests and collaborator completions
//! alike, are `SapEvent`s handled one at a time by `dispatch` under the
//! target interface's lock. Host requests are dispatched inline so they can
//! return a synchronous result; everything else goes through the queue.
//!
//! Interfaces never touch each other's context. Work that concerns another
//! interface (CAC completion, radar fan-out) is posted to it as an event.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex, RwLock};
use uuid::Uuid;

use crate::acs::{AcsEngine, AcsInputs, AcsReason, AcsResult, ScanPlan};
use crate::backend::{
    BssParams, ConcurrencyManager, FirmwareChannel, ScanId, ScanResult, ScanService,
};
use crate::channel::{Band, ChannelDescriptor, ChannelWidth};
use crate::csa::{ChannelSwitchCoordinator, CsaReason, SwitchRequest};
use crate::dfs::{DfsConfig, DfsManager, RandomChannelParams};
use crate::event::{
    EventQueue, EventSender, NotificationBus, NotificationHandler, NotificationKind, QueuedEvent,
    SapEvent, SapNotification, StatusCode,
};
use crate::policy::{ConcurrencyPolicy, PolicyDecision, PolicyInput, SccEnforcement};
use crate::registry::{
    BandRestriction, CacFlags, ChannelSelection, InterfaceId, InterfaceRegistry, InterfaceSummary,
    PendingChannelChange, Persona, RadioContext, SapConfig, SapState, DEFAULT_MAX_INTERFACES,
};
use crate::regulatory::RegulatoryTable;
use crate::{Result, SapError, DEFAULT_2G_CHANNEL_FREQ};

/// State machine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Firmware acknowledgement timeout (ms)
    pub firmware_timeout_ms: u64,
    /// Maximum number of AP interfaces
    pub max_interfaces: usize,
    /// DFS settings
    pub dfs: DfsConfig,
    /// A user-forced channel may sit on the avoid list when no station is connected
    pub coex_unsafe_override: bool,
    /// SCC enforcement for P2P GO interfaces
    pub go_scc_enforcement: SccEnforcement,
    /// 2.4 GHz channel used when a band restriction moves an AP off 5 GHz
    pub restricted_2g_freq: u32,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            firmware_timeout_ms: 5_000,
            max_interfaces: DEFAULT_MAX_INTERFACES,
            dfs: DfsConfig::default(),
            coex_unsafe_override: false,
            go_scc_enforcement: SccEnforcement::Liberal,
            restricted_2g_freq: DEFAULT_2G_CHANNEL_FREQ,
        }
    }
}

/// AP state machine
pub struct ApStateMachine {
    config: MachineConfig,
    registry: RwLock<InterfaceRegistry>,
    regulatory: Arc<dyn RegulatoryTable>,
    scan: Arc<dyn ScanService>,
    concurrency: Arc<dyn ConcurrencyManager>,
    firmware: Arc<dyn FirmwareChannel>,
    dfs: DfsManager,
    acs: AcsEngine,
    coordinator: ChannelSwitchCoordinator,
    queue: EventQueue,
    notifications: NotificationBus,
}

impl std::fmt::Debug for ApStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApStateMachine")
            .field("config", &self.config)
            .field("dfs", &self.dfs)
            .field("queue", &self.queue)
            .finish()
    }
}

fn status_of(error: &SapError) -> StatusCode {
    match error {
        SapError::Timeout(_) => StatusCode::Timeout,
        SapError::ConcurrencyRejected(_)
        | SapError::RegulatoryViolation(_)
        | SapError::InvalidChannel { .. } => StatusCode::Rejected,
        _ => StatusCode::Failure,
    }
}

fn millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

/// Treat `AlreadyInState` as success
fn accept(result: Result<()>) -> Result<()> {
    match result {
        Err(SapError::AlreadyInState(id)) => {
            log::debug!("Interface {} already in requested state", id);
            Ok(())
        }
        other => other,
    }
}

fn band_allows(restriction: BandRestriction, freq: u32) -> bool {
    match restriction {
        BandRestriction::All => true,
        BandRestriction::Only2G => Band::from_freq(freq) == Some(Band::Band2G),
        BandRestriction::Only5G => Band::from_freq(freq) == Some(Band::Band5G),
    }
}

impl ApStateMachine {
    /// Create new state machine
    ///
    /// `queue` must be the queue the collaborators post their completions to.
    pub fn new(
        config: MachineConfig,
        regulatory: Arc<dyn RegulatoryTable>,
        scan: Arc<dyn ScanService>,
        concurrency: Arc<dyn ConcurrencyManager>,
        firmware: Arc<dyn FirmwareChannel>,
        queue: EventQueue,
    ) -> Self {
        let dfs = DfsManager::new(config.dfs.clone(), Arc::clone(&regulatory), queue.sender());
        let acs = AcsEngine::new(Arc::clone(&regulatory));
        let coordinator = ChannelSwitchCoordinator::new(
            Arc::clone(&regulatory),
            Arc::clone(&concurrency),
            ConcurrencyPolicy::new(config.go_scc_enforcement),
            config.coex_unsafe_override,
        );
        Self {
            registry: RwLock::new(InterfaceRegistry::new(config.max_interfaces)),
            config,
            regulatory,
            scan,
            concurrency,
            firmware,
            dfs,
            acs,
            coordinator,
            queue,
            notifications: NotificationBus::new(),
        }
    }

    /// Get configuration
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// DFS/CAC manager
    pub fn dfs(&self) -> &DfsManager {
        &self.dfs
    }

    /// ACS engine
    pub fn acs(&self) -> &AcsEngine {
        &self.acs
    }

    /// Notification bus
    pub fn notifications(&self) -> &NotificationBus {
        &self.notifications
    }

    /// Register a notification handler
    pub async fn add_notification_handler(&self, handler: Arc<dyn NotificationHandler>) {
        self.notifications.add_handler(handler).await;
    }

    /// Sender for posting events into this machine's queue
    pub fn sender(&self) -> EventSender {
        self.queue.sender()
    }

    /// Event processing statistics
    pub async fn event_stats(&self) -> crate::event::EventStats {
        self.queue.get_stats().await
    }

    // ---- interface lifecycle ----

    /// Register an AP interface
    pub async fn open_interface(
        &self,
        id: InterfaceId,
        mac: [u8; 6],
        persona: Persona,
    ) -> Result<()> {
        self.registry.write().await.open(id, mac, persona)?;
        Ok(())
    }

    /// Unregister an AP interface, which must be stopped
    pub async fn close_interface(&self, id: InterfaceId) -> Result<()> {
        let last_5g = self.registry.write().await.close(id)?;
        if last_5g {
            self.dfs.reset().await;
        }
        Ok(())
    }

    // ---- host requests ----

    /// Start the BSS on an interface
    pub async fn start(&self, id: InterfaceId, config: SapConfig) -> Result<()> {
        accept(self.dispatch(id, SapEvent::StartRequest(Box::new(config))).await)
    }

    /// Stop the BSS on an interface
    pub async fn stop(&self, id: InterfaceId) -> Result<()> {
        accept(self.dispatch(id, SapEvent::StopRequest).await)
    }

    /// Move a running interface to another channel
    pub async fn request_channel_change(
        &self,
        id: InterfaceId,
        freq: u32,
        width: ChannelWidth,
        strict: bool,
    ) -> Result<()> {
        let event = SapEvent::ChannelChangeRequest {
            freq,
            width,
            strict,
        };
        accept(self.dispatch(id, event).await)
    }

    /// Apply a band restriction to an interface
    pub async fn set_band_restriction(
        &self,
        id: InterfaceId,
        restriction: BandRestriction,
    ) -> Result<()> {
        accept(self.dispatch(id, SapEvent::BandRestrictionChanged(restriction)).await)
    }

    // ---- collaborator callbacks ----

    /// Scan service completion
    pub fn on_scan_complete(
        &self,
        id: InterfaceId,
        scan_id: ScanId,
        results: Vec<ScanResult>,
    ) -> Result<()> {
        self.post(id, SapEvent::ScanComplete { scan_id, results })
    }

    /// Scan service failure
    pub fn on_scan_failed(&self, id: InterfaceId, scan_id: ScanId, reason: &str) -> Result<()> {
        self.post(
            id,
            SapEvent::ScanFailed {
                scan_id,
                reason: reason.to_string(),
            },
        )
    }

    /// Firmware BSS start completion
    pub fn on_bss_start_complete(
        &self,
        id: InterfaceId,
        success: bool,
        reason: Option<String>,
    ) -> Result<()> {
        let event = if success {
            SapEvent::BssStartSuccess
        } else {
            SapEvent::BssStartFailure {
                reason: reason.unwrap_or_else(|| "unspecified".to_string()),
            }
        };
        self.post(id, event)
    }

    /// Firmware BSS stop completion
    pub fn on_stop_complete(&self, id: InterfaceId) -> Result<()> {
        self.post(id, SapEvent::ReadyForConnections)
    }

    /// Firmware channel switch completion
    pub fn on_channel_switch_complete(
        &self,
        id: InterfaceId,
        outcome: std::result::Result<ChannelDescriptor, String>,
    ) -> Result<()> {
        let event = match outcome {
            Ok(channel) => SapEvent::ChannelSwitchComplete { channel },
            Err(reason) => SapEvent::ChannelSwitchFailed { reason },
        };
        self.post(id, event)
    }

    /// Concurrency manager hardware mode completion
    pub fn on_hw_mode_change_complete(&self, id: InterfaceId, success: bool) -> Result<()> {
        self.post(id, SapEvent::HwModeChangeComplete { success })
    }

    /// Radar reported by the PHY of an interface
    pub fn on_radar_indication(&self, id: InterfaceId, freqs: Vec<u32>) -> Result<()> {
        self.post(id, SapEvent::RadarIndication { freqs })
    }

    /// Ask an interface to re-check its channel against the avoid list
    pub fn check_channel_safety(&self, id: InterfaceId) -> Result<()> {
        self.post(id, SapEvent::ChannelSafetyCheck)
    }

    /// Post an event for an interface
    pub fn post(&self, id: InterfaceId, event: SapEvent) -> Result<()> {
        self.queue.sender().post(id, event)
    }

    // ---- queries ----

    /// Current state of an interface
    pub async fn state(&self, id: InterfaceId) -> Result<SapState> {
        Ok(self.context_handle(id).await?.lock().await.state)
    }

    /// Operating channel of an interface
    pub async fn channel(&self, id: InterfaceId) -> Result<Option<ChannelDescriptor>> {
        Ok(self.context_handle(id).await?.lock().await.channel)
    }

    /// Snapshot of an interface context
    pub async fn context(&self, id: InterfaceId) -> Result<RadioContext> {
        Ok(self.context_handle(id).await?.lock().await.clone())
    }

    /// Published summaries of every interface
    pub async fn summaries(&self) -> Vec<InterfaceSummary> {
        self.registry.read().await.summaries()
    }

    /// Number of interfaces holding a 5 GHz reference
    pub async fn five_ghz_users(&self) -> usize {
        self.registry.read().await.five_ghz_user_count()
    }

    // ---- event loop ----

    /// Handle every queued event, including events posted while handling
    pub async fn process_events(&self) -> usize {
        let mut handled = 0;
        while let Some(queued) = self.queue.try_next().await {
            self.handle_queued(queued).await;
            handled += 1;
        }
        handled
    }

    /// Handle events until `shutdown` fires
    pub async fn run(&self, mut shutdown: oneshot::Receiver<()>) -> Result<()> {
        log::info!("AP state machine running");
        loop {
            tokio::select! {
                queued = self.queue.next() => match queued {
                    Some(queued) => self.handle_queued(queued).await,
                    None => break,
                },
                _ = &mut shutdown => {
                    log::info!("AP state machine shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn handle_queued(&self, queued: QueuedEvent) {
        let start = Instant::now();
        let result = self.dispatch(queued.interface, queued.event.clone()).await;
        let success = matches!(result, Ok(()) | Err(SapError::AlreadyInState(_)));
        if let Err(e) = &result {
            if !success {
                log::warn!("Event {} for {} failed: {}", queued.event.name(), queued.interface, e);
            }
        }
        self.queue.record(&queued.event, start.elapsed(), success).await;
    }

    async fn context_handle(&self, id: InterfaceId) -> Result<Arc<Mutex<RadioContext>>> {
        self.registry.read().await.get(id)
    }

    /// Handle one event to completion under the interface lock
    async fn dispatch(&self, id: InterfaceId, event: SapEvent) -> Result<()> {
        let handle = self.context_handle(id).await?;
        let mut ctx = handle.lock().await;
        log::debug!("Interface {} handling {} in {:?}", id, event.name(), ctx.state);

        let result = match event {
            SapEvent::StartRequest(config) => self.on_start_request(&mut ctx, *config).await,
            SapEvent::StopRequest => self.on_stop_request(&mut ctx).await,
            SapEvent::ChannelChangeRequest { freq, width, strict } => {
                self.on_channel_change_request(&mut ctx, freq, width, strict).await
            }
            SapEvent::BandRestrictionChanged(restriction) => {
                self.on_band_restriction(&mut ctx, restriction).await
            }
            SapEvent::BssStartSuccess => self.on_bss_start_success(&mut ctx).await,
            SapEvent::BssStartFailure { reason } => {
                self.on_bss_start_failure(&mut ctx, reason).await
            }
            SapEvent::ReadyForConnections => self.on_ready_for_connections(&mut ctx).await,
            SapEvent::ScanComplete { scan_id, results } => {
                self.on_scan_outcome(&mut ctx, scan_id, Ok(results)).await
            }
            SapEvent::ScanFailed { scan_id, reason } => {
                self.on_scan_outcome(&mut ctx, scan_id, Err(reason)).await
            }
            SapEvent::CacTimerExpired { timer_id } => {
                self.on_cac_timer_expired(&mut ctx, timer_id).await
            }
            SapEvent::CacComplete { timer_id } => self.on_cac_complete(&mut ctx, timer_id).await,
            SapEvent::RadarIndication { freqs } => self.on_radar_reported(&mut ctx, freqs).await,
            SapEvent::RadarOnChannel { freqs } => self.on_radar_on_channel(&mut ctx, freqs).await,
            SapEvent::ChannelSwitchComplete { channel } => {
                self.on_switch_complete(&mut ctx, channel).await
            }
            SapEvent::ChannelSwitchFailed { reason } => {
                self.on_switch_failed(&mut ctx, reason).await
            }
            SapEvent::HwModeChangeComplete { success } => {
                self.on_hw_mode_complete(&mut ctx, success).await
            }
            SapEvent::ChannelSafetyCheck => self.on_channel_safety_check(&mut ctx).await,
        };

        self.registry.write().await.publish(ctx.summary());
        result
    }

    // ---- helpers ----

    async fn notify(
        &self,
        kind: NotificationKind,
        id: InterfaceId,
        channel: Option<ChannelDescriptor>,
        status: StatusCode,
    ) {
        self.notifications
            .notify(SapNotification::new(kind, id, channel, status))
            .await;
    }

    async fn notify_failure(
        &self,
        kind: NotificationKind,
        id: InterfaceId,
        channel: Option<ChannelDescriptor>,
        status: StatusCode,
        reason: &str,
    ) {
        self.notifications
            .notify(SapNotification::new(kind, id, channel, status).with_reason(reason))
            .await;
    }

    /// Await a firmware acknowledgement within the configured timeout
    async fn firmware_ack<F>(&self, command: &str, ack: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        let timeout = Duration::from_millis(self.config.firmware_timeout_ms);
        match tokio::time::timeout(timeout, ack).await {
            Ok(result) => result,
            Err(_) => Err(SapError::Timeout(format!("firmware {} ack", command))),
        }
    }

    async fn client_on_channel(&self, id: InterfaceId, channel: &ChannelDescriptor) -> bool {
        self.concurrency
            .active_connections(id)
            .await
            .iter()
            .any(|c| c.mode.is_client() && c.channel.primary_freq == channel.primary_freq)
    }

    async fn cac_required(&self, ctx: &RadioContext, channel: &ChannelDescriptor) -> bool {
        let client = self.client_on_channel(ctx.id, channel).await;
        self.dfs.is_cac_required(channel, ctx.config.ignore_cac, client).await
    }

    async fn unsafe_channels(&self) -> Vec<u32> {
        let mut avoid = Vec::new();
        for freq in self.regulatory.channel_list() {
            if !self.concurrency.is_safe_channel(freq).await {
                avoid.push(freq);
            }
        }
        avoid
    }

    async fn acquire_5g(&self, id: InterfaceId, channel: &ChannelDescriptor) {
        if channel.is_5ghz() {
            self.registry.write().await.acquire_5g(id);
        }
    }

    async fn release_5g(&self, id: InterfaceId) {
        let last = self.registry.write().await.release_5g(id);
        if last {
            log::info!("No 5 GHz AP left, resetting regulatory state");
            self.dfs.reset().await;
        }
    }

    /// Narrow `channel` until no sub-channel sits in the NOL
    async fn off_nol(&self, channel: ChannelDescriptor) -> Option<ChannelDescriptor> {
        let nol = self.dfs.nol_freqs().await;
        if nol.contains(&channel.primary_freq) {
            return None;
        }
        let mut candidate = channel;
        while candidate.sub_channels().iter().any(|f| nol.contains(f)) {
            let width = candidate.width.narrower()?;
            candidate = ChannelDescriptor::compute(
                self.regulatory.as_ref(),
                channel.primary_freq,
                width,
            )
            .ok()?;
        }
        Some(candidate)
    }

    async fn start_policy(
        &self,
        id: InterfaceId,
        persona: Persona,
        config: &SapConfig,
        requested: ChannelDescriptor,
    ) -> Result<ChannelDescriptor> {
        let input = PolicyInput {
            persona,
            user_forced: config.user_forced,
            cc_switch_mode: config.cc_switch_mode,
            requested,
            concurrent: self.concurrency.get_concurrent_operating_channel(id).await,
            connections: self.concurrency.active_connections(id).await,
            pcl: self.concurrency.preferred_channel_list(id).await,
            dbs_capable: self.concurrency.is_dbs_capable(),
            scc_on_dfs_allowed: self.concurrency.sta_sap_scc_on_dfs_allowed(),
        };
        match self.coordinator.policy().evaluate(self.regulatory.as_ref(), &input) {
            PolicyDecision::Proceed => Ok(requested),
            PolicyDecision::MoveTo(target) => match self.off_nol(target).await {
                Some(target) => {
                    log::info!(
                        "Interface {} start moved {} -> {} by concurrency policy",
                        id,
                        requested,
                        target
                    );
                    Ok(target)
                }
                None => {
                    log::warn!(
                        "Concurrency target {} is in the NOL, keeping {}",
                        target,
                        requested
                    );
                    Ok(requested)
                }
            },
            PolicyDecision::Reject(reason) => {
                Err(SapError::ConcurrencyRejected(reason.to_string()))
            }
        }
    }

    /// Return a failed start to `Init`, stopping the firmware BSS if it is up
    async fn abort_start(
        &self,
        ctx: &mut RadioContext,
        kind: NotificationKind,
        status: StatusCode,
        reason: &str,
        bss_up: bool,
    ) {
        log::warn!("Interface {} start aborted: {}", ctx.id, reason);
        if ctx.cac.waiting {
            self.release_cac(ctx).await;
        }
        if bss_up {
            if let Err(e) = self.firmware_ack("stop_bss", self.firmware.stop_bss(ctx.id)).await {
                log::warn!("Interface {} stop after failed start: {}", ctx.id, e);
            }
        }
        let channel = ctx.channel.take();
        ctx.reset_transients();
        ctx.set_state(SapState::Init);
        self.release_5g(ctx.id).await;
        self.notify_failure(kind, ctx.id, channel, status, reason).await;
    }

    /// Leave the CAC wait, stopping the shared timer when nobody else waits
    async fn release_cac(&self, ctx: &mut RadioContext) {
        let next_waiter = {
            let registry = self.registry.read().await;
            registry
                .peers_of(ctx.id)
                .into_iter()
                .find(|peer| {
                    peer.cac_waiting
                        && match (peer.channel, ctx.channel) {
                            (Some(a), Some(b)) => a.overlaps(&b),
                            _ => false,
                        }
                })
                .map(|peer| peer.id)
        };
        if let (Some(next), Some(timer_id)) = (next_waiter, ctx.cac.timer_id) {
            self.dfs.hand_over_cac(timer_id, ctx.id, next).await;
        }
        if next_waiter.is_none() {
            if let (Some(channel), Some(started_at), Some(duration)) =
                (ctx.channel, ctx.cac.started_at, ctx.cac.duration)
            {
                self.dfs.credit_interrupted_cac(&channel, started_at, duration).await;
            }
            let running = self.dfs.running_cac().await.map(|(id, _)| id);
            if running.is_some() && running == ctx.cac.timer_id {
                self.dfs.stop_cac_timer().await;
            }
        }
        ctx.cac = CacFlags::default();
    }

    // ---- start ----

    async fn on_start_request(&self, ctx: &mut RadioContext, config: SapConfig) -> Result<()> {
        match ctx.state {
            SapState::Init => {}
            SapState::Starting | SapState::Started => return Err(SapError::AlreadyInState(ctx.id)),
            SapState::Stopping => {
                return Err(SapError::InvalidState(format!("Interface {} is stopping", ctx.id)));
            }
        }
        ctx.reset_transients();
        match config.channel {
            ChannelSelection::Fixed { freq } => self.start_fixed(ctx, config, freq).await,
            ChannelSelection::Auto => self.start_acs(ctx, config).await,
        }
    }

    async fn reject_start(&self, id: InterfaceId, error: SapError) -> SapError {
        log::warn!("Interface {} start rejected: {}", id, error);
        self.notify_failure(
            NotificationKind::BssStartFailed,
            id,
            None,
            status_of(&error),
            &error.to_string(),
        )
        .await;
        error
    }

    async fn start_fixed(
        &self,
        ctx: &mut RadioContext,
        config: SapConfig,
        freq: u32,
    ) -> Result<()> {
        if !band_allows(ctx.band_restriction, freq) {
            let error = SapError::invalid_channel(freq, "outside the allowed band");
            return Err(self.reject_start(ctx.id, error).await);
        }
        let reg = self.regulatory.as_ref();
        let computed = match (config.width, config.seg1_center) {
            (ChannelWidth::Bw80P80, Some(seg1)) => {
                ChannelDescriptor::compute_80p80(reg, freq, seg1)
            }
            (width, _) => ChannelDescriptor::compute(reg, freq, width),
        };
        let requested = match computed {
            Ok(desc) => desc,
            Err(e) => return Err(self.reject_start(ctx.id, e).await),
        };
        let requested = match self.off_nol(requested).await {
            Some(desc) => desc,
            None => {
                let error = SapError::invalid_channel(freq, "channel is in the NOL");
                return Err(self.reject_start(ctx.id, error).await);
            }
        };
        if !self.concurrency.is_safe_channel(freq).await
            && !self.coordinator.unsafe_allowed(ctx.id, config.user_forced).await
        {
            let error = SapError::invalid_channel(freq, "channel is on the avoid list");
            return Err(self.reject_start(ctx.id, error).await);
        }
        let channel = match self.start_policy(ctx.id, ctx.persona, &config, requested).await {
            Ok(channel) => channel,
            Err(e) => return Err(self.reject_start(ctx.id, e).await),
        };

        ctx.config = config;
        ctx.set_state(SapState::Starting);
        self.begin_bss(ctx, channel).await
    }

    async fn acs_inputs(&self, id: InterfaceId) -> AcsInputs {
        let nol = self.dfs.nol_freqs().await;
        let unsafe_channels = self.unsafe_channels().await;
        let peers_active = {
            let registry = self.registry.read().await;
            registry.peers_of(id).iter().any(|p| p.state != SapState::Init)
        };
        let alone = !peers_active && self.concurrency.active_connections(id).await.is_empty();
        let pcl = if alone {
            None
        } else {
            Some(self.concurrency.preferred_channel_list(id).await)
        };
        AcsInputs {
            nol,
            unsafe_channels,
            pcl,
        }
    }

    async fn start_acs(&self, ctx: &mut RadioContext, config: SapConfig) -> Result<()> {
        let mut acs_config = config.acs.clone();
        match ctx.band_restriction {
            BandRestriction::All => {}
            BandRestriction::Only2G => acs_config.hw_mode = crate::acs::AcsHwMode::Band2G,
            BandRestriction::Only5G => acs_config.hw_mode = crate::acs::AcsHwMode::Band5G,
        }
        let inputs = self.acs_inputs(ctx.id).await;
        let candidates = match self.acs.build_candidates(&acs_config, config.width, &inputs) {
            Ok(candidates) => candidates,
            Err(e) => {
                log::warn!("Interface {} ACS failed: {}", ctx.id, e);
                self.notify_failure(
                    NotificationKind::NoChannelAvailable,
                    ctx.id,
                    None,
                    StatusCode::Failure,
                    &e.to_string(),
                )
                .await;
                return Err(e);
            }
        };

        ctx.config = config;
        ctx.set_state(SapState::Starting);
        match self.acs.scan_plan(&candidates, ctx.config.acs.scan_ageout_ms).await {
            ScanPlan::Fresh => {
                let results = self.acs.cached_results(&candidates).await;
                let result = self
                    .acs
                    .select(
                        &candidates,
                        &results,
                        ctx.config.acs.bss_penalty,
                        AcsReason::ScanSkippedRecent,
                    );
                self.finish_acs(ctx, result).await
            }
            ScanPlan::Scan(freqs) => match self.scan.issue_scan(ctx.id, &freqs).await {
                Ok(scan_id) => {
                    log::info!(
                        "Interface {} ACS scan {} over {} channels",
                        ctx.id,
                        scan_id,
                        freqs.len()
                    );
                    ctx.pending_scan = Some(scan_id);
                    ctx.acs_candidates = candidates;
                    Ok(())
                }
                Err(e) => {
                    log::warn!("Interface {} ACS scan not issued: {}", ctx.id, e);
                    let result = self.acs.default_selection(&candidates);
                    self.finish_acs(ctx, result).await
                }
            },
        }
    }

    async fn on_scan_outcome(
        &self,
        ctx: &mut RadioContext,
        scan_id: ScanId,
        outcome: std::result::Result<Vec<ScanResult>, String>,
    ) -> Result<()> {
        if ctx.state != SapState::Starting || ctx.pending_scan != Some(scan_id) {
            log::debug!("Interface {} ignoring stale scan {}", ctx.id, scan_id);
            return Ok(());
        }
        ctx.pending_scan = None;
        let candidates = std::mem::take(&mut ctx.acs_candidates);
        let result = match outcome {
            Ok(results) => {
                self.acs.record_scan(&results).await;
                let all = self.acs.cached_results(&candidates).await;
                self.acs
                    .select(&candidates, &all, ctx.config.acs.bss_penalty, AcsReason::Scanned)
            }
            Err(reason) => {
                log::warn!("Interface {} ACS scan failed: {}", ctx.id, reason);
                self.acs.default_selection(&candidates)
            }
        };
        self.finish_acs(ctx, result).await
    }

    async fn finish_acs(&self, ctx: &mut RadioContext, result: Result<AcsResult>) -> Result<()> {
        let result = match result {
            Ok(result) => result,
            Err(e) => {
                self.abort_start(
                    ctx,
                    NotificationKind::NoChannelAvailable,
                    StatusCode::Failure,
                    &e.to_string(),
                    false,
                )
                .await;
                return Err(e);
            }
        };
        log::info!(
            "Interface {} ACS chose {} ({:?})",
            ctx.id,
            result.selected,
            result.reason
        );
        let channel = match self
            .start_policy(ctx.id, ctx.persona, &ctx.config, result.selected)
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                self.abort_start(
                    ctx,
                    NotificationKind::BssStartFailed,
                    status_of(&e),
                    &e.to_string(),
                    false,
                )
                .await;
                return Err(e);
            }
        };
        self.begin_bss(ctx, channel).await
    }

    async fn begin_bss(&self, ctx: &mut RadioContext, channel: ChannelDescriptor) -> Result<()> {
        match self.coordinator.request_hw_mode(ctx.id, &channel).await {
            Ok(false) => self.issue_start_bss(ctx, channel).await,
            Ok(true) => {
                ctx.pending_change = Some(PendingChannelChange {
                    id: Uuid::new_v4(),
                    target: channel,
                    reason: CsaReason::Unknown,
                    hw_mode_pending: true,
                    cac_duration_ms: 0,
                    requested_at: Utc::now(),
                });
                Ok(())
            }
            Err(e) => {
                self.abort_start(
                    ctx,
                    NotificationKind::BssStartFailed,
                    status_of(&e),
                    &e.to_string(),
                    false,
                )
                .await;
                Err(e)
            }
        }
    }

    async fn issue_start_bss(
        &self,
        ctx: &mut RadioContext,
        channel: ChannelDescriptor,
    ) -> Result<()> {
        ctx.channel = Some(channel);
        self.acquire_5g(ctx.id, &channel).await;
        let cac_duration_ms = if self.cac_required(ctx, &channel).await {
            millis(self.dfs.cac_duration(&channel))
        } else {
            0
        };
        let params = BssParams {
            interface: ctx.id,
            bssid: ctx.mac,
            ssid: ctx.config.ssid.clone(),
            persona: ctx.persona,
            channel,
            cac_duration_ms,
            beacon_interval: ctx.config.beacon_interval,
        };
        if let Err(e) = self.firmware_ack("start_bss", self.firmware.start_bss(&params)).await {
            let bss_up = matches!(e, SapError::Timeout(_));
            self.abort_start(
                ctx,
                NotificationKind::BssStartFailed,
                status_of(&e),
                &e.to_string(),
                bss_up,
            )
            .await;
            return Err(e);
        }
        log::info!(
            "Interface {} BSS start issued on {} (CAC {} ms)",
            ctx.id,
            channel,
            cac_duration_ms
        );
        Ok(())
    }

    async fn on_bss_start_success(&self, ctx: &mut RadioContext) -> Result<()> {
        if ctx.state != SapState::Starting || ctx.cac.waiting || ctx.pending_change.is_some() {
            log::debug!("Interface {} ignoring BSS start completion in {:?}", ctx.id, ctx.state);
            return Ok(());
        }
        let channel = match ctx.channel {
            Some(channel) => channel,
            None => return Ok(()),
        };
        if self.cac_required(ctx, &channel).await {
            self.enter_cac(ctx, channel).await
        } else {
            self.start_beaconing(ctx).await
        }
    }

    async fn on_bss_start_failure(&self, ctx: &mut RadioContext, reason: String) -> Result<()> {
        if ctx.state != SapState::Starting {
            log::debug!("Interface {} ignoring BSS start failure in {:?}", ctx.id, ctx.state);
            return Ok(());
        }
        self.abort_start(ctx, NotificationKind::BssStartFailed, StatusCode::Failure, &reason, false)
            .await;
        Ok(())
    }

    // ---- CAC ----

    async fn enter_cac(&self, ctx: &mut RadioContext, channel: ChannelDescriptor) -> Result<()> {
        let after_switch = ctx.cac.after_switch;
        let kind = if after_switch {
            NotificationKind::ChannelChangeFailed
        } else {
            NotificationKind::BssStartFailed
        };
        let duration = self.dfs.cac_duration(&channel);
        let start = match self.dfs.start_cac(ctx.id, channel, duration).await {
            Ok(start) => start,
            Err(e) => {
                self.abort_start(ctx, kind, status_of(&e), &e.to_string(), true).await;
                return Err(e);
            }
        };
        let timer_id = match start.timer_id() {
            Some(timer_id) => timer_id,
            None => return self.start_beaconing(ctx).await,
        };
        ctx.cac = CacFlags {
            waiting: true,
            start_notified: true,
            end_notified: false,
            started_at: Some(Utc::now()),
            duration: Some(duration),
            timer_id: Some(timer_id),
            after_switch,
        };
        ctx.set_state(SapState::Starting);
        self.notify(NotificationKind::CacStarted, ctx.id, Some(channel), StatusCode::Success)
            .await;
        Ok(())
    }

    async fn on_cac_timer_expired(&self, ctx: &mut RadioContext, timer_id: Uuid) -> Result<()> {
        let channel = match self.dfs.on_cac_timer_expiry(timer_id).await {
            Some(channel) => channel,
            None => return Ok(()),
        };
        let waiting: Vec<InterfaceId> = {
            let registry = self.registry.read().await;
            registry
                .summaries()
                .into_iter()
                .filter(|s| s.cac_waiting)
                .map(|s| s.id)
                .collect()
        };
        let reported = if ctx.cac.waiting {
            Some(ctx.id)
        } else {
            waiting.first().copied()
        };
        if let Some(id) = reported {
            self.notify(NotificationKind::CacEnded, id, Some(channel), StatusCode::Success)
                .await;
        }
        for id in waiting {
            self.post(id, SapEvent::CacComplete { timer_id })?;
        }
        Ok(())
    }

    async fn on_cac_complete(&self, ctx: &mut RadioContext, timer_id: Uuid) -> Result<()> {
        if !ctx.cac.waiting || ctx.cac.timer_id != Some(timer_id) {
            log::debug!("Interface {} ignoring CAC completion {}", ctx.id, timer_id);
            return Ok(());
        }
        ctx.cac.waiting = false;
        ctx.cac.end_notified = true;
        ctx.cac.timer_id = None;
        if ctx.state != SapState::Starting {
            return Ok(());
        }
        self.start_beaconing(ctx).await
    }

    async fn start_beaconing(&self, ctx: &mut RadioContext) -> Result<()> {
        let after_switch = ctx.cac.after_switch;
        let kind = if after_switch {
            NotificationKind::ChannelChangeFailed
        } else {
            NotificationKind::BssStartFailed
        };
        let channel = ctx
            .channel
            .ok_or_else(|| SapError::InvalidState(format!("Interface {} has no channel", ctx.id)))?;
        if self.cac_required(ctx, &channel).await {
            let error = SapError::RegulatoryViolation(format!("beacon on {} before CAC", channel));
            log::error!("Interface {}: {}", ctx.id, error);
            self.abort_start(ctx, kind, StatusCode::Rejected, &error.to_string(), true)
                .await;
            return Err(error);
        }
        if let Err(e) = self
            .firmware_ack("start_beacon", self.firmware.start_beacon(ctx.id))
            .await
        {
            self.abort_start(ctx, kind, status_of(&e), &e.to_string(), true).await;
            return Err(e);
        }
        ctx.cac = CacFlags::default();
        ctx.set_state(SapState::Started);
        if !after_switch {
            self.notify(NotificationKind::BssStarted, ctx.id, Some(channel), StatusCode::Success)
                .await;
        }
        Ok(())
    }

    // ---- stop ----

    async fn on_stop_request(&self, ctx: &mut RadioContext) -> Result<()> {
        match ctx.state {
            SapState::Init | SapState::Stopping => Err(SapError::AlreadyInState(ctx.id)),
            SapState::Starting | SapState::Started => self.begin_stop(ctx).await,
        }
    }

    async fn begin_stop(&self, ctx: &mut RadioContext) -> Result<()> {
        if let Some(scan_id) = ctx.pending_scan.take() {
            if let Err(e) = self.scan.cancel_scan(scan_id).await {
                log::warn!("Interface {} scan cancel failed: {}", ctx.id, e);
            }
        }
        if ctx.cac.waiting {
            self.release_cac(ctx).await;
        }
        ctx.pending_change = None;
        ctx.acs_candidates.clear();
        let bss_up = ctx.channel.is_some();
        ctx.set_state(SapState::Stopping);

        if bss_up {
            if let Err(e) = self.firmware_ack("stop_bss", self.firmware.stop_bss(ctx.id)).await {
                log::warn!("Interface {} firmware stop failed, completing locally: {}", ctx.id, e);
                self.post(ctx.id, SapEvent::ReadyForConnections)?;
            }
        } else {
            self.post(ctx.id, SapEvent::ReadyForConnections)?;
        }
        Ok(())
    }

    async fn on_ready_for_connections(&self, ctx: &mut RadioContext) -> Result<()> {
        if ctx.state != SapState::Stopping {
            log::debug!("Interface {} ignoring stop completion in {:?}", ctx.id, ctx.state);
            return Ok(());
        }
        let channel = ctx.channel.take();
        ctx.reset_transients();
        ctx.set_state(SapState::Init);
        self.release_5g(ctx.id).await;
        self.notify(NotificationKind::BssStopped, ctx.id, channel, StatusCode::Success)
            .await;
        Ok(())
    }

    // ---- channel switch ----

    async fn on_channel_change_request(
        &self,
        ctx: &mut RadioContext,
        freq: u32,
        width: ChannelWidth,
        strict: bool,
    ) -> Result<()> {
        if ctx.state != SapState::Started {
            return Err(SapError::InvalidState(format!(
                "Interface {} cannot change channel in {:?}",
                ctx.id, ctx.state
            )));
        }
        if ctx.is_channel_change_in_progress() {
            return Err(SapError::ConcurrencyRejected(
                "channel change already in progress".to_string(),
            ));
        }
        if !band_allows(ctx.band_restriction, freq) {
            return Err(SapError::invalid_channel(freq, "outside the allowed band"));
        }
        let request = SwitchRequest {
            interface: ctx.id,
            persona: ctx.persona,
            freq,
            width,
            strict,
            cc_switch_mode: ctx.config.cc_switch_mode,
            current: ctx.channel,
        };
        let target = self.coordinator.validate(&request, &self.dfs).await?;
        self.begin_switch(ctx, target, CsaReason::UserInitiated).await
    }

    async fn begin_switch(
        &self,
        ctx: &mut RadioContext,
        target: ChannelDescriptor,
        reason: CsaReason,
    ) -> Result<()> {
        let hw_mode_pending = self.coordinator.request_hw_mode(ctx.id, &target).await?;
        let cac_duration_ms = if self.cac_required(ctx, &target).await {
            millis(self.dfs.cac_duration(&target))
        } else {
            0
        };
        let pending = PendingChannelChange {
            id: Uuid::new_v4(),
            target,
            reason,
            hw_mode_pending,
            cac_duration_ms,
            requested_at: Utc::now(),
        };
        ctx.csa_reason = reason;
        if hw_mode_pending {
            ctx.pending_change = Some(pending);
            return Ok(());
        }
        self.issue_csa(ctx, pending).await
    }

    async fn issue_csa(&self, ctx: &mut RadioContext, pending: PendingChannelChange) -> Result<()> {
        let target = pending.target;
        let cac_duration_ms = pending.cac_duration_ms;
        let reason = pending.reason;
        ctx.pending_change = Some(pending);
        let ack = self
            .firmware
            .channel_switch_announcement(ctx.id, &target, cac_duration_ms);
        if let Err(e) = self.firmware_ack("channel_switch", ack).await {
            ctx.pending_change = None;
            self.notify_failure(
                NotificationKind::ChannelChangeFailed,
                ctx.id,
                Some(target),
                status_of(&e),
                &e.to_string(),
            )
            .await;
            return Err(e);
        }
        log::info!("Interface {} CSA to {} ({:?})", ctx.id, target, reason);
        Ok(())
    }

    async fn on_hw_mode_complete(&self, ctx: &mut RadioContext, success: bool) -> Result<()> {
        let pending = match ctx.pending_change.take() {
            Some(pending) if pending.hw_mode_pending => pending,
            other => {
                ctx.pending_change = other;
                log::debug!("Interface {} ignoring hardware mode completion", ctx.id);
                return Ok(());
            }
        };
        match (ctx.state, success) {
            (SapState::Starting, true) => self.issue_start_bss(ctx, pending.target).await,
            (SapState::Starting, false) => {
                let error =
                    SapError::ConcurrencyRejected("hardware mode change failed".to_string());
                self.abort_start(
                    ctx,
                    NotificationKind::BssStartFailed,
                    StatusCode::Rejected,
                    &error.to_string(),
                    false,
                )
                .await;
                Err(error)
            }
            (SapState::Started, true) => {
                let pending = PendingChannelChange {
                    hw_mode_pending: false,
                    ..pending
                };
                self.issue_csa(ctx, pending).await
            }
            (SapState::Started, false) => {
                self.notify_failure(
                    NotificationKind::ChannelChangeFailed,
                    ctx.id,
                    Some(pending.target),
                    StatusCode::Rejected,
                    "hardware mode change failed",
                )
                .await;
                if ctx.radar_found {
                    return self.begin_stop(ctx).await;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn on_switch_complete(
        &self,
        ctx: &mut RadioContext,
        channel: ChannelDescriptor,
    ) -> Result<()> {
        let expected = ctx
            .pending_change
            .as_ref()
            .map(|p| !p.hw_mode_pending && p.target == channel)
            .unwrap_or(false);
        let switching = matches!(ctx.state, SapState::Starting | SapState::Started);
        if !expected || !switching {
            log::debug!("Interface {} ignoring switch completion to {}", ctx.id, channel);
            return Ok(());
        }
        ctx.pending_change = None;
        let was_beaconing = ctx.state == SapState::Started;
        let previous = ctx.channel.replace(channel);
        if channel.is_5ghz() {
            self.acquire_5g(ctx.id, &channel).await;
        } else if previous.map(|p| p.is_5ghz()).unwrap_or(false) {
            self.release_5g(ctx.id).await;
        }
        ctx.radar_found = false;
        self.notify(NotificationKind::ChannelChanged, ctx.id, Some(channel), StatusCode::Success)
            .await;

        if self.cac_required(ctx, &channel).await {
            ctx.cac.after_switch = was_beaconing;
            self.enter_cac(ctx, channel).await
        } else if ctx.state == SapState::Starting && !ctx.cac.waiting {
            self.start_beaconing(ctx).await
        } else {
            Ok(())
        }
    }

    async fn on_switch_failed(&self, ctx: &mut RadioContext, reason: String) -> Result<()> {
        let pending = match ctx.pending_change.take() {
            Some(pending) => pending,
            None => {
                log::debug!("Interface {} ignoring switch failure", ctx.id);
                return Ok(());
            }
        };
        self.notify_failure(
            NotificationKind::ChannelChangeFailed,
            ctx.id,
            Some(pending.target),
            StatusCode::Failure,
            &reason,
        )
        .await;
        if ctx.radar_found {
            log::warn!("Interface {} cannot leave radar channel, stopping", ctx.id);
            return self.begin_stop(ctx).await;
        }
        Ok(())
    }

    // ---- radar ----

    async fn on_radar_reported(&self, ctx: &mut RadioContext, freqs: Vec<u32>) -> Result<()> {
        log::warn!("Interface {} reports radar on {:?}", ctx.id, freqs);
        self.dfs.handle_radar(&freqs).await;

        let affected: Vec<InterfaceSummary> = {
            let registry = self.registry.read().await;
            registry
                .summaries()
                .into_iter()
                .filter(|s| matches!(s.state, SapState::Starting | SapState::Started))
                .filter(|s| {
                    s.channel
                        .map(|c| freqs.iter().any(|f| c.contains_freq(*f)))
                        .unwrap_or(false)
                })
                .collect()
        };
        for summary in &affected {
            self.notify(
                NotificationKind::RadarDetected,
                summary.id,
                summary.channel,
                StatusCode::Success,
            )
            .await;
        }
        for summary in &affected {
            self.post(summary.id, SapEvent::RadarOnChannel { freqs: freqs.clone() })?;
        }
        Ok(())
    }

    async fn on_radar_on_channel(&self, ctx: &mut RadioContext, freqs: Vec<u32>) -> Result<()> {
        if !matches!(ctx.state, SapState::Starting | SapState::Started) {
            return Ok(());
        }
        let current = match ctx.channel {
            Some(current) if freqs.iter().any(|f| current.contains_freq(*f)) => current,
            _ => return Ok(()),
        };
        ctx.radar_found = true;
        if ctx.cac.waiting {
            ctx.cac = CacFlags::default();
        }
        ctx.pending_change = None;

        let avoid = self.unsafe_channels().await;
        let params = RandomChannelParams::replacing(current).with_avoid(avoid);
        match self.dfs.select_random_channel(params).await {
            Some(target) => {
                if let Err(e) = self.begin_switch(ctx, target, CsaReason::RadarDetected).await {
                    log::warn!("Interface {} radar switch failed: {}", ctx.id, e);
                    self.begin_stop(ctx).await?;
                    return Err(e);
                }
                Ok(())
            }
            None => {
                self.notify_failure(
                    NotificationKind::NoChannelAvailable,
                    ctx.id,
                    Some(current),
                    StatusCode::Failure,
                    "no replacement channel after radar",
                )
                .await;
                self.begin_stop(ctx).await
            }
        }
    }

    // ---- band restriction and channel safety ----

    async fn on_band_restriction(
        &self,
        ctx: &mut RadioContext,
        restriction: BandRestriction,
    ) -> Result<()> {
        ctx.band_restriction = restriction;
        if ctx.state != SapState::Started || ctx.is_channel_change_in_progress() {
            return Ok(());
        }
        let current = match ctx.channel {
            Some(current) => current,
            None => return Ok(()),
        };
        let on_2g = current.band() == Some(Band::Band2G);

        match restriction {
            BandRestriction::Only2G if !on_2g => {
                let width = current.width.clamp_to(ChannelWidth::Bw40);
                let target = ChannelDescriptor::compute(
                    self.regulatory.as_ref(),
                    self.config.restricted_2g_freq,
                    width,
                )?;
                ctx.saved_channel = Some(current);
                log::info!("Interface {} restricted to 2.4 GHz, saving {}", ctx.id, current);
                self.begin_switch(ctx, target, CsaReason::BandRestricted).await
            }
            BandRestriction::All | BandRestriction::Only5G if on_2g => {
                if let Some(saved) = ctx.saved_channel.take() {
                    let restored = ChannelDescriptor::compute(
                        self.regulatory.as_ref(),
                        saved.primary_freq,
                        saved.width,
                    )
                    .ok()
                    .filter(|d| d.primary_freq == saved.primary_freq);
                    if let Some(restored) = restored {
                        if let Some(target) = self.off_nol(restored).await {
                            log::info!("Interface {} restoring {}", ctx.id, target);
                            return self.begin_switch(ctx, target, CsaReason::BandRestricted).await;
                        }
                    }
                    log::warn!("Interface {} saved channel {} no longer usable", ctx.id, saved);
                }
                if restriction == BandRestriction::Only5G {
                    let avoid = self.unsafe_channels().await;
                    let params = RandomChannelParams::at_width(ctx.config.width).with_avoid(avoid);
                    return match self.dfs.select_random_channel(params).await {
                        Some(target) => {
                            self.begin_switch(ctx, target, CsaReason::BandRestricted).await
                        }
                        None => {
                            self.notify_failure(
                                NotificationKind::NoChannelAvailable,
                                ctx.id,
                                Some(current),
                                StatusCode::Failure,
                                "no 5 GHz channel available",
                            )
                            .await;
                            Err(SapError::NoChannelAvailable(
                                "no 5 GHz channel available".to_string(),
                            ))
                        }
                    };
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn on_channel_safety_check(&self, ctx: &mut RadioContext) -> Result<()> {
        if ctx.state != SapState::Started || ctx.is_channel_change_in_progress() {
            return Ok(());
        }
        let current = match ctx.channel {
            Some(current) => current,
            None => return Ok(()),
        };
        if self.concurrency.is_safe_channel(current.primary_freq).await {
            return Ok(());
        }
        if self.coordinator.unsafe_allowed(ctx.id, ctx.config.user_forced).await {
            log::info!("Interface {} keeps forced channel {} on the avoid list", ctx.id, current);
            return Ok(());
        }
        let avoid = self.unsafe_channels().await;
        let params = RandomChannelParams::replacing(current).with_avoid(avoid);
        match self.dfs.select_random_channel(params).await {
            Some(target) => self.begin_switch(ctx, target, CsaReason::UnsafeChannel).await,
            None => {
                log::warn!("Interface {} has no safe channel to move to", ctx.id);
                Ok(())
            }
        }
    }
}
