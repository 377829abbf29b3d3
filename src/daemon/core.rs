//! SAP Daemon Core module
//!
//! Owns one `ApStateMachine`, drives its event loop on a background task and
//! exposes a command interface over it. Collaborators are the loopback
//! implementations from `daemon::sim`.

use super::config::{ConfigManager, DaemonConfig};
use super::sim::{
    LogNotificationHandler, LoopbackFirmware, LoopbackScanService, StaticConcurrencyManager,
};
use crate::channel::ChannelWidth;
use crate::event::EventQueue;
use crate::fsm::ApStateMachine;
use crate::registry::{BandRestriction, InterfaceId, InterfaceSummary, SapConfig, SapState};
use crate::{Result, SapError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;

/// How long `stop` waits for interfaces to reach `Init`
const STOP_WAIT: Duration = Duration::from_secs(2);

/// Daemon state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DaemonState {
    /// Daemon is initializing
    Initializing,
    /// Daemon is starting up
    Starting,
    /// Daemon is running normally
    Running,
    /// Daemon is stopping
    Stopping,
    /// Daemon has stopped
    Stopped,
    /// Daemon encountered an error
    Error,
}

/// Daemon statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonStats {
    /// Uptime in seconds
    pub uptime: u64,
    /// Registered interfaces
    pub interfaces: usize,
    /// Interfaces beaconing
    pub started_interfaces: usize,
    /// Events handled by the state machine
    pub events_processed: u64,
    /// Events whose handler failed
    pub events_failed: u64,
    /// Notifications delivered
    pub notifications_sent: u64,
    /// Channels currently in the NOL
    pub nol_channels: usize,
    /// Number of errors
    pub error_count: u64,
    /// Last error message
    pub last_error: Option<String>,
}

/// Main SAP Daemon structure
pub struct SapDaemon {
    /// Daemon configuration
    config: DaemonConfig,
    /// Current daemon state
    state: Arc<RwLock<DaemonState>>,
    /// AP state machine
    machine: Arc<ApStateMachine>,
    /// Loopback scan service
    scan: Arc<LoopbackScanService>,
    /// Loopback firmware
    firmware: Arc<LoopbackFirmware>,
    /// Concurrency manager
    concurrency: Arc<StaticConcurrencyManager>,
    /// Daemon statistics
    stats: Arc<RwLock<DaemonStats>>,
    /// Shutdown signal for the event loop
    shutdown_tx: Option<oneshot::Sender<()>>,
    /// Background tasks
    tasks: Vec<JoinHandle<()>>,
    /// Start time
    start_time: std::time::Instant,
}

impl std::fmt::Debug for SapDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SapDaemon")
            .field("config", &self.config)
            .field("machine", &self.machine)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl SapDaemon {
    /// Create new SAP daemon
    pub async fn new(config: DaemonConfig) -> Result<Self> {
        let validation = ConfigManager::new().validate_config(&config)?;
        if !validation.valid {
            return Err(SapError::Config(format!(
                "Configuration validation failed: {}",
                validation.errors.join(", ")
            )));
        }
        for warning in &validation.warnings {
            log::warn!("Configuration: {}", warning);
        }

        let regulatory = Arc::new(config.regulatory.build_table()?);
        let queue = EventQueue::new();
        let scan = Arc::new(LoopbackScanService::new(queue.sender()));
        let firmware = Arc::new(LoopbackFirmware::new(queue.sender()));
        let concurrency = Arc::new(StaticConcurrencyManager::new());
        concurrency.set_dbs_capable(config.concurrency.dbs_capable);
        concurrency.set_scc_on_dfs_allowed(config.concurrency.sta_sap_scc_on_dfs);
        concurrency.set_unsafe(&config.concurrency.unsafe_channels);

        let machine = ApStateMachine::new(
            config.machine_config(),
            regulatory,
            scan.clone(),
            concurrency.clone(),
            firmware.clone(),
            queue,
        );
        machine.add_notification_handler(Arc::new(LogNotificationHandler)).await;

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(DaemonState::Initializing)),
            machine: Arc::new(machine),
            scan,
            firmware,
            concurrency,
            stats: Arc::new(RwLock::new(DaemonStats::default())),
            shutdown_tx: None,
            tasks: Vec::new(),
            start_time: std::time::Instant::now(),
        })
    }

    /// Initialize the daemon
    pub async fn init(&mut self) -> Result<()> {
        log::info!("Initializing SAP daemon...");
        *self.state.write().await = DaemonState::Starting;

        let known: Vec<InterfaceId> = self.machine.summaries().await.iter().map(|s| s.id).collect();
        for iface in &self.config.interfaces {
            let (id, mac) = iface.identity()?;
            if known.contains(&id) {
                continue;
            }
            self.machine.open_interface(id, mac, iface.persona).await?;
            log::info!("Opened interface {} ({:?})", id, iface.persona);
        }

        log::info!("SAP daemon initialized successfully");
        Ok(())
    }

    /// Start the daemon
    pub async fn start(&mut self) -> Result<()> {
        log::info!("Starting SAP daemon...");
        self.init().await?;

        let (tx, rx) = oneshot::channel();
        self.shutdown_tx = Some(tx);
        let machine = Arc::clone(&self.machine);
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = machine.run(rx).await {
                log::error!("Event loop failed: {}", e);
            }
        }));

        if self.config.general.safety_check_interval_ms > 0 {
            let machine = Arc::clone(&self.machine);
            let interval = Duration::from_millis(self.config.general.safety_check_interval_ms);
            self.tasks.push(tokio::spawn(async move {
                Self::run_safety_checks(machine, interval).await;
            }));
        }

        if self.config.general.stats_interval_ms > 0 {
            let machine = Arc::clone(&self.machine);
            let stats = Arc::clone(&self.stats);
            let interval = Duration::from_millis(self.config.general.stats_interval_ms);
            let start_time = self.start_time;
            self.tasks.push(tokio::spawn(async move {
                Self::run_stats_collection(machine, stats, interval, start_time).await;
            }));
        }

        *self.state.write().await = DaemonState::Running;

        let auto_start: Vec<(InterfaceId, SapConfig)> = self
            .config
            .interfaces
            .iter()
            .filter(|i| i.auto_start)
            .map(|i| (InterfaceId(i.id), i.start.clone()))
            .collect();
        for (id, start) in auto_start {
            if let Err(e) = self.machine.start(id, start).await {
                log::warn!("Auto start of interface {} failed: {}", id, e);
                self.record_error(&e).await;
            }
        }

        log::info!("SAP daemon started successfully");
        Ok(())
    }

    /// Stop the daemon
    pub async fn stop(&mut self) -> Result<()> {
        log::info!("Stopping SAP daemon...");
        *self.state.write().await = DaemonState::Stopping;

        for summary in self.machine.summaries().await {
            if summary.state != SapState::Init {
                if let Err(e) = self.machine.stop(summary.id).await {
                    log::warn!("Stopping interface {} failed: {}", summary.id, e);
                }
            }
        }
        self.wait_for_idle(STOP_WAIT).await;

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }

        *self.state.write().await = DaemonState::Stopped;
        log::info!("SAP daemon stopped successfully");
        Ok(())
    }

    /// Wait until every interface is in `Init`
    async fn wait_for_idle(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let idle = self
                .machine
                .summaries()
                .await
                .iter()
                .all(|s| s.state == SapState::Init);
            if idle {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                log::warn!("Interfaces still active after {:?}", limit);
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Get daemon state
    pub async fn get_state(&self) -> DaemonState {
        *self.state.read().await
    }

    /// Get daemon statistics
    pub async fn get_stats(&self) -> DaemonStats {
        let mut stats = self.stats.read().await.clone();
        Self::refresh_stats(&self.machine, &mut stats, self.start_time).await;
        stats
    }

    /// Get daemon configuration
    pub fn get_config(&self) -> &DaemonConfig {
        &self.config
    }

    /// State machine
    pub fn machine(&self) -> &Arc<ApStateMachine> {
        &self.machine
    }

    /// Loopback firmware
    pub fn firmware(&self) -> &Arc<LoopbackFirmware> {
        &self.firmware
    }

    /// Loopback scan service
    pub fn scan_service(&self) -> &Arc<LoopbackScanService> {
        &self.scan
    }

    /// Concurrency manager
    pub fn concurrency(&self) -> &Arc<StaticConcurrencyManager> {
        &self.concurrency
    }

    /// Update daemon configuration
    pub async fn update_config(&mut self, config: DaemonConfig) -> Result<()> {
        log::info!("Updating daemon configuration");
        let running = self.get_state().await == DaemonState::Running;
        if running {
            self.stop().await?;
        }
        let replacement = Self::new(config).await?;
        *self = replacement;
        if running {
            log::info!("Restarting daemon with new configuration");
            self.start().await?;
        }
        Ok(())
    }

    /// Handle daemon command
    pub async fn handle_command(&mut self, command: DaemonCommand) -> Result<DaemonResponse> {
        match command {
            DaemonCommand::GetState => Ok(DaemonResponse::State(self.get_state().await)),
            DaemonCommand::GetStats => Ok(DaemonResponse::Stats(self.get_stats().await)),
            DaemonCommand::GetConfig => Ok(DaemonResponse::Config(Box::new(self.config.clone()))),
            DaemonCommand::UpdateConfig(config) => {
                self.update_config(*config).await?;
                Ok(DaemonResponse::Success)
            }
            DaemonCommand::Start => {
                if self.get_state().await != DaemonState::Running {
                    self.start().await?;
                }
                Ok(DaemonResponse::Success)
            }
            DaemonCommand::Stop => {
                if self.get_state().await == DaemonState::Running {
                    self.stop().await?;
                }
                Ok(DaemonResponse::Success)
            }
            DaemonCommand::Restart => {
                self.stop().await?;
                self.start().await?;
                Ok(DaemonResponse::Success)
            }
            DaemonCommand::ListInterfaces => {
                Ok(DaemonResponse::Interfaces(self.machine.summaries().await))
            }
            DaemonCommand::StartInterface { id, config } => {
                let config = match config {
                    Some(config) => config,
                    None => self.configured_start(id)?,
                };
                self.checked(self.machine.start(id, config).await).await?;
                Ok(DaemonResponse::Success)
            }
            DaemonCommand::StopInterface { id } => {
                self.checked(self.machine.stop(id).await).await?;
                Ok(DaemonResponse::Success)
            }
            DaemonCommand::ChangeChannel { id, freq, width, strict } => {
                self.checked(self.machine.request_channel_change(id, freq, width, strict).await)
                    .await?;
                Ok(DaemonResponse::Success)
            }
            DaemonCommand::SetBandRestriction { id, restriction } => {
                self.checked(self.machine.set_band_restriction(id, restriction).await)
                    .await?;
                Ok(DaemonResponse::Success)
            }
            DaemonCommand::InjectRadar { id, freqs } => {
                self.machine.on_radar_indication(id, freqs)?;
                Ok(DaemonResponse::Success)
            }
            DaemonCommand::GetNol => Ok(DaemonResponse::Nol(self.machine.dfs().nol_list().await)),
        }
    }

    fn configured_start(&self, id: InterfaceId) -> Result<SapConfig> {
        self.config
            .interfaces
            .iter()
            .find(|i| InterfaceId(i.id) == id)
            .map(|i| i.start.clone())
            .ok_or(SapError::InterfaceNotFound(id))
    }

    async fn checked(&self, result: Result<()>) -> Result<()> {
        if let Err(e) = &result {
            self.record_error(e).await;
        }
        result
    }

    async fn record_error(&self, error: &SapError) {
        let mut stats = self.stats.write().await;
        stats.error_count += 1;
        stats.last_error = Some(error.to_string());
    }

    async fn refresh_stats(
        machine: &ApStateMachine,
        stats: &mut DaemonStats,
        start_time: std::time::Instant,
    ) {
        let summaries = machine.summaries().await;
        let events = machine.event_stats().await;
        stats.uptime = start_time.elapsed().as_secs();
        stats.interfaces = summaries.len();
        stats.started_interfaces = summaries
            .iter()
            .filter(|s| s.state == SapState::Started)
            .count();
        stats.events_processed = events.events_processed;
        stats.events_failed = events.handler_errors;
        stats.notifications_sent = machine.notifications().get_stats().await.emitted;
        stats.nol_channels = machine.dfs().nol_freqs().await.len();
    }

    /// Periodically re-check every started interface against the avoid list
    async fn run_safety_checks(machine: Arc<ApStateMachine>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            for summary in machine.summaries().await {
                if summary.state == SapState::Started {
                    if let Err(e) = machine.check_channel_safety(summary.id) {
                        log::warn!("Safety check for {} not queued: {}", summary.id, e);
                    }
                }
            }
        }
    }

    /// Run statistics collection
    async fn run_stats_collection(
        machine: Arc<ApStateMachine>,
        stats: Arc<RwLock<DaemonStats>>,
        period: Duration,
        start_time: std::time::Instant,
    ) {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let mut stats_guard = stats.write().await;
            Self::refresh_stats(&machine, &mut stats_guard, start_time).await;
            log::debug!(
                "Statistics updated - uptime: {}s, started: {}/{}",
                stats_guard.uptime,
                stats_guard.started_interfaces,
                stats_guard.interfaces
            );
        }
    }
}

/// Daemon command enumeration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DaemonCommand {
    /// Get daemon state
    GetState,
    /// Get daemon statistics
    GetStats,
    /// Get daemon configuration
    GetConfig,
    /// Update daemon configuration
    UpdateConfig(Box<DaemonConfig>),
    /// Start daemon
    Start,
    /// Stop daemon
    Stop,
    /// Restart daemon
    Restart,
    /// List interfaces
    ListInterfaces,
    /// Start an interface, with its configured start settings when `config` is `None`
    StartInterface { id: InterfaceId, config: Option<SapConfig> },
    /// Stop an interface
    StopInterface { id: InterfaceId },
    /// Change the channel of a running interface
    ChangeChannel {
        id: InterfaceId,
        freq: u32,
        width: ChannelWidth,
        strict: bool,
    },
    /// Apply a band restriction
    SetBandRestriction { id: InterfaceId, restriction: BandRestriction },
    /// Report radar as if seen by an interface
    InjectRadar { id: InterfaceId, freqs: Vec<u32> },
    /// Get the non-occupancy list
    GetNol,
}

/// Daemon response enumeration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DaemonResponse {
    /// Success response
    Success,
    /// Error response
    Error(String),
    /// State response
    State(DaemonState),
    /// Statistics response
    Stats(DaemonStats),
    /// Configuration response
    Config(Box<DaemonConfig>),
    /// Interfaces response
    Interfaces(Vec<InterfaceSummary>),
    /// NOL response
    Nol(Vec<(u32, DateTime<Utc>)>),
}

impl DaemonResponse {
    /// Build a response from a command result
    pub fn from_result(result: Result<DaemonResponse>) -> Self {
        result.unwrap_or_else(|e| DaemonResponse::Error(e.to_string()))
    }
}

/// Per-interface counts of beaconing interfaces by band, for status output
pub fn band_summary(summaries: &[InterfaceSummary]) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for summary in summaries.iter().filter(|s| s.state == SapState::Started) {
        let band = summary
            .channel
            .and_then(|c| c.band())
            .map(|b| format!("{:?}", b))
            .unwrap_or_else(|| "unknown".to_string());
        *counts.entry(band).or_insert(0) += 1;
    }
    counts
}
