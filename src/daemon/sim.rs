//! Loopback collaborators
//!
//! In-process scan service, firmware and concurrency manager that answer
//! through the state machine's event queue. The daemon runs against these
//! when no driver backend is attached, and tests use them to drive and
//! observe the state machine.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::backend::{
    BssParams, ConcurrencyManager, ConcurrentConnection, FirmwareChannel, HwModeResult, ScanId,
    ScanResult, ScanService,
};
use crate::channel::ChannelDescriptor;
use crate::event::{EventSender, NotificationHandler, NotificationKind, SapEvent, SapNotification};
use crate::registry::InterfaceId;
use crate::{Result, SapError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scan service answering from a configured result table
pub struct LoopbackScanService {
    events: EventSender,
    results: Mutex<HashMap<u32, ScanResult>>,
    issued: Mutex<Vec<(InterfaceId, Vec<u32>)>>,
    fail_issue: AtomicBool,
    auto_complete: AtomicBool,
}

impl LoopbackScanService {
    /// Create new loopback scan service
    pub fn new(events: EventSender) -> Self {
        Self {
            events,
            results: Mutex::new(HashMap::new()),
            issued: Mutex::new(Vec::new()),
            fail_issue: AtomicBool::new(false),
            auto_complete: AtomicBool::new(true),
        }
    }

    /// Set the observation reported for a frequency
    pub fn set_result(&self, result: ScanResult) {
        lock(&self.results).insert(result.freq, result);
    }

    /// Make `issue_scan` fail
    pub fn set_fail_issue(&self, fail: bool) {
        self.fail_issue.store(fail, Ordering::SeqCst);
    }

    /// Post completions automatically
    pub fn set_auto_complete(&self, auto: bool) {
        self.auto_complete.store(auto, Ordering::SeqCst);
    }

    /// Scans issued so far
    pub fn issued(&self) -> Vec<(InterfaceId, Vec<u32>)> {
        lock(&self.issued).clone()
    }

    /// Number of scans issued
    pub fn scan_count(&self) -> usize {
        lock(&self.issued).len()
    }
}

#[async_trait]
impl ScanService for LoopbackScanService {
    async fn issue_scan(&self, interface: InterfaceId, freqs: &[u32]) -> Result<ScanId> {
        if self.fail_issue.load(Ordering::SeqCst) {
            return Err(SapError::Scan("scan service unavailable".to_string()));
        }
        lock(&self.issued).push((interface, freqs.to_vec()));
        let scan_id = Uuid::new_v4();
        if self.auto_complete.load(Ordering::SeqCst) {
            let results = {
                let table = lock(&self.results);
                freqs
                    .iter()
                    .map(|f| table.get(f).cloned().unwrap_or_else(|| ScanResult::new(*f, 0, -100)))
                    .collect()
            };
            self.events.post(interface, SapEvent::ScanComplete { scan_id, results })?;
        }
        Ok(scan_id)
    }
}

/// Firmware command recorded by `LoopbackFirmware`
#[derive(Debug, Clone, PartialEq)]
pub enum FirmwareCommand {
    StartBss {
        interface: InterfaceId,
        channel: ChannelDescriptor,
        cac_duration_ms: u32,
    },
    StopBss {
        interface: InterfaceId,
    },
    ChannelSwitch {
        interface: InterfaceId,
        target: ChannelDescriptor,
        cac_duration_ms: u32,
    },
    StartBeacon {
        interface: InterfaceId,
    },
}

impl FirmwareCommand {
    /// Interface the command targets
    pub fn interface(&self) -> InterfaceId {
        match self {
            FirmwareCommand::StartBss { interface, .. }
            | FirmwareCommand::StopBss { interface }
            | FirmwareCommand::ChannelSwitch { interface, .. }
            | FirmwareCommand::StartBeacon { interface } => *interface,
        }
    }
}

/// Firmware that acknowledges every command and posts its completion
pub struct LoopbackFirmware {
    events: EventSender,
    commands: Mutex<Vec<FirmwareCommand>>,
    reject: AtomicBool,
    hang: AtomicBool,
    fail_start: AtomicBool,
    auto_complete: AtomicBool,
}

impl LoopbackFirmware {
    /// Create new loopback firmware
    pub fn new(events: EventSender) -> Self {
        Self {
            events,
            commands: Mutex::new(Vec::new()),
            reject: AtomicBool::new(false),
            hang: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            auto_complete: AtomicBool::new(true),
        }
    }

    /// Nack every command
    pub fn set_reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    /// Never acknowledge
    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    /// Acknowledge BSS start, then report it failed
    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Post completions automatically
    pub fn set_auto_complete(&self, auto: bool) {
        self.auto_complete.store(auto, Ordering::SeqCst);
    }

    /// Commands received so far
    pub fn commands(&self) -> Vec<FirmwareCommand> {
        lock(&self.commands).clone()
    }

    /// Commands received for one interface
    pub fn commands_for(&self, interface: InterfaceId) -> Vec<FirmwareCommand> {
        self.commands().into_iter().filter(|c| c.interface() == interface).collect()
    }

    /// Channel switch targets announced for one interface
    pub fn switch_targets(&self, interface: InterfaceId) -> Vec<ChannelDescriptor> {
        self.commands_for(interface)
            .into_iter()
            .filter_map(|c| match c {
                FirmwareCommand::ChannelSwitch { target, .. } => Some(target),
                _ => None,
            })
            .collect()
    }

    /// Number of BSS stop commands for one interface
    pub fn stop_count(&self, interface: InterfaceId) -> usize {
        self.commands_for(interface)
            .iter()
            .filter(|c| matches!(c, FirmwareCommand::StopBss { .. }))
            .count()
    }

    async fn ack(&self, command: FirmwareCommand) -> Result<()> {
        if self.hang.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.reject.load(Ordering::SeqCst) {
            return Err(SapError::Firmware(format!("command rejected: {:?}", command)));
        }
        log::debug!("Firmware ack {:?}", command);
        lock(&self.commands).push(command);
        Ok(())
    }

    fn complete(&self, interface: InterfaceId, event: SapEvent) -> Result<()> {
        if self.auto_complete.load(Ordering::SeqCst) {
            self.events.post(interface, event)?;
        }
        Ok(())
    }
}

#[async_trait]
impl FirmwareChannel for LoopbackFirmware {
    async fn start_bss(&self, params: &BssParams) -> Result<()> {
        self.ack(FirmwareCommand::StartBss {
            interface: params.interface,
            channel: params.channel,
            cac_duration_ms: params.cac_duration_ms,
        })
        .await?;
        let event = if self.fail_start.load(Ordering::SeqCst) {
            SapEvent::BssStartFailure {
                reason: "loopback start failure".to_string(),
            }
        } else {
            SapEvent::BssStartSuccess
        };
        self.complete(params.interface, event)
    }

    async fn stop_bss(&self, interface: InterfaceId) -> Result<()> {
        self.ack(FirmwareCommand::StopBss { interface }).await?;
        self.complete(interface, SapEvent::ReadyForConnections)
    }

    async fn channel_switch_announcement(
        &self,
        interface: InterfaceId,
        target: &ChannelDescriptor,
        cac_duration_ms: u32,
    ) -> Result<()> {
        self.ack(FirmwareCommand::ChannelSwitch {
            interface,
            target: *target,
            cac_duration_ms,
        })
        .await?;
        self.complete(interface, SapEvent::ChannelSwitchComplete { channel: *target })
    }

    async fn start_beacon(&self, interface: InterfaceId) -> Result<()> {
        self.ack(FirmwareCommand::StartBeacon { interface }).await
    }
}

#[derive(Debug, Default)]
struct ConcurrencyInner {
    hw_modes: HashMap<u32, HwModeResult>,
    connections: Vec<ConcurrentConnection>,
    unsafe_channels: HashSet<u32>,
    pcl: Vec<u32>,
    concurrent: Option<ChannelDescriptor>,
    dbs_capable: bool,
    scc_on_dfs_allowed: bool,
}

/// Concurrency manager backed by a fixed connection table
#[derive(Debug, Default)]
pub struct StaticConcurrencyManager {
    inner: Mutex<ConcurrencyInner>,
}

impl StaticConcurrencyManager {
    /// Create an empty concurrency manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Hardware mode answer for a frequency
    pub fn set_hw_mode(&self, freq: u32, result: HwModeResult) {
        lock(&self.inner).hw_modes.insert(freq, result);
    }

    /// Add a concurrent connection
    pub fn add_connection(&self, connection: ConcurrentConnection) {
        lock(&self.inner).connections.push(connection);
    }

    /// Remove every concurrent connection
    pub fn clear_connections(&self) {
        lock(&self.inner).connections.clear();
    }

    /// Replace the avoid list
    pub fn set_unsafe(&self, freqs: &[u32]) {
        lock(&self.inner).unsafe_channels = freqs.iter().copied().collect();
    }

    /// Replace the preferred channel list
    pub fn set_pcl(&self, pcl: Vec<u32>) {
        lock(&self.inner).pcl = pcl;
    }

    /// Channel the AP should share, overriding the connection table
    pub fn set_concurrent_channel(&self, channel: Option<ChannelDescriptor>) {
        lock(&self.inner).concurrent = channel;
    }

    /// Set DBS capability
    pub fn set_dbs_capable(&self, capable: bool) {
        lock(&self.inner).dbs_capable = capable;
    }

    /// Allow STA+SAP SCC on DFS
    pub fn set_scc_on_dfs_allowed(&self, allowed: bool) {
        lock(&self.inner).scc_on_dfs_allowed = allowed;
    }

    fn others(inner: &ConcurrencyInner, interface: InterfaceId) -> Vec<ConcurrentConnection> {
        inner
            .connections
            .iter()
            .filter(|c| c.interface != Some(interface))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ConcurrencyManager for StaticConcurrencyManager {
    async fn check_and_request_hw_mode(
        &self,
        _interface: InterfaceId,
        target_freq: u32,
    ) -> HwModeResult {
        lock(&self.inner)
            .hw_modes
            .get(&target_freq)
            .copied()
            .unwrap_or(HwModeResult::NotRequired)
    }

    async fn get_concurrent_operating_channel(
        &self,
        interface: InterfaceId,
    ) -> Option<ChannelDescriptor> {
        let inner = lock(&self.inner);
        inner
            .concurrent
            .or_else(|| Self::others(&inner, interface).first().map(|c| c.channel))
    }

    async fn active_connections(&self, interface: InterfaceId) -> Vec<ConcurrentConnection> {
        Self::others(&lock(&self.inner), interface)
    }

    async fn is_safe_channel(&self, freq: u32) -> bool {
        !lock(&self.inner).unsafe_channels.contains(&freq)
    }

    async fn preferred_channel_list(&self, _interface: InterfaceId) -> Vec<u32> {
        lock(&self.inner).pcl.clone()
    }

    fn is_dbs_capable(&self) -> bool {
        lock(&self.inner).dbs_capable
    }

    fn sta_sap_scc_on_dfs_allowed(&self) -> bool {
        lock(&self.inner).scc_on_dfs_allowed
    }
}

/// Notification handler that keeps everything it receives
pub struct RecordingNotificationHandler {
    name: String,
    received: RwLock<Vec<SapNotification>>,
}

impl RecordingNotificationHandler {
    /// Create new recording handler
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            received: RwLock::new(Vec::new()),
        }
    }

    /// Notifications received so far
    pub async fn received(&self) -> Vec<SapNotification> {
        self.received.read().await.clone()
    }

    /// Kinds received so far, in order
    pub async fn kinds(&self) -> Vec<NotificationKind> {
        self.received.read().await.iter().map(|n| n.kind).collect()
    }

    /// Number of notifications of a kind
    pub async fn count(&self, kind: NotificationKind) -> usize {
        self.received.read().await.iter().filter(|n| n.kind == kind).count()
    }

    /// Notifications of a kind for one interface
    pub async fn for_interface(
        &self,
        interface: InterfaceId,
        kind: NotificationKind,
    ) -> Vec<SapNotification> {
        self.received
            .read()
            .await
            .iter()
            .filter(|n| n.interface == interface && n.kind == kind)
            .cloned()
            .collect()
    }

    /// Forget everything received
    pub async fn clear(&self) {
        self.received.write().await.clear();
    }
}

#[async_trait]
impl NotificationHandler for RecordingNotificationHandler {
    async fn handle_notification(&self, notification: &SapNotification) -> Result<()> {
        self.received.write().await.push(notification.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Notification handler that writes every notification to the log
pub struct LogNotificationHandler;

#[async_trait]
impl NotificationHandler for LogNotificationHandler {
    async fn handle_notification(&self, notification: &SapNotification) -> Result<()> {
        match &notification.channel {
            Some(channel) => log::info!(
                "[{}] {:?} on {} ({:?})",
                notification.interface,
                notification.kind,
                channel,
                notification.status
            ),
            None => log::info!(
                "[{}] {:?} ({:?})",
                notification.interface,
                notification.kind,
                notification.status
            ),
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventQueue;

    #[tokio::test]
    async fn test_loopback_scan_posts_results() {
        let queue = EventQueue::new();
        let scan = LoopbackScanService::new(queue.sender());
        scan.set_result(ScanResult::new(5180, 4, -50));
        let id = scan.issue_scan(InterfaceId(0), &[5180, 5200]).await.unwrap();

        let queued = queue.try_next().await.unwrap();
        match queued.event {
            SapEvent::ScanComplete { scan_id, results } => {
                assert_eq!(scan_id, id);
                assert_eq!(results.len(), 2);
                assert_eq!(results[0].bss_count, 4);
                assert_eq!(results[1].bss_count, 0);
            }
            other => panic!("unexpected event {:?}", other),
        }

        scan.set_fail_issue(true);
        assert!(scan.issue_scan(InterfaceId(0), &[5180]).await.is_err());
        assert_eq!(scan.scan_count(), 1);
    }

    #[tokio::test]
    async fn test_loopback_firmware_records() {
        let queue = EventQueue::new();
        let firmware = LoopbackFirmware::new(queue.sender());
        firmware.stop_bss(InterfaceId(2)).await.unwrap();
        assert_eq!(firmware.stop_count(InterfaceId(2)), 1);
        assert!(matches!(
            queue.try_next().await.unwrap().event,
            SapEvent::ReadyForConnections
        ));

        firmware.set_reject(true);
        assert!(firmware.start_beacon(InterfaceId(2)).await.is_err());
        assert_eq!(firmware.commands().len(), 1);
    }

    #[tokio::test]
    async fn test_static_concurrency_excludes_self() {
        let manager = StaticConcurrencyManager::new();
        manager.add_connection(ConcurrentConnection {
            interface: Some(InterfaceId(1)),
            mode: crate::backend::ConnectionMode::Sap,
            channel: ChannelDescriptor::new_20(5745),
            indoor: false,
        });
        assert!(manager.active_connections(InterfaceId(1)).await.is_empty());
        assert_eq!(manager.active_connections(InterfaceId(0)).await.len(), 1);
        assert_eq!(
            manager.get_concurrent_operating_channel(InterfaceId(0)).await,
            Some(ChannelDescriptor::new_20(5745))
        );
        manager.set_unsafe(&[5745]);
        assert!(!manager.is_safe_channel(5745).await);
    }
}
