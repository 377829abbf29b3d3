//! SAP events and notifications
//!
//! Internal events are the single input of the state machine dispatch
//! function: API requests, firmware acknowledgements, scan completions,
//! timers and radar indications all arrive as a `SapEvent`. Queued events
//! are processed strictly in arrival order.
//!
//! Notifications are the state machine's output towards the host, delivered
//! in order to every registered `NotificationHandler`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use crate::backend::{ScanId, ScanResult};
use crate::channel::{ChannelDescriptor, ChannelWidth};
use crate::registry::{BandRestriction, InterfaceId, SapConfig};
use crate::{Result, SapError};

/// State machine input events
#[derive(Debug, Clone)]
pub enum SapEvent {
    /// Host asks to start the BSS
    StartRequest(Box<SapConfig>),
    /// Host asks to stop the BSS
    StopRequest,
    /// Host asks for a channel change
    ChannelChangeRequest {
        freq: u32,
        width: ChannelWidth,
        strict: bool,
    },
    /// Host changed the allowed band
    BandRestrictionChanged(BandRestriction),
    /// Firmware started the BSS
    BssStartSuccess,
    /// Firmware could not start the BSS
    BssStartFailure { reason: String },
    /// Firmware finished tearing down the BSS
    ReadyForConnections,
    /// ACS scan finished
    ScanComplete { scan_id: ScanId, results: Vec<ScanResult> },
    /// ACS scan aborted by the scan service
    ScanFailed { scan_id: ScanId, reason: String },
    /// Shared CAC timer fired
    CacTimerExpired { timer_id: Uuid },
    /// CAC completed for the channel this interface waits on
    CacComplete { timer_id: Uuid },
    /// Radar reported by the PHY of this interface
    RadarIndication { freqs: Vec<u32> },
    /// Radar affects this interface's channel, move away
    RadarOnChannel { freqs: Vec<u32> },
    /// Firmware confirmed the channel switch
    ChannelSwitchComplete { channel: ChannelDescriptor },
    /// Firmware could not perform the channel switch
    ChannelSwitchFailed { reason: String },
    /// Concurrency manager finished a requested hardware mode change
    HwModeChangeComplete { success: bool },
    /// Re-validate the operating channel against the avoid list
    ChannelSafetyCheck,
}

impl SapEvent {
    /// Event name for logs and statistics
    pub fn name(&self) -> &'static str {
        match self {
            SapEvent::StartRequest(_) => "StartRequest",
            SapEvent::StopRequest => "StopRequest",
            SapEvent::ChannelChangeRequest { .. } => "ChannelChangeRequest",
            SapEvent::BandRestrictionChanged(_) => "BandRestrictionChanged",
            SapEvent::BssStartSuccess => "BssStartSuccess",
            SapEvent::BssStartFailure { .. } => "BssStartFailure",
            SapEvent::ReadyForConnections => "ReadyForConnections",
            SapEvent::ScanComplete { .. } => "ScanComplete",
            SapEvent::ScanFailed { .. } => "ScanFailed",
            SapEvent::CacTimerExpired { .. } => "CacTimerExpired",
            SapEvent::CacComplete { .. } => "CacComplete",
            SapEvent::RadarIndication { .. } => "RadarIndication",
            SapEvent::RadarOnChannel { .. } => "RadarOnChannel",
            SapEvent::ChannelSwitchComplete { .. } => "ChannelSwitchComplete",
            SapEvent::ChannelSwitchFailed { .. } => "ChannelSwitchFailed",
            SapEvent::HwModeChangeComplete { .. } => "HwModeChangeComplete",
            SapEvent::ChannelSafetyCheck => "ChannelSafetyCheck",
        }
    }
}

/// Event with metadata
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    /// Event ID
    pub id: Uuid,
    /// Target interface
    pub interface: InterfaceId,
    /// The event
    pub event: SapEvent,
    /// Enqueue timestamp
    pub enqueued_at: Instant,
}

/// Cloneable handle that posts events into the queue
#[derive(Debug, Clone)]
pub struct EventSender {
    inner: mpsc::UnboundedSender<QueuedEvent>,
}

impl EventSender {
    /// Post an event for an interface
    pub fn post(&self, interface: InterfaceId, event: SapEvent) -> Result<()> {
        let queued = QueuedEvent {
            id: Uuid::new_v4(),
            interface,
            event,
            enqueued_at: Instant::now(),
        };
        self.inner
            .send(queued)
            .map_err(|e| SapError::Event(format!("Failed to post event: {}", e)))
    }
}

/// Event statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventStats {
    /// Total events processed
    pub events_processed: u64,
    /// Events by type
    pub events_by_type: HashMap<String, u64>,
    /// Average processing time (microseconds)
    pub avg_processing_time: f64,
    /// Total processing time (microseconds)
    pub total_processing_time: u64,
    /// Number of events whose handling failed
    pub handler_errors: u64,
}

/// FIFO event queue feeding the dispatch function
pub struct EventQueue {
    sender: EventSender,
    receiver: Mutex<mpsc::UnboundedReceiver<QueuedEvent>>,
    stats: RwLock<EventStats>,
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("sender", &self.sender)
            .field("stats", &format!("[stats]"))
            .finish()
    }
}

impl EventQueue {
    /// Create new event queue
    pub fn new() -> Self {
        let (inner, receiver) = mpsc::unbounded_channel();
        Self {
            sender: EventSender { inner },
            receiver: Mutex::new(receiver),
            stats: RwLock::new(EventStats::default()),
        }
    }

    /// Get a sender handle
    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    /// Take the next queued event without waiting
    pub async fn try_next(&self) -> Option<QueuedEvent> {
        self.receiver.lock().await.try_recv().ok()
    }

    /// Wait for the next queued event
    pub async fn next(&self) -> Option<QueuedEvent> {
        self.receiver.lock().await.recv().await
    }

    /// Record the outcome of one processed event
    pub async fn record(&self, event: &SapEvent, processing_time: Duration, success: bool) {
        let mut stats = self.stats.write().await;
        stats.events_processed += 1;
        *stats.events_by_type.entry(event.name().to_string()).or_insert(0) += 1;
        stats.total_processing_time += processing_time.as_micros() as u64;
        stats.avg_processing_time =
            stats.total_processing_time as f64 / stats.events_processed as f64;
        if !success {
            stats.handler_errors += 1;
        }
    }

    /// Get event statistics
    pub async fn get_stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Kind of an outgoing notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    BssStarted,
    BssStopped,
    BssStartFailed,
    ChannelChanged,
    ChannelChangeFailed,
    CacStarted,
    CacEnded,
    RadarDetected,
    NoChannelAvailable,
}

/// Status code carried by a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    Success,
    Failure,
    Timeout,
    Rejected,
}

/// Notification delivered to the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SapNotification {
    /// Notification ID
    pub id: Uuid,
    /// Kind
    pub kind: NotificationKind,
    /// Interface the notification refers to
    pub interface: InterfaceId,
    /// Channel the notification refers to
    pub channel: Option<ChannelDescriptor>,
    /// Outcome
    pub status: StatusCode,
    /// Human readable detail on failures
    pub reason: Option<String>,
    /// Creation time
    pub timestamp: DateTime<Utc>,
}

impl SapNotification {
    /// Create new notification
    pub fn new(
        kind: NotificationKind,
        interface: InterfaceId,
        channel: Option<ChannelDescriptor>,
        status: StatusCode,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            interface,
            channel,
            status,
            reason: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach a failure reason
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Notification handler trait
#[async_trait::async_trait]
pub trait NotificationHandler: Send + Sync {
    /// Handle a notification
    async fn handle_notification(&self, notification: &SapNotification) -> Result<()>;

    /// Get handler name
    fn name(&self) -> &str;

    /// Check if handler wants this notification kind
    fn can_handle(&self, _kind: NotificationKind) -> bool {
        true
    }
}

/// Notification statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationStats {
    /// Notifications emitted
    pub emitted: u64,
    /// Notifications by kind
    pub by_kind: HashMap<String, u64>,
    /// Number of handler errors
    pub handler_errors: u64,
}

/// In-order notification fan-out
pub struct NotificationBus {
    handlers: RwLock<Vec<Arc<dyn NotificationHandler>>>,
    stats: RwLock<NotificationStats>,
}

impl std::fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBus")
            .field("handlers", &format!("[handlers]"))
            .field("stats", &format!("[stats]"))
            .finish()
    }
}

impl NotificationBus {
    /// Create new notification bus
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            stats: RwLock::new(NotificationStats::default()),
        }
    }

    /// Add notification handler
    pub async fn add_handler(&self, handler: Arc<dyn NotificationHandler>) {
        self.handlers.write().await.push(handler);
    }

    /// Remove notification handler by name
    pub async fn remove_handler(&self, name: &str) {
        self.handlers.write().await.retain(|h| h.name() != name);
    }

    /// Deliver a notification to every interested handler
    pub async fn notify(&self, notification: SapNotification) {
        log::info!(
            "Notify {:?} on {} ({:?}){}",
            notification.kind,
            notification.interface,
            notification.status,
            notification
                .channel
                .map(|c| format!(" channel {}", c))
                .unwrap_or_default()
        );

        let mut errors = 0;
        {
            let handlers = self.handlers.read().await;
            for handler in handlers.iter() {
                if handler.can_handle(notification.kind) {
                    if let Err(e) = handler.handle_notification(&notification).await {
                        log::error!("Notification handler '{}' error: {}", handler.name(), e);
                        errors += 1;
                    }
                }
            }
        }

        let mut stats = self.stats.write().await;
        stats.emitted += 1;
        *stats.by_kind.entry(format!("{:?}", notification.kind)).or_insert(0) += 1;
        stats.handler_errors += errors;
    }

    /// Get notification statistics
    pub async fn get_stats(&self) -> NotificationStats {
        self.stats.read().await.clone()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestHandler {
        name: String,
        only: Option<NotificationKind>,
        call_count: Arc<AtomicUsize>,
    }

    impl TestHandler {
        fn new(name: &str, only: Option<NotificationKind>) -> Self {
            Self {
                name: name.to_string(),
                only,
                call_count: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn get_call_count(&self) -> usize {
            self.call_count.load(Ordering::Relaxed)
        }
    }

    #[async_trait::async_trait]
    impl NotificationHandler for TestHandler {
        async fn handle_notification(&self, _notification: &SapNotification) -> Result<()> {
            self.call_count.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn can_handle(&self, kind: NotificationKind) -> bool {
            self.only.map(|k| k == kind).unwrap_or(true)
        }
    }

    #[tokio::test]
    async fn test_queue_preserves_order() {
        let queue = EventQueue::new();
        let sender = queue.sender();
        sender.post(InterfaceId(0), SapEvent::StopRequest).unwrap();
        sender.post(InterfaceId(1), SapEvent::BssStartSuccess).unwrap();
        sender.post(InterfaceId(0), SapEvent::ReadyForConnections).unwrap();

        let names: Vec<&'static str> = {
            let mut names = Vec::new();
            while let Some(queued) = queue.try_next().await {
                names.push(queued.event.name());
            }
            names
        };
        assert_eq!(names, vec!["StopRequest", "BssStartSuccess", "ReadyForConnections"]);
        assert!(queue.try_next().await.is_none());
    }

    #[tokio::test]
    async fn test_event_stats() {
        let queue = EventQueue::new();
        queue.record(&SapEvent::StopRequest, Duration::from_micros(10), true).await;
        queue.record(&SapEvent::StopRequest, Duration::from_micros(30), false).await;
        let stats = queue.get_stats().await;
        assert_eq!(stats.events_processed, 2);
        assert_eq!(stats.events_by_type.get("StopRequest"), Some(&2));
        assert_eq!(stats.handler_errors, 1);
        assert_eq!(stats.avg_processing_time, 20.0);
    }

    #[tokio::test]
    async fn test_notification_filtering() {
        let bus = NotificationBus::new();
        let all = Arc::new(TestHandler::new("all", None));
        let cac_only = Arc::new(TestHandler::new("cac", Some(NotificationKind::CacEnded)));
        bus.add_handler(all.clone()).await;
        bus.add_handler(cac_only.clone()).await;

        bus.notify(SapNotification::new(
            NotificationKind::BssStarted,
            InterfaceId(0),
            Some(ChannelDescriptor::new_20(5180)),
            StatusCode::Success,
        ))
        .await;
        bus.notify(SapNotification::new(
            NotificationKind::CacEnded,
            InterfaceId(0),
            None,
            StatusCode::Success,
        ))
        .await;

        assert_eq!(all.get_call_count(), 2);
        assert_eq!(cac_only.get_call_count(), 1);
        let stats = bus.get_stats().await;
        assert_eq!(stats.emitted, 2);
        assert_eq!(stats.by_kind.get("CacEnded"), Some(&1));

        bus.remove_handler("all").await;
        bus.notify(SapNotification::new(
            NotificationKind::BssStopped,
            InterfaceId(0),
            None,
            StatusCode::Success,
        ))
        .await;
        assert_eq!(all.get_call_count(), 2);
    }
}
