use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use derive_builder::Builder;
use kanal::{bounded_async, AsyncReceiver, AsyncSender};
use log::debug;
use strum::Display;
use ustr::{ustr, Ustr};

use crate::SharedEvent;

pub use writer::{DestinationWriter, DestinationWriterBuilder};

mod writer;

pub const DEFAULT_QUEUE_CAPACITY: usize = 25_000;
pub const DEFAULT_BATCH_SIZE: usize = 2_500;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(100);
pub const DEFAULT_BACKOFF_CEILING: Duration = Duration::from_secs(10);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum ConnectionState {
    #[default]
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    #[inline]
    fn can_become(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
        )
    }
}

/// Tuning of one destination's queue and writer.
#[derive(Builder, Debug, Clone)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct DestinationConfig {
    #[builder(default = "DEFAULT_QUEUE_CAPACITY")]
    queue_capacity: usize,
    #[builder(default = "DEFAULT_BATCH_SIZE")]
    batch_size: usize,
    #[builder(default = "DEFAULT_FLUSH_INTERVAL")]
    flush_interval: Duration,
    #[builder(default = "DEFAULT_CONNECT_TIMEOUT")]
    connect_timeout: Duration,
    #[builder(default = "DEFAULT_WRITE_TIMEOUT")]
    write_timeout: Duration,
    #[builder(default = "DEFAULT_BACKOFF_BASE")]
    backoff_base: Duration,
    #[builder(default = "DEFAULT_BACKOFF_CEILING")]
    backoff_ceiling: Duration,
    #[builder(default = "DEFAULT_SHUTDOWN_GRACE")]
    shutdown_grace: Duration,
    #[builder(default = "Some(DEFAULT_KEEPALIVE)")]
    keepalive: Option<Duration>,
}

impl DestinationConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(0) = self.queue_capacity {
            return Err("queue capacity must be at least 1".to_owned());
        }
        if let Some(0) = self.batch_size {
            return Err("batch size must be at least 1".to_owned());
        }
        if let (Some(base), Some(ceiling)) = (self.backoff_base, self.backoff_ceiling) {
            if base.is_zero() || base > ceiling {
                return Err(format!(
                    "backoff base {base:?} must be non zero and not above the ceiling {ceiling:?}"
                ));
            }
        }
        Ok(())
    }
}

impl Default for DestinationConfig {
    fn default() -> Self {
        DestinationConfig {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_ceiling: DEFAULT_BACKOFF_CEILING,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            keepalive: Some(DEFAULT_KEEPALIVE),
        }
    }
}

impl DestinationConfig {
    #[inline]
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    #[inline]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    #[inline]
    pub fn backoff_ceiling(&self) -> Duration {
        self.backoff_ceiling
    }

    #[inline]
    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }
}

#[derive(Debug, Default)]
struct DestinationCounters {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
    bytes_sent: AtomicU64,
    connects: AtomicU64,
    /// Events taken from the queue by the writer and not yet accounted for.
    in_flight: AtomicU64,
}

/// Point in time copy of a destination's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DestinationSnapshot {
    pub enqueued: u64,
    pub dropped: u64,
    pub sent: u64,
    pub failed: u64,
    pub bytes_sent: u64,
    pub connects: u64,
    pub queued: usize,
    pub state: ConnectionState,
}

impl DestinationSnapshot {
    /// Counter increase since `previous`; queue depth and state stay current.
    pub fn delta(&self, previous: &DestinationSnapshot) -> DestinationSnapshot {
        DestinationSnapshot {
            enqueued: self.enqueued.saturating_sub(previous.enqueued),
            dropped: self.dropped.saturating_sub(previous.dropped),
            sent: self.sent.saturating_sub(previous.sent),
            failed: self.failed.saturating_sub(previous.failed),
            bytes_sent: self.bytes_sent.saturating_sub(previous.bytes_sent),
            connects: self.connects.saturating_sub(previous.connects),
            queued: self.queued,
            state: self.state,
        }
    }
}

/// One backend: a bounded FIFO of events plus the state of its connection.
///
/// Producers only ever call [`Destination::enqueue`], which never waits. The
/// queue is drained by the single [`DestinationWriter`] spawned for it.
pub struct Destination {
    id: Ustr,
    address: String,
    config: DestinationConfig,
    queue_tx: AsyncSender<SharedEvent>,
    queue_rx: AsyncReceiver<SharedEvent>,
    state: AtomicU8,
    counters: DestinationCounters,
}

impl Destination {
    /// A destination identified by its `host:port` address.
    pub fn new(address: impl Into<String>, config: DestinationConfig) -> Arc<Self> {
        let address = address.into();
        Self::with_id(&address.clone(), address, config)
    }

    pub fn with_id(id: &str, address: impl Into<String>, config: DestinationConfig) -> Arc<Self> {
        let (queue_tx, queue_rx) = bounded_async(config.queue_capacity.max(1));

        Arc::new(Destination {
            id: ustr(id),
            address: address.into(),
            config,
            queue_tx,
            queue_rx,
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            counters: DestinationCounters::default(),
        })
    }

    /// Push `event` if there is room, otherwise count it as dropped.
    ///
    /// Never waits, whatever the connection state.
    #[inline]
    pub fn enqueue(&self, event: SharedEvent) -> bool {
        match self.queue_tx.try_send(event) {
            Ok(true) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    #[inline]
    pub fn id(&self) -> Ustr {
        self.id
    }

    #[inline]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[inline]
    pub fn config(&self) -> &DestinationConfig {
        &self.config
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Currently able to deliver; used by the failover and any-of strategies.
    #[inline]
    pub fn is_available(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    #[inline]
    pub fn queue_depth(&self) -> usize {
        self.queue_rx.len()
    }

    pub fn snapshot(&self) -> DestinationSnapshot {
        DestinationSnapshot {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            sent: self.counters.sent.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            connects: self.counters.connects.load(Ordering::Relaxed),
            queued: self.queue_depth(),
            state: self.state(),
        }
    }

    /// Count as failed everything the writer still held or left queued, and
    /// mark the connection down. Used when the writer is done or was aborted.
    pub(crate) fn abandon(&self) -> u64 {
        let mut lost = self.counters.in_flight.swap(0, Ordering::Relaxed);
        while let Ok(Some(_)) = self.queue_rx.try_recv() {
            lost += 1;
        }
        if lost > 0 {
            self.counters.failed.fetch_add(lost, Ordering::Relaxed);
        }
        if self.state() != ConnectionState::Disconnected {
            self.transition(ConnectionState::Disconnected);
        }
        lost
    }

    /// Move the connection state machine. Only the writer calls this.
    fn transition(&self, next: ConnectionState) -> bool {
        let current = self.state();
        if !current.can_become(next) {
            debug!(
                "Destination {}: ignoring transition {} -> {}",
                self.id, current, next
            );
            return false;
        }
        self.state.store(next as u8, Ordering::Release);
        true
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destination")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("state", &self.state())
            .field("queued", &self.queue_depth())
            .finish()
    }
}

#[cfg(test)]
mod destination_tests {
    use std::sync::{atomic::Ordering, Arc};

    use crate::{
        destination::{ConnectionState, Destination, DestinationConfig, DestinationConfigBuilder},
        event::MetricEvent,
    };

    fn event(i: usize) -> Arc<MetricEvent> {
        Arc::new(MetricEvent::new(&format!("test.metric.{i}"), i, 1700000000).unwrap())
    }

    #[test]
    fn test_full_queue_drops_newest() {
        let config = DestinationConfigBuilder::default()
            .queue_capacity(100)
            .build()
            .unwrap();
        let destination = Destination::new("127.0.0.1:1", config);

        let accepted = (0..150).filter(|i| destination.enqueue(event(*i))).count();
        assert_eq!(accepted, 100);

        let snapshot = destination.snapshot();
        assert_eq!(snapshot.enqueued, 100);
        assert_eq!(snapshot.dropped, 50);
        assert_eq!(snapshot.queued, 100);
        assert_eq!(snapshot.enqueued + snapshot.dropped, 150);

        //Queue keeps the oldest events, in order
        for i in 0..100 {
            let next = destination.queue_rx.try_recv().unwrap().unwrap();
            assert_eq!(next.key(), format!("test.metric.{i}"));
        }
        assert!(destination.queue_rx.try_recv().unwrap().is_none());
    }

    #[test]
    fn test_shared_event_is_not_copied() {
        let first = Destination::new("127.0.0.1:1", DestinationConfig::default());
        let second = Destination::new("127.0.0.1:2", DestinationConfig::default());
        let shared = event(0);

        assert!(first.enqueue(shared.clone()));
        assert!(second.enqueue(shared.clone()));
        assert_eq!(Arc::strong_count(&shared), 3);
    }

    #[test]
    fn test_state_machine_transitions() {
        let destination = Destination::new("127.0.0.1:1", DestinationConfig::default());
        assert_eq!(destination.state(), ConnectionState::Disconnected);

        assert!(!destination.transition(ConnectionState::Connected));
        assert!(destination.transition(ConnectionState::Connecting));
        assert!(destination.transition(ConnectionState::Disconnected));
        assert!(destination.transition(ConnectionState::Connecting));
        assert!(destination.transition(ConnectionState::Connected));
        assert!(destination.is_available());
        assert!(!destination.transition(ConnectionState::Connecting));
        assert!(destination.transition(ConnectionState::Disconnected));
        assert!(!destination.is_available());
    }

    #[test]
    fn test_config_validation() {
        assert!(DestinationConfigBuilder::default()
            .queue_capacity(0)
            .build()
            .is_err());
        assert!(DestinationConfigBuilder::default()
            .batch_size(0)
            .build()
            .is_err());

        let config = DestinationConfigBuilder::default().build().unwrap();
        assert_eq!(config.queue_capacity(), 25_000);
        assert_eq!(config.batch_size(), 2_500);
    }

    #[test]
    fn test_abandon_counts_held_and_queued_events() {
        let destination = Destination::new("127.0.0.1:1", DestinationConfig::default());
        for i in 0..5 {
            destination.enqueue(event(i));
        }
        //A writer that took two events and was stopped before writing them
        destination.queue_rx.try_recv().unwrap().unwrap();
        destination.queue_rx.try_recv().unwrap().unwrap();
        destination.counters.in_flight.store(2, Ordering::Relaxed);
        destination.force_state(ConnectionState::Connected);

        assert_eq!(destination.abandon(), 5);
        let snapshot = destination.snapshot();
        assert_eq!(snapshot.failed, 5);
        assert_eq!(snapshot.queued, 0);
        assert_eq!(snapshot.enqueued, snapshot.sent + snapshot.failed);
        assert_eq!(snapshot.state, ConnectionState::Disconnected);

        assert_eq!(destination.abandon(), 0);
        assert_eq!(destination.snapshot().failed, 5);
    }

    #[test]
    fn test_snapshot_delta() {
        let destination = Destination::new("127.0.0.1:1", DestinationConfig::default());
        let before = destination.snapshot();
        destination.enqueue(event(1));
        destination.enqueue(event(2));

        let delta = destination.snapshot().delta(&before);
        assert_eq!(delta.enqueued, 2);
        assert_eq!(delta.dropped, 0);
        assert_eq!(delta.queued, 2);
        assert_eq!(delta.state, ConnectionState::Disconnected);
    }
}
