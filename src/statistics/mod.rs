use std::{
    fmt::Display,
    future::{Future, IntoFuture},
    pin::Pin,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use byte_unit::{Byte, UnitType};
use coarsetime::{Duration, Instant};
use derive_builder::Builder;
use derive_new::new;
use itertools::{
    Itertools,
    MinMaxResult::{MinMax, NoElements, OneElement},
};
use kanal::AsyncReceiver;
use log::{info, warn};
use nohash_hasher::IntSet;
use tokio::{select, time::interval_at};
use tokio_util::sync::CancellationToken;
use ustr::UstrMap;

use crate::{
    destination::{Destination, DestinationSnapshot},
    dispatcher::{Dispatcher, DispatcherSnapshot},
    event::MetricEvent,
    relay::DEFAULT_STATS_INTERVAL,
};

/// Outcome of one writer flush, reported to the collector.
pub enum Transmission {
    Delivered(StatisticData),
    Lost(usize),
}

trait FlushStats {
    fn record_flush(&mut self, flush: &StatisticData);
    fn record_loss(&mut self, events: usize);
    fn summary(&self) -> Option<FlushSummary>;
    fn clear(&mut self);

    fn take_summary(&mut self) -> Option<FlushSummary> {
        let summary = self.summary();
        self.clear();
        summary
    }
}

/// What the writers did during one statistics period.
#[derive(Debug, PartialEq)]
struct FlushSummary {
    flushes: usize,
    delivered: usize,
    lost: usize,
    destinations: usize,
    bytes_per_sec: f32,
    fastest: Duration,
    slowest: Duration,
    average: Duration,
}

impl Display for FlushSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let throughput = Byte::from_f32(self.bytes_per_sec * 8.)
            .unwrap_or_default()
            .get_appropriate_unit(UnitType::Decimal)
            .to_string();
        //Drop the trailing "B": the figure is in bits
        let throughput = &throughput[0..throughput.len() - 1];

        write!(
            f,
            "Delivered {} events in {} flushes to {} destinations, lost {} | {throughput}bit/s | receive to flush latency <min: {}, max: {}, average: {}> ms",
            self.delivered,
            self.flushes,
            self.destinations,
            self.lost,
            self.fastest.as_millis(),
            self.slowest.as_millis(),
            self.average.as_millis()
        )
    }
}

#[derive(Copy, Clone)]
struct Flush {
    latency: Duration,
    bytes: usize,
    events: usize,
}

/// Accumulates writer reports between two ticks.
#[derive(Clone, new)]
pub struct StatsHolder {
    period: Duration,
    #[new(default)]
    flushes: Vec<Flush>,
    #[new(default)]
    lost: usize,
    #[new(default)]
    destinations: IntSet<u64>,
}

impl Default for StatsHolder {
    fn default() -> Self {
        StatsHolder::new(Duration::new(DEFAULT_STATS_INTERVAL, 0))
    }
}

impl FlushStats for StatsHolder {
    fn record_flush(&mut self, flush: &StatisticData) {
        self.flushes.push(Flush {
            latency: flush.send_time.duration_since(flush.recv_time),
            bytes: flush.size,
            events: flush.events,
        });
        self.destinations.insert(flush.destination_key);
    }

    fn record_loss(&mut self, events: usize) {
        self.lost += events;
    }

    fn summary(&self) -> Option<FlushSummary> {
        if self.flushes.is_empty() && self.lost == 0 {
            return None;
        }

        let zero = Duration::new(0, 0);
        let latencies = self.flushes.iter().map(|flush| flush.latency);
        let (fastest, slowest) = match latencies.clone().minmax() {
            NoElements => (zero, zero),
            OneElement(latency) => (latency, latency),
            MinMax(min, max) => (min, max),
        };
        let average = match self.flushes.len() {
            0 => zero,
            count => latencies.fold(zero, |acc, latency| acc + latency) / count as u32,
        };

        let bytes: usize = self.flushes.iter().map(|flush| flush.bytes).sum();

        Some(FlushSummary {
            flushes: self.flushes.len(),
            delivered: self.flushes.iter().map(|flush| flush.events).sum(),
            lost: self.lost,
            destinations: self.destinations.len(),
            bytes_per_sec: bytes as f32 / self.period.as_secs().max(1) as f32,
            fastest,
            slowest,
            average,
        })
    }

    fn clear(&mut self) {
        self.flushes.clear();
        self.lost = 0;
        self.destinations.clear();
    }
}

/// One successful batch write: when its oldest event was received, when it
/// was flushed, how many bytes and events it carried and to which destination.
#[derive(new)]
pub struct StatisticData {
    recv_time: Instant,
    send_time: Instant,
    size: usize,
    events: usize,
    destination_key: u64,
}

/// Metric path component for a destination id: dots and colons would add
/// levels to the path.
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| match c {
            '.' | ':' | ' ' | '/' => '_',
            c => c,
        })
        .collect()
}

/// Relay self metrics for one tick, routed like any received event.
fn self_metrics(
    prefix: &str,
    timestamp: u64,
    dispatch: &DispatcherSnapshot,
    destinations: &[(&Destination, DestinationSnapshot)],
) -> Vec<MetricEvent> {
    let mut lines = vec![
        (format!("{prefix}.metricsReceived"), dispatch.received),
        (format!("{prefix}.malformed"), dispatch.malformed),
        (format!("{prefix}.unrouted"), dispatch.unrouted),
        (format!("{prefix}.connections"), dispatch.connections as u64),
    ];
    for (destination, delta) in destinations {
        let base = format!("{prefix}.destinations.{}", sanitize(destination.id().as_str()));
        lines.push((format!("{base}.sent"), delta.sent));
        lines.push((format!("{base}.dropped"), delta.dropped));
        lines.push((format!("{base}.failed"), delta.failed));
        lines.push((format!("{base}.queued"), delta.queued as u64));
    }

    lines
        .into_iter()
        .filter_map(|(key, value)| MetricEvent::new(&key, value, timestamp).ok())
        .collect()
}

/// Periodic collector: snapshots the counters of the dispatcher and of every
/// destination in the active routing table on each tick, logs the increase
/// since the previous tick and, with a prefix set, routes the figures back
/// through the relay as metrics.
#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct StatisticsTask {
    shutdown_token: CancellationToken,
    stats_rx: AsyncReceiver<Transmission>,
    dispatcher: Arc<Dispatcher>,
    #[builder(default)]
    self_metrics_prefix: Option<String>,
    #[builder(setter(custom))]
    timeout: Duration,
    #[builder(private)]
    holder: StatsHolder,
    #[builder(private, default)]
    previous_dispatch: DispatcherSnapshot,
    #[builder(private, default)]
    previous_destinations: UstrMap<DestinationSnapshot>,
}

impl StatisticsTaskBuilder {
    pub fn timeout(mut self, stats_interval: u64) -> Self {
        let timeout = Duration::new(stats_interval.max(1), 0);
        self.timeout = Some(timeout);
        self.holder = Some(StatsHolder::new(timeout));
        self
    }
}

impl StatisticsTask {
    fn tick(&mut self) {
        match self.holder.take_summary() {
            Some(summary) => info!("{}", summary),
            None => info!("No flush in the last {} seconds", self.timeout.as_secs()),
        }

        let dispatch = self.dispatcher.snapshot();
        let dispatch_delta = dispatch.delta(&self.previous_dispatch);
        self.previous_dispatch = dispatch;
        info!(
            "Received {} metrics, {} malformed, {} unrouted, {} open connections",
            dispatch_delta.received,
            dispatch_delta.malformed,
            dispatch_delta.unrouted,
            dispatch_delta.connections
        );

        let destinations = self.dispatcher.router().snapshot().destinations();
        let mut deltas = Vec::with_capacity(destinations.len());
        for destination in &destinations {
            let current = destination.snapshot();
            let previous = self
                .previous_destinations
                .insert(destination.id(), current)
                .unwrap_or_default();
            let delta = current.delta(&previous);

            info!(
                "Destination {} [{}]: sent {} dropped {} failed {} queued {}",
                destination.id(),
                delta.state,
                delta.sent,
                delta.dropped,
                delta.failed,
                delta.queued
            );
            if delta.dropped > 0 {
                warn!(
                    "Destination {} dropped {} events: queue full",
                    destination.id(),
                    delta.dropped
                );
            }
            deltas.push((destination.as_ref(), delta));
        }

        if let Some(prefix) = &self.self_metrics_prefix {
            let timestamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or_default();
            for event in self_metrics(prefix, timestamp, &dispatch_delta, &deltas) {
                self.dispatcher.inject(event);
            }
        }
    }

    async fn run(mut self) {
        //Arm the timer to produce statistics at regular intervals
        let start = tokio::time::Instant::now() + self.timeout.into();
        let mut timer = interval_at(start, self.timeout.into());
        let mut stats_open = true;

        loop {
            select! {
                _ = self.shutdown_token.cancelled() => {
                    info!("Shutting down statistics task");
                    break
                }
                _ = timer.tick() => self.tick(),
                stat = self.stats_rx.recv(), if stats_open => match stat {
                    Ok(Transmission::Delivered(flush)) => self.holder.record_flush(&flush),
                    Ok(Transmission::Lost(events)) => self.holder.record_loss(events),
                    Err(_) => stats_open = false,
                }
            }
        }
    }
}

impl IntoFuture for StatisticsTask {
    type Output = ();
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.run())
    }
}

#[cfg(test)]
mod statistics_tests {
    use coarsetime::{Duration, Instant};

    use crate::{
        destination::{Destination, DestinationConfig, DestinationSnapshot},
        dispatcher::DispatcherSnapshot,
        statistics::*,
    };

    fn flush(reference: Instant, received: u64, sent: u64, size: usize, events: usize, key: u64) -> StatisticData {
        StatisticData::new(
            reference + Duration::new(received, 0),
            reference + Duration::new(sent, 0),
            size,
            events,
            key,
        )
    }

    #[test]
    fn test_stats_holder() {
        let mut stats: Box<dyn FlushStats> = Box::new(StatsHolder::new(Duration::new(10, 0)));
        let reference = Instant::now();

        stats.record_loss(3);
        stats.record_flush(&flush(reference, 0, 2, 128, 2, 1));
        stats.record_flush(&flush(reference, 3, 4, 128, 2, 2));
        stats.record_flush(&flush(reference, 4, 10, 256, 4, 1));

        let oracle = FlushSummary {
            flushes: 3,
            delivered: 8,
            lost: 3,
            destinations: 2,
            bytes_per_sec: 512. / 10.,
            fastest: Duration::new(1, 0),
            slowest: Duration::new(6, 0),
            average: Duration::new(3, 0),
        };

        let summary = stats.take_summary();
        assert_ne!(summary, None);

        let summary = summary.unwrap();
        assert_eq!(summary, oracle);
        assert_eq!(stats.summary(), None);

        println!("{}", summary);
    }

    #[test]
    fn test_losses_alone_are_reported() {
        let mut stats = StatsHolder::default();
        stats.record_loss(5);

        let summary = stats.summary().unwrap();
        assert_eq!(summary.lost, 5);
        assert_eq!(summary.delivered, 0);
        assert_eq!(summary.average, Duration::new(0, 0));
    }

    #[test]
    fn test_self_metrics() {
        let destination = Destination::new("10.0.0.1:2003", DestinationConfig::default());
        let dispatch = DispatcherSnapshot {
            received: 10,
            malformed: 1,
            unrouted: 2,
            connections: 3,
        };
        let delta = DestinationSnapshot {
            sent: 7,
            dropped: 1,
            queued: 4,
            ..Default::default()
        };

        let events = self_metrics("relays.test", 1700000000, &dispatch, &[(&destination, delta)]);
        let lines: Vec<&str> = events
            .iter()
            .map(|e| std::str::from_utf8(e.raw()).unwrap())
            .collect();

        assert_eq!(lines.len(), 8);
        assert!(lines.contains(&"relays.test.metricsReceived 10 1700000000\n"));
        assert!(lines.contains(&"relays.test.destinations.10_0_0_1_2003.sent 7 1700000000\n"));
        assert!(lines.contains(&"relays.test.destinations.10_0_0_1_2003.queued 4 1700000000\n"));
    }
}
