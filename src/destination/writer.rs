use std::{
    future::{Future, IntoFuture},
    io::{self, ErrorKind},
    pin::Pin,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use coarsetime::Instant;
use derive_builder::Builder;
use kanal::AsyncSender;
use log::{debug, info, warn};
use socket2::{SockRef, TcpKeepalive};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    select,
    time::{self, sleep, timeout, timeout_at},
};
use tokio_util::sync::CancellationToken;

use crate::{
    destination::{ConnectionState, Destination},
    statistics::{StatisticData, Transmission},
    SharedEvent,
};

enum Delivery {
    /// The connection broke; `delivered` tells whether any batch made it first.
    Failed { delivered: bool },
    Shutdown(TcpStream),
}

/// Sender loop of one destination: connect, batch, write, reconnect.
///
/// Events taken from the queue are always accounted for: written batches
/// count as `sent`, batches whose write fails (or that are still pending when
/// the shutdown grace period ends) count as `failed`.
#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct DestinationWriter {
    destination: Arc<Destination>,
    shutdown_token: CancellationToken,
    #[builder(setter(strip_option), default)]
    stats_tx: Option<AsyncSender<Transmission>>,
    #[builder(private, default = "Vec::new()")]
    batch: Vec<SharedEvent>,
    #[builder(private, default = "Vec::new()")]
    buffer: Vec<u8>,
}

impl DestinationWriter {
    async fn run(mut self) {
        let config = self.destination.config.clone();
        let mut backoff = config.backoff_base;
        let mut failed_attempts = 0usize;

        info!(
            "Writer for destination {} ({}) started",
            self.destination.id, self.destination.address
        );

        loop {
            if self.shutdown_token.is_cancelled() {
                self.drain(None).await;
                break;
            }

            let connected = select! {
                biased;
                _ = self.shutdown_token.cancelled() => {
                    self.destination.transition(ConnectionState::Disconnected);
                    None
                }
                stream = self.connect() => stream,
            };

            let Some(stream) = connected else {
                if self.shutdown_token.is_cancelled() {
                    continue;
                }
                failed_attempts += 1;
                if failed_attempts == 1 {
                    warn!(
                        "Destination {} unreachable, retrying every {:?} up to {:?}",
                        self.destination.id, backoff, config.backoff_ceiling
                    );
                }
                self.pause(backoff).await;
                backoff = (backoff * 2).min(config.backoff_ceiling);
                continue;
            };

            if failed_attempts > 0 {
                info!(
                    "Destination {} reachable again after {} attempts",
                    self.destination.id, failed_attempts
                );
            }
            failed_attempts = 0;

            let connected_at = time::Instant::now();
            match self.deliver(stream).await {
                Delivery::Failed { delivered } => {
                    //Back to base once a connection delivered and outlived the current backoff
                    if delivered && connected_at.elapsed() >= backoff {
                        backoff = config.backoff_base;
                    }
                    debug!(
                        "Reconnecting to destination {} in {:?}",
                        self.destination.id, backoff
                    );
                    self.pause(backoff).await;
                    backoff = (backoff * 2).min(config.backoff_ceiling);
                }
                Delivery::Shutdown(stream) => {
                    self.drain(Some(stream)).await;
                    break;
                }
            }
        }

        info!("Shutting down writer for destination {}", self.destination.id);
    }

    async fn pause(&self, delay: Duration) {
        select! {
            _ = self.shutdown_token.cancelled() => {}
            _ = sleep(delay) => {}
        }
    }

    async fn connect(&self) -> Option<TcpStream> {
        let destination = &self.destination;
        destination.transition(ConnectionState::Connecting);

        let attempt = timeout(
            destination.config.connect_timeout,
            TcpStream::connect(destination.address.as_str()),
        )
        .await;

        match attempt {
            Ok(Ok(stream)) => {
                self.tune(&stream);
                destination.transition(ConnectionState::Connected);
                destination.counters.connects.fetch_add(1, Ordering::Relaxed);
                info!("Connected to destination {}", destination.id);
                Some(stream)
            }
            Ok(Err(err)) => {
                destination.transition(ConnectionState::Disconnected);
                debug!("Connection to {} failed. Reason: {}", destination.id, err);
                None
            }
            Err(_) => {
                destination.transition(ConnectionState::Disconnected);
                debug!("Connection to {} timed out", destination.id);
                None
            }
        }
    }

    fn tune(&self, stream: &TcpStream) {
        if let Err(err) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on {}: {}", self.destination.id, err);
        }

        if let Some(interval) = self.destination.config.keepalive {
            let keepalive = TcpKeepalive::new().with_time(interval);
            #[cfg(target_os = "linux")]
            let keepalive = keepalive.with_interval(interval);

            if let Err(err) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
                debug!("Failed to set TCP keep-alive on {}: {}", self.destination.id, err);
            }
        }
    }

    async fn deliver(&mut self, mut stream: TcpStream) -> Delivery {
        let mut delivered = false;
        //Backends never talk back: anything read is discarded, EOF means the peer left
        let mut discard = [0u8; 64];

        loop {
            let first = select! {
                biased;
                _ = self.shutdown_token.cancelled() => return Delivery::Shutdown(stream),
                read = stream.read(&mut discard) => {
                    match read {
                        Ok(0) => warn!("Destination {} closed the connection", self.destination.id),
                        Ok(_) => continue,
                        Err(err) => warn!(
                            "Connection to destination {} lost. Reason: {}",
                            self.destination.id, err
                        ),
                    }
                    self.destination.transition(ConnectionState::Disconnected);
                    return Delivery::Failed { delivered };
                }
                event = self.destination.queue_rx.recv() => match event {
                    Ok(event) => event,
                    Err(_) => return Delivery::Shutdown(stream),
                }
            };

            self.fill_batch(first).await;
            if self.shutdown_token.is_cancelled() {
                //The drain writes the held batch first
                return Delivery::Shutdown(stream);
            }
            if self.write_batch(&mut stream, true).await.is_err() {
                return Delivery::Failed { delivered };
            }
            delivered = true;
        }
    }

    #[inline]
    fn hold(&mut self, event: SharedEvent) {
        self.batch.push(event);
        self.destination
            .counters
            .in_flight
            .store(self.batch.len() as u64, Ordering::Relaxed);
    }

    #[inline]
    fn release(&mut self) {
        self.batch.clear();
        self.destination.counters.in_flight.store(0, Ordering::Relaxed);
    }

    /// Complete the batch with whatever arrives before the flush deadline.
    async fn fill_batch(&mut self, first: SharedEvent) {
        let batch_size = self.destination.config.batch_size;
        let deadline = time::Instant::now() + self.destination.config.flush_interval;

        self.hold(first);
        while self.batch.len() < batch_size {
            let next = match self.destination.queue_rx.try_recv() {
                Ok(Some(event)) => Some(event),
                Ok(None) => timeout_at(deadline, self.destination.queue_rx.recv())
                    .await
                    .ok()
                    .and_then(Result::ok),
                Err(_) => None,
            };
            match next {
                Some(event) => self.hold(event),
                None => break,
            }
        }
    }

    /// Write the current batch. With `interruptible` set, a shutdown request
    /// aborts the write and the batch counts as failed.
    async fn write_batch(&mut self, stream: &mut TcpStream, interruptible: bool) -> io::Result<()> {
        let events = self.batch.len();
        if events == 0 {
            return Ok(());
        }

        self.buffer.clear();
        for event in &self.batch {
            self.buffer.extend_from_slice(event.raw());
        }

        let write = timeout(
            self.destination.config.write_timeout,
            stream.write_all(&self.buffer),
        );
        let outcome = if interruptible {
            select! {
                biased;
                _ = self.shutdown_token.cancelled() => Ok(Err(io::Error::new(
                    ErrorKind::Interrupted,
                    "shutdown requested during write",
                ))),
                outcome = write => outcome,
            }
        } else {
            write.await
        };
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(ErrorKind::TimedOut, "write timed out")),
        };

        let counters = &self.destination.counters;
        match &result {
            Ok(()) => {
                counters.sent.fetch_add(events as u64, Ordering::Relaxed);
                counters
                    .bytes_sent
                    .fetch_add(self.buffer.len() as u64, Ordering::Relaxed);
                debug!(
                    "{} events ({} bytes) flushed to {}",
                    events,
                    self.buffer.len(),
                    self.destination.id
                );
                let stat = StatisticData::new(
                    self.batch[0].recv_time(),
                    Instant::now(),
                    self.buffer.len(),
                    events,
                    self.destination.id.precomputed_hash(),
                );
                self.send_stat(Transmission::Delivered(stat));
            }
            Err(err) => {
                self.destination.transition(ConnectionState::Disconnected);
                counters.failed.fetch_add(events as u64, Ordering::Relaxed);
                warn!(
                    "Write to destination {} failed, {} events lost. Reason: {}",
                    self.destination.id, events, err
                );
                self.send_stat(Transmission::Lost(events));
            }
        }

        self.release();
        result
    }

    /// Flush what is left in the queue within the grace period, then count
    /// the remainder as failed.
    async fn drain(&mut self, stream: Option<TcpStream>) {
        let grace = self.destination.config.shutdown_grace;
        let completed = timeout(grace, self.flush_remaining(stream)).await.is_ok();

        self.batch.clear();
        let lost = self.destination.abandon();
        if lost > 0 {
            warn!(
                "Destination {}: {} queued events discarded at shutdown",
                self.destination.id, lost
            );
            self.send_stat(Transmission::Lost(lost as usize));
        } else if completed {
            debug!("Destination {} drained", self.destination.id);
        }
    }

    async fn flush_remaining(&mut self, mut stream: Option<TcpStream>) {
        let config = self.destination.config.clone();
        let mut backoff = config.backoff_base;

        while !self.batch.is_empty() || !self.destination.queue_rx.is_empty() {
            let mut connected = match stream.take() {
                Some(connected) => connected,
                None => match self.connect().await {
                    Some(connected) => connected,
                    None => {
                        sleep(backoff).await;
                        backoff = (backoff * 2).min(config.backoff_ceiling);
                        continue;
                    }
                },
            };

            while self.batch.len() < config.batch_size {
                match self.destination.queue_rx.try_recv() {
                    Ok(Some(event)) => self.hold(event),
                    _ => break,
                }
            }

            match self.write_batch(&mut connected, false).await {
                Ok(()) => stream = Some(connected),
                Err(_) => {
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(config.backoff_ceiling);
                }
            }
        }

        if let Some(mut connected) = stream {
            let _ = connected.shutdown().await;
        }
    }

    #[inline]
    fn send_stat(&self, stat: Transmission) {
        if let Some(stats_tx) = &self.stats_tx {
            let _ = stats_tx.try_send(stat);
        }
    }
}

impl IntoFuture for DestinationWriter {
    type Output = ();
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.run())
    }
}
