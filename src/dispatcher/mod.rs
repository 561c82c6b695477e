use std::{
    future::{Future, IntoFuture},
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use bytes::Bytes;
use futures::{
    stream::{self, SelectAll},
    Stream, StreamExt,
};
use kanal::{unbounded_async, AsyncReceiver, AsyncSender};
use log::{debug, info, warn};
use nohash_hasher::IntMap;
use tokio::{net::TcpStream, select};
use tokio_util::{codec::FramedRead, sync::CancellationToken};

use crate::{
    error::{ConfigError, FrameError},
    event::{datagram_lines, Frame, LineFramer, MetricEvent},
    router::Router,
    strategies::{AssignStrategies, AssignStrategy},
};

/// Work handed to a worker by the dispatcher.
pub enum WorkerInput {
    Connection {
        id: u64,
        stream: TcpStream,
        peer: SocketAddr,
    },
    Datagram(Bytes),
}

enum ConnectionEvent {
    Frame(Frame),
    Failed(io::Error),
    Closed,
}

type ConnectionStream = Pin<Box<dyn Stream<Item = (u64, ConnectionEvent)> + Send>>;

/// Ingestion counters shared by the dispatcher and all its workers.
#[derive(Default)]
pub struct DispatchCounters {
    received: AtomicU64,
    malformed: AtomicU64,
    unrouted: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatcherSnapshot {
    pub received: u64,
    pub malformed: u64,
    pub unrouted: u64,
    pub connections: usize,
}

impl DispatcherSnapshot {
    /// Counter increase since `previous`; the connection count stays current.
    pub fn delta(&self, previous: &DispatcherSnapshot) -> DispatcherSnapshot {
        DispatcherSnapshot {
            received: self.received.saturating_sub(previous.received),
            malformed: self.malformed.saturating_sub(previous.malformed),
            unrouted: self.unrouted.saturating_sub(previous.unrouted),
            connections: self.connections,
        }
    }
}

/// Parse one frame and hand the event to every destination it routes to.
fn dispatch_line(router: &Router, counters: &DispatchCounters, line: &[u8]) {
    match MetricEvent::parse(line) {
        Ok(event) => {
            counters.received.fetch_add(1, Ordering::Relaxed);
            route_event(router, counters, event);
        }
        Err(FrameError::Empty) => {}
        Err(err) => {
            counters.malformed.fetch_add(1, Ordering::Relaxed);
            debug!("Discarding malformed line: {}", err);
        }
    }
}

/// Routing result empty => the event is dropped and counted as unrouted.
#[inline]
fn route_event(router: &Router, counters: &DispatchCounters, event: MetricEvent) {
    let destinations = router.route(&event);
    if destinations.is_empty() {
        counters.unrouted.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let event = Arc::new(event);
    for destination in destinations {
        destination.enqueue(event.clone());
    }
}

struct WorkerSlot {
    inbox: AsyncSender<WorkerInput>,
    load: Arc<AtomicUsize>,
}

/// Fixed pool of [`DispatchWorker`]s. Connections are handed to a worker
/// once and stay with it until they close.
pub struct Dispatcher {
    workers: Vec<WorkerSlot>,
    strategy: AssignStrategies,
    cursor: Mutex<usize>,
    next_connection_id: AtomicU64,
    max_line_length: usize,
    counters: Arc<DispatchCounters>,
    router: Arc<Router>,
}

impl Dispatcher {
    /// Create the pool. The returned workers must be spawned by the caller.
    pub fn new(
        router: Arc<Router>,
        workers: usize,
        strategy: AssignStrategies,
        max_line_length: usize,
        shutdown_token: CancellationToken,
    ) -> Result<(Arc<Self>, Vec<DispatchWorker>), ConfigError> {
        if workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if max_line_length == 0 {
            return Err(ConfigError::ZeroLineLength);
        }

        let counters = Arc::new(DispatchCounters::default());
        let mut slots = Vec::with_capacity(workers);
        let mut tasks = Vec::with_capacity(workers);

        for id in 0..workers {
            let (inbox_tx, inbox_rx) = unbounded_async();
            let load = Arc::new(AtomicUsize::new(0));

            tasks.push(DispatchWorker {
                id,
                shutdown_token: shutdown_token.clone(),
                inbox: inbox_rx,
                router: router.clone(),
                counters: counters.clone(),
                load: load.clone(),
                max_line_length,
                connections: IntMap::default(),
            });
            slots.push(WorkerSlot {
                inbox: inbox_tx,
                load,
            });
        }

        let dispatcher = Dispatcher {
            workers: slots,
            strategy,
            cursor: Mutex::new(fastrand::usize(..workers)),
            next_connection_id: AtomicU64::new(0),
            max_line_length,
            counters,
            router,
        };
        Ok((Arc::new(dispatcher), tasks))
    }

    /// Pick the next worker under the pool lock; `counted` inputs add to its load.
    fn pick_worker(&self, counted: bool) -> usize {
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let loads: Vec<usize> = self
            .workers
            .iter()
            .map(|worker| worker.load.load(Ordering::Relaxed))
            .collect();
        let idx = self.strategy.assign(&loads, &mut cursor);
        if counted {
            self.workers[idx].load.fetch_add(1, Ordering::Relaxed);
        }
        idx
    }

    /// Hand an accepted connection to a worker and return its index.
    pub fn assign(&self, stream: TcpStream, peer: SocketAddr) -> usize {
        let idx = self.pick_worker(true);
        let worker = &self.workers[idx];
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);

        if !matches!(
            worker.inbox.try_send(WorkerInput::Connection { id, stream, peer }),
            Ok(true)
        ) {
            worker.load.fetch_sub(1, Ordering::Relaxed);
            warn!("Worker {} is gone, closing connection from {}", idx, peer);
        }
        idx
    }

    /// Hand a datagram to a worker. Datagrams are not counted in worker load.
    pub fn assign_datagram(&self, data: Bytes) {
        let worker = &self.workers[self.pick_worker(false)];

        if !matches!(worker.inbox.try_send(WorkerInput::Datagram(data)), Ok(true)) {
            warn!("Dispatch worker is gone, discarding datagram");
        }
    }

    /// Route an event produced inside the relay (self metrics).
    pub fn inject(&self, event: MetricEvent) {
        route_event(&self.router, &self.counters, event);
    }

    pub fn snapshot(&self) -> DispatcherSnapshot {
        DispatcherSnapshot {
            received: self.counters.received.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            unrouted: self.counters.unrouted.load(Ordering::Relaxed),
            connections: self.worker_loads().iter().sum(),
        }
    }

    /// Open connections per worker.
    pub fn worker_loads(&self) -> Vec<usize> {
        self.workers
            .iter()
            .map(|worker| worker.load.load(Ordering::Relaxed))
            .collect()
    }

    #[inline]
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    #[inline]
    pub fn max_line_length(&self) -> usize {
        self.max_line_length
    }
}

/// One execution context of the pool: reads every connection assigned to it,
/// each through its own framer, and routes what it reads.
pub struct DispatchWorker {
    id: usize,
    shutdown_token: CancellationToken,
    inbox: AsyncReceiver<WorkerInput>,
    router: Arc<Router>,
    counters: Arc<DispatchCounters>,
    load: Arc<AtomicUsize>,
    max_line_length: usize,
    connections: IntMap<u64, SocketAddr>,
}

impl DispatchWorker {
    fn open(&mut self, id: u64, stream: TcpStream, peer: SocketAddr) -> ConnectionStream {
        debug!("Worker {}: peer {} connected", self.id, peer);
        self.connections.insert(id, peer);

        let frames = FramedRead::new(stream, LineFramer::new(self.max_line_length)).map(move |res| {
            let event = match res {
                Ok(frame) => ConnectionEvent::Frame(frame),
                Err(err) => ConnectionEvent::Failed(err),
            };
            (id, event)
        });
        Box::pin(frames.chain(stream::once(async move { (id, ConnectionEvent::Closed) })))
    }

    fn close(&mut self, id: u64) {
        if let Some(peer) = self.connections.remove(&id) {
            debug!("Worker {}: peer {} disconnected", self.id, peer);
            self.load.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn handle_datagram(&self, data: &[u8]) {
        for line in datagram_lines(data) {
            if line.len() > self.max_line_length {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            dispatch_line(&self.router, &self.counters, line);
        }
    }

    fn handle_event(&mut self, id: u64, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Frame(Frame::Line(line)) => {
                dispatch_line(&self.router, &self.counters, &line)
            }
            ConnectionEvent::Frame(Frame::Oversized) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
            }
            ConnectionEvent::Failed(err) => {
                let peer = self.connections.get(&id).copied();
                warn!("Worker {}: read from {:?} failed. Reason: {}", self.id, peer, err);
            }
            ConnectionEvent::Closed => self.close(id),
        }
    }

    async fn run(mut self) {
        let mut streams: SelectAll<ConnectionStream> = SelectAll::new();
        let mut inbox_open = true;

        loop {
            select! {
                _ = self.shutdown_token.cancelled() => {
                    info!("Shutting down dispatch worker {}", self.id);
                    break;
                }

                input = self.inbox.recv(), if inbox_open => match input {
                    Ok(WorkerInput::Connection { id, stream, peer }) => {
                        let connection = self.open(id, stream, peer);
                        streams.push(connection);
                    }
                    Ok(WorkerInput::Datagram(data)) => self.handle_datagram(&data),
                    Err(_) => inbox_open = false,
                },

                Some((id, event)) = streams.next(), if !streams.is_empty() => {
                    self.handle_event(id, event);
                }

                else => break,
            }
        }

        //Dropping the streams closes the remaining connections
        drop(streams);
        let open = self.connections.len();
        self.connections.clear();
        self.load.fetch_sub(open, Ordering::Relaxed);
    }
}

impl IntoFuture for DispatchWorker {
    type Output = ();
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.run())
    }
}
