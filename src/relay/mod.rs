use std::{
    future::{Future, IntoFuture},
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use derive_builder::Builder;
use kanal::{unbounded_async, AsyncSender};
use log::{error, info, warn};
use tokio::{task::JoinSet, time::timeout};
use tokio_util::sync::CancellationToken;
use ustr::UstrMap;

use crate::{
    destination::{Destination, DestinationWriterBuilder},
    dispatcher::Dispatcher,
    error::ConfigError,
    receiver::{Receiver, ReceiverTaskBuilder},
    router::{Cluster, ClusterMember, Router, RoutingTable, RoutingTableBuilder},
    statistics::{StatisticsTaskBuilder, Transmission},
    strategies::AssignStrategies,
};

pub const DEFAULT_WORKERS: usize = 16;
pub const DEFAULT_PORT: u16 = 2003;
pub const DEFAULT_STATS_INTERVAL: u64 = 60;
pub const DEFAULT_MAX_LINE_LENGTH: usize = 8192;

/// Extra time given to writers on top of their own grace period before they
/// are aborted.
const STOP_MARGIN: Duration = Duration::from_secs(1);

/// Handle to order an orderly shutdown to the referenced [`Relay`] instance
#[derive(Default, Clone)]
pub struct RelayShutdownHandle {
    cancel_token: CancellationToken,
}

impl RelayShutdownHandle {
    /// Send an orderly shutdown signal to the referenced [`Relay`] instance
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// A single relay instance. Must be built using [`RelayBuilder`].
///
/// Awaiting the relay runs it until its [`RelayShutdownHandle`] fires;
/// [`Relay::start`] gives access to the running components instead.
#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct Relay {
    receivers: Vec<Receiver>,
    routing_table: RoutingTable,
    #[builder(default = "DEFAULT_WORKERS")]
    workers: usize,
    #[builder(default)]
    assign_strategy: AssignStrategies,
    #[builder(default = "DEFAULT_MAX_LINE_LENGTH")]
    max_line_length: usize,
    #[builder(default = "DEFAULT_STATS_INTERVAL")]
    stats_interval: u64,
    #[builder(setter(into, strip_option), default)]
    self_metrics_prefix: Option<String>,
    #[builder(private, default)]
    shutdown_handle: RelayShutdownHandle,
}

impl Relay {
    /// Get the handle to order an orderly shutdown
    pub fn shutdown_handle(&self) -> RelayShutdownHandle {
        self.shutdown_handle.clone()
    }

    /// Bind every receiver and bring up the worker pool, one writer per
    /// destination and the statistics task. Any failure here is fatal and
    /// nothing is left running.
    pub async fn start(self) -> Result<RunningRelay> {
        let ingest_token = CancellationToken::new();
        let delivery_token = CancellationToken::new();

        let router = Arc::new(Router::new(self.routing_table));
        let (dispatcher, workers) = Dispatcher::new(
            router.clone(),
            self.workers,
            self.assign_strategy,
            self.max_line_length,
            ingest_token.clone(),
        )?;

        let mut sockets = Vec::with_capacity(self.receivers.len());
        for receiver in &self.receivers {
            sockets.push(receiver.bind().await?);
        }
        let local_addrs = sockets
            .iter()
            .map(|socket| socket.local_addr())
            .collect::<Result<Vec<_>, _>>()?;

        //Define channel to send statistics update
        let (stats_tx, stats_rx) = unbounded_async();

        let stat_task = StatisticsTaskBuilder::default()
            .shutdown_token(delivery_token.clone())
            .stats_rx(stats_rx)
            .dispatcher(dispatcher.clone())
            .self_metrics_prefix(self.self_metrics_prefix)
            .timeout(self.stats_interval)
            .build()?;

        let mut receiver_tasks = Vec::with_capacity(sockets.len());
        for socket in sockets {
            receiver_tasks.push(
                ReceiverTaskBuilder::default()
                    .socket(socket)
                    .dispatcher(dispatcher.clone())
                    .shutdown_token(ingest_token.clone())
                    .build()?,
            );
        }

        let mut relay = RunningRelay {
            router,
            dispatcher,
            local_addrs,
            ingest_token,
            delivery_token,
            ingest_tasks: JoinSet::new(),
            delivery_tasks: JoinSet::new(),
            writers: UstrMap::default(),
            stats_tx,
            shutdown_handle: self.shutdown_handle,
        };

        //Writers first so that nothing accepted waits for a missing writer
        for destination in relay.router.snapshot().destinations() {
            relay.spawn_writer(destination)?;
        }
        relay.delivery_tasks.spawn(stat_task.into_future());
        for worker in workers {
            relay.ingest_tasks.spawn(worker.into_future());
        }
        for task in receiver_tasks {
            relay.ingest_tasks.spawn(task.into_future());
        }

        info!(
            "Relay listening on {:?} with {} workers and {} destinations",
            relay.local_addrs,
            self.workers,
            relay.writers.len()
        );
        Ok(relay)
    }

    async fn run(self) -> Result<()> {
        let handle = self.shutdown_handle();
        let relay = self.start().await?;
        handle.cancel_token.cancelled().await;
        relay.stop().await;
        Ok(())
    }
}

impl IntoFuture for Relay {
    type Output = Result<()>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.run())
    }
}

/// The components of a started [`Relay`].
pub struct RunningRelay {
    router: Arc<Router>,
    dispatcher: Arc<Dispatcher>,
    local_addrs: Vec<SocketAddr>,
    ingest_token: CancellationToken,
    delivery_token: CancellationToken,
    ingest_tasks: JoinSet<()>,
    delivery_tasks: JoinSet<()>,
    writers: UstrMap<Arc<Destination>>,
    stats_tx: AsyncSender<Transmission>,
    shutdown_handle: RelayShutdownHandle,
}

impl RunningRelay {
    /// The active routing. Tables can only be swapped through
    /// [`RunningRelay::reconfigure`], which also starts the new writers:
    ///
    /// ```compile_fail
    /// # fn swap(relay: &crab_relay::RunningRelay, table: crab_relay::RoutingTable) {
    /// relay.router().replace(table);
    /// # }
    /// ```
    #[inline]
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    #[inline]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Addresses actually bound, in receiver order.
    #[inline]
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn shutdown_handle(&self) -> RelayShutdownHandle {
        self.shutdown_handle.clone()
    }

    /// Every destination with a running writer, including those no longer
    /// referenced by the active table.
    pub fn destinations(&self) -> Vec<Arc<Destination>> {
        self.writers.values().cloned().collect()
    }

    fn check_new(&self, destinations: &[Arc<Destination>]) -> Result<(), ConfigError> {
        match destinations.iter().find(|destination| {
            self.writers
                .get(&destination.id())
                .is_some_and(|running| !Arc::ptr_eq(running, destination))
        }) {
            Some(clash) => Err(ConfigError::DuplicateDestination(clash.id())),
            None => Ok(()),
        }
    }

    fn spawn_writer(&mut self, destination: Arc<Destination>) -> Result<()> {
        if self.writers.contains_key(&destination.id()) {
            return Ok(());
        }

        let writer = DestinationWriterBuilder::default()
            .destination(destination.clone())
            .shutdown_token(self.delivery_token.clone())
            .stats_tx(self.stats_tx.clone())
            .build()?;
        self.delivery_tasks.spawn(writer.into_future());
        self.writers.insert(destination.id(), destination);
        Ok(())
    }

    fn spawn_writers(&mut self, destinations: Vec<Arc<Destination>>) {
        for destination in destinations {
            let id = destination.id();
            if let Err(err) = self.spawn_writer(destination) {
                error!("Writer for destination {} not started. Reason: {}", id, err);
            }
        }
    }

    /// Build and validate a new routing table, then swap it in. On error the
    /// active table keeps serving. Destinations first seen here get a writer.
    pub fn reconfigure(&mut self, builder: RoutingTableBuilder) -> Result<(), ConfigError> {
        let table = builder.build()?;
        let destinations = table.destinations();
        self.check_new(&destinations)?;

        self.router.replace(table);
        self.spawn_writers(destinations);
        info!("Routing table replaced:\n{}", self.router.snapshot());
        Ok(())
    }

    /// Change the members of a cluster of the active table. Events already
    /// queued on removed members are still delivered by their writers.
    pub fn set_cluster_members(
        &mut self,
        cluster: &Cluster,
        members: Vec<ClusterMember>,
    ) -> Result<(), ConfigError> {
        let destinations: Vec<Arc<Destination>> = members
            .iter()
            .map(|member| member.destination().clone())
            .collect();
        self.check_new(&destinations)?;

        cluster.set_members(members)?;
        self.spawn_writers(destinations);
        Ok(())
    }

    /// Stop accepting and reading, then let every writer drain its queue
    /// within its grace period. Returns once every task has ended.
    pub async fn stop(mut self) {
        info!("Stopping ingestion");
        self.ingest_token.cancel();
        join_all(&mut self.ingest_tasks).await;

        info!("Draining {} destination queues", self.writers.len());
        self.delivery_token.cancel();
        let grace = self
            .writers
            .values()
            .map(|destination| destination.config().shutdown_grace())
            .max()
            .unwrap_or_default()
            + STOP_MARGIN;

        if timeout(grace, join_all(&mut self.delivery_tasks))
            .await
            .is_err()
        {
            warn!("Writers still running after {:?}, aborting them", grace);
            self.delivery_tasks.abort_all();
            join_all(&mut self.delivery_tasks).await;
        }

        for destination in self.writers.values() {
            let lost = destination.abandon();
            if lost > 0 {
                warn!(
                    "Destination {}: {} events left behind by its writer",
                    destination.id(),
                    lost
                );
            }
            let stats = destination.snapshot();
            info!(
                "Destination {}: enqueued {} dropped {} sent {} failed {}",
                destination.id(),
                stats.enqueued,
                stats.dropped,
                stats.sent,
                stats.failed
            );
        }
        self.shutdown_handle.shutdown();
        info!("Relay stopped");
    }
}

async fn join_all(tasks: &mut JoinSet<()>) {
    while let Some(res) = tasks.join_next().await {
        match res {
            Err(err) if !err.is_cancelled() => error!("Task ended abnormally: {}", err),
            _ => {}
        }
    }
}
