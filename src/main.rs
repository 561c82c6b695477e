use std::{future::IntoFuture, sync::Arc, time::Duration};

use anyhow::Result;
use log::{info, LevelFilter};
use mimalloc::MiMalloc;
use simple_logger::SimpleLogger;
use tokio::{
    runtime::{Builder, Runtime},
    signal,
};

use crab_relay::{
    Cluster, DestinationConfig, DestinationConfigBuilder, Matcher, Receiver, Relay, RelayBuilder,
    RoutingTable, Target,
};
use env_var::{load_env_var, parse_destinations, self_metrics_prefix, EnvVars};

mod env_var;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> Result<()> {
    //Init logger
    SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .env()
        .init()?;

    //Load env variables
    let vars = load_env_var()?;

    //Instantiate a relay instance
    let relay = relay_builder_helper(&vars)?;

    runtime_builder_helper(&vars)?.block_on(start_relaying(relay))
}

async fn start_relaying(relay: Relay) -> Result<()> {
    let relay_handle = relay.shutdown_handle();

    tokio::spawn(async move {
        shutdown_signal().await;
        relay_handle.shutdown();
    });

    relay.into_future().await
}

#[cfg(unix)]
async fn shutdown_signal() {
    use signal::unix::{signal as unix_signal, SignalKind};

    match unix_signal(SignalKind::terminate()) {
        Ok(mut sigterm) => tokio::select! {
            _ = signal::ctrl_c() => info!("Received CTRL-C signal"),
            _ = sigterm.recv() => info!("Received SIGTERM signal"),
        },
        Err(_) => {
            let _ = signal::ctrl_c().await;
            info!("Received CTRL-C signal");
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    info!("Received CTRL-C signal");
}

fn destination_config_helper(vars: &EnvVars) -> Result<DestinationConfig> {
    let config = DestinationConfigBuilder::default()
        .queue_capacity(vars.queue_capacity)
        .batch_size(vars.batch_size)
        .flush_interval(Duration::from_millis(vars.flush_interval_ms))
        .backoff_ceiling(Duration::from_millis(vars.backoff_ceiling_ms))
        .shutdown_grace(Duration::from_millis(vars.shutdown_grace_ms))
        .build()?;
    Ok(config)
}

fn receivers_builder_helper(vars: &EnvVars) -> Vec<Receiver> {
    let ip = vars.listen_ip.to_owned();
    let mut receivers = vec![Receiver::new_tcp_stream(ip.clone(), vars.listen_port)];
    if vars.use_udp {
        receivers.push(Receiver::new_udp_framed(
            ip,
            vars.listen_port,
            vars.udp_buffer_size,
        ));
    }
    receivers
}

fn routing_table_builder_helper(vars: &EnvVars) -> Result<RoutingTable> {
    let members = parse_destinations(&vars.destinations, &destination_config_helper(vars)?)?;

    info!(
        "Selected Cluster Strategy: {} (replication {})",
        vars.cluster_strategy, vars.replication_factor
    );
    let cluster = Cluster::new(
        &vars.cluster_name,
        vars.cluster_strategy,
        vars.replication_factor,
        members,
    )?;

    let table = RoutingTable::builder()
        .rule(Matcher::Any, vec![Target::from(Arc::new(cluster))], true)
        .build()?;
    info!("Routing table:\n{}", table);
    Ok(table)
}

fn relay_builder_helper(vars: &EnvVars) -> Result<Relay> {
    info!("Selected Assign Strategy: {}", vars.assign_strategy);

    let mut builder = RelayBuilder::default()
        .receivers(receivers_builder_helper(vars))
        .routing_table(routing_table_builder_helper(vars)?)
        .workers(vars.workers)
        .assign_strategy(vars.assign_strategy)
        .max_line_length(vars.max_line_length)
        .stats_interval(vars.stats_interval);

    match self_metrics_prefix(&vars.self_metrics_prefix) {
        Some(prefix) => {
            info!("Self metrics published under {}", prefix);
            builder = builder.self_metrics_prefix(prefix);
        }
        None => info!("Self metrics disabled"),
    }
    Ok(builder.build()?)
}

fn runtime_builder_helper(vars: &EnvVars) -> Result<Runtime> {
    let mut rt_builder = Builder::new_multi_thread();
    if vars.worker_threads > 0 {
        rt_builder.worker_threads(vars.worker_threads);
    }
    Ok(rt_builder.enable_all().build()?)
}
