use std::{sync::Arc, time::Duration};

use crab_relay::{
    Cluster, ClusterMember, ClusterStrategies, Destination, DestinationConfig,
    DestinationConfigBuilder, Matcher, Receiver, RelayBuilder, RoutingTable, RunningRelay,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
    time::{sleep, timeout, Instant},
};

async fn backend() -> (String, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let handle = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut lines = BufReader::new(socket).lines();
        let mut received = Vec::new();
        while let Ok(Some(line)) = lines.next_line().await {
            received.push(line);
        }
        received
    });
    (addr, handle)
}

async fn start(table: RoutingTable) -> RunningRelay {
    RelayBuilder::default()
        .receivers(vec![Receiver::new_tcp_stream("127.0.0.1".into(), 0)])
        .routing_table(table)
        .workers(4)
        .build()
        .unwrap()
        .start()
        .await
        .unwrap()
}

async fn wait_received(relay: &RunningRelay, expected: u64) {
    let wait = async {
        while relay.dispatcher().snapshot().received < expected {
            sleep(Duration::from_millis(10)).await;
        }
    };
    timeout(Duration::from_secs(10), wait).await.unwrap();
}

#[tokio::test]
async fn test_prefix_rule_and_cluster_delivery() {
    let (app_addr, app_backend) = backend().await;
    let (a_addr, a_backend) = backend().await;
    let (b_addr, b_backend) = backend().await;

    let app = Destination::new(app_addr, DestinationConfig::default());
    let a = Destination::new(a_addr, DestinationConfig::default());
    let b = Destination::new(b_addr, DestinationConfig::default());
    let cluster = Arc::new(
        Cluster::new(
            "storage",
            ClusterStrategies::ConsistentHash,
            1,
            vec![ClusterMember::from(a.clone()), ClusterMember::from(b.clone())],
        )
        .unwrap(),
    );
    let table = RoutingTable::builder()
        .rule(Matcher::prefix("app."), vec![app.clone().into()], true)
        .rule(Matcher::Any, vec![cluster.clone().into()], true)
        .build()
        .unwrap();

    let relay = start(table).await;

    //Two producers on separate connections
    let mut first = TcpStream::connect(relay.local_addrs()[0]).await.unwrap();
    let mut second = TcpStream::connect(relay.local_addrs()[0]).await.unwrap();
    for i in 0..50 {
        first
            .write_all(format!("app.req.{i} {i} 1700000000\n").as_bytes())
            .await
            .unwrap();
    }
    first.write_all(b"garbage\n").await.unwrap();
    for i in 0..200 {
        second
            .write_all(format!("sys.load.{i} {i} 1700000000\n").as_bytes())
            .await
            .unwrap();
    }
    drop(first);
    drop(second);

    wait_received(&relay, 250).await;
    assert_eq!(relay.dispatcher().snapshot().malformed, 1);
    assert_eq!(relay.dispatcher().snapshot().unrouted, 0);

    relay.stop().await;

    let app_lines = timeout(Duration::from_secs(5), app_backend).await.unwrap().unwrap();
    let expected: Vec<String> = (0..50).map(|i| format!("app.req.{i} {i} 1700000000")).collect();
    assert_eq!(app_lines, expected);

    let a_lines = timeout(Duration::from_secs(5), a_backend).await.unwrap().unwrap();
    let b_lines = timeout(Duration::from_secs(5), b_backend).await.unwrap().unwrap();
    assert_eq!(a_lines.len() + b_lines.len(), 200);

    //Every key went to the member the ring picks for it
    for (lines, member) in [(&a_lines, &a), (&b_lines, &b)] {
        for line in lines {
            let key = line.split(' ').next().unwrap();
            assert_eq!(cluster.resolve(key)[0].id(), member.id());
        }
    }

    for destination in [&app, &a, &b] {
        let stats = destination.snapshot();
        assert_eq!(stats.dropped, 0);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.enqueued, stats.sent);
        assert_eq!(stats.queued, 0);
    }
    assert_eq!(app.snapshot().sent, 50);
}

#[tokio::test]
async fn test_stop_is_bounded_with_dead_backend() {
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = probe.local_addr().unwrap().to_string();
    drop(probe);

    let config = DestinationConfigBuilder::default()
        .queue_capacity(10)
        .backoff_base(Duration::from_millis(20))
        .backoff_ceiling(Duration::from_millis(100))
        .shutdown_grace(Duration::from_millis(300))
        .build()
        .unwrap();
    let dead = Destination::new(dead_addr, config);
    let table = RoutingTable::builder()
        .rule(Matcher::Any, vec![dead.clone().into()], true)
        .build()
        .unwrap();

    let relay = start(table).await;

    let mut producer = TcpStream::connect(relay.local_addrs()[0]).await.unwrap();
    for i in 0..25 {
        producer
            .write_all(format!("lost.{i} {i} 1700000000\n").as_bytes())
            .await
            .unwrap();
    }
    wait_received(&relay, 25).await;

    let started = Instant::now();
    relay.stop().await;
    assert!(started.elapsed() < Duration::from_secs(3));

    let stats = dead.snapshot();
    assert_eq!(stats.enqueued + stats.dropped, 25);
    assert_eq!(stats.enqueued, 10);
    assert_eq!(stats.sent, 0);
    assert_eq!(stats.failed, stats.enqueued);
}
