#![doc = include_str!("../README.md")]
use std::sync::Arc;

pub use destination::{ConnectionState, Destination, DestinationConfig, DestinationConfigBuilder};
pub use error::{ConfigError, FrameError};
pub use event::MetricEvent;
pub use receiver::Receiver;
pub use relay::{Relay, RelayBuilder, RelayShutdownHandle, RunningRelay};
pub use router::{Cluster, ClusterMember, Router, RoutingTable, RoutingTableBuilder, Target};
pub use strategies::{
    AssignStrategies, AssignStrategy, ClusterStrategies, DistributionStrategy, MatchStrategy,
    Matcher,
};

pub mod destination;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod receiver;
pub mod ring;
pub mod router;
pub mod statistics;
pub mod strategies;

/// Main library module
pub mod relay;

/// One parsed event shared by every queue it was routed to.
type SharedEvent = Arc<MetricEvent>;
