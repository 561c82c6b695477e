use std::{collections::HashMap, fmt, sync::Arc};

use arc_swap::ArcSwap;
use derive_new::new;
use log::{debug, info};
use ustr::{ustr, Ustr};

use crate::{
    destination::Destination,
    error::ConfigError,
    event::MetricEvent,
    ring::{HashRing, RingMember, DEFAULT_REPLICAS},
    strategies::{ClusterStrategies, DistributionStrategy, MatchStrategy, Matcher},
};

/// A destination taking part in a cluster, with its share of the ring.
#[derive(Clone, new)]
pub struct ClusterMember {
    destination: Arc<Destination>,
    weight: u32,
}

impl ClusterMember {
    #[inline]
    pub fn destination(&self) -> &Arc<Destination> {
        &self.destination
    }

    #[inline]
    pub fn weight(&self) -> u32 {
        self.weight
    }
}

impl From<Arc<Destination>> for ClusterMember {
    fn from(destination: Arc<Destination>) -> Self {
        ClusterMember::new(destination, 1)
    }
}

impl RingMember for ClusterMember {
    fn ring_id(&self) -> Ustr {
        self.destination.id()
    }

    fn ring_weight(&self) -> u32 {
        self.weight
    }
}

/// Named group of destinations sharing a distribution strategy.
///
/// Membership lives in a [`HashRing`] snapshot that is replaced as a whole by
/// [`Cluster::set_members`]; lookups in progress keep the ring they loaded.
pub struct Cluster {
    name: Ustr,
    strategy: ClusterStrategies,
    replication_factor: usize,
    ring: ArcSwap<HashRing<ClusterMember>>,
}

impl Cluster {
    pub fn new(
        name: &str,
        strategy: ClusterStrategies,
        replication_factor: usize,
        members: Vec<ClusterMember>,
    ) -> Result<Self, ConfigError> {
        let name = ustr(name);
        let ring = Self::build_ring(name, replication_factor, members)?;

        Ok(Cluster {
            name,
            strategy,
            replication_factor,
            ring: ArcSwap::from_pointee(ring),
        })
    }

    fn build_ring(
        name: Ustr,
        replication_factor: usize,
        members: Vec<ClusterMember>,
    ) -> Result<HashRing<ClusterMember>, ConfigError> {
        if members.is_empty() {
            return Err(ConfigError::EmptyCluster(name));
        }
        if replication_factor == 0 || replication_factor > members.len() {
            return Err(ConfigError::ReplicationFactor {
                cluster: name,
                replication: replication_factor,
                members: members.len(),
            });
        }
        for (idx, member) in members.iter().enumerate() {
            if member.weight == 0 {
                return Err(ConfigError::ZeroWeight {
                    cluster: name,
                    member: member.destination.id(),
                });
            }
            if members[..idx]
                .iter()
                .any(|other| other.destination.id() == member.destination.id())
            {
                return Err(ConfigError::DuplicateMember {
                    cluster: name,
                    member: member.destination.id(),
                });
            }
        }

        Ok(HashRing::new(members, DEFAULT_REPLICAS))
    }

    /// Replace the membership. The new ring is validated and built aside,
    /// then swapped in; on error the current ring stays active.
    ///
    /// Events already queued on a removed member stay on that member.
    pub fn set_members(&self, members: Vec<ClusterMember>) -> Result<(), ConfigError> {
        let ring = Self::build_ring(self.name, self.replication_factor, members)?;
        info!(
            "Cluster {} now has {} members",
            self.name,
            ring.members().len()
        );
        self.ring.store(Arc::new(ring));
        Ok(())
    }

    #[inline]
    pub fn resolve(&self, key: &str) -> Vec<Arc<Destination>> {
        let ring = self.ring.load();
        self.strategy.select(&ring, key, self.replication_factor)
    }

    pub fn members(&self) -> Vec<ClusterMember> {
        self.ring.load().members().to_vec()
    }

    #[inline]
    pub fn name(&self) -> Ustr {
        self.name
    }

    #[inline]
    pub fn strategy(&self) -> ClusterStrategies {
        self.strategy
    }

    #[inline]
    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }
}

impl fmt::Display for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cluster {} {} replication {}",
            self.name, self.strategy, self.replication_factor
        )?;
        for member in self.ring.load().members() {
            write!(f, "\n        {}", member.destination.address())?;
            if member.weight != 1 {
                write!(f, "={}", member.weight)?;
            }
        }
        Ok(())
    }
}

/// Where a matching rule sends events.
#[derive(Clone)]
pub enum Target {
    Destination(Arc<Destination>),
    Cluster(Arc<Cluster>),
}

impl Target {
    fn resolve_into(&self, key: &str, out: &mut Vec<Arc<Destination>>) {
        match self {
            Target::Destination(destination) => push_unique(out, destination.clone()),
            Target::Cluster(cluster) => cluster
                .resolve(key)
                .into_iter()
                .for_each(|destination| push_unique(out, destination)),
        }
    }
}

impl From<Arc<Destination>> for Target {
    fn from(destination: Arc<Destination>) -> Self {
        Target::Destination(destination)
    }
}

impl From<Arc<Cluster>> for Target {
    fn from(cluster: Arc<Cluster>) -> Self {
        Target::Cluster(cluster)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Destination(destination) => write!(f, "{}", destination.id()),
            Target::Cluster(cluster) => write!(f, "{}", cluster.name()),
        }
    }
}

#[inline]
fn push_unique(out: &mut Vec<Arc<Destination>>, destination: Arc<Destination>) {
    if !out.iter().any(|known| known.id() == destination.id()) {
        out.push(destination);
    }
}

#[derive(Clone)]
pub struct RouteRule {
    matcher: Matcher,
    targets: Vec<Target>,
    stop: bool,
}

impl RouteRule {
    #[inline]
    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    #[inline]
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    #[inline]
    pub fn stop(&self) -> bool {
        self.stop
    }
}

/// Ordered, validated rule list. Built with [`RoutingTableBuilder`].
#[derive(Clone, Default)]
pub struct RoutingTable {
    rules: Vec<RouteRule>,
}

impl RoutingTable {
    pub fn builder() -> RoutingTableBuilder {
        RoutingTableBuilder::default()
    }

    /// Destinations for `key`, in rule order then target order, each at most once.
    pub fn route(&self, key: &str) -> Vec<Arc<Destination>> {
        let mut out = Vec::new();
        for rule in &self.rules {
            if !rule.matcher.matches(key) {
                continue;
            }
            rule.targets
                .iter()
                .for_each(|target| target.resolve_into(key, &mut out));
            if rule.stop {
                break;
            }
        }
        out
    }

    #[inline]
    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    /// Every destination reachable from the table, each once.
    pub fn destinations(&self) -> Vec<Arc<Destination>> {
        let mut out = Vec::new();
        for target in self.rules.iter().flat_map(|rule| rule.targets.iter()) {
            match target {
                Target::Destination(destination) => push_unique(&mut out, destination.clone()),
                Target::Cluster(cluster) => cluster
                    .members()
                    .into_iter()
                    .for_each(|member| push_unique(&mut out, member.destination)),
            }
        }
        out
    }
}

impl fmt::Display for RoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut clusters: Vec<&Arc<Cluster>> = Vec::new();
        for target in self.rules.iter().flat_map(|rule| rule.targets.iter()) {
            if let Target::Cluster(cluster) = target {
                if !clusters.iter().any(|known| Arc::ptr_eq(known, cluster)) {
                    clusters.push(cluster);
                }
            }
        }
        for cluster in clusters {
            writeln!(f, "{cluster}")?;
        }
        for rule in &self.rules {
            write!(f, "match {}\n    send to", rule.matcher)?;
            for target in &rule.targets {
                write!(f, " {target}")?;
            }
            writeln!(f, "{}", if rule.stop { "\n    stop" } else { "" })?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RoutingTableBuilder {
    rules: Vec<RouteRule>,
}

impl RoutingTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(mut self, matcher: Matcher, targets: Vec<Target>, stop: bool) -> Self {
        self.rules.push(RouteRule {
            matcher,
            targets,
            stop,
        });
        self
    }

    pub fn build(self) -> Result<RoutingTable, ConfigError> {
        for (idx, rule) in self.rules.iter().enumerate() {
            if rule.targets.is_empty() {
                return Err(ConfigError::RuleWithoutTargets(idx));
            }
        }

        let table = RoutingTable { rules: self.rules };

        //Identity of a destination is its id: two instances under one id would be merged by routing
        let mut seen: HashMap<Ustr, Arc<Destination>> = HashMap::new();
        for target in table.rules.iter().flat_map(|rule| rule.targets.iter()) {
            let destinations = match target {
                Target::Destination(destination) => vec![destination.clone()],
                Target::Cluster(cluster) => cluster
                    .members()
                    .into_iter()
                    .map(|member| member.destination)
                    .collect(),
            };
            for destination in destinations {
                match seen.get(&destination.id()) {
                    Some(known) if !Arc::ptr_eq(known, &destination) => {
                        return Err(ConfigError::DuplicateDestination(destination.id()));
                    }
                    Some(_) => {}
                    None => {
                        seen.insert(destination.id(), destination);
                    }
                }
            }
        }

        Ok(table)
    }
}

/// Evaluates events against the active [`RoutingTable`].
///
/// The table is read through an atomic snapshot: a reconfiguration swaps the
/// whole table, so a lookup sees either the old or the new one.
pub struct Router {
    table: ArcSwap<RoutingTable>,
}

impl Router {
    pub fn new(table: RoutingTable) -> Self {
        Router {
            table: ArcSwap::from_pointee(table),
        }
    }

    /// Destinations that must receive `event`. Empty when no rule matches.
    #[inline]
    pub fn route(&self, event: &MetricEvent) -> Vec<Arc<Destination>> {
        self.route_key(event.key())
    }

    #[inline]
    pub fn route_key(&self, key: &str) -> Vec<Arc<Destination>> {
        self.table.load().route(key)
    }

    /// Activate an already validated table. Writers for destinations it adds
    /// are started by the relay, which is the only caller.
    pub(crate) fn replace(&self, table: RoutingTable) {
        debug!("Routing table replaced, {} rules", table.rules().len());
        self.table.store(Arc::new(table));
    }

    #[inline]
    pub fn snapshot(&self) -> Arc<RoutingTable> {
        self.table.load_full()
    }
}

#[cfg(test)]
mod router_tests {
    use std::sync::Arc;

    use crate::{
        destination::{Destination, DestinationConfig},
        error::ConfigError,
        event::MetricEvent,
        router::*,
        strategies::{ClusterStrategies, Matcher},
    };

    fn destination(port: u16) -> Arc<Destination> {
        Destination::new(format!("127.0.0.1:{port}"), DestinationConfig::default())
    }

    fn ids(destinations: &[Arc<Destination>]) -> Vec<&str> {
        destinations.iter().map(|d| d.id().as_str()).collect()
    }

    fn cluster(name: &str, ports: &[u16], replication: usize) -> Arc<Cluster> {
        let members: Vec<ClusterMember> = ports
            .iter()
            .map(|p| ClusterMember::from(destination(*p)))
            .collect();
        Arc::new(Cluster::new(name, ClusterStrategies::ConsistentHash, replication, members).unwrap())
    }

    #[test]
    fn test_stop_rule_ends_evaluation() {
        let d1 = destination(2001);
        let d2 = destination(2002);
        let table = RoutingTable::builder()
            .rule(Matcher::prefix("app."), vec![d1.clone().into()], true)
            .rule(Matcher::Any, vec![d2.clone().into()], false)
            .build()
            .unwrap();

        assert_eq!(ids(&table.route("app.cpu")), vec!["127.0.0.1:2001"]);
        assert_eq!(ids(&table.route("other.cpu")), vec!["127.0.0.1:2002"]);
    }

    #[test]
    fn test_unmatched_key_routes_nowhere() {
        let d1 = destination(2001);
        let router = Router::new(
            RoutingTable::builder()
                .rule(Matcher::prefix("app."), vec![d1.into()], true)
                .build()
                .unwrap(),
        );

        let event = MetricEvent::parse(b"app.cpu 1 1\n").unwrap();
        assert_eq!(ids(&router.route(&event)), vec!["127.0.0.1:2001"]);

        let event = MetricEvent::parse(b"other.cpu 1 1\n").unwrap();
        assert!(router.route(&event).is_empty());
    }

    #[test]
    fn test_fan_out_is_ordered_and_deduplicated() {
        let d1 = destination(2001);
        let d2 = destination(2002);
        let d3 = destination(2003);
        let table = RoutingTable::builder()
            .rule(Matcher::prefix("app."), vec![d2.clone().into(), d1.clone().into()], false)
            .rule(Matcher::exact("app.cpu"), vec![d1.clone().into(), d3.clone().into()], false)
            .rule(Matcher::pattern("^app").unwrap(), vec![d2.clone().into()], false)
            .build()
            .unwrap();

        let first = table.route("app.cpu");
        assert_eq!(
            ids(&first),
            vec!["127.0.0.1:2002", "127.0.0.1:2001", "127.0.0.1:2003"]
        );
        assert_eq!(ids(&table.route("app.cpu")), ids(&first));
        assert_eq!(
            ids(&table.route("app.mem")),
            vec!["127.0.0.1:2002", "127.0.0.1:2001"]
        );
    }

    #[test]
    fn test_cluster_target_uses_replication_factor() {
        let cluster = cluster("backends", &[2001, 2002, 2003], 2);
        let table = RoutingTable::builder()
            .rule(Matcher::Any, vec![cluster.clone().into()], true)
            .build()
            .unwrap();

        let first = table.route("servers.web1.cpu");
        let second = table.route("servers.web1.cpu");
        assert_eq!(first.len(), 2);
        assert_eq!(ids(&first), ids(&second));
        assert_eq!(table.destinations().len(), 3);
    }

    #[test]
    fn test_cluster_validation() {
        let too_many = Cluster::new(
            "small",
            ClusterStrategies::ConsistentHash,
            3,
            vec![destination(2001).into(), destination(2002).into()],
        );
        assert!(matches!(
            too_many,
            Err(ConfigError::ReplicationFactor { replication: 3, members: 2, .. })
        ));

        let empty = Cluster::new("empty", ClusterStrategies::Failover, 1, Vec::new());
        assert!(matches!(empty, Err(ConfigError::EmptyCluster(_))));

        let d1 = destination(2001);
        let duplicated = Cluster::new(
            "dup",
            ClusterStrategies::AnyOf,
            1,
            vec![d1.clone().into(), d1.into()],
        );
        assert!(matches!(duplicated, Err(ConfigError::DuplicateMember { .. })));

        let weightless = Cluster::new(
            "zero",
            ClusterStrategies::ConsistentHash,
            1,
            vec![ClusterMember::new(destination(2001), 0)],
        );
        assert!(matches!(weightless, Err(ConfigError::ZeroWeight { .. })));
    }

    #[test]
    fn test_set_members_keeps_old_ring_on_error() {
        let cluster = cluster("backends", &[2001, 2002], 2);

        let result = cluster.set_members(vec![destination(2003).into()]);
        assert!(result.is_err());
        assert_eq!(cluster.members().len(), 2);

        cluster
            .set_members(vec![
                destination(2001).into(),
                destination(2002).into(),
                destination(2003).into(),
            ])
            .unwrap();
        assert_eq!(cluster.members().len(), 3);
    }

    #[test]
    fn test_builder_rejects_invalid_tables() {
        let empty_rule = RoutingTable::builder().rule(Matcher::Any, Vec::new(), false).build();
        assert!(matches!(empty_rule, Err(ConfigError::RuleWithoutTargets(0))));

        let twins = RoutingTable::builder()
            .rule(Matcher::Any, vec![destination(2001).into()], false)
            .rule(Matcher::Any, vec![destination(2001).into()], false)
            .build();
        assert!(matches!(twins, Err(ConfigError::DuplicateDestination(_))));
    }

    #[test]
    fn test_replace_swaps_whole_table() {
        let d1 = destination(2001);
        let d2 = destination(2002);
        let router = Router::new(
            RoutingTable::builder()
                .rule(Matcher::Any, vec![d1.clone().into()], true)
                .build()
                .unwrap(),
        );

        router.replace(
            RoutingTable::builder()
                .rule(Matcher::Any, vec![d2.into()], true)
                .build()
                .unwrap(),
        );
        assert_eq!(ids(&router.route_key("a.b")), vec!["127.0.0.1:2002"]);

        //Snapshots taken before the swap keep the old rules
        let old = RoutingTable::builder()
            .rule(Matcher::Any, vec![d1.into()], true)
            .build()
            .unwrap();
        let snapshot = router.snapshot();
        router.replace(old);
        assert_eq!(ids(&snapshot.route("a.b")), vec!["127.0.0.1:2002"]);
        assert_eq!(ids(&router.route_key("a.b")), vec!["127.0.0.1:2001"]);
    }

    #[test]
    fn test_display_lists_clusters_and_rules() {
        let cluster = cluster("backends", &[2001, 2002], 1);
        let table = RoutingTable::builder()
            .rule(Matcher::prefix("app."), vec![cluster.into()], true)
            .build()
            .unwrap();

        let printed = table.to_string();
        assert!(printed.contains("cluster backends consistent-hash replication 1"));
        assert!(printed.contains("match prefix app.\n    send to backends\n    stop"));
    }
}
