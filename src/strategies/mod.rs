use std::{fmt, sync::Arc};

use regex::Regex;
use strum::{Display, EnumString};

use crate::{
    destination::Destination,
    error::ConfigError,
    ring::{hash_key, HashRing},
    router::ClusterMember,
};

pub trait MatchStrategy {
    fn matches(&self, key: &str) -> bool;
}

/// How a rule selects metric keys.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Matches every key (`*`).
    Any,
    Exact(String),
    Prefix(String),
    Pattern(Regex),
}

impl Matcher {
    pub fn exact(key: impl Into<String>) -> Self {
        Matcher::Exact(key.into())
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        Matcher::Prefix(prefix.into())
    }

    pub fn pattern(expr: &str) -> Result<Self, ConfigError> {
        Regex::new(expr)
            .map(Matcher::Pattern)
            .map_err(|err| ConfigError::InvalidPattern {
                pattern: expr.to_owned(),
                reason: err.to_string(),
            })
    }
}

impl MatchStrategy for Matcher {
    #[inline]
    fn matches(&self, key: &str) -> bool {
        match self {
            Matcher::Any => true,
            Matcher::Exact(expected) => key == expected,
            Matcher::Prefix(prefix) => key.starts_with(prefix.as_str()),
            Matcher::Pattern(regex) => regex.is_match(key),
        }
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Any => write!(f, "*"),
            Matcher::Exact(key) => write!(f, "exact {key}"),
            Matcher::Prefix(prefix) => write!(f, "prefix {prefix}"),
            Matcher::Pattern(regex) => write!(f, "pattern {}", regex.as_str()),
        }
    }
}

pub trait DistributionStrategy {
    fn select(
        &self,
        ring: &HashRing<ClusterMember>,
        key: &str,
        replication: usize,
    ) -> Vec<Arc<Destination>>;
}

/// How a cluster spreads events over its members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ClusterStrategies {
    /// Always the first member.
    Single,
    /// The first `replication` connected members in declared order.
    Failover,
    /// `replication` members picked by the hash ring.
    #[default]
    ConsistentHash,
    /// `replication` connected members, starting at a member picked by key hash.
    AnyOf,
}

impl DistributionStrategy for ClusterStrategies {
    fn select(
        &self,
        ring: &HashRing<ClusterMember>,
        key: &str,
        replication: usize,
    ) -> Vec<Arc<Destination>> {
        let members = ring.members();
        if members.is_empty() {
            return Vec::new();
        }

        match self {
            ClusterStrategies::Single => vec![members[0].destination().clone()],
            ClusterStrategies::Failover => prefer_available(members.iter(), replication),
            ClusterStrategies::ConsistentHash => ring
                .resolve(key.as_bytes(), replication)
                .into_iter()
                .map(|member| member.destination().clone())
                .collect(),
            ClusterStrategies::AnyOf => {
                let start = (hash_key(key.as_bytes()) % members.len() as u64) as usize;
                let rotated = members[start..].iter().chain(members[..start].iter());
                prefer_available(rotated, replication)
            }
        }
    }
}

/// Take `wanted` connected members in the given order; when not enough are
/// connected, complete with the others in the same order so the events still
/// wait in a queue instead of being lost.
fn prefer_available<'a>(
    members: impl Iterator<Item = &'a ClusterMember> + Clone,
    wanted: usize,
) -> Vec<Arc<Destination>> {
    let mut picked: Vec<Arc<Destination>> = members
        .clone()
        .filter(|member| member.destination().is_available())
        .take(wanted)
        .map(|member| member.destination().clone())
        .collect();

    if picked.len() < wanted {
        for member in members {
            if picked.len() == wanted {
                break;
            }
            if !picked.iter().any(|d| Arc::ptr_eq(d, member.destination())) {
                picked.push(member.destination().clone());
            }
        }
    }
    picked
}

pub trait AssignStrategy {
    /// Index of the worker receiving the next connection. `cursor` is the
    /// pool state protected by the dispatcher lock.
    fn assign(&self, loads: &[usize], cursor: &mut usize) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum AssignStrategies {
    #[default]
    RoundRobin,
    LeastLoaded,
}

impl AssignStrategy for AssignStrategies {
    fn assign(&self, loads: &[usize], cursor: &mut usize) -> usize {
        match self {
            AssignStrategies::RoundRobin => {
                let next = *cursor % loads.len();
                *cursor = cursor.wrapping_add(1);
                next
            }
            AssignStrategies::LeastLoaded => loads
                .iter()
                .enumerate()
                .min_by_key(|(idx, load)| (**load, *idx))
                .map(|(idx, _)| idx)
                .unwrap_or_default(),
        }
    }
}
