use thiserror::Error;
use ustr::Ustr;

/// Inconsistencies detected while building a routing table, a cluster or a
/// component configuration. A table that fails validation is never swapped in.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("cluster {0} has no members")]
    EmptyCluster(Ustr),

    #[error("cluster {cluster}: replication factor {replication} must be between 1 and {members}")]
    ReplicationFactor {
        cluster: Ustr,
        replication: usize,
        members: usize,
    },

    #[error("cluster {cluster}: member {member} has zero weight")]
    ZeroWeight { cluster: Ustr, member: Ustr },

    #[error("cluster {cluster}: member {member} is listed more than once")]
    DuplicateMember { cluster: Ustr, member: Ustr },

    #[error("two different destinations share the id {0}")]
    DuplicateDestination(Ustr),

    #[error("invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("rule #{0} has no targets")]
    RuleWithoutTargets(usize),

    #[error("worker pool needs at least one worker")]
    NoWorkers,

    #[error("maximum line length must be greater than zero")]
    ZeroLineLength,
}

/// Reasons a received line is rejected as malformed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty line")]
    Empty,

    #[error("expected 3 fields, found {0}")]
    FieldCount(usize),

    #[error("line is not valid UTF-8")]
    Encoding,

    #[error("value is not a number")]
    Value,

    #[error("timestamp is not a number")]
    Timestamp,
}
