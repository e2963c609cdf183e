//! The closed set of message kinds carried by envelopes
//!
//! One tagged union covers every payload the bus transports: explicit space
//! accounting requests and their replies, the two classes of intercepted
//! pool traffic, cost-table exchange, and liveness probes. Handlers dispatch
//! by exhaustive matching; there is no open subclassing of message types.

use serde::{Deserialize, Serialize};

use crate::cost::PoolCostInfo;
use crate::space::model::{AccessLatency, LinkGroup, RetentionPolicy, Space};

/// Topic on which pools and doors publish transfer-lifecycle notifications;
/// the space manager consumes them via subscription, not direct addressing.
pub const TOPIC_POOL_NOTIFICATIONS: &str = "pool.notifications";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    Ping,
    Pong,
    /// Explicit accounting request addressed to the space manager.
    Space(SpaceRequest),
    SpaceReply(SpaceReply),
    /// Intercepted pool-selection and transfer-lifecycle traffic.
    Pool(PoolMessage),
    /// Cost-table exchange with the pool telemetry provider.
    CostTableRequest,
    CostTable(Vec<PoolCostInfo>),
}

impl Message {
    /// Whether the sender expects a correlated reply for this payload.
    pub fn requires_reply(&self) -> bool {
        match self {
            Message::Ping | Message::Space(_) | Message::CostTableRequest => true,
            Message::Pong | Message::SpaceReply(_) | Message::CostTable(_) => false,
            Message::Pool(pool) => matches!(pool, PoolMessage::SelectWritePool { .. }),
        }
    }
}

/// Accounting requests. Every variant is answered with a [`SpaceReply`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SpaceRequest {
    /// Create a reservation; replies with `Reserved { token }`.
    Reserve {
        vo_group: String,
        vo_role: Option<String>,
        retention_policy: RetentionPolicy,
        access_latency: AccessLatency,
        size_in_bytes: i64,
        /// Millis; -1 requests an infinite lifetime, None the configured
        /// default.
        lifetime_ms: Option<i64>,
        description: Option<String>,
        /// Pin the reservation to a specific link group.
        link_group: Option<String>,
    },
    /// Transition a reservation to RELEASED; replies with `Released`. A
    /// missing requester group means a local administrator.
    Release {
        token: i64,
        vo_group: Option<String>,
        vo_role: Option<String>,
    },
    /// Admit a file into a reservation; replies with `FileAdmitted`.
    Use {
        token: i64,
        vo_group: String,
        vo_role: Option<String>,
        size_in_bytes: i64,
        lifetime_ms: i64,
        path: Option<String>,
        content_id: Option<String>,
    },
    /// Withdraw a previously admitted file; replies with `UseCancelled`.
    CancelUse { token: i64, path: String },
    /// Extend (never shorten) a reservation lifetime; replies with
    /// `LifetimeExtended`.
    ExtendLifetime { token: i64, lifetime_ms: i64 },
    /// Replies with `Tokens`.
    GetSpaceTokens {
        vo_group: Option<String>,
        description: Option<String>,
    },
    /// Replies with `MetaData`, one slot per requested token.
    GetSpaceMetaData { tokens: Vec<i64> },
    /// Replies with `LinkGroups`.
    GetLinkGroups,
    /// Replies with `LinkGroupNames`.
    GetLinkGroupNames,
    /// Replies with `FileTokens`: reservations holding files at this path.
    GetFileSpaceTokens { path: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SpaceReply {
    Reserved { token: i64 },
    Released { token: i64 },
    FileAdmitted { file_id: i64 },
    UseCancelled { token: i64 },
    LifetimeExtended { token: i64, lifetime_ms: i64 },
    Tokens { tokens: Vec<i64> },
    MetaData { spaces: Vec<Option<Space>> },
    LinkGroups { groups: Vec<LinkGroup> },
    LinkGroupNames { names: Vec<String> },
    FileTokens { tokens: Vec<i64> },
    Failed { code: FailureCode, reason: String },
}

/// Failure categories preserved across protocol boundaries. Front-ends map
/// these onto their own error codes; the distinction between "permission
/// denied", "no space" and "internal" must survive the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureCode {
    PermissionDenied,
    NoSpace,
    InvalidState,
    NotFound,
    InvalidArgs,
    Internal,
}

/// Pool-facing traffic the space manager intercepts.
///
/// `SelectWritePool` travels through the manager as an explicit intermediate
/// hop and is forwarded (annotated) to its final destination; the lifecycle
/// notifications arrive via [`TOPIC_POOL_NOTIFICATIONS`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PoolMessage {
    SelectWritePool {
        path: String,
        content_id: Option<String>,
        preallocated: i64,
        vo_group: Option<String>,
        vo_role: Option<String>,
        /// Caller-supplied default reservation token.
        default_token: Option<i64>,
        access_latency: Option<AccessLatency>,
        retention_policy: Option<RetentionPolicy>,
        /// Annotations added by the space manager; additive only.
        link_group: Option<String>,
        space_token: Option<i64>,
        file_id: Option<i64>,
        /// Conditional failure attached when accounting could not be applied;
        /// forwarding of the request proceeds regardless.
        failure: Option<(FailureCode, String)>,
    },
    /// A pool was asked to accept a file; binds content ids to records the
    /// door created ahead of the transfer.
    TransferStarting {
        content_id: String,
        file_id: Option<i64>,
        default_token: Option<i64>,
        link_group: Option<String>,
        vo_group: Option<String>,
        vo_role: Option<String>,
        preallocated: i64,
    },
    /// The pool's accept reply: the mover is running (or failed to start).
    TransferStarted { content_id: String, success: bool },
    TransferFinished {
        content_id: String,
        final_size: i64,
        success: bool,
    },
    FileFlushed { content_id: String },
    FileRemoved { content_id: String },
}
