//! Ledger row types and state machines
//!
//! Reservations and the files admitted into them move through one-way state
//! machines; every state carries a stable integer id so rows survive process
//! restarts without re-encoding.

use serde::{Deserialize, Serialize};

use super::SpaceError;

/// How durable a copy of the data must be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetentionPolicy {
    Replica,
    Output,
    Custodial,
}

impl RetentionPolicy {
    pub fn to_id(self) -> i64 {
        match self {
            RetentionPolicy::Replica => 0,
            RetentionPolicy::Output => 1,
            RetentionPolicy::Custodial => 2,
        }
    }

    pub fn from_id(id: i64) -> Result<Self, SpaceError> {
        match id {
            0 => Ok(RetentionPolicy::Replica),
            1 => Ok(RetentionPolicy::Output),
            2 => Ok(RetentionPolicy::Custodial),
            other => Err(SpaceError::LedgerConsistency(format!(
                "unknown retention policy id {other}"
            ))),
        }
    }
}

/// How quickly the data must be readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessLatency {
    Online,
    Nearline,
}

impl AccessLatency {
    pub fn to_id(self) -> i64 {
        match self {
            AccessLatency::Online => 0,
            AccessLatency::Nearline => 1,
        }
    }

    pub fn from_id(id: i64) -> Result<Self, SpaceError> {
        match id {
            0 => Ok(AccessLatency::Online),
            1 => Ok(AccessLatency::Nearline),
            other => Err(SpaceError::LedgerConsistency(format!(
                "unknown access latency id {other}"
            ))),
        }
    }
}

/// Reservation lifecycle. `Released` and `Expired` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpaceState {
    Reserved,
    Released,
    Expired,
}

impl SpaceState {
    pub fn to_id(self) -> i64 {
        match self {
            SpaceState::Reserved => 0,
            SpaceState::Released => 1,
            SpaceState::Expired => 2,
        }
    }

    pub fn from_id(id: i64) -> Result<Self, SpaceError> {
        match id {
            0 => Ok(SpaceState::Reserved),
            1 => Ok(SpaceState::Released),
            2 => Ok(SpaceState::Expired),
            other => Err(SpaceError::LedgerConsistency(format!(
                "unknown space state id {other}"
            ))),
        }
    }

    pub fn is_final(self) -> bool {
        matches!(self, SpaceState::Released | SpaceState::Expired)
    }
}

/// Lifecycle of a file admitted into a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileState {
    Reserved,
    Transferring,
    Stored,
    Flushed,
}

impl FileState {
    pub fn to_id(self) -> i64 {
        match self {
            FileState::Reserved => 0,
            FileState::Transferring => 1,
            FileState::Stored => 2,
            FileState::Flushed => 3,
        }
    }

    pub fn from_id(id: i64) -> Result<Self, SpaceError> {
        match id {
            0 => Ok(FileState::Reserved),
            1 => Ok(FileState::Transferring),
            2 => Ok(FileState::Stored),
            3 => Ok(FileState::Flushed),
            other => Err(SpaceError::LedgerConsistency(format!(
                "unknown file state id {other}"
            ))),
        }
    }
}

/// An authorized (VO group, VO role) pair. `*` matches anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoInfo {
    pub group: String,
    pub role: String,
}

impl VoInfo {
    pub fn new(group: impl Into<String>, role: impl Into<String>) -> Self {
        VoInfo {
            group: group.into(),
            role: role.into(),
        }
    }

    /// Wildcard-aware match against a requester's group and optional role.
    pub fn matches(&self, group: &str, role: Option<&str>) -> bool {
        let group_ok = self.group == "*" || self.group == group;
        let role_ok = self.role == "*" || role.map(|r| r == self.role).unwrap_or(self.role.is_empty());
        group_ok && role_ok
    }
}

/// A named pool-of-pools; the unit of space reservation placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkGroup {
    pub id: i64,
    pub name: String,
    pub free_space: i64,
    pub reserved_space: i64,
    pub online_allowed: bool,
    pub nearline_allowed: bool,
    pub replica_allowed: bool,
    pub output_allowed: bool,
    pub custodial_allowed: bool,
    /// Millis since the epoch of the last telemetry refresh.
    pub last_update_time: i64,
    pub authorized: Vec<VoInfo>,
}

impl LinkGroup {
    /// Bytes still open for new reservations.
    pub fn available(&self) -> i64 {
        self.free_space - self.reserved_space
    }

    pub fn allows_latency(&self, latency: AccessLatency) -> bool {
        match latency {
            AccessLatency::Online => self.online_allowed,
            AccessLatency::Nearline => self.nearline_allowed,
        }
    }

    pub fn allows_retention(&self, policy: RetentionPolicy) -> bool {
        match policy {
            RetentionPolicy::Replica => self.replica_allowed,
            RetentionPolicy::Output => self.output_allowed,
            RetentionPolicy::Custodial => self.custodial_allowed,
        }
    }

    pub fn authorizes(&self, group: &str, role: Option<&str>) -> bool {
        self.authorized.iter().any(|vo| vo.matches(group, role))
    }
}

/// A space reservation row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Space {
    pub id: i64,
    pub vo_group: String,
    pub vo_role: Option<String>,
    pub retention_policy: RetentionPolicy,
    pub access_latency: AccessLatency,
    pub link_group_id: i64,
    pub size_in_bytes: i64,
    pub creation_time: i64,
    /// Millis; -1 means the reservation never expires.
    pub lifetime_ms: i64,
    pub description: Option<String>,
    pub state: SpaceState,
    pub used_bytes: i64,
    pub allocated_bytes: i64,
}

impl Space {
    /// Bytes neither consumed by stored files nor pledged to in-flight ones.
    pub fn available(&self) -> i64 {
        self.size_in_bytes - self.used_bytes - self.allocated_bytes
    }

    pub fn expired_at(&self, now_ms: i64) -> bool {
        self.lifetime_ms != -1 && self.creation_time + self.lifetime_ms < now_ms
    }
}

/// A file admitted into a reservation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceFile {
    pub id: i64,
    pub vo_group: String,
    pub vo_role: Option<String>,
    pub space_id: i64,
    pub size_in_bytes: i64,
    pub creation_time: i64,
    pub lifetime_ms: i64,
    /// Namespace path; set for door-created (explicit) records.
    pub path: Option<String>,
    /// Storage content id; bound when the transfer starts.
    pub content_id: Option<String>,
    pub state: FileState,
    pub deleted: bool,
}

impl SpaceFile {
    pub fn expired_at(&self, now_ms: i64) -> bool {
        self.lifetime_ms != -1 && self.creation_time + self.lifetime_ms < now_ms
    }
}
