//! Space accounting engine
//!
//! Maintains the reservation / link-group / file ledger as a transactional
//! SQLite store and attaches space accounting to pool-selection and
//! transfer-lifecycle traffic:
//! - `model`: row types and state machines
//! - `pool`: checkout/return connection pool
//! - `ledger`: all transactional mutations and queries
//! - `authz`: VO-based permission checks
//! - `manager`: the cell front-end, sweeper and link-group refresh loops

pub mod authz;
pub mod ledger;
pub mod manager;
pub mod model;
pub mod pool;

pub use ledger::Ledger;
pub use manager::SpaceManager;

/// Errors surfaced by the accounting engine. Every multi-step mutation rolls
/// back its transaction before one of these is returned.
#[derive(Debug, thiserror::Error)]
pub enum SpaceError {
    #[error("no space available: {0}")]
    NoFreeSpace(String),

    #[error("space reservation {0} has expired")]
    SpaceExpired(i64),

    #[error("space reservation {0} was released")]
    SpaceReleased(i64),

    #[error("not authorized: {0}")]
    Authorization(String),

    #[error("no such reservation: {0}")]
    NotFound(i64),

    #[error("ledger consistency violated: {0}")]
    LedgerConsistency(String),

    #[error("ledger failure: {0}")]
    Ledger(String),
}

impl From<rusqlite::Error> for SpaceError {
    fn from(err: rusqlite::Error) -> Self {
        SpaceError::Ledger(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SpaceError>;
