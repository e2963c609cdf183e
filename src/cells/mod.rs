//! Message-passing kernel
//!
//! Named cells register with a per-process nucleus, exchange envelopes by
//! path, and reach other domains through tunnel cells that install routes
//! after an identity handshake:
//! - `path`: addresses and hop lists
//! - `envelope`: the routed unit, correlation id and reply derivation
//! - `routing`: the exact/domain/default route tables
//! - `nucleus`: registration, delivery, reply correlation, kill semantics
//! - `tunnel`: length-prefixed TCP transport between nuclei

pub mod envelope;
pub mod nucleus;
pub mod path;
pub mod routing;
pub mod tunnel;

pub use envelope::{Direction, Envelope};
pub use nucleus::{Cell, Nucleus, ReplyCallback};
pub use path::{CellAddress, CellPath};
pub use routing::Route;

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("no route to {0}")]
    NoRoute(String),

    #[error("cell name already registered: {0}")]
    DuplicateName(String),

    #[error("route already installed: {0}")]
    DuplicateRoute(String),

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("no such cell: {0}")]
    UnknownCell(String),

    #[error("tunnel handshake failed: {0}")]
    Handshake(String),

    #[error("tunnel transport failed: {0}")]
    Transport(#[from] std::io::Error),

    #[error("frame codec failed: {0}")]
    Codec(String),
}

pub type Result<T> = std::result::Result<T, RoutingError>;
