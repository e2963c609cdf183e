//! gridspace: storage-management middleware building blocks
//!
//! Three cooperating subsystems behind one message bus:
//! - `cells`: named endpoints, path routing and TCP tunnels between domains
//! - `scheduler`: a bounded, priority-ordered job pool with kill semantics
//! - `space`: transactional space-reservation accounting over SQLite
//!
//! `cost` prices pools from their telemetry; `messages` is the closed set of
//! payloads the bus carries; `config` wires it all together.

pub mod cells;
pub mod config;
pub mod cost;
pub mod messages;
pub mod scheduler;
pub mod space;
