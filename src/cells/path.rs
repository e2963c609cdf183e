//! Cell addressing
//!
//! A cell is addressed as `name@domain`. A path is an ordered list of such
//! addresses; delivery consumes it one hop at a time, so intermediate cells
//! (the space manager, tunnels) can process a message and pass it onward.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Domain placeholder resolved against the local nucleus.
pub const LOCAL_DOMAIN: &str = "local";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellAddress {
    pub cell: String,
    pub domain: String,
}

impl CellAddress {
    pub fn new(cell: impl Into<String>, domain: impl Into<String>) -> Self {
        CellAddress {
            cell: cell.into(),
            domain: domain.into(),
        }
    }

    /// Parse `name@domain`; a bare name addresses the local domain.
    pub fn parse(s: &str) -> Self {
        match s.split_once('@') {
            Some((cell, domain)) => CellAddress::new(cell, domain),
            None => CellAddress::new(s, LOCAL_DOMAIN),
        }
    }
}

impl fmt::Display for CellAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.cell, self.domain)
    }
}

/// An ordered hop list with a cursor. The cursor only moves forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellPath {
    hops: Vec<CellAddress>,
    position: usize,
}

impl CellPath {
    pub fn to_address(address: CellAddress) -> Self {
        CellPath {
            hops: vec![address],
            position: 0,
        }
    }

    /// Build a multi-hop path; panics on an empty hop list, which has no
    /// meaningful destination.
    pub fn through(hops: Vec<CellAddress>) -> Self {
        assert!(!hops.is_empty(), "a cell path needs at least one hop");
        CellPath { hops, position: 0 }
    }

    /// Parse a `:`-separated hop list, e.g. `SpaceManager:PoolManager@core`.
    pub fn parse(s: &str) -> Self {
        let hops = s.split(':').map(CellAddress::parse).collect::<Vec<_>>();
        CellPath::through(hops)
    }

    /// The hop currently being delivered to.
    pub fn current(&self) -> &CellAddress {
        &self.hops[self.position]
    }

    /// Move the cursor to the next hop. Returns false at the final hop.
    pub fn advance(&mut self) -> bool {
        if self.position + 1 < self.hops.len() {
            self.position += 1;
            true
        } else {
            false
        }
    }

    pub fn at_final_hop(&self) -> bool {
        self.position + 1 == self.hops.len()
    }

    /// The reverse path, cursor reset to the start; used to address replies.
    pub fn reversed(&self) -> CellPath {
        let mut hops = self.hops.clone();
        hops.reverse();
        CellPath { hops, position: 0 }
    }

    /// A single-hop path to the current address.
    pub fn terminal(&self) -> CellPath {
        CellPath::to_address(self.current().clone())
    }

    pub fn hops(&self) -> &[CellAddress] {
        &self.hops
    }
}

impl fmt::Display for CellPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, hop) in self.hops.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            if i == self.position {
                write!(f, "[{hop}]")?;
            } else {
                write!(f, "{hop}")?;
            }
        }
        Ok(())
    }
}
