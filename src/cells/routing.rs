//! Route tables
//!
//! Three route classes with strict precedence: exact (cell@domain) beats
//! domain, domain beats the single default. Lookups take a shared snapshot;
//! mutations copy, modify and swap, so a resolve never observes a
//! half-applied change.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use super::path::CellAddress;
use super::{Result, RoutingError};

/// A route binds an address pattern to the local cell that absorbs matching
/// traffic, typically a tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Route {
    Exact {
        cell: String,
        domain: String,
        target: String,
    },
    Domain {
        domain: String,
        target: String,
    },
    Default {
        target: String,
    },
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Route::Exact { cell, domain, target } => write!(f, "{cell}@{domain} -> {target}"),
            Route::Domain { domain, target } => write!(f, "*@{domain} -> {target}"),
            Route::Default { target } => write!(f, "* -> {target}"),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct RouteTables {
    exact: HashMap<(String, String), String>,
    domain: HashMap<String, String>,
    default: Option<String>,
}

#[derive(Debug, Default)]
pub struct RoutingTable {
    tables: RwLock<Arc<RouteTables>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        RoutingTable::default()
    }

    pub fn add(&self, route: Route) -> Result<()> {
        let mut guard = self.tables.write().unwrap();
        let mut tables = RouteTables::clone(&guard);
        match &route {
            Route::Exact { cell, domain, target } => {
                let key = (cell.clone(), domain.clone());
                if tables.exact.contains_key(&key) {
                    return Err(RoutingError::DuplicateRoute(route.to_string()));
                }
                tables.exact.insert(key, target.clone());
            }
            Route::Domain { domain, target } => {
                if tables.domain.contains_key(domain) {
                    return Err(RoutingError::DuplicateRoute(route.to_string()));
                }
                tables.domain.insert(domain.clone(), target.clone());
            }
            Route::Default { target } => {
                if tables.default.is_some() {
                    return Err(RoutingError::DuplicateRoute(route.to_string()));
                }
                tables.default = Some(target.clone());
            }
        }
        *guard = Arc::new(tables);
        Ok(())
    }

    pub fn delete(&self, route: &Route) -> Result<()> {
        let mut guard = self.tables.write().unwrap();
        let mut tables = RouteTables::clone(&guard);
        let removed = match route {
            Route::Exact { cell, domain, .. } => tables
                .exact
                .remove(&(cell.clone(), domain.clone()))
                .is_some(),
            Route::Domain { domain, .. } => tables.domain.remove(domain).is_some(),
            Route::Default { .. } => tables.default.take().is_some(),
        };
        if !removed {
            return Err(RoutingError::NoRoute(route.to_string()));
        }
        *guard = Arc::new(tables);
        Ok(())
    }

    /// Drop every route whose target is the named cell. Used when a cell is
    /// killed so traffic fails over to no-route instead of a dead mailbox.
    pub fn delete_routes_to(&self, target: &str) {
        let mut guard = self.tables.write().unwrap();
        if !guard.exact.values().any(|t| t == target)
            && !guard.domain.values().any(|t| t == target)
            && guard.default.as_deref() != Some(target)
        {
            return;
        }
        let mut tables = RouteTables::clone(&guard);
        tables.exact.retain(|_, t| t != target);
        tables.domain.retain(|_, t| t != target);
        if tables.default.as_deref() == Some(target) {
            tables.default = None;
        }
        *guard = Arc::new(tables);
    }

    /// Resolve an address to the local target cell, most specific route wins.
    pub fn resolve(&self, address: &CellAddress) -> Option<String> {
        let tables = Arc::clone(&self.tables.read().unwrap());
        tables
            .exact
            .get(&(address.cell.clone(), address.domain.clone()))
            .or_else(|| tables.domain.get(&address.domain))
            .or(tables.default.as_ref())
            .cloned()
    }

    pub fn routes(&self) -> Vec<Route> {
        let tables = Arc::clone(&self.tables.read().unwrap());
        let mut routes = Vec::new();
        for ((cell, domain), target) in &tables.exact {
            routes.push(Route::Exact {
                cell: cell.clone(),
                domain: domain.clone(),
                target: target.clone(),
            });
        }
        for (domain, target) in &tables.domain {
            routes.push(Route::Domain {
                domain: domain.clone(),
                target: target.clone(),
            });
        }
        if let Some(target) = &tables.default {
            routes.push(Route::Default {
                target: target.clone(),
            });
        }
        routes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_exact_over_domain_over_default() {
        let table = RoutingTable::new();
        table
            .add(Route::Default {
                target: "fallback".into(),
            })
            .unwrap();
        table
            .add(Route::Domain {
                domain: "core".into(),
                target: "tunnel-core".into(),
            })
            .unwrap();
        table
            .add(Route::Exact {
                cell: "SpaceManager".into(),
                domain: "core".into(),
                target: "direct".into(),
            })
            .unwrap();

        assert_eq!(
            table.resolve(&CellAddress::new("SpaceManager", "core")),
            Some("direct".into())
        );
        assert_eq!(
            table.resolve(&CellAddress::new("PoolManager", "core")),
            Some("tunnel-core".into())
        );
        assert_eq!(
            table.resolve(&CellAddress::new("anything", "elsewhere")),
            Some("fallback".into())
        );
    }

    #[test]
    fn duplicate_routes_rejected() {
        let table = RoutingTable::new();
        table
            .add(Route::Domain {
                domain: "core".into(),
                target: "a".into(),
            })
            .unwrap();
        let err = table
            .add(Route::Domain {
                domain: "core".into(),
                target: "b".into(),
            })
            .unwrap_err();
        assert!(matches!(err, RoutingError::DuplicateRoute(_)));

        table.add(Route::Default { target: "a".into() }).unwrap();
        let err = table
            .add(Route::Default { target: "b".into() })
            .unwrap_err();
        assert!(matches!(err, RoutingError::DuplicateRoute(_)));
    }

    #[test]
    fn delete_absent_route_fails() {
        let table = RoutingTable::new();
        let err = table
            .delete(&Route::Domain {
                domain: "core".into(),
                target: "a".into(),
            })
            .unwrap_err();
        assert!(matches!(err, RoutingError::NoRoute(_)));
    }

    #[test]
    fn delete_routes_to_clears_every_class() {
        let table = RoutingTable::new();
        table
            .add(Route::Exact {
                cell: "SpaceManager".into(),
                domain: "core".into(),
                target: "tunnel-core".into(),
            })
            .unwrap();
        table
            .add(Route::Domain {
                domain: "core".into(),
                target: "tunnel-core".into(),
            })
            .unwrap();
        table
            .add(Route::Default {
                target: "tunnel-core".into(),
            })
            .unwrap();
        table
            .add(Route::Domain {
                domain: "edge".into(),
                target: "tunnel-edge".into(),
            })
            .unwrap();

        table.delete_routes_to("tunnel-core");
        assert_eq!(table.resolve(&CellAddress::new("SpaceManager", "core")), None);
        assert_eq!(
            table.resolve(&CellAddress::new("x", "edge")),
            Some("tunnel-edge".into())
        );
        assert_eq!(table.routes().len(), 1);
    }

    #[test]
    fn delete_then_unroutable() {
        let table = RoutingTable::new();
        let route = Route::Domain {
            domain: "core".into(),
            target: "tunnel-core".into(),
        };
        table.add(route.clone()).unwrap();
        table.delete(&route).unwrap();
        assert_eq!(table.resolve(&CellAddress::new("x", "core")), None);
    }
}
