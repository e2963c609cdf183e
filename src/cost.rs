//! Pool cost calculation
//!
//! Pure functions mapping a pool's queue/space telemetry snapshot to two
//! scalars: a space cost and a performance cost. Lower is better; link-group
//! selection uses these to rank otherwise-eligible pools. No side effects.

use serde::{Deserialize, Serialize};

/// Reference file size used to normalize the space cost.
const REFERENCE_FILE_SIZE: i64 = 3 * 50 * 1000 * 1000;

/// Lower bound on the LRU age used in the aged-space formula, in seconds.
const SPACE_CUT_SECONDS: i64 = 60;

const WEEK_SECONDS: f64 = (24 * 7 * 3600) as f64;

/// Performance cost reported for a pool that declares no queues at all.
const UNUSABLE_PERFORMANCE_COST: f64 = 1_000_000.0;

/// Queue classes contribute to the performance cost with different weightings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueKind {
    /// Client mover queues, including named per-protocol queues.
    Mover,
    /// Flush-to-tape queue.
    Store,
    /// Stage-from-tape queue.
    Restore,
}

/// Telemetry for a single pool queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolQueueInfo {
    pub name: String,
    pub kind: QueueKind,
    pub active: u32,
    pub max_active: u32,
    pub queued: u32,
}

/// Space telemetry for a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSpaceInfo {
    /// Free bytes not occupied by any replica.
    pub free: i64,
    /// Bytes held by replicas that may be garbage collected.
    pub removable: i64,
    /// Free-space threshold below which the pool must reclaim space.
    pub gap: i64,
    /// Tunable knob selecting between the cost formula families.
    pub break_even: f64,
    /// Age of the least recently used replica, in seconds.
    pub lru_seconds: i64,
}

/// One pool's complete telemetry snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolCostInfo {
    pub name: String,
    pub space: PoolSpaceInfo,
    pub queues: Vec<PoolQueueInfo>,
}

/// Computed placement cost for a pool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cost {
    pub space: f64,
    pub performance: f64,
}

/// Compute the full cost for a pool snapshot.
pub fn calculate(info: &PoolCostInfo) -> Cost {
    Cost {
        space: space_cost(&info.space),
        performance: performance_cost(&info.queues),
    }
}

/// Space cost: 0 when free space is ample, growing without bound as free and
/// removable space are exhausted relative to the gap threshold.
///
/// A break-even of 1.0 or more selects the legacy formula driven purely by
/// free/removable ratios; smaller values select the formula that prices
/// removable space by the age of the least recently used replica.
pub fn space_cost(space: &PoolSpaceInfo) -> f64 {
    if space.break_even >= 1.0 {
        space_cost_by_ratio(space)
    } else {
        space_cost_by_age(space)
    }
}

fn space_cost_by_ratio(space: &PoolSpaceInfo) -> f64 {
    if REFERENCE_FILE_SIZE < space.free {
        REFERENCE_FILE_SIZE as f64 / space.free as f64 / space.break_even
    } else if space.removable < space.gap {
        f64::INFINITY
    } else {
        REFERENCE_FILE_SIZE as f64 / (space.removable + space.free) as f64
    }
}

fn space_cost_by_age(space: &PoolSpaceInfo) -> f64 {
    if space.free > space.gap {
        REFERENCE_FILE_SIZE as f64 / space.free as f64
    } else if space.removable < space.gap {
        f64::INFINITY
    } else {
        let space_factor = space.break_even * WEEK_SECONDS;
        1.0 + space_factor / space.lru_seconds.max(SPACE_CUT_SECONDS) as f64
    }
}

/// Performance cost: normalized utilization averaged over all declared
/// queues. Mover queues contribute (queued + active) / max_active; store and
/// restore queues saturate to 1.0 as soon as anything is queued and otherwise
/// approach 1.0 geometrically with the number of active entries.
pub fn performance_cost(queues: &[PoolQueueInfo]) -> f64 {
    let mut cost = 0.0;
    let mut div = 0.0;
    for queue in queues {
        match queue.kind {
            QueueKind::Mover => {
                if queue.max_active > 0 {
                    cost += (queue.queued as f64 + queue.active as f64) / queue.max_active as f64;
                } else if queue.queued > 0 {
                    cost += 1.0;
                }
            }
            QueueKind::Store | QueueKind::Restore => {
                if queue.queued > 0 {
                    cost += 1.0;
                } else {
                    cost += 1.0 - 0.75f64.powi(queue.active as i32);
                }
            }
        }
        div += 1.0;
    }
    if div > 0.0 {
        cost / div
    } else {
        UNUSABLE_PERFORMANCE_COST
    }
}

/// A pool is usable for writes while its free space still exceeds the gap
/// threshold. Pools below the gap serve writes only by evicting replicas,
/// which link-group accounting must not count on.
pub fn usable_for_write(space: &PoolSpaceInfo) -> bool {
    space.gap < space.free
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space(free: i64, removable: i64, gap: i64, break_even: f64, lru: i64) -> PoolSpaceInfo {
        PoolSpaceInfo {
            free,
            removable,
            gap,
            break_even,
            lru_seconds: lru,
        }
    }

    fn mover(active: u32, max_active: u32, queued: u32) -> PoolQueueInfo {
        PoolQueueInfo {
            name: "regular".into(),
            kind: QueueKind::Mover,
            active,
            max_active,
            queued,
        }
    }

    #[test]
    fn ample_free_space_is_cheap() {
        let a = space_cost(&space(1 << 40, 0, 1 << 20, 1.0, 0));
        let b = space_cost(&space(1 << 30, 0, 1 << 20, 1.0, 0));
        assert!(a < b);
        assert!(a < 0.001);
    }

    #[test]
    fn exhausted_pool_costs_infinity() {
        let cost = space_cost(&space(100, 50, 1 << 20, 1.0, 0));
        assert!(cost.is_infinite());
        let cost = space_cost(&space(100, 50, 1 << 20, 0.5, 3600));
        assert!(cost.is_infinite());
    }

    #[test]
    fn aged_formula_prefers_older_lru() {
        let young = space_cost(&space(100, 1 << 30, 1 << 20, 0.5, 120));
        let old = space_cost(&space(100, 1 << 30, 1 << 20, 0.5, 7 * 24 * 3600));
        assert!(old < young);
    }

    #[test]
    fn performance_cost_is_average_utilization() {
        let queues = vec![mover(2, 4, 2), mover(0, 4, 0)];
        let cost = performance_cost(&queues);
        assert!((cost - 0.5).abs() < 1e-9);
    }

    #[test]
    fn no_queues_means_unusable() {
        assert_eq!(performance_cost(&[]), UNUSABLE_PERFORMANCE_COST);
    }

    #[test]
    fn saturated_mover_queue_dominates() {
        let idle = performance_cost(&[mover(0, 2, 0)]);
        let busy = performance_cost(&[mover(2, 2, 6)]);
        assert!(busy > idle);
        assert!(busy >= 1.0);
    }
}
