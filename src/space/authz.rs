//! VO-based permission checks
//!
//! Ownership and placement authorization are decided here so the ledger can
//! stay policy-free. A request without a requester group is treated as a
//! local administrator and passes every ownership check.

use super::model::{LinkGroup, Space};
use super::{Result, SpaceError};

/// May this requester manage (release, admit into, extend) the reservation?
pub fn check_owner(space: &Space, vo_group: Option<&str>, vo_role: Option<&str>) -> Result<()> {
    let Some(group) = vo_group else {
        return Ok(());
    };
    if space.vo_group != group {
        return Err(SpaceError::Authorization(format!(
            "reservation {} belongs to {}, not {group}",
            space.id, space.vo_group
        )));
    }
    if let Some(required) = &space.vo_role {
        if vo_role != Some(required.as_str()) {
            return Err(SpaceError::Authorization(format!(
                "reservation {} requires role {required}",
                space.id
            )));
        }
    }
    Ok(())
}

/// May this requester place a reservation into the link group?
pub fn check_placement(group: &LinkGroup, vo_group: &str, vo_role: Option<&str>) -> Result<()> {
    if group.authorizes(vo_group, vo_role) {
        Ok(())
    } else {
        Err(SpaceError::Authorization(format!(
            "{vo_group} is not authorized for link group {}",
            group.name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::model::{AccessLatency, RetentionPolicy, SpaceState, VoInfo};

    fn space(vo_group: &str, vo_role: Option<&str>) -> Space {
        Space {
            id: 1,
            vo_group: vo_group.into(),
            vo_role: vo_role.map(Into::into),
            retention_policy: RetentionPolicy::Replica,
            access_latency: AccessLatency::Online,
            link_group_id: 1,
            size_in_bytes: 100,
            creation_time: 0,
            lifetime_ms: -1,
            description: None,
            state: SpaceState::Reserved,
            used_bytes: 0,
            allocated_bytes: 0,
        }
    }

    #[test]
    fn admin_passes_ownership() {
        assert!(check_owner(&space("atlas", None), None, None).is_ok());
    }

    #[test]
    fn wrong_group_rejected() {
        let err = check_owner(&space("atlas", None), Some("cms"), None).unwrap_err();
        assert!(matches!(err, SpaceError::Authorization(_)));
    }

    #[test]
    fn role_required_when_reservation_has_one() {
        let s = space("atlas", Some("production"));
        assert!(check_owner(&s, Some("atlas"), Some("production")).is_ok());
        assert!(check_owner(&s, Some("atlas"), None).is_err());
        assert!(check_owner(&s, Some("atlas"), Some("analysis")).is_err());
    }

    #[test]
    fn placement_follows_acl() {
        let group = LinkGroup {
            id: 1,
            name: "lg".into(),
            free_space: 0,
            reserved_space: 0,
            online_allowed: true,
            nearline_allowed: true,
            replica_allowed: true,
            output_allowed: true,
            custodial_allowed: true,
            last_update_time: 0,
            authorized: vec![VoInfo::new("atlas", "*")],
        };
        assert!(check_placement(&group, "atlas", Some("production")).is_ok());
        assert!(check_placement(&group, "cms", None).is_err());
    }
}
