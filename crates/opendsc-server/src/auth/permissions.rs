//! Authorization decision procedure
//!
//! Two tiers: global permissions derived from roles (with a `*` wildcard),
//! and per-resource ACL rows. A request is allowed when the action's global
//! permission is held, when the relevant admin-override permission is held,
//! or when an ACL row for the user or one of their groups grants at least
//! the required level.

use uuid::Uuid;

use opendsc_core::{Error, Result};

use crate::state::{AppState, UserClaims};

/// ACL levels in ascending order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Read = 1,
    Modify = 2,
    Manage = 3,
}

/// Resource kinds that carry ACLs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Configuration,
    CompositeConfiguration,
    ParameterFile,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Configuration => "Configuration",
            ResourceKind::CompositeConfiguration => "CompositeConfiguration",
            ResourceKind::ParameterFile => "ParameterFile",
        }
    }

    /// The global permission that bypasses this kind's ACLs
    pub fn admin_override(&self) -> &'static str {
        match self {
            ResourceKind::Configuration | ResourceKind::CompositeConfiguration => {
                "configurations.admin-override"
            }
            ResourceKind::ParameterFile => "parameters.admin-override",
        }
    }
}

/// Whether the claims hold a global permission; `*` and `area.*` wildcards
/// are honored
pub fn has_global(claims: &UserClaims, permission: &str) -> bool {
    if claims.permissions.contains("*") || claims.permissions.contains(permission) {
        return true;
    }
    if let Some((area, _)) = permission.split_once('.') {
        if claims.permissions.contains(&format!("{}.*", area)) {
            return true;
        }
    }
    false
}

/// Require a global permission
pub fn require_global(claims: &UserClaims, permission: &str) -> Result<()> {
    if has_global(claims, permission) {
        Ok(())
    } else {
        Err(Error::Forbidden(format!(
            "permission {} required",
            permission
        )))
    }
}

/// Require at least `level` on a resource, honoring the admin override
pub async fn require_resource(
    state: &AppState,
    claims: &UserClaims,
    kind: ResourceKind,
    resource_id: Uuid,
    level: Level,
) -> Result<()> {
    if has_global(claims, kind.admin_override()) {
        return Ok(());
    }

    let mut principals = vec![claims.user_id];
    principals.extend(claims.groups.iter().copied());

    let granted = state
        .repos
        .auth
        .acl_level(&principals, kind.as_str(), resource_id)
        .await?;

    match granted {
        Some(granted) if granted >= level as i32 => Ok(()),
        _ => Err(Error::Forbidden(format!(
            "{:?} access to {} required",
            level,
            kind.as_str()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn claims(perms: &[&str]) -> UserClaims {
        UserClaims {
            user_id: Uuid::new_v4(),
            username: "tester".into(),
            permissions: perms.iter().map(|s| s.to_string()).collect::<HashSet<_>>(),
            groups: Vec::new(),
        }
    }

    #[test]
    fn test_exact_permission() {
        assert!(has_global(&claims(&["nodes.read"]), "nodes.read"));
        assert!(!has_global(&claims(&["nodes.read"]), "nodes.manage"));
    }

    #[test]
    fn test_star_wildcard() {
        assert!(has_global(&claims(&["*"]), "users.manage"));
    }

    #[test]
    fn test_area_wildcard() {
        let c = claims(&["nodes.*"]);
        assert!(has_global(&c, "nodes.read"));
        assert!(has_global(&c, "nodes.manage"));
        assert!(!has_global(&c, "users.manage"));
    }

    #[test]
    fn test_level_ordering() {
        assert!(Level::Manage > Level::Modify);
        assert!(Level::Modify > Level::Read);
        assert_eq!(Level::Read as i32, 1);
        assert_eq!(Level::Manage as i32, 3);
    }

    #[test]
    fn test_admin_override_names() {
        assert_eq!(
            ResourceKind::Configuration.admin_override(),
            "configurations.admin-override"
        );
        assert_eq!(
            ResourceKind::ParameterFile.admin_override(),
            "parameters.admin-override"
        );
    }
}
