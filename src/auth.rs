//! Identity resolution and authorization.
//!
//! The authority is an immutable snapshot built from configuration at
//! daemon startup and shared via `Arc`. A future hot reload must swap the
//! whole snapshot, never mutate one in use by a session.

use std::collections::HashMap;

use crate::config::{Config, Principal, Target};
use crate::error::{DeployError, Result};

#[derive(Debug)]
pub struct Authority {
    principals: HashMap<String, Principal>,
}

impl Authority {
    pub fn from_config(config: &Config) -> Authority {
        Authority {
            principals: config
                .principals
                .iter()
                .map(|p| (p.name.clone(), p.clone()))
                .collect(),
        }
    }

    pub fn resolve(&self, name: &str) -> Option<&Principal> {
        self.principals.get(name)
    }
}

/// Gate a deployment request. Checks run in a fixed order so error codes
/// never leak more than intended:
///
/// 1. unknown credential -> `Unauthenticated` (wire: BLOCKED);
/// 2. unknown target -> `NoSuchTarget` (wire: NOT_EXIST), checked before
///    authorization so an unauthorized principal cannot probe target
///    existence;
/// 3. principal not in the target's authorized set -> `Unauthorized`
///    (wire: BLOCKED).
pub fn gate<'a>(
    config: &'a Config,
    authority: &'a Authority,
    principal_name: &str,
    target_name: &str,
) -> Result<(&'a Target, &'a Principal)> {
    let principal = authority
        .resolve(principal_name)
        .ok_or(DeployError::Unauthenticated)?;
    let target = config
        .target(target_name)
        .ok_or_else(|| DeployError::NoSuchTarget(target_name.to_string()))?;
    if !target.allows(&principal.name) {
        return Err(DeployError::Unauthorized {
            principal: principal.name.clone(),
            target: target.name.clone(),
        });
    }
    Ok((target, principal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HookCommand;
    use std::path::PathBuf;

    fn fixture() -> Config {
        Config {
            backup_dir: PathBuf::from("/backups"),
            principals: vec![
                Principal {
                    name: "alice".to_string(),
                    password: "a".to_string(),
                },
                Principal {
                    name: "bob".to_string(),
                    password: "b".to_string(),
                },
            ],
            targets: vec![Target {
                name: "app".to_string(),
                path: PathBuf::from("/srv/app"),
                authorized: vec!["alice".to_string()],
                before: None,
                after: HookCommand::parse("true"),
            }],
        }
    }

    #[test]
    fn authorized_principal_passes() {
        let config = fixture();
        let authority = Authority::from_config(&config);
        let (target, principal) = gate(&config, &authority, "alice", "app").unwrap();
        assert_eq!(target.name, "app");
        assert_eq!(principal.name, "alice");
    }

    #[test]
    fn unknown_principal_is_unauthenticated() {
        let config = fixture();
        let authority = Authority::from_config(&config);
        // Even with an unknown target: identity resolution comes first.
        assert!(matches!(
            gate(&config, &authority, "mallory", "no-such-target"),
            Err(DeployError::Unauthenticated)
        ));
    }

    #[test]
    fn unknown_target_checked_before_authorization() {
        let config = fixture();
        let authority = Authority::from_config(&config);
        // bob is authenticated but not authorized for anything; a missing
        // target must still report NoSuchTarget, not Unauthorized.
        assert!(matches!(
            gate(&config, &authority, "bob", "missing"),
            Err(DeployError::NoSuchTarget(_))
        ));
    }

    #[test]
    fn unauthorized_principal_blocked() {
        let config = fixture();
        let authority = Authority::from_config(&config);
        assert!(matches!(
            gate(&config, &authority, "bob", "app"),
            Err(DeployError::Unauthorized { .. })
        ));
    }
}
