use crate::srv::error::{IdentityKind, ServerError};
use crate::srv::event::event;
use nix::unistd::{setgid, setuid, Gid, Uid};
use users::{get_group_by_name, get_user_by_name};

/// Numeric identity resolved from user/group names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub user: Option<(String, Uid)>,
    pub group: Option<(String, Gid)>,
}

impl Identity {
    pub fn is_empty(&self) -> bool {
        self.user.is_none() && self.group.is_none()
    }
}

/// Resolve names to ids. Nothing is changed yet, so a failure here leaves the process untouched.
pub fn resolve(user: Option<&str>, group: Option<&str>) -> Result<Identity, ServerError> {
    let user = match user.map(str::trim).filter(|s| !s.is_empty()) {
        Some(name) => {
            let u = get_user_by_name(name).ok_or_else(|| ServerError::UnknownIdentity {
                kind: IdentityKind::User,
                name: name.to_string(),
            })?;
            Some((name.to_string(), Uid::from_raw(u.uid())))
        }
        None => None,
    };
    let group = match group.map(str::trim).filter(|s| !s.is_empty()) {
        Some(name) => {
            let g = get_group_by_name(name).ok_or_else(|| ServerError::UnknownIdentity {
                kind: IdentityKind::Group,
                name: name.to_string(),
            })?;
            Some((name.to_string(), Gid::from_raw(g.gid())))
        }
        None => None,
    };
    Ok(Identity { user, group })
}

/// Switch to `id`, group first (setgid is no longer permitted once the uid is dropped).
///
/// Switch failures are logged and ignored unless `strict` is set.
pub fn apply(id: &Identity, strict: bool) -> Result<(), ServerError> {
    if let Some((name, gid)) = &id.group {
        if let Err(e) = setgid(*gid) {
            let err = ServerError::IdentitySwitchFailed {
                kind: IdentityKind::Group,
                name: name.clone(),
                reason: e.to_string(),
            };
            if strict {
                return Err(err);
            }
            event("privilege", None, format!("{err}; continuing"));
        } else {
            event("privilege", None, format!("gid set group={name} gid={gid}"));
        }
    }
    if let Some((name, uid)) = &id.user {
        if let Err(e) = setuid(*uid) {
            let err = ServerError::IdentitySwitchFailed {
                kind: IdentityKind::User,
                name: name.clone(),
                reason: e.to_string(),
            };
            if strict {
                return Err(err);
            }
            event("privilege", None, format!("{err}; continuing"));
        } else {
            event("privilege", None, format!("uid set user={name} uid={uid}"));
        }
    }
    Ok(())
}

/// Resolve and apply in one step. No-op when neither name is given.
pub fn drop_privileges(user: Option<&str>, group: Option<&str>, strict: bool) -> Result<(), ServerError> {
    let id = resolve(user, group)?;
    if id.is_empty() {
        return Ok(());
    }
    apply(&id, strict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{getegid, geteuid};
    use users::{get_group_by_gid, get_user_by_uid};

    #[test]
    fn unset_names_resolve_to_empty_identity() {
        let id = resolve(None, None).unwrap();
        assert!(id.is_empty());
        let id = resolve(Some("  "), Some("")).unwrap();
        assert!(id.is_empty());
        drop_privileges(None, None, true).unwrap();
    }

    #[test]
    fn unknown_user_is_reported_by_name() {
        let err = resolve(Some("no-such-user-reactd-test"), None).unwrap_err();
        match err {
            ServerError::UnknownIdentity { kind, name } => {
                assert_eq!(kind, IdentityKind::User);
                assert_eq!(name, "no-such-user-reactd-test");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(
            resolve(Some("no-such-user-reactd-test"), None).unwrap_err().exit_code(),
            2
        );
    }

    #[test]
    fn unknown_group_is_reported_by_name() {
        let err = resolve(None, Some("no-such-group-reactd-test")).unwrap_err();
        assert!(matches!(
            err,
            ServerError::UnknownIdentity { kind: IdentityKind::Group, .. }
        ));
    }

    #[test]
    fn switching_to_current_identity_succeeds_in_strict_mode() {
        let Some(user) = get_user_by_uid(geteuid().as_raw()) else {
            return;
        };
        let Some(group) = get_group_by_gid(getegid().as_raw()) else {
            return;
        };
        let uname = user.name().to_string_lossy().to_string();
        let gname = group.name().to_string_lossy().to_string();

        let id = resolve(Some(&uname), Some(&gname)).unwrap();
        assert_eq!(id.user.as_ref().map(|(_, u)| *u), Some(geteuid()));
        assert_eq!(id.group.as_ref().map(|(_, g)| *g), Some(getegid()));
        apply(&id, true).unwrap();
    }

    #[test]
    fn failed_switch_is_fatal_only_in_strict_mode() {
        use nix::sys::wait::{waitpid, WaitStatus};
        use nix::unistd::{fork, ForkResult};

        if !geteuid().is_root() {
            return;
        }
        // An unprivileged child cannot switch back to root.
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let root = Identity {
                    user: Some(("root".to_string(), Uid::from_raw(0))),
                    group: None,
                };
                let ok = setuid(Uid::from_raw(65534)).is_ok()
                    && apply(&root, false).is_ok()
                    && matches!(
                        apply(&root, true),
                        Err(ServerError::IdentitySwitchFailed { kind: IdentityKind::User, .. })
                    )
                    && apply(&root, true).map_err(|e| e.exit_code()) == Err(2);
                std::process::exit(if ok { 0 } else { 42 });
            }
            ForkResult::Parent { child } => {
                assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 0));
            }
        }
    }
}
