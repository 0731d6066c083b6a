//! Operator authorization for bus callers.
//!
//! Every method except `Status` is restricted to operators: root, the
//! daemon's own user, and any UID listed in `operator_uids`.

use std::collections::BTreeSet;
use zbus::fdo;
use zbus::message::Header;
use zbus::names::BusName;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorPolicy {
    allowed: BTreeSet<u32>,
}

impl OperatorPolicy {
    pub fn new(daemon_uid: u32, operator_uids: &[u32]) -> Self {
        let mut allowed: BTreeSet<u32> = operator_uids.iter().copied().collect();
        allowed.insert(0);
        allowed.insert(daemon_uid);
        Self { allowed }
    }

    /// Policy for the running process.
    pub fn for_current_user(operator_uids: &[u32]) -> Self {
        Self::new(nix::unistd::getuid().as_raw(), operator_uids)
    }

    /// `Ok` if `uid` may call operator methods. A caller whose UID the bus
    /// could not report is refused.
    pub fn check(&self, op: &str, uid: Option<u32>) -> fdo::Result<()> {
        match uid {
            Some(uid) if self.allowed.contains(&uid) => Ok(()),
            Some(uid) => {
                tracing::warn!(op, uid, "caller is not an operator");
                Err(fdo::Error::AccessDenied(format!("uid {uid} may not call {op}")))
            }
            None => {
                tracing::warn!(op, "caller uid unknown");
                Err(fdo::Error::AccessDenied(format!("unidentified caller may not call {op}")))
            }
        }
    }

    /// Resolve the sender of `header` through the bus daemon and check it.
    pub async fn authorize(
        &self,
        op: &str,
        conn: &zbus::Connection,
        header: &Header<'_>,
    ) -> fdo::Result<()> {
        let uid = match header.sender() {
            Some(sender) => {
                let dbus = fdo::DBusProxy::new(conn).await?;
                Some(
                    dbus.get_connection_unix_user(BusName::from(sender.to_owned()))
                        .await?,
                )
            }
            None => None,
        };
        self.check(op, uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_daemon_user_and_listed_uids_allowed() {
        let policy = OperatorPolicy::new(990, &[1000, 1001]);
        for uid in [0, 990, 1000, 1001] {
            assert!(policy.check("enroll", Some(uid)).is_ok(), "uid {uid}");
        }
    }

    #[test]
    fn test_other_uid_denied() {
        let policy = OperatorPolicy::new(990, &[1000]);
        let err = policy.check("report", Some(1002)).unwrap_err();
        assert!(matches!(err, fdo::Error::AccessDenied(msg) if msg.contains("1002")));
    }

    #[test]
    fn test_unknown_caller_denied() {
        let policy = OperatorPolicy::new(990, &[]);
        assert!(matches!(
            policy.check("list_identities", None),
            Err(fdo::Error::AccessDenied(_))
        ));
    }
}
