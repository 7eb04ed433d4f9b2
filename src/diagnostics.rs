//! Opt-in record of the compiled queries issued during one request.
//!
//! A [`Diagnostics`] value is created once at request entry from the session check and threaded
//! through every query of that request. When disabled it records nothing, so ordinary callers
//! never receive query text.

use crate::error::QueryError;
use serde::Serialize;

/// Identity of the caller, as resolved by the session collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallerIdentity {
    pub user_id: Option<i64>,
    pub username: Option<String>,
    pub is_admin: bool,
}

impl CallerIdentity {
    pub fn anonymous() -> Self {
        Self {
            user_id: None,
            username: None,
            is_admin: false,
        }
    }

    pub fn user(user_id: i64, username: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id),
            username: Some(username.into()),
            is_admin: false,
        }
    }

    pub fn admin(user_id: i64, username: impl Into<String>) -> Self {
        Self {
            is_admin: true,
            ..Self::user(user_id, username)
        }
    }
}

/// Session/authorization collaborator.
///
/// Invoked once per request before any query is compiled. Implementations validate the
/// caller's session and return the identity used for the diagnostics decision.
pub trait SessionGuard {
    /// # Errors
    ///
    /// Returns [`QueryError::SessionInvalid`] when the session is missing or expired.
    fn check(&self, session_id: &str) -> Result<CallerIdentity, QueryError>;
}

/// Ordered list of compiled query strings; a no-op when disabled.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Diagnostics {
    enabled: bool,
    entries: Vec<String>,
}

impl Diagnostics {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn enabled() -> Self {
        Self {
            enabled: true,
            entries: Vec::new(),
        }
    }

    /// Recording is on only when the global debug switch is set and the caller is an admin.
    pub fn for_caller(identity: Option<&CallerIdentity>, debug: bool) -> Self {
        let privileged = identity.is_some_and(|id| id.is_admin);
        log::info!(
            "diagnostics {} for caller {:?}",
            if debug && privileged { "enabled" } else { "disabled" },
            identity.and_then(|id| id.username.as_deref())
        );
        if debug && privileged {
            Self::enabled()
        } else {
            Self::disabled()
        }
    }

    /// Runs the session check and builds the request's diagnostics in one step.
    ///
    /// # Errors
    ///
    /// Propagates [`QueryError::SessionInvalid`] from the guard.
    pub fn from_session<G: SessionGuard + ?Sized>(
        guard: &G,
        session_id: &str,
        debug: bool,
    ) -> Result<(CallerIdentity, Self), QueryError> {
        let identity = guard.check(session_id)?;
        let diagnostics = Self::for_caller(Some(&identity), debug);
        Ok((identity, diagnostics))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns `true` when the entry was recorded.
    pub fn add(&mut self, sql: impl Into<String>) -> bool {
        if !self.enabled {
            return false;
        }
        self.entries.push(sql.into());
        true
    }

    /// Like [`Diagnostics::add`], but `render` only runs when recording is on.
    pub fn add_with(&mut self, render: impl FnOnce() -> String) -> bool {
        if !self.enabled {
            return false;
        }
        self.entries.push(render());
        true
    }

    /// Appends the entries of another request-scoped record.
    pub fn merge(&mut self, other: &Diagnostics) -> &mut Self {
        if self.enabled {
            self.entries.extend(other.entries.iter().cloned());
        }
        self
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for line in &self.entries {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSessions;

    impl SessionGuard for FixedSessions {
        fn check(&self, session_id: &str) -> Result<CallerIdentity, QueryError> {
            match session_id {
                "admin-session" => Ok(CallerIdentity::admin(1, "curator")),
                "user-session" => Ok(CallerIdentity::user(2, "breeder")),
                _ => Err(QueryError::SessionInvalid(format!("unknown session {session_id}"))),
            }
        }
    }

    #[test]
    fn test_disabled_records_nothing() {
        let mut diagnostics = Diagnostics::disabled();
        assert!(!diagnostics.add("SELECT * FROM germinatebase"));
        assert!(diagnostics.is_empty());
        assert_eq!(diagnostics.to_string(), "");
    }

    #[test]
    fn test_disabled_never_renders_entries() {
        let mut diagnostics = Diagnostics::disabled();
        let recorded = diagnostics.add_with(|| panic!("rendered while disabled"));
        assert!(!recorded);

        let mut enabled = Diagnostics::enabled();
        assert!(enabled.add_with(|| "SELECT 1 -- [5]".to_string()));
        assert_eq!(enabled.entries(), ["SELECT 1 -- [5]"]);
    }

    #[test]
    fn test_enabled_keeps_order() {
        let mut diagnostics = Diagnostics::enabled();
        diagnostics.add("SELECT 1");
        diagnostics.add("SELECT 2");
        assert_eq!(diagnostics.entries(), ["SELECT 1", "SELECT 2"]);
        assert_eq!(diagnostics.to_string(), "SELECT 1\nSELECT 2\n");
    }

    #[test]
    fn test_only_admins_with_debug_switch_record() {
        let admin = CallerIdentity::admin(1, "curator");
        let user = CallerIdentity::user(2, "breeder");

        assert!(Diagnostics::for_caller(Some(&admin), true).is_enabled());
        assert!(!Diagnostics::for_caller(Some(&admin), false).is_enabled());
        assert!(!Diagnostics::for_caller(Some(&user), true).is_enabled());
        assert!(!Diagnostics::for_caller(None, true).is_enabled());
    }

    #[test]
    fn test_merge_into_disabled_is_noop() {
        let mut other = Diagnostics::enabled();
        other.add("SELECT 1");

        let mut disabled = Diagnostics::disabled();
        disabled.merge(&other);
        assert!(disabled.is_empty());

        let mut enabled = Diagnostics::enabled();
        enabled.merge(&other).merge(&other);
        assert_eq!(enabled.len(), 2);
    }

    #[test]
    fn test_from_session() {
        let (identity, diagnostics) =
            Diagnostics::from_session(&FixedSessions, "admin-session", true).unwrap();
        assert!(identity.is_admin);
        assert!(diagnostics.is_enabled());

        let err = Diagnostics::from_session(&FixedSessions, "stale", true).unwrap_err();
        assert!(matches!(err, QueryError::SessionInvalid(_)));
    }
}
