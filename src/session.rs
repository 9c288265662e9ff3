use crate::keys::{sanitize_identity, OwnerToken};

/// Per-caller context passed explicitly into the booking and ownership paths.
///
/// The identity is whatever the caller claims; nothing here verifies it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    identity: Option<String>,
}

impl Session {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_identity(raw: &str) -> Self {
        let mut session = Self::anonymous();
        session.login(raw);
        session
    }

    /// Replace the identity. A blank identity logs out.
    pub fn login(&mut self, raw: &str) {
        let trimmed = raw.trim();
        self.identity = (!trimmed.is_empty()).then(|| trimmed.to_string());
    }

    pub fn logout(&mut self) {
        self.identity = None;
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }

    pub fn owner_token(&self) -> Option<OwnerToken> {
        self.identity.as_deref().map(sanitize_identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_trims_and_blank_logs_out() {
        let mut session = Session::with_identity("  a.b@x.com ");
        assert_eq!(session.identity(), Some("a.b@x.com"));
        assert_eq!(session.owner_token().unwrap().as_str(), "a_b@x_com");

        session.login("   ");
        assert!(!session.is_authenticated());
        assert!(session.owner_token().is_none());
    }

    #[test]
    fn logout_clears_identity() {
        let mut session = Session::with_identity("x@y.z");
        session.logout();
        assert_eq!(session, Session::anonymous());
    }
}
