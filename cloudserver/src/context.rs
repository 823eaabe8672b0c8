//! Explicit request context, threaded through every operation instead of any
//! ambient per-request state: who the caller is, which folder sessions they
//! carry, and the cancellation signal for the request.

use tokio_util::sync::CancellationToken;

/// Storage and cache scope of every operation: either a user id or
/// `team/{teamId}`. Keys and cache entries from different owners never mix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn user(user_id: &str) -> Self {
        Self(user_id.to_string())
    }

    pub fn team(team_id: &str) -> Self {
        Self(format!("team/{team_id}"))
    }

    /// Rebuild an owner id from its stored string form (job payloads, cache
    /// keys). The value must have come from [`Self::user`] or [`Self::team`].
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The prefix every storage key of this owner starts with.
    pub fn key_prefix(&self) -> String {
        format!("{}/", self.0)
    }

    /// Absolute storage key for an owner-relative path.
    pub fn key(&self, relative: &str) -> String {
        utils::path::owner_key(&self.0, [relative])
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone)]
pub struct RequestContext {
    pub owner: OwnerId,
    /// `X-Folder-Session`: encrypted-folder unlock token.
    pub folder_session: Option<String>,
    /// `X-Hidden-Session`: hidden-folder reveal token.
    pub hidden_session: Option<String>,
    /// `Idempotency-Key`: replay envelope for mutations.
    pub idempotency_key: Option<String>,
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn new(owner: OwnerId) -> Self {
        Self {
            owner,
            folder_session: None,
            hidden_session: None,
            idempotency_key: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_folder_session(mut self, token: impl Into<String>) -> Self {
        self.folder_session = Some(token.into());
        self
    }

    pub fn with_hidden_session(mut self, token: impl Into<String>) -> Self {
        self.hidden_session = Some(token.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_scopes() {
        let user = OwnerId::user("u1");
        assert_eq!(user.key_prefix(), "u1/");
        assert_eq!(user.key("docs/a.txt"), "u1/docs/a.txt");

        let team = OwnerId::team("t42");
        assert_eq!(team.as_str(), "team/t42");
        assert_eq!(team.key(""), "team/t42");
    }
}
