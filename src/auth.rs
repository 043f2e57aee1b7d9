//! Authentication: tokens in, principals out.
//!
//! The broker never interprets tokens itself; it hands them to a pluggable
//! [`AuthProvider`]. Two providers ship with the crate: a static token
//! table for small deployments and tests, and a guest factory for
//! anonymous access.

use std::collections::HashMap;

use async_trait::async_trait;
use collab_proto::UserInfo;
use thiserror::Error;
use uuid::Uuid;

/// Role granted to principals admitted without a credential.
pub const GUEST_ROLE: &str = "guest";

/// An authenticated participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Stable user id.
    pub id: String,
    /// Optional display name.
    pub name: Option<String>,
    /// Granted roles.
    pub roles: Vec<String>,
}

impl Principal {
    /// Build a principal with just an id.
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), name: None, roles: Vec::new() }
    }

    /// Was this principal admitted anonymously?
    #[must_use]
    pub fn is_guest(&self) -> bool {
        self.roles.iter().any(|r| r == GUEST_ROLE)
    }

    /// Does the principal hold `role`?
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// The wire representation shown to other members.
    #[must_use]
    pub fn user_info(&self) -> UserInfo {
        UserInfo { id: self.id.clone(), name: self.name.clone(), roles: self.roles.clone() }
    }
}

/// Authentication failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,

    #[error("anonymous access disabled")]
    AnonymousDisabled,

    #[error("auth provider failure: {0}")]
    Provider(String),
}

/// Turns an opaque token into a principal.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Authenticate `token`. An `Err` increments the caller's per-IP
    /// failure counter.
    async fn authenticate(&self, token: &str) -> Result<Principal, AuthError>;
}

/// Mints a fresh guest principal for every connection.
#[derive(Debug, Default)]
pub struct AnonymousProvider;

impl AnonymousProvider {
    /// Build a guest principal with a random id.
    #[must_use]
    pub fn guest() -> Principal {
        let suffix = Uuid::new_v4().simple().to_string();
        Principal {
            id: format!("guest-{}", &suffix[..8]),
            name: None,
            roles: vec![GUEST_ROLE.to_string()],
        }
    }
}

#[async_trait]
impl AuthProvider for AnonymousProvider {
    async fn authenticate(&self, _token: &str) -> Result<Principal, AuthError> {
        Ok(Self::guest())
    }
}

/// Fixed token table, typically loaded from `[[tokens]]` in the config.
#[derive(Debug, Default)]
pub struct StaticTokenProvider {
    tokens: HashMap<String, Principal>,
}

impl StaticTokenProvider {
    /// Build from a token-to-principal table.
    #[must_use]
    pub fn new(tokens: HashMap<String, Principal>) -> Self {
        Self { tokens }
    }

    /// Add one token mapping.
    pub fn insert(&mut self, token: impl Into<String>, principal: Principal) {
        self.tokens.insert(token.into(), principal);
    }
}

#[async_trait]
impl AuthProvider for StaticTokenProvider {
    async fn authenticate(&self, token: &str) -> Result<Principal, AuthError> {
        self.tokens.get(token).cloned().ok_or(AuthError::InvalidToken)
    }
}
