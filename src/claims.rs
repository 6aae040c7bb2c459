//! Claims and the resolved identity they describe.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Well-known claim types.
///
/// The long URIs are the ones the hosting platform and most .NET-era identity
/// providers emit; the short names are the OIDC registered claim names.
pub mod claim_types {
    pub const NAME_IDENTIFIER: &str =
        "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/nameidentifier";
    pub const NAME: &str = "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/name";
    pub const EMAIL: &str = "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/emailaddress";
    pub const ROLE: &str = "http://schemas.microsoft.com/ws/2008/06/identity/claims/role";

    pub const SUBJECT: &str = "sub";
    pub const OBJECT_ID: &str = "oid";
    pub const TENANT_ID: &str = "tid";
    pub const ISSUER: &str = "iss";
    pub const IDENTITY_PROVIDER: &str = "idp";
    pub const TRUST_FRAMEWORK_POLICY: &str = "tfp";
    pub const AUTH_CONTEXT_CLASS: &str = "acr";
    pub const PICTURE: &str = "picture";
    pub const VERSION: &str = "ver";
    pub const OIDC_NAME: &str = "name";
    pub const OIDC_EMAIL: &str = "email";
}

/// Placeholder subject identifier used when no source supplies one.
pub const UNKNOWN_SUBJECT: &str = "unknown";

/// A single typed fact about an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    #[serde(rename = "type")]
    pub claim_type: String,
    pub value: String,
}

impl Claim {
    pub fn new(claim_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            claim_type: claim_type.into(),
            value: value.into(),
        }
    }
}

/// How an identity was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethodTag {
    /// Trusted headers injected by the hosting platform
    Header,
    /// Local, non-verifying simulation of the platform headers
    Simulated,
    /// Federated OIDC exchange
    Federated,
    /// Long-lived local identity cookie
    Cookie,
    /// Relational-store-backed local identity
    Identity,
}

impl AuthMethodTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethodTag::Header => "header",
            AuthMethodTag::Simulated => "simulated",
            AuthMethodTag::Federated => "federated",
            AuthMethodTag::Cookie => "cookie",
            AuthMethodTag::Identity => "identity",
        }
    }
}

impl fmt::Display for AuthMethodTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Method of a serialized identity that carries no tag.
fn stored_identity_method() -> AuthMethodTag {
    AuthMethodTag::Cookie
}

/// A resolved, authenticated subject.
///
/// Identities are never mutated in place: the normalization helpers consume the
/// value and hand back a new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    claims: Vec<Claim>,
    #[serde(default = "stored_identity_method")]
    method: AuthMethodTag,
    name_claim_type: String,
    role_claim_type: String,
}

impl Identity {
    /// Create an identity using the default name and role claim types.
    pub fn new(claims: Vec<Claim>, method: AuthMethodTag) -> Self {
        Self {
            claims,
            method,
            name_claim_type: claim_types::NAME.to_string(),
            role_claim_type: claim_types::ROLE.to_string(),
        }
    }

    /// Use a different claim type when looking up the display name.
    pub fn with_name_claim_type(mut self, claim_type: impl Into<String>) -> Self {
        self.name_claim_type = claim_type.into();
        self
    }

    /// Use a different claim type when looking up roles.
    pub fn with_role_claim_type(mut self, claim_type: impl Into<String>) -> Self {
        self.role_claim_type = claim_type.into();
        self
    }

    /// Same claims, established by a different mechanism.
    pub fn with_method(mut self, method: AuthMethodTag) -> Self {
        self.method = method;
        self
    }

    pub fn claims(&self) -> &[Claim] {
        &self.claims
    }

    pub fn method(&self) -> AuthMethodTag {
        self.method
    }

    pub fn name_claim_type(&self) -> &str {
        &self.name_claim_type
    }

    /// First claim of the given type.
    pub fn find_first(&self, claim_type: &str) -> Option<&Claim> {
        self.claims.iter().find(|c| c.claim_type == claim_type)
    }

    /// Value of the first claim of the given type.
    pub fn first_value(&self, claim_type: &str) -> Option<&str> {
        self.find_first(claim_type).map(|c| c.value.as_str())
    }

    pub fn has_claim(&self, claim_type: &str) -> bool {
        self.find_first(claim_type).is_some()
    }

    /// Subject identifier, trying the name identifier, `sub` and `oid` in that order.
    pub fn subject_id(&self) -> Option<&str> {
        [
            claim_types::NAME_IDENTIFIER,
            claim_types::SUBJECT,
            claim_types::OBJECT_ID,
        ]
        .iter()
        .find_map(|t| self.first_value(t))
    }

    /// Display name from the configured name claim type, falling back to the
    /// standard name claim.
    pub fn display_name(&self) -> Option<&str> {
        self.first_value(&self.name_claim_type)
            .or_else(|| self.first_value(claim_types::NAME))
    }

    pub fn email(&self) -> Option<&str> {
        self.first_value(claim_types::EMAIL)
            .or_else(|| self.first_value(claim_types::OIDC_EMAIL))
    }

    pub fn roles(&self) -> Vec<&str> {
        self.claims
            .iter()
            .filter(|c| c.claim_type == self.role_claim_type)
            .map(|c| c.value.as_str())
            .collect()
    }

    /// Returns an identity that is guaranteed to carry a subject identifier.
    pub fn ensure_subject(self, fallback: &str) -> Self {
        if self.subject_id().is_some() {
            return self;
        }
        self.with_appended(Claim::new(claim_types::NAME_IDENTIFIER, fallback))
    }

    /// Returns an identity that is guaranteed to carry a display name claim.
    pub fn ensure_display_name(self, fallback: &str) -> Self {
        if self.display_name().is_some() {
            return self;
        }
        let claim_type = self.name_claim_type.clone();
        self.with_appended(Claim::new(claim_type, fallback))
    }

    fn with_appended(self, claim: Claim) -> Self {
        let mut claims = self.claims;
        claims.push(claim);
        Self { claims, ..self }
    }
}
