//! Platform principal header extraction.
//!
//! The hosting platform authenticates the user itself and forwards the result as a
//! base64-encoded JSON principal in `X-MS-CLIENT-PRINCIPAL`. Requests that did not
//! pass through the platform simply lack the header.

use crate::claims::{AuthMethodTag, Claim, Identity, UNKNOWN_SUBJECT};
use crate::errors::AuthError;
use crate::methods::{AuthenticationResult, IdentityResolver, RequestContext};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use http::HeaderMap;
use serde::Deserialize;

/// Header carrying the encoded principal.
pub const PRINCIPAL_HEADER: &str = "x-ms-client-principal";

/// Header carrying the plain display name.
pub const PRINCIPAL_NAME_HEADER: &str = "x-ms-client-principal-name";

/// Header carrying the platform user id.
pub const PRINCIPAL_ID_HEADER: &str = "x-ms-client-principal-id";

/// Header carrying the identity provider name.
pub const PRINCIPAL_IDP_HEADER: &str = "x-ms-client-principal-idp";

/// Decoded principal payload.
///
/// Accepts both the camelCase layout and the platform's native short keys.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientPrincipal {
    #[serde(default, alias = "auth_typ")]
    pub auth_type: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_id_claim_type: Option<String>,
    #[serde(default, alias = "name_typ")]
    pub name_claim_type: Option<String>,
    #[serde(default, alias = "role_typ")]
    pub role_claim_type: Option<String>,
    #[serde(default)]
    pub claims: Vec<PrincipalClaim>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrincipalClaim {
    #[serde(rename = "type", alias = "typ")]
    pub claim_type: String,
    #[serde(alias = "val")]
    pub value: String,
}

impl ClientPrincipal {
    /// Decode a header value into a principal.
    pub fn decode(encoded: &str) -> Result<Self, AuthError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| AuthError::malformed_principal(format!("invalid base64: {e}")))?;
        let json = String::from_utf8(bytes)
            .map_err(|e| AuthError::malformed_principal(format!("invalid UTF-8: {e}")))?;
        serde_json::from_str(&json)
            .map_err(|e| AuthError::malformed_principal(format!("invalid JSON: {e}")))
    }
}

/// Resolves identities from the platform principal header.
#[derive(Debug, Clone, Default)]
pub struct HeaderIdentityExtractor;

impl HeaderIdentityExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Extract an identity from a header set.
    pub fn extract(&self, headers: &HeaderMap) -> AuthenticationResult {
        let encoded = match headers.get(PRINCIPAL_HEADER) {
            Some(value) => match value.to_str() {
                Ok(value) => value,
                Err(_) => {
                    return AuthenticationResult::Failure(AuthError::malformed_principal(
                        "header is not valid ASCII",
                    ));
                }
            },
            None => return AuthenticationResult::NoResult,
        };
        if encoded.trim().is_empty() {
            return AuthenticationResult::NoResult;
        }

        let principal = match ClientPrincipal::decode(encoded) {
            Ok(principal) => principal,
            Err(e) => return AuthenticationResult::Failure(e),
        };
        if principal.claims.is_empty() {
            return AuthenticationResult::Failure(AuthError::malformed_principal(
                "principal contains no claims",
            ));
        }

        let name_from_header = headers
            .get(PRINCIPAL_NAME_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty());

        AuthenticationResult::Success(normalize(principal, name_from_header))
    }
}

fn normalize(principal: ClientPrincipal, name_from_header: Option<&str>) -> Identity {
    let claims = principal
        .claims
        .into_iter()
        .map(|c| Claim::new(c.claim_type, c.value))
        .collect();

    let mut identity = Identity::new(claims, AuthMethodTag::Header);
    if let Some(role_type) = principal.role_claim_type.filter(|t| !t.is_empty()) {
        identity = identity.with_role_claim_type(role_type);
    }

    let user_id = principal.user_id.filter(|id| !id.is_empty());
    let identity = identity.ensure_subject(user_id.as_deref().unwrap_or(UNKNOWN_SUBJECT));

    // Display name falls back to the name header, then the user id, then the subject.
    let subject = identity
        .subject_id()
        .unwrap_or(UNKNOWN_SUBJECT)
        .to_string();
    let fallback_name = name_from_header
        .or(user_id.as_deref())
        .unwrap_or(&subject)
        .to_string();

    match principal.name_claim_type.filter(|t| !t.is_empty()) {
        Some(name_type) if identity.has_claim(&name_type) => {
            identity.with_name_claim_type(name_type)
        }
        _ => identity.ensure_display_name(&fallback_name),
    }
}

#[async_trait]
impl IdentityResolver for HeaderIdentityExtractor {
    fn name(&self) -> &str {
        "header"
    }

    async fn resolve(&self, request: &RequestContext) -> AuthenticationResult {
        let result = self.extract(request.headers());
        match &result {
            AuthenticationResult::Success(identity) => tracing::info!(
                subject = identity.subject_id().unwrap_or(UNKNOWN_SUBJECT),
                "Platform principal header found, authenticating user"
            ),
            AuthenticationResult::Failure(e) => {
                tracing::warn!(error = %e, "Failed to parse platform principal header")
            }
            AuthenticationResult::NoResult => {}
        }
        result
    }
}

/// Encode claims the way the platform does. Handy for tests and local tooling.
pub fn encode_principal(user_id: Option<&str>, claims: &[(&str, &str)]) -> String {
    let payload = serde_json::json!({
        "authType": "aad",
        "userId": user_id,
        "claims": claims
            .iter()
            .map(|(t, v)| serde_json::json!({ "type": t, "value": v }))
            .collect::<Vec<_>>(),
    });
    STANDARD.encode(payload.to_string())
}
