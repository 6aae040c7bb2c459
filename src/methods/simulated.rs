//! Simulated platform identities for local development.
//!
//! Nothing here is verified. The adapter only registers this provider when
//! simulation is enabled, which configuration limits to non-hosted environments.

use crate::claims::{AuthMethodTag, Claim, Identity, claim_types};
use crate::methods::{AuthenticationResult, IdentityResolver, RequestContext};
use crate::session::SimulationRecord;
use async_trait::async_trait;

/// Query parameter carrying the simulated provider tag.
pub const SIMULATE_PROVIDER_PARAM: &str = "simulate_provider";

/// Query parameter carrying the simulated user id.
pub const SIMULATE_USER_PARAM: &str = "simulate_user";

/// Fixed profile used for one provider tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulatedProfile {
    pub placeholder_id: &'static str,
    pub display_name: &'static str,
    pub email: &'static str,
    pub extra: Option<(&'static str, &'static str)>,
}

const AAD: SimulatedProfile = SimulatedProfile {
    placeholder_id: "aad_user_12345",
    display_name: "John Doe",
    email: "john.doe@contoso.com",
    extra: Some((claim_types::VERSION, "2.0")),
};

const GOOGLE: SimulatedProfile = SimulatedProfile {
    placeholder_id: "google_user_67890",
    display_name: "Jane Smith",
    email: "jane.smith@gmail.com",
    extra: Some((
        claim_types::PICTURE,
        "https://lh3.googleusercontent.com/a/default-user=s96-c",
    )),
};

const FACEBOOK: SimulatedProfile = SimulatedProfile {
    placeholder_id: "facebook_user_11111",
    display_name: "Bob Johnson",
    email: "bob.johnson@example.com",
    extra: Some((
        claim_types::PICTURE,
        "https://graph.facebook.com/v12.0/me/picture",
    )),
};

const GENERIC: SimulatedProfile = SimulatedProfile {
    placeholder_id: "easyauth_user_99999",
    display_name: "Demo User",
    email: "demo@example.com",
    extra: None,
};

/// Template and canonical idp tag for a known provider, matched case-insensitively.
fn known_profile(provider: &str) -> Option<(&'static str, SimulatedProfile)> {
    match provider.to_ascii_lowercase().as_str() {
        "aad" => Some(("aad", AAD)),
        "google" => Some(("google", GOOGLE)),
        "facebook" => Some(("facebook", FACEBOOK)),
        _ => None,
    }
}

/// Template used for a provider tag.
pub fn profile_for(provider: &str) -> SimulatedProfile {
    known_profile(provider).map_or(GENERIC, |(_, profile)| profile)
}

/// Build the simulated identity for a provider tag and optional user id.
pub fn simulated_identity(provider: &str, user_id: Option<&str>) -> Identity {
    // Unknown tags keep the caller's spelling in the idp claim.
    let (idp, profile) = match known_profile(provider) {
        Some((idp, profile)) => (idp.to_string(), profile),
        None => (provider.to_string(), GENERIC),
    };

    let mut claims = vec![
        Claim::new(
            claim_types::NAME_IDENTIFIER,
            user_id.unwrap_or(profile.placeholder_id),
        ),
        Claim::new(claim_types::NAME, profile.display_name),
        Claim::new(claim_types::EMAIL, profile.email),
        Claim::new(claim_types::IDENTITY_PROVIDER, idp),
    ];
    if let Some((claim_type, value)) = profile.extra {
        claims.push(Claim::new(claim_type, value));
    }

    Identity::new(claims, AuthMethodTag::Simulated)
}

/// Resolves simulated identities from query parameters or the session record.
#[derive(Debug, Clone, Default)]
pub struct SimulatedIdentityProvider;

impl SimulatedIdentityProvider {
    pub fn new() -> Self {
        Self
    }

    async fn find_record(&self, request: &RequestContext) -> Option<SimulationRecord> {
        if let Some(provider) = request.query(SIMULATE_PROVIDER_PARAM) {
            return SimulationRecord::new(
                provider,
                request.query(SIMULATE_USER_PARAM).map(str::to_string),
            );
        }

        let session = request.session()?;
        match SimulationRecord::load(session).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read simulation record from session");
                None
            }
        }
    }
}

#[async_trait]
impl IdentityResolver for SimulatedIdentityProvider {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn resolve(&self, request: &RequestContext) -> AuthenticationResult {
        let Some(record) = self.find_record(request).await else {
            return AuthenticationResult::NoResult;
        };

        tracing::info!(
            provider = record.provider(),
            "Simulated platform login for provider"
        );
        AuthenticationResult::Success(simulated_identity(record.provider(), record.user_id()))
    }
}
