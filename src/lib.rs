/*!
# idopt-auth

Identity resolution and provider dispatch for web applications that sit behind a
hosting platform's authentication front end, a federated OIDC provider, or both.

The crate answers two questions per request:

- **Who is this?** An [`AuthenticationScheme`] folds an ordered chain of
  [`IdentityResolver`]s: trusted platform headers first, then a non-verifying local
  simulation of those headers, then any resolvers the application appends (such as
  the signed identity cookie). The first success wins.
- **Where should login and logout go?** The [`ProviderDispatchRouter`] maps a
  provider key plus the runtime environment to a federated challenge, a platform
  login endpoint, a local simulation page, a local credential page, or a
  disabled-provider message.

Federated sign-in uses an OIDC scheme whose response validation tolerates
id-token-only responses and, per scheme, missing state. A classifier reports which
upstream provider most likely produced a resolved identity.

## Quick Start

```rust,no_run
use idopt_auth::dispatch::{ProviderDispatchRouter, RequestOrigin};
use idopt_auth::config::AuthConfig;
use idopt_auth::server::oidc::FederatedSchemes;

# fn main() -> Result<(), Box<dyn std::error::Error>> {
let config = AuthConfig::from_env()?;
config.validate()?;

let router = ProviderDispatchRouter::new(
    config.provider_registry()?,
    FederatedSchemes::new(),
    config.dispatch_settings(),
);

let origin = RequestOrigin::new("http", "localhost:8080");
let decision = router.decide_login(Some("google"), &origin)?;
println!("{decision:?}");
# Ok(())
# }
```

With the `axum-integration` feature (on by default), [`integrations::axum::build_router`]
mounts the whole surface on an axum `Router`.
*/

pub mod auth;
pub mod claims;
pub mod classifier;
pub mod config;
pub mod cookie;
pub mod dispatch;
pub mod errors;
pub mod methods;
pub mod providers;
pub mod server;
pub mod session;
pub mod storage;

// Web framework integrations
pub mod integrations {
    #[cfg(feature = "axum-integration")]
    pub mod axum;
}

pub use auth::{AuthenticationScheme, ChallengeProperties};
pub use claims::{AuthMethodTag, Claim, Identity};
pub use classifier::{ProviderClassification, ProviderFamily, classify};
pub use config::AuthConfig;
pub use cookie::{CookieIdentityResolver, CookieScheme, CookieSchemeConfig};
pub use dispatch::{
    DispatchOutcome, LoginDecision, LogoutDecision, ProviderDispatchRouter, RequestOrigin,
    RuntimeEnvironment,
};
pub use errors::{AuthError, ProtocolValidationError, Result, StorageError};
pub use methods::{
    AuthenticationResult, HeaderIdentityExtractor, IdentityResolver, RequestContext,
    SimulatedIdentityProvider,
};
pub use providers::{DispatchPolicy, ProviderRegistry};
pub use server::oidc::{
    FederatedChallenger, FederatedSchemes, OidcScheme, OidcSchemeConfig, ProtocolValidationPolicy,
    RelaxedProtocolValidator,
};
pub use session::{MemorySessionStore, Session, SessionStore, SimulationRecord};
pub use storage::{MemoryProfileStore, UserProfile, UserProfileStore};
