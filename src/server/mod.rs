//! Relying-party side of federated sign-in.

pub mod oidc;

pub use oidc::{
    FederatedChallenger, FederatedSchemes, OidcScheme, OidcSchemeConfig, ProtocolValidationPolicy,
    ProtocolValidator, RelaxedProtocolValidator, StandardProtocolValidator,
};
