//! OpenID Connect relying party: the federated scheme and its response validation.

pub mod client;
pub mod validator;

pub use client::{
    FederatedChallenger, FederatedSchemes, FederatedSignIn, OidcScheme, OidcSchemeConfig,
};
pub use validator::{
    AuthenticationResponse, IdTokenClaims, ProtocolValidationPolicy, ProtocolValidator,
    RelaxedProtocolValidator, StandardProtocolValidator, TokenEndpointResponse, ValidationContext,
};
