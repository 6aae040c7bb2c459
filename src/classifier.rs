//! Post-hoc identity provider classification.
//!
//! Looks at the inbound platform headers and the resolved identity and reports
//! which upstream provider most likely produced it, with the reasons in the order
//! they were found. Read-only; never fails.

use crate::claims::{AuthMethodTag, Identity, claim_types};
use crate::methods::header::{
    PRINCIPAL_HEADER, PRINCIPAL_ID_HEADER, PRINCIPAL_IDP_HEADER, PRINCIPAL_NAME_HEADER,
};
use http::HeaderMap;
use serde::Serialize;

const TOKEN_HEADER_PREFIX: &str = "x-ms-token-aad-";

/// Broad provider family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderFamily {
    Platform,
    B2c,
    AzureAd,
    LocalIdentity,
    Google,
    Facebook,
    GitHub,
    Twitter,
    OAuth,
    Unknown,
}

/// Classifier verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderClassification {
    pub family: ProviderFamily,
    pub label: String,
    pub reasons: Vec<String>,
}

/// Platform authentication headers present on the request, in a stable order.
pub fn platform_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    let mut found: Vec<(String, String)> = headers
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str();
            [
                PRINCIPAL_HEADER,
                PRINCIPAL_NAME_HEADER,
                PRINCIPAL_ID_HEADER,
                PRINCIPAL_IDP_HEADER,
            ]
            .iter()
            .any(|h| h.eq_ignore_ascii_case(name))
                || name.starts_with(TOKEN_HEADER_PREFIX)
        })
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();
    found.sort();
    found.dedup_by(|a, b| a.0 == b.0);
    found
}

fn issuer_family(issuer: &str) -> (ProviderFamily, String) {
    let lower = issuer.to_ascii_lowercase();
    [
        ("google", ProviderFamily::Google, "Google OAuth"),
        ("facebook", ProviderFamily::Facebook, "Facebook"),
        ("github", ProviderFamily::GitHub, "GitHub"),
        ("twitter", ProviderFamily::Twitter, "Twitter"),
    ]
    .into_iter()
    .find(|(needle, _, _)| lower.contains(needle))
    .map(|(_, family, label)| (family, label.to_string()))
    .unwrap_or_else(|| (ProviderFamily::OAuth, format!("OAuth Provider ({issuer})")))
}

/// Classify the provider behind `identity`. First matching rule wins.
pub fn classify(identity: Option<&Identity>, headers: &HeaderMap) -> ProviderClassification {
    let mut reasons = Vec::new();

    if !platform_headers(headers).is_empty() {
        reasons.push("Platform authentication headers detected".to_string());
        let mut label = "Azure App Service EasyAuth".to_string();
        if let Some(idp) = headers
            .get(PRINCIPAL_IDP_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            label.push_str(&format!(" ({idp})"));
            reasons.push(format!("Identity provider: {idp}"));
        }
        return ProviderClassification {
            family: ProviderFamily::Platform,
            label,
            reasons,
        };
    }

    let Some(identity) = identity else {
        return ProviderClassification {
            family: ProviderFamily::Unknown,
            label: "Unknown Provider".to_string(),
            reasons: vec!["No identity resolved and no platform headers present".to_string()],
        };
    };

    let issuer = identity.first_value(claim_types::ISSUER);
    let policy = identity
        .first_value(claim_types::TRUST_FRAMEWORK_POLICY)
        .or_else(|| identity.first_value(claim_types::AUTH_CONTEXT_CLASS));

    if policy.is_some() || issuer.is_some_and(|i| i.contains("b2clogin.com")) {
        let mut label = "Azure AD B2C".to_string();
        if let Some(policy) = policy.filter(|p| !p.is_empty()) {
            label.push_str(&format!(" (Policy: {policy})"));
            reasons.push(format!("B2C policy detected: {policy}"));
        }
        reasons.push("B2C-specific claims found (tfp/acr)".to_string());
        return ProviderClassification {
            family: ProviderFamily::B2c,
            label,
            reasons,
        };
    }

    let tenant = identity.first_value(claim_types::TENANT_ID);
    if tenant.is_some()
        || issuer.is_some_and(|i| i.contains("sts.windows.net") || i.contains("login.microsoftonline.com"))
    {
        if let Some(tenant) = tenant.filter(|t| !t.is_empty()) {
            reasons.push(format!("Azure AD tenant: {tenant}"));
        }
        reasons.push("Azure AD issuer or tenant claim detected".to_string());
        return ProviderClassification {
            family: ProviderFamily::AzureAd,
            label: "Azure Active Directory".to_string(),
            reasons,
        };
    }

    if identity.method() == AuthMethodTag::Identity {
        return ProviderClassification {
            family: ProviderFamily::LocalIdentity,
            label: "Local Identity Store".to_string(),
            reasons: vec!["Identity authentication method".to_string()],
        };
    }

    if let Some(issuer) = issuer {
        let (family, label) = issuer_family(issuer);
        return ProviderClassification {
            family,
            label,
            reasons: vec![format!("OAuth issuer: {issuer}")],
        };
    }

    ProviderClassification {
        family: ProviderFamily::Unknown,
        label: "Unknown Provider".to_string(),
        reasons: vec!["Could not determine provider from available claims and headers".to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::Claim;
    use http::HeaderValue;

    fn identity(claims: &[(&str, &str)], method: AuthMethodTag) -> Identity {
        Identity::new(
            claims.iter().map(|(t, v)| Claim::new(*t, *v)).collect(),
            method,
        )
    }

    #[test]
    fn test_platform_headers_win_regardless_of_claims() {
        let mut headers = HeaderMap::new();
        headers.insert(PRINCIPAL_HEADER, HeaderValue::from_static("e30="));
        headers.insert(PRINCIPAL_IDP_HEADER, HeaderValue::from_static("google"));
        let id = identity(&[("tfp", "B2C_1_susi")], AuthMethodTag::Header);

        let verdict = classify(Some(&id), &headers);
        assert_eq!(verdict.family, ProviderFamily::Platform);
        assert_eq!(verdict.label, "Azure App Service EasyAuth (google)");
        assert_eq!(verdict.reasons.len(), 2);
    }

    #[test]
    fn test_token_header_alone_is_platform() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ms-token-aad-id-token", HeaderValue::from_static("x"));
        assert_eq!(classify(None, &headers).family, ProviderFamily::Platform);
    }

    #[test]
    fn test_tfp_claim_is_b2c() {
        let id = identity(&[("tfp", "B2C_1_susi")], AuthMethodTag::Federated);
        let verdict = classify(Some(&id), &HeaderMap::new());
        assert_eq!(verdict.family, ProviderFamily::B2c);
        assert_eq!(verdict.label, "Azure AD B2C (Policy: B2C_1_susi)");
        assert_eq!(verdict.reasons[0], "B2C policy detected: B2C_1_susi");
    }

    #[test]
    fn test_b2c_issuer_without_policy() {
        let id = identity(
            &[("iss", "https://contoso.b2clogin.com/tenant/v2.0/")],
            AuthMethodTag::Federated,
        );
        assert_eq!(classify(Some(&id), &HeaderMap::new()).family, ProviderFamily::B2c);
    }

    #[test]
    fn test_tenant_claim_is_azure_ad() {
        let id = identity(&[("tid", "tenant-1")], AuthMethodTag::Federated);
        let verdict = classify(Some(&id), &HeaderMap::new());
        assert_eq!(verdict.family, ProviderFamily::AzureAd);
        assert_eq!(verdict.reasons[0], "Azure AD tenant: tenant-1");

        let by_issuer = identity(&[("iss", "https://sts.windows.net/abc/")], AuthMethodTag::Cookie);
        assert_eq!(classify(Some(&by_issuer), &HeaderMap::new()).family, ProviderFamily::AzureAd);
    }

    #[test]
    fn test_identity_method_is_local() {
        let id = identity(&[("iss", "https://accounts.google.com")], AuthMethodTag::Identity);
        assert_eq!(classify(Some(&id), &HeaderMap::new()).family, ProviderFamily::LocalIdentity);
    }

    #[test]
    fn test_issuer_substrings() {
        let google = identity(&[("iss", "https://accounts.google.com")], AuthMethodTag::Cookie);
        assert_eq!(classify(Some(&google), &HeaderMap::new()).family, ProviderFamily::Google);

        let other = identity(&[("iss", "https://sso.example")], AuthMethodTag::Cookie);
        let verdict = classify(Some(&other), &HeaderMap::new());
        assert_eq!(verdict.family, ProviderFamily::OAuth);
        assert_eq!(verdict.label, "OAuth Provider (https://sso.example)");
    }

    #[test]
    fn test_nothing_matches_is_unknown() {
        let id = identity(&[("name", "x")], AuthMethodTag::Simulated);
        let verdict = classify(Some(&id), &HeaderMap::new());
        assert_eq!(verdict.family, ProviderFamily::Unknown);
        assert!(!verdict.reasons.is_empty());
        assert_eq!(classify(None, &HeaderMap::new()).family, ProviderFamily::Unknown);
    }
}
