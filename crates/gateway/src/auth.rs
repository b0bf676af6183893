// Identity verification at the connection boundary.
//
// Tokens are issued elsewhere; the gateway only checks them and turns the
// claims into an `Identity`.

use anyhow::{bail, Context};
use axum::http::{header::AUTHORIZATION, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

pub const DEFAULT_ROLE: &str = "USER";
/// Role allowed to read operational endpoints such as `/v1/stats`.
pub const ADMIN_ROLE: &str = "ADMIN";
pub const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Clone, Deserialize)]
struct IdentityClaims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    role: Option<String>,
}

/// A verified caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub email: Option<String>,
    pub role: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), email: None, role: DEFAULT_ROLE.to_string() }
    }

    pub fn is_admin(&self) -> bool {
        self.role == ADMIN_ROLE
    }
}

#[derive(Clone)]
pub struct IdentityVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl IdentityVerifier {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < MIN_SECRET_LEN {
            bail!("jwt secret must be at least {MIN_SECRET_LEN} characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self { decoding_key: DecodingKey::from_secret(secret.as_bytes()), validation })
    }

    pub fn verify(&self, token: &str) -> anyhow::Result<Identity> {
        let claims = decode::<IdentityClaims>(token, &self.decoding_key, &self.validation)
            .context("failed to decode identity token")?
            .claims;

        if claims.sub.trim().is_empty() {
            bail!("identity token has an empty subject");
        }

        Ok(Identity {
            user_id: claims.sub,
            email: claims.email,
            role: claims.role.unwrap_or_else(|| DEFAULT_ROLE.to_string()),
        })
    }
}

/// Bearer header wins over the `token` query parameter.
pub fn token_from_request<'a>(
    headers: &'a HeaderMap,
    query_token: Option<&'a str>,
) -> Option<&'a str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
        .or_else(|| query_token.map(str::trim).filter(|token| !token.is_empty()))
}

fn extract_bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;

    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    Some(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    const TEST_SECRET: &str = "freemonitor_test_secret_that_is_long_enough";

    #[derive(Serialize)]
    struct TestClaims<'a> {
        sub: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        email: Option<&'a str>,
        exp: i64,
    }

    fn token(sub: &str, exp_offset_secs: i64) -> String {
        let claims = TestClaims {
            sub,
            email: Some("ops@freemonitor.dev"),
            exp: chrono::Utc::now().timestamp() + exp_offset_secs,
        };
        let key = EncodingKey::from_secret(TEST_SECRET.as_bytes());
        encode(&Header::new(Algorithm::HS256), &claims, &key).expect("token should encode")
    }

    #[test]
    fn only_admin_role_is_admin() {
        let mut identity = Identity::new("user-1");
        assert!(!identity.is_admin());
        identity.role = ADMIN_ROLE.to_string();
        assert!(identity.is_admin());
    }

    #[test]
    fn rejects_short_secret() {
        assert!(IdentityVerifier::new("short").is_err());
    }

    #[test]
    fn verifies_valid_token_with_default_role() {
        let verifier = IdentityVerifier::new(TEST_SECRET).expect("verifier should initialize");
        let identity = verifier.verify(&token("user-1", 600)).expect("token should verify");

        assert_eq!(identity.user_id, "user-1");
        assert_eq!(identity.email.as_deref(), Some("ops@freemonitor.dev"));
        assert_eq!(identity.role, DEFAULT_ROLE);
    }

    #[test]
    fn rejects_expired_and_tampered_tokens() {
        let verifier = IdentityVerifier::new(TEST_SECRET).expect("verifier should initialize");
        assert!(verifier.verify(&token("user-1", -10)).is_err());
        assert!(verifier.verify(&format!("{}x", token("user-1", 600))).is_err());
    }

    #[test]
    fn rejects_empty_subject() {
        let verifier = IdentityVerifier::new(TEST_SECRET).expect("verifier should initialize");
        assert!(verifier.verify(&token("  ", 600)).is_err());
    }

    #[test]
    fn bearer_header_takes_precedence_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer header-token"));
        assert_eq!(token_from_request(&headers, Some("query-token")), Some("header-token"));

        let empty = HeaderMap::new();
        assert_eq!(token_from_request(&empty, Some("query-token")), Some("query-token"));
        assert_eq!(token_from_request(&empty, Some("  ")), None);
        assert_eq!(token_from_request(&empty, None), None);
    }

    #[test]
    fn non_bearer_scheme_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(token_from_request(&headers, None), None);
    }
}
