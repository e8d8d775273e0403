//! Handshake credential checks.
//!
//! A connection is only admitted when its upgrade request carries a token,
//! either as `Authorization: Bearer <token>` or as a `?token=` query
//! parameter. What a token *means* is decided by a [`TokenVerifier`].

use thiserror::Error;
use tokio_tungstenite::tungstenite::handshake::server::Request;
use url::form_urlencoded;

/// Proof that a connection passed the handshake check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Authentication error: no token provided")]
    MissingToken,
    #[error("Authentication error: {0}")]
    Rejected(String),
}

/// Decides whether a handshake token is acceptable.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Credential, AuthError>;
}

/// Accepts any non-empty token.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptNonEmpty;

impl TokenVerifier for AcceptNonEmpty {
    fn verify(&self, token: &str) -> Result<Credential, AuthError> {
        if token.trim().is_empty() {
            return Err(AuthError::MissingToken);
        }
        Ok(Credential::new(token))
    }
}

/// Pull the credential token out of an upgrade request.
///
/// The `Authorization` header wins over the query string.
pub fn extract_token(request: &Request) -> Option<String> {
    let from_header = request
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            let (scheme, token) = value.trim().split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
        })
        .filter(|token| !token.is_empty());

    if let Some(token) = from_header {
        return Some(token.to_string());
    }

    let query = request.uri().query()?;
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "token")
        .map(|(_, token)| token.into_owned())
        .filter(|token| !token.is_empty())
}

/// Extract and verify in one step.
pub fn authenticate(request: &Request, verifier: &dyn TokenVerifier) -> Result<Credential, AuthError> {
    let token = extract_token(request).ok_or(AuthError::MissingToken)?;
    verifier.verify(&token)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, auth: Option<&str>) -> Request {
        let mut builder = Request::builder().uri(uri);
        if let Some(value) = auth {
            builder = builder.header("Authorization", value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_bearer_header() {
        let req = request("ws://localhost/", Some("Bearer abc123"));
        assert_eq!(extract_token(&req).as_deref(), Some("abc123"));
    }

    #[test]
    fn test_query_token() {
        let req = request("ws://localhost/socket?room=1&token=xyz", None);
        assert_eq!(extract_token(&req).as_deref(), Some("xyz"));
    }

    #[test]
    fn test_query_token_is_percent_decoded() {
        let req = request("ws://localhost/?token=a%2Bb%3D%3D", None);
        assert_eq!(extract_token(&req).as_deref(), Some("a+b=="));

        let req = request("ws://localhost/?token=two+words", None);
        assert_eq!(extract_token(&req).as_deref(), Some("two words"));
    }

    #[test]
    fn test_header_preferred_over_query() {
        let req = request("ws://localhost/?token=query", Some("bearer header"));
        assert_eq!(extract_token(&req).as_deref(), Some("header"));
    }

    #[test]
    fn test_missing_or_empty_token() {
        assert_eq!(extract_token(&request("ws://localhost/", None)), None);
        assert_eq!(extract_token(&request("ws://localhost/?token=", None)), None);
        assert_eq!(extract_token(&request("ws://localhost/", Some("Basic abc"))), None);
        assert_eq!(extract_token(&request("ws://localhost/", Some("Bearer   "))), None);
    }

    #[test]
    fn test_authenticate_with_default_verifier() {
        let ok = authenticate(&request("ws://localhost/?token=t", None), &AcceptNonEmpty).unwrap();
        assert_eq!(ok.token(), "t");

        let err = authenticate(&request("ws://localhost/", None), &AcceptNonEmpty).unwrap_err();
        assert_eq!(err, AuthError::MissingToken);
    }

    struct DenyAll;

    impl TokenVerifier for DenyAll {
        fn verify(&self, _token: &str) -> Result<Credential, AuthError> {
            Err(AuthError::Rejected("revoked".into()))
        }
    }

    #[test]
    fn test_custom_verifier_can_reject() {
        let err = authenticate(&request("ws://localhost/?token=t", None), &DenyAll).unwrap_err();
        assert_eq!(err.to_string(), "Authentication error: revoked");
    }
}
