//! Credential validation and user resolution.
//!
//! The bridge refuses to spawn a shell until an [`Authenticator`] has accepted
//! the credential carried by the upgrade request and resolved it to a
//! [`UserIdentity`]. The policy is pluggable; [`TokenAuthenticator`] is the
//! implementation driven by the `[auth]` configuration section.

use std::path::PathBuf;

use axum::http::{header, HeaderMap};
use subtle::ConstantTimeEq;

use crate::config::AuthConfig;

/// The local account a shell runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    /// Login name, exported as `USER` and `LOGNAME`.
    pub name: String,
    /// Home directory, exported as `HOME` and used as the working directory.
    pub home: PathBuf,
}

impl UserIdentity {
    /// Creates a new identity.
    pub fn new(name: impl Into<String>, home: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            home: home.into(),
        }
    }
}

/// Pluggable credential policy.
pub trait Authenticator: Send + Sync {
    /// Returns whether the credential grants access to a shell.
    fn validate_credential(&self, token: &str) -> bool;

    /// Maps an accepted credential to the user the shell runs as.
    fn resolve_user(&self, token: &str) -> Option<UserIdentity>;
}

/// Where a credential was found on the upgrade request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    /// First entry of `Sec-WebSocket-Protocol`.
    Subprotocol,
    /// `Authorization: Bearer <token>`.
    Bearer,
    /// `?token=<token>` query parameter.
    Query,
}

/// A credential extracted from an upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub source: CredentialSource,
}

/// Extracts the client credential from the upgrade request.
///
/// Browsers cannot set arbitrary headers on a WebSocket handshake, so the
/// subprotocol header is checked first, then a bearer token, then the query.
pub fn extract_credential(headers: &HeaderMap, query_token: Option<&str>) -> Option<Credential> {
    let subprotocol = headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|token| !token.is_empty());
    if let Some(token) = subprotocol {
        return Some(Credential {
            token: token.to_string(),
            source: CredentialSource::Subprotocol,
        });
    }

    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty());
    if let Some(token) = bearer {
        return Some(Credential {
            token: token.to_string(),
            source: CredentialSource::Bearer,
        });
    }

    query_token
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| Credential {
            token: token.to_string(),
            source: CredentialSource::Query,
        })
}

/// Entry in the credential table.
#[derive(Debug, Clone)]
struct TokenGrant {
    token: Vec<u8>,
    user: UserIdentity,
}

/// Authenticator backed by a static credential table.
#[derive(Debug, Clone)]
pub struct TokenAuthenticator {
    grants: Vec<TokenGrant>,
    fallback: Option<UserIdentity>,
}

impl TokenAuthenticator {
    /// Builds the credential table from configuration.
    pub fn from_config(config: &AuthConfig) -> Self {
        let grants = config
            .tokens
            .iter()
            .map(|entry| TokenGrant {
                token: entry.token.as_bytes().to_vec(),
                user: UserIdentity::new(
                    entry.user.clone(),
                    entry
                        .home
                        .clone()
                        .unwrap_or_else(|| config.home_root.join(&entry.user)),
                ),
            })
            .collect();

        let fallback = config.allow_any_token.then(|| {
            UserIdentity::new(
                config.default_user.clone(),
                config.home_root.join(&config.default_user),
            )
        });

        Self { grants, fallback }
    }

    /// Returns the number of configured credentials.
    pub fn len(&self) -> usize {
        self.grants.len()
    }

    /// Returns true if no credential can ever be accepted.
    pub fn is_empty(&self) -> bool {
        self.grants.is_empty() && self.fallback.is_none()
    }

    /// Compares against every grant so timing does not leak which entry matched.
    fn find(&self, token: &str) -> Option<&TokenGrant> {
        let presented = token.as_bytes();
        let mut found = None;
        for grant in &self.grants {
            if bool::from(grant.token.as_slice().ct_eq(presented)) && found.is_none() {
                found = Some(grant);
            }
        }
        found
    }
}

impl Authenticator for TokenAuthenticator {
    fn validate_credential(&self, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        self.find(token).is_some() || self.fallback.is_some()
    }

    fn resolve_user(&self, token: &str) -> Option<UserIdentity> {
        if token.is_empty() {
            return None;
        }
        self.find(token)
            .map(|grant| grant.user.clone())
            .or_else(|| self.fallback.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenEntry;
    use axum::http::HeaderValue;

    fn table() -> AuthConfig {
        AuthConfig {
            tokens: vec![
                TokenEntry {
                    token: "alpha-token".to_string(),
                    user: "alice".to_string(),
                    home: None,
                },
                TokenEntry {
                    token: "bravo-token".to_string(),
                    user: "bob".to_string(),
                    home: Some(PathBuf::from("/srv/bob")),
                },
            ],
            ..AuthConfig::default()
        }
    }

    #[test]
    fn test_known_token_resolves_user() {
        let auth = TokenAuthenticator::from_config(&table());

        assert!(auth.validate_credential("alpha-token"));
        assert_eq!(
            auth.resolve_user("alpha-token"),
            Some(UserIdentity::new("alice", "/home/alice"))
        );
        assert_eq!(
            auth.resolve_user("bravo-token"),
            Some(UserIdentity::new("bob", "/srv/bob"))
        );
    }

    #[test]
    fn test_unknown_and_empty_tokens_rejected() {
        let auth = TokenAuthenticator::from_config(&table());

        assert!(!auth.validate_credential("alpha"));
        assert!(!auth.validate_credential("alpha-token-extra"));
        assert!(!auth.validate_credential(""));
        assert_eq!(auth.resolve_user("nope"), None);
    }

    #[test]
    fn test_allow_any_token_maps_to_default_user() {
        let config = AuthConfig {
            allow_any_token: true,
            default_user: "dev".to_string(),
            ..table()
        };
        let auth = TokenAuthenticator::from_config(&config);

        assert!(auth.validate_credential("whatever"));
        assert!(!auth.validate_credential(""));
        assert_eq!(
            auth.resolve_user("whatever"),
            Some(UserIdentity::new("dev", "/home/dev"))
        );
        // Table entries still win over the fallback.
        assert_eq!(auth.resolve_user("alpha-token").unwrap().name, "alice");
    }

    #[test]
    fn test_empty_table() {
        let auth = TokenAuthenticator::from_config(&AuthConfig::default());
        assert!(auth.is_empty());
        assert_eq!(auth.len(), 0);
        assert!(!auth.validate_credential("anything"));
    }

    #[test]
    fn test_extract_from_subprotocol() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("tok123, other"),
        );
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer b"));

        let credential = extract_credential(&headers, Some("q")).unwrap();
        assert_eq!(credential.token, "tok123");
        assert_eq!(credential.source, CredentialSource::Subprotocol);
    }

    #[test]
    fn test_extract_from_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer  abc "),
        );

        let credential = extract_credential(&headers, None).unwrap();
        assert_eq!(credential.token, "abc");
        assert_eq!(credential.source, CredentialSource::Bearer);
    }

    #[test]
    fn test_extract_from_query() {
        let credential = extract_credential(&HeaderMap::new(), Some("from-query")).unwrap();
        assert_eq!(credential.token, "from-query");
        assert_eq!(credential.source, CredentialSource::Query);
    }

    #[test]
    fn test_extract_none() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic xyz"));
        assert_eq!(extract_credential(&headers, Some("  ")), None);
        assert_eq!(extract_credential(&HeaderMap::new(), None), None);
    }
}
