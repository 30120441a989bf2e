#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Validation of the federated identity tokens that CI runs present to the
//! ingress endpoint.
//!
//! Tokens are compact JWTs signed by the identity provider with a rotating
//! RSA key set. [`Validator::validate`] verifies the signature against the
//! cached key set and enforces the claim subset the system cares about;
//! [`inspect`] decodes a token without any verification so failed
//! authentications can be logged with useful context.

mod keys;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;

pub use self::keys::KeysError;

/// Issuer of GitHub Actions workload identity tokens.
pub const GITHUB_OIDC_ISSUER: &str = "https://token.actions.githubusercontent.com";

const CLOCK_SKEW_LEEWAY_SECS: u64 = 60;
const RSA_ALGORITHMS: &[Algorithm] = &[Algorithm::RS256, Algorithm::RS384, Algorithm::RS512];

/// Validates bearer tokens against the configured audience and repository
/// owner.
pub struct Validator {
    audience: String,
    allowed_owner: String,
    dev_mode: bool,
    keys: keys::KeyCache,
}

/// The claims the system consumes after validation.
///
/// `repository` is carried for diagnostics only; authorization is decided on
/// `repository_owner`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub repository_owner: String,
    #[serde(default)]
    pub repository: String,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("unsupported signing algorithm {0:?}")]
    UnsupportedAlgorithm(Algorithm),

    #[error("token header missing kid")]
    MissingKid,

    #[error("key {0:?} not found in key set")]
    UnknownKid(String),

    #[error("token signature verification failed")]
    BadSignature,

    #[error("bad claim: {0}")]
    BadClaim(&'static str),

    #[error("repository owner {owner:?} does not match allowed owner {allowed:?}")]
    ForbiddenOwner { owner: String, allowed: String },

    #[error(transparent)]
    Keys(#[from] KeysError),
}

impl Validator {
    pub fn new(audience: String, allowed_owner: String, dev_mode: bool) -> Self {
        let jwks_url = format!("{GITHUB_OIDC_ISSUER}/.well-known/jwks");
        Self {
            audience,
            allowed_owner,
            dev_mode,
            keys: keys::KeyCache::new(jwks_url),
        }
    }

    /// Overrides the key set URL (for tests).
    pub fn with_jwks_url(mut self, url: String) -> Self {
        self.keys = keys::KeyCache::new(url);
        self
    }

    #[cfg(test)]
    fn with_key_cache(mut self, keys: keys::KeyCache) -> Self {
        self.keys = keys;
        self
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    pub fn allowed_owner(&self) -> &str {
        &self.allowed_owner
    }

    pub fn dev_mode(&self) -> bool {
        self.dev_mode
    }

    /// Validates `token` and returns its claims.
    ///
    /// In dev mode the signature, expiry, audience, and issuer checks are all
    /// skipped; the repository-owner check is enforced unconditionally.
    pub async fn validate(&self, token: &str) -> Result<Claims, TokenError> {
        let claims = if self.dev_mode {
            decode_unverified(token)?
        } else {
            self.decode_verified(token).await?
        };

        if !claims
            .repository_owner
            .eq_ignore_ascii_case(&self.allowed_owner)
        {
            return Err(TokenError::ForbiddenOwner {
                owner: claims.repository_owner,
                allowed: self.allowed_owner.clone(),
            });
        }

        Ok(claims)
    }

    async fn decode_verified(&self, token: &str) -> Result<Claims, TokenError> {
        let header =
            jsonwebtoken::decode_header(token).map_err(|e| TokenError::Malformed(e.to_string()))?;
        if !RSA_ALGORITHMS.contains(&header.alg) {
            return Err(TokenError::UnsupportedAlgorithm(header.alg));
        }
        let kid = match header.kid {
            Some(kid) if !kid.is_empty() => kid,
            _ => return Err(TokenError::MissingKid),
        };

        let key = self.resolve_key(&kid).await?;

        let mut validation = Validation::new(header.alg);
        validation.set_audience(&[&self.audience]);
        validation.set_issuer(&[GITHUB_OIDC_ISSUER]);
        validation.set_required_spec_claims(&["exp"]);
        validation.validate_nbf = true;
        validation.leeway = CLOCK_SKEW_LEEWAY_SECS;

        let data = jsonwebtoken::decode::<Claims>(token, &key, &validation)
            .map_err(classify_decode_error)?;
        Ok(data.claims)
    }

    async fn resolve_key(&self, kid: &str) -> Result<DecodingKey, TokenError> {
        let keys = self.keys.get().await?;
        if let Some(key) = keys.get(kid) {
            return Ok(key.clone());
        }

        // The provider may have rotated keys since the last fetch; refresh
        // once before giving up on the kid.
        self.keys.invalidate();
        let keys = self.keys.get().await?;
        keys.get(kid)
            .cloned()
            .ok_or_else(|| TokenError::UnknownKid(kid.to_string()))
    }
}

fn classify_decode_error(error: jsonwebtoken::errors::Error) -> TokenError {
    use jsonwebtoken::errors::ErrorKind;
    match error.kind() {
        ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => TokenError::BadSignature,
        ErrorKind::ExpiredSignature | ErrorKind::MissingRequiredClaim(_) => {
            TokenError::BadClaim("exp")
        }
        ErrorKind::InvalidAudience => TokenError::BadClaim("aud"),
        ErrorKind::InvalidIssuer => TokenError::BadClaim("iss"),
        ErrorKind::ImmatureSignature => TokenError::BadClaim("nbf"),
        _ => TokenError::Malformed(error.to_string()),
    }
}

/// Decodes claims from the token payload without verifying anything beyond
/// the compact-JWT shape.
fn decode_unverified(token: &str) -> Result<Claims, TokenError> {
    jsonwebtoken::decode_header(token).map_err(|e| TokenError::Malformed(e.to_string()))?;
    decode_claims_segment(token)
}

fn decode_claims_segment<T: serde::de::DeserializeOwned>(token: &str) -> Result<T, TokenError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(TokenError::Malformed(
            "token is not a compact JWT".to_string(),
        ));
    }
    let bytes = URL_SAFE_NO_PAD
        .decode(parts[1])
        .map_err(|e| TokenError::Malformed(format!("claims segment: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| TokenError::Malformed(format!("claims segment: {e}")))
}

/// Unverified, safe-to-log token metadata.
///
/// Produced by [`inspect`] for diagnostics on failed authentications; never
/// an input to authorization decisions.
#[derive(Debug, Default)]
pub struct TokenInspection {
    pub header_alg: Option<String>,
    pub header_kid: Option<String>,
    pub issuer: Option<String>,
    pub audience: Vec<String>,
    pub repository_owner: Option<String>,
    pub repository: Option<String>,
    pub parse_error: Option<String>,
}

#[derive(Default, Deserialize)]
struct RawClaims {
    #[serde(default)]
    iss: Option<String>,
    #[serde(default)]
    aud: Option<serde_json::Value>,
    #[serde(default)]
    repository_owner: Option<String>,
    #[serde(default)]
    repository: Option<String>,
}

/// Parses a token's header and claims without signature verification and
/// without claim enforcement.
pub fn inspect(token: &str) -> TokenInspection {
    let header = match jsonwebtoken::decode_header(token) {
        Ok(header) => header,
        Err(error) => {
            return TokenInspection {
                parse_error: Some(error.to_string()),
                ..TokenInspection::default()
            }
        }
    };
    let claims: RawClaims = match decode_claims_segment(token) {
        Ok(claims) => claims,
        Err(error) => {
            return TokenInspection {
                parse_error: Some(error.to_string()),
                ..TokenInspection::default()
            }
        }
    };

    let audience = match claims.aud {
        Some(serde_json::Value::String(aud)) => vec![aud],
        Some(serde_json::Value::Array(entries)) => entries
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    };

    TokenInspection {
        header_alg: Some(format!("{:?}", header.alg)),
        header_kid: header.kid,
        issuer: claims.iss,
        audience,
        repository_owner: claims.repository_owner,
        repository: claims.repository,
        parse_error: None,
    }
}

#[cfg(test)]
mod tests;
