//! Key-pair JWT credentials for the Snowflake REST API.
//!
//! Snowflake verifies a key-pair token by recomputing the issuer from the
//! public key registered on the user, so the fingerprint must be the SHA-256
//! of the DER-encoded SubjectPublicKeyInfo, base64 (standard alphabet),
//! prefixed with `SHA256:`. Any other encoding yields a token that is rejected
//! as unauthenticated.
//!
//! ```ignore
//! let principal = Principal::new("myorg-myacct", "svc_bot");
//! let signer = CredentialSigner::from_key_file(principal, "rsa_key.p8", TokenTimings::default())?;
//! let bearer = signer.current_token()?;
//! ```

use std::fmt;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::AgentConfig;
use crate::error::CredentialError;

const FINGERPRINT_PREFIX: &str = "SHA256:";

/// Three hours, the lifetime Snowflake allows for key-pair tokens.
pub const DEFAULT_TOKEN_SECS: u64 = 3 * 60 * 60;

/// Source of "now" for issuing and renewing credentials.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Account and user as Snowflake expects them in `sub`/`iss`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    account: String,
    user: String,
    qualified_name: String,
}

impl Principal {
    pub fn new(account: &str, user: &str) -> Self {
        let account = normalize_account(account);
        let user = user.trim().to_uppercase();
        let qualified_name = format!("{}.{}", account, user);
        Self {
            account,
            user,
            qualified_name,
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// `ACCOUNT.USER`
    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }
}

/// Strips region/registry suffixes from an account identifier.
///
/// Global accounts (`xy12345-abc.global`) keep the segment before the first
/// `-`; everything else keeps the segment before the first `.`.
fn normalize_account(raw: &str) -> String {
    let raw = raw.trim();
    let cut = if raw.contains(".global") {
        raw.find('-')
    } else {
        raw.find('.')
    };
    let head = match cut {
        Some(idx) if idx > 0 => &raw[..idx],
        _ => raw,
    };
    head.to_uppercase()
}

/// SHA-256 fingerprint of a public key in the form Snowflake stores it.
pub fn public_key_fingerprint(public_key: &RsaPublicKey) -> Result<String, CredentialError> {
    let der = public_key
        .to_public_key_der()
        .map_err(|e| CredentialError::PublicKey(e.to_string()))?;
    let digest = Sha256::digest(der.as_bytes());
    Ok(format!("{}{}", FINGERPRINT_PREFIX, STANDARD.encode(digest)))
}

/// A parsed private key and its fingerprint.
///
/// The signing key is re-encoded from the same parsed key the fingerprint is
/// taken from, so a token can never be signed by a key other than the one
/// its issuer names.
pub struct KeyMaterial {
    encoding_key: EncodingKey,
    fingerprint: String,
}

impl KeyMaterial {
    /// Accepts PKCS#8 (`BEGIN PRIVATE KEY`) or PKCS#1 (`BEGIN RSA PRIVATE KEY`) PEM.
    pub fn from_pem(pem: &str) -> Result<Self, CredentialError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|pkcs8_err| {
                RsaPrivateKey::from_pkcs1_pem(pem).map_err(|pkcs1_err| {
                    CredentialError::InvalidKey(format!(
                        "not a PKCS#8 ({}) or PKCS#1 ({}) RSA key",
                        pkcs8_err, pkcs1_err
                    ))
                })
            })?;

        let fingerprint = public_key_fingerprint(&RsaPublicKey::from(&private_key))?;
        let der = private_key
            .to_pkcs1_der()
            .map_err(|e| CredentialError::InvalidKey(e.to_string()))?;

        Ok(Self {
            encoding_key: EncodingKey::from_rsa_der(der.as_bytes()),
            fingerprint,
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CredentialError> {
        let path = path.as_ref();
        let pem = std::fs::read_to_string(path).map_err(|source| CredentialError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_pem(&pem)
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("encoding_key", &"[REDACTED]")
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// Payload of a key-pair token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// `ACCOUNT.USER.SHA256:<fingerprint>`
    pub iss: String,
    /// `ACCOUNT.USER`
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

/// A signed token plus the local instant after which it is replaced.
///
/// `renew_at` is independent of the token's embedded `exp`: the remote
/// verifier enforces `exp`, the signer refreshes at `renew_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub renew_at: DateTime<Utc>,
}

impl Credential {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.renew_at
    }
}

/// Token lifetime (embedded `exp`) and local renewal delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenTimings {
    pub lifetime: Duration,
    pub renewal_delay: Duration,
}

impl Default for TokenTimings {
    fn default() -> Self {
        Self {
            lifetime: Duration::from_secs(DEFAULT_TOKEN_SECS),
            renewal_delay: Duration::from_secs(DEFAULT_TOKEN_SECS),
        }
    }
}

/// Issues key-pair tokens and renews them on demand.
///
/// Shared across requests behind an `Arc`. Concurrent callers that both see
/// an expired credential will both sign; the cache only ever moves forward
/// to the newest `issued_at`, and either token is valid.
pub struct CredentialSigner {
    principal: Principal,
    key: KeyMaterial,
    lifetime: chrono::Duration,
    renewal_delay: chrono::Duration,
    clock: Arc<dyn Clock>,
    current: RwLock<Option<Credential>>,
}

impl CredentialSigner {
    pub fn new(
        principal: Principal,
        key: KeyMaterial,
        timings: TokenTimings,
    ) -> Result<Self, CredentialError> {
        let lifetime = chrono::Duration::from_std(timings.lifetime)
            .map_err(|e| CredentialError::InvalidTiming(format!("lifetime: {}", e)))?;
        let renewal_delay = chrono::Duration::from_std(timings.renewal_delay)
            .map_err(|e| CredentialError::InvalidTiming(format!("renewal delay: {}", e)))?;

        Ok(Self {
            principal,
            key,
            lifetime,
            renewal_delay,
            clock: Arc::new(SystemClock),
            current: RwLock::new(None),
        })
    }

    pub fn from_key_file(
        principal: Principal,
        path: impl AsRef<Path>,
        timings: TokenTimings,
    ) -> Result<Self, CredentialError> {
        Self::new(principal, KeyMaterial::from_file(path)?, timings)
    }

    pub fn from_config(config: &AgentConfig) -> Result<Self, CredentialError> {
        let principal = Principal::new(&config.account, &config.user);
        Self::from_key_file(principal, &config.private_key_path, config.token_timings)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn fingerprint(&self) -> &str {
        self.key.fingerprint()
    }

    pub fn issuer(&self) -> String {
        format!("{}.{}", self.principal.qualified_name(), self.key.fingerprint())
    }

    /// Returns a bearer token, signing a new one once `renew_at` is reached.
    pub fn current_token(&self) -> Result<String, CredentialError> {
        self.current_credential().map(|credential| credential.token)
    }

    pub fn current_credential(&self) -> Result<Credential, CredentialError> {
        let now = self.clock.now();
        {
            let current = self.current.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(credential) = current.as_ref().filter(|c| c.is_valid_at(now)) {
                return Ok(credential.clone());
            }
        }

        let credential = self.issue(now)?;
        self.install(credential.clone());
        Ok(credential)
    }

    /// Caches `credential` unless a newer one was installed in the meantime.
    fn install(&self, credential: Credential) {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        match current.as_ref() {
            Some(existing) if existing.issued_at > credential.issued_at => {
                debug!(
                    kept = %existing.issued_at,
                    discarded = %credential.issued_at,
                    "newer credential already cached"
                );
            }
            _ => *current = Some(credential),
        }
    }

    fn issue(&self, now: DateTime<Utc>) -> Result<Credential, CredentialError> {
        let claims = Claims {
            iss: self.issuer(),
            sub: self.principal.qualified_name().to_string(),
            iat: now.timestamp(),
            exp: (now + self.lifetime).timestamp(),
        };
        let token = encode(&Header::new(Algorithm::RS256), &claims, &self.key.encoding_key)?;
        let renew_at = now + self.renewal_delay;

        debug!(
            issuer = %claims.iss,
            iat = claims.iat,
            exp = claims.exp,
            renew_at = %renew_at,
            "issued key-pair token"
        );

        Ok(Credential {
            token,
            issued_at: now,
            renew_at,
        })
    }
}

impl fmt::Debug for CredentialSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSigner")
            .field("principal", &self.principal)
            .field("key", &self.key)
            .field("lifetime", &self.lifetime)
            .field("renewal_delay", &self.renewal_delay)
            .finish()
    }
}
