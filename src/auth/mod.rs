//! Credentials, nonce generation and request signing.
//!
//! A [`Credential`] pairs an access key with its secret and owns the nonce
//! counter for that key. The [`Signer`] turns a credential plus the outgoing
//! target into the authentication header set attached to every request.

mod keystore;

pub use keystore::{KeyStore, KeyStoreError, StoredKey};

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use hmac::{Hmac, Mac};
use http::header::{HeaderMap, HeaderName, HeaderValue, InvalidHeaderName};
use sha2::Sha256;
use thiserror::Error;

use crate::pipeline::builder::QueryParams;

type HmacSha256 = Hmac<Sha256>;

/// Default header carrying the request nonce.
pub const DEFAULT_NONCE_HEADER: &str = "x-nonce";
/// Default header carrying the access key.
pub const DEFAULT_API_KEY_HEADER: &str = "x-api-key";
/// Default header carrying the request signature.
pub const DEFAULT_SIGNATURE_HEADER: &str = "x-signature";

/// Failures raised while producing authentication headers.
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("unusable signing key: {0}")]
    Key(String),
    #[error("authentication header '{0}' has an invalid value")]
    InvalidHeader(HeaderName),
}

/// Single-use value attached to a signed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Nonce(u64);

impl Nonce {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl From<u64> for Nonce {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Strictly increasing nonce generator seeded from the wall clock.
///
/// Values are microseconds since the Unix epoch. When two calls land in the
/// same microsecond (or the clock steps backwards) the counter advances by one
/// instead, so every value handed out is larger than the previous one.
#[derive(Debug, Default)]
pub struct NonceSource {
    last: AtomicU64,
}

impl NonceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> Nonce {
        let now = now_micros();
        let mut current = self.last.load(Ordering::Acquire);
        loop {
            let candidate = now.max(current.saturating_add(1));
            match self.last.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Nonce(candidate),
                Err(actual) => current = actual,
            }
        }
    }

    /// Last nonce issued, if any.
    pub fn last(&self) -> Option<Nonce> {
        match self.last.load(Ordering::Acquire) {
            0 => None,
            value => Some(Nonce(value)),
        }
    }
}

fn now_micros() -> u64 {
    Utc::now().timestamp_micros().max(0) as u64
}

/// Access key and secret used to sign requests.
///
/// Clones share the same [`NonceSource`], so nonces stay unique for the key no
/// matter how many request instances hold it.
#[derive(Clone)]
pub struct Credential {
    access_key: String,
    secret: Arc<[u8]>,
    nonces: Arc<NonceSource>,
}

impl Credential {
    pub fn new(access_key: impl Into<String>, secret: impl AsRef<[u8]>) -> Self {
        Self {
            access_key: access_key.into(),
            secret: Arc::from(secret.as_ref()),
            nonces: Arc::new(NonceSource::new()),
        }
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }

    pub fn next_nonce(&self) -> Nonce {
        self.nonces.next()
    }

    pub fn nonce_source(&self) -> &NonceSource {
        &self.nonces
    }

    /// HMAC-SHA256 (lowercase hex) over [`canonical_message`].
    pub fn signature(
        &self,
        target: &str,
        nonce: Nonce,
        query: &QueryParams,
    ) -> Result<String, SigningError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|err| SigningError::Key(err.to_string()))?;
        mac.update(canonical_message(target, nonce, query).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_key", &self.access_key)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Message covered by the signature: `nonce + target + sorted query`.
///
/// Parameters are ordered by name so the signature does not depend on the
/// order the caller supplied them in.
pub fn canonical_message(target: &str, nonce: Nonce, query: &QueryParams) -> String {
    format!("{nonce}{target}{}", query.to_canonical_string())
}

/// Header names used for the authentication triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthHeaderNames {
    pub nonce: HeaderName,
    pub api_key: HeaderName,
    pub signature: HeaderName,
}

impl AuthHeaderNames {
    pub fn new(nonce: &str, api_key: &str, signature: &str) -> Result<Self, InvalidHeaderName> {
        Ok(Self {
            nonce: HeaderName::from_bytes(nonce.as_bytes())?,
            api_key: HeaderName::from_bytes(api_key.as_bytes())?,
            signature: HeaderName::from_bytes(signature.as_bytes())?,
        })
    }

    pub fn contains(&self, name: &HeaderName) -> bool {
        *name == self.nonce || *name == self.api_key || *name == self.signature
    }
}

impl Default for AuthHeaderNames {
    fn default() -> Self {
        Self {
            nonce: HeaderName::from_static(DEFAULT_NONCE_HEADER),
            api_key: HeaderName::from_static(DEFAULT_API_KEY_HEADER),
            signature: HeaderName::from_static(DEFAULT_SIGNATURE_HEADER),
        }
    }
}

/// Authentication headers produced for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthHeaders {
    nonce: Nonce,
    signature: String,
    headers: HeaderMap,
}

impl AuthHeaders {
    pub fn nonce(&self) -> Nonce {
        self.nonce
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// Produces nonces and signatures for outgoing requests.
#[derive(Debug, Clone, Default)]
pub struct Signer {
    names: AuthHeaderNames,
}

impl Signer {
    pub fn new(names: AuthHeaderNames) -> Self {
        Self { names }
    }

    pub fn header_names(&self) -> &AuthHeaderNames {
        &self.names
    }

    /// Draws a fresh nonce from the credential and signs with it.
    pub fn authenticate(
        &self,
        credential: &Credential,
        target: &str,
        query: &QueryParams,
    ) -> Result<AuthHeaders, SigningError> {
        self.sign(credential, target, credential.next_nonce(), query)
    }

    pub fn sign(
        &self,
        credential: &Credential,
        target: &str,
        nonce: Nonce,
        query: &QueryParams,
    ) -> Result<AuthHeaders, SigningError> {
        let signature = credential.signature(target, nonce, query)?;

        let mut headers = HeaderMap::with_capacity(3);
        headers.insert(self.names.nonce.clone(), header_value(&self.names.nonce, &nonce.to_string())?);
        headers.insert(
            self.names.api_key.clone(),
            header_value(&self.names.api_key, credential.access_key())?,
        );
        headers.insert(
            self.names.signature.clone(),
            header_value(&self.names.signature, &signature)?,
        );

        Ok(AuthHeaders {
            nonce,
            signature,
            headers,
        })
    }
}

fn header_value(name: &HeaderName, value: &str) -> Result<HeaderValue, SigningError> {
    HeaderValue::from_str(value).map_err(|_| SigningError::InvalidHeader(name.clone()))
}
