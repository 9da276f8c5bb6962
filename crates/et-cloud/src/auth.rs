//! Access tokens for Google APIs
//!
//! An explicit token is used as is. Otherwise a service account key file
//! mints tokens through the JWT bearer grant, cached until shortly before
//! they expire. Without either, the token comes from the environment.

use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use et_core::{CredentialSource, DirectoryError};

use crate::http;

/// Scope requested for minted tokens
pub const TOKEN_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Token endpoint used when the key file names none
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Lifetime requested for the signed assertion
const ASSERTION_LIFETIME: Duration = Duration::from_secs(3600);

/// Refresh this long before the token expires
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// The parts of a service account JSON key that token minting needs
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    /// Service account identity, also the OS Login user
    pub client_email: String,
    private_key: String,
    #[serde(default)]
    private_key_id: Option<String>,
    /// OAuth token endpoint
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key_id", &self.private_key_id)
            .field("token_uri", &self.token_uri)
            .finish()
    }
}

/// Claims of the JWT bearer assertion
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct AssertionClaims {
    pub iss: String,
    pub scope: String,
    pub aud: String,
    pub iat: u64,
    pub exp: u64,
}

impl ServiceAccountKey {
    /// Read a key file downloaded from the cloud console
    pub fn from_file(path: &Path) -> Result<Self, DirectoryError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DirectoryError::Credentials(format!("Failed to read {:?}: {}", path, e))
        })?;
        Self::from_json(&content)
            .map_err(|e| DirectoryError::Credentials(format!("{:?}: {}", path, e)))
    }

    /// Parse the JSON form of a key
    pub fn from_json(content: &str) -> Result<Self, DirectoryError> {
        serde_json::from_str(content).map_err(|e| {
            DirectoryError::Credentials(format!("invalid service account key: {}", e))
        })
    }

    /// Sign an assertion for the token endpoint, issued at `now` (unix seconds)
    pub(crate) fn assertion(&self, now: u64) -> Result<String, DirectoryError> {
        let claims = AssertionClaims {
            iss: self.client_email.clone(),
            scope: TOKEN_SCOPE.to_string(),
            aud: self.token_uri.clone(),
            iat: now,
            exp: now + ASSERTION_LIFETIME.as_secs(),
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.private_key_id.clone();
        let key = EncodingKey::from_rsa_pem(self.private_key.as_bytes()).map_err(|e| {
            DirectoryError::Credentials(format!("invalid service account private key: {}", e))
        })?;

        encode(&header, &claims, &key)
            .map_err(|e| DirectoryError::Credentials(format!("Failed to sign assertion: {}", e)))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    token: String,
    refresh_at: Instant,
}

/// Supplies bearer tokens for API calls
pub struct TokenSource {
    credentials: CredentialSource,
    service_account: Option<ServiceAccountKey>,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenSource {
    /// Load the service account key, if the credentials name one
    pub fn new(credentials: CredentialSource) -> Result<Self, DirectoryError> {
        let service_account = credentials
            .service_account_file()
            .map(ServiceAccountKey::from_file)
            .transpose()?;

        Ok(Self {
            credentials,
            service_account,
            cached: Mutex::new(None),
        })
    }

    /// Identity of the service account, when tokens are minted from one
    pub fn service_account_email(&self) -> Option<&str> {
        self.service_account
            .as_ref()
            .map(|key| key.client_email.as_str())
    }

    /// A bearer token, minting a fresh one when the cached token is stale
    pub async fn token(&self, client: &Client) -> Result<String, DirectoryError> {
        let account = match (&self.credentials.access_token, &self.service_account) {
            (None, Some(account)) => account,
            _ => return self.credentials.access_token(),
        };

        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| Instant::now() < t.refresh_at) {
            return Ok(token.token.clone());
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let assertion = account.assertion(now)?;

        let response: TokenResponse = http::send_json(client.post(&account.token_uri).form(&[
            ("grant_type", JWT_BEARER_GRANT),
            ("assertion", assertion.as_str()),
        ]))
        .await?;

        let lifetime = response
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(ASSERTION_LIFETIME);
        tracing::debug!(
            "Minted access token for {} (valid {:?})",
            account.client_email,
            lifetime
        );

        *cached = Some(CachedToken {
            token: response.access_token.clone(),
            refresh_at: Instant::now() + lifetime.saturating_sub(REFRESH_MARGIN),
        });
        Ok(response.access_token)
    }
}
