//! OS Login directory service

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use et_core::traits::DirectoryService;
use et_core::{CredentialSource, DirectoryError, IdentityRef, LoginProfile};

use crate::auth::TokenSource;
use crate::http::{self, ApiError};

/// OS Login API root
pub const OSLOGIN_BASE_URL: &str = "https://oslogin.googleapis.com/v1";

/// OAuth token introspection endpoint, used to find who a token belongs to
pub const TOKENINFO_URL: &str = "https://oauth2.googleapis.com/tokeninfo";

impl From<ApiError> for DirectoryError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Request(msg) => DirectoryError::Request(msg),
            ApiError::Status { status, body } => DirectoryError::Status { status, body },
            ApiError::Decode(msg) => DirectoryError::InvalidResponse(msg),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImportSshPublicKeyResponse {
    login_profile: Option<LoginProfile>,
}

#[derive(Debug, Deserialize)]
struct TokenInfo {
    email: Option<String>,
}

/// Directory backed by the Google OS Login API
pub struct OsLoginDirectory {
    client: Client,
    tokens: TokenSource,
    project: Option<String>,
    base_url: String,
    tokeninfo_url: String,
}

impl OsLoginDirectory {
    /// Create a directory client.
    ///
    /// `project` is sent as `projectId` on key imports so the key becomes
    /// usable on that project's instances. A service account key named by
    /// `credentials` is read here.
    pub fn new(credentials: CredentialSource, project: Option<String>) -> Result<Self, DirectoryError> {
        Ok(Self {
            client: http::client()?,
            tokens: TokenSource::new(credentials)?,
            project,
            base_url: OSLOGIN_BASE_URL.to_string(),
            tokeninfo_url: TOKENINFO_URL.to_string(),
        })
    }

    /// Talk to a different API root
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Use a different token introspection endpoint
    pub fn with_tokeninfo_url(mut self, url: impl Into<String>) -> Self {
        self.tokeninfo_url = url.into();
        self
    }

    async fn token(&self) -> Result<String, DirectoryError> {
        self.tokens.token(&self.client).await
    }
}

#[async_trait]
impl DirectoryService for OsLoginDirectory {
    async fn current_identity(&self) -> Result<IdentityRef, DirectoryError> {
        if let Some(email) = self.tokens.service_account_email() {
            tracing::debug!("Using service account {}", email);
            return Ok(IdentityRef::new(email));
        }

        let token = self.token().await?;
        let info: TokenInfo = http::send_json(
            self.client
                .get(&self.tokeninfo_url)
                .query(&[("access_token", token.as_str())]),
        )
        .await?;

        let email = info.email.filter(|e| !e.is_empty()).ok_or_else(|| {
            DirectoryError::InvalidResponse(
                "token has no email; grant the userinfo.email scope or set an account".to_string(),
            )
        })?;
        tracing::debug!("Access token belongs to {}", email);
        Ok(IdentityRef::new(email))
    }

    async fn import_key(
        &self,
        identity: &IdentityRef,
        public_key: &str,
    ) -> Result<LoginProfile, DirectoryError> {
        let url = format!("{}/users/{}:importSshPublicKey", self.base_url, identity);
        let mut request = self
            .client
            .post(url)
            .bearer_auth(self.token().await?)
            .json(&json!({ "key": public_key }));
        if let Some(project) = &self.project {
            request = request.query(&[("projectId", project.as_str())]);
        }

        let response: ImportSshPublicKeyResponse = http::send_json(request).await?;
        response.login_profile.ok_or_else(|| {
            DirectoryError::InvalidResponse("import returned no login profile".to_string())
        })
    }

    async fn delete_key(
        &self,
        identity: &IdentityRef,
        fingerprint: &str,
    ) -> Result<(), DirectoryError> {
        let url = format!(
            "{}/users/{}/sshPublicKeys/{}",
            self.base_url, identity, fingerprint
        );
        http::send(self.client.delete(url).bearer_auth(self.token().await?)).await?;
        Ok(())
    }
}
