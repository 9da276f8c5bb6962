//! Shared HTTP plumbing

use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;

/// Per-request timeout for API calls
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Failure of one API call, before it is mapped to a caller's error type
#[derive(Debug)]
pub(crate) enum ApiError {
    Request(String),
    Status { status: u16, body: String },
    Decode(String),
}

pub(crate) fn client() -> Result<Client, ApiError> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(concat!("ephemeral-tunnel/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ApiError::Request(format!("Failed to create HTTP client: {}", e)))
}

/// Send `request` and return the response if it succeeded
pub(crate) async fn send(request: RequestBuilder) -> Result<Response, ApiError> {
    let response = request
        .send()
        .await
        .map_err(|e| ApiError::Request(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ApiError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

/// Send `request` and decode a JSON body
pub(crate) async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, ApiError> {
    let response = send(request).await?;
    response
        .json::<T>()
        .await
        .map_err(|e| ApiError::Decode(e.to_string()))
}
