//! Shared plumbing for the JSON web APIs the chat commands call.

use serde::Serialize;
use serde::de::DeserializeOwned;

#[derive(Debug)]
pub enum ApiError {
    Http(String),
    Api(String),
    Parse(String),
    Empty,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Http(e) => write!(f, "HTTP error: {e}"),
            ApiError::Api(e) => write!(f, "API error: {e}"),
            ApiError::Parse(e) => write!(f, "Parse error: {e}"),
            ApiError::Empty => write!(f, "Empty response"),
        }
    }
}

impl std::error::Error for ApiError {}

/// Send `body` as JSON. Non-2xx responses become `ApiError::Api` with the body text.
pub async fn post<B: Serialize + ?Sized>(
    request: reqwest::RequestBuilder,
    body: &B,
) -> Result<reqwest::Response, ApiError> {
    let response = request
        .header("accept", "application/json")
        .json(body)
        .send()
        .await
        .map_err(|e| ApiError::Http(e.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(ApiError::Api(format!("{status}: {body}")));
    }
    Ok(response)
}

/// `post`, then decode the response body.
pub async fn post_json<B: Serialize + ?Sized, R: DeserializeOwned>(
    request: reqwest::RequestBuilder,
    body: &B,
) -> Result<R, ApiError> {
    post(request, body)
        .await?
        .json()
        .await
        .map_err(|e| ApiError::Parse(e.to_string()))
}
