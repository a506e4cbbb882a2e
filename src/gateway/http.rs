//! reqwest plumbing shared by the chat and embedding clients.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};

/// Response bodies above this size are rejected unread.
pub(crate) const MAX_RESPONSE_BYTES: usize = 1 << 20;

const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(60);

/// A JSON client with bearer auth and gzip. Optional headers whose value is
/// `None` or not a valid header value are skipped.
pub(crate) fn json_client(
    api_key: &str,
    timeout: Duration,
    optional_headers: &[(&'static str, Option<&str>)],
) -> Result<reqwest::Client, ProviderError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    let bearer = HeaderValue::from_str(&format!("Bearer {api_key}"))
        .map_err(|_| ProviderError::config("API key contains characters not allowed in a header"))?;
    headers.insert(AUTHORIZATION, bearer);

    for (name, value) in optional_headers {
        let Some(value) = value else { continue };
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(HeaderName::from_static(*name), value);
        }
    }

    reqwest::Client::builder()
        .timeout(timeout)
        .default_headers(headers)
        .gzip(true)
        .build()
        .map_err(|e| ProviderError::config(format!("cannot build HTTP client: {e}")))
}

/// A 2xx reply, body already read.
pub(crate) struct Reply {
    pub body: String,
    pub context: ErrorContext,
}

/// POSTs `payload` as JSON. Non-2xx statuses become classified errors.
pub(crate) async fn post_json<T: Serialize + ?Sized>(
    client: &reqwest::Client,
    provider: &str,
    url: &str,
    payload: &T,
) -> Result<Reply, ProviderError> {
    let mut response = client.post(url).json(payload).send().await?;
    let status = response.status().as_u16();
    let request_id = response
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let context = ErrorContext::from_response(status, request_id);

    let mut bytes = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if bytes.len() + chunk.len() > MAX_RESPONSE_BYTES {
            return Err(ProviderError::provider(
                provider,
                format!("response exceeds {MAX_RESPONSE_BYTES} bytes"),
                false,
            )
            .with_context(context));
        }
        bytes.extend_from_slice(&chunk);
    }
    let body = String::from_utf8_lossy(&bytes).into_owned();

    if !(200..300).contains(&status) {
        return Err(classify_status(provider, status, &body, context));
    }
    Ok(Reply { body, context })
}

/// The `error` object OpenAI-compatible APIs put in failure bodies.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ApiError {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub code: Option<serde_json::Value>,
}

impl ApiError {
    fn code_string(&self) -> Option<String> {
        match self.code.as_ref()? {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<ApiError>,
}

/// 429 is a rate limit, client errors are never retried, 5xx is retryable.
pub(crate) fn classify_status(
    provider: &str,
    status: u16,
    body: &str,
    mut context: ErrorContext,
) -> ProviderError {
    let api_error = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.error);
    let message = match &api_error {
        Some(e) => {
            context.provider_code = e.code_string();
            e.message.clone().unwrap_or_else(|| format!("HTTP {status}"))
        }
        None => format!("HTTP {status}"),
    };

    match status {
        429 => ProviderError::rate_limited(provider, RATE_LIMIT_BACKOFF, context),
        400..=499 => ProviderError::invalid_request(message).with_context(context),
        _ => ProviderError::provider(provider, message, status >= 500).with_context(context),
    }
}
