//! Provider failures and their retry classification.

use std::time::Duration;

use thiserror::Error;

/// What the provider told us about a failed call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub http_status: Option<u16>,
    /// Provider error code from the response envelope, e.g. "rate_limit_exceeded".
    pub provider_code: Option<String>,
    /// `x-request-id` response header.
    pub request_id: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_response(status: u16, request_id: Option<String>) -> Self {
        Self {
            http_status: Some(status),
            provider_code: None,
            request_id,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.provider_code = Some(code.into());
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} rate limited the call; retry in {}s", retry_after.as_secs())]
    RateLimited {
        provider: String,
        retry_after: Duration,
        context: Option<ErrorContext>,
    },

    #[error("request rejected: {message}")]
    InvalidRequest {
        message: String,
        context: Option<ErrorContext>,
    },

    /// The model answered with a refusal instead of content.
    #[error("model declined: {message}")]
    Refused { message: String },

    #[error("{provider}: {message}")]
    Provider {
        provider: String,
        message: String,
        retryable: bool,
        context: Option<ErrorContext>,
    },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("gateway misconfigured: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn rate_limited(
        provider: impl Into<String>,
        retry_after: Duration,
        context: ErrorContext,
    ) -> Self {
        Self::RateLimited {
            provider: provider.into(),
            retry_after,
            context: Some(context),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            context: None,
        }
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self::Refused {
            message: message.into(),
        }
    }

    pub fn provider(
        provider: impl Into<String>,
        message: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            retryable,
            context: None,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Attaches `ctx` to variants that carry one; others are returned as is.
    pub fn with_context(mut self, ctx: ErrorContext) -> Self {
        match &mut self {
            Self::RateLimited { context, .. }
            | Self::InvalidRequest { context, .. }
            | Self::Provider { context, .. } => *context = Some(ctx),
            Self::Refused { .. } | Self::Http(_) | Self::Config(_) => {}
        }
        self
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Provider { retryable, .. } => *retryable,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::InvalidRequest { .. } | Self::Refused { .. } | Self::Config(_) => false,
        }
    }

    /// Stable label for usage records and log fields.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Refused { .. } => "refused",
            Self::Provider { .. } => "provider_error",
            Self::Http(e) if e.is_timeout() => "timeout",
            Self::Http(_) => "http_error",
            Self::Config(_) => "config_error",
        }
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::RateLimited { context, .. }
            | Self::InvalidRequest { context, .. }
            | Self::Provider { context, .. } => context.as_ref(),
            Self::Refused { .. } | Self::Http(_) | Self::Config(_) => None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.context()?.request_id.as_deref()
    }
}
