use std::time::Duration;

use analysis_common::error::CommonError;
use analysis_common::openai::OpenAiClientError;

use crate::model::SessionStatus;

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Common(#[from] CommonError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("provider configuration error: {0}")]
    ProviderConfig(String),

    #[error("rate limited by provider{}", fmt_retry(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    #[error("provider overloaded: {0}")]
    ServiceOverloaded(String),

    #[error("provider request timed out")]
    RequestTimeout,

    #[error("malformed provider response: {0}")]
    MalformedProviderResponse(String),

    #[error("task waited {waited_ms}ms in the rate-limit queue without being dispatched")]
    QueueTimeout { waited_ms: u64 },

    #[error("invalid session transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("provider error: {0}")]
    Provider(String),
}

fn fmt_retry(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!("; retry in ~{}ms", d.as_millis()),
        None => String::new(),
    }
}

impl AnalysisError {
    /// Provider-wide failures that would hit every document in a batch, as opposed to
    /// a bad response for one document.
    pub fn is_systemic(&self) -> bool {
        matches!(
            self,
            AnalysisError::ProviderConfig(_)
                | AnalysisError::RateLimited { .. }
                | AnalysisError::ServiceOverloaded(_)
                | AnalysisError::RequestTimeout
                | AnalysisError::QueueTimeout { .. }
        )
    }

    pub fn suggestion(&self) -> Option<String> {
        match self {
            AnalysisError::ProviderConfig(_) => {
                Some("check OPENAI_API_KEY and OPENAI_BASE_URL".to_string())
            }
            AnalysisError::RateLimited { retry_after } => Some(match retry_after {
                Some(d) => format!("retry after {}s", d.as_secs().max(1)),
                None => "retry in a minute".to_string(),
            }),
            AnalysisError::ServiceOverloaded(_) => {
                Some("the provider is overloaded; retry in a few minutes".to_string())
            }
            AnalysisError::RequestTimeout => {
                Some("analyse fewer or smaller documents per request".to_string())
            }
            AnalysisError::QueueTimeout { .. } => Some(
                "the request queue is busy; retry later or raise the wait limit".to_string(),
            ),
            _ => None,
        }
    }
}

impl From<OpenAiClientError> for AnalysisError {
    fn from(err: OpenAiClientError) -> Self {
        if err.is_timeout() {
            return AnalysisError::RequestTimeout;
        }
        match err {
            OpenAiClientError::MissingApiKey => {
                AnalysisError::ProviderConfig("OPENAI_API_KEY is not configured".to_string())
            }
            OpenAiClientError::RateLimited { retry_after, .. } => {
                AnalysisError::RateLimited { retry_after }
            }
            OpenAiClientError::InvalidJson(e) => {
                AnalysisError::MalformedProviderResponse(e.to_string())
            }
            other => match other.status() {
                Some(s) if s.as_u16() == 401 || s.as_u16() == 403 => {
                    AnalysisError::ProviderConfig(other.to_string())
                }
                Some(s) if s.as_u16() == 408 || s.as_u16() == 504 => AnalysisError::RequestTimeout,
                Some(s) if s.is_server_error() => {
                    AnalysisError::ServiceOverloaded(other.to_string())
                }
                _ => AnalysisError::Provider(other.to_string()),
            },
        }
    }
}
