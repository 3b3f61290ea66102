use std::time::Duration;

use analysis_common::openai::OpenAiClientConfig;

use crate::error::AnalysisError;
use crate::orchestrator::OrchestratorConfig;
use crate::progressive::ProgressiveConfig;
use crate::rate_limit::RateLimitConfig;

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;

/// Application configuration loaded explicitly from environment variables.
///
/// Required:
/// - `OPENAI_API_KEY`
///
/// Optional:
/// - `OPENAI_MODEL` (default `gpt-4o-mini`) plus the `OPENAI_*` client settings
/// - `RATE_LIMIT_*` budgets and backoff
/// - `REDIS_URL` (omit to keep sessions in memory), `SESSION_TTL_SECS`
/// - `ANALYSIS_MAX_DOCUMENT_CHARS`, `QUICK_SCAN_DOCUMENTS`, `QUICK_SCAN_MAX_FINDINGS`
#[derive(Debug, Clone)]
pub struct Config {
    pub openai: OpenAiClientConfig,
    pub model: String,
    pub rate_limit: RateLimitConfig,
    pub redis_url: Option<String>,
    pub session_ttl: Duration,
    pub orchestrator: OrchestratorConfig,
    pub progressive: ProgressiveConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, AnalysisError> {
        let openai = OpenAiClientConfig::from_env();
        let settings = Settings::from_lookup(|name| std::env::var(name).ok());
        Self::assemble(openai, RateLimitConfig::from_env(), settings)
    }

    fn assemble(
        openai: OpenAiClientConfig,
        rate_limit: RateLimitConfig,
        settings: Settings,
    ) -> Result<Self, AnalysisError> {
        if openai.api_key.as_deref().map_or(true, |k| k.trim().is_empty()) {
            return Err(AnalysisError::ProviderConfig(
                "OPENAI_API_KEY environment variable is required".to_string(),
            ));
        }
        let orchestrator = OrchestratorConfig {
            max_document_chars: settings.max_document_chars,
            ..OrchestratorConfig::default()
        };
        Ok(Self {
            openai,
            model: settings.model,
            rate_limit,
            redis_url: settings.redis_url,
            session_ttl: settings.session_ttl,
            orchestrator,
            progressive: settings.progressive,
        })
    }
}

/// Settings owned by this crate rather than the client or rate limiter.
#[derive(Debug, Clone)]
struct Settings {
    model: String,
    redis_url: Option<String>,
    session_ttl: Duration,
    max_document_chars: usize,
    progressive: ProgressiveConfig,
}

impl Settings {
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let positive = |name: &str| {
            lookup(name)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|&n| n > 0)
        };
        let progressive_defaults = ProgressiveConfig::default();

        Self {
            model: lookup("OPENAI_MODEL")
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            redis_url: lookup("REDIS_URL").filter(|u| !u.trim().is_empty()),
            session_ttl: Duration::from_secs(
                positive("SESSION_TTL_SECS").unwrap_or(DEFAULT_SESSION_TTL_SECS),
            ),
            max_document_chars: positive("ANALYSIS_MAX_DOCUMENT_CHARS")
                .map(|n| n as usize)
                .unwrap_or(OrchestratorConfig::default().max_document_chars),
            progressive: ProgressiveConfig {
                quick_scan_documents: positive("QUICK_SCAN_DOCUMENTS")
                    .map(|n| n as usize)
                    .unwrap_or(progressive_defaults.quick_scan_documents),
                quick_scan_max_findings: positive("QUICK_SCAN_MAX_FINDINGS")
                    .map(|n| n as usize)
                    .unwrap_or(progressive_defaults.quick_scan_max_findings),
            },
        }
    }
}
