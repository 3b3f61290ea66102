use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::AnalysisError;

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DocumentQuality {
    /// Extraction confidence in `[0, 1]`.
    pub confidence: f64,
    pub tier: QualityTier,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    #[serde(default)]
    pub is_digital: bool,
    #[serde(default, rename = "hasOCR")]
    pub has_ocr: bool,
    #[serde(default)]
    pub extraction_method: String,
    #[serde(default)]
    pub sections: Vec<String>,
}

/// Output of the external text-extraction step. Immutable once received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ParsedDocument {
    pub id: String,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    pub text: String,
    pub quality: DocumentQuality,
    #[serde(default)]
    pub metadata: DocumentMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DocumentChunk {
    pub id: String,
    pub document_id: String,
    pub content: String,
    /// Byte offsets into the parent document text.
    pub start_offset: usize,
    pub end_offset: usize,
    pub page_number: u32,
    pub line_number: u32,
    pub section_title: Option<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CitationLocation {
    pub page: Option<u32>,
    pub line: Option<u32>,
    pub section: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    pub document_id: String,
    pub document_name: String,
    pub location: CitationLocation,
    pub excerpt: String,
    pub confidence: f64,
    pub context: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FindingType {
    Positive,
    Concern,
    Risk,
    RedFlag,
}

impl FindingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingType::Positive => "positive",
            FindingType::Concern => "concern",
            FindingType::Risk => "risk",
            FindingType::RedFlag => "red_flag",
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: FindingType,
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub confidence: f64,
    pub citations: Vec<Citation>,
    pub recommendations: Vec<String>,
    pub professional_advice_required: bool,
    /// Unix epoch milliseconds.
    pub created_at: u64,
}

impl Finding {
    /// Case-insensitive `(title, type)` identity used for de-duplication.
    pub fn dedup_key(&self) -> (String, FindingType) {
        (self.title.trim().to_lowercase(), self.kind)
    }

    pub fn cited_document_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::new();
        for citation in &self.citations {
            if !ids.contains(&citation.document_id.as_str()) {
                ids.push(citation.document_id.as_str());
            }
        }
        ids
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct RiskBreakdown {
    pub low: usize,
    pub medium: usize,
    pub high: usize,
    pub critical: usize,
}

impl RiskBreakdown {
    pub fn record(&mut self, severity: Severity) {
        match severity {
            Severity::Low => self.low += 1,
            Severity::Medium => self.medium += 1,
            Severity::High => self.high += 1,
            Severity::Critical => self.critical += 1,
        }
    }
}

/// Always derived from the current findings; never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisSummary {
    pub overall_risk: Severity,
    pub key_findings: Vec<String>,
    pub documents_analyzed: usize,
    pub completeness: f64,
    pub recommended_actions: Vec<String>,
    pub executive_summary: String,
    pub risk_breakdown: RiskBreakdown,
    pub positive_aspects: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum QuestionCategory {
    Legal,
    Structural,
    Financial,
    Environmental,
    Other,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub id: String,
    pub category: QuestionCategory,
    pub question: String,
    pub priority: Priority,
    pub context: String,
    pub related_findings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Created,
    Partial,
    Complete,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Complete | SessionStatus::Failed)
    }

    /// `created -> partial -> {complete | failed}`. Direct `created -> failed` covers a
    /// quick scan that could not start.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (SessionStatus::Created, SessionStatus::Partial)
                | (SessionStatus::Created, SessionStatus::Failed)
                | (SessionStatus::Partial, SessionStatus::Complete)
                | (SessionStatus::Partial, SessionStatus::Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisPhase {
    QuickScan,
    Detailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisSession {
    pub session_id: String,
    pub user_id: String,
    pub document_ids: Vec<String>,
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub questions: Vec<Question>,
    pub status: SessionStatus,
    /// Percentage of documents analyzed, `0..=100`.
    pub progress: u8,
    pub phase: AnalysisPhase,
    pub error: Option<String>,
    pub updated_at: u64,
}

impl AnalysisSession {
    pub fn new(session_id: &str, user_id: &str, document_ids: Vec<String>) -> Self {
        Self {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            document_ids,
            findings: Vec::new(),
            questions: Vec::new(),
            status: SessionStatus::Created,
            progress: 0,
            phase: AnalysisPhase::QuickScan,
            error: None,
            updated_at: now_millis(),
        }
    }

    pub fn transition(&mut self, next: SessionStatus) -> Result<(), AnalysisError> {
        if !self.status.can_transition_to(next) {
            return Err(AnalysisError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now_millis();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RiskTolerance {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TimelineUrgency {
    Flexible,
    #[default]
    Standard,
    Urgent,
}

/// Buyer context injected into every analysis prompt.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct UserContext {
    pub risk_tolerance: RiskTolerance,
    pub timeline: TimelineUrgency,
    pub first_time_buyer: bool,
    pub has_solicitor: bool,
    pub has_surveyor: bool,
    pub notes: Option<String>,
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}

/// Short unique identifier: `{prefix}-{16 hex chars}`.
pub fn new_id(prefix: &str, seed: &str) -> String {
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut h = Sha256::new();
    h.update(seed.as_bytes());
    h.update(now_millis().to_le_bytes());
    h.update(std::process::id().to_le_bytes());
    h.update(counter.to_le_bytes());
    let digest = h.finalize();
    let hex: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("{prefix}-{hex}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_are_monotonic() {
        let mut session = AnalysisSession::new("s1", "u1", vec!["d1".to_string()]);
        session.transition(SessionStatus::Partial).unwrap();
        session.transition(SessionStatus::Complete).unwrap();

        let err = session.transition(SessionStatus::Partial).unwrap_err();
        assert!(matches!(
            err,
            AnalysisError::InvalidTransition {
                from: SessionStatus::Complete,
                to: SessionStatus::Partial
            }
        ));
        assert!(session.transition(SessionStatus::Failed).is_err());
        assert_eq!(session.status, SessionStatus::Complete);
    }

    #[test]
    fn failed_is_terminal() {
        assert!(SessionStatus::Failed.is_terminal());
        assert!(!SessionStatus::Failed.can_transition_to(SessionStatus::Partial));
        assert!(!SessionStatus::Failed.can_transition_to(SessionStatus::Complete));
        assert!(SessionStatus::Partial.can_transition_to(SessionStatus::Failed));
    }

    #[test]
    fn finding_wire_format_uses_type_and_snake_case() {
        let finding = Finding {
            id: "f1".to_string(),
            kind: FindingType::RedFlag,
            title: "Knotweed".to_string(),
            description: String::new(),
            severity: Severity::Critical,
            confidence: 0.9,
            citations: vec![],
            recommendations: vec![],
            professional_advice_required: true,
            created_at: 0,
        };
        let value = serde_json::to_value(&finding).unwrap();
        assert_eq!(value["type"], "red_flag");
        assert_eq!(value["severity"], "critical");
        assert_eq!(value["professionalAdviceRequired"], true);
    }

    #[test]
    fn ids_are_unique_and_prefixed() {
        let a = new_id("finding", "same");
        let b = new_id("finding", "same");
        assert_ne!(a, b);
        assert!(a.starts_with("finding-"));
        assert_eq!(a.len(), "finding-".len() + 16);
    }
}
