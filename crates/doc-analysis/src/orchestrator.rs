/// Document analysis through the provider's function-calling contract.
///
/// Per document: classify, build the prompt, call `report_findings` through the shared
/// rate limiter, decode each reported finding against the schema and verify its
/// citation quotes against the source text. A document that fails at any step
/// contributes one low-confidence "needs manual review" finding instead, so a batch
/// never aborts on a single document.
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::chunker;
use crate::classify::{classify, DocumentType};
use crate::error::AnalysisError;
use crate::llm::{estimate_tokens, parameters_schema, FunctionCall, FunctionCaller};
use crate::model::{
    new_id, now_millis, Citation, CitationLocation, DocumentChunk, Finding, FindingType,
    ParsedDocument, Priority, Question, Severity, UserContext,
};
use crate::prompt::{
    build_analysis_prompt, build_questions_prompt, truncate_chars, PromptOptions,
    ANALYSIS_PERSONA, DEFAULT_MAX_DOCUMENT_CHARS, QUESTIONS_PERSONA,
};
use crate::questions::{
    decode_questions, fallback_questions, QuestionsPayload, GENERATE_QUESTIONS_DESCRIPTION,
    GENERATE_QUESTIONS_FN,
};
use crate::rate_limit::{RateLimitManager, TaskOptions};
use crate::screen;

pub const REPORT_FINDINGS_FN: &str = "report_findings";
const REPORT_FINDINGS_DESCRIPTION: &str =
    "Report the findings a property buyer should know about in this document.";

pub const FALLBACK_CONFIDENCE: f64 = 0.3;
/// Confidence assigned when scoring is disabled or the model omitted it.
const UNSCORED_CONFIDENCE: f64 = 0.5;
const FALLBACK_EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisMode {
    QuickScan,
    Detailed,
}

#[derive(Debug, Clone)]
pub struct AnalysisOptions {
    pub mode: AnalysisMode,
    pub include_confidence: bool,
    pub generate_questions: bool,
    pub max_findings_per_document: Option<usize>,
    pub require_citations: bool,
    pub hazard_screen: bool,
    pub priority: Priority,
}

impl AnalysisOptions {
    /// Cheap first pass: no confidence scoring, no questions, capped findings.
    pub fn quick(max_findings: usize) -> Self {
        Self {
            mode: AnalysisMode::QuickScan,
            include_confidence: false,
            generate_questions: false,
            max_findings_per_document: Some(max_findings),
            require_citations: true,
            hazard_screen: false,
            priority: Priority::High,
        }
    }

    pub fn detailed() -> Self {
        Self {
            mode: AnalysisMode::Detailed,
            include_confidence: true,
            generate_questions: true,
            max_findings_per_document: None,
            require_citations: true,
            hazard_screen: true,
            priority: Priority::Medium,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_document_chars: usize,
    pub max_output_tokens: u32,
    /// Queue bound for each provider call.
    pub max_wait_time: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_document_chars: DEFAULT_MAX_DOCUMENT_CHARS,
            max_output_tokens: 2_000,
            max_wait_time: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentFailure {
    pub document_id: String,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct BatchAnalysis {
    pub findings: Vec<Finding>,
    pub questions: Vec<Question>,
    /// Documents whose analysis succeeded.
    pub analyzed: Vec<String>,
    pub failures: Vec<DocumentFailure>,
    /// First provider-wide failure seen in the batch.
    pub provider_failure: Option<AnalysisError>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct FindingsPayload {
    #[schemars(with = "Vec<RawFinding>")]
    pub findings: Vec<Value>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RawFinding {
    #[serde(rename = "type")]
    pub kind: FindingType,
    pub title: String,
    pub description: String,
    pub severity: ProviderSeverity,
    /// How clearly the document supports the finding, from 0 to 1.
    #[serde(default)]
    pub confidence: Option<f64>,
    /// Verbatim quotes supporting the finding.
    #[serde(default)]
    pub citations: Vec<RawCitation>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RawCitation {
    /// Text copied exactly from the document.
    pub quote: String,
    #[serde(default)]
    pub page: Option<u32>,
}

/// Severities the provider may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ProviderSeverity {
    Low,
    Medium,
    High,
}

impl From<ProviderSeverity> for Severity {
    fn from(s: ProviderSeverity) -> Self {
        match s {
            ProviderSeverity::Low => Severity::Low,
            ProviderSeverity::Medium => Severity::Medium,
            ProviderSeverity::High => Severity::High,
        }
    }
}

pub struct AnalysisOrchestrator {
    caller: Arc<dyn FunctionCaller>,
    limiter: RateLimitManager,
    config: OrchestratorConfig,
}

impl AnalysisOrchestrator {
    pub fn new(
        caller: Arc<dyn FunctionCaller>,
        limiter: RateLimitManager,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            caller,
            limiter,
            config,
        }
    }

    /// Analyze `documents` concurrently. Only an empty batch is an error; every other
    /// failure is absorbed into a fallback finding and reported in the result.
    pub async fn analyze_documents(
        &self,
        user_id: &str,
        documents: &[&ParsedDocument],
        context: &UserContext,
        options: &AnalysisOptions,
    ) -> Result<BatchAnalysis, AnalysisError> {
        if documents.is_empty() {
            return Err(AnalysisError::Validation(
                "no documents to analyze".to_string(),
            ));
        }

        let results = join_all(
            documents
                .iter()
                .map(|d| self.analyze_document(user_id, d, context, options)),
        )
        .await;

        let mut batch = BatchAnalysis::default();
        let mut findings = Vec::new();
        for (document, result) in documents.iter().zip(results) {
            match result {
                Ok(mut found) => {
                    batch.analyzed.push(document.id.clone());
                    findings.append(&mut found);
                }
                Err(err) => {
                    warn!(
                        document_id = %document.id,
                        error = %err,
                        "document analysis failed, using fallback finding"
                    );
                    findings.push(fallback_finding(document, classify(document), &err));
                    batch.failures.push(DocumentFailure {
                        document_id: document.id.clone(),
                        error: err.to_string(),
                    });
                    if err.is_systemic() && batch.provider_failure.is_none() {
                        batch.provider_failure = Some(err);
                    }
                }
            }
        }
        batch.findings = dedup_findings(findings);

        if options.generate_questions {
            batch.questions = self
                .generate_questions(user_id, &batch.findings, context)
                .await;
        }

        info!(
            mode = ?options.mode,
            documents = documents.len(),
            analyzed = batch.analyzed.len(),
            failed = batch.failures.len(),
            findings = batch.findings.len(),
            questions = batch.questions.len(),
            "batch analysis finished"
        );
        Ok(batch)
    }

    pub async fn analyze_document(
        &self,
        user_id: &str,
        document: &ParsedDocument,
        context: &UserContext,
        options: &AnalysisOptions,
    ) -> Result<Vec<Finding>, AnalysisError> {
        let kind = classify(document);
        let prompt_options = PromptOptions {
            max_document_chars: self.config.max_document_chars,
            max_findings: options.max_findings_per_document,
            include_confidence: options.include_confidence,
        };
        let call = FunctionCall {
            system: ANALYSIS_PERSONA.to_string(),
            prompt: build_analysis_prompt(document, kind, context, &prompt_options),
            name: REPORT_FINDINGS_FN,
            description: REPORT_FINDINGS_DESCRIPTION,
            parameters: parameters_schema::<FindingsPayload>(),
            max_tokens: Some(self.config.max_output_tokens),
        };
        debug!(document_id = %document.id, document_type = ?kind, "analyzing document");

        let arguments = self
            .limiter
            .execute_with_rate_limit(
                user_id,
                || self.caller.call_function(&call),
                TaskOptions {
                    priority: options.priority,
                    estimated_tokens: estimate_tokens(&call),
                    max_wait_time: self.config.max_wait_time,
                },
            )
            .await?;

        let chunks = chunker::chunk(document);
        let mut findings = decode_findings(&arguments, document, &chunks, options)?;
        if let Some(max) = options.max_findings_per_document {
            findings.sort_by(|a, b| b.severity.cmp(&a.severity));
            findings.truncate(max);
        }
        if options.hazard_screen {
            findings.extend(screen::screen(document, &chunks));
        }
        Ok(findings)
    }

    /// Never fails: provider errors and empty answers fall back to heuristic questions.
    pub async fn generate_questions(
        &self,
        user_id: &str,
        findings: &[Finding],
        context: &UserContext,
    ) -> Vec<Question> {
        if findings.is_empty() {
            return fallback_questions(findings);
        }
        let call = FunctionCall {
            system: QUESTIONS_PERSONA.to_string(),
            prompt: build_questions_prompt(findings, context),
            name: GENERATE_QUESTIONS_FN,
            description: GENERATE_QUESTIONS_DESCRIPTION,
            parameters: parameters_schema::<QuestionsPayload>(),
            max_tokens: Some(self.config.max_output_tokens),
        };

        let result = self
            .limiter
            .execute_with_rate_limit(
                user_id,
                || self.caller.call_function(&call),
                TaskOptions {
                    priority: Priority::Low,
                    estimated_tokens: estimate_tokens(&call),
                    max_wait_time: self.config.max_wait_time,
                },
            )
            .await
            .and_then(|arguments| decode_questions(&arguments, findings));

        match result {
            Ok(questions) if !questions.is_empty() => questions,
            Ok(_) => {
                warn!("provider returned no usable questions, using fallback set");
                fallback_questions(findings)
            }
            Err(e) => {
                warn!(error = %e, "question generation failed, using fallback set");
                fallback_questions(findings)
            }
        }
    }
}

/// Lower-cases enum fields and maps out-of-schema values the provider is known to
/// emit: `critical` severity becomes `high`, bare-string citations become quotes.
fn normalize_finding_value(item: &mut Value) {
    let Some(obj) = item.as_object_mut() else {
        return;
    };
    if let Some(kind) = obj.get("type").and_then(Value::as_str) {
        let kind = kind.trim().to_lowercase().replace([' ', '-'], "_");
        obj.insert("type".into(), Value::String(kind));
    }
    if let Some(severity) = obj.get("severity").and_then(Value::as_str) {
        let severity = match severity.trim().to_lowercase().as_str() {
            "critical" => "high".to_string(),
            other => other.to_string(),
        };
        obj.insert("severity".into(), Value::String(severity));
    }
    if let Some(Value::Array(citations)) = obj.get_mut("citations") {
        for citation in citations.iter_mut() {
            if let Some(quote) = citation.as_str().map(str::to_string) {
                *citation = serde_json::json!({ "quote": quote });
            }
        }
    }
}

pub fn decode_findings(
    arguments: &str,
    document: &ParsedDocument,
    chunks: &[DocumentChunk],
    options: &AnalysisOptions,
) -> Result<Vec<Finding>, AnalysisError> {
    let payload: FindingsPayload = serde_json::from_str(arguments).map_err(|e| {
        AnalysisError::MalformedProviderResponse(format!("{REPORT_FINDINGS_FN} arguments: {e}"))
    })?;

    let reported = payload.findings.len();
    let mut findings = Vec::new();
    for mut item in payload.findings {
        normalize_finding_value(&mut item);
        match serde_json::from_value::<RawFinding>(item) {
            Ok(raw) => findings.extend(build_finding(raw, document, chunks, options)),
            Err(e) => warn!(
                document_id = %document.id,
                error = %e,
                "dropping out-of-schema finding"
            ),
        }
    }

    if reported > 0 && findings.is_empty() {
        return Err(AnalysisError::MalformedProviderResponse(format!(
            "none of the {reported} reported findings were usable"
        )));
    }
    Ok(findings)
}

fn build_finding(
    raw: RawFinding,
    document: &ParsedDocument,
    chunks: &[DocumentChunk],
    options: &AnalysisOptions,
) -> Option<Finding> {
    let title = raw.title.trim();
    if title.is_empty() {
        warn!(document_id = %document.id, "dropping finding without a title");
        return None;
    }

    let confidence = if options.include_confidence {
        raw.confidence
            .filter(|c| c.is_finite())
            .map(|c| c.clamp(0.0, 1.0))
            .unwrap_or(UNSCORED_CONFIDENCE)
    } else {
        UNSCORED_CONFIDENCE
    };

    let citations = verify_citations(&raw.citations, document, chunks, confidence);
    if options.require_citations && citations.is_empty() {
        warn!(document_id = %document.id, title, "dropping finding without citations");
        return None;
    }

    let severity = Severity::from(raw.severity);
    Some(Finding {
        id: new_id("finding", &format!("{}:{title}", document.id)),
        kind: raw.kind,
        title: title.to_string(),
        description: raw.description.trim().to_string(),
        severity,
        confidence,
        citations,
        recommendations: raw
            .recommendations
            .iter()
            .map(|r| r.trim())
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .collect(),
        professional_advice_required: severity >= Severity::High
            || raw.kind == FindingType::RedFlag,
        created_at: now_millis(),
    })
}

/// Locate each quote in the source. Found quotes take the exact source text and its
/// location; unfound ones keep the quote with half the confidence. Repeats of the same
/// source offset or quote are dropped.
fn verify_citations(
    raw: &[RawCitation],
    document: &ParsedDocument,
    chunks: &[DocumentChunk],
    confidence: f64,
) -> Vec<Citation> {
    let mut seen_offsets = HashSet::new();
    let mut seen_quotes = HashSet::new();
    let mut citations = Vec::new();

    for citation in raw {
        let quote = citation.quote.trim();
        if quote.is_empty() {
            continue;
        }
        match chunker::locate_excerpt(&document.text, chunks, quote) {
            Some(found) => {
                if !seen_offsets.insert(found.offset) {
                    continue;
                }
                citations.push(Citation {
                    document_id: document.id.clone(),
                    document_name: document.filename.clone(),
                    location: CitationLocation {
                        page: Some(found.page),
                        line: Some(found.line),
                        section: found.section,
                    },
                    excerpt: document.text[found.offset..found.offset + quote.len()].to_string(),
                    confidence,
                    context: found.context,
                });
            }
            None => {
                if !seen_quotes.insert(quote.to_lowercase()) {
                    continue;
                }
                debug!(document_id = %document.id, quote, "citation not found in source text");
                citations.push(Citation {
                    document_id: document.id.clone(),
                    document_name: document.filename.clone(),
                    location: CitationLocation {
                        page: citation.page,
                        line: None,
                        section: None,
                    },
                    excerpt: quote.to_string(),
                    confidence: confidence / 2.0,
                    context: String::new(),
                });
            }
        }
    }
    citations
}

/// Case-insensitive `(title, type)` de-duplication; the first occurrence wins.
pub fn dedup_findings(findings: Vec<Finding>) -> Vec<Finding> {
    let mut seen = HashSet::new();
    findings
        .into_iter()
        .filter(|f| seen.insert(f.dedup_key()))
        .collect()
}

/// The single finding recorded for a document whose analysis failed. It cites the
/// opening of the document so it stays attached to that document.
pub fn fallback_finding(
    document: &ParsedDocument,
    kind: DocumentType,
    error: &AnalysisError,
) -> Finding {
    let opening = document
        .text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(|l| truncate_chars(l, FALLBACK_EXCERPT_CHARS).0.to_string())
        .unwrap_or_else(|| document.filename.clone());

    Finding {
        id: new_id("finding", &format!("{}:fallback", document.id)),
        kind: FindingType::Concern,
        title: format!("{} needs manual review", document.filename),
        description: format!(
            "Automated analysis of this {} could not be completed ({error}). \
Review it manually or ask your solicitor to check it.",
            kind.label()
        ),
        severity: Severity::Medium,
        confidence: FALLBACK_CONFIDENCE,
        citations: vec![Citation {
            document_id: document.id.clone(),
            document_name: document.filename.clone(),
            location: CitationLocation {
                page: Some(1),
                line: Some(1),
                section: None,
            },
            excerpt: opening,
            confidence: FALLBACK_CONFIDENCE,
            context: String::new(),
        }],
        recommendations: vec![format!(
            "Ask your solicitor to review {}",
            document.filename
        )],
        professional_advice_required: true,
        created_at: now_millis(),
    }
}
