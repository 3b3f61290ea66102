/// Session-scoped persistence for documents, chunks, findings and session state.
///
/// Backed by any [`KvStore`]. Values are JSON-encoded.
///
/// Key schema (namespaced per session):
/// - `doc_analysis:v1:{session}:documents` holds `Vec<ParsedDocument>` in upload order
/// - `doc_analysis:v1:{session}:chunks:{document_id}` holds `Vec<DocumentChunk>`
/// - `doc_analysis:v1:{session}:findings` holds `Vec<Finding>`, every finding once
/// - `doc_analysis:v1:{session}:results:{document_id}` holds `Vec<Finding>` citing that document
/// - `doc_analysis:v1:{session}:session` holds `AnalysisSession`
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use analysis_common::error::CommonError;
use analysis_common::kv::KvStore;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::chunker;
use crate::error::AnalysisError;
use crate::model::{
    AnalysisSession, AnalysisSummary, DocumentChunk, Finding, FindingType, ParsedDocument,
    QualityTier, RiskBreakdown, Severity,
};

const KEY_PREFIX: &str = "doc_analysis:v1:";
const KEY_FINDINGS_LIMIT: usize = 5;
const RECOMMENDED_ACTIONS_LIMIT: usize = 8;
const SNIPPET_RADIUS: usize = 60;

/// Findings grouped by type. Positive and red-flag buckets are ordered by confidence,
/// concern and risk buckets by severity (both descending).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GroupedResults {
    pub positive: Vec<Finding>,
    pub concern: Vec<Finding>,
    pub risk: Vec<Finding>,
    pub red_flag: Vec<Finding>,
}

impl GroupedResults {
    pub fn total(&self) -> usize {
        self.positive.len() + self.concern.len() + self.risk.len() + self.red_flag.len()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TierCounts {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FindingTypeCounts {
    pub positive: usize,
    pub concern: usize,
    pub risk: usize,
    pub red_flag: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DocumentStats {
    pub total_documents: usize,
    pub total_chunks: usize,
    pub total_characters: usize,
    pub average_confidence: f64,
    pub quality_tiers: TierCounts,
    pub findings: FindingTypeCounts,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub document_id: String,
    pub document_name: String,
    pub chunk_id: String,
    /// Byte offset of the match in the document text.
    pub offset: usize,
    pub page: u32,
    pub line: u32,
    pub section: Option<String>,
    pub snippet: String,
}

#[derive(Clone)]
pub struct ResultStore {
    kv: Arc<dyn KvStore>,
    session_id: String,
}

impl ResultStore {
    pub fn new(kv: Arc<dyn KvStore>, session_id: &str) -> Self {
        Self {
            kv,
            session_id: session_id.to_string(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    // --- Documents ---

    /// Store (or replace) a document and its chunks. Returns the chunks.
    pub async fn store_document(
        &self,
        document: &ParsedDocument,
    ) -> Result<Vec<DocumentChunk>, AnalysisError> {
        if document.id.trim().is_empty() {
            return Err(AnalysisError::Validation("document id must not be empty".to_string()));
        }
        let chunks = chunker::chunk(document);
        self.write_json(&self.key(&format!("chunks:{}", document.id)), &chunks)
            .await?;

        let mut documents = self.get_all_documents().await?;
        match documents.iter_mut().find(|d| d.id == document.id) {
            Some(existing) => *existing = document.clone(),
            None => documents.push(document.clone()),
        }
        self.write_json(&self.key("documents"), &documents).await?;
        debug!(
            session_id = %self.session_id,
            document_id = %document.id,
            chunks = chunks.len(),
            "document stored"
        );
        Ok(chunks)
    }

    pub async fn get_document(&self, id: &str) -> Result<Option<ParsedDocument>, AnalysisError> {
        Ok(self
            .get_all_documents()
            .await?
            .into_iter()
            .find(|d| d.id == id))
    }

    pub async fn get_all_documents(&self) -> Result<Vec<ParsedDocument>, AnalysisError> {
        Ok(self
            .read_json::<Vec<ParsedDocument>>(&self.key("documents"))
            .await?
            .unwrap_or_default())
    }

    pub async fn get_chunks(&self, document_id: &str) -> Result<Vec<DocumentChunk>, AnalysisError> {
        Ok(self
            .read_json::<Vec<DocumentChunk>>(&self.key(&format!("chunks:{document_id}")))
            .await?
            .unwrap_or_default())
    }

    /// Delete every document, chunk, finding and the session record.
    pub async fn clear_documents(&self) -> Result<(), AnalysisError> {
        let documents = self.get_all_documents().await?;
        for document in &documents {
            self.delete(&self.key(&format!("chunks:{}", document.id))).await?;
            self.delete(&self.key(&format!("results:{}", document.id))).await?;
        }
        self.delete(&self.key("findings")).await?;
        self.delete(&self.key("documents")).await?;
        self.delete(&self.key("session")).await?;
        debug!(session_id = %self.session_id, documents = documents.len(), "session cleared");
        Ok(())
    }

    // --- Findings ---

    /// Upsert a finding by id and index it under every document it cites.
    pub async fn store_analysis_result(&self, finding: &Finding) -> Result<(), AnalysisError> {
        let known: HashSet<String> = self
            .get_all_documents()
            .await?
            .into_iter()
            .map(|d| d.id)
            .collect();
        for id in finding.cited_document_ids() {
            if !known.contains(id) {
                return Err(AnalysisError::Validation(format!(
                    "finding {} cites document {id} which is not part of session {}",
                    finding.id, self.session_id
                )));
            }
        }

        let mut findings = self.all_findings().await?;
        let previous = findings.iter().position(|f| f.id == finding.id);
        let stale_docs: Vec<String> = match previous {
            Some(i) => findings[i]
                .cited_document_ids()
                .into_iter()
                .filter(|id| !finding.cited_document_ids().contains(id))
                .map(str::to_string)
                .collect(),
            None => Vec::new(),
        };
        match previous {
            Some(i) => findings[i] = finding.clone(),
            None => findings.push(finding.clone()),
        }
        self.write_json(&self.key("findings"), &findings).await?;

        for doc_id in stale_docs {
            let mut results = self.get_document_results(&doc_id).await?;
            results.retain(|f| f.id != finding.id);
            self.write_json(&self.key(&format!("results:{doc_id}")), &results)
                .await?;
        }
        for doc_id in finding.cited_document_ids() {
            let mut results = self.get_document_results(doc_id).await?;
            match results.iter_mut().find(|f| f.id == finding.id) {
                Some(existing) => *existing = finding.clone(),
                None => results.push(finding.clone()),
            }
            self.write_json(&self.key(&format!("results:{doc_id}")), &results)
                .await?;
        }
        Ok(())
    }

    /// Store `findings` in place of every stored finding.
    ///
    /// The new sets are built before anything is written. The `findings` key is
    /// overwritten first in a single write, then each per-document list, then lists
    /// of documents left without findings are deleted. Nothing is deleted up front,
    /// so readers never observe an empty set. If the sequence is interrupted, the
    /// `findings` key already differs from the previous set; see
    /// [`ResultStore::restore_analysis_results`].
    pub async fn replace_analysis_results(&self, findings: &[Finding]) -> Result<(), AnalysisError> {
        let documents = self.get_all_documents().await?;
        let known: HashSet<&str> = documents.iter().map(|d| d.id.as_str()).collect();

        let mut merged: Vec<Finding> = Vec::with_capacity(findings.len());
        for finding in findings {
            if let Some(id) = finding
                .cited_document_ids()
                .into_iter()
                .find(|id| !known.contains(id))
            {
                return Err(AnalysisError::Validation(format!(
                    "finding {} cites document {id} which is not part of session {}",
                    finding.id, self.session_id
                )));
            }
            match merged.iter_mut().find(|f| f.id == finding.id) {
                Some(existing) => *existing = finding.clone(),
                None => merged.push(finding.clone()),
            }
        }

        let mut per_document: HashMap<&str, Vec<&Finding>> = HashMap::new();
        for finding in &merged {
            for id in finding.cited_document_ids() {
                per_document.entry(id).or_default().push(finding);
            }
        }

        self.write_json(&self.key("findings"), &merged).await?;
        for document in &documents {
            let key = self.key(&format!("results:{}", document.id));
            match per_document.get(document.id.as_str()) {
                Some(results) => self.write_json(&key, results).await?,
                None => self.delete(&key).await?,
            }
        }
        debug!(
            session_id = %self.session_id,
            findings = merged.len(),
            "analysis results replaced"
        );
        Ok(())
    }

    /// Re-store `findings` if the stored set differs from it, e.g. after an interrupted
    /// [`ResultStore::replace_analysis_results`]. Returns whether anything was written.
    pub async fn restore_analysis_results(&self, findings: &[Finding]) -> Result<bool, AnalysisError> {
        if self.all_findings().await? == findings {
            return Ok(false);
        }
        warn!(
            session_id = %self.session_id,
            findings = findings.len(),
            "stored findings diverged from session, restoring"
        );
        self.replace_analysis_results(findings).await?;
        Ok(true)
    }

    pub async fn get_analysis_results(&self) -> Result<GroupedResults, AnalysisError> {
        Ok(group_findings(self.all_findings().await?))
    }

    pub async fn get_document_results(&self, document_id: &str) -> Result<Vec<Finding>, AnalysisError> {
        Ok(self
            .read_json::<Vec<Finding>>(&self.key(&format!("results:{document_id}")))
            .await?
            .unwrap_or_default())
    }

    pub async fn all_findings(&self) -> Result<Vec<Finding>, AnalysisError> {
        Ok(self
            .read_json::<Vec<Finding>>(&self.key("findings"))
            .await?
            .unwrap_or_default())
    }

    // --- Aggregation ---

    pub async fn get_document_stats(&self) -> Result<DocumentStats, AnalysisError> {
        let documents = self.get_all_documents().await?;
        let mut stats = DocumentStats {
            total_documents: documents.len(),
            ..DocumentStats::default()
        };
        for document in &documents {
            stats.total_chunks += self.get_chunks(&document.id).await?.len();
            stats.total_characters += document.text.chars().count();
            stats.average_confidence += document.quality.confidence;
            match document.quality.tier {
                QualityTier::High => stats.quality_tiers.high += 1,
                QualityTier::Medium => stats.quality_tiers.medium += 1,
                QualityTier::Low => stats.quality_tiers.low += 1,
            }
        }
        if !documents.is_empty() {
            stats.average_confidence /= documents.len() as f64;
        }
        for finding in self.all_findings().await? {
            match finding.kind {
                FindingType::Positive => stats.findings.positive += 1,
                FindingType::Concern => stats.findings.concern += 1,
                FindingType::Risk => stats.findings.risk += 1,
                FindingType::RedFlag => stats.findings.red_flag += 1,
            }
        }
        Ok(stats)
    }

    pub async fn summary(&self) -> Result<AnalysisSummary, AnalysisError> {
        let total = self.get_all_documents().await?.len();
        Ok(summarize(&self.all_findings().await?, total))
    }

    /// Naive case-insensitive substring search over stored chunks. Matches repeated by
    /// chunk overlap collapse onto their document offset; the first one found is kept.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, AnalysisError> {
        let needle = query.trim().to_ascii_lowercase();
        if needle.is_empty() {
            return Err(AnalysisError::Validation("search query must not be empty".to_string()));
        }

        let mut seen: HashSet<(String, usize)> = HashSet::new();
        let mut hits = Vec::new();
        if limit == 0 {
            return Ok(hits);
        }
        'documents: for document in self.get_all_documents().await? {
            for chunk in self.get_chunks(&document.id).await? {
                let haystack = chunk.content.to_ascii_lowercase();
                for (idx, _) in haystack.match_indices(&needle) {
                    let offset = chunk.start_offset + idx;
                    if !seen.insert((document.id.clone(), offset)) {
                        continue;
                    }
                    let line =
                        chunk.line_number + chunk.content[..idx].matches('\n').count() as u32;
                    hits.push(SearchHit {
                        document_id: document.id.clone(),
                        document_name: document.filename.clone(),
                        chunk_id: chunk.id.clone(),
                        offset,
                        page: chunk.page_number,
                        line,
                        section: chunk.section_title.clone(),
                        snippet: snippet(&chunk.content, idx, needle.len()),
                    });
                    if hits.len() >= limit {
                        break 'documents;
                    }
                }
            }
        }
        Ok(hits)
    }

    // --- Session ---

    pub async fn save_session(&self, session: &AnalysisSession) -> Result<(), AnalysisError> {
        self.write_json(&self.key("session"), session).await
    }

    pub async fn load_session(&self) -> Result<Option<AnalysisSession>, AnalysisError> {
        self.read_json(&self.key("session")).await
    }

    // --- Helpers ---

    fn key(&self, suffix: &str) -> String {
        format!("{KEY_PREFIX}{}:{suffix}", self.session_id)
    }

    async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, AnalysisError> {
        let Some(raw) = self.kv.get(key).await? else {
            return Ok(None);
        };
        let value = serde_json::from_str(&raw)
            .inspect_err(|e| warn!(error = %e, key, "stored value failed to decode"))
            .map_err(CommonError::from)?;
        Ok(Some(value))
    }

    async fn write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), AnalysisError> {
        let raw = serde_json::to_string(value).map_err(CommonError::from)?;
        self.kv.set(key, &raw).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AnalysisError> {
        self.kv.delete(key).await?;
        Ok(())
    }
}

pub fn group_findings(findings: Vec<Finding>) -> GroupedResults {
    let mut grouped = GroupedResults::default();
    for finding in findings {
        match finding.kind {
            FindingType::Positive => grouped.positive.push(finding),
            FindingType::Concern => grouped.concern.push(finding),
            FindingType::Risk => grouped.risk.push(finding),
            FindingType::RedFlag => grouped.red_flag.push(finding),
        }
    }
    let by_confidence = |a: &Finding, b: &Finding| b.confidence.total_cmp(&a.confidence);
    let by_severity = |a: &Finding, b: &Finding| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| b.confidence.total_cmp(&a.confidence))
    };
    grouped.positive.sort_by(by_confidence);
    grouped.red_flag.sort_by(by_confidence);
    grouped.concern.sort_by(by_severity);
    grouped.risk.sort_by(by_severity);
    grouped
}

/// Derive the summary from the current findings.
pub fn summarize(findings: &[Finding], total_documents: usize) -> AnalysisSummary {
    let mut risk_breakdown = RiskBreakdown::default();
    for finding in findings {
        risk_breakdown.record(finding.severity);
    }

    let mut issues: Vec<&Finding> = findings
        .iter()
        .filter(|f| f.kind != FindingType::Positive)
        .collect();
    issues.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| b.confidence.total_cmp(&a.confidence))
    });
    let overall_risk = issues.first().map(|f| f.severity).unwrap_or(Severity::Low);

    let mut positives: Vec<&Finding> = findings
        .iter()
        .filter(|f| f.kind == FindingType::Positive)
        .collect();
    positives.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut analyzed: Vec<&str> = Vec::new();
    for finding in findings {
        for id in finding.cited_document_ids() {
            if !analyzed.contains(&id) {
                analyzed.push(id);
            }
        }
    }
    let completeness = if total_documents == 0 {
        0.0
    } else {
        (analyzed.len() as f64 / total_documents as f64).min(1.0)
    };

    let mut recommended_actions: Vec<String> = Vec::new();
    if issues.iter().any(|f| f.professional_advice_required) {
        recommended_actions
            .push("Discuss the flagged issues with your solicitor or surveyor before exchange".to_string());
    }
    for rec in issues.iter().flat_map(|f| f.recommendations.iter()) {
        if recommended_actions.len() >= RECOMMENDED_ACTIONS_LIMIT {
            break;
        }
        if !recommended_actions.iter().any(|r| r.eq_ignore_ascii_case(rec)) {
            recommended_actions.push(rec.clone());
        }
    }

    let count = |kind: FindingType| findings.iter().filter(|f| f.kind == kind).count();
    let executive_summary = if findings.is_empty() {
        format!("No findings yet across {total_documents} documents.")
    } else {
        format!(
            "{} findings across {} of {} documents: {} red flags, {} risks, {} concerns and {} positive points. Overall risk is {}.",
            findings.len(),
            analyzed.len(),
            total_documents,
            count(FindingType::RedFlag),
            count(FindingType::Risk),
            count(FindingType::Concern),
            count(FindingType::Positive),
            severity_label(overall_risk),
        )
    };

    AnalysisSummary {
        overall_risk,
        key_findings: issues
            .iter()
            .take(KEY_FINDINGS_LIMIT)
            .map(|f| f.title.clone())
            .collect(),
        documents_analyzed: analyzed.len(),
        completeness,
        recommended_actions,
        executive_summary,
        risk_breakdown,
        positive_aspects: positives.iter().map(|f| f.title.clone()).collect(),
    }
}

fn severity_label(severity: Severity) -> &'static str {
    match severity {
        Severity::Low => "low",
        Severity::Medium => "medium",
        Severity::High => "high",
        Severity::Critical => "critical",
    }
}

fn snippet(content: &str, idx: usize, len: usize) -> String {
    let mut from = idx.saturating_sub(SNIPPET_RADIUS);
    while from > 0 && !content.is_char_boundary(from) {
        from -= 1;
    }
    let mut to = (idx + len + SNIPPET_RADIUS).min(content.len());
    while to < content.len() && !content.is_char_boundary(to) {
        to += 1;
    }
    content[from..to].split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{
        Citation, CitationLocation, DocumentMetadata, DocumentQuality, QualityTier,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    use analysis_common::kv::MemoryStore;
    use async_trait::async_trait;

    pub(crate) fn document(id: &str, filename: &str, text: &str) -> ParsedDocument {
        ParsedDocument {
            id: id.to_string(),
            filename: filename.to_string(),
            mime_type: "application/pdf".to_string(),
            size: text.len() as u64,
            text: text.to_string(),
            quality: DocumentQuality {
                confidence: 0.9,
                tier: QualityTier::High,
                issues: vec![],
                recommendations: vec![],
            },
            metadata: DocumentMetadata::default(),
        }
    }

    pub(crate) fn finding(
        id: &str,
        kind: FindingType,
        severity: Severity,
        confidence: f64,
        docs: &[&str],
    ) -> Finding {
        Finding {
            id: id.to_string(),
            kind,
            title: format!("Finding {id}"),
            description: "description".to_string(),
            severity,
            confidence,
            citations: docs
                .iter()
                .map(|d| Citation {
                    document_id: d.to_string(),
                    document_name: format!("{d}.pdf"),
                    location: CitationLocation::default(),
                    excerpt: "excerpt".to_string(),
                    confidence,
                    context: String::new(),
                })
                .collect(),
            recommendations: vec![format!("Act on {id}")],
            professional_advice_required: false,
            created_at: 0,
        }
    }

    async fn store_with_docs(ids: &[&str]) -> ResultStore {
        let store = ResultStore::new(Arc::new(MemoryStore::default()), "session-1");
        for id in ids {
            store
                .store_document(&document(id, &format!("{id}.pdf"), "Some text about the property."))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn documents_round_trip_in_upload_order() {
        let store = store_with_docs(&["b", "a"]).await;
        let docs = store.get_all_documents().await.unwrap();
        assert_eq!(docs.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(), ["b", "a"]);
        assert_eq!(store.get_document("a").await.unwrap().unwrap().filename, "a.pdf");
        assert!(store.get_document("zzz").await.unwrap().is_none());
        assert_eq!(store.get_chunks("a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stored_finding_is_returned_once_in_its_bucket_and_per_document() {
        let store = store_with_docs(&["d1", "d2"]).await;
        let f = finding("f1", FindingType::Risk, Severity::High, 0.8, &["d1", "d2"]);
        store.store_analysis_result(&f).await.unwrap();
        store.store_analysis_result(&f).await.unwrap();

        let grouped = store.get_analysis_results().await.unwrap();
        assert_eq!(grouped.total(), 1);
        assert_eq!(grouped.risk, vec![f.clone()]);
        assert_eq!(store.get_document_results("d1").await.unwrap(), vec![f.clone()]);
        assert_eq!(store.get_document_results("d2").await.unwrap(), vec![f]);
    }

    #[tokio::test]
    async fn upsert_moves_finding_between_documents() {
        let store = store_with_docs(&["d1", "d2"]).await;
        store
            .store_analysis_result(&finding("f1", FindingType::Concern, Severity::Low, 0.5, &["d1"]))
            .await
            .unwrap();
        let mut updated = finding("f1", FindingType::Concern, Severity::Medium, 0.5, &["d2"]);
        updated.title = "Updated".to_string();
        store.store_analysis_result(&updated).await.unwrap();

        assert!(store.get_document_results("d1").await.unwrap().is_empty());
        assert_eq!(store.get_document_results("d2").await.unwrap()[0].title, "Updated");
        assert_eq!(store.all_findings().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn findings_citing_foreign_documents_are_rejected() {
        let store = store_with_docs(&["d1"]).await;
        let err = store
            .store_analysis_result(&finding("f1", FindingType::Risk, Severity::High, 0.8, &["other"]))
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Validation(_)));
        assert!(store.all_findings().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn buckets_are_sorted() {
        let store = store_with_docs(&["d1"]).await;
        for f in [
            finding("p1", FindingType::Positive, Severity::Low, 0.4, &["d1"]),
            finding("p2", FindingType::Positive, Severity::Low, 0.9, &["d1"]),
            finding("c1", FindingType::Concern, Severity::Low, 0.9, &["d1"]),
            finding("c2", FindingType::Concern, Severity::High, 0.2, &["d1"]),
            finding("r1", FindingType::RedFlag, Severity::Critical, 0.3, &["d1"]),
            finding("r2", FindingType::RedFlag, Severity::High, 0.95, &["d1"]),
        ] {
            store.store_analysis_result(&f).await.unwrap();
        }
        let grouped = store.get_analysis_results().await.unwrap();
        let ids = |v: &[Finding]| v.iter().map(|f| f.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&grouped.positive), ["p2", "p1"]);
        assert_eq!(ids(&grouped.concern), ["c2", "c1"]);
        assert_eq!(ids(&grouped.red_flag), ["r2", "r1"]);
        assert!(grouped.risk.is_empty());
    }

    #[tokio::test]
    async fn replace_discards_previous_findings() {
        let store = store_with_docs(&["d1", "d2"]).await;
        store
            .store_analysis_result(&finding("old", FindingType::Risk, Severity::High, 0.8, &["d1"]))
            .await
            .unwrap();
        store
            .replace_analysis_results(&[finding("new", FindingType::Concern, Severity::Low, 0.6, &["d2"])])
            .await
            .unwrap();
        let all = store.all_findings().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "new");
        assert!(store.get_document_results("d1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stats_and_summary_are_derived() {
        let store = store_with_docs(&["d1", "d2", "d3"]).await;
        let mut red = finding("r1", FindingType::RedFlag, Severity::Critical, 0.9, &["d1"]);
        red.professional_advice_required = true;
        store.store_analysis_result(&red).await.unwrap();
        store
            .store_analysis_result(&finding("p1", FindingType::Positive, Severity::Low, 0.7, &["d2"]))
            .await
            .unwrap();

        let stats = store.get_document_stats().await.unwrap();
        assert_eq!(stats.total_documents, 3);
        assert_eq!(stats.total_chunks, 3);
        assert_eq!(stats.quality_tiers.high, 3);
        assert_eq!(stats.findings.red_flag, 1);
        assert_eq!(stats.findings.positive, 1);
        assert!((stats.average_confidence - 0.9).abs() < 1e-9);

        let summary = store.summary().await.unwrap();
        assert_eq!(summary.overall_risk, Severity::Critical);
        assert_eq!(summary.key_findings, ["Finding r1"]);
        assert_eq!(summary.positive_aspects, ["Finding p1"]);
        assert_eq!(summary.documents_analyzed, 2);
        assert!((summary.completeness - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(summary.risk_breakdown.critical, 1);
        assert_eq!(summary.risk_breakdown.low, 1);
        assert!(summary.recommended_actions[0].contains("solicitor"));
        assert!(summary.recommended_actions.contains(&"Act on r1".to_string()));
    }

    #[tokio::test]
    async fn search_collapses_overlap_duplicates() {
        let store = ResultStore::new(Arc::new(MemoryStore::default()), "s");
        let mut text = String::new();
        for i in 0..40 {
            text.push_str(&format!("Paragraph {i} mentions the boundary wall once.\n"));
        }
        store.store_document(&document("d1", "title.pdf", &text)).await.unwrap();
        assert!(store.get_chunks("d1").await.unwrap().len() > 1);

        let hits = store.search("BOUNDARY WALL", 100).await.unwrap();
        assert_eq!(hits.len(), 40);
        let mut offsets: Vec<usize> = hits.iter().map(|h| h.offset).collect();
        offsets.dedup();
        assert_eq!(offsets.len(), 40);
        assert_eq!(hits[0].line, 1);
        assert!(hits[0].snippet.contains("boundary wall"));

        assert_eq!(store.search("boundary", 3).await.unwrap().len(), 3);
        assert!(store.search("boundary", 0).await.unwrap().is_empty());
        assert!(matches!(
            store.search("  ", 3).await,
            Err(AnalysisError::Validation(_))
        ));
    }

    /// Fails the `n`th GET (1-based) the way a dropped Redis connection would.
    struct FailingGetStore {
        inner: MemoryStore,
        fail_on: usize,
        gets: AtomicUsize,
    }

    #[async_trait]
    impl KvStore for FailingGetStore {
        async fn get(&self, key: &str) -> Result<Option<String>, CommonError> {
            if self.gets.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
                return Err(CommonError::RedisUnavailable);
            }
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<(), CommonError> {
            self.inner.set(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<(), CommonError> {
            self.inner.delete(key).await
        }

        fn backend(&self) -> &'static str {
            "failing"
        }
    }

    #[tokio::test]
    async fn backend_read_failure_is_an_error_not_an_empty_session() {
        // store_document reads the document list once per call
        let kv = Arc::new(FailingGetStore {
            inner: MemoryStore::default(),
            fail_on: 3,
            gets: AtomicUsize::new(0),
        });
        let store = ResultStore::new(kv.clone(), "s");
        store.store_document(&document("d1", "d1.pdf", "one")).await.unwrap();
        store.store_document(&document("d2", "d2.pdf", "two")).await.unwrap();

        let err = store
            .store_document(&document("d3", "d3.pdf", "three"))
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Common(CommonError::RedisUnavailable)));

        let ids: Vec<String> = store
            .get_all_documents()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, ["d1", "d2"]);
    }

    #[tokio::test]
    async fn replace_rejects_foreign_citations_without_touching_stored_results() {
        let store = store_with_docs(&["d1"]).await;
        let kept = finding("kept", FindingType::Risk, Severity::High, 0.8, &["d1"]);
        store.store_analysis_result(&kept).await.unwrap();

        let err = store
            .replace_analysis_results(&[finding("x", FindingType::Risk, Severity::Low, 0.5, &["nope"])])
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Validation(_)));
        assert_eq!(store.all_findings().await.unwrap(), vec![kept.clone()]);
        assert_eq!(store.get_document_results("d1").await.unwrap(), vec![kept]);
    }

    #[tokio::test]
    async fn restore_only_writes_when_findings_diverge() {
        let store = store_with_docs(&["d1", "d2"]).await;
        let quick = vec![finding("q1", FindingType::Concern, Severity::Medium, 0.6, &["d1"])];
        store.replace_analysis_results(&quick).await.unwrap();
        assert!(!store.restore_analysis_results(&quick).await.unwrap());

        store
            .replace_analysis_results(&[finding("d", FindingType::Risk, Severity::High, 0.8, &["d2"])])
            .await
            .unwrap();
        assert!(store.restore_analysis_results(&quick).await.unwrap());
        assert_eq!(store.all_findings().await.unwrap(), quick);
        assert_eq!(store.get_document_results("d1").await.unwrap(), quick);
        assert!(store.get_document_results("d2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sessions_are_isolated_and_clearable() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::default());
        let a = ResultStore::new(kv.clone(), "a");
        let b = ResultStore::new(kv.clone(), "b");
        a.store_document(&document("d1", "x.pdf", "text")).await.unwrap();
        assert!(b.get_all_documents().await.unwrap().is_empty());

        let session = AnalysisSession::new("a", "user", vec!["d1".to_string()]);
        a.save_session(&session).await.unwrap();
        assert_eq!(a.load_session().await.unwrap(), Some(session));

        a.clear_documents().await.unwrap();
        assert!(a.get_all_documents().await.unwrap().is_empty());
        assert!(a.get_chunks("d1").await.unwrap().is_empty());
        assert!(a.load_session().await.unwrap().is_none());
    }
}
