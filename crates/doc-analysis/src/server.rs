use std::collections::HashMap;
use std::sync::Arc;

use rmcp::{
    Json, ServerHandler,
    handler::server::router::tool::ToolRouter,
    handler::server::wrapper::Parameters,
    model::*,
    tool, tool_handler, tool_router,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::error::AnalysisError;
use crate::model::{
    new_id, AnalysisSession, AnalysisSummary, Finding, ParsedDocument, UserContext,
};
use crate::progressive::{DetailedPhaseHandle, ProgressiveController};
use crate::rate_limit::{RateLimitManager, RateLimitStatus};
use crate::store::{DocumentStats, GroupedResults, SearchHit};

const DEFAULT_SEARCH_LIMIT: usize = 20;
const MAX_SEARCH_LIMIT: usize = 100;

#[derive(Clone)]
pub struct DocAnalysisServer {
    controller: ProgressiveController,
    limiter: RateLimitManager,
    running: Arc<Mutex<HashMap<String, DetailedPhaseHandle>>>,
    tool_router: ToolRouter<DocAnalysisServer>,
}

impl DocAnalysisServer {
    pub fn new(controller: ProgressiveController, limiter: RateLimitManager) -> Self {
        Self {
            controller,
            limiter,
            running: Arc::new(Mutex::new(HashMap::new())),
            tool_router: Self::tool_router(),
        }
    }

    /// Drop handles whose detailed pass has finished; the session record is persisted.
    async fn reap_finished(&self) {
        self.running.lock().await.retain(|_, h| !h.is_finished());
    }

    async fn require_session(&self, session_id: &str) -> Result<AnalysisSession, String> {
        self.controller
            .get_session(session_id)
            .await
            .map_err(|e| tool_error(&e))?
            .ok_or_else(|| format!("unknown session_id: {session_id}"))
    }
}

fn tool_error(err: &AnalysisError) -> String {
    match err.suggestion() {
        Some(hint) => format!("{err} ({hint})"),
        None => err.to_string(),
    }
}

fn non_empty(value: &str, field: &str) -> Result<String, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(format!("{field} must not be empty"));
    }
    Ok(trimmed.to_string())
}

#[derive(Debug, Deserialize, JsonSchema)]
struct AnalyzeDocumentsParams {
    /// Omit to start a new session.
    session_id: Option<String>,
    user_id: String,
    /// Documents already converted to text by the extraction step.
    documents: Vec<ParsedDocument>,
    #[serde(default)]
    user_context: UserContext,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SessionParams {
    session_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct DocumentParams {
    session_id: String,
    document_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SearchDocumentsParams {
    session_id: String,
    query: String,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct QueuePositionParams {
    user_id: String,
}

#[derive(Debug, Serialize, JsonSchema)]
struct SearchResponse {
    hits: Vec<SearchHit>,
}

#[derive(Debug, Serialize, JsonSchema)]
struct DocumentFindingsResponse {
    document_id: String,
    filename: String,
    findings: Vec<Finding>,
}

#[derive(Debug, Serialize, JsonSchema)]
struct QueuePositionResponse {
    user_id: String,
    /// 1-based position of the user's earliest queued request; absent when none is queued.
    position: Option<usize>,
    queue_length: usize,
}

#[tool_router]
impl DocAnalysisServer {
    #[tool(description = "Analyze a set of parsed property documents. Runs a quick scan of the two highest-priority documents and returns the partial session immediately; a detailed pass over all documents continues in the background. Poll get_session for completion.")]
    async fn analyze_documents(
        &self,
        Parameters(params): Parameters<AnalyzeDocumentsParams>,
    ) -> Result<Json<AnalysisSession>, String> {
        let user_id = non_empty(&params.user_id, "user_id")?;
        let session_id = match params.session_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => new_id("session", &user_id),
        };

        self.reap_finished().await;
        if self.running.lock().await.contains_key(&session_id) {
            return Err(format!(
                "analysis already running for session {session_id}; cancel it first"
            ));
        }

        let (session, handle) = self
            .controller
            .start(&session_id, &user_id, params.documents, params.user_context)
            .await
            .map_err(|e| tool_error(&e))?;
        self.running.lock().await.insert(session_id.clone(), handle);
        info!(session_id = %session_id, progress = session.progress, "quick scan returned");
        Ok(Json(session))
    }

    #[tool(description = "Get the current state of an analysis session: status (partial, complete, failed), progress, phase, findings and questions.")]
    async fn get_session(
        &self,
        Parameters(params): Parameters<SessionParams>,
    ) -> Result<Json<AnalysisSession>, String> {
        self.reap_finished().await;
        Ok(Json(self.require_session(&params.session_id).await?))
    }

    #[tool(description = "Get a session's findings grouped by type: positive, concern, risk and red_flag.")]
    async fn get_results(
        &self,
        Parameters(params): Parameters<SessionParams>,
    ) -> Result<Json<GroupedResults>, String> {
        self.require_session(&params.session_id).await?;
        let results = self
            .controller
            .store(&params.session_id)
            .get_analysis_results()
            .await
            .map_err(|e| tool_error(&e))?;
        Ok(Json(results))
    }

    #[tool(description = "Get a summary derived from a session's current findings: overall risk, key findings, recommended actions and a risk breakdown.")]
    async fn get_summary(
        &self,
        Parameters(params): Parameters<SessionParams>,
    ) -> Result<Json<AnalysisSummary>, String> {
        self.require_session(&params.session_id).await?;
        let summary = self
            .controller
            .store(&params.session_id)
            .summary()
            .await
            .map_err(|e| tool_error(&e))?;
        Ok(Json(summary))
    }

    #[tool(description = "Get the findings that cite one document of a session.")]
    async fn get_document_findings(
        &self,
        Parameters(params): Parameters<DocumentParams>,
    ) -> Result<Json<DocumentFindingsResponse>, String> {
        self.require_session(&params.session_id).await?;
        let store = self.controller.store(&params.session_id);
        let document = store
            .get_document(&params.document_id)
            .await
            .map_err(|e| tool_error(&e))?
            .ok_or_else(|| format!("unknown document_id: {}", params.document_id))?;
        let findings = store
            .get_document_results(&document.id)
            .await
            .map_err(|e| tool_error(&e))?;
        Ok(Json(DocumentFindingsResponse {
            document_id: document.id,
            filename: document.filename,
            findings,
        }))
    }

    #[tool(description = "Get document statistics for a session: document, chunk and character counts, extraction quality and finding counts by type.")]
    async fn get_document_stats(
        &self,
        Parameters(params): Parameters<SessionParams>,
    ) -> Result<Json<DocumentStats>, String> {
        self.require_session(&params.session_id).await?;
        let stats = self
            .controller
            .store(&params.session_id)
            .get_document_stats()
            .await
            .map_err(|e| tool_error(&e))?;
        Ok(Json(stats))
    }

    #[tool(description = "Search the text of a session's documents (case-insensitive substring). Returns the document, chunk, page, line and section of each match.")]
    async fn search_documents(
        &self,
        Parameters(params): Parameters<SearchDocumentsParams>,
    ) -> Result<Json<SearchResponse>, String> {
        let query = non_empty(&params.query, "query")?;
        self.require_session(&params.session_id).await?;
        let limit = params
            .limit
            .unwrap_or(DEFAULT_SEARCH_LIMIT)
            .clamp(1, MAX_SEARCH_LIMIT);
        let hits = self
            .controller
            .store(&params.session_id)
            .search(&query, limit)
            .await
            .map_err(|e| tool_error(&e))?;
        Ok(Json(SearchResponse { hits }))
    }

    #[tool(description = "Get provider rate-limit usage for the current minute and day, queue length, estimated wait and recommendations.")]
    async fn get_rate_limit_status(&self) -> Result<Json<RateLimitStatus>, String> {
        Ok(Json(self.limiter.get_rate_limit_status().await))
    }

    #[tool(description = "Get a user's position in the provider request queue.")]
    async fn get_queue_position(
        &self,
        Parameters(params): Parameters<QueuePositionParams>,
    ) -> Result<Json<QueuePositionResponse>, String> {
        let user_id = non_empty(&params.user_id, "user_id")?;
        let position = self.limiter.get_queue_position(&user_id).await;
        let queue_length = self.limiter.get_rate_limit_status().await.queue_length;
        Ok(Json(QueuePositionResponse {
            user_id,
            position,
            queue_length,
        }))
    }

    #[tool(description = "Cancel a session's background detailed analysis. The session is marked failed and its quick-scan results stay available.")]
    async fn cancel_analysis(
        &self,
        Parameters(params): Parameters<SessionParams>,
    ) -> Result<Json<AnalysisSession>, String> {
        let handle = self
            .running
            .lock()
            .await
            .remove(&params.session_id)
            .ok_or_else(|| format!("no running analysis for session {}", params.session_id))?;
        let session = handle.cancel().await.map_err(|e| tool_error(&e))?;
        Ok(Json(session))
    }
}

#[tool_handler]
impl ServerHandler for DocAnalysisServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "doc-analysis".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Property document analysis MCP server. Call analyze_documents with parsed \
documents to get quick-scan findings immediately; the detailed pass continues in the background. \
Poll get_session until status is complete or failed, then use get_results, get_summary, \
get_document_stats and search_documents. Provider quota is shared: check get_rate_limit_status \
and get_queue_position when requests are slow."
                    .to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedCaller;
    use crate::orchestrator::tests::{orchestrator, SURVEY_TEXT};
    use crate::progressive::ProgressiveConfig;
    use crate::rate_limit::RateLimitConfig;
    use crate::store::tests::document;
    use analysis_common::kv::MemoryStore;

    fn server() -> DocAnalysisServer {
        let caller = Arc::new(ScriptedCaller::new(|_| {
            Ok(serde_json::json!({"findings": []}).to_string())
        }));
        let controller = ProgressiveController::new(
            Arc::new(orchestrator(caller)),
            Arc::new(MemoryStore::default()),
            ProgressiveConfig::default(),
        );
        DocAnalysisServer::new(controller, RateLimitManager::new(RateLimitConfig::default()))
    }

    #[test]
    fn tools_publish_output_schemas() {
        let tools = DocAnalysisServer::tool_router().list_all();
        for name in [
            "analyze_documents",
            "get_session",
            "get_results",
            "get_summary",
            "get_document_findings",
            "get_document_stats",
            "search_documents",
            "get_rate_limit_status",
            "get_queue_position",
            "cancel_analysis",
        ] {
            let tool = tools
                .iter()
                .find(|t| t.name == name)
                .unwrap_or_else(|| panic!("missing tool: {name}"));
            assert!(
                tool.output_schema.is_some(),
                "tool {name} should publish output_schema"
            );
        }
    }

    #[tokio::test]
    async fn analyze_then_query_session() {
        let server = server();
        let Json(session) = server
            .analyze_documents(Parameters(AnalyzeDocumentsParams {
                session_id: Some("s1".to_string()),
                user_id: "u1".to_string(),
                documents: vec![document("d1", "survey.pdf", SURVEY_TEXT)],
                user_context: UserContext::default(),
            }))
            .await
            .unwrap();
        assert_eq!(session.session_id, "s1");
        assert_eq!(session.progress, 100);

        let Json(found) = server
            .search_documents(Parameters(SearchDocumentsParams {
                session_id: "s1".to_string(),
                query: "rear wall".to_string(),
                limit: None,
            }))
            .await
            .unwrap();
        assert_eq!(found.hits.len(), 1);
        assert_eq!(found.hits[0].document_id, "d1");

        let Json(per_doc) = server
            .get_document_findings(Parameters(DocumentParams {
                session_id: "s1".to_string(),
                document_id: "d1".to_string(),
            }))
            .await
            .unwrap();
        assert_eq!(per_doc.filename, "survey.pdf");
        assert!(per_doc.findings.is_empty());

        let Err(err) = server
            .get_session(Parameters(SessionParams {
                session_id: "missing".to_string(),
            }))
            .await
        else {
            panic!("expected a tool error");
        };
        assert!(err.contains("unknown session_id"));
    }

    #[tokio::test]
    async fn empty_inputs_are_rejected() {
        let server = server();
        let Err(err) = server
            .analyze_documents(Parameters(AnalyzeDocumentsParams {
                session_id: None,
                user_id: "u1".to_string(),
                documents: vec![],
                user_context: UserContext::default(),
            }))
            .await
        else {
            panic!("expected a tool error");
        };
        assert!(err.contains("validation error"));

        let Err(err) = server
            .get_queue_position(Parameters(QueuePositionParams {
                user_id: " ".to_string(),
            }))
            .await
        else {
            panic!("expected a tool error");
        };
        assert!(err.contains("user_id must not be empty"));
    }

    #[tokio::test]
    async fn cancel_without_running_analysis_fails() {
        let server = server();
        let Err(err) = server
            .cancel_analysis(Parameters(SessionParams {
                session_id: "s1".to_string(),
            }))
            .await
        else {
            panic!("expected a tool error");
        };
        assert!(err.contains("no running analysis"));
    }
}
