/// Two-phase session analysis.
///
/// `start` stores the documents, runs a quick scan over the highest-priority ones and
/// returns the `partial` session straight away. The detailed pass over every document
/// runs as a spawned task; its `DetailedPhaseHandle` exposes the latest session state,
/// a watch subscription, completion and cancellation.
use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use analysis_common::kv::KvStore;

use crate::classify::prioritize;
use crate::error::AnalysisError;
use crate::model::{
    now_millis, AnalysisPhase, AnalysisSession, ParsedDocument, SessionStatus, UserContext,
};
use crate::orchestrator::{AnalysisOptions, AnalysisOrchestrator};
use crate::store::ResultStore;

#[derive(Debug, Clone)]
pub struct ProgressiveConfig {
    pub quick_scan_documents: usize,
    pub quick_scan_max_findings: usize,
}

impl Default for ProgressiveConfig {
    fn default() -> Self {
        Self {
            quick_scan_documents: 2,
            quick_scan_max_findings: 2,
        }
    }
}

#[derive(Clone)]
pub struct ProgressiveController {
    orchestrator: Arc<AnalysisOrchestrator>,
    kv: Arc<dyn KvStore>,
    config: ProgressiveConfig,
}

impl ProgressiveController {
    pub fn new(
        orchestrator: Arc<AnalysisOrchestrator>,
        kv: Arc<dyn KvStore>,
        config: ProgressiveConfig,
    ) -> Self {
        Self {
            orchestrator,
            kv,
            config,
        }
    }

    pub fn store(&self, session_id: &str) -> ResultStore {
        ResultStore::new(self.kv.clone(), session_id)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<AnalysisSession>, AnalysisError> {
        self.store(session_id).load_session().await
    }

    /// Replaces any previous state of `session_id`. Returns once the quick scan is
    /// persisted; the detailed pass continues in the background.
    pub async fn start(
        &self,
        session_id: &str,
        user_id: &str,
        documents: Vec<ParsedDocument>,
        context: UserContext,
    ) -> Result<(AnalysisSession, DetailedPhaseHandle), AnalysisError> {
        validate_documents(&documents)?;

        let store = self.store(session_id);
        store.clear_documents().await?;
        for document in &documents {
            store.store_document(document).await?;
        }

        let mut session = AnalysisSession::new(
            session_id,
            user_id,
            documents.iter().map(|d| d.id.clone()).collect(),
        );
        self.run_quick_scan(&store, &mut session, &documents, &context)
            .await?;

        let (updates, receiver) = watch::channel(session.clone());
        let controller = self.clone();
        let initial = session.clone();
        let task = tokio::spawn(async move {
            controller
                .run_detailed(initial, documents, context, updates)
                .await
        });

        Ok((
            session,
            DetailedPhaseHandle {
                updates: receiver,
                task,
                store,
            },
        ))
    }

    async fn run_quick_scan(
        &self,
        store: &ResultStore,
        session: &mut AnalysisSession,
        documents: &[ParsedDocument],
        context: &UserContext,
    ) -> Result<(), AnalysisError> {
        let selected: Vec<&ParsedDocument> = prioritize(documents)
            .into_iter()
            .take(self.config.quick_scan_documents.max(1))
            .map(|(document, _)| document)
            .collect();
        info!(
            session_id = %session.session_id,
            selected = ?selected.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(),
            total = documents.len(),
            "quick scan starting"
        );

        let batch = self
            .orchestrator
            .analyze_documents(
                &session.user_id,
                &selected,
                context,
                &AnalysisOptions::quick(self.config.quick_scan_max_findings),
            )
            .await?;

        store.replace_analysis_results(&batch.findings).await?;
        session.findings = batch.findings;
        session.progress = progress(selected.len(), documents.len());
        session.phase = AnalysisPhase::QuickScan;
        session.error = batch.provider_failure.as_ref().map(describe);
        session.transition(SessionStatus::Partial)?;
        store.save_session(session).await?;
        Ok(())
    }

    async fn run_detailed(
        self,
        mut session: AnalysisSession,
        documents: Vec<ParsedDocument>,
        context: UserContext,
        updates: watch::Sender<AnalysisSession>,
    ) -> AnalysisSession {
        let store = self.store(&session.session_id);
        session.phase = AnalysisPhase::Detailed;
        session.updated_at = now_millis();
        persist(&store, &session).await;
        updates.send_replace(session.clone());

        let all: Vec<&ParsedDocument> = documents.iter().collect();
        let outcome = self
            .orchestrator
            .analyze_documents(&session.user_id, &all, &context, &AnalysisOptions::detailed())
            .await;

        match outcome {
            // Provider-wide failure with nothing analyzed: keep the quick-scan results.
            Ok(batch) if batch.analyzed.is_empty() && batch.provider_failure.is_some() => {
                let error = batch
                    .provider_failure
                    .unwrap_or(AnalysisError::Provider("detailed analysis failed".to_string()));
                fail(&mut session, &error);
            }
            Ok(batch) => match store.replace_analysis_results(&batch.findings).await {
                Ok(()) => {
                    session.findings = batch.findings;
                    session.questions = batch.questions;
                    session.progress = 100;
                    session.error = batch.provider_failure.as_ref().map(describe);
                    if let Err(e) = session.transition(SessionStatus::Complete) {
                        warn!(session_id = %session.session_id, error = %e, "could not complete session");
                    }
                    info!(
                        session_id = %session.session_id,
                        findings = session.findings.len(),
                        questions = session.questions.len(),
                        "detailed analysis complete"
                    );
                }
                Err(e) => fail(&mut session, &e),
            },
            Err(e) => fail(&mut session, &e),
        }

        if session.status == SessionStatus::Failed {
            restore(&store, &session).await;
        }
        persist(&store, &session).await;
        updates.send_replace(session.clone());
        session
    }
}

/// Background detailed pass of one session.
pub struct DetailedPhaseHandle {
    updates: watch::Receiver<AnalysisSession>,
    task: JoinHandle<AnalysisSession>,
    store: ResultStore,
}

impl DetailedPhaseHandle {
    pub fn session_id(&self) -> &str {
        self.store.session_id()
    }

    pub fn latest(&self) -> AnalysisSession {
        self.updates.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AnalysisSession> {
        self.updates.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(self) -> Result<AnalysisSession, AnalysisError> {
        self.task
            .await
            .map_err(|e| AnalysisError::Provider(format!("detailed analysis task failed: {e}")))
    }

    /// Abort the detailed pass. A session that had not finished is marked `failed`
    /// and its quick-scan findings are stored again if the pass was cut off while
    /// replacing them.
    pub async fn cancel(self) -> Result<AnalysisSession, AnalysisError> {
        self.task.abort();
        if let Ok(finished) = self.task.await {
            return Ok(finished);
        }

        let mut session = match self.store.load_session().await? {
            Some(session) => session,
            None => self.updates.borrow().clone(),
        };
        if !session.status.is_terminal() {
            session.error = Some("detailed analysis cancelled".to_string());
            session.transition(SessionStatus::Failed)?;
            self.store.restore_analysis_results(&session.findings).await?;
            self.store.save_session(&session).await?;
        }
        info!(session_id = %session.session_id, status = ?session.status, "detailed analysis cancelled");
        Ok(session)
    }
}

fn validate_documents(documents: &[ParsedDocument]) -> Result<(), AnalysisError> {
    if documents.is_empty() {
        return Err(AnalysisError::Validation(
            "at least one document is required".to_string(),
        ));
    }
    let mut seen = HashSet::new();
    for document in documents {
        if document.id.trim().is_empty() {
            return Err(AnalysisError::Validation(format!(
                "document {} has an empty id",
                document.filename
            )));
        }
        if !seen.insert(document.id.as_str()) {
            return Err(AnalysisError::Validation(format!(
                "duplicate document id {}",
                document.id
            )));
        }
    }
    Ok(())
}

/// Whole percent of `analyzed` over `total`, rounded down.
fn progress(analyzed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    (analyzed.min(total) * 100 / total) as u8
}

fn describe(error: &AnalysisError) -> String {
    match error.suggestion() {
        Some(hint) => format!("{error}. {hint}"),
        None => error.to_string(),
    }
}

fn fail(session: &mut AnalysisSession, error: &AnalysisError) {
    warn!(session_id = %session.session_id, error = %error, "detailed analysis failed");
    session.error = Some(describe(error));
    if let Err(e) = session.transition(SessionStatus::Failed) {
        warn!(session_id = %session.session_id, error = %e, "could not mark session failed");
    }
}

async fn restore(store: &ResultStore, session: &AnalysisSession) {
    if let Err(e) = store.restore_analysis_results(&session.findings).await {
        warn!(session_id = %session.session_id, error = %e, "failed to restore quick-scan findings");
    }
}

async fn persist(store: &ResultStore, session: &AnalysisSession) {
    if let Err(e) = store.save_session(session).await {
        warn!(session_id = %session.session_id, error = %e, "failed to persist session");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedCaller;
    use crate::model::{FindingType, QuestionCategory};
    use crate::orchestrator::tests::orchestrator;
    use crate::questions::GENERATE_QUESTIONS_FN;
    use crate::store::tests::document;
    use std::sync::atomic::{AtomicBool, Ordering};

    use analysis_common::error::CommonError;
    use analysis_common::kv::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Notify;

    const CLAUSE: &str = "Clause 1 applies to this property.";

    fn scripted(detailed_fails: bool) -> Arc<ScriptedCaller> {
        Arc::new(ScriptedCaller::new(move |call| {
            if call.name == GENERATE_QUESTIONS_FN {
                return Ok(json!({"questions": [
                    {"category": "general", "question": "Is there a warranty?", "priority": "high"}
                ]})
                .to_string());
            }
            let quick = call.prompt.contains("at most");
            if detailed_fails && !quick {
                return Err(AnalysisError::ServiceOverloaded("upstream 503".to_string()));
            }
            let filename = call.prompt.split('"').nth(1).unwrap_or("unknown");
            Ok(json!({"findings": [{
                "type": "concern",
                "title": format!("{filename} clause"),
                "description": "Clause 1 needs checking.",
                "severity": "medium",
                "confidence": 0.7,
                "citations": [{"quote": "Clause 1 applies"}]
            }]})
            .to_string())
        }))
    }

    fn controller(caller: Arc<ScriptedCaller>) -> ProgressiveController {
        ProgressiveController::new(
            Arc::new(orchestrator(caller)),
            Arc::new(MemoryStore::default()),
            ProgressiveConfig::default(),
        )
    }

    fn five_documents() -> Vec<ParsedDocument> {
        vec![
            document("gen", "notes.txt", CLAUSE),
            document("title", "title_register.pdf", CLAUSE),
            document("search", "local_search.pdf", CLAUSE),
            document("survey", "survey.pdf", CLAUSE),
            document("ta6", "ta6.pdf", CLAUSE),
        ]
    }

    fn cited_ids(session: &AnalysisSession) -> HashSet<String> {
        session
            .findings
            .iter()
            .flat_map(|f| f.citations.iter().map(|c| c.document_id.clone()))
            .collect()
    }

    #[tokio::test]
    async fn quick_scan_covers_top_two_then_detailed_completes() {
        let controller = controller(scripted(false));
        let (partial, handle) = controller
            .start("s1", "u1", five_documents(), UserContext::default())
            .await
            .unwrap();

        assert_eq!(partial.status, SessionStatus::Partial);
        assert_eq!(partial.phase, AnalysisPhase::QuickScan);
        assert_eq!(partial.progress, 40);
        let expected: HashSet<String> = ["ta6", "survey"].iter().map(|s| s.to_string()).collect();
        assert_eq!(cited_ids(&partial), expected);

        let mut updates = handle.subscribe();
        let done = handle.wait().await.unwrap();
        assert_eq!(done.status, SessionStatus::Complete);
        assert_eq!(done.phase, AnalysisPhase::Detailed);
        assert_eq!(done.progress, 100);
        assert_eq!(done.findings.len(), 5);
        assert_eq!(cited_ids(&done).len(), 5);
        assert_eq!(done.questions.len(), 1);
        assert_eq!(done.questions[0].category, QuestionCategory::Other);
        assert_eq!(updates.borrow_and_update().status, SessionStatus::Complete);

        let stored = controller.get_session("s1").await.unwrap().unwrap();
        assert_eq!(stored, done);
        let grouped = controller.store("s1").get_analysis_results().await.unwrap();
        assert_eq!(grouped.concern.len(), 5);
    }

    #[tokio::test]
    async fn detailed_failure_keeps_quick_scan_results() {
        let controller = controller(scripted(true));
        let (partial, handle) = controller
            .start("s1", "u1", five_documents(), UserContext::default())
            .await
            .unwrap();

        let done = handle.wait().await.unwrap();
        assert_eq!(done.status, SessionStatus::Failed);
        assert_eq!(done.findings, partial.findings);
        assert!(done.error.as_deref().unwrap_or_default().contains("overloaded"));

        let grouped = controller.store("s1").get_analysis_results().await.unwrap();
        assert_eq!(grouped.total(), partial.findings.len());
        assert!(grouped.concern.iter().all(|f| f.kind == FindingType::Concern));
    }

    #[tokio::test]
    async fn cancel_marks_session_failed() {
        let controller = controller(scripted(false));
        let (partial, handle) = controller
            .start("s1", "u1", five_documents(), UserContext::default())
            .await
            .unwrap();
        assert_eq!(handle.session_id(), "s1");
        assert_eq!(handle.latest().status, SessionStatus::Partial);

        let cancelled = handle.cancel().await.unwrap();
        assert_eq!(cancelled.status, SessionStatus::Failed);
        assert_eq!(cancelled.findings, partial.findings);
        assert_eq!(
            controller.get_session("s1").await.unwrap().unwrap().status,
            SessionStatus::Failed
        );
    }

    /// Blocks the first armed write to a per-document results key forever, leaving
    /// a results replace half done until the task is aborted.
    #[derive(Default)]
    struct StallingStore {
        inner: MemoryStore,
        armed: AtomicBool,
        stalled: Notify,
    }

    #[async_trait]
    impl KvStore for StallingStore {
        async fn get(&self, key: &str) -> Result<Option<String>, CommonError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<(), CommonError> {
            if key.contains(":results:") && self.armed.swap(false, Ordering::SeqCst) {
                self.stalled.notify_one();
                std::future::pending::<()>().await;
            }
            self.inner.set(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<(), CommonError> {
            self.inner.delete(key).await
        }

        fn backend(&self) -> &'static str {
            "stalling"
        }
    }

    #[tokio::test]
    async fn cancel_during_results_replace_keeps_quick_scan_findings() {
        let kv = Arc::new(StallingStore::default());
        let controller = ProgressiveController::new(
            Arc::new(orchestrator(scripted(false))),
            kv.clone(),
            ProgressiveConfig::default(),
        );
        let (partial, handle) = controller
            .start("s1", "u1", five_documents(), UserContext::default())
            .await
            .unwrap();
        kv.armed.store(true, Ordering::SeqCst);

        kv.stalled.notified().await;
        let store = controller.store("s1");
        assert_eq!(store.all_findings().await.unwrap().len(), 5);

        let cancelled = handle.cancel().await.unwrap();
        assert_eq!(cancelled.status, SessionStatus::Failed);
        assert_eq!(cancelled.findings, partial.findings);

        assert_eq!(store.all_findings().await.unwrap(), partial.findings);
        assert_eq!(
            store.get_analysis_results().await.unwrap().total(),
            partial.findings.len()
        );
        for id in ["ta6", "survey"] {
            assert_eq!(store.get_document_results(id).await.unwrap().len(), 1);
        }
        for id in ["gen", "title", "search"] {
            assert!(store.get_document_results(id).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn rejects_empty_and_duplicate_documents() {
        let controller = controller(scripted(false));
        let Err(err) = controller
            .start("s1", "u1", vec![], UserContext::default())
            .await
        else {
            panic!("empty batch accepted");
        };
        assert!(matches!(err, AnalysisError::Validation(_)));

        let docs = vec![document("a", "a.pdf", CLAUSE), document("a", "b.pdf", CLAUSE)];
        let Err(err) = controller
            .start("s1", "u1", docs, UserContext::default())
            .await
        else {
            panic!("duplicate document ids accepted");
        };
        assert!(matches!(err, AnalysisError::Validation(_)));
    }

    #[test]
    fn progress_rounds_down() {
        assert_eq!(progress(2, 5), 40);
        assert_eq!(progress(1, 3), 33);
        assert_eq!(progress(2, 2), 100);
        assert_eq!(progress(0, 0), 0);
    }
}
