//! Query Agent
//!
//! Entry point for callers: `answer(question)`, `summarize(context)` and the
//! read-only `current_dataset()`. The agent owns the backend handle, the
//! dataset cache and the outcome of loading its source. A load failure is
//! kept and returned for every later question.

use crate::config::AgentConfig;
use crate::dataset::{Dataset, DatasetCache};
use crate::error::{AgentError, LoadError, Result};
use crate::execution::{PlanExecutor, QueryResult};
use crate::llm::{LlmBackend, LlmClient};
use crate::narrative::{NarrativeGenerator, NarrativeResult};
use crate::planner::QueryPlanner;
use polars::prelude::DataFrame;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Lifecycle of one `answer` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPhase {
    Idle,
    Planning,
    Executing,
    Succeeded,
    Failed,
}

impl RequestPhase {
    pub fn can_transition_to(self, next: RequestPhase) -> bool {
        use RequestPhase::*;
        matches!(
            (self, next),
            (Idle, Planning)
                | (Idle, Failed)
                | (Planning, Executing)
                | (Planning, Failed)
                | (Executing, Succeeded)
                | (Executing, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RequestPhase::Succeeded | RequestPhase::Failed)
    }
}

/// Phases one request went through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestTrace {
    pub request_id: String,
    pub phases: Vec<RequestPhase>,
}

impl RequestTrace {
    fn new(request_id: String) -> Self {
        Self {
            request_id,
            phases: vec![RequestPhase::Idle],
        }
    }

    pub fn phase(&self) -> RequestPhase {
        self.phases.last().copied().unwrap_or(RequestPhase::Idle)
    }

    fn advance(&mut self, next: RequestPhase) {
        let current = self.phase();
        if current.can_transition_to(next) {
            debug!("Request {:?} -> {:?}", current, next);
            self.phases.push(next);
        } else {
            warn!("Ignoring invalid request transition {:?} -> {:?}", current, next);
        }
    }

    fn fail(&mut self, error: &AgentError) {
        warn!("Request failed in {:?}: {} ({})", self.phase(), error, error.kind());
        self.advance(RequestPhase::Failed);
    }
}

pub struct QueryAgent {
    cache: Arc<DatasetCache>,
    source_key: String,
    dataset: RwLock<std::result::Result<Dataset, LoadError>>,
    planner: QueryPlanner,
    executor: PlanExecutor,
    narrative: NarrativeGenerator,
    config: AgentConfig,
}

impl QueryAgent {
    /// Build an agent talking to the configured OpenAI-compatible endpoint.
    ///
    /// A missing credential is a `Configuration` error and no agent is built.
    pub async fn connect(
        config: AgentConfig,
        cache: Arc<DatasetCache>,
        source_key: impl Into<String>,
    ) -> Result<Self> {
        let client = LlmClient::from_config(&config)?;
        info!("Using model {} at {}", client.model(), config.base_url);
        Ok(Self::with_backend(Arc::new(client), config, cache, source_key).await)
    }

    /// Build an agent around any backend and load its source once.
    pub async fn with_backend(
        backend: Arc<dyn LlmBackend>,
        config: AgentConfig,
        cache: Arc<DatasetCache>,
        source_key: impl Into<String>,
    ) -> Self {
        let source_key = source_key.into();
        let dataset = cache.load(&source_key).await;
        match &dataset {
            Ok(ds) => info!("Agent ready on {} ({} rows)", source_key, ds.height()),
            Err(e) => warn!("Agent started without data: {}", e),
        }

        Self {
            planner: QueryPlanner::new(Arc::clone(&backend), &config),
            executor: PlanExecutor::new(config.execution.clone()),
            narrative: NarrativeGenerator::new(
                backend,
                config.narrative.clone(),
                config.backend_timeout,
            ),
            cache,
            source_key,
            dataset: RwLock::new(dataset),
            config,
        }
    }

    pub fn source_key(&self) -> &str {
        &self.source_key
    }

    /// Loaded table, or `None` when loading failed.
    pub fn current_dataset(&self) -> Option<Dataset> {
        self.state().as_ref().ok().cloned()
    }

    pub fn load_error(&self) -> Option<LoadError> {
        self.state().as_ref().err().cloned()
    }

    /// Drop the cached table and read the source again.
    pub async fn reload(&self) -> std::result::Result<Dataset, LoadError> {
        self.cache.invalidate(&self.source_key);
        let loaded = self.cache.load(&self.source_key).await;
        self.store(loaded.clone());
        loaded
    }

    pub async fn answer(&self, question: &str) -> Result<QueryResult> {
        self.answer_traced(question).await.1
    }

    /// Same as [`answer`](Self::answer), also returning the phases visited.
    pub async fn answer_traced(&self, question: &str) -> (RequestTrace, Result<QueryResult>) {
        let request_id = Uuid::new_v4().to_string();
        let span = info_span!("answer", request_id = %request_id);

        async move {
            let mut trace = RequestTrace::new(request_id);
            let result = self.run_request(&mut trace, question).await;
            match &result {
                Ok(r) => info!("Answered in {} ms", r.total_time_ms),
                Err(e) => trace.fail(e),
            }
            (trace, result)
        }
        .instrument(span)
        .await
    }

    /// Answer `question` against an explicit dataset instead of the agent's own.
    ///
    /// A dataset without rows is rejected before the backend is called.
    pub async fn answer_with(&self, dataset: &Dataset, question: &str) -> Result<QueryResult> {
        let mut trace = RequestTrace::new(Uuid::new_v4().to_string());
        let result = self.run_planned(&mut trace, dataset, question, Instant::now()).await;
        if let Err(e) = &result {
            trace.fail(e);
        }
        result
    }

    pub async fn summarize(&self, context: &str) -> Result<NarrativeResult> {
        let dataset = self.dataset_for_request().await?;
        self.narrative
            .summarize(&dataset, context)
            .instrument(info_span!("summarize", context = %context))
            .await
    }

    /// Summarize a subset, such as the table of a previous answer.
    pub async fn summarize_frame(
        &self,
        frame: &DataFrame,
        context: &str,
    ) -> Result<NarrativeResult> {
        self.narrative.summarize_frame(frame, context).await
    }

    async fn run_request(&self, trace: &mut RequestTrace, question: &str) -> Result<QueryResult> {
        let started = Instant::now();
        if question.trim().is_empty() {
            return Err(AgentError::EmptyQuestion);
        }
        let dataset = self.dataset_for_request().await?;
        self.run_planned(trace, &dataset, question, started).await
    }

    async fn run_planned(
        &self,
        trace: &mut RequestTrace,
        dataset: &Dataset,
        question: &str,
        started: Instant,
    ) -> Result<QueryResult> {
        if question.trim().is_empty() {
            return Err(AgentError::EmptyQuestion);
        }
        if dataset.is_empty() {
            return Err(AgentError::EmptyDataset {
                source_key: dataset.source_key().to_string(),
            });
        }
        info!("Question: {}", question.trim());

        trace.advance(RequestPhase::Planning);
        let plan = self.planner.plan(dataset, question).await?;

        trace.advance(RequestPhase::Executing);
        let execution = self.executor.execute(dataset, &plan).await?;

        trace.advance(RequestPhase::Succeeded);
        Ok(QueryResult {
            request_id: trace.request_id.clone(),
            question: question.trim().to_string(),
            plan,
            answer: execution.answer,
            execution_time_ms: execution.execution_time_ms,
            total_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn dataset_for_request(&self) -> Result<Dataset> {
        if self.config.revalidate_source {
            let loaded = self.cache.load(&self.source_key).await;
            self.store(loaded);
        }
        self.state().clone().map_err(AgentError::from)
    }

    fn state(&self) -> std::sync::RwLockReadGuard<'_, std::result::Result<Dataset, LoadError>> {
        self.dataset.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn store(&self, loaded: std::result::Result<Dataset, LoadError>) {
        let mut guard = self.dataset.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = loaded;
    }
}
