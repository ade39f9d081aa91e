use async_trait::async_trait;
use farm_query::dataset::{DatasetCache, TableParser, TabularSource};
use farm_query::error::{BackendError, LoadError, LoadErrorKind};
use farm_query::presenter::{render_error, render_result};
use farm_query::{
    AgentConfig, AgentError, Dataset, LlmBackend, Presenter, QueryAgent, RequestPhase, Scalar,
    SUGGESTED_QUESTIONS,
};
use polars::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

const SUM_JAN_FEB: &str = r#"{"steps":[
    {"op":"filter","column":"month","cmp":"in","value":["Jan","Feb"]},
    {"op":"aggregate","aggregations":[{"func":"sum","column":"headCount"}]}
]}"#;

/// Deterministic backend: always replies with the same text and records prompts.
struct StubBackend {
    reply: String,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl StubBackend {
    fn replying(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.to_string(),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmBackend for StubBackend {
    async fn complete(
        &self,
        _system: &str,
        user: &str,
        _max_tokens: u32,
    ) -> Result<String, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(user.to_string());
        Ok(self.reply.clone())
    }
}

struct NoBytes;

impl TabularSource for NoBytes {
    fn read(&self, key: &str) -> std::io::Result<Vec<u8>> {
        if key.starts_with("missing") {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, key.to_string()))
        } else {
            Ok(Vec::new())
        }
    }
}

/// Hands out a prebuilt frame regardless of the bytes.
struct FrameParser(DataFrame);

impl TableParser for FrameParser {
    fn parse(&self, _key: &str, _bytes: Vec<u8>) -> Result<DataFrame, LoadError> {
        Ok(self.0.clone())
    }
}

fn herd() -> DataFrame {
    df![
        "month" => ["Jan", "Feb", "Mar"],
        "headCount" => [10i64, 20, 30]
    ]
    .unwrap()
}

fn config() -> AgentConfig {
    AgentConfig::new("sk-test").unwrap()
}

async fn agent_over(
    frame: DataFrame,
    backend: Arc<StubBackend>,
    config: AgentConfig,
) -> QueryAgent {
    let cache = Arc::new(DatasetCache::new(Arc::new(NoBytes), Arc::new(FrameParser(frame))));
    QueryAgent::with_backend(backend, config, cache, "herd.xlsx").await
}

#[tokio::test]
async fn test_round_trip_sum_of_filtered_months() {
    let backend = StubBackend::replying(SUM_JAN_FEB);
    let agent = agent_over(herd(), backend.clone(), config()).await;

    let (trace, result) = agent.answer_traced("total Jan+Feb").await;
    let result = result.unwrap();

    assert_eq!(result.answer.scalar(), Some(&Scalar::Int(30)));
    assert_eq!(render_result(&result), "Resposta: 30");
    assert_eq!(
        trace.phases,
        vec![
            RequestPhase::Idle,
            RequestPhase::Planning,
            RequestPhase::Executing,
            RequestPhase::Succeeded
        ]
    );
    assert_eq!(backend.calls(), 1);
    assert!(backend.prompts.lock().unwrap()[0].contains("Question: total Jan+Feb"));
}

#[tokio::test]
async fn test_empty_question_never_reaches_backend() {
    let backend = StubBackend::replying(SUM_JAN_FEB);
    let agent = agent_over(herd(), backend.clone(), config()).await;

    for question in ["", "   ", "\n\t"] {
        let (trace, result) = agent.answer_traced(question).await;
        assert_eq!(result.unwrap_err(), AgentError::EmptyQuestion);
        assert_eq!(trace.phases, vec![RequestPhase::Idle, RequestPhase::Failed]);
    }
    assert_eq!(backend.calls(), 0);
}

#[tokio::test]
async fn test_unknown_column_leaves_dataset_unchanged() {
    let backend = StubBackend::replying(
        r#"{"steps":[{"op":"aggregate","aggregations":[{"func":"sum","column":"PESO TOTAL"}]}]}"#,
    );
    let agent = agent_over(herd(), backend, config()).await;
    let before = agent.current_dataset().unwrap();
    let snapshot = before.frame().clone();

    let (trace, result) = agent.answer_traced("peso total?").await;
    match result {
        Err(AgentError::UnknownColumn { ref column, ref available }) => {
            assert_eq!(column, "PESO TOTAL");
            assert_eq!(available, &vec!["month".to_string(), "headCount".to_string()]);
        }
        other => panic!("expected UnknownColumn, got {:?}", other),
    }
    assert_eq!(
        trace.phases,
        vec![
            RequestPhase::Idle,
            RequestPhase::Planning,
            RequestPhase::Executing,
            RequestPhase::Failed
        ]
    );

    let after = agent.current_dataset().unwrap();
    assert!(after.same_snapshot(&before));
    assert!(after.frame().equals_missing(&snapshot));
}

#[tokio::test]
async fn test_invalid_plan_is_planning_failed() {
    let backend = StubBackend::replying("df[df.month == 'Jan'].headCount.sum()");
    let agent = agent_over(herd(), backend, config()).await;

    let (trace, result) = agent.answer_traced("total Jan").await;
    assert!(matches!(result, Err(AgentError::PlanningFailed(_))));
    assert_eq!(
        trace.phases,
        vec![RequestPhase::Idle, RequestPhase::Planning, RequestPhase::Failed]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_plan_times_out_without_partial_result() {
    let rows = 3_000_000usize;
    let labels: Vec<String> = (0..rows).map(|i| format!("fazenda-{}", i % 100_003)).collect();
    let heads: Vec<i64> = (0..rows as i64).collect();
    let frame =
        DataFrame::new(vec![Series::new("month", labels), Series::new("headCount", heads)])
            .unwrap();

    let backend = StubBackend::replying(
        r#"{"steps":[
            {"op":"filter","column":"month","cmp":"contains","value":"fazenda"},
            {"op":"group_by","keys":["month"],
             "aggregations":[{"func":"median","column":"headCount","alias":"m"}]},
            {"op":"sort","column":"month","descending":true}
        ]}"#,
    );
    let mut config = config();
    config.execution.timeout = Duration::from_millis(1);
    let agent = agent_over(frame, backend, config).await;

    let started = Instant::now();
    let result = agent.answer("mediana por fazenda").await;
    let elapsed = started.elapsed();

    assert_eq!(result.unwrap_err(), AgentError::ExecutionTimeout { timeout_ms: 1 });
    assert!(elapsed < Duration::from_millis(500), "took {:?}", elapsed);
}

#[tokio::test]
async fn test_summarize_is_idempotent_with_deterministic_backend() {
    let backend = StubBackend::replying("  O rebanho cresceu de janeiro a março.  ");
    let agent = agent_over(herd(), backend.clone(), config()).await;

    let first = agent.summarize("abates mensais").await.unwrap();
    let second = agent.summarize("abates mensais").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.text, "O rebanho cresceu de janeiro a março.");
    assert!(!first.truncated);

    let prompts = backend.prompts.lock().unwrap();
    assert_eq!(prompts[0], prompts[1]);
}

#[tokio::test]
async fn test_load_failure_is_returned_for_every_question() {
    let backend = StubBackend::replying(SUM_JAN_FEB);
    let cache = Arc::new(DatasetCache::new(Arc::new(NoBytes), Arc::new(FrameParser(herd()))));
    let agent = QueryAgent::with_backend(backend.clone(), config(), cache, "missing.xlsx").await;

    assert!(agent.current_dataset().is_none());
    assert_eq!(agent.load_error().unwrap().kind, LoadErrorKind::Unreadable);

    for _ in 0..2 {
        match agent.answer("total Jan+Feb").await {
            Err(AgentError::Load(e)) => assert_eq!(e.kind, LoadErrorKind::Unreadable),
            other => panic!("expected load error, got {:?}", other),
        }
    }
    assert!(matches!(agent.summarize("abates").await, Err(AgentError::Load(_))));
    assert_eq!(backend.calls(), 0);
}

#[tokio::test]
async fn test_missing_credential_blocks_construction() {
    let err = AgentConfig::from_lookup(|_| None).unwrap_err();
    assert!(matches!(err, AgentError::Configuration(_)));
    assert!(render_error(&err).starts_with("Erro: A chave da API OpenAI não foi configurada."));
}

#[tokio::test]
async fn test_suggested_questions_use_the_answer_path() {
    let backend = StubBackend::replying(SUM_JAN_FEB);
    let agent = Arc::new(agent_over(herd(), backend.clone(), config()).await);
    let presenter = Presenter::new(Arc::clone(&agent));

    let suggested = presenter.ask_suggested(4).await.unwrap().unwrap();
    let typed = presenter.ask(SUGGESTED_QUESTIONS[4]).await.unwrap();

    assert_eq!(suggested.question, typed.question);
    assert_eq!(suggested.plan, typed.plan);
    assert_eq!(suggested.answer.scalar(), typed.answer.scalar());
    assert_ne!(suggested.request_id, typed.request_id);

    let prompts = backend.prompts.lock().unwrap();
    assert_eq!(prompts[0], prompts[1]);
    drop(prompts);

    assert!(presenter.ask_suggested(SUGGESTED_QUESTIONS.len()).await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_questions_get_independent_results() {
    let backend = StubBackend::replying(SUM_JAN_FEB);
    let agent = Arc::new(agent_over(herd(), backend.clone(), config()).await);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let agent = Arc::clone(&agent);
            tokio::spawn(async move { agent.answer(&format!("total Jan+Feb #{}", i)).await })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.answer.scalar(), Some(&Scalar::Int(30)));
        ids.push(result.request_id);
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 8);
    assert_eq!(backend.calls(), 8);
}

#[tokio::test]
async fn test_answer_with_rejects_dataset_without_rows() {
    let backend = StubBackend::replying(SUM_JAN_FEB);
    let agent = agent_over(herd(), backend.clone(), config()).await;

    let empty = df![
        "month" => Vec::<&str>::new(),
        "headCount" => Vec::<i64>::new()
    ]
    .unwrap();
    let err = agent
        .answer_with(&Dataset::new("vazio.xlsx", empty, None), "total Jan+Feb")
        .await
        .unwrap_err();
    assert_eq!(
        err,
        AgentError::EmptyDataset {
            source_key: "vazio.xlsx".to_string()
        }
    );
    assert_eq!(backend.calls(), 0);

    let subset = Dataset::new("recorte.xlsx", herd(), None);
    let result = agent.answer_with(&subset, "total Jan+Feb").await.unwrap();
    assert_eq!(result.answer.scalar(), Some(&Scalar::Int(30)));
    assert_eq!(backend.calls(), 1);
}

fn rewrite(path: &std::path::Path, contents: &str) {
    std::fs::write(path, contents).unwrap();
    std::fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(SystemTime::now() + Duration::from_secs(10))
        .unwrap();
}

#[tokio::test]
async fn test_reload_picks_up_rewritten_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("abates.csv");
    std::fs::write(&path, "month,headCount\nJan,10\nFeb,20\nMar,30\n").unwrap();

    let backend = StubBackend::replying(SUM_JAN_FEB);
    let cache = Arc::new(DatasetCache::for_files());
    let key = path.to_str().unwrap();
    let agent = QueryAgent::with_backend(backend, config(), Arc::clone(&cache), key).await;
    assert_eq!(agent.source_key(), key);
    assert_eq!(agent.answer("total").await.unwrap().answer.scalar(), Some(&Scalar::Int(30)));

    rewrite(&path, "month,headCount\nJan,100\nFeb,20\n");
    let stale = agent.answer("total").await.unwrap();
    assert_eq!(stale.answer.scalar(), Some(&Scalar::Int(30)));

    let reloaded = agent.reload().await.unwrap();
    assert_eq!(reloaded.height(), 2);
    assert!(agent.current_dataset().unwrap().same_snapshot(&reloaded));
    assert_eq!(agent.answer("total").await.unwrap().answer.scalar(), Some(&Scalar::Int(120)));
    assert_eq!(cache.fill_count(), 2);
}

#[tokio::test]
async fn test_revalidating_agent_answers_from_changed_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("abates.csv");
    std::fs::write(&path, "month,headCount\nJan,10\nFeb,20\n").unwrap();

    let mut config = config();
    config.revalidate_source = true;
    let cache = Arc::new(DatasetCache::for_files().with_revalidation(true));
    let backend = StubBackend::replying(SUM_JAN_FEB);
    let agent =
        QueryAgent::with_backend(backend, config, Arc::clone(&cache), path.to_str().unwrap()).await;
    assert_eq!(agent.answer("total").await.unwrap().answer.scalar(), Some(&Scalar::Int(30)));

    rewrite(&path, "month,headCount\nJan,100\nFeb,20\n");
    assert_eq!(agent.answer("total").await.unwrap().answer.scalar(), Some(&Scalar::Int(120)));
    assert_eq!(agent.current_dataset().unwrap().height(), 2);
    assert_eq!(cache.fill_count(), 2);
}
