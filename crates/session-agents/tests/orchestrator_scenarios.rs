//! End-to-end orchestrator scenarios against an in-memory store and a
//! scripted transport.

mod common;

use std::sync::Arc;
use std::time::Duration;

use unicode_segmentation::UnicodeSegmentation;

use pipeline::artifact::{ArtifactKind, ArtifactPayload};
use pipeline::status::AnalysisStatus;
use pipeline::store::{LogStatus, SessionStore, SqliteStore};
use pipeline::techniques::TechniqueLibrary;
use session_agents::config::AnalysisConfig;
use session_agents::orchestrator::Orchestrator;
use session_agents::trigger::{KindState, WaveTrigger};

use common::{cbt_session, fresh_id, FakeReply, FakeTransport};

fn harness(transport: Arc<FakeTransport>) -> (Arc<dyn SessionStore>, Arc<Orchestrator>) {
    harness_with_config(transport, test_config())
}

fn harness_with_config(
    transport: Arc<FakeTransport>,
    config: AnalysisConfig,
) -> (Arc<dyn SessionStore>, Arc<Orchestrator>) {
    let store: Arc<dyn SessionStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let techniques = Arc::new(TechniqueLibrary::builtin());
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        transport,
        techniques,
        config,
    ));
    (store, orchestrator)
}

fn test_config() -> AnalysisConfig {
    let mut config = AnalysisConfig::default();
    config.retry.max_attempts = 3;
    config.retry.base_delay = Duration::from_millis(20);
    config.retry.max_delay = Duration::from_secs(30);
    config.attempt_timeout = Duration::from_secs(5);
    config
}

fn completed_rows(entries: &[pipeline::store::LogEntry], kind: &str) -> usize {
    entries
        .iter()
        .filter(|e| e.wave_kind == kind && e.status == LogStatus::Completed)
        .count()
}

fn failed_rows(entries: &[pipeline::store::LogEntry], kind: &str) -> usize {
    entries
        .iter()
        .filter(|e| e.wave_kind == kind && e.status == LogStatus::Failed)
        .count()
}

// Scenario A: clean transcript, every analyzer succeeds first try.
#[tokio::test]
async fn happy_path_materializes_all_artifacts() {
    let transport = FakeTransport::new();
    let (store, orchestrator) = harness(transport.clone());
    let id = fresh_id();
    store.insert_session(&cbt_session(&id)).await.unwrap();

    let report = orchestrator.run(&id).await.unwrap();
    assert!(!report.skipped);
    assert_eq!(report.final_status, AnalysisStatus::Complete);

    let view = store.load(&id).await.unwrap();
    assert_eq!(view.status, AnalysisStatus::Complete);
    for kind in ArtifactKind::ALL {
        assert!(view.has_artifact(kind), "missing artifact: {kind}");
    }

    match view.artifact(ArtifactKind::Mood).unwrap().typed().unwrap() {
        ArtifactPayload::Mood(mood) => {
            assert!((0.0..=10.0).contains(&mood.score));
            assert_eq!((mood.score * 2.0).fract(), 0.0, "score not a 0.5 multiple");
            assert!((0.0..=1.0).contains(&mood.confidence));
        }
        other => panic!("wrong payload: {other:?}"),
    }
    match view.artifact(ArtifactKind::Topics).unwrap().typed().unwrap() {
        ArtifactPayload::Topics(topics) => {
            assert_eq!(topics.action_items.len(), 2);
            assert!(topics.summary.chars().count() <= 150);
        }
        other => panic!("wrong payload: {other:?}"),
    }
    match view
        .artifact(ArtifactKind::ActionSummary)
        .unwrap()
        .typed()
        .unwrap()
    {
        ArtifactPayload::ActionSummary(summary) => {
            assert!(summary.text.graphemes(true).count() <= 45);
        }
        other => panic!("wrong payload: {other:?}"),
    }
    match view.artifact(ArtifactKind::Deep).unwrap().typed().unwrap() {
        ArtifactPayload::Deep(deep) => {
            assert!(deep.analysis_confidence >= 0.5);
        }
        other => panic!("wrong payload: {other:?}"),
    }

    let entries = store.log_entries(&id).await.unwrap();
    let completed: usize = entries
        .iter()
        .filter(|e| e.status == LogStatus::Completed)
        .count();
    let failed: usize = entries
        .iter()
        .filter(|e| e.status == LogStatus::Failed)
        .count();
    assert_eq!(completed, 5);
    assert_eq!(failed, 0);

    // Cost additivity: session total equals the sum of per-artifact costs.
    let artifact_cost: f64 = view.artifacts.values().map(|a| a.cost_usd).sum();
    assert!((view.cost_usd - artifact_cost).abs() < 1e-9);
    assert!(view.cost_usd > 0.0);
}

// Scenario B: topics returns malformed output on every call. Schema failures
// consume their single strict re-prompt and go terminal; siblings are
// unaffected and downstream steps never start.
#[tokio::test]
async fn topics_failure_contains_blast_radius() {
    let transport = FakeTransport::new();
    transport.script(
        "topics",
        vec![
            FakeReply::Text("I'd rather chat about the weather.".to_string()),
            FakeReply::Text("Still not JSON, sorry.".to_string()),
        ],
    );
    let (store, orchestrator) = harness(transport.clone());
    let id = fresh_id();
    store.insert_session(&cbt_session(&id)).await.unwrap();

    let report = orchestrator.run(&id).await.unwrap();
    assert_eq!(report.final_status, AnalysisStatus::Failed);

    let view = store.load(&id).await.unwrap();
    assert!(view.has_artifact(ArtifactKind::Mood));
    assert!(view.has_artifact(ArtifactKind::Breakthrough));
    assert!(!view.has_artifact(ArtifactKind::Topics));
    assert!(!view.has_artifact(ArtifactKind::ActionSummary));
    assert!(!view.has_artifact(ArtifactKind::Deep));

    let entries = store.log_entries(&id).await.unwrap();
    assert!(failed_rows(&entries, "topics") >= 1);
    assert_eq!(completed_rows(&entries, "topics"), 0);
    assert_eq!(
        entries.iter().filter(|e| e.wave_kind == "action_summary").count(),
        0
    );
    assert_eq!(entries.iter().filter(|e| e.wave_kind == "deep").count(), 0);
    assert_eq!(transport.call_count("action_summary"), 0);
    assert_eq!(transport.call_count("deep"), 0);

    let trigger = WaveTrigger::new(store.clone(), orchestrator.clone(), 100);
    let status = trigger.status(&id).await.unwrap();
    assert_eq!(status.per_kind["topics"].state, KindState::Exhausted);
    assert_eq!(status.per_kind["deep"].state, KindState::Blocked);
    assert_eq!(status.per_kind["action_summary"].state, KindState::Blocked);
    assert_eq!(status.per_kind["mood"].state, KindState::Complete);
}

// Scenario C: two rate limits with a 1s hint, then success. Backoff honors
// the hint; siblings proceed untouched.
#[tokio::test(start_paused = true)]
async fn rate_limits_back_off_and_recover() {
    let transport = FakeTransport::new();
    transport.script(
        "mood",
        vec![FakeReply::RateLimited(1), FakeReply::RateLimited(1)],
    );
    let (store, orchestrator) = harness(transport.clone());
    let id = fresh_id();
    store.insert_session(&cbt_session(&id)).await.unwrap();

    let started = tokio::time::Instant::now();
    let report = orchestrator.run(&id).await.unwrap();
    assert_eq!(report.final_status, AnalysisStatus::Complete);
    assert!(
        started.elapsed() >= Duration::from_secs(2),
        "backoff should honor the retry_after hints"
    );

    let entries = store.log_entries(&id).await.unwrap();
    assert_eq!(failed_rows(&entries, "mood"), 2);
    assert_eq!(completed_rows(&entries, "mood"), 1);
    assert_eq!(failed_rows(&entries, "topics"), 0);
    assert_eq!(failed_rows(&entries, "breakthrough"), 0);

    let rate_limit_errors = entries
        .iter()
        .filter(|e| {
            e.wave_kind == "mood"
                && e.error.as_deref().is_some_and(|m| m.contains("rate_limit"))
        })
        .count();
    assert_eq!(rate_limit_errors, 2);
}

// Scenario D: retry a failed topics kind with a fixed analyzer; the rest of
// the pipeline resumes and earlier artifacts are untouched.
#[tokio::test]
async fn retry_after_partial_failure_completes_session() {
    let transport = FakeTransport::new();
    transport.script(
        "topics",
        vec![
            FakeReply::Text("not json".to_string()),
            FakeReply::Text("still not json".to_string()),
        ],
    );
    let (store, orchestrator) = harness(transport.clone());
    let id = fresh_id();
    store.insert_session(&cbt_session(&id)).await.unwrap();

    let report = orchestrator.run(&id).await.unwrap();
    assert_eq!(report.final_status, AnalysisStatus::Failed);

    let before = store.load(&id).await.unwrap();
    let mood_at = before.artifact(ArtifactKind::Mood).unwrap().produced_at;
    let breakthrough_at = before
        .artifact(ArtifactKind::Breakthrough)
        .unwrap()
        .produced_at;

    // The scripted failures are spent; the transport now answers well-formed.
    let report = orchestrator
        .rerun(&id, Some(&[ArtifactKind::Topics]))
        .await
        .unwrap();
    assert_eq!(report.final_status, AnalysisStatus::Complete);

    let after = store.load(&id).await.unwrap();
    for kind in ArtifactKind::ALL {
        assert!(after.has_artifact(kind), "missing artifact: {kind}");
    }
    assert_eq!(after.artifact(ArtifactKind::Mood).unwrap().produced_at, mood_at);
    assert_eq!(
        after
            .artifact(ArtifactKind::Breakthrough)
            .unwrap()
            .produced_at,
        breakthrough_at
    );

    // Sequencing: the summary is derived from topics, so it cannot predate it.
    let topics_at = after.artifact(ArtifactKind::Topics).unwrap().produced_at;
    let summary_at = after
        .artifact(ArtifactKind::ActionSummary)
        .unwrap()
        .produced_at;
    assert!(summary_at >= topics_at);
}

// Scenario E: duplicate concurrent triggers collapse to one run.
#[tokio::test]
async fn concurrent_duplicate_triggers_run_once() {
    let transport = FakeTransport::new();
    let (store, orchestrator) = harness(transport.clone());
    let id = fresh_id();
    store.insert_session(&cbt_session(&id)).await.unwrap();

    let (r1, r2) = tokio::join!(orchestrator.run(&id), orchestrator.run(&id));
    let reports = [r1.unwrap(), r2.unwrap()];
    assert_eq!(
        reports.iter().filter(|r| !r.skipped).count(),
        1,
        "exactly one trigger should win admission"
    );

    let entries = store.log_entries(&id).await.unwrap();
    for kind in ArtifactKind::ALL {
        assert_eq!(
            completed_rows(&entries, kind.as_str()),
            1,
            "duplicate work for {kind}"
        );
    }
    assert_eq!(
        store.load(&id).await.unwrap().status,
        AnalysisStatus::Complete
    );
}

// Scenario F: unknown technique id is carried as free text and blocks nothing.
#[tokio::test]
async fn unknown_technique_is_tolerated() {
    let transport = FakeTransport::new();
    transport.script(
        "topics",
        vec![FakeReply::Json(serde_json::json!({
            "topics": ["grief"],
            "action_items": ["Write a letter", "Take a daily walk"],
            "technique_id": "somatic_wave_riding",
            "summary": "Processed grief around the anniversary.",
            "extraction_confidence": 0.7
        }))],
    );
    let (store, orchestrator) = harness(transport.clone());
    let id = fresh_id();
    store.insert_session(&cbt_session(&id)).await.unwrap();

    let report = orchestrator.run(&id).await.unwrap();
    assert_eq!(report.final_status, AnalysisStatus::Complete);

    let view = store.load(&id).await.unwrap();
    let technique_id = match view.artifact(ArtifactKind::Topics).unwrap().typed().unwrap() {
        ArtifactPayload::Topics(t) => t.technique_id,
        other => panic!("wrong payload: {other:?}"),
    };
    assert_eq!(technique_id, "somatic_wave_riding");
    assert!(TechniqueLibrary::builtin().lookup(&technique_id).is_none());
    assert!(view.has_artifact(ArtifactKind::Deep));
}

// Guardrail: a low-confidence breakthrough is reported as none.
#[tokio::test]
async fn low_confidence_breakthrough_is_suppressed() {
    let transport = FakeTransport::new();
    transport.script(
        "breakthrough",
        vec![FakeReply::Json(serde_json::json!({
            "has_breakthrough": true,
            "primary": {
                "type": "emotional_shift",
                "description": "Possibly softened toward their father",
                "evidence": "Tone may have changed around 05:00",
                "confidence": 0.3,
                "timestamp_start": 300.0,
                "timestamp_end": 320.0,
                "dialogue_excerpt": "I guess he tried, sometimes."
            },
            "all_breakthroughs": []
        }))],
    );
    let (store, orchestrator) = harness(transport.clone());
    let id = fresh_id();
    store.insert_session(&cbt_session(&id)).await.unwrap();

    orchestrator.run(&id).await.unwrap();

    let view = store.load(&id).await.unwrap();
    match view
        .artifact(ArtifactKind::Breakthrough)
        .unwrap()
        .typed()
        .unwrap()
    {
        ArtifactPayload::Breakthrough(b) => {
            assert!(!b.has_breakthrough);
            assert!(b.primary.is_none());
        }
        other => panic!("wrong payload: {other:?}"),
    }
}

// Overlong action summaries are cut on grapheme boundaries.
#[tokio::test]
async fn action_summary_truncates_to_display_cap() {
    let transport = FakeTransport::new();
    transport.script(
        "action_summary",
        vec![FakeReply::Json(serde_json::json!({
            "text": "Practice the full thought-record protocol every single evening before bed 📝🧘"
        }))],
    );
    let (store, orchestrator) = harness(transport.clone());
    let id = fresh_id();
    store.insert_session(&cbt_session(&id)).await.unwrap();

    orchestrator.run(&id).await.unwrap();

    let view = store.load(&id).await.unwrap();
    match view
        .artifact(ArtifactKind::ActionSummary)
        .unwrap()
        .typed()
        .unwrap()
    {
        ArtifactPayload::ActionSummary(s) => {
            assert_eq!(s.text.graphemes(true).count(), 45);
        }
        other => panic!("wrong payload: {other:?}"),
    }
}

// A configured model override routes the call to the named model while cost
// still comes from the task's tier pricing.
#[tokio::test]
async fn model_override_routes_and_still_prices() {
    let transport = FakeTransport::new();
    let mut config = test_config();
    config
        .model_overrides
        .insert(ArtifactKind::Mood, "local-mood-ft".to_string());
    let (store, orchestrator) = harness_with_config(transport.clone(), config);
    let id = fresh_id();
    store.insert_session(&cbt_session(&id)).await.unwrap();

    let report = orchestrator.run(&id).await.unwrap();
    assert_eq!(report.final_status, AnalysisStatus::Complete);

    let view = store.load(&id).await.unwrap();
    let mood = view.artifact(ArtifactKind::Mood).unwrap();
    assert_eq!(mood.model_id, "local-mood-ft");
    assert!(mood.cost_usd > 0.0);
    // Non-overridden kinds still route through the tier tables.
    assert_ne!(
        view.artifact(ArtifactKind::Topics).unwrap().model_id,
        "local-mood-ft"
    );
}

// Idempotence: a second run over a complete session changes nothing.
#[tokio::test]
async fn rerun_on_terminal_session_is_a_noop() {
    let transport = FakeTransport::new();
    let (store, orchestrator) = harness(transport.clone());
    let id = fresh_id();
    store.insert_session(&cbt_session(&id)).await.unwrap();

    orchestrator.run(&id).await.unwrap();
    let first = store.load(&id).await.unwrap();
    let calls_after_first = transport.calls.lock().unwrap().len();

    let report = orchestrator.run(&id).await.unwrap();
    assert!(report.skipped);

    let second = store.load(&id).await.unwrap();
    assert_eq!(transport.calls.lock().unwrap().len(), calls_after_first);
    for kind in ArtifactKind::ALL {
        assert_eq!(
            first.artifact(kind).unwrap().produced_at,
            second.artifact(kind).unwrap().produced_at
        );
    }
}
