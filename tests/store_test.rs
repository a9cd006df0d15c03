mod helpers;

use cairn::memory::temporal::TemporalManager;
use cairn::memory::types::{now, KnowledgeKind, Scope};
use cairn::memory::{FragmentContent, MemoryError, NewFragment};
use chrono::Duration;
use helpers::{error_handling, memory, AGENT};

#[tokio::test]
async fn stored_fragment_round_trips_with_initial_scores() {
    let memory = memory();
    let new = error_handling("inst-a", "Wrap errors with context", 0.7)
        .with_confidence(0.8)
        .with_scope(Scope::Project("billing".into()));
    let id = memory.store_memory(new).await.unwrap();
    memory.settle().await;

    let f = memory.get_fragment(&id).await.unwrap();
    assert_eq!(f.agent_type, AGENT);
    assert_eq!(f.kind, KnowledgeKind::Procedural);
    assert_eq!(f.scope, Scope::Project("billing".into()));
    assert_eq!(f.contributors, vec!["inst-a".to_string()]);
    assert_eq!(f.version, 1);
    assert!((f.quality_score - 0.7).abs() < 1e-9);
    assert!((f.quality.confidence - 0.8).abs() < 1e-9);
    assert!(f.superseded_by.is_none());

    let inspection = memory.inspect(&id).await.unwrap();
    assert_eq!(inspection.snapshots.len(), 1);
    assert_eq!(inspection.snapshots[0].reason, "create");
    assert!(inspection.log.iter().any(|e| e.operation == "create"));
}

#[tokio::test]
async fn invalid_submissions_are_rejected_before_any_write() {
    let memory = memory();

    let no_pattern = NewFragment::new(AGENT, "inst", KnowledgeKind::Meta, FragmentContent::new("", "why"));
    assert!(matches!(
        memory.store_memory(no_pattern).await,
        Err(MemoryError::Validation(_))
    ));

    let bad_confidence = error_handling("inst", "Wrap errors", 0.5).with_confidence(1.5);
    assert!(matches!(
        memory.store_memory(bad_confidence).await,
        Err(MemoryError::Validation(_))
    ));

    let backwards = error_handling("inst", "Wrap errors", 0.5)
        .with_validity(Some(now()), Some(now() - Duration::days(1)));
    assert!(matches!(
        memory.store_memory(backwards).await,
        Err(MemoryError::Validation(_))
    ));

    let stats = memory.get_statistics(AGENT, None).await.unwrap();
    assert_eq!(stats.total_fragments, 0);
}

#[tokio::test]
async fn supersession_cycles_are_rejected() {
    let memory = memory();
    let temporal = TemporalManager::new(&memory.config().temporal);
    let a = memory
        .store_memory(error_handling("inst", "Error handling rule one", 0.5))
        .await
        .unwrap();
    let b = memory
        .store_memory(error_handling("inst", "Error handling rule two", 0.5))
        .await
        .unwrap();
    let c = memory
        .store_memory(error_handling("inst", "Error handling rule three", 0.5))
        .await
        .unwrap();
    memory.settle().await;

    temporal.supersede(memory.store(), &b, &a, "test", now()).unwrap();
    temporal.supersede(memory.store(), &c, &b, "test", now()).unwrap();

    let err = temporal.supersede(memory.store(), &a, &c, "test", now()).unwrap_err();
    assert!(matches!(err, MemoryError::SupersessionCycle { .. }));
    let err = temporal.supersede(memory.store(), &a, &a, "test", now()).unwrap_err();
    assert!(matches!(err, MemoryError::SupersessionCycle { .. }));

    // the rejected edge left nothing behind
    assert!(memory.get_fragment(&c).await.unwrap().superseded_by.is_none());
    assert_eq!(
        memory.get_fragment(&a).await.unwrap().superseded_by.as_deref(),
        Some(b.as_str())
    );
}

#[tokio::test]
async fn unknown_fragment_is_not_found() {
    let memory = memory();
    assert!(matches!(
        memory.get_fragment("missing").await,
        Err(MemoryError::NotFound(_))
    ));
}
