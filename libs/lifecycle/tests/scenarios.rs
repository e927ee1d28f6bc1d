//! End-to-end reconcile scenarios against the in-memory store.
//!
//! Each test seeds one object, runs the engine once (or twice) and checks the
//! returned requeue, the stored object and the writes the store received.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mesh_lifecycle::conditions::MESSAGE_RESOURCE_PROCESSING;
use mesh_lifecycle::{
    ConditionStatus, LifecycleManager, LifecycleManagerBuilder, ObjectKey, ReconcileError,
    StepResult, REFRESH_LABEL,
};
use mesh_testing::{init_tracing, CallLog, FixedJitter, InMemoryStore, ScriptedSubroutine, TestObject};
use tokio_util::sync::CancellationToken;

fn builder(store: &Arc<InMemoryStore<TestObject>>) -> LifecycleManagerBuilder<TestObject> {
    LifecycleManager::builder("mesh-operator", "test-controller", store.clone())
}

async fn reconcile(
    manager: &LifecycleManager<TestObject>,
    key: &ObjectKey,
) -> Result<Duration, ReconcileError> {
    manager.reconcile(key, CancellationToken::new()).await
}

#[tokio::test]
async fn test_simple_status_mutation() {
    init_tracing();
    let obj = TestObject::new("ns", "a").with_some("x");
    let key = obj.key();
    let store = Arc::new(InMemoryStore::with_object(obj));

    let manager = builder(&store)
        .conditions()
        .subroutine(
            ScriptedSubroutine::new("mutate").on_process(|_, obj: &mut TestObject| {
                obj.status.some = "y".to_string();
                StepResult::ok()
            }),
        )
        .build()
        .unwrap();

    let requeue = reconcile(&manager, &key).await.unwrap();

    assert_eq!(requeue, Duration::ZERO);
    assert_eq!(store.status_update_count(), 1);
    assert!(store.patches().is_empty());

    let stored = store.object(&key).unwrap();
    assert_eq!(stored.status.some, "y");
    let ready = stored.condition("Ready").unwrap();
    assert_eq!(ready.status, ConditionStatus::True);
    assert_eq!(
        stored.condition("mutate_Ready").unwrap().status,
        ConditionStatus::True
    );
}

#[tokio::test]
async fn test_spread_steady_state_is_parked() {
    init_tracing();
    let obj = TestObject::new("ns", "a")
        .with_observed_generation(1)
        .with_next_reconcile_time(Utc::now() + chrono::Duration::minutes(60));
    let key = obj.key();
    let store = Arc::new(InMemoryStore::with_object(obj));
    let log = CallLog::new();

    let manager = builder(&store)
        .conditions()
        .spread()
        .subroutine(ScriptedSubroutine::new("step").log_to(&log))
        .build()
        .unwrap();

    let requeue = reconcile(&manager, &key).await.unwrap();

    assert!(requeue > Duration::from_secs(59 * 60), "got {requeue:?}");
    assert!(requeue <= Duration::from_secs(60 * 60), "got {requeue:?}");
    assert!(log.calls().is_empty());
    assert_eq!(store.status_update_count(), 0);
    assert!(store.patches().is_empty());
}

#[tokio::test]
async fn test_refresh_label_wakes_parked_object() {
    init_tracing();
    let obj = TestObject::new("ns", "a")
        .with_observed_generation(1)
        .with_next_reconcile_time(Utc::now() + chrono::Duration::minutes(60))
        .with_label(REFRESH_LABEL, "true");
    let key = obj.key();
    let store = Arc::new(InMemoryStore::with_object(obj));
    let log = CallLog::new();

    let manager = builder(&store)
        .conditions()
        .spread()
        .jitter(Arc::new(FixedJitter(12 * 60)))
        .subroutine(ScriptedSubroutine::new("step").log_to(&log))
        .build()
        .unwrap();

    let before = Utc::now();
    reconcile(&manager, &key).await.unwrap();

    assert_eq!(log.calls(), vec!["step.process"]);
    assert_eq!(store.status_update_count(), 1);

    let stored = store.object(&key).unwrap();
    assert!(!stored.metadata.labels.contains_key(REFRESH_LABEL));
    assert_eq!(stored.status.observed_generation, 1);

    let next = stored.status.next_reconcile_time.unwrap();
    assert!(next >= before + chrono::Duration::hours(12));
    assert!(next <= Utc::now() + chrono::Duration::hours(12));

    let patches = store.patches();
    assert_eq!(patches.len(), 1);
    assert_eq!(
        patches[0].patch,
        serde_json::json!({"metadata": {"labels": {REFRESH_LABEL: null}}})
    );
}

#[tokio::test]
async fn test_finalization_removes_finalizer() {
    init_tracing();
    let obj = TestObject::new("ns", "a")
        .with_finalizer("finalizer-chain")
        .with_finalizer("someone-else")
        .deleting();
    let key = obj.key();
    let store = Arc::new(InMemoryStore::with_object(obj));
    let log = CallLog::new();

    let manager = builder(&store)
        .conditions()
        .subroutine(
            ScriptedSubroutine::new("chain")
                .finalizer("finalizer-chain")
                .log_to(&log),
        )
        .build()
        .unwrap();

    let requeue = reconcile(&manager, &key).await.unwrap();

    assert_eq!(requeue, Duration::ZERO);
    assert_eq!(log.calls(), vec!["chain.finalize"]);

    let patches = store.patches();
    assert_eq!(patches.len(), 1);
    assert_eq!(
        patches[0].patch,
        serde_json::json!({"metadata": {"finalizers": ["someone-else"]}})
    );

    let stored = store.object(&key).unwrap();
    assert_eq!(stored.metadata.finalizers, vec!["someone-else".to_string()]);
    assert_eq!(
        stored.condition("Ready").unwrap().status,
        ConditionStatus::True
    );
    assert_eq!(
        stored.condition("chain_Finalize").unwrap().status,
        ConditionStatus::True
    );
}

#[tokio::test]
async fn test_finalization_of_last_finalizer_deletes_object() {
    init_tracing();
    let obj = TestObject::new("ns", "a")
        .with_finalizer("finalizer-chain")
        .deleting();
    let key = obj.key();
    let store = Arc::new(InMemoryStore::with_object(obj));

    let manager = builder(&store)
        .conditions()
        .subroutine(ScriptedSubroutine::new("chain").finalizer("finalizer-chain"))
        .build()
        .unwrap();

    let requeue = reconcile(&manager, &key).await.unwrap();

    assert_eq!(requeue, Duration::ZERO);
    assert!(!store.contains(&key));
    assert_eq!(store.status_update_count(), 0);
}

#[tokio::test]
async fn test_mixed_errors_continue_chain() {
    init_tracing();
    let obj = TestObject::new("ns", "a");
    let key = obj.key();
    let store = Arc::new(InMemoryStore::with_object(obj));
    let log = CallLog::new();

    let manager = builder(&store)
        .conditions()
        .subroutine(ScriptedSubroutine::new("a").log_to(&log))
        .subroutine(
            ScriptedSubroutine::new("b")
                .on_process(|_, _: &mut TestObject| StepResult::fail(anyhow::anyhow!("x")))
                .log_to(&log),
        )
        .subroutine(ScriptedSubroutine::new("c").log_to(&log))
        .build()
        .unwrap();

    let requeue = reconcile(&manager, &key).await.unwrap();

    assert_eq!(requeue, Duration::ZERO);
    assert_eq!(log.calls(), vec!["a.process", "b.process", "c.process"]);

    let stored = store.object(&key).unwrap();
    assert_eq!(stored.condition("a_Ready").unwrap().status, ConditionStatus::True);
    assert_eq!(stored.condition("c_Ready").unwrap().status, ConditionStatus::True);

    let b = stored.condition("b_Ready").unwrap();
    assert_eq!(b.status, ConditionStatus::False);
    assert_eq!(b.reason, "Error");
    assert_eq!(b.message, "The subroutine has an error: x");

    assert_eq!(stored.condition("Ready").unwrap().status, ConditionStatus::False);
}

#[tokio::test]
async fn test_minimum_requeue_wins() {
    init_tracing();
    let obj = TestObject::new("ns", "a");
    let key = obj.key();
    let store = Arc::new(InMemoryStore::with_object(obj));

    let manager = builder(&store)
        .conditions()
        .subroutine(
            ScriptedSubroutine::new("slow")
                .on_process(|_, _: &mut TestObject| StepResult::requeue(Duration::from_secs(30))),
        )
        .subroutine(
            ScriptedSubroutine::new("fast")
                .on_process(|_, _: &mut TestObject| StepResult::requeue(Duration::from_secs(10))),
        )
        .build()
        .unwrap();

    let requeue = reconcile(&manager, &key).await.unwrap();

    assert_eq!(requeue, Duration::from_secs(10));

    let stored = store.object(&key).unwrap();
    let ready = stored.condition("Ready").unwrap();
    assert_eq!(ready.status, ConditionStatus::False);
    assert_eq!(ready.message, MESSAGE_RESOURCE_PROCESSING);
    assert_eq!(
        stored.condition("slow_Ready").unwrap().status,
        ConditionStatus::Unknown
    );
}

#[tokio::test]
async fn test_not_found_is_success() {
    init_tracing();
    let store = Arc::new(InMemoryStore::<TestObject>::new());
    let manager = builder(&store).conditions().build().unwrap();

    let requeue = reconcile(&manager, &ObjectKey::namespaced("ns", "gone"))
        .await
        .unwrap();

    assert_eq!(requeue, Duration::ZERO);
    assert!(store.patches().is_empty());
    assert_eq!(store.status_update_count(), 0);
}

#[tokio::test]
async fn test_empty_chain_sets_ready() {
    init_tracing();
    let obj = TestObject::new("ns", "a");
    let key = obj.key();
    let store = Arc::new(InMemoryStore::with_object(obj));
    let manager = builder(&store).conditions().build().unwrap();

    reconcile(&manager, &key).await.unwrap();

    let stored = store.object(&key).unwrap();
    assert_eq!(stored.status.conditions.len(), 1);
    assert_eq!(stored.condition("Ready").unwrap().status, ConditionStatus::True);
}

#[tokio::test]
async fn test_deleting_without_finalizers_skips_steps() {
    init_tracing();
    let obj = TestObject::new("ns", "a")
        .with_finalizer("unrelated")
        .deleting();
    let key = obj.key();
    let store = Arc::new(InMemoryStore::with_object(obj));
    let log = CallLog::new();

    let manager = builder(&store)
        .conditions()
        .subroutine(ScriptedSubroutine::new("a").finalizer("a-finalizer").log_to(&log))
        .subroutine(ScriptedSubroutine::new("b").finalizer("b-finalizer").log_to(&log))
        .build()
        .unwrap();

    reconcile(&manager, &key).await.unwrap();

    assert!(log.calls().is_empty());
    assert!(store.patches().is_empty());

    let stored = store.object(&key).unwrap();
    assert_eq!(stored.condition("a_Finalize").unwrap().status, ConditionStatus::True);
    assert_eq!(stored.condition("b_Finalize").unwrap().status, ConditionStatus::True);
}

#[tokio::test]
async fn test_retry_in_first_step_persists_and_fails() {
    init_tracing();
    let obj = TestObject::new("ns", "a");
    let key = obj.key();
    let store = Arc::new(InMemoryStore::with_object(obj));
    let log = CallLog::new();

    let manager = builder(&store)
        .conditions()
        .subroutine(
            ScriptedSubroutine::new("first")
                .on_process(|_, _: &mut TestObject| {
                    StepResult::retry_after(anyhow::anyhow!("backend down"), Duration::from_secs(7))
                })
                .log_to(&log),
        )
        .subroutine(ScriptedSubroutine::new("second").log_to(&log))
        .build()
        .unwrap();

    let err = reconcile(&manager, &key).await.unwrap_err();

    assert!(matches!(
        &err,
        ReconcileError::Subroutine { subroutine, .. } if subroutine == "first"
    ));
    assert_eq!(err.requeue_after(), Duration::from_secs(7));
    assert_eq!(log.calls(), vec!["first.process"]);
    assert_eq!(store.status_update_count(), 1);

    let stored = store.object(&key).unwrap();
    assert_eq!(stored.condition("Ready").unwrap().status, ConditionStatus::False);
    assert_eq!(stored.condition("first_Ready").unwrap().status, ConditionStatus::False);
    assert!(stored.condition("second_Ready").is_none());
}

#[tokio::test]
async fn test_second_run_is_idempotent() {
    init_tracing();
    let obj = TestObject::new("ns", "a");
    let key = obj.key();
    let store = Arc::new(InMemoryStore::with_object(obj));

    let manager = builder(&store)
        .conditions()
        .subroutine(ScriptedSubroutine::new("a").finalizer("a-finalizer"))
        .subroutine(ScriptedSubroutine::new("b"))
        .build()
        .unwrap();

    reconcile(&manager, &key).await.unwrap();
    let first = store.object(&key).unwrap();
    assert_eq!(store.patches().len(), 1);
    assert_eq!(store.status_update_count(), 1);

    store.clear_history();
    reconcile(&manager, &key).await.unwrap();

    assert!(store.patches().is_empty());
    assert_eq!(store.status_update_count(), 0);
    assert_eq!(store.object(&key).unwrap().status, first.status);
}

#[tokio::test]
async fn test_stop_chain_skips_rest() {
    init_tracing();
    let obj = TestObject::new("ns", "a");
    let key = obj.key();
    let store = Arc::new(InMemoryStore::with_object(obj));
    let log = CallLog::new();

    let manager = builder(&store)
        .conditions()
        .subroutine(
            ScriptedSubroutine::new("gate")
                .on_process(|_, _: &mut TestObject| StepResult::stop("waiting for dependency"))
                .log_to(&log),
        )
        .subroutine(ScriptedSubroutine::new("after").log_to(&log))
        .build()
        .unwrap();

    let requeue = reconcile(&manager, &key).await.unwrap();

    assert_eq!(requeue, Duration::ZERO);
    assert_eq!(log.calls(), vec!["gate.process"]);

    let stored = store.object(&key).unwrap();
    assert_eq!(stored.condition("Ready").unwrap().status, ConditionStatus::True);
    assert!(stored.condition("after_Ready").is_none());
}

#[tokio::test]
async fn test_error_stop_breaks_chain() {
    init_tracing();
    let obj = TestObject::new("ns", "a");
    let key = obj.key();
    let store = Arc::new(InMemoryStore::with_object(obj));
    let log = CallLog::new();

    let manager = builder(&store)
        .conditions()
        .subroutine(
            ScriptedSubroutine::new("broken")
                .on_process(|_, _: &mut TestObject| {
                    StepResult::stop_with_error(anyhow::anyhow!("invalid spec"), "invalid spec")
                })
                .log_to(&log),
        )
        .subroutine(ScriptedSubroutine::new("after").log_to(&log))
        .build()
        .unwrap();

    let requeue = reconcile(&manager, &key).await.unwrap();

    assert_eq!(requeue, Duration::ZERO);
    assert_eq!(log.calls(), vec!["broken.process"]);
    let stored = store.object(&key).unwrap();
    assert_eq!(stored.condition("Ready").unwrap().status, ConditionStatus::False);
}
