//! Integration tests driving the full scheduler through mock collaborators:
//! raw JSON bodies go in on the ingress streams, dispatches and persistence
//! calls come out.


use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use dispatch_lite::config::SchedulerConfig;
use dispatch_lite::TaskManager;
use test_support::{
    assert_eventually, IngressHandles, MockConsumer, MockPersistence, MockProducer,
};

const WAIT: Duration = Duration::from_secs(2);

struct Harness {
    manager: TaskManager,
    ingress: IngressHandles,
    producer: Arc<MockProducer>,
    persistence: Arc<MockPersistence>,
    shutdown: CancellationToken,
}

async fn start_scheduler(persistence: Arc<MockPersistence>) -> Harness {
    let shutdown = CancellationToken::new();
    let (consumer, ingress) = MockConsumer::new(shutdown.clone());
    let producer = MockProducer::new();
    let manager = TaskManager::init(
        SchedulerConfig::default(),
        consumer,
        producer.clone(),
        persistence.clone(),
        shutdown.clone(),
    )
    .await
    .expect("manager init");
    manager.start();

    Harness {
        manager,
        ingress,
        producer,
        persistence,
        shutdown,
    }
}

fn default_catalog() -> serde_json::Value {
    json!([
        {"type": "A", "weight": 5},
        {"type": "B", "weight": 3},
        {"type": "C", "weight": 1},
    ])
}

fn add_task_body(task_type: &str, delay: u32) -> Vec<u8> {
    json!({
        "meta": {
            "action": "ADD_TASK",
            "taskType": task_type,
            "maxRetry": 0,
            "delay": delay,
        }
    })
    .to_string()
    .into_bytes()
}

fn completion_body(task_id: &str, server_id: &str, task_type: &str) -> Vec<u8> {
    json!({
        "id": task_id,
        "meta": {
            "action": "COMPLETE_TASK",
            "taskType": task_type,
            "serverId": server_id,
        }
    })
    .to_string()
    .into_bytes()
}

fn join_body(server_id: &str, status: i32) -> Vec<u8> {
    json!({ "serverId": server_id, "status": status })
        .to_string()
        .into_bytes()
}

/// A worker joins, a task arrives, and the dispatch carries the id that
/// persistence assigned, never anything producer-supplied.
#[tokio::test]
async fn test_join_then_task_dispatches_with_persisted_id() {
    let h = start_scheduler(MockPersistence::new(default_catalog())).await;

    h.ingress.joins.send(join_body("w1", 1)).await.unwrap();
    assert_eventually(
        || async { h.manager.worker_count().await == 1 },
        WAIT,
        "worker should join",
    )
    .await;

    h.ingress.tasks.send(add_task_body("A", 0)).await.unwrap();
    assert_eventually(
        || async { h.producer.sent_count().await == 1 },
        WAIT,
        "task should dispatch",
    )
    .await;

    let sent = h.producer.sent().await;
    let saved = h.persistence.saved().await;
    assert_eq!(saved.len(), 1);
    assert_eq!(sent[0].0, saved[0].0, "dispatch must carry the persisted id");
    assert_eq!(sent[0].1, "w1");
    assert_eq!(h.manager.worker_load("w1").await, Some(5));
}

/// With an empty fleet the task persists but is not dispatched; once a
/// worker joins, a re-submitted task goes out.
#[tokio::test]
async fn test_empty_fleet_leaves_task_pending() {
    let h = start_scheduler(MockPersistence::new(default_catalog())).await;

    h.ingress.tasks.send(add_task_body("A", 0)).await.unwrap();
    assert_eventually(
        || async { h.persistence.saved_count().await == 1 },
        WAIT,
        "task should persist even with no workers",
    )
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.producer.sent_count().await, 0);

    h.ingress.joins.send(join_body("w1", 1)).await.unwrap();
    assert_eventually(
        || async { h.manager.worker_count().await == 1 },
        WAIT,
        "worker should join",
    )
    .await;
    h.ingress.tasks.send(add_task_body("A", 0)).await.unwrap();
    assert_eventually(
        || async { h.producer.sent_count().await == 1 },
        WAIT,
        "re-submitted task should dispatch after join",
    )
    .await;
    assert_eq!(h.producer.sent().await[0].1, "w1");
}

/// Unknown task types persist but never dispatch and never touch load.
#[tokio::test]
async fn test_unknown_type_dropped_after_persist() {
    let h = start_scheduler(MockPersistence::new(json!([{"type": "A", "weight": 5}]))).await;

    h.ingress.joins.send(join_body("w1", 1)).await.unwrap();
    assert_eventually(
        || async { h.manager.worker_count().await == 1 },
        WAIT,
        "worker should join",
    )
    .await;
    h.ingress.tasks.send(add_task_body("Z", 0)).await.unwrap();

    assert_eventually(
        || async { h.persistence.saved_count().await == 1 },
        WAIT,
        "save_task should be called exactly once",
    )
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.producer.sent_count().await, 0);
    assert_eq!(h.manager.worker_load("w1").await, Some(0));
}

/// A completion reverses the dispatched weight and marks the task complete
/// exactly once.
#[tokio::test]
async fn test_completion_decrements_and_marks_complete() {
    let h = start_scheduler(MockPersistence::new(default_catalog())).await;

    h.ingress.joins.send(join_body("w1", 1)).await.unwrap();
    assert_eventually(
        || async { h.manager.worker_count().await == 1 },
        WAIT,
        "worker should join",
    )
    .await;
    h.ingress.tasks.send(add_task_body("A", 0)).await.unwrap();
    assert_eventually(
        || async { h.producer.sent_count().await == 1 },
        WAIT,
        "task should dispatch",
    )
    .await;
    let (task_id, server_id) = h.producer.sent().await[0].clone();
    assert_eq!(h.manager.worker_load("w1").await, Some(5));

    h.ingress
        .completions
        .send(completion_body(&task_id, &server_id, "A"))
        .await
        .unwrap();
    assert_eventually(
        || async { h.manager.worker_load("w1").await == Some(0) },
        WAIT,
        "completion should release the weight",
    )
    .await;
    assert_eq!(h.persistence.completed().await, vec![task_id]);
}

/// save_task failure drops the task: no dispatch, nothing parked.
#[tokio::test]
async fn test_save_failure_drops_task() {
    let h = start_scheduler(MockPersistence::new(default_catalog())).await;
    h.persistence.fail_saves(true);

    h.ingress.joins.send(join_body("w1", 1)).await.unwrap();
    h.ingress.tasks.send(add_task_body("A", 0)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.producer.sent_count().await, 0);
    assert_eq!(h.manager.delayed_count().await, 0);
    assert_eq!(h.persistence.saved_count().await, 0);
}

/// Malformed bodies and unknown actions are skipped without killing the
/// stream.
#[tokio::test]
async fn test_bad_messages_do_not_kill_the_stream() {
    let h = start_scheduler(MockPersistence::new(default_catalog())).await;
    h.ingress.joins.send(join_body("w1", 1)).await.unwrap();
    assert_eventually(
        || async { h.manager.worker_count().await == 1 },
        WAIT,
        "worker should join",
    )
    .await;

    h.ingress.tasks.send(b"{not json".to_vec()).await.unwrap();
    h.ingress
        .tasks
        .send(
            json!({"meta": {"action": "REMOVE_TASK", "taskType": "A"}})
                .to_string()
                .into_bytes(),
        )
        .await
        .unwrap();
    h.ingress.tasks.send(add_task_body("A", 0)).await.unwrap();

    assert_eventually(
        || async { h.producer.sent_count().await == 1 },
        WAIT,
        "valid task after garbage should still dispatch",
    )
    .await;
    assert_eq!(h.persistence.saved_count().await, 1);
}

/// After a leave event the departed worker receives nothing.
#[tokio::test]
async fn test_leave_excludes_worker_from_placement() {
    let h = start_scheduler(MockPersistence::new(default_catalog())).await;

    h.ingress.joins.send(join_body("w1", 1)).await.unwrap();
    h.ingress.joins.send(join_body("w2", 1)).await.unwrap();
    assert_eventually(
        || async { h.manager.worker_count().await == 2 },
        WAIT,
        "both workers should join",
    )
    .await;

    h.ingress.joins.send(join_body("w1", 0)).await.unwrap();
    assert_eventually(
        || async { h.manager.worker_count().await == 1 },
        WAIT,
        "w1 should leave",
    )
    .await;

    for _ in 0..3 {
        h.ingress.tasks.send(add_task_body("B", 0)).await.unwrap();
    }
    assert_eventually(
        || async { h.producer.sent_count().await == 3 },
        WAIT,
        "tasks should dispatch",
    )
    .await;
    assert!(h.producer.sent().await.iter().all(|(_, sid)| sid == "w2"));
}

/// Recovery seeds the fleet from persistence and re-submits pending tasks
/// with their existing ids, without re-persisting them.
#[tokio::test]
async fn test_recovery_seeds_fleet_and_resubmits_pending() {
    let persistence = MockPersistence::with_pending(
        default_catalog(),
        json!([{"serverId": "w1"}, {"serverId": "w2"}]),
        json!([
            {"id": "P1", "meta": {"action": "ADD_TASK", "taskType": "A", "maxRetry": 0, "delay": 0}},
        ]),
    );
    let h = start_scheduler(persistence).await;

    assert_eventually(
        || async { h.producer.sent_count().await == 1 },
        WAIT,
        "pending task should dispatch on recovery",
    )
    .await;

    let sent = h.producer.sent().await;
    assert_eq!(sent[0].0, "P1", "recovered task keeps its persisted id");
    assert_eq!(h.manager.worker_count().await, 2);
    assert_eq!(
        h.persistence.saved_count().await,
        0,
        "recovered tasks are not re-persisted"
    );
}

/// Delayed tasks persist immediately but park on the delay queue instead
/// of dispatching.
#[tokio::test]
async fn test_delayed_task_parks_instead_of_dispatching() {
    let h = start_scheduler(MockPersistence::new(default_catalog())).await;

    h.ingress.joins.send(join_body("w1", 1)).await.unwrap();
    h.ingress.tasks.send(add_task_body("A", 5)).await.unwrap();

    assert_eventually(
        || async { h.manager.delayed_count().await == 1 },
        WAIT,
        "task should park on the delay queue",
    )
    .await;
    assert_eq!(h.persistence.saved_count().await, 1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.producer.sent_count().await, 0);
}

/// The embedding surface follows the same persist-then-assign flow and
/// surfaces decode errors to the caller.
#[tokio::test]
async fn test_add_task_direct_injection() {
    let h = start_scheduler(MockPersistence::new(default_catalog())).await;
    h.ingress.joins.send(join_body("w1", 1)).await.unwrap();
    assert_eventually(
        || async { h.manager.worker_count().await == 1 },
        WAIT,
        "worker should join",
    )
    .await;

    h.manager.add_task(&add_task_body("B", 0)).await.unwrap();
    assert_eventually(
        || async { h.producer.sent_count().await == 1 },
        WAIT,
        "injected task should dispatch",
    )
    .await;

    // Unknown actions are accepted and ignored; garbage is an error.
    h.manager
        .add_task(
            json!({"meta": {"action": "NOOP"}})
                .to_string()
                .as_bytes(),
        )
        .await
        .unwrap();
    assert!(h.manager.add_task(b"{not json").await.is_err());
    assert_eq!(h.persistence.saved_count().await, 1);
}

/// 100 weight-1 assigns and their matched completions across 4 workers
/// quiesce to zero load with exactly 100 dispatches.
#[tokio::test]
async fn test_concurrent_assigns_and_completes_quiesce() {
    let h = start_scheduler(MockPersistence::new(default_catalog())).await;

    for worker in ["w1", "w2", "w3", "w4"] {
        h.ingress.joins.send(join_body(worker, 1)).await.unwrap();
    }
    assert_eventually(
        || async { h.manager.worker_count().await == 4 },
        WAIT,
        "fleet should join",
    )
    .await;

    for _ in 0..100 {
        h.ingress.tasks.send(add_task_body("C", 0)).await.unwrap();
    }

    // Complete each dispatch as it appears, concurrently with the
    // remaining assignments.
    let producer = h.producer.clone();
    let completions = h.ingress.completions.clone();
    let completer = tokio::spawn(async move {
        let mut acked = 0usize;
        while acked < 100 {
            let sent = producer.sent().await;
            for (task_id, server_id) in sent.iter().skip(acked) {
                completions
                    .send(completion_body(task_id, server_id, "C"))
                    .await
                    .unwrap();
                acked += 1;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });

    assert_eventually(
        || async { h.producer.sent_count().await == 100 },
        Duration::from_secs(10),
        "all 100 tasks should dispatch",
    )
    .await;
    completer.await.unwrap();

    assert_eventually(
        || async {
            let mut total = 0;
            for worker in ["w1", "w2", "w3", "w4"] {
                total += h.manager.worker_load(worker).await.unwrap_or(0);
            }
            total == 0
        },
        Duration::from_secs(10),
        "all loads should quiesce to zero",
    )
    .await;
    assert_eq!(h.producer.sent_count().await, 100);
    assert_eq!(h.persistence.completed().await.len(), 100);
}

/// After the shutdown token fires, ingress is dead: nothing persists and
/// nothing dispatches.
#[tokio::test]
async fn test_shutdown_stops_all_streams() {
    let h = start_scheduler(MockPersistence::new(default_catalog())).await;
    h.ingress.joins.send(join_body("w1", 1)).await.unwrap();
    assert_eventually(
        || async { h.manager.worker_count().await == 1 },
        WAIT,
        "worker should join",
    )
    .await;

    h.shutdown.cancel();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let _ = h.ingress.tasks.send(add_task_body("A", 0)).await;
    let _ = h.ingress.joins.send(join_body("w2", 1)).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(h.persistence.saved_count().await, 0);
    assert_eq!(h.producer.sent_count().await, 0);
    assert_eq!(h.manager.worker_count().await, 1);
}
