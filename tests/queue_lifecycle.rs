//! End-to-end scenarios exercising crash recovery, retry exhaustion,
//! supersede semantics, dead-letter replay, and concurrent throughput.

use std::sync::Arc;
use std::time::Duration;

use duraqueue::{
    BackoffStrategy, MessageStatus, PersistenceOptions, PublishRequest, QueueManager,
    QueueOptions, RequeueOutcome,
};
use tempfile::tempdir;

fn persisted_options(capacity: usize) -> QueueOptions {
    QueueOptions {
        capacity,
        persistence_enabled: true,
        ..Default::default()
    }
}

fn in_memory_options(capacity: usize) -> QueueOptions {
    QueueOptions {
        capacity,
        persistence_enabled: false,
        ..Default::default()
    }
}

#[tokio::test]
async fn crash_before_ack_redelivers_on_restart() {
    let dir = tempdir().unwrap();
    let persistence = PersistenceOptions {
        storage_path: dir.path().to_path_buf(),
        ..Default::default()
    };

    let queue = QueueManager::open(persisted_options(16), persistence.clone())
        .await
        .unwrap();
    let id = queue
        .enqueue("orders.created", b"order-1".to_vec(), 3, PublishRequest::default())
        .await
        .unwrap();
    queue
        .checkout("orders.created", "worker-1", Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();

    // Simulate a crash: drop the manager without acknowledging, and without
    // waiting for the lease to expire naturally.
    drop(queue);

    let recovered_queue = QueueManager::open(persisted_options(16), persistence)
        .await
        .unwrap();
    let recovered = recovered_queue.get(id).unwrap();
    assert_eq!(recovered.status, MessageStatus::Ready);
    assert!(recovered.lease.is_none());
    assert_eq!(recovered.retry_count, 1);

    let redelivered = recovered_queue
        .checkout("orders.created", "worker-2", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(redelivered.message_id, id);
    assert_eq!(redelivered.retry_count, 1);
}

#[tokio::test]
async fn exponential_backoff_exhausts_into_dead_letter_queue() {
    let queue = QueueManager::new(in_memory_options(8)).unwrap();
    let id = queue
        .enqueue("payments.charge", b"charge-1".to_vec(), 2, PublishRequest::default())
        .await
        .unwrap();

    let mut last_outcome = None;
    for attempt in 0..3 {
        queue
            .checkout("payments.charge", "worker-1", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("expected a checkout on attempt {attempt}"));
        let outcome = queue
            .requeue(
                id,
                BackoffStrategy::Exponential,
                Duration::from_millis(1),
                Duration::from_millis(50),
                "card declined",
                Some("PaymentError".into()),
                Some("issuer declined the charge".into()),
            )
            .await
            .unwrap();
        last_outcome = Some(outcome);
        if matches!(last_outcome, Some(RequeueOutcome::DeadLettered(_))) {
            break;
        }
        // Backoff is capped low enough in this test that a short sleep clears it.
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    assert!(matches!(last_outcome, Some(RequeueOutcome::DeadLettered(_))));
    assert!(queue.get(id).is_none());
    let dead_letters = queue.dead_letters(None, None);
    assert_eq!(dead_letters.len(), 1);
    assert_eq!(dead_letters[0].failure_reason, "card declined");
    assert_eq!(dead_letters[0].envelope.message_id, id);
}

#[tokio::test]
async fn supersede_then_requeue_keeps_original_ineligible() {
    let queue = QueueManager::new(in_memory_options(8)).unwrap();
    let request = PublishRequest {
        deduplication_key: Some("invoice-42".into()),
        ..Default::default()
    };

    let original_id = queue
        .enqueue("invoices.sync", b"v1".to_vec(), 3, request.clone())
        .await
        .unwrap();
    queue
        .checkout("invoices.sync", "worker-1", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();

    let replacement_id = queue
        .enqueue("invoices.sync", b"v2".to_vec(), 3, request)
        .await
        .unwrap();
    assert_ne!(original_id, replacement_id);

    // The handler holding the superseded original fails and requeues it; it
    // must not become checkoutable again even though it is back to Ready.
    queue
        .requeue(
            original_id,
            BackoffStrategy::None,
            Duration::from_millis(1),
            Duration::from_millis(1),
            "stale handler failure",
            None,
            None,
        )
        .await
        .unwrap();

    let original = queue.get(original_id).unwrap();
    assert!(original.is_superseded);

    let checked_out = queue
        .checkout("invoices.sync", "worker-2", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checked_out.message_id, replacement_id);
    assert_eq!(checked_out.payload, b"v2".to_vec());
}

#[tokio::test]
async fn supersede_then_ack_of_original_does_not_disturb_replacement() {
    let queue = QueueManager::new(in_memory_options(8)).unwrap();
    let request = PublishRequest {
        deduplication_key: Some("invoice-7".into()),
        ..Default::default()
    };

    let original_id = queue
        .enqueue("invoices.sync", b"v1".to_vec(), 3, request.clone())
        .await
        .unwrap();
    queue
        .checkout("invoices.sync", "worker-1", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    let replacement_id = queue
        .enqueue("invoices.sync", b"v2".to_vec(), 3, request)
        .await
        .unwrap();

    // The worker processing the superseded original finishes and acks it
    // before noticing anything changed. That must not remove the dedup
    // mapping the replacement now owns.
    queue.acknowledge(original_id).await.unwrap();

    assert!(queue.get(original_id).is_none());
    let replacement = queue.get(replacement_id).unwrap();
    assert_eq!(replacement.payload, b"v2".to_vec());

    let checked_out = queue
        .checkout("invoices.sync", "worker-2", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checked_out.message_id, replacement_id);
}

#[tokio::test]
async fn dead_letter_replay_resets_retry_budget() {
    let queue = QueueManager::new(in_memory_options(8)).unwrap();
    let id = queue
        .enqueue("emails.send", b"welcome".to_vec(), 0, PublishRequest::default())
        .await
        .unwrap();
    queue
        .checkout("emails.send", "worker-1", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();

    let outcome = queue
        .requeue(
            id,
            BackoffStrategy::None,
            Duration::from_millis(1),
            Duration::from_millis(1),
            "smtp unreachable",
            None,
            None,
        )
        .await
        .unwrap();
    assert!(matches!(outcome, RequeueOutcome::DeadLettered(_)));

    let replayed_id = queue.dead_letter_replay(id, true).await.unwrap();
    assert_ne!(replayed_id, id);
    let replayed = queue.get(replayed_id).unwrap();
    assert_eq!(replayed.retry_count, 0);
    assert_eq!(replayed.status, MessageStatus::Ready);
    assert!(queue.dead_letters(None, None).is_empty());

    let checked_out = queue
        .checkout("emails.send", "worker-2", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checked_out.message_id, replayed_id);
}

#[tokio::test]
async fn concurrent_producers_and_workers_drain_the_queue() {
    const MESSAGE_TYPE: &str = "events.ingest";
    const PRODUCERS: usize = 4;
    const WORKERS: usize = 4;
    const MESSAGES_PER_PRODUCER: usize = 50;
    const TOTAL: usize = PRODUCERS * MESSAGES_PER_PRODUCER;

    let queue = Arc::new(QueueManager::new(in_memory_options(TOTAL)).unwrap());

    let mut producer_tasks = Vec::new();
    for p in 0..PRODUCERS {
        let queue = queue.clone();
        producer_tasks.push(tokio::spawn(async move {
            for i in 0..MESSAGES_PER_PRODUCER {
                queue
                    .enqueue(
                        MESSAGE_TYPE,
                        format!("producer-{p}-msg-{i}").into_bytes(),
                        3,
                        PublishRequest::default(),
                    )
                    .await
                    .unwrap();
            }
        }));
    }
    for task in producer_tasks {
        task.await.unwrap();
    }

    let processed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let mut worker_tasks = Vec::new();
    for w in 0..WORKERS {
        let queue = queue.clone();
        let processed = processed.clone();
        worker_tasks.push(tokio::spawn(async move {
            let handler_id = format!("worker-{w}");
            loop {
                match queue
                    .checkout(MESSAGE_TYPE, &handler_id, Duration::from_secs(30))
                    .await
                    .unwrap()
                {
                    Some(envelope) => {
                        queue.acknowledge(envelope.message_id).await.unwrap();
                        processed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    }
                    None => {
                        if processed.load(std::sync::atomic::Ordering::SeqCst) >= TOTAL {
                            return;
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                }
            }
        }));
    }
    for task in worker_tasks {
        task.await.unwrap();
    }

    assert_eq!(processed.load(std::sync::atomic::Ordering::SeqCst), TOTAL);
    assert_eq!(queue.len(), 0);
}
