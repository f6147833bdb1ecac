//! End-to-end pipeline tests: publish, worker pool, HTTP destination.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use relay_core::{
    BackoffPolicy, BackoffStrategy, Clock, ClientId, ConfigId, DeliveryStatus, EntityType, Event,
    EventId, EventType, ProcessorConfig, QueueName, RealClock, Target,
};
use relay_delivery::{
    storage::memory::InMemoryDeliveryStore, DeliveryClient, DeliveryStore, DeliveryTaskHandler,
    DeliveryTracker, EventPublisher, LoggingWorkflowRunner, WorkflowTaskHandler,
};
use relay_queue::{
    queue::memory::InMemoryTaskQueue, PoolConfig, QueueConfig, RedeliveryPolicy, TaskKind,
    TaskProducer, TaskRegistry, WorkerPool,
};
use uuid::Uuid;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

struct Pipeline {
    store: Arc<InMemoryDeliveryStore>,
    publisher: EventPublisher,
    pool: WorkerPool,
    client_id: ClientId,
}

async fn pipeline() -> Pipeline {
    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let store = Arc::new(InMemoryDeliveryStore::new());
    let broker = Arc::new(InMemoryTaskQueue::new(clock.clone()));
    let producer = Arc::new(TaskProducer::new(broker.clone(), clock.clone()));
    let publisher = EventPublisher::new(store.clone(), producer, clock.clone());
    let tracker = Arc::new(DeliveryTracker::new(store.clone(), clock.clone()));

    let registry = Arc::new(
        TaskRegistry::new()
            .with_handler_and_policy(
                TaskKind::Delivery,
                Arc::new(DeliveryTaskHandler::new(
                    tracker,
                    DeliveryClient::with_defaults().unwrap(),
                )),
                RedeliveryPolicy {
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(10),
                },
            )
            .with_handler(TaskKind::Workflow, Arc::new(WorkflowTaskHandler::new(Arc::new(
                LoggingWorkflowRunner,
            )))),
    );

    let config = PoolConfig {
        queues: vec![QueueConfig {
            name: QueueName::Events,
            concurrency: 4,
            redelivery_ceiling: 10,
        }],
        batch_size: 5,
        poll_interval: Duration::from_millis(5),
        visibility_timeout: Duration::from_secs(60),
        handler_timeout: Duration::from_secs(10),
        shutdown_timeout: Duration::from_secs(5),
    };

    let mut pool = WorkerPool::new(broker, registry, config, clock);
    pool.spawn_workers().await;

    Pipeline { store, publisher, pool, client_id: ClientId::new() }
}

async fn seed_config(pipeline: &Pipeline, url: &str, max_attempts: i32) {
    pipeline
        .store
        .add_config(ProcessorConfig {
            id: ConfigId::new(),
            client_id: pipeline.client_id,
            entity_type: EntityType::ChatMessage,
            event_type: None,
            target: Target { queue: QueueName::Events, url: url.into() },
            active: true,
            max_attempts,
            backoff: BackoffPolicy {
                strategy: BackoffStrategy::Linear,
                base_delay_ms: 1,
                max_delay_ms: 10,
                jitter_factor: 0.0,
            },
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await;
}

fn chat_message_event(client_id: ClientId) -> Event {
    Event {
        event_id: EventId::new(),
        event_type: EventType::Created,
        entity_type: EntityType::ChatMessage,
        entity_id: Uuid::new_v4(),
        client_id,
        parent_id: None,
        payload: serde_json::json!({"text": "hello"}),
        occurred_at: Utc::now(),
    }
}

async fn wait_for_status(
    store: &InMemoryDeliveryStore,
    id: relay_core::DeliveryId,
    status: DeliveryStatus,
) {
    for _ in 0..500 {
        if store.find_delivery(id).await.unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "delivery never reached {status}, currently {}",
        store.find_delivery(id).await.unwrap().status
    );
}

#[tokio::test]
async fn published_event_is_delivered_end_to_end() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let pipeline = pipeline().await;
    seed_config(&pipeline, &format!("{}/hook", server.uri()), 3).await;

    let event = chat_message_event(pipeline.client_id);
    let delivery_ids = pipeline.publisher.publish(&event).await.unwrap();
    assert_eq!(delivery_ids.len(), 1);

    wait_for_status(&pipeline.store, delivery_ids[0], DeliveryStatus::Succeeded).await;

    pipeline.pool.shutdown_graceful().await.unwrap();
}

#[tokio::test]
async fn flaky_destination_succeeds_after_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

    let pipeline = pipeline().await;
    seed_config(&pipeline, &server.uri(), 5).await;

    let event = chat_message_event(pipeline.client_id);
    let delivery_ids = pipeline.publisher.publish(&event).await.unwrap();

    wait_for_status(&pipeline.store, delivery_ids[0], DeliveryStatus::Succeeded).await;

    let attempts = pipeline.store.find_attempts(delivery_ids[0]).await.unwrap();
    assert_eq!(attempts.len(), 3);
    assert_eq!(pipeline.store.find_delivery(delivery_ids[0]).await.unwrap().attempt_count, 3);

    pipeline.pool.shutdown_graceful().await.unwrap();
}

#[tokio::test]
async fn persistently_failing_destination_exhausts_the_budget() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(500)).mount(&server).await;

    let pipeline = pipeline().await;
    seed_config(&pipeline, &server.uri(), 3).await;

    let event = chat_message_event(pipeline.client_id);
    let delivery_ids = pipeline.publisher.publish(&event).await.unwrap();

    wait_for_status(&pipeline.store, delivery_ids[0], DeliveryStatus::Exhausted).await;

    let attempts = pipeline.store.find_attempts(delivery_ids[0]).await.unwrap();
    assert_eq!(attempts.len(), 3);

    pipeline.pool.shutdown_graceful().await.unwrap();
}
