//! Delivery state machine tests over the in-memory store.

use std::{sync::Arc, time::Duration};

use relay_core::{
    AttemptOutcome, BackoffPolicy, BackoffStrategy, Clock, ClientId, DeliveryStatus, EntityType,
    Event, EventDelivery, EventId, EventType, ProcessorConfig, QueueName, Target, TestClock,
};
use relay_delivery::{
    storage::memory::InMemoryDeliveryStore, AttemptDisposition, ClaimMiss, DeliveryStore,
    DeliveryTracker,
};
use uuid::Uuid;

struct TestEnv {
    store: Arc<InMemoryDeliveryStore>,
    tracker: DeliveryTracker,
    clock: TestClock,
}

fn env() -> TestEnv {
    let clock = TestClock::new();
    let store = Arc::new(InMemoryDeliveryStore::new());
    let tracker = DeliveryTracker::new(store.clone(), Arc::new(clock.clone()));

    TestEnv { store, tracker, clock }
}

/// Linear 10s backoff without jitter, for exact eligibility assertions.
fn plain_backoff() -> BackoffPolicy {
    BackoffPolicy {
        strategy: BackoffStrategy::Linear,
        base_delay_ms: 10_000,
        max_delay_ms: 3_600_000,
        jitter_factor: 0.0,
    }
}

async fn seed_delivery(env: &TestEnv, max_attempts: i32) -> relay_core::DeliveryId {
    let client_id = ClientId::new();
    let config = ProcessorConfig {
        id: relay_core::ConfigId::new(),
        client_id,
        entity_type: EntityType::ChatMessage,
        event_type: None,
        target: Target { queue: QueueName::Events, url: "https://example.com/hook".into() },
        active: true,
        max_attempts,
        backoff: plain_backoff(),
        created_at: env.clock.now_utc(),
        updated_at: env.clock.now_utc(),
    };
    env.store.add_config(config.clone()).await;

    let event = Event {
        event_id: EventId::new(),
        event_type: EventType::Created,
        entity_type: EntityType::ChatMessage,
        entity_id: Uuid::new_v4(),
        client_id,
        parent_id: None,
        payload: serde_json::json!({}),
        occurred_at: env.clock.now_utc(),
    };

    let delivery = EventDelivery::pending(event.event_id, config.id, env.clock.now_utc());
    let (id, created) = env.store.create_or_fetch_delivery(&delivery).await.unwrap();
    assert!(created);
    id
}

#[tokio::test]
async fn concurrent_claims_grant_the_gate_exactly_once() {
    let env = env();
    let id = seed_delivery(&env, 3).await;
    let TestEnv { store, tracker, .. } = env;
    let tracker = Arc::new(tracker);

    let mut claims = Vec::new();
    for _ in 0..8 {
        let tracker = tracker.clone();
        claims.push(tokio::spawn(async move {
            tracker.begin_attempt(id).await.unwrap().is_some()
        }));
    }

    let mut wins = 0;
    for claim in claims {
        if claim.await.unwrap() {
            wins += 1;
        }
    }

    assert_eq!(wins, 1);
    assert_eq!(store.find_delivery(id).await.unwrap().status, DeliveryStatus::InFlight);
}

#[tokio::test]
async fn only_one_claim_wins_the_in_flight_gate() {
    let env = env();
    let id = seed_delivery(&env, 3).await;

    let first = env.tracker.begin_attempt(id).await.unwrap();
    assert!(first.is_some());

    // Second claim while the gate is held is a benign no-op.
    let second = env.tracker.begin_attempt(id).await.unwrap();
    assert!(second.is_none());

    assert_eq!(
        env.store.find_delivery(id).await.unwrap().status,
        DeliveryStatus::InFlight
    );
}

#[tokio::test]
async fn successful_attempt_settles_the_delivery() {
    let env = env();
    let id = seed_delivery(&env, 3).await;

    let claimed = env.tracker.begin_attempt(id).await.unwrap().unwrap();
    assert_eq!(claimed.attempt_number(), 1);

    env.clock.advance(Duration::from_millis(250));
    let disposition =
        env.tracker.complete_attempt(&claimed, AttemptOutcome::Success, None).await.unwrap();
    assert_eq!(disposition, AttemptDisposition::Done);

    let (delivery, attempts) = env.tracker.delivery(id).await.unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Succeeded);
    assert_eq!(delivery.attempt_count, 1);
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, AttemptOutcome::Success);
    assert_eq!(attempts[0].latency_ms, 250);

    // Terminal deliveries are no longer claimable.
    assert!(env.tracker.begin_attempt(id).await.unwrap().is_none());
}

#[tokio::test]
async fn transient_failures_retry_with_monotone_backoff_until_exhausted() {
    let env = env();
    let id = seed_delivery(&env, 3).await;
    let mut delays = Vec::new();

    for attempt in 1..=3 {
        // A freshly scheduled retry is not yet eligible.
        if attempt > 1 {
            assert!(env.tracker.begin_attempt(id).await.unwrap().is_none());
            env.clock.advance(*delays.last().unwrap());
        }

        let claimed = env.tracker.begin_attempt(id).await.unwrap().unwrap();
        assert_eq!(claimed.attempt_number(), attempt);

        let disposition = env
            .tracker
            .complete_attempt(
                &claimed,
                AttemptOutcome::TransientFailure,
                Some("HTTP 503".into()),
            )
            .await
            .unwrap();

        if attempt < 3 {
            let AttemptDisposition::RetryAfter(delay) = disposition else {
                panic!("expected RetryAfter, got {disposition:?}");
            };
            delays.push(delay);
            assert_eq!(
                env.store.find_delivery(id).await.unwrap().status,
                DeliveryStatus::FailedRetryable
            );
        } else {
            assert_eq!(disposition, AttemptDisposition::Exhausted);
        }
    }

    // Linear policy: 10s then 20s.
    assert_eq!(delays, vec![Duration::from_secs(10), Duration::from_secs(20)]);

    let (delivery, attempts) = env.tracker.delivery(id).await.unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Exhausted);
    assert_eq!(delivery.attempt_count, 3);
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|a| a.outcome == AttemptOutcome::TransientFailure));
    assert_eq!(
        attempts.iter().map(|a| a.attempt_number).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    // Exhausted deliveries are settled for good.
    assert!(env.tracker.begin_attempt(id).await.unwrap().is_none());
}

#[tokio::test]
async fn permanent_failure_exhausts_immediately_despite_remaining_budget() {
    let env = env();
    let id = seed_delivery(&env, 5).await;

    let claimed = env.tracker.begin_attempt(id).await.unwrap().unwrap();
    let disposition = env
        .tracker
        .complete_attempt(
            &claimed,
            AttemptOutcome::PermanentFailure,
            Some("HTTP 400".into()),
        )
        .await
        .unwrap();

    assert_eq!(disposition, AttemptDisposition::Exhausted);

    let (delivery, attempts) = env.tracker.delivery(id).await.unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Exhausted);
    assert_eq!(delivery.attempt_count, 1);
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, AttemptOutcome::PermanentFailure);
}

#[tokio::test]
async fn attempt_count_never_exceeds_max_attempts() {
    let env = env();
    let id = seed_delivery(&env, 1).await;

    let claimed = env.tracker.begin_attempt(id).await.unwrap().unwrap();
    let disposition = env
        .tracker
        .complete_attempt(&claimed, AttemptOutcome::TransientFailure, Some("timeout".into()))
        .await
        .unwrap();

    // With a budget of one, the first transient failure exhausts.
    assert_eq!(disposition, AttemptDisposition::Exhausted);
    assert_eq!(env.store.find_delivery(id).await.unwrap().attempt_count, 1);
}

#[tokio::test]
async fn stuck_in_flight_deliveries_are_reclaimed_after_the_grace_period() {
    let env = env();
    let id = seed_delivery(&env, 3).await;

    // Claim and never complete, as a crashed worker would.
    let _claimed = env.tracker.begin_attempt(id).await.unwrap().unwrap();

    // Within the grace period nothing is reclaimed.
    env.clock.advance(Duration::from_secs(60));
    assert!(env.tracker.reclaim_stuck(Duration::from_secs(300)).await.unwrap().is_empty());

    env.clock.advance(Duration::from_secs(300));
    let reclaimed = env.tracker.reclaim_stuck(Duration::from_secs(300)).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, id);

    // The delivery is claimable again.
    assert_eq!(
        env.store.find_delivery(id).await.unwrap().status,
        DeliveryStatus::Pending
    );
    assert!(env.tracker.begin_attempt(id).await.unwrap().is_some());
}

#[tokio::test]
async fn completion_after_a_reclaim_sweep_surfaces_the_lost_transition() {
    let env = env();
    let id = seed_delivery(&env, 3).await;

    let claimed = env.tracker.begin_attempt(id).await.unwrap().unwrap();

    // The sweep frees the gate while the attempt is still running.
    env.clock.advance(Duration::from_secs(400));
    assert_eq!(env.tracker.reclaim_stuck(Duration::from_secs(120)).await.unwrap().len(), 1);

    // The slow completer must learn its transition was lost instead of
    // silently diverging from the recorded attempt.
    let result = env.tracker.complete_attempt(&claimed, AttemptOutcome::Success, None).await;
    assert!(result.is_err());
    assert_eq!(env.store.find_delivery(id).await.unwrap().status, DeliveryStatus::Pending);
}

#[tokio::test]
async fn missing_config_fails_the_claim_without_taking_the_gate() {
    let env = env();

    // A delivery whose config the CRUD layer has since deleted.
    let delivery = EventDelivery::pending(
        EventId::new(),
        relay_core::ConfigId::new(),
        env.clock.now_utc(),
    );
    let (id, created) = env.store.create_or_fetch_delivery(&delivery).await.unwrap();
    assert!(created);

    assert!(env.tracker.begin_attempt(id).await.is_err());
    assert_eq!(env.store.find_delivery(id).await.unwrap().status, DeliveryStatus::Pending);
}

#[tokio::test]
async fn missed_claims_are_classified_by_delivery_state() {
    let env = env();
    let id = seed_delivery(&env, 3).await;

    // Gate held by another attempt.
    let claimed = env.tracker.begin_attempt(id).await.unwrap().unwrap();
    assert_eq!(env.tracker.classify_missed_claim(id).await.unwrap(), ClaimMiss::Busy);

    // Scheduled retry, 10s linear backoff, 4s already elapsed.
    env.tracker
        .complete_attempt(&claimed, AttemptOutcome::TransientFailure, Some("HTTP 502".into()))
        .await
        .unwrap();
    env.clock.advance(Duration::from_secs(4));
    assert_eq!(
        env.tracker.classify_missed_claim(id).await.unwrap(),
        ClaimMiss::NotYetEligible(Duration::from_secs(6))
    );

    // Terminal.
    env.clock.advance(Duration::from_secs(6));
    let claimed = env.tracker.begin_attempt(id).await.unwrap().unwrap();
    env.tracker.complete_attempt(&claimed, AttemptOutcome::Success, None).await.unwrap();
    assert_eq!(env.tracker.classify_missed_claim(id).await.unwrap(), ClaimMiss::Settled);
}

#[tokio::test]
async fn deliveries_for_event_returns_the_full_fan_out() {
    let env = env();
    let id = seed_delivery(&env, 3).await;

    let delivery = env.store.find_delivery(id).await.unwrap();
    let listed = env.tracker.deliveries_for_event(delivery.event_id).await.unwrap();

    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, id);
}
