use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use mail_outbox::metrics::Metrics;
use mail_outbox::outbox::{
    DeliveryPolicy, InMemoryOutboxStore, Outbox, OutboxMessage, OutboxStatus, OutboxStore,
    SendStatus, StatusCounts, StoreError, StoreResult, SweeperConfig, ATTEMPTS_EXHAUSTED,
};
use mail_outbox::provider::{EmailProvider, SendResult};
use mail_outbox::utils::{Clock, ManualClock};

// ============================================================================
// Test harness
// ============================================================================

/// Provider that replays scripted results, repeating the last one forever.
struct ScriptedProvider {
    script: Mutex<VecDeque<SendResult>>,
    fallback: SendResult,
    calls: AtomicUsize,
    delay: std::time::Duration,
}

impl ScriptedProvider {
    fn always(result: SendResult) -> Arc<Self> {
        Self::script(vec![], result)
    }

    fn script(results: Vec<SendResult>, fallback: SendResult) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(results.into()),
            fallback,
            calls: AtomicUsize::new(0),
            delay: std::time::Duration::ZERO,
        })
    }

    /// Every call takes `delay` of wall time before answering.
    fn slow(result: SendResult, delay: std::time::Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: result,
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmailProvider for ScriptedProvider {
    async fn send(&self, _message: &OutboxMessage) -> SendResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

struct Harness {
    outbox: Outbox,
    store: Arc<InMemoryOutboxStore>,
    provider: Arc<ScriptedProvider>,
    clock: Arc<ManualClock>,
    metrics: Arc<Metrics>,
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

fn harness(provider: Arc<ScriptedProvider>, policy: DeliveryPolicy) -> Harness {
    harness_with_worker(provider, policy, "worker-a", Arc::new(InMemoryOutboxStore::new()))
}

fn harness_with_worker(
    provider: Arc<ScriptedProvider>,
    policy: DeliveryPolicy,
    worker_id: &str,
    store: Arc<InMemoryOutboxStore>,
) -> Harness {
    let clock = Arc::new(ManualClock::new(t0()));
    let metrics = Arc::new(Metrics::new().unwrap());
    let outbox = Outbox::new(
        store.clone(),
        provider.clone(),
        clock.clone(),
        policy,
        SweeperConfig {
            interval: std::time::Duration::from_millis(10),
            batch_size: 20,
            claim_lease: Duration::seconds(300),
            worker_id: worker_id.to_string(),
        },
        metrics.clone(),
    );

    Harness {
        outbox,
        store,
        provider,
        clock,
        metrics,
    }
}

async fn only_message(store: &InMemoryOutboxStore) -> OutboxMessage {
    let mut messages = store.messages().await;
    assert_eq!(messages.len(), 1, "expected exactly one stored message");
    messages.remove(0)
}

// ============================================================================
// Gateway scenarios
// ============================================================================

#[tokio::test]
async fn test_scenario_a_first_attempt_sent() {
    let h = harness(
        ScriptedProvider::always(SendResult::sent(Some("re_abc".into()))),
        DeliveryPolicy::default(),
    );

    let status = h
        .outbox
        .gateway()
        .enqueue_and_send("ana@example.com", "Welcome", "Hello")
        .await
        .unwrap();

    assert_eq!(status, SendStatus::Sent);
    assert_eq!(h.provider.calls(), 1);

    let counts = h.store.counts_by_status().await.unwrap();
    assert_eq!(counts, StatusCounts { pending: 0, sent: 1, failed: 0 });
    assert_eq!(h.metrics.outbox_enqueued.get(), 1);
}

#[tokio::test]
async fn test_scenario_a_record_fields() {
    let h = harness(
        ScriptedProvider::always(SendResult::sent(Some("re_abc".into()))),
        DeliveryPolicy::default(),
    );
    let id = h
        .outbox
        .gateway()
        .enqueue("ana@example.com", "Welcome", "Hello")
        .await
        .unwrap();

    let msg = h.store.get(id).await.unwrap();
    let status = h.outbox.engine().attempt_send(msg).await.unwrap();
    assert_eq!(status, SendStatus::Sent);

    let stored = h.store.get(id).await.unwrap();
    assert_eq!(stored.status(), OutboxStatus::Sent);
    assert_eq!(stored.attempts(), 1);
    assert_eq!(stored.provider_message_id(), Some("re_abc"));
    assert!(stored.last_error().is_none());
}

#[tokio::test]
async fn test_scenario_b_permanent_failure() {
    let h = harness(
        ScriptedProvider::always(SendResult::failed("provider rejected message (HTTP 422)")),
        DeliveryPolicy::default(),
    );

    let id = h
        .outbox
        .gateway()
        .enqueue("bad@example", "Hi", "Body")
        .await
        .unwrap();
    let status = h
        .outbox
        .engine()
        .attempt_send(h.store.get(id).await.unwrap())
        .await
        .unwrap();

    assert_eq!(status, SendStatus::Failed);
    let stored = h.store.get(id).await.unwrap();
    assert_eq!(stored.status(), OutboxStatus::Failed);
    assert_eq!(stored.attempts(), 1);
    assert_eq!(stored.last_error(), Some("provider rejected message (HTTP 422)"));

    // Never picked up again
    h.clock.advance(Duration::days(1));
    let report = h.outbox.sweeper().run_once().await.unwrap();
    assert_eq!(report.claimed, 0);
    assert_eq!(h.provider.calls(), 1);
}

#[tokio::test]
async fn test_enqueue_and_send_reports_retry_and_keeps_message_pending() {
    let h = harness(
        ScriptedProvider::always(SendResult::retry("provider temporarily unavailable (HTTP 503)")),
        DeliveryPolicy::default(),
    );

    let status = h
        .outbox
        .gateway()
        .enqueue_and_send("ana@example.com", "Hi", "Body")
        .await
        .unwrap();

    assert_eq!(status, SendStatus::Retry);
    let msg = only_message(&h.store).await;
    assert_eq!(msg.status(), OutboxStatus::Pending);
    assert_eq!(msg.attempts(), 1);
    assert_eq!(msg.next_attempt_at(), t0() + Duration::seconds(60));
}

// ============================================================================
// Sweeper scenarios
// ============================================================================

#[tokio::test]
async fn test_scenario_c_linear_backoff_then_exhaustion() {
    let policy = DeliveryPolicy {
        max_attempts: 3,
        retry_delay_seconds: 60,
        ..Default::default()
    };
    let h = harness(ScriptedProvider::always(SendResult::retry("HTTP 500")), policy);
    let id = h
        .outbox
        .gateway()
        .enqueue("ana@example.com", "Hi", "Body")
        .await
        .unwrap();
    let sweeper = h.outbox.sweeper();

    for (attempt, delay) in [(1, 60), (2, 120), (3, 180)] {
        let report = sweeper.run_once().await.unwrap();
        assert_eq!(report.rescheduled, 1);

        let msg = h.store.get(id).await.unwrap();
        assert_eq!(msg.attempts(), attempt);
        assert_eq!(msg.status(), OutboxStatus::Pending);
        assert_eq!(msg.next_attempt_at(), h.clock.now() + Duration::seconds(delay));

        h.clock.set(msg.next_attempt_at());
    }

    let report = sweeper.run_once().await.unwrap();
    assert_eq!(report.failed, 1);

    let msg = h.store.get(id).await.unwrap();
    assert_eq!(msg.status(), OutboxStatus::Failed);
    assert_eq!(msg.attempts(), 3);
    assert_eq!(msg.last_error(), Some(ATTEMPTS_EXHAUSTED));
    assert_eq!(h.provider.calls(), 3);
    assert_eq!(h.metrics.outbox_attempts_exhausted.get(), 1);
}

#[tokio::test]
async fn test_scenario_d_quota_backoff_is_flat() {
    let policy = DeliveryPolicy {
        max_attempts: 3,
        quota_delay_minutes: 60,
        ..Default::default()
    };
    let h = harness(ScriptedProvider::always(SendResult::quota("HTTP 429")), policy);
    let id = h
        .outbox
        .gateway()
        .enqueue("ana@example.com", "Hi", "Body")
        .await
        .unwrap();
    let sweeper = h.outbox.sweeper();

    for attempt in 1..=3 {
        sweeper.run_once().await.unwrap();
        let msg = h.store.get(id).await.unwrap();
        assert_eq!(msg.attempts(), attempt);
        assert_eq!(msg.next_attempt_at(), h.clock.now() + Duration::minutes(60));
        h.clock.advance(Duration::minutes(60));
    }

    sweeper.run_once().await.unwrap();
    let msg = h.store.get(id).await.unwrap();
    assert_eq!(msg.status(), OutboxStatus::Failed);
    assert_eq!(msg.attempts(), 3);
    assert_eq!(h.provider.calls(), 3);
}

#[tokio::test]
async fn test_retry_then_sent() {
    let h = harness(
        ScriptedProvider::script(
            vec![SendResult::retry("HTTP 502")],
            SendResult::sent(Some("re_2".into())),
        ),
        DeliveryPolicy::default(),
    );

    let status = h
        .outbox
        .gateway()
        .enqueue_and_send("ana@example.com", "Hi", "Body")
        .await
        .unwrap();
    assert_eq!(status, SendStatus::Retry);

    // Not yet due
    assert_eq!(h.outbox.sweeper().run_once().await.unwrap().claimed, 0);

    h.clock.advance(Duration::seconds(60));
    let report = h.outbox.sweeper().run_once().await.unwrap();
    assert_eq!(report.sent, 1);

    let counts = h.store.counts_by_status().await.unwrap();
    assert_eq!(counts.sent, 1);
    assert_eq!(h.provider.calls(), 2);
}

#[tokio::test]
async fn test_idle_sweep_changes_nothing() {
    let h = harness(
        ScriptedProvider::always(SendResult::quota("HTTP 402")),
        DeliveryPolicy::default(),
    );
    h.outbox
        .gateway()
        .enqueue_and_send("ana@example.com", "Hi", "Body")
        .await
        .unwrap();

    let before = only_message(&h.store).await;
    let report = h.outbox.sweeper().run_once().await.unwrap();
    let after = only_message(&h.store).await;

    assert_eq!(report.claimed, 0);
    assert_eq!(before, after);
    assert_eq!(h.provider.calls(), 1);
}

#[tokio::test]
async fn test_sweeper_processes_oldest_first_within_batch_size() {
    let h = harness(
        ScriptedProvider::always(SendResult::sent(None)),
        DeliveryPolicy::default(),
    );
    let gateway = h.outbox.gateway();

    let mut ids = Vec::new();
    for i in 0..25 {
        ids.push(
            gateway
                .enqueue(&format!("user{}@example.com", i), "Hi", "Body")
                .await
                .unwrap(),
        );
        h.clock.advance(Duration::seconds(1));
    }

    let report = h.outbox.sweeper().run_once().await.unwrap();
    assert_eq!(report.claimed, 20);
    assert_eq!(report.sent, 20);

    // The five newest remain
    for id in &ids[20..] {
        assert_eq!(h.store.get(*id).await.unwrap().status(), OutboxStatus::Pending);
    }
    for id in &ids[..20] {
        assert_eq!(h.store.get(*id).await.unwrap().status(), OutboxStatus::Sent);
    }
}

// ============================================================================
// Invariants
// ============================================================================

#[tokio::test]
async fn test_attempts_never_exceed_max() {
    let policy = DeliveryPolicy {
        max_attempts: 4,
        retry_delay_seconds: 1,
        ..Default::default()
    };
    let h = harness(ScriptedProvider::always(SendResult::retry("timeout")), policy);
    let id = h
        .outbox
        .gateway()
        .enqueue("ana@example.com", "Hi", "Body")
        .await
        .unwrap();

    for _ in 0..10 {
        h.outbox.sweeper().run_once().await.unwrap();
        let msg = h.store.get(id).await.unwrap();
        assert!(msg.attempts() <= 4);
        h.clock.advance(Duration::minutes(5));
    }

    assert_eq!(h.store.get(id).await.unwrap().status(), OutboxStatus::Failed);
    assert_eq!(h.provider.calls(), 4);
}

#[tokio::test]
async fn test_terminal_message_is_never_mutated() {
    let h = harness(
        ScriptedProvider::always(SendResult::sent(Some("re_1".into()))),
        DeliveryPolicy::default(),
    );
    h.outbox
        .gateway()
        .enqueue_and_send("ana@example.com", "Hi", "Body")
        .await
        .unwrap();
    let sent = only_message(&h.store).await;
    assert_eq!(sent.status(), OutboxStatus::Sent);

    // Dispatching a Sent record again returns its status and calls nothing
    h.clock.advance(Duration::hours(1));
    let status = h.outbox.engine().attempt_send(sent.clone()).await.unwrap();

    assert_eq!(status, SendStatus::Sent);
    assert_eq!(h.provider.calls(), 1);
    assert_eq!(only_message(&h.store).await, sent);
}

#[tokio::test]
async fn test_stale_pending_copy_cannot_overwrite_terminal_record() {
    let h = harness(
        ScriptedProvider::always(SendResult::retry("HTTP 500")),
        DeliveryPolicy::default(),
    );
    let id = h
        .outbox
        .gateway()
        .enqueue("ana@example.com", "Hi", "Body")
        .await
        .unwrap();
    let stale_copy = h.store.get(id).await.unwrap();

    // The record reaches a terminal state through another path
    let fail_now = DeliveryPolicy {
        max_attempts: 0,
        ..Default::default()
    };
    let other = Outbox::new(
        h.store.clone(),
        h.provider.clone(),
        h.clock.clone(),
        fail_now,
        SweeperConfig::default(),
        h.metrics.clone(),
    );
    other.engine().attempt_send(stale_copy.clone()).await.unwrap();

    let result = h.outbox.engine().attempt_send(stale_copy).await;
    assert!(matches!(result, Err(mail_outbox::StoreError::StaleUpdate(stale)) if stale == id));
    assert_eq!(h.store.get(id).await.unwrap().status(), OutboxStatus::Failed);
}

#[tokio::test]
async fn test_content_round_trips_unchanged() {
    let h = harness(
        ScriptedProvider::always(SendResult::sent(None)),
        DeliveryPolicy::default(),
    );
    let body = "Olá!\n\nYour reset code is 123-456.\n";
    let id = h
        .outbox
        .gateway()
        .enqueue("josé@example.com", "Redefinição de senha", body)
        .await
        .unwrap();

    let msg = h.store.get(id).await.unwrap();
    assert_eq!(msg.recipient(), "josé@example.com");
    assert_eq!(msg.subject(), "Redefinição de senha");
    assert_eq!(msg.body(), body);
    assert_eq!(msg.created_at(), t0());
    assert_eq!(msg.next_attempt_at(), t0());
}

// ============================================================================
// Multi-worker claims
// ============================================================================

#[tokio::test]
async fn test_two_sweepers_never_dispatch_the_same_message() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let provider = ScriptedProvider::always(SendResult::sent(None));
    let a = harness_with_worker(provider.clone(), DeliveryPolicy::default(), "worker-a", store.clone());
    let b = harness_with_worker(provider.clone(), DeliveryPolicy::default(), "worker-b", store.clone());

    for i in 0..30 {
        a.outbox
            .gateway()
            .enqueue(&format!("user{}@example.com", i), "Hi", "Body")
            .await
            .unwrap();
    }

    let (sweeper_a, sweeper_b) = (a.outbox.sweeper(), b.outbox.sweeper());
    let (ra, rb) = tokio::join!(sweeper_a.run_once(), sweeper_b.run_once());
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_eq!(ra.claimed + rb.claimed, 30);
    assert_eq!(provider.calls(), 30);
    assert_eq!(store.counts_by_status().await.unwrap().sent, 30);
}

#[tokio::test]
async fn test_sweeper_skips_message_during_inline_first_attempt() {
    let h = harness(
        ScriptedProvider::slow(
            SendResult::retry("HTTP 503"),
            std::time::Duration::from_millis(200),
        ),
        DeliveryPolicy::default(),
    );
    let gateway = h.outbox.gateway();
    let inline = tokio::spawn(async move {
        gateway
            .enqueue_and_send("ana@example.com", "Hi", "Body")
            .await
    });

    // The row is due (next_attempt_at == now) but leased to the gateway
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let report = h.outbox.sweeper().run_once().await.unwrap();
    assert_eq!(report.claimed, 0);

    let status = inline.await.unwrap().unwrap();
    assert_eq!(status, SendStatus::Retry);
    assert_eq!(h.provider.calls(), 1);

    let msg = only_message(&h.store).await;
    assert_eq!(msg.attempts(), 1);
    assert_eq!(msg.status(), OutboxStatus::Pending);
    assert_eq!(h.store.claimant_of(msg.id(), h.clock.now()).await, None);
}

#[tokio::test]
async fn test_late_writer_after_lease_expiry_does_not_overwrite() {
    let h = harness(
        ScriptedProvider::slow(
            SendResult::retry("HTTP 503"),
            std::time::Duration::from_millis(200),
        ),
        DeliveryPolicy::default(),
    );
    let gateway = h.outbox.gateway();
    let inline = tokio::spawn(async move {
        gateway
            .enqueue_and_send("ana@example.com", "Hi", "Body")
            .await
    });

    // The gateway lease lapses while its attempt is still in flight
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    h.clock.advance(Duration::seconds(301));
    let report = h.outbox.sweeper().run_once().await.unwrap();

    // The gateway wrote first; the sweeper's write from the same read is refused
    assert_eq!(inline.await.unwrap().unwrap(), SendStatus::Retry);
    assert_eq!(report.claimed, 1);
    assert_eq!(report.errors, 1);
    assert_eq!(h.provider.calls(), 2);

    let msg = only_message(&h.store).await;
    assert_eq!(msg.attempts(), 1);
    assert_eq!(msg.status(), OutboxStatus::Pending);
}

/// Delegates to the in-memory store but fails every `update` of one message.
struct FailingUpdateStore {
    inner: Arc<InMemoryOutboxStore>,
    failing: Mutex<Option<Uuid>>,
}

#[async_trait]
impl OutboxStore for FailingUpdateStore {
    async fn insert(&self, message: &OutboxMessage) -> StoreResult<()> {
        self.inner.insert(message).await
    }

    async fn insert_claimed(
        &self,
        message: &OutboxMessage,
        claimant: &str,
        lease: Duration,
    ) -> StoreResult<()> {
        self.inner.insert_claimed(message, claimant, lease).await
    }

    async fn update(&self, message: &OutboxMessage, expected_attempts: u32) -> StoreResult<()> {
        if *self.failing.lock().unwrap() == Some(message.id()) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.update(message, expected_attempts).await
    }

    async fn get(&self, id: Uuid) -> StoreResult<OutboxMessage> {
        self.inner.get(id).await
    }

    async fn claim_due_batch(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        claimant: &str,
        lease: Duration,
    ) -> StoreResult<Vec<OutboxMessage>> {
        self.inner.claim_due_batch(now, limit, claimant, lease).await
    }

    async fn counts_by_status(&self) -> StoreResult<StatusCounts> {
        self.inner.counts_by_status().await
    }
}

#[tokio::test]
async fn test_store_error_on_one_message_does_not_abort_sweep() {
    let inner = Arc::new(InMemoryOutboxStore::new());
    let store = Arc::new(FailingUpdateStore {
        inner: inner.clone(),
        failing: Mutex::new(None),
    });
    let provider = ScriptedProvider::always(SendResult::sent(None));
    let clock = Arc::new(ManualClock::new(t0()));
    let metrics = Arc::new(Metrics::new().unwrap());
    let outbox = Outbox::new(
        store.clone(),
        provider.clone(),
        clock.clone(),
        DeliveryPolicy::default(),
        SweeperConfig::default(),
        metrics.clone(),
    );

    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(
            outbox
                .gateway()
                .enqueue(&format!("user{}@example.com", i), "Hi", "Body")
                .await
                .unwrap(),
        );
        clock.advance(Duration::seconds(1));
    }
    // The oldest message fails first, so the rest of the batch runs after it
    *store.failing.lock().unwrap() = Some(ids[0]);

    let report = outbox.sweeper().run_once().await.unwrap();

    assert_eq!(report.claimed, 3);
    assert_eq!(report.errors, 1);
    assert_eq!(report.sent, 2);
    assert_eq!(provider.calls(), 3);
    assert_eq!(metrics.sweeper_errors.get(), 1);

    assert_eq!(inner.get(ids[0]).await.unwrap().status(), OutboxStatus::Pending);
    for id in &ids[1..] {
        assert_eq!(inner.get(*id).await.unwrap().status(), OutboxStatus::Sent);
    }
}

#[tokio::test]
async fn test_sweeper_loop_stops_on_cancel() {
    let h = harness(
        ScriptedProvider::always(SendResult::sent(None)),
        DeliveryPolicy::default(),
    );
    h.outbox
        .gateway()
        .enqueue("ana@example.com", "Hi", "Body")
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let handle = h.outbox.sweeper().spawn(cancel.clone());

    // First tick fires immediately
    for _ in 0..100 {
        if h.store.counts_by_status().await.unwrap().sent == 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert_eq!(h.store.counts_by_status().await.unwrap().sent, 1);

    cancel.cancel();
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("sweeper did not stop")
        .unwrap();
    assert!(h.metrics.sweeper_runs.get() >= 1);
}
