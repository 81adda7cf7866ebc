//! End-to-end scheduler scenarios against an in-memory store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc, Weekday};
use uuid::Uuid;

use outreach_engine::channels::{
    ChannelAdapter, ChannelRegistry, DispatchResult, OutboundMessage,
};
use outreach_engine::compose::SignatureComposer;
use outreach_engine::config::EngineConfig;
use outreach_engine::engine::{EngineContext, ManualClock, Scheduler};
use outreach_engine::governor::RateGovernor;
use outreach_engine::model::{
    Channel, Enrollment, EnrollmentStatus, PersonalizationMode, Recipient, SendWindow, Sender,
    Sequence, Step, WarmupState,
};
use outreach_engine::personalize::Personalizer;
use outreach_engine::store::{LibSqlStore, Store};

/// Email adapter that accepts everything and records recipients in order.
struct RecordingAdapter {
    sent_to: Mutex<Vec<String>>,
}

impl RecordingAdapter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent_to: Mutex::new(Vec::new()),
        })
    }

    fn sent(&self) -> Vec<String> {
        self.sent_to.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelAdapter for RecordingAdapter {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn dispatch(&self, message: &OutboundMessage, _sender: &Sender) -> DispatchResult {
        if let OutboundMessage::Email { to, .. } = message {
            self.sent_to.lock().unwrap().push(to.clone());
        }
        DispatchResult::sent(None)
    }
}

struct Harness {
    scheduler: Scheduler,
    store: Arc<LibSqlStore>,
    clock: ManualClock,
    adapter: Arc<RecordingAdapter>,
}

/// Monday 2026-07-06 09:00 UTC.
fn monday_9() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 7, 6, 9, 0, 0).unwrap()
}

fn business_week_window() -> SendWindow {
    SendWindow {
        days: vec![
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
        ],
        start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
        end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
        timezone: chrono_tz::UTC,
    }
}

async fn harness(start: DateTime<Utc>) -> Harness {
    let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
    let clock = ManualClock::new(start);
    let adapter = RecordingAdapter::new();
    let mut registry = ChannelRegistry::new();
    registry.register(adapter.clone());

    let ctx = Arc::new(EngineContext {
        config: EngineConfig::default(),
        store: store.clone(),
        clock: Arc::new(clock.clone()),
        governor: Arc::new(RateGovernor::new(store.clone())),
        channels: Arc::new(registry),
        personalizer: Arc::new(Personalizer::new(None)),
        composer: Arc::new(SignatureComposer::new()),
        sessions: None,
    });

    Harness {
        scheduler: Scheduler::new(ctx),
        store,
        clock,
        adapter,
    }
}

async fn seed_sender(store: &LibSqlStore, daily_cap: u32) {
    store
        .upsert_sender(&Sender {
            email: "aaron@example.io".into(),
            name: "Aaron".into(),
            title: "Engineer".into(),
            phone: "555".into(),
            signature_rich: String::new(),
            signature_plain: String::new(),
            warmup: WarmupState::default(),
            daily_cap,
            on_hold: false,
            window: business_week_window(),
        })
        .await
        .unwrap();
}

async fn seed_recipient(store: &LibSqlStore, id: &str, first_name: &str) {
    store
        .upsert_recipient(&Recipient {
            id: id.into(),
            first_name: first_name.into(),
            last_name: "Chen".into(),
            email: format!("{id}@acme.test"),
            title: "Director".into(),
            phone: None,
            network_url: None,
            company: "Acme".into(),
            industry: "Logistics".into(),
            attributes: HashMap::new(),
        })
        .await
        .unwrap();
}

fn drip_sequence() -> Sequence {
    Sequence {
        id: Uuid::new_v4(),
        campaign_id: "camp-1".into(),
        name: "Drip".into(),
        sender_email: "aaron@example.io".into(),
        steps: vec![
            Step::Email {
                delay_days: 0,
                template_key: None,
                subject: Some("Hi {{first_name}}".into()),
                body: Some("Hello {{first_name}}".into()),
                personalization_mode: PersonalizationMode::SignalBased,
            },
            Step::Wait { delay_days: 3 },
            Step::Email {
                delay_days: 0,
                template_key: None,
                subject: Some("Following up".into()),
                body: Some("Still interested?".into()),
                personalization_mode: PersonalizationMode::SignalBased,
            },
        ],
        created_at: monday_9(),
    }
}

#[tokio::test]
async fn two_email_drip_runs_to_completion() {
    let start = Utc.with_ymd_and_hms(2026, 7, 6, 10, 0, 0).unwrap();
    let h = harness(start).await;
    seed_sender(&h.store, 50).await;
    seed_recipient(&h.store, "r-1", "Mia").await;

    let sequence = drip_sequence();
    h.store.create_sequence(&sequence).await.unwrap();
    let enrollment = Enrollment::new("r-1", sequence.id, start);
    h.store.create_enrollment(&enrollment).await.unwrap();

    // First sweep: the intro email goes out and the enrollment waits.
    assert_eq!(h.scheduler.process_due().await.unwrap(), 1);
    let row = h.store.get_enrollment(enrollment.id).await.unwrap().unwrap();
    assert_eq!(row.status, EnrollmentStatus::Waiting);
    assert_eq!(row.step_index, 2);
    assert_eq!(row.due_at, start + Duration::days(3));
    assert_eq!(h.adapter.sent(), vec!["r-1@acme.test".to_string()]);

    let log = h.store.list_log_for_enrollment(enrollment.id).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].subject.as_deref(), Some("Hi Mia"));

    // Not due yet: nothing claimed a day early.
    h.clock.set(start + Duration::days(2));
    assert_eq!(h.scheduler.process_due().await.unwrap(), 0);

    // Thursday: follow-up sends and the sequence completes.
    h.clock.set(start + Duration::days(3));
    assert_eq!(h.scheduler.process_due().await.unwrap(), 1);
    let row = h.store.get_enrollment(enrollment.id).await.unwrap().unwrap();
    assert_eq!(row.status, EnrollmentStatus::Completed);
    assert_eq!(h.adapter.sent().len(), 2);

    let log = h.store.list_log_for_enrollment(enrollment.id).await.unwrap();
    assert_eq!(log.len(), 2);
    // Monotone progress: step indices never go backwards.
    assert!(log.windows(2).all(|w| w[0].step_index <= w[1].step_index));
}

#[tokio::test]
async fn quota_exhaustion_rolls_over_in_enrollment_id_order() {
    let h = harness(monday_9()).await;
    seed_sender(&h.store, 3).await;

    let sequence = Sequence {
        steps: vec![Step::Email {
            delay_days: 0,
            template_key: None,
            subject: Some("Hi {{first_name}}".into()),
            body: Some("Hello".into()),
            personalization_mode: PersonalizationMode::SignalBased,
        }],
        ..drip_sequence()
    };
    h.store.create_sequence(&sequence).await.unwrap();

    let mut by_enrollment_id: Vec<(String, String)> = Vec::new();
    for i in 0..5 {
        let recipient_id = format!("r-{i}");
        seed_recipient(&h.store, &recipient_id, "Lee").await;
        let enrollment = Enrollment::new(&recipient_id, sequence.id, monday_9());
        h.store.create_enrollment(&enrollment).await.unwrap();
        by_enrollment_id.push((
            enrollment.id.to_string(),
            format!("{recipient_id}@acme.test"),
        ));
    }
    by_enrollment_id.sort();
    let expected: Vec<String> = by_enrollment_id
        .iter()
        .map(|(_, email)| email.clone())
        .collect();

    // Monday: exactly three send, in enrollment-id order.
    assert_eq!(h.scheduler.process_due().await.unwrap(), 5);
    assert_eq!(h.adapter.sent(), expected[..3].to_vec());

    assert_eq!(
        h.store
            .warmup_count("aaron@example.io", monday_9().date_naive())
            .await
            .unwrap(),
        3
    );

    // The two denied enrollments rolled to Tuesday 09:00.
    let tuesday_9 = Utc.with_ymd_and_hms(2026, 7, 7, 9, 0, 0).unwrap();
    for (id, _) in &by_enrollment_id[3..] {
        let row = h
            .store
            .get_enrollment(Uuid::parse_str(id).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, EnrollmentStatus::Pending);
        assert_eq!(row.due_at, tuesday_9);
        assert_eq!(row.attempts, 0);
    }

    // Tuesday: the remaining two send, still in id order.
    h.clock.set(tuesday_9);
    assert_eq!(h.scheduler.process_due().await.unwrap(), 2);
    assert_eq!(h.adapter.sent(), expected);
    assert_eq!(
        h.store
            .warmup_count("aaron@example.io", tuesday_9.date_naive())
            .await
            .unwrap(),
        2
    );
}

#[tokio::test]
async fn stale_in_flight_rows_recover_on_startup() {
    let h = harness(monday_9()).await;
    seed_sender(&h.store, 50).await;
    seed_recipient(&h.store, "r-1", "Mia").await;

    let sequence = drip_sequence();
    h.store.create_sequence(&sequence).await.unwrap();

    // Simulate a crash: a row claimed 30 minutes ago, never finished.
    let stale_at = monday_9() - Duration::minutes(30);
    let enrollment = Enrollment::new("r-1", sequence.id, stale_at);
    h.store.create_enrollment(&enrollment).await.unwrap();
    h.store
        .try_claim_enrollment(enrollment.id, 0, stale_at)
        .await
        .unwrap();

    h.scheduler.recover().await.unwrap();
    let row = h.store.get_enrollment(enrollment.id).await.unwrap().unwrap();
    assert_eq!(row.status, EnrollmentStatus::Pending);
    assert_eq!(row.attempts, 1);

    // And the recovered row is picked up by the next sweep.
    assert_eq!(h.scheduler.process_due().await.unwrap(), 1);
    assert_eq!(h.adapter.sent().len(), 1);
}

#[tokio::test]
async fn paused_sender_holds_everything() {
    let h = harness(monday_9()).await;
    seed_sender(&h.store, 50).await;
    h.store
        .set_sender_hold("aaron@example.io", true)
        .await
        .unwrap();
    seed_recipient(&h.store, "r-1", "Mia").await;

    let sequence = drip_sequence();
    h.store.create_sequence(&sequence).await.unwrap();
    let enrollment = Enrollment::new("r-1", sequence.id, monday_9());
    h.store.create_enrollment(&enrollment).await.unwrap();

    assert_eq!(h.scheduler.process_due().await.unwrap(), 1);
    assert!(h.adapter.sent().is_empty());

    let row = h.store.get_enrollment(enrollment.id).await.unwrap().unwrap();
    assert_eq!(row.status, EnrollmentStatus::Pending);
    assert_eq!(row.step_index, 0);
    assert!(row.due_at > monday_9());
}
