use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use radportal_notifications::directory::{
    AppointmentContext, PatientContact, ReportContext, ReportStatus,
};
use radportal_notifications::gateway::{GatewayReceipt, OutboundSms};
use radportal_notifications::templates::ids;
use radportal_notifications::*;
use time::macros::datetime;
use time::{Duration, OffsetDateTime};

/// Monday 10:00 at +10:00
const MONDAY_MORNING: OffsetDateTime = datetime!(2024-03-04 00:00 UTC);

#[derive(Default)]
struct ScriptedGateway {
    /// Queued results; `false` fails. Empty queue succeeds.
    script: Mutex<VecDeque<bool>>,
    always_fail: bool,
    sent: Mutex<Vec<OutboundSms>>,
}

impl ScriptedGateway {
    fn calls(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl SmsGateway for ScriptedGateway {
    async fn send(&self, message: &OutboundSms) -> Result<GatewayReceipt, NotificationError> {
        self.sent.lock().unwrap().push(message.clone());
        let ok = !self.always_fail && self.script.lock().unwrap().pop_front().unwrap_or(true);
        if !ok {
            return Err(NotificationError::GatewayFailure(
                "provider returned 502: bad gateway".into(),
            ));
        }
        Ok(GatewayReceipt {
            provider_message_id: format!("SM-{}", message.correlation_string),
            status: Some("queued".into()),
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

struct Harness {
    system: NotificationSystem,
    store: Arc<InMemoryNotificationStore>,
    log: Arc<InMemoryDeliveryLog>,
    directory: Arc<InMemoryDirectory>,
    gateway: Arc<ScriptedGateway>,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn new(gateway: ScriptedGateway, now: OffsetDateTime) -> Self {
        let store = Arc::new(InMemoryNotificationStore::new());
        let log = Arc::new(InMemoryDeliveryLog::new());
        let directory = Arc::new(InMemoryDirectory::new());
        let gateway = Arc::new(gateway);
        let clock = Arc::new(ManualClock::new(now));

        let system = NotificationSystem::build(
            Backends {
                notifications: store.clone(),
                consent: Arc::new(InMemoryConsentStore::new()),
                log: log.clone(),
                directory: directory.clone(),
                gateway: gateway.clone(),
                clock: clock.clone(),
            },
            EngineConfig::default(),
        )
        .unwrap();

        Self {
            system,
            store,
            log,
            directory,
            gateway,
            clock,
        }
    }

    async fn row(&self, id: &str) -> NotificationRequest {
        self.system.engine.get(id).await.unwrap().unwrap()
    }

    fn events_for(&self, id: &str) -> Vec<DeliveryEvent> {
        self.log
            .all()
            .into_iter()
            .filter(|e| e.notification_id == id)
            .map(|e| e.event)
            .collect()
    }

    async fn rows_with(&self, status: NotificationStatus) -> Vec<NotificationRequest> {
        self.store.list_by_status(status, 100, 0).await.unwrap()
    }
}

fn patient() -> PatientContact {
    PatientContact {
        patient_id: "p1".into(),
        display_name: "Alex".into(),
        mobile_phone: Some("0412 345 678".into()),
        has_portal_account: true,
    }
}

fn scan_complete() -> NewNotification {
    NewNotification::new("0412345678", ids::SCAN_COMPLETE)
        .for_patient("p1")
        .with_variable("patient_name", "Alex")
}

#[tokio::test]
async fn test_report_ready_consent_denied_is_audited_and_never_sent() {
    let h = Harness::new(ScriptedGateway::default(), MONDAY_MORNING);
    h.directory.add_report(ReportContext {
        report_id: "r1".into(),
        patient: patient(),
        modality: "XR".into(),
        study_description: "Chest X-ray".into(),
        status: ReportStatus::Final,
        is_critical: false,
        critical_notified_at: None,
    });
    h.system
        .consent
        .update_preferences(
            "p1",
            &ConsentUpdate {
                report_ready_notifications: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let outcomes = h
        .system
        .orchestrator
        .handle(&DomainEvent::ReportStatusChanged("r1".into()))
        .await
        .unwrap();
    assert!(matches!(outcomes[0], SendOutcome::ConsentDenied { .. }));
    assert!(
        h.events_for(outcomes[0].notification_id())
            .contains(&DeliveryEvent::ConsentDenied)
    );

    // The GP reminder is re-checked when it comes due
    h.clock.advance(Duration::days(3));
    h.system.engine.process_scheduled().await.unwrap();

    assert_eq!(h.gateway.calls(), 0);
    assert!(h.rows_with(NotificationStatus::Sent).await.is_empty());
    assert_eq!(h.rows_with(NotificationStatus::Cancelled).await.len(), 2);
}

#[tokio::test]
async fn test_appointment_30_hours_out_schedules_two_reminders() {
    let h = Harness::new(ScriptedGateway::default(), MONDAY_MORNING);
    let starts_at = MONDAY_MORNING + Duration::hours(30);
    h.directory.add_appointment(AppointmentContext {
        appointment_id: "a1".into(),
        patient: patient(),
        starts_at,
        procedure: "CT Abdomen".into(),
        location: "Main campus".into(),
    });

    let outcomes = h
        .system
        .orchestrator
        .handle(&DomainEvent::AppointmentBooked("a1".into()))
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 3);
    assert!(matches!(outcomes[0], SendOutcome::Sent { .. }));

    let mut reminders: Vec<_> = h
        .rows_with(NotificationStatus::Scheduled)
        .await
        .into_iter()
        .map(|r| r.scheduled_at.unwrap())
        .collect();
    reminders.sort();
    assert_eq!(
        reminders,
        vec![starts_at - Duration::hours(24), starts_at - Duration::hours(2)]
    );
}

#[tokio::test]
async fn test_appointment_one_hour_out_schedules_no_reminders() {
    let h = Harness::new(ScriptedGateway::default(), MONDAY_MORNING);
    h.directory.add_appointment(AppointmentContext {
        appointment_id: "a1".into(),
        patient: patient(),
        starts_at: MONDAY_MORNING + Duration::hours(1),
        procedure: "X-ray".into(),
        location: "Main campus".into(),
    });

    let outcomes = h
        .system
        .orchestrator
        .handle(&DomainEvent::AppointmentBooked("a1".into()))
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(h.rows_with(NotificationStatus::Scheduled).await.is_empty());
}

#[tokio::test]
async fn test_fails_twice_then_succeeds_on_third_attempt() {
    let gateway = ScriptedGateway {
        script: Mutex::new(VecDeque::from([false, false, true])),
        ..Default::default()
    };
    let h = Harness::new(gateway, MONDAY_MORNING);

    let outcome = h.system.engine.send(scan_complete()).await.unwrap();
    assert!(matches!(outcome, SendOutcome::Failed { .. }));
    let id = outcome.notification_id().to_string();
    assert_eq!(h.row(&id).await.status, NotificationStatus::Failed);

    let first = h.system.retry.retry_eligible().await.unwrap();
    assert_eq!(first.attempted, 1);
    assert_eq!(first.sent, 0);

    let second = h.system.retry.retry_eligible().await.unwrap();
    assert_eq!(second.sent, 1);

    let row = h.row(&id).await;
    assert_eq!(row.status, NotificationStatus::Sent);
    assert_eq!(row.retry_count, 2);
    assert_eq!(row.provider_correlation_id.as_deref(), Some(&*format!("SM-{id}-2")));
    assert_eq!(h.gateway.calls(), 3);
}

#[tokio::test]
async fn test_retry_budget_is_never_exceeded() {
    let gateway = ScriptedGateway {
        always_fail: true,
        ..Default::default()
    };
    let h = Harness::new(gateway, MONDAY_MORNING);
    let id = h
        .system
        .engine
        .send(scan_complete())
        .await
        .unwrap()
        .notification_id()
        .to_string();

    for _ in 0..5 {
        h.system.retry.retry_eligible().await.unwrap();
    }

    let row = h.row(&id).await;
    assert_eq!(row.status, NotificationStatus::Failed);
    assert_eq!(row.retry_count, 3);
    assert_eq!(h.gateway.calls(), 4);
    let exhausted = h
        .events_for(&id)
        .into_iter()
        .filter(|e| *e == DeliveryEvent::RetryExhausted)
        .count();
    assert_eq!(exhausted, 1);
}

#[tokio::test]
async fn test_final_retry_deferred_to_business_hours_still_records_exhaustion() {
    let gateway = ScriptedGateway {
        always_fail: true,
        ..Default::default()
    };
    let h = Harness::new(gateway, MONDAY_MORNING);
    let id = h
        .system
        .engine
        .send(scan_complete())
        .await
        .unwrap()
        .notification_id()
        .to_string();

    h.system.retry.retry_eligible().await.unwrap();
    h.system.retry.retry_eligible().await.unwrap();
    assert_eq!(h.row(&id).await.retry_count, 2);

    // Monday 20:00 at +10:00, after close: the last retry is deferred
    h.clock.set(datetime!(2024-03-04 10:00 UTC));
    let report = h.system.retry.retry_eligible().await.unwrap();
    assert_eq!(report.exhausted, 0);
    let row = h.row(&id).await;
    assert_eq!(row.status, NotificationStatus::Scheduled);
    assert_eq!(row.retry_count, 3);

    // Tuesday opening: the deferred attempt fails for the last time
    h.clock.set(datetime!(2024-03-04 21:00 UTC));
    h.system.engine.process_scheduled().await.unwrap();
    h.system.retry.retry_eligible().await.unwrap();

    let row = h.row(&id).await;
    assert_eq!(row.status, NotificationStatus::Failed);
    assert_eq!(row.retry_count, 3);
    assert_eq!(h.gateway.calls(), 4);
    let exhausted = h
        .events_for(&id)
        .into_iter()
        .filter(|e| *e == DeliveryEvent::RetryExhausted)
        .count();
    assert_eq!(exhausted, 1);
}

/// Accepts every message, but only after the sweeper has released its lease.
struct SlowGateway {
    store: Arc<InMemoryNotificationStore>,
    clock: Arc<ManualClock>,
    calls: Mutex<usize>,
}

#[async_trait]
impl SmsGateway for SlowGateway {
    async fn send(&self, message: &OutboundSms) -> Result<GatewayReceipt, NotificationError> {
        *self.calls.lock().unwrap() += 1;
        self.clock.advance(Duration::seconds(400));
        let lease_timeout = Duration::seconds(EngineConfig::default().retry.lease_timeout_secs as i64);
        self.store
            .release_stale_leases(self.clock.now() - lease_timeout)
            .await?;
        Ok(GatewayReceipt {
            provider_message_id: format!("SM-{}", message.correlation_string),
            status: Some("queued".into()),
        })
    }

    fn name(&self) -> &str {
        "slow"
    }
}

#[tokio::test]
async fn test_send_accepted_after_lease_release_is_kept_and_not_resent() {
    let store = Arc::new(InMemoryNotificationStore::new());
    let clock = Arc::new(ManualClock::new(MONDAY_MORNING));
    let gateway = Arc::new(SlowGateway {
        store: store.clone(),
        clock: clock.clone(),
        calls: Mutex::new(0),
    });
    let system = NotificationSystem::build(
        Backends {
            notifications: store.clone(),
            consent: Arc::new(InMemoryConsentStore::new()),
            log: Arc::new(InMemoryDeliveryLog::new()),
            directory: Arc::new(InMemoryDirectory::new()),
            gateway: gateway.clone(),
            clock: clock.clone(),
        },
        EngineConfig::default(),
    )
    .unwrap();

    let outcome = system.engine.send(scan_complete()).await.unwrap();
    let SendOutcome::Sent {
        notification_id,
        provider_correlation_id,
    } = outcome
    else {
        panic!("expected send, got {outcome:?}");
    };

    let row = system.engine.get(&notification_id).await.unwrap().unwrap();
    assert_eq!(row.status, NotificationStatus::Sent);
    assert_eq!(row.provider_correlation_id, Some(provider_correlation_id));
    assert_eq!(row.last_error, None);

    let report = system.retry.retry_eligible().await.unwrap();
    assert_eq!(report.attempted, 0);
    assert_eq!(*gateway.calls.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_failures_older_than_24_hours_are_not_retried() {
    let gateway = ScriptedGateway {
        script: Mutex::new(VecDeque::from([false])),
        ..Default::default()
    };
    let h = Harness::new(gateway, MONDAY_MORNING);
    let id = h
        .system
        .engine
        .send(scan_complete())
        .await
        .unwrap()
        .notification_id()
        .to_string();

    h.clock.advance(Duration::hours(25));
    let report = h.system.retry.retry_eligible().await.unwrap();

    assert_eq!(report, RetryReport::default());
    assert_eq!(h.row(&id).await.retry_count, 0);
    assert_eq!(h.gateway.calls(), 1);
}

#[tokio::test]
async fn test_saturday_evening_defers_to_monday_and_survives_until_due() {
    // Saturday 17:00 at +10:00
    let h = Harness::new(ScriptedGateway::default(), datetime!(2024-03-09 07:00 UTC));

    let outcome = h.system.engine.send(scan_complete()).await.unwrap();
    let monday_open = datetime!(2024-03-11 07:00 +10);
    let SendOutcome::Scheduled { notification_id, at } = outcome else {
        panic!("expected deferral, got {outcome:?}");
    };
    assert_eq!(at, monday_open);

    // Sunday: still not due
    h.clock.set(datetime!(2024-03-10 02:00 UTC));
    assert_eq!(h.system.engine.process_scheduled().await.unwrap(), 0);
    assert_eq!(h.gateway.calls(), 0);

    h.clock.set(monday_open.to_offset(time::UtcOffset::UTC));
    assert_eq!(h.system.engine.process_scheduled().await.unwrap(), 1);

    let row = h.row(&notification_id).await;
    assert_eq!(row.status, NotificationStatus::Sent);
    assert_eq!(row.scheduled_at, None);
}

#[tokio::test]
async fn test_emergency_bypasses_business_hours() {
    // Sunday 03:00 at +10:00
    let h = Harness::new(ScriptedGateway::default(), datetime!(2024-03-09 17:00 UTC));

    let outcome = h
        .system
        .engine
        .send(
            NewNotification::new("0412345678", ids::CRITICAL_FINDING)
                .for_patient("p1")
                .with_priority(Priority::Emergency),
        )
        .await
        .unwrap();
    assert!(matches!(outcome, SendOutcome::Sent { .. }));
}

#[tokio::test]
async fn test_cancelled_scheduled_request_is_never_dispatched() {
    let h = Harness::new(ScriptedGateway::default(), MONDAY_MORNING);
    let outcome = h
        .system
        .engine
        .send(scan_complete().not_before(MONDAY_MORNING + Duration::hours(2)))
        .await
        .unwrap();
    let id = outcome.notification_id().to_string();

    assert!(h.system.engine.cancel(&id).await.unwrap());
    assert!(!h.system.engine.cancel(&id).await.unwrap());

    h.clock.advance(Duration::hours(3));
    h.system.engine.process_scheduled().await.unwrap();

    assert_eq!(h.row(&id).await.status, NotificationStatus::Cancelled);
    assert_eq!(h.gateway.calls(), 0);
}

#[tokio::test]
async fn test_provider_callback_marks_delivered() {
    let h = Harness::new(ScriptedGateway::default(), MONDAY_MORNING);
    let outcome = h.system.engine.send(scan_complete()).await.unwrap();
    let SendOutcome::Sent {
        notification_id,
        provider_correlation_id,
    } = outcome
    else {
        panic!("expected send");
    };

    h.system
        .tracker
        .on_provider_callback(&provider_correlation_id, "DELIVRD", None)
        .await
        .unwrap();

    assert_eq!(h.row(&notification_id).await.status, NotificationStatus::Delivered);
    assert_eq!(
        h.events_for(&notification_id),
        vec![
            DeliveryEvent::Created,
            DeliveryEvent::ConsentAllowed,
            DeliveryEvent::DispatchAttempt,
            DeliveryEvent::Sent,
            DeliveryEvent::Delivered,
        ]
    );
}

#[tokio::test]
async fn test_stale_lease_is_released_and_retried() {
    let h = Harness::new(ScriptedGateway::default(), MONDAY_MORNING);
    let request = NotificationRequest::from_new("stuck".into(), scan_complete(), MONDAY_MORNING);
    h.store.insert(&request).await.unwrap();
    h.store
        .claim("stuck", &[NotificationStatus::Pending], MONDAY_MORNING)
        .await
        .unwrap();

    h.clock.advance(Duration::minutes(10));
    assert_eq!(h.system.engine.release_stale_leases().await.unwrap(), 1);
    assert_eq!(h.row("stuck").await.status, NotificationStatus::Failed);

    h.system.retry.retry_eligible().await.unwrap();
    let row = h.row("stuck").await;
    assert_eq!(row.status, NotificationStatus::Sent);
    assert_eq!(row.retry_count, 1);
}

#[tokio::test]
async fn test_stop_keyword_suppresses_later_messages() {
    let h = Harness::new(ScriptedGateway::default(), MONDAY_MORNING);
    h.directory.add_patient(patient());

    let opted_out = h
        .system
        .consent
        .process_opt_out_keyword("+61412345678", "stop please")
        .await
        .unwrap();
    assert_eq!(opted_out, vec!["p1".to_string()]);

    let outcome = h.system.engine.send(scan_complete()).await.unwrap();
    assert!(matches!(outcome, SendOutcome::ConsentDenied { .. }));
    assert_eq!(h.gateway.calls(), 0);
}

#[tokio::test]
async fn test_validation_errors_are_synchronous_and_not_persisted() {
    let h = Harness::new(ScriptedGateway::default(), MONDAY_MORNING);

    let err = h
        .system
        .engine
        .send(NewNotification::new("0412345678", "no_such_template"))
        .await
        .unwrap_err();
    assert!(err.is_validation());

    let err = h
        .system
        .engine
        .send(NewNotification::new("12", ids::SCAN_COMPLETE))
        .await
        .unwrap_err();
    assert!(matches!(err, NotificationError::InvalidRecipient(_)));

    assert_eq!(h.system.engine.stats().await.unwrap(), NotificationStats::default());
}
