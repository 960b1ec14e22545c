use std::sync::Arc;

use radportal_notifications::directory::{PatientContact, StudyContext};
use radportal_notifications::{
    Backends, EngineConfig, InMemoryConsentStore, InMemoryDeliveryLog, InMemoryDirectory,
    InMemoryNotificationStore, LoggingGateway, ManualClock, NotificationSystem,
};
use radportal_server::{AppState, build_app};
use serde_json::{Value, json};
use time::macros::datetime;
use tokio::task::JoinHandle;

fn directory() -> Arc<InMemoryDirectory> {
    let directory = Arc::new(InMemoryDirectory::new());
    let patient = PatientContact {
        patient_id: "p1".into(),
        display_name: "Jordan Lee".into(),
        mobile_phone: Some("0412 345 678".into()),
        has_portal_account: false,
    };
    directory.add_patient(patient.clone());
    directory.add_study(StudyContext {
        study_id: "s1".into(),
        patient,
        modality: "CT".into(),
        study_description: "CT Chest".into(),
    });
    directory
}

async fn start_server() -> (String, tokio::sync::oneshot::Sender<()>, JoinHandle<()>) {
    let backends = Backends {
        notifications: Arc::new(InMemoryNotificationStore::new()),
        consent: Arc::new(InMemoryConsentStore::new()),
        log: Arc::new(InMemoryDeliveryLog::new()),
        directory: directory(),
        gateway: Arc::new(LoggingGateway::new()),
        // Monday 10:00 at the default +10:00 facility offset
        clock: Arc::new(ManualClock::new(datetime!(2024-03-04 00:00 UTC))),
    };
    let system = NotificationSystem::build(backends, EngineConfig::default()).expect("build system");
    let state = AppState {
        system,
        pool: None,
        metrics: None,
    };
    let app = build_app(state, 64 * 1024);

    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = rx.await;
            })
            .await;
    });
    (format!("http://{addr}"), tx, server)
}

#[tokio::test]
async fn health_reports_memory_storage() {
    let (base, tx, server) = start_server().await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["storage"], "memory");

    let _ = tx.send(());
    let _ = server.await;
}

#[tokio::test]
async fn metrics_without_recorder_is_unavailable() {
    let (base, tx, server) = start_server().await;

    let resp = reqwest::get(format!("{base}/metrics")).await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);

    let _ = tx.send(());
    let _ = server.await;
}

#[tokio::test]
async fn scan_event_sends_invite_and_callback_marks_delivered() {
    let (base, tx, server) = start_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/automation/events"))
        .json(&json!({ "event": "scan_completed", "entityId": "s1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["event"], "scan_completed");
    let outcomes = body["outcomes"].as_array().unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0]["outcome"], "sent");
    let id = outcomes[0]["notification_id"].as_str().unwrap().to_string();
    let provider_id = outcomes[0]["provider_correlation_id"]
        .as_str()
        .unwrap()
        .to_string();

    let resp = client
        .post(format!("{base}/webhooks/sms/status"))
        .json(&json!({ "providerMessageId": provider_id, "status": "delivered" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    let detail: Value = client
        .get(format!("{base}/notifications/{id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(detail["notification"]["status"], "delivered");
    assert_eq!(detail["notification"]["templateType"], "scan_registration_invite");
    let events: Vec<&str> = detail["history"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["event"].as_str().unwrap())
        .collect();
    assert_eq!(events.first(), Some(&"created"));
    assert_eq!(events.last(), Some(&"delivered"));

    let stats: Value = client
        .get(format!("{base}/notifications/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["delivered"], 1);

    let _ = tx.send(());
    let _ = server.await;
}

#[tokio::test]
async fn unknown_callback_id_is_acknowledged() {
    let (base, tx, server) = start_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/webhooks/sms/status"))
        .json(&json!({ "providerMessageId": "SM-unknown", "status": "DELIVRD" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    let _ = tx.send(());
    let _ = server.await;
}

#[tokio::test]
async fn bad_requests_map_to_client_errors() {
    let (base, tx, server) = start_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/automation/events"))
        .json(&json!({ "event": "study_archived", "entityId": "s1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "invalid");

    let resp = client
        .post(format!("{base}/automation/events"))
        .json(&json!({ "event": "scan_completed", "entityId": "missing" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

    let resp = client
        .get(format!("{base}/notifications/nope"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

    let _ = tx.send(());
    let _ = server.await;
}

#[tokio::test]
async fn preferences_and_stop_keyword() {
    let (base, tx, server) = start_server().await;
    let client = reqwest::Client::new();

    let prefs: Value = client
        .get(format!("{base}/patients/p1/sms-preferences"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(prefs["appointmentNotifications"], true);

    let prefs: Value = client
        .patch(format!("{base}/patients/p1/sms-preferences"))
        .json(&json!({ "appointmentNotifications": false }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(prefs["appointmentNotifications"], false);
    assert_eq!(prefs["reportReadyNotifications"], true);

    let resp: Value = client
        .post(format!("{base}/webhooks/sms/inbound"))
        .json(&json!({ "from": "+61412345678", "body": "stop please" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["optedOut"], json!(["p1"]));

    let prefs: Value = client
        .get(format!("{base}/patients/p1/sms-preferences"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(prefs["optedOutAt"].is_string());
    assert_eq!(prefs["reportReadyNotifications"], false);

    let prefs: Value = client
        .post(format!("{base}/patients/p1/sms-preferences/resubscribe"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(prefs["optedOutAt"].is_null());
    assert_eq!(prefs["reportReadyNotifications"], true);

    let _ = tx.send(());
    let _ = server.await;
}
