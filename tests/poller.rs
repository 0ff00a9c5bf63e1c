//! Poll-pass behavior: status mapping, error handling, the stuck-task sweep,
//! and subscriber notification on terminal transitions.

mod common;

use std::time::Duration;

use gend::poller::PollerSettings;
use gend::provider::{JobState, JobStatus, ProviderError};
use gend::storage::{NewTask, TaskKind};
use gend::ws::protocol::ServerMessageType;

use common::Harness;

fn fast_settings() -> PollerSettings {
    PollerSettings {
        interval: Duration::from_millis(10),
        chat_timeout_minutes: 10,
        image_timeout_minutes: 10,
        video_timeout_minutes: 30,
        qps_limit: 4,
    }
}

fn job(state: JobState) -> JobStatus {
    JobStatus {
        state,
        result_json: None,
        credits_consumed: None,
        fail_code: None,
        fail_message: None,
    }
}

async fn submitted_task(h: &Harness, user: &str, kind: TaskKind, external_id: &str) -> String {
    let task = h
        .storage
        .create_task(NewTask {
            user_id: user.into(),
            conversation_id: None,
            kind,
            model: "gen-model".into(),
            credits_locked: 10,
            credit_tx_id: None,
        })
        .await
        .unwrap();
    let tx_id = h.ledger.lock(user, &task.id, 10, kind.as_str()).await.unwrap();
    h.storage.set_credit_tx_id(&task.id, &tx_id).await.unwrap();
    h.storage.set_external_id(&task.id, external_id).await.unwrap();
    task.id
}

#[tokio::test]
async fn in_flight_states_promote_pending_to_running() {
    let h = Harness::new().await;
    h.ledger.grant("u1", 100).await.unwrap();
    let task_id = submitted_task(&h, "u1", TaskKind::Image, "ext-a").await;
    h.provider.script_status("ext-a", Ok(job(JobState::Generating)));

    let poller = h.poller(fast_settings());
    poller.poll_once().await;

    let row = h.storage.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(row.status, "running");
    assert!(row.last_polled_at.is_some());
    // Still locked; nothing settled yet.
    assert_eq!(h.ledger.balance("u1").await.unwrap(), 90);
}

#[tokio::test]
async fn success_state_completes_confirms_and_notifies() {
    let h = Harness::new().await;
    h.ledger.grant("u1", 100).await.unwrap();
    let task_id = submitted_task(&h, "u1", TaskKind::Image, "ext-b").await;
    h.provider.script_status(
        "ext-b",
        Ok(JobStatus {
            state: JobState::Success,
            result_json: Some(r#"{"resultUrls":["https://cdn.example/img.png"]}"#.into()),
            credits_consumed: Some(7),
            fail_code: None,
            fail_message: None,
        }),
    );

    // A client is watching this task.
    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    let conn = h.connections.register("u1", tx);
    let _ = h.connections.subscribe(&conn, &task_id, -1);

    let poller = h.poller(fast_settings());
    poller.poll_once().await;

    let row = h.storage.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(row.status, "completed");
    assert_eq!(row.credits_used, 7);
    assert_eq!(h.ledger.balance("u1").await.unwrap(), 90);

    let frame = rx.try_recv().unwrap();
    assert_eq!(frame.message_type, ServerMessageType::TaskStatus);
    assert_eq!(frame.task_id.as_deref(), Some(task_id.as_str()));
    assert_eq!(frame.payload["status"], "completed");
    assert_eq!(
        frame.payload["result"]["resultUrls"][0],
        "https://cdn.example/img.png"
    );

    let credits = rx.try_recv().unwrap();
    assert_eq!(credits.message_type, ServerMessageType::CreditsChanged);
    assert_eq!(credits.payload["balance"], 90);
}

#[tokio::test]
async fn failed_state_fails_task_and_refunds_lock() {
    let h = Harness::new().await;
    h.ledger.grant("u1", 100).await.unwrap();
    let task_id = submitted_task(&h, "u1", TaskKind::Video, "ext-c").await;
    h.provider.script_status(
        "ext-c",
        Ok(JobStatus {
            state: JobState::Failed,
            result_json: None,
            credits_consumed: None,
            fail_code: Some("moderation".into()),
            fail_message: Some("content rejected".into()),
        }),
    );

    let poller = h.poller(fast_settings());
    poller.poll_once().await;

    let row = h.storage.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(row.status, "failed");
    assert_eq!(row.error_code.as_deref(), Some("moderation"));
    assert_eq!(h.ledger.balance("u1").await.unwrap(), 100);
}

#[tokio::test]
async fn query_error_leaves_task_eligible_for_next_pass() {
    let h = Harness::new().await;
    h.ledger.grant("u1", 100).await.unwrap();
    let task_id = submitted_task(&h, "u1", TaskKind::Image, "ext-d").await;
    h.provider.script_status("ext-d", Err(ProviderError::Timeout));

    let poller = h.poller(fast_settings());
    poller.poll_once().await;

    let row = h.storage.get_task(&task_id).await.unwrap().unwrap();
    // Only the poll marker moved; status and the credit lock are untouched.
    assert_eq!(row.status, "pending");
    assert!(row.last_polled_at.is_some());
    assert_eq!(h.ledger.balance("u1").await.unwrap(), 90);
}

#[tokio::test]
async fn chat_tasks_are_never_queried() {
    let h = Harness::new().await;
    let chat = h
        .storage
        .create_task(NewTask {
            user_id: "u1".into(),
            conversation_id: None,
            kind: TaskKind::Chat,
            model: "chat-model".into(),
            credits_locked: 0,
            credit_tx_id: None,
        })
        .await
        .unwrap();
    h.storage.mark_task_running(&chat.id).await.unwrap();

    let poller = h.poller(fast_settings());
    poller.poll_once().await;

    assert_eq!(h.provider.query_count(), 0);
    let row = h.storage.get_task(&chat.id).await.unwrap().unwrap();
    assert_eq!(row.status, "running");
}

#[tokio::test]
async fn sweep_times_out_overdue_tasks_per_kind() {
    let h = Harness::new().await;
    h.ledger.grant("u1", 100).await.unwrap();

    // Negative budgets make every active task overdue immediately, without
    // waiting for wall-clock minutes to pass.
    let mut settings = fast_settings();
    settings.image_timeout_minutes = -1;
    settings.chat_timeout_minutes = -1;

    let image_id = submitted_task(&h, "u1", TaskKind::Image, "ext-e").await;
    h.provider.script_status("ext-e", Ok(job(JobState::Generating)));

    let video_id = submitted_task(&h, "u1", TaskKind::Video, "ext-f").await;
    h.provider.script_status("ext-f", Ok(job(JobState::Generating)));

    let chat = h
        .storage
        .create_task(NewTask {
            user_id: "u1".into(),
            conversation_id: None,
            kind: TaskKind::Chat,
            model: "chat-model".into(),
            credits_locked: 0,
            credit_tx_id: None,
        })
        .await
        .unwrap();

    let poller = h.poller(settings);
    poller.sweep_stuck().await.unwrap();

    let image = h.storage.get_task(&image_id).await.unwrap().unwrap();
    assert_eq!(image.status, "failed");
    assert_eq!(image.error_code.as_deref(), Some("timeout"));

    let chat = h.storage.get_task(&chat.id).await.unwrap().unwrap();
    assert_eq!(chat.status, "failed");

    // Video has a longer budget and stays in flight.
    let video = h.storage.get_task(&video_id).await.unwrap().unwrap();
    assert_eq!(video.status, "pending");

    // The image lock came back; the video lock is still held.
    assert_eq!(h.ledger.balance("u1").await.unwrap(), 90);
}
