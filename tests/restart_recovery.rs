//! Startup recovery over a real database file: chat tasks orphaned by a
//! dead process are failed, submitted generation jobs survive the restart.

use gend::storage::{NewTask, Storage, TaskKind};

#[tokio::test]
async fn orphaned_chat_tasks_fail_on_restart_but_jobs_survive() {
    let dir = tempfile::tempdir().unwrap();

    let chat_id;
    let image_id;
    {
        let storage = Storage::new(dir.path()).await.unwrap();
        let chat = storage
            .create_task(NewTask {
                user_id: "u1".into(),
                conversation_id: Some("conv-1".into()),
                kind: TaskKind::Chat,
                model: "chat-model".into(),
                credits_locked: 0,
                credit_tx_id: None,
            })
            .await
            .unwrap();
        storage.mark_task_running(&chat.id).await.unwrap();
        storage.update_accumulated(&chat.id, "partial out").await.unwrap();
        chat_id = chat.id;

        let image = storage
            .create_task(NewTask {
                user_id: "u1".into(),
                conversation_id: None,
                kind: TaskKind::Image,
                model: "image-model".into(),
                credits_locked: 10,
                credit_tx_id: None,
            })
            .await
            .unwrap();
        storage.set_external_id(&image.id, "ext-1").await.unwrap();
        storage.mark_task_running(&image.id).await.unwrap();
        image_id = image.id;
        // Process "dies" here; nothing finalized either task.
    }

    let storage = Storage::new(dir.path()).await.unwrap();
    let recovered = storage.recover_orphaned_chat_tasks().await.unwrap();
    assert_eq!(recovered, 1);

    let chat = storage.get_task(&chat_id).await.unwrap().unwrap();
    assert_eq!(chat.status, "failed");
    assert_eq!(chat.error_code.as_deref(), Some("interrupted"));
    // The flushed transcript is still there for the client to fetch.
    assert_eq!(chat.accumulated_output, "partial out");

    let image = storage.get_task(&image_id).await.unwrap().unwrap();
    assert_eq!(image.status, "running");
    assert_eq!(image.external_id.as_deref(), Some("ext-1"));

    // The poller picks the surviving job up on its next pass.
    let active = storage.list_active_tasks().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, image_id);
}
