//! Command layer against a temporary queue directory.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::uninlined_format_args
)]

use refinery::{
    commands::{
        engine,
        events::{self, EventsOptions},
        mq::{self, SubmitOptions},
    },
    AppContext, OutputFormat,
};
use refinery_core::{EventType, MrStatus, RefineryConfig};
use tempfile::TempDir;

fn context(dir: &TempDir) -> AppContext {
    AppContext {
        config: RefineryConfig {
            queue_dir: dir.path().join("queue"),
            repo_path: dir.path().to_path_buf(),
            rig: Some("gastown".into()),
            ..RefineryConfig::default()
        },
        worker_id: "polecat-1".into(),
        format: OutputFormat::Json,
    }
}

fn submit_options(branch: &str, priority: i32) -> SubmitOptions {
    SubmitOptions {
        branch: branch.into(),
        target: None,
        issue: Some("gt-12".into()),
        worker: None,
        title: None,
        priority,
        agent_bead: None,
    }
}

#[tokio::test]
async fn submit_records_mr_and_event() {
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir);

    mq::submit(&ctx, &submit_options("work/a", 2)).await.unwrap();

    let records = ctx.store().await.unwrap().list().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].branch, "work/a");
    assert_eq!(records[0].target, "main");
    assert_eq!(records[0].rig, "gastown");
    assert_eq!(records[0].worker, "polecat-1");

    let log = ctx.events().read_all("gastown").await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].event_type, EventType::MrSubmitted);
    assert_eq!(log[0].mr_id, records[0].id);

    events::run(
        &ctx,
        &EventsOptions {
            tail: Some(5),
            rig: None,
        },
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn claim_then_release_round_trip() {
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir);
    mq::submit(&ctx, &submit_options("work/a", 1)).await.unwrap();
    let store = ctx.store().await.unwrap();
    let id = store.list().await.unwrap()[0].id.to_string();

    mq::claim(&ctx, &id).await.unwrap();
    let claimed = store.get(&id.as_str().into()).await.unwrap();
    assert_eq!(claimed.status, MrStatus::InProgress);
    assert!(claimed.is_claimed_by("polecat-1"));

    let other = AppContext {
        worker_id: "polecat-2".into(),
        ..ctx.clone()
    };
    let err = mq::claim(&other, &id).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<refinery_core::Error>(),
        Some(refinery_core::Error::AlreadyClaimed { .. })
    ));

    mq::release(&ctx, &id).await.unwrap();
    let released = store.get(&id.as_str().into()).await.unwrap();
    assert_eq!(released.status, MrStatus::Open);
    assert!(released.claim.is_none());
}

#[tokio::test]
async fn missing_record_maps_to_not_found_exit_code() {
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir);

    let err = mq::show(&ctx, "mr-missing").await.unwrap_err();
    let code = err
        .downcast_ref::<refinery_core::Error>()
        .map_or(1, refinery_core::Error::exit_code);
    assert_eq!(code, 3);

    // removing an absent record is not an error
    mq::remove(&ctx, "mr-missing").await.unwrap();
}

#[tokio::test]
async fn pause_and_resume_toggle_marker() {
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir);
    let board = ctx.status_board();

    engine::pause(&ctx).await.unwrap();
    assert!(board.is_paused().await.unwrap());
    engine::status(&ctx).await.unwrap();

    engine::resume(&ctx).await.unwrap();
    assert!(!board.is_paused().await.unwrap());
    engine::resume(&ctx).await.unwrap();
}
