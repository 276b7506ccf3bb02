use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;
use vigil_db::{
    ClaimPolicy, DbError, EventStatus, InsertOutcome, NewEvent, NewUpload, ReleaseOutcome,
    RetrySchedule, UploadStatus, VigilDb,
};
use vigil_ids::{EventId, UploadId};

struct FixedDelay(i64);

impl RetrySchedule for FixedDelay {
    fn delay_ms(&self, _upload_id: &UploadId, _attempts: u32) -> i64 {
        self.0
    }
}

const LEASE_MS: i64 = 1_000;
const NO_DELAY: FixedDelay = FixedDelay(0);

fn policy(max_attempts: u32, schedule: &dyn RetrySchedule) -> ClaimPolicy<'_> {
    ClaimPolicy {
        lease_ms: LEASE_MS,
        max_attempts,
        schedule,
    }
}

fn new_upload(id: &str) -> NewUpload {
    NewUpload {
        id: UploadId::parse(id).unwrap(),
        filepath: PathBuf::from(format!("/clips/{}.mp4", id)),
        file_size: 10 * 1024 * 1024,
        checksum: format!("{:0>64}", id.len()),
    }
}

async fn seed(db: &VigilDb, event: &str, uploads: &[&str]) -> EventId {
    let outcome = db
        .insert_event(
            NewEvent {
                id: EventId::parse(event).unwrap(),
                payload: json!({"camera_id": "cam-1", "type": "person"}),
                dedup_key: None,
            },
            uploads.iter().map(|id| new_upload(id)).collect(),
            0,
        )
        .await
        .unwrap();
    outcome.event_id().clone()
}

fn uid(id: &str) -> UploadId {
    UploadId::parse(id).unwrap()
}

#[tokio::test]
async fn test_insert_event_with_uploads() {
    let db = VigilDb::open_memory().await.unwrap();
    let event_id = seed(&db, "ev-1", &["up-1", "up-2"]).await;

    let event = db.get_event(&event_id).await.unwrap().unwrap();
    assert_eq!(event.status, EventStatus::PendingUpload);
    assert_eq!(event.payload["camera_id"], "cam-1");

    let jobs = db.uploads_for_event(&event_id).await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|j| j.status == UploadStatus::Pending && j.attempts == 0));
}

#[tokio::test]
async fn test_insert_rejects_event_without_uploads() {
    let db = VigilDb::open_memory().await.unwrap();
    let result = db
        .insert_event(
            NewEvent {
                id: EventId::parse("ev-empty").unwrap(),
                payload: json!({}),
                dedup_key: None,
            },
            Vec::new(),
            0,
        )
        .await;
    assert!(matches!(result, Err(DbError::Constraint(_))));
    assert!(db.get_event(&EventId::parse("ev-empty").unwrap()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_insert_is_atomic_on_duplicate_upload_id() {
    let db = VigilDb::open_memory().await.unwrap();
    seed(&db, "ev-1", &["up-1"]).await;

    let result = db
        .insert_event(
            NewEvent {
                id: EventId::parse("ev-2").unwrap(),
                payload: json!({}),
                dedup_key: None,
            },
            vec![new_upload("up-2"), new_upload("up-1")],
            0,
        )
        .await;
    assert!(result.is_err());
    assert!(db.get_event(&EventId::parse("ev-2").unwrap()).await.unwrap().is_none());
    assert!(db.get_upload(&uid("up-2")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_dedup_key_returns_existing_event() {
    let db = VigilDb::open_memory().await.unwrap();
    let make = |event: &str| NewEvent {
        id: EventId::parse(event).unwrap(),
        payload: json!({"source": "clip_request"}),
        dedup_key: Some("cam-1|range|sha".to_string()),
    };

    let first = db
        .insert_event(make("ev-a"), vec![new_upload("up-a")], 0)
        .await
        .unwrap();
    let second = db
        .insert_event(make("ev-b"), vec![new_upload("up-b")], 5)
        .await
        .unwrap();

    assert!(first.is_created());
    assert_eq!(second, InsertOutcome::Existing(EventId::parse("ev-a").unwrap()));
    assert!(db.get_upload(&uid("up-b")).await.unwrap().is_none());
    assert_eq!(db.queue_stats().await.unwrap().events_pending, 1);
}

#[tokio::test]
async fn test_claim_on_empty_store_is_none() {
    let db = VigilDb::open_memory().await.unwrap();
    assert!(db.claim_next_upload(&policy(5, &NO_DELAY), 0).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_are_mutually_exclusive() {
    let tmp = TempDir::new().unwrap();
    let db = VigilDb::open(tmp.path().join("vigil.sqlite3")).await.unwrap();
    seed(&db, "ev-1", &["up-1"]).await;

    let db = Arc::new(db);
    let mut handles = Vec::new();
    for _ in 0..8 {
        let db = Arc::clone(&db);
        handles.push(tokio::spawn(async move {
            let schedule = FixedDelay(0);
            db.claim_next_upload(&policy(5, &schedule), 10).await.unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if let Some(claim) = handle.await.unwrap() {
            assert_eq!(claim.job.id, uid("up-1"));
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let job = db.get_upload(&uid("up-1")).await.unwrap().unwrap();
    assert_eq!(job.attempts, 1);
    assert_eq!(job.status, UploadStatus::Processing);
}

#[tokio::test]
async fn test_expired_lease_is_reclaimable() {
    let db = VigilDb::open_memory().await.unwrap();
    seed(&db, "ev-1", &["up-1"]).await;

    let first = db.claim_next_upload(&policy(5, &NO_DELAY), 0).await.unwrap().unwrap();
    assert_eq!(first.attempt(), 1);
    assert!(!first.reclaimed);

    // Lease still held.
    assert!(db
        .claim_next_upload(&policy(5, &NO_DELAY), LEASE_MS - 1)
        .await
        .unwrap()
        .is_none());

    let second = db
        .claim_next_upload(&policy(5, &NO_DELAY), LEASE_MS + 1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.job.id, first.job.id);
    assert_eq!(second.attempt(), 2);
    assert!(second.reclaimed);
    assert_eq!(second.job.checksum, first.job.checksum);

    // The crashed holder can no longer touch the job.
    let outcome = db
        .release_upload(&first.job.id, first.attempt(), "late", 5, LEASE_MS + 2)
        .await
        .unwrap();
    assert_eq!(outcome, ReleaseOutcome::Stale);
    assert!(!db.extend_lease(&first.job.id, first.attempt(), 99_999).await.unwrap());
}

#[tokio::test]
async fn test_lease_renewal_keeps_claim() {
    let db = VigilDb::open_memory().await.unwrap();
    seed(&db, "ev-1", &["up-1"]).await;

    let claim = db.claim_next_upload(&policy(5, &NO_DELAY), 0).await.unwrap().unwrap();
    assert!(db.extend_lease(&claim.job.id, claim.attempt(), 5_000).await.unwrap());
    assert!(db
        .claim_next_upload(&policy(5, &NO_DELAY), 2_000)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_backoff_window_is_respected() {
    let db = VigilDb::open_memory().await.unwrap();
    seed(&db, "ev-1", &["up-1"]).await;
    let schedule = FixedDelay(10_000);

    let claim = db.claim_next_upload(&policy(5, &schedule), 0).await.unwrap().unwrap();
    let outcome = db
        .release_upload(&claim.job.id, claim.attempt(), "presign: 503", 5, 100)
        .await
        .unwrap();
    assert_eq!(outcome, ReleaseOutcome::Retrying);

    let job = db.get_upload(&claim.job.id).await.unwrap().unwrap();
    assert_eq!(job.status, UploadStatus::Pending);
    assert_eq!(job.last_error.as_deref(), Some("presign: 503"));

    // Backoff counts from the claim time (last_attempt_at = 0).
    assert!(db.claim_next_upload(&policy(5, &schedule), 9_999).await.unwrap().is_none());
    let again = db.claim_next_upload(&policy(5, &schedule), 10_000).await.unwrap().unwrap();
    assert_eq!(again.attempt(), 2);
}

/// Long backoff for every job except `ready`.
struct OnlyReady(&'static str);

impl RetrySchedule for OnlyReady {
    fn delay_ms(&self, upload_id: &UploadId, _attempts: u32) -> i64 {
        if upload_id.as_str() == self.0 {
            0
        } else {
            1_000_000
        }
    }
}

#[tokio::test]
async fn test_claim_reaches_past_a_page_of_backed_off_jobs() {
    let db = VigilDb::open_memory().await.unwrap();
    let mut ids: Vec<String> = (0..300).map(|n| format!("up-{:03}", n)).collect();
    ids.push("up-ready".to_string());
    let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    seed(&db, "ev-1", &refs).await;

    let mut claims = Vec::new();
    for _ in 0..ids.len() {
        claims.push(db.claim_next_upload(&policy(5, &NO_DELAY), 0).await.unwrap().unwrap());
    }
    for claim in &claims {
        db.release_upload(&claim.job.id, claim.attempt(), "presign: 503", 5, 0)
            .await
            .unwrap();
    }

    // Every retry sorts at last_attempt_at = 0; "up-ready" is last by id.
    let schedule = OnlyReady("up-ready");
    let claim = db.claim_next_upload(&policy(5, &schedule), 10).await.unwrap().unwrap();
    assert_eq!(claim.job.id, uid("up-ready"));
    assert_eq!(claim.attempt(), 2);

    assert!(db.claim_next_upload(&policy(5, &schedule), 20).await.unwrap().is_none());
}

#[tokio::test]
async fn test_attempt_ceiling_fails_job_and_event() {
    let db = VigilDb::open_memory().await.unwrap();
    let event_id = seed(&db, "ev-1", &["up-1"]).await;

    let mut now = 0;
    let mut last = ReleaseOutcome::Retrying;
    for _ in 0..3 {
        let claim = db.claim_next_upload(&policy(3, &NO_DELAY), now).await.unwrap().unwrap();
        last = db
            .release_upload(&claim.job.id, claim.attempt(), "checksum mismatch", 3, now)
            .await
            .unwrap();
        now += 1;
    }
    assert_eq!(last, ReleaseOutcome::Failed);

    let job = db.get_upload(&uid("up-1")).await.unwrap().unwrap();
    assert_eq!(job.status, UploadStatus::Failed);
    assert_eq!(job.attempts, 3);
    assert_eq!(db.get_event(&event_id).await.unwrap().unwrap().status, EventStatus::Failed);
    assert!(db.claim_next_upload(&policy(3, &NO_DELAY), now + 1_000_000).await.unwrap().is_none());
}

#[tokio::test]
async fn test_expired_lease_at_ceiling_becomes_failed() {
    let db = VigilDb::open_memory().await.unwrap();
    let event_id = seed(&db, "ev-1", &["up-1"]).await;

    let claim = db.claim_next_upload(&policy(1, &NO_DELAY), 0).await.unwrap().unwrap();
    assert_eq!(claim.attempt(), 1);

    assert!(db.claim_next_upload(&policy(1, &NO_DELAY), LEASE_MS + 1).await.unwrap().is_none());
    let job = db.get_upload(&uid("up-1")).await.unwrap().unwrap();
    assert_eq!(job.status, UploadStatus::Failed);
    assert_eq!(db.get_event(&event_id).await.unwrap().unwrap().status, EventStatus::Failed);
}

#[tokio::test]
async fn test_event_uploaded_only_when_all_jobs_complete() {
    let db = VigilDb::open_memory().await.unwrap();
    let event_id = seed(&db, "ev-1", &["up-1", "up-2"]).await;

    let a = db.claim_next_upload(&policy(5, &NO_DELAY), 0).await.unwrap().unwrap();
    let status = db.complete_upload(&a.job.id, "https://cdn/a.mp4", 1).await.unwrap();
    assert_eq!(status, EventStatus::PendingUpload);

    let b = db.claim_next_upload(&policy(5, &NO_DELAY), 2).await.unwrap().unwrap();
    assert_ne!(a.job.id, b.job.id);
    let status = db.complete_upload(&b.job.id, "https://cdn/b.mp4", 3).await.unwrap();
    assert_eq!(status, EventStatus::Uploaded);

    for job in db.uploads_for_event(&event_id).await.unwrap() {
        assert_eq!(job.status, UploadStatus::Complete);
        assert!(job.final_url.is_some());
        assert!(job.lease_expires_at.is_none());
    }

    // Repeated completion notice is harmless.
    let status = db.complete_upload(&b.job.id, "https://cdn/b.mp4", 4).await.unwrap();
    assert_eq!(status, EventStatus::Uploaded);
}

#[tokio::test]
async fn test_event_fails_only_after_every_job_is_terminal() {
    let db = VigilDb::open_memory().await.unwrap();
    let event_id = seed(&db, "ev-1", &["up-1", "up-2"]).await;

    let a = db.claim_next_upload(&policy(5, &NO_DELAY), 0).await.unwrap().unwrap();
    assert!(db.fail_upload(&a.job.id, a.attempt(), "file missing", 1).await.unwrap());
    // The sibling can still succeed.
    assert_eq!(
        db.get_event(&event_id).await.unwrap().unwrap().status,
        EventStatus::PendingUpload
    );

    let b = db.claim_next_upload(&policy(5, &NO_DELAY), 2).await.unwrap().unwrap();
    let status = db.complete_upload(&b.job.id, "https://cdn/b.mp4", 3).await.unwrap();
    assert_eq!(status, EventStatus::Failed);
}

#[tokio::test]
async fn test_unknown_ids_are_not_found() {
    let db = VigilDb::open_memory().await.unwrap();
    let ghost = uid("up-ghost");

    assert!(db.complete_upload(&ghost, "u", 0).await.unwrap_err().is_not_found());
    assert!(db.release_upload(&ghost, 1, "e", 5, 0).await.unwrap_err().is_not_found());
    assert!(db.fail_upload(&ghost, 1, "e", 0).await.unwrap_err().is_not_found());
    assert!(db.abandon_upload(&ghost, 1, 0).await.unwrap_err().is_not_found());
    assert!(db.retry_upload(&ghost, 0).await.unwrap_err().is_not_found());
    assert!(db.extend_lease(&ghost, 1, 0).await.unwrap_err().is_not_found());
    assert!(db
        .mark_alerted(&EventId::parse("ev-ghost").unwrap(), EventStatus::Failed)
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn test_abandon_keeps_attempts_and_requeues() {
    let db = VigilDb::open_memory().await.unwrap();
    seed(&db, "ev-1", &["up-1"]).await;

    let claim = db.claim_next_upload(&policy(5, &NO_DELAY), 0).await.unwrap().unwrap();
    assert!(db.abandon_upload(&claim.job.id, claim.attempt(), 10).await.unwrap());

    let job = db.get_upload(&claim.job.id).await.unwrap().unwrap();
    assert_eq!(job.status, UploadStatus::Pending);
    assert_eq!(job.attempts, 1);
    assert!(job.lease_expires_at.is_none());

    let again = db.claim_next_upload(&policy(5, &NO_DELAY), 20).await.unwrap().unwrap();
    assert_eq!(again.attempt(), 2);
}

#[tokio::test]
async fn test_operator_retry_resets_failed_upload() {
    let db = VigilDb::open_memory().await.unwrap();
    let event_id = seed(&db, "ev-1", &["up-1"]).await;

    let claim = db.claim_next_upload(&policy(1, &NO_DELAY), 0).await.unwrap().unwrap();
    db.release_upload(&claim.job.id, claim.attempt(), "500", 1, 1).await.unwrap();
    let alerts = db.pending_alerts(10).await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert!(db.mark_alerted(&event_id, EventStatus::Failed).await.unwrap());

    // Only FAILED uploads can be retried.
    seed(&db, "ev-2", &["up-2"]).await;
    assert!(matches!(
        db.retry_upload(&uid("up-2"), 2).await,
        Err(DbError::InvalidState(_))
    ));

    db.retry_upload(&claim.job.id, 3).await.unwrap();
    let job = db.get_upload(&claim.job.id).await.unwrap().unwrap();
    assert_eq!(job.status, UploadStatus::Pending);
    assert_eq!(job.attempts, 0);
    let event = db.get_event(&event_id).await.unwrap().unwrap();
    assert_eq!(event.status, EventStatus::PendingUpload);
    assert_eq!(event.alerted_status, None);
}

#[tokio::test]
async fn test_alert_outbox() {
    let db = VigilDb::open_memory().await.unwrap();
    let ok = seed(&db, "ev-ok", &["up-ok"]).await;
    seed(&db, "ev-open", &["up-open"]).await;

    let claim = db.claim_next_upload(&policy(5, &NO_DELAY), 0).await.unwrap().unwrap();
    db.complete_upload(&claim.job.id, "https://cdn/x", 1).await.unwrap();

    let alerts = db.pending_alerts(10).await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].id, ok);
    assert_eq!(alerts[0].status, EventStatus::Uploaded);

    // Stale status is not recorded.
    assert!(!db.mark_alerted(&ok, EventStatus::Failed).await.unwrap());
    assert_eq!(db.pending_alerts(10).await.unwrap().len(), 1);

    assert!(db.mark_alerted(&ok, EventStatus::Uploaded).await.unwrap());
    assert!(db.pending_alerts(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_queue_stats_and_listing() {
    let db = VigilDb::open_memory().await.unwrap();
    seed(&db, "ev-1", &["up-1", "up-2"]).await;
    seed(&db, "ev-2", &["up-3"]).await;

    db.claim_next_upload(&policy(5, &NO_DELAY), 0).await.unwrap().unwrap();

    let stats = db.queue_stats().await.unwrap();
    assert_eq!(stats.events_pending, 2);
    assert_eq!(stats.uploads_pending, 2);
    assert_eq!(stats.uploads_processing, 1);
    assert_eq!(stats.uploads_complete, 0);

    let pending = db.list_events(Some(EventStatus::PendingUpload), 10).await.unwrap();
    assert_eq!(pending.len(), 2);
    assert!(db.list_events(Some(EventStatus::Uploaded), 10).await.unwrap().is_empty());
    assert_eq!(db.list_events(None, 1).await.unwrap().len(), 1);
}
