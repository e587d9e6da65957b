use chrono::Duration;
use progress_core::model::{
    BatchId, CourseId, CourseProgress, EventId, EventKind, LessonId, LessonProgress,
    ProgressEvent, RejectReason, SectionId, SectionProgress, SequenceNumber, SyncResult, UserId,
};
use progress_core::time::fixed_now;
use storage::repository::{
    AggregateRepository, BatchLedger, DeadLetter, DeadLetterReason, DeadLetterRepository,
    EventStore, QueueRepository,
};
use storage::sqlite::SqliteRepository;

fn build_event(user: u64, section: u64, kind: EventKind) -> ProgressEvent {
    ProgressEvent::new(
        EventId::random(),
        UserId::new(user),
        SectionId::new(section),
        LessonId::new(1),
        CourseId::new(1),
        kind,
        fixed_now(),
    )
    .unwrap()
}

#[tokio::test]
async fn sqlite_append_assigns_sequences_and_deduplicates() {
    let repo = SqliteRepository::connect("sqlite:file:memdb_append?mode=memory&cache=shared")
        .await
        .expect("connect");
    repo.migrate().await.expect("migrate");

    let first = build_event(1, 10, EventKind::Completed);
    let second = build_event(1, 10, EventKind::TimeSpentDelta(Duration::minutes(4)));

    let out1 = repo.append(&first).await.unwrap();
    let out2 = repo.append(&second).await.unwrap();
    let replay = repo.append(&first).await.unwrap();

    assert_eq!(out1.sequence, SequenceNumber::new(1));
    assert!(out1.newly_appended);
    assert_eq!(out2.sequence, SequenceNumber::new(2));
    assert_eq!(replay.sequence, SequenceNumber::new(1));
    assert!(!replay.newly_appended);

    let stream = repo
        .read_stream(UserId::new(1), SectionId::new(10))
        .await
        .unwrap();
    assert_eq!(stream.len(), 2);
    assert_eq!(stream[0].event_id, first.event_id());
    assert_eq!(
        stream[1].kind,
        EventKind::TimeSpentDelta(Duration::minutes(4))
    );

    let tail = repo
        .read_since(UserId::new(1), SectionId::new(10), SequenceNumber::new(1))
        .await
        .unwrap();
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].sequence, SequenceNumber::new(2));
}

#[tokio::test]
async fn sqlite_roundtrips_projections() {
    let repo = SqliteRepository::connect("sqlite:file:memdb_projections?mode=memory&cache=shared")
        .await
        .expect("connect");
    repo.migrate().await.expect("migrate");

    let user = UserId::new(7);

    let mut section = SectionProgress::new(user, SectionId::new(10));
    section.record_completed();
    section.add_time_spent(Duration::minutes(12));
    section.record_score(0.85);
    section.advance_to(SequenceNumber::new(3));
    repo.upsert_section(&section).await.unwrap();

    let fetched = repo
        .get_section(user, SectionId::new(10))
        .await
        .unwrap()
        .expect("section stored");
    assert_eq!(fetched, section);

    let lesson = LessonProgress::from_counts(user, LessonId::new(20), 1, 2).unwrap();
    repo.upsert_lesson(&lesson).await.unwrap();
    let fetched = repo
        .get_lesson(user, LessonId::new(20))
        .await
        .unwrap()
        .expect("lesson stored");
    assert_eq!(fetched, lesson);

    let course = CourseProgress::from_counts(user, CourseId::new(30), 2, 2)
        .unwrap()
        .with_completion_time(None, fixed_now());
    repo.upsert_course(&course).await.unwrap();
    let fetched = repo
        .get_course(user, CourseId::new(30))
        .await
        .unwrap()
        .expect("course stored");
    assert_eq!(fetched.completed_at(), Some(fixed_now()));
    assert!(fetched.completed());

    // Upserts replace projection state in place.
    let course = CourseProgress::from_counts(user, CourseId::new(30), 2, 3).unwrap();
    repo.upsert_course(&course).await.unwrap();
    let fetched = repo
        .get_course(user, CourseId::new(30))
        .await
        .unwrap()
        .expect("course stored");
    assert_eq!(fetched.completed_lesson_count(), 2);
    assert_eq!(fetched.total_lesson_count(), 3);
    assert!(!fetched.completed());
}

#[tokio::test]
async fn sqlite_batch_ledger_replays_and_trims() {
    let repo = SqliteRepository::connect("sqlite:file:memdb_batches?mode=memory&cache=shared")
        .await
        .expect("connect");
    repo.migrate().await.expect("migrate");

    let user = UserId::new(1);
    let result = SyncResult {
        accepted: vec![EventId::random()],
        duplicates: vec![],
        rejected: vec![(EventId::random(), RejectReason::UnknownReference)],
    };

    let old = BatchId::random();
    repo.record_batch(old, user, &result, fixed_now(), 2)
        .await
        .unwrap();
    assert_eq!(repo.lookup_batch(old).await.unwrap(), Some(result.clone()));

    let newer = BatchId::random();
    let newest = BatchId::random();
    repo.record_batch(newer, user, &result, fixed_now() + Duration::seconds(1), 2)
        .await
        .unwrap();
    repo.record_batch(newest, user, &result, fixed_now() + Duration::seconds(2), 2)
        .await
        .unwrap();

    assert!(repo.lookup_batch(old).await.unwrap().is_none());
    assert!(repo.lookup_batch(newest).await.unwrap().is_some());
}

#[tokio::test]
async fn sqlite_dead_letters_are_listed_per_user() {
    let repo = SqliteRepository::connect("sqlite:file:memdb_letters?mode=memory&cache=shared")
        .await
        .expect("connect");
    repo.migrate().await.expect("migrate");

    let letter = DeadLetter {
        event_id: EventId::random(),
        user_id: UserId::new(1),
        reason: DeadLetterReason::AnomalousTimeDelta,
        detail: "delta 600m exceeds ceiling 60m".to_string(),
        recorded_at: fixed_now(),
    };
    repo.push_letter(&letter).await.unwrap();

    let other = DeadLetter {
        user_id: UserId::new(2),
        ..letter.clone()
    };
    repo.push_letter(&other).await.unwrap();

    let listed = repo.letters_for_user(UserId::new(1)).await.unwrap();
    assert_eq!(listed, vec![letter]);
}

#[tokio::test]
async fn sqlite_queue_preserves_order_and_ack_bookkeeping() {
    let repo = SqliteRepository::connect("sqlite:file:memdb_queue?mode=memory&cache=shared")
        .await
        .expect("connect");
    repo.migrate().await.expect("migrate");

    let events: Vec<_> = (0..3)
        .map(|i| build_event(1, 10 + i, EventKind::Completed))
        .collect();
    for event in &events {
        repo.push_event(event).await.unwrap();
    }

    let unacked = repo.unacked().await.unwrap();
    assert_eq!(unacked.len(), 3);
    assert!(unacked.windows(2).all(|w| w[0].local_seq < w[1].local_seq));
    assert_eq!(unacked[0].event, events[0]);

    let batch = BatchId::random();
    assert_eq!(repo.assign_batch(batch).await.unwrap(), 3);
    // Already-tagged rows keep their batch.
    assert_eq!(repo.assign_batch(BatchId::random()).await.unwrap(), 0);

    assert_eq!(repo.purge_oldest_acked(10).await.unwrap(), 0);
    assert_eq!(repo.mark_acked(batch).await.unwrap(), 3);
    assert_eq!(repo.purge_oldest_acked(2).await.unwrap(), 2);
    assert_eq!(repo.len().await.unwrap(), 1);
    assert!(repo.unacked().await.unwrap().is_empty());
}
