//! Integration tests for `SqliteStore` against an in-memory database.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde_json::json;
use tally_core::{
  Error as CoreError,
  aggregate::{TransferEntry, plan_transfer},
  calibration::{CalibrationModel, CalibrationSpec},
  counter::{CapPolicy, CounterDefinition},
  ledger::{ActivityScope, DateRange, EventQuery, GradeSink, StateQuery, TallyLedger, TallyRequest},
  window::{Trend, WindowAggregator},
};
use uuid::Uuid;

use crate::{Error, SqliteStore};

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
}

fn t0() -> DateTime<Utc> { Utc.with_ymd_and_hms(2024, 10, 7, 8, 30, 0).unwrap() }

fn participation(collection_id: Uuid, cooldown_seconds: u64) -> CounterDefinition {
  let mut def = CounterDefinition::new(collection_id, "participation", 1.0, cooldown_seconds);
  def.calibration = CalibrationSpec::new(
    CalibrationModel::Linear,
    json!({ "points": [{ "raw": 0, "calibrated": 0 }, { "raw": 10, "calibrated": 100 }] }),
  );
  def
}

fn request(subject_id: Uuid, counter_id: Uuid, at: DateTime<Utc>) -> TallyRequest {
  TallyRequest { subject_id, counter_id, at }
}

// ─── Counters ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn put_and_get_counter() {
  let s = store().await;
  let def = participation(Uuid::new_v4(), 60);

  s.put_counter(def.clone()).await.unwrap();
  let fetched = s.get_counter(def.counter_id).await.unwrap();
  assert_eq!(fetched, Some(def));

  assert!(s.get_counter(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn put_counter_replaces_definition() {
  let s = store().await;
  let mut def = participation(Uuid::new_v4(), 60);
  s.put_counter(def.clone()).await.unwrap();

  def.increment = 2.0;
  def.label = "Speaks up".into();
  s.put_counter(def.clone()).await.unwrap();

  let fetched = s.get_counter(def.counter_id).await.unwrap().unwrap();
  assert_eq!(fetched.increment, 2.0);
  assert_eq!(fetched.label, "Speaks up");
}

#[tokio::test]
async fn list_counters_filters_by_collection_and_type() {
  let s = store().await;
  let collection = Uuid::new_v4();
  s.put_counter(participation(collection, 0)).await.unwrap();
  s.put_counter(CounterDefinition::new(collection, "attitude", -1.0, 0)).await.unwrap();
  s.put_counter(participation(Uuid::new_v4(), 0)).await.unwrap();

  let all = s.list_counters(collection, None).await.unwrap();
  assert_eq!(all.len(), 2);

  let attitude = s.list_counters(collection, Some("attitude".into())).await.unwrap();
  assert_eq!(attitude.len(), 1);
  assert_eq!(attitude[0].increment, -1.0);
}

// ─── Admission ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_counter_is_rejected() {
  let s = store().await;
  let missing = Uuid::new_v4();

  let err = s.attempt_tally(request(Uuid::new_v4(), missing, t0())).await.unwrap_err();
  assert!(matches!(err, Error::Core(CoreError::CounterNotFound(id)) if id == missing));
}

#[tokio::test]
async fn five_taps_then_a_refusal() {
  let s = store().await;
  let def = s.put_counter(participation(Uuid::new_v4(), 60)).await.unwrap();
  let subject = Uuid::new_v4();

  let mut last = None;
  for i in 0..5 {
    let at = t0() + Duration::seconds(60 * i);
    last = Some(s.attempt_tally(request(subject, def.counter_id, at)).await.unwrap());
  }
  let last = last.unwrap();
  assert_eq!(last.raw_count, 5.0);
  assert_eq!(last.calibrated_score, 50.0);
  assert_eq!(last.cooldown_remaining_seconds, 60);

  let sixth_at = last.event.recorded_at + Duration::seconds(10);
  let err = s.attempt_tally(request(subject, def.counter_id, sixth_at)).await.unwrap_err();
  assert!(matches!(err, Error::Core(CoreError::NotAllowed { remaining_seconds: 50 })));

  let state = s.get_runtime_state(subject, def.counter_id).await.unwrap().unwrap();
  assert_eq!(state.raw_count, 5.0);
  assert_eq!(state.last_accepted_at, Some(last.event.recorded_at));

  let events = s.list_events(&EventQuery::default()).await.unwrap();
  assert_eq!(events.len(), 5);
}

#[tokio::test]
async fn refusal_writes_nothing() {
  let s = store().await;
  let mut def = participation(Uuid::new_v4(), 0);
  def.max_count = Some(1.0);
  def.cap_policy = CapPolicy::Hard;
  let def = s.put_counter(def).await.unwrap();
  let subject = Uuid::new_v4();

  s.attempt_tally(request(subject, def.counter_id, t0())).await.unwrap();
  let err = s.attempt_tally(request(subject, def.counter_id, t0())).await.unwrap_err();
  assert!(matches!(err, Error::Core(CoreError::CapReached { .. })));

  let state = s.get_runtime_state(subject, def.counter_id).await.unwrap().unwrap();
  assert_eq!(state.raw_count, 1.0);
  assert_eq!(s.list_events(&EventQuery::default()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn inactive_counter_is_refused() {
  let s = store().await;
  let mut def = participation(Uuid::new_v4(), 0);
  def.active = false;
  let def = s.put_counter(def).await.unwrap();

  let err = s.attempt_tally(request(Uuid::new_v4(), def.counter_id, t0())).await.unwrap_err();
  assert!(matches!(err, Error::Core(CoreError::CounterInactive(_))));
}

#[tokio::test]
async fn pairs_cool_down_independently() {
  let s = store().await;
  let def = s.put_counter(participation(Uuid::new_v4(), 60)).await.unwrap();
  let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

  s.attempt_tally(request(alice, def.counter_id, t0())).await.unwrap();
  s.attempt_tally(request(bob, def.counter_id, t0())).await.unwrap();

  let states = s
    .list_runtime_states(&StateQuery { counter_id: Some(def.counter_id), ..Default::default() })
    .await
    .unwrap();
  assert_eq!(states.len(), 2);
  assert!(states.iter().all(|st| st.raw_count == 1.0));
}

#[tokio::test]
async fn concurrent_attempts_accept_exactly_one() {
  let path = std::env::temp_dir().join(format!("tally-{}.db", Uuid::new_v4()));
  let a = SqliteStore::open(&path).await.unwrap();
  let b = SqliteStore::open(&path).await.unwrap();

  let def = a.put_counter(participation(Uuid::new_v4(), 60)).await.unwrap();
  let subject = Uuid::new_v4();

  let attempts = (0..8).map(|i| {
    let store = if i % 2 == 0 { a.clone() } else { b.clone() };
    let req = request(subject, def.counter_id, t0() + Duration::seconds(i));
    tokio::spawn(async move { store.attempt_tally(req).await })
  });

  let mut accepted = 0;
  for handle in attempts.collect::<Vec<_>>() {
    match handle.await.unwrap() {
      Ok(_) => accepted += 1,
      Err(Error::Core(CoreError::NotAllowed { .. })) => {}
      Err(other) => panic!("unexpected error: {other}"),
    }
  }
  assert_eq!(accepted, 1);

  let state = a.get_runtime_state(subject, def.counter_id).await.unwrap().unwrap();
  assert_eq!(state.raw_count, 1.0);

  drop((a, b));
  let _ = std::fs::remove_file(&path);
}

// ─── Retractions ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn retraction_reverses_the_increment_once() {
  let s = store().await;
  let mut def = participation(Uuid::new_v4(), 0);
  def.increment = 2.0;
  let def = s.put_counter(def).await.unwrap();
  let subject = Uuid::new_v4();

  let first = s.attempt_tally(request(subject, def.counter_id, t0())).await.unwrap();
  s.attempt_tally(request(subject, def.counter_id, t0())).await.unwrap();

  let retraction = s
    .retract_tally(first.event.event_id, Some("wrong student".into()))
    .await
    .unwrap();
  assert_eq!(retraction.event_id, first.event.event_id);

  let state = s.get_runtime_state(subject, def.counter_id).await.unwrap().unwrap();
  assert_eq!(state.raw_count, 2.0);

  let err = s.retract_tally(first.event.event_id, None).await.unwrap_err();
  assert!(matches!(err, Error::AlreadyRetracted(id) if id == first.event.event_id));

  let err = s.retract_tally(Uuid::new_v4(), None).await.unwrap_err();
  assert!(matches!(err, Error::EventNotFound(_)));
}

#[tokio::test]
async fn list_events_resolves_status() {
  let s = store().await;
  let def = s.put_counter(participation(Uuid::new_v4(), 0)).await.unwrap();
  let subject = Uuid::new_v4();

  let first = s.attempt_tally(request(subject, def.counter_id, t0())).await.unwrap();
  let second = s
    .attempt_tally(request(subject, def.counter_id, t0() + Duration::seconds(5)))
    .await
    .unwrap();
  s.retract_tally(first.event.event_id, Some("duplicate".into())).await.unwrap();

  let active = s.list_events(&EventQuery::default()).await.unwrap();
  assert_eq!(active.len(), 1);
  assert_eq!(active[0].event.event_id, second.event.event_id);

  let all = s
    .list_events(&EventQuery { include_retracted: true, ..Default::default() })
    .await
    .unwrap();
  assert_eq!(all.len(), 2);
  // Newest first.
  assert_eq!(all[0].event.event_id, second.event.event_id);
  assert!(!all[1].status.is_active());

  let limited = s
    .list_events(&EventQuery { include_retracted: true, limit: Some(1), ..Default::default() })
    .await
    .unwrap();
  assert_eq!(limited.len(), 1);

  let since = s
    .list_events(&EventQuery {
      include_retracted: true,
      since: Some(t0() + Duration::seconds(1)),
      ..Default::default()
    })
    .await
    .unwrap();
  assert_eq!(since.len(), 1);
}

// ─── Daily activity ──────────────────────────────────────────────────────────

#[tokio::test]
async fn active_days_split_positive_and_negative() {
  let s = store().await;
  let collection = Uuid::new_v4();
  let plus = s.put_counter(participation(collection, 0)).await.unwrap();
  let minus = s
    .put_counter(CounterDefinition::new(collection, "attitude", -1.0, 0))
    .await
    .unwrap();
  let subject = Uuid::new_v4();

  let day1 = t0();
  let day2 = t0() + Duration::days(1);
  s.attempt_tally(request(subject, plus.counter_id, day1)).await.unwrap();
  s.attempt_tally(request(subject, plus.counter_id, day1)).await.unwrap();
  s.attempt_tally(request(subject, minus.counter_id, day1)).await.unwrap();
  let withdrawn = s.attempt_tally(request(subject, minus.counter_id, day2)).await.unwrap();
  s.attempt_tally(request(subject, plus.counter_id, day2)).await.unwrap();
  s.retract_tally(withdrawn.event.event_id, None).await.unwrap();

  let scope = ActivityScope { collection_id: Some(collection), ..Default::default() };
  let days = s.list_active_days(&scope, DateRange::default()).await.unwrap();

  assert_eq!(days.len(), 2);
  assert_eq!(days[0].date, NaiveDate::from_ymd_opt(2024, 10, 7).unwrap());
  assert_eq!((days[0].positive_sum, days[0].negative_sum), (2.0, 1.0));
  assert_eq!((days[1].positive_sum, days[1].negative_sum), (1.0, 0.0));

  let only_first = s
    .list_active_days(&scope, DateRange::until(NaiveDate::from_ymd_opt(2024, 10, 7).unwrap()))
    .await
    .unwrap();
  assert_eq!(only_first.len(), 1);
}

#[tokio::test]
async fn active_days_feed_the_window_aggregator() {
  let s = store().await;
  let def = s.put_counter(participation(Uuid::new_v4(), 0)).await.unwrap();
  let subject = Uuid::new_v4();

  for day in 0..4 {
    s.attempt_tally(request(subject, def.counter_id, t0() + Duration::days(day)))
      .await
      .unwrap();
  }

  let scope = ActivityScope { subject_id: Some(subject), ..Default::default() };
  let days = s.list_active_days(&scope, DateRange::default()).await.unwrap();
  let today = (t0() + Duration::days(10)).date_naive();

  let report = WindowAggregator::new(2).compare(&days, today);
  let comparison = report.comparison().unwrap();
  assert_eq!(comparison.current.trend(), Trend::Same);
  assert_eq!(comparison.current.metrics.active_day_count, 2);

  let empty = s
    .list_active_days(&ActivityScope { subject_id: Some(Uuid::new_v4()), ..Default::default() }, DateRange::default())
    .await
    .unwrap();
  assert!(WindowAggregator::trend().compare(&empty, today).is_no_activity());
}

// ─── Grade sink ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn commit_writes_the_whole_plan() {
  let s = store().await;
  let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

  let plan = plan_transfer(
    [
      TransferEntry { instrument_record_id: "b-7".into(), subject_id: bob, calibrated_score: 40.0 },
      TransferEntry {
        instrument_record_id: "a-3".into(),
        subject_id:           alice,
        calibrated_score:     80.0,
      },
    ],
    Some(100.0),
    20.0,
  )
  .unwrap();
  s.commit(&plan).await.unwrap();

  let scores = s.list_instrument_scores().await.unwrap();
  assert_eq!(scores.len(), 2);
  assert_eq!(scores[0].instrument_record_id, "a-3");
  assert_eq!(scores[0].converted_score, 16.0);
  assert_eq!(scores[1].subject_id, bob);
  assert_eq!(scores[1].converted_score, 8.0);

  // Re-committing a record overwrites it.
  let revised = plan_transfer(
    [TransferEntry { instrument_record_id: "a-3".into(), subject_id: alice, calibrated_score: 50.0 }],
    None,
    20.0,
  )
  .unwrap();
  s.commit(&revised).await.unwrap();
  let scores = s.list_instrument_scores().await.unwrap();
  assert_eq!(scores.len(), 2);
  assert_eq!(scores[0].converted_score, 10.0);
}
