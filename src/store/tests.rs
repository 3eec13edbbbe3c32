use std::path::PathBuf;

use chrono::NaiveDate;
use futures::FutureExt;
use tokio_test::{assert_err, assert_ok};

use super::*;
use crate::notify::Notice;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("labslot_test_store");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn open(name: &str) -> (ReservationTable, PathBuf) {
    let path = test_wal_path(name);
    let table = ReservationTable::open(&path, Arc::new(NotifyHub::new())).unwrap();
    (table, path)
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 11, d).unwrap()
}

fn new_res(student: &str, date: NaiveDate, lab: &str, slot: &str) -> NewReservation {
    NewReservation {
        student_id: student.into(),
        student_name: Some(format!("name-{student}")),
        auth_number: "1234".into(),
        slot: SlotKey::new(date, lab, slot),
    }
}

#[tokio::test]
async fn insert_assigns_id_and_is_queryable() {
    let (table, _) = open("insert_query.wal");
    let r = assert_ok!(table.insert(new_res("a", day(11), "X", "10:00")).await);
    assert_eq!(r.student_id, "a");
    assert_eq!(r.date, day(11));

    let all = table.query(&ReservationFilter::default()).await.unwrap();
    assert_eq!(all, vec![r.clone()]);
    assert_eq!(table.get(r.id).await, Some(r));
    assert_eq!(table.len(), 1);
}

#[tokio::test]
async fn same_student_same_slot_is_unique_violation() {
    let (table, _) = open("unique.wal");
    table.insert(new_res("a", day(11), "X", "10:00")).await.unwrap();
    let err = assert_err!(table.insert(new_res("a", day(11), "X", "10:00")).await);
    assert_eq!(err, StoreError::UniqueViolation);
    assert_eq!(table.len(), 1);
}

#[tokio::test]
async fn uniqueness_is_per_full_tuple() {
    let (table, _) = open("unique_tuple.wal");
    table.insert(new_res("a", day(11), "X", "10:00")).await.unwrap();
    // Every differing component makes a distinct tuple.
    assert_ok!(table.insert(new_res("b", day(11), "X", "10:00")).await);
    assert_ok!(table.insert(new_res("a", day(12), "X", "10:00")).await);
    assert_ok!(table.insert(new_res("a", day(11), "Y", "10:00")).await);
    assert_ok!(table.insert(new_res("a", day(11), "X", "10:20")).await);
    assert_eq!(table.len(), 5);
}

#[tokio::test]
async fn store_does_not_enforce_capacity() {
    // Capacity is the engine's job; the store only guards uniqueness.
    let (table, _) = open("no_capacity.wal");
    for s in ["a", "b", "c", "d"] {
        table.insert(new_res(s, day(11), "X", "10:00")).await.unwrap();
    }
    let rows = table
        .query(&ReservationFilter::slot(&SlotKey::new(day(11), "X", "10:00")))
        .await
        .unwrap();
    assert_eq!(rows.len(), 4);
}

#[tokio::test]
async fn delete_removes_and_returns_row() {
    let (table, _) = open("delete.wal");
    let r = table.insert(new_res("a", day(11), "X", "10:00")).await.unwrap();
    let removed = assert_ok!(table.delete_by_id(r.id).await);
    assert_eq!(removed, r);
    assert!(table.is_empty());
    assert_eq!(table.get(r.id).await, None);
}

#[tokio::test]
async fn delete_unknown_is_missing() {
    let (table, _) = open("delete_missing.wal");
    let id = Ulid::new();
    assert_eq!(table.delete_by_id(id).await, Err(StoreError::Missing(id)));
}

#[tokio::test]
async fn double_delete_second_is_missing() {
    let (table, _) = open("double_delete.wal");
    let r = table.insert(new_res("a", day(11), "X", "10:00")).await.unwrap();
    table.delete_by_id(r.id).await.unwrap();
    assert_eq!(table.delete_by_id(r.id).await, Err(StoreError::Missing(r.id)));
}

#[tokio::test]
async fn slot_reopens_after_delete() {
    let (table, _) = open("reopen.wal");
    let r = table.insert(new_res("a", day(11), "X", "10:00")).await.unwrap();
    table.delete_by_id(r.id).await.unwrap();
    assert_ok!(table.insert(new_res("a", day(11), "X", "10:00")).await);
}

#[tokio::test]
async fn query_orders_by_slot_then_booking_order() {
    let (table, _) = open("order.wal");
    let late = table.insert(new_res("a", day(12), "X", "10:00")).await.unwrap();
    let second = table.insert(new_res("b", day(11), "X", "14:00")).await.unwrap();
    let first_a = table.insert(new_res("c", day(11), "X", "10:00")).await.unwrap();
    let first_b = table.insert(new_res("d", day(11), "X", "10:00")).await.unwrap();

    let all = table.query(&ReservationFilter::default()).await.unwrap();
    let ids: Vec<Ulid> = all.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![first_a.id, first_b.id, second.id, late.id]);
}

#[tokio::test]
async fn query_filters() {
    let (table, _) = open("filters.wal");
    table.insert(new_res("a", day(11), "X", "10:00")).await.unwrap();
    table.insert(new_res("a", day(12), "Y", "10:00")).await.unwrap();
    table.insert(new_res("b", day(11), "Y", "14:00")).await.unwrap();

    let day_one = table.query(&ReservationFilter::dates([day(11)])).await.unwrap();
    assert_eq!(day_one.len(), 2);

    let a = table
        .query(&ReservationFilter::dates([day(11), day(12)]).with_student("a"))
        .await
        .unwrap();
    assert_eq!(a.len(), 2);

    let y_day_one = table
        .query(&ReservationFilter::dates([day(11)]).with_lab("Y"))
        .await
        .unwrap();
    assert_eq!(y_day_one.len(), 1);
    assert_eq!(y_day_one[0].student_id, "b");
}

#[tokio::test]
async fn subscribers_see_inserts_and_deletes() {
    let (table, _) = open("subscribe.wal");
    let mut sub = table.subscribe();
    let r = table.insert(new_res("a", day(11), "X", "10:00")).await.unwrap();
    table.delete_by_id(r.id).await.unwrap();

    match sub.next().await {
        Some(Notice::Changed(c)) => {
            assert_eq!(c.op, ChangeOp::Insert);
            assert_eq!(c.id, r.id);
        }
        other => panic!("expected insert notice, got {other:?}"),
    }
    match sub.next().await {
        Some(Notice::Changed(c)) => assert_eq!(c.op, ChangeOp::Delete),
        other => panic!("expected delete notice, got {other:?}"),
    }
}

#[tokio::test]
async fn rejected_insert_is_not_published() {
    let (table, _) = open("no_publish.wal");
    table.insert(new_res("a", day(11), "X", "10:00")).await.unwrap();
    let mut sub = table.subscribe();
    let _ = table.insert(new_res("a", day(11), "X", "10:00")).await;
    assert!(sub.try_next().is_none());
}

#[tokio::test]
async fn replay_restores_state() {
    let (table, path) = open("replay.wal");
    let keep = table.insert(new_res("a", day(11), "X", "10:00")).await.unwrap();
    let gone = table.insert(new_res("b", day(11), "X", "10:00")).await.unwrap();
    table.delete_by_id(gone.id).await.unwrap();
    drop(table);

    let reopened = ReservationTable::open(&path, Arc::new(NotifyHub::new())).unwrap();
    let all = reopened.query(&ReservationFilter::default()).await.unwrap();
    assert_eq!(all, vec![keep.clone()]);
    // Uniqueness survives a restart.
    assert_eq!(
        reopened.insert(new_res("a", day(11), "X", "10:00")).await,
        Err(StoreError::UniqueViolation)
    );
}

#[tokio::test]
async fn compaction_preserves_live_state() {
    let (table, path) = open("compact.wal");
    let mut live = Vec::new();
    for (i, s) in ["a", "b", "c", "d"].iter().enumerate() {
        let r = table.insert(new_res(s, day(11), "X", "10:00")).await.unwrap();
        if i % 2 == 0 {
            table.delete_by_id(r.id).await.unwrap();
        } else {
            live.push(r);
        }
    }
    assert_eq!(table.appends_since_compact().await, 6);
    assert_eq!(table.compact().await.unwrap(), 2);
    assert_eq!(table.appends_since_compact().await, 0);

    let extra = table.insert(new_res("e", day(12), "Y", "15:20")).await.unwrap();
    live.push(extra);
    drop(table);

    let reopened = ReservationTable::open(&path, Arc::new(NotifyHub::new())).unwrap();
    let all = reopened.query(&ReservationFilter::default()).await.unwrap();
    assert_eq!(all, live);
}

#[tokio::test]
async fn concurrent_inserts_same_tuple_only_one_wins() {
    let (table, _) = open("concurrent_unique.wal");
    let table = Arc::new(table);
    let mut handles = Vec::new();
    for _ in 0..16 {
        let t = table.clone();
        handles.push(tokio::spawn(async move {
            t.insert(new_res("a", day(11), "X", "10:00")).await
        }));
    }
    let mut ok = 0;
    let mut dup = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(StoreError::UniqueViolation) => dup += 1,
            Err(e) => panic!("unexpected {e}"),
        }
    }
    assert_eq!((ok, dup), (1, 15));
}

#[tokio::test]
async fn abandoned_insert_still_commits_once() {
    let (table, path) = open("abandoned_insert.wal");
    // First poll takes the locks and hands the commit off; then the caller gives up.
    assert!(table.insert(new_res("a", day(11), "X", "10:00")).now_or_never().is_none());

    // The retry queues behind the handed-off commit and sees its row.
    assert_eq!(
        table.insert(new_res("a", day(11), "X", "10:00")).await,
        Err(StoreError::UniqueViolation)
    );
    assert_eq!(table.len(), 1);
    drop(table);

    let reopened = ReservationTable::open(&path, Arc::new(NotifyHub::new())).unwrap();
    let rows = reopened.query(&ReservationFilter::default()).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].student_id, "a");
}

#[tokio::test]
async fn abandoned_delete_still_commits() {
    let (table, path) = open("abandoned_delete.wal");
    let r = table.insert(new_res("a", day(11), "X", "10:00")).await.unwrap();
    let mut sub = table.subscribe();

    assert!(table.delete_by_id(r.id).now_or_never().is_none());
    assert_eq!(table.get(r.id).await, None);
    assert!(matches!(sub.try_next(), Some(Notice::Changed(_))));
    drop(table);

    let reopened = ReservationTable::open(&path, Arc::new(NotifyHub::new())).unwrap();
    assert!(reopened.is_empty());
}

#[tokio::test]
async fn row_limit_holds_under_concurrent_inserts() {
    let path = test_wal_path("row_limit.wal");
    let table = Arc::new(ReservationTable::open_with_limit(&path, Arc::new(NotifyHub::new()), 3).unwrap());
    let slots = crate::catalog::time_slots();
    let mut handles = Vec::new();
    for (i, slot) in slots.iter().enumerate() {
        let t = table.clone();
        let slot = slot.clone();
        handles.push(tokio::spawn(async move {
            t.insert(new_res(&format!("s{i}"), day(11), "X", &slot)).await
        }));
    }
    let mut ok = Vec::new();
    for h in handles {
        match h.await.unwrap() {
            Ok(r) => ok.push(r),
            Err(e) => assert_eq!(e, StoreError::Other("reservation table is full".into())),
        }
    }
    assert_eq!(ok.len(), 3);
    assert_eq!(table.len(), 3);

    // A delete frees room for exactly one more.
    table.delete_by_id(ok[0].id).await.unwrap();
    assert_ok!(table.insert(new_res("late", day(12), "Y", "10:00")).await);
    assert_err!(table.insert(new_res("later", day(12), "Y", "10:20")).await);
}
