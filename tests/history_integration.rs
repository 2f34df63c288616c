//! Integration tests for history getters
//!
//! - Ring buffer semantics through sampling
//! - Default rows and listener registration
//! - Timed variant origin and reset
//! - Polling into the history

mod common;

use common::{assert_float_eq, wait_until, Counter, Recorder};
use livevar::{HistoryGetter, Listener, Value};
use serial_test::serial;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn counting_getter(counter: &Arc<Counter>, capacity: usize) -> HistoryGetter {
    let source = counter.clone();
    HistoryGetter::builder()
        .name("counts")
        .channel(move || Ok(Value::Int(source.tick())))
        .channel(|| Ok(Value::Float(0.5)))
        .capacity(capacity)
        .build()
        .unwrap()
}

#[test]
fn test_capacity_three_keeps_last_three() {
    let counter = Counter::new();
    let getter = counting_getter(&counter, 3);
    assert!(getter.is_empty());

    for _ in 0..5 {
        getter.sample().unwrap();
    }

    assert_eq!(
        getter.get_values(None),
        vec![vec![2.0, 0.5], vec![3.0, 0.5], vec![4.0, 0.5]]
    );
    assert_eq!(getter.get_values(Some(2)), vec![vec![3.0, 0.5], vec![4.0, 0.5]]);
}

#[test]
fn test_inactive_get_value_is_not_stored() {
    let counter = Counter::new();
    let getter = counting_getter(&counter, 10);

    assert_eq!(getter.get_value().unwrap(), vec![0.0, 0.5]);
    assert_eq!(getter.len(), 0);
    assert_eq!(counter.calls(), 1);
}

#[test]
fn test_default_row_skips_channels() {
    let counter = Counter::new();
    let source = counter.clone();
    let getter = HistoryGetter::builder()
        .channel(move || Ok(Value::Int(source.tick())))
        .channel_columns(|| Ok(Value::Row(vec![1.0, 2.0])), 2)
        .default_value(-1.0)
        .default_fn(|| Value::Row(vec![0.0, 0.0]))
        .build()
        .unwrap();

    assert_eq!(getter.width(), 3);
    assert_eq!(getter.default().unwrap(), vec![-1.0, 0.0, 0.0]);
    assert_eq!(counter.calls(), 0);
}

#[test]
fn test_listener_gets_default_then_latest() {
    let counter = Counter::new();
    let getter = counting_getter(&counter, 10);

    let early = Recorder::new();
    getter.add_listener(&Listener::receiver(&early)).unwrap();
    match early.last().unwrap().value {
        Value::Row(row) => {
            assert_eq!(row.len(), 2);
            assert!(row.iter().all(|x| x.is_nan()));
        }
        other => panic!("expected a row, got {:?}", other),
    }

    getter.sample().unwrap();
    assert_eq!(early.count(), 2);

    let late = Recorder::new();
    getter.add_listener(&Listener::receiver(&late)).unwrap();
    assert_eq!(late.values(), vec![Value::Row(vec![0.0, 0.5])]);
}

#[test]
fn test_clear_listeners_stops_delivery() {
    let counter = Counter::new();
    let getter = counting_getter(&counter, 10);
    let recorder = Recorder::new();
    getter.add_listener(&Listener::receiver(&recorder)).unwrap();
    assert_eq!(getter.listener_count(), 1);

    getter.clear_listeners();
    assert_eq!(getter.listener_count(), 0);
    getter.sample().unwrap();
    assert_eq!(recorder.count(), 1);
    assert_eq!(getter.len(), 1);
}

#[test]
fn test_timed_rows_start_near_offset() {
    let getter = HistoryGetter::builder()
        .channel(|| Ok(Value::Float(1.0)))
        .timed(5.0)
        .capacity(100)
        .build()
        .unwrap();

    assert_eq!(getter.width(), 2);
    assert_eq!(getter.default().unwrap()[0], 5.0);

    let first = getter.sample().unwrap();
    assert_float_eq(first[0], 5.0, 0.05);
    thread::sleep(Duration::from_millis(20));
    let second = getter.sample().unwrap();
    assert!(second[0] > first[0]);

    thread::sleep(Duration::from_millis(30));
    getter.reset();
    assert!(getter.is_empty());

    let restarted = getter.sample().unwrap();
    assert_float_eq(restarted[0], 5.0, 0.02);
}

#[test]
#[serial]
fn test_polling_fills_history() {
    let counter = Counter::new();
    let getter = counting_getter(&counter, 4);
    let recorder = Recorder::new();
    getter.add_listener(&Listener::receiver(&recorder)).unwrap();

    getter.start(Some(0.005)).unwrap();
    assert!(getter.is_active());
    assert!(wait_until(|| getter.len() == 4 && counter.calls() > 6));

    let latest = getter.get_value().unwrap();
    assert_eq!(latest.len(), 2);

    getter.reset();
    assert!(!getter.is_active());
    assert!(getter.is_empty());
    assert!(recorder.count() > 4);
}

#[test]
fn test_channel_width_mismatch_is_an_error() {
    let getter = HistoryGetter::builder()
        .channel_columns(|| Ok(Value::Row(vec![1.0])), 2)
        .build()
        .unwrap();

    assert!(getter.sample().is_err());
    assert!(getter.is_empty());
}
