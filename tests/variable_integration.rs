//! Integration tests for the variable lifecycle
//!
//! These tests drive variables through their public surface:
//! - Coercion on set and update
//! - Start/stop state machine
//! - Notification on registration
//! - Polling end to end

mod common;

use common::{assert_float_eq, wait_until, Counter, Recorder};
use livevar::{LiveError, Listener, Value, ValueKind, Variable};
use serial_test::serial;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn counter_variable(counter: &Arc<Counter>, interval: f64) -> Variable {
    let source = counter.clone();
    Variable::builder()
        .name("counter")
        .kind(ValueKind::Int)
        .getter(move || Ok(Value::Int(source.tick())))
        .interval(interval)
        .build()
        .unwrap()
}

#[test]
fn test_uncoercible_set_leaves_state_untouched() {
    let var = Variable::builder().value(1.5).build().unwrap();
    let recorder = Recorder::new();
    var.add_listener(&Listener::receiver(&recorder)).unwrap();
    assert_eq!(recorder.count(), 1);

    let err = var.set_value("not a number").unwrap_err();
    assert!(matches!(err, LiveError::TypeCoercion { .. }));
    assert_eq!(var.value(), Some(Value::Float(1.5)));
    assert_eq!(recorder.count(), 1);

    assert_eq!(var.set_value("2.5").unwrap(), Value::Float(2.5));
    assert_eq!(recorder.count(), 2);
}

#[test]
fn test_registration_delivers_current_state_when_idle() {
    let var = Variable::builder().kind(ValueKind::Int).value(5).build().unwrap();
    assert!(!var.is_active());

    let recorder = Recorder::new();
    var.add_listener(&Listener::receiver(&recorder)).unwrap();

    assert_eq!(recorder.values(), vec![Value::Int(5)]);
    assert_eq!(recorder.last().unwrap().source, var.id());
}

#[test]
fn test_registration_without_value_sends_nothing() {
    let var = Variable::builder().build().unwrap();
    let recorder = Recorder::new();
    var.add_listener(&Listener::receiver(&recorder)).unwrap();
    assert_eq!(recorder.count(), 0);
    assert_eq!(var.listener_count(), 1);
}

#[test]
#[serial]
fn test_start_twice_keeps_one_task() {
    let counter = Counter::new();
    let var = counter_variable(&counter, 0.01);

    var.start(None).unwrap();
    assert!(var.is_active());
    var.start(Some(0.02)).unwrap();
    assert!(var.is_active());
    assert_eq!(var.interval(), Some(0.02));

    thread::sleep(Duration::from_millis(60));
    var.stop();
    assert!(!var.is_active());

    // One task at 20ms for 60ms: a second task would roughly double this
    let polled = counter.calls() - 1;
    assert!(polled <= 6, "polled {} times", polled);
}

#[test]
#[serial]
fn test_no_notifications_after_stop() {
    let counter = Counter::new();
    let var = counter_variable(&counter, 0.005);
    let recorder = Recorder::new();
    var.add_listener(&Listener::receiver(&recorder)).unwrap();

    var.start(None).unwrap();
    assert!(wait_until(|| recorder.count() >= 3));
    var.stop();

    let settled = recorder.count();
    thread::sleep(Duration::from_millis(30));
    assert_eq!(recorder.count(), settled);
}

#[test]
#[serial]
fn test_counter_end_to_end() {
    let counter = Counter::new();
    let source = counter.clone();
    let var = Variable::builder()
        .name("counter")
        .getter(move || Ok(Value::Int(source.tick())))
        .build()
        .unwrap();
    let recorder = Recorder::new();
    var.add_listener(&Listener::receiver(&recorder)).unwrap();
    let registered = recorder.count();

    var.start(Some(0.01)).unwrap();
    thread::sleep(Duration::from_millis(50));
    var.stop();

    let polled = recorder.count() - registered;
    assert!(polled >= 2, "only {} notifications", polled);
    assert!(polled <= 12, "{} notifications", polled);

    let last = counter.last().unwrap();
    assert_eq!(var.value(), Some(Value::Float(last as f64)));
    assert_eq!(recorder.last().unwrap().value, Value::Float(last as f64));
}

#[test]
#[serial]
fn test_get_value_while_active_does_not_sample() {
    let counter = Counter::new();
    let var = counter_variable(&counter, 10.0);

    var.start(None).unwrap();
    assert!(wait_until(|| var.value() == Some(Value::Int(1))));
    let before = counter.calls();
    assert_eq!(before, 2);

    let cached = var.get_value(false).unwrap();
    assert_eq!(counter.calls(), before);
    assert_eq!(cached, Some(Value::Int(before - 1)));

    let forced = var.get_value(true).unwrap();
    assert_eq!(counter.calls(), before + 1);
    assert_eq!(forced, Some(Value::Int(before)));
    var.stop();
}

#[test]
fn test_start_requires_interval_and_getter() {
    let no_interval = Variable::builder()
        .getter(|| Ok(Value::Float(1.0)))
        .build()
        .unwrap();
    assert!(matches!(
        no_interval.start(None),
        Err(LiveError::Configuration(_))
    ));

    let no_getter = Variable::builder().interval(0.1).build().unwrap();
    assert!(matches!(no_getter.start(None), Err(LiveError::Configuration(_))));
    assert!(!no_getter.is_active());
}

#[test]
fn test_reply_becomes_value() {
    let var = Variable::builder()
        .value(0.0)
        .setter(|v: &Value| Ok(Some(Value::Float(v.as_f64().unwrap_or(0.0).min(10.0)))))
        .reply_is_value(true)
        .build()
        .unwrap();

    assert_eq!(var.set_value(42.0).unwrap(), Value::Float(10.0));
    assert_eq!(var.value(), Some(Value::Float(10.0)));
    assert_eq!(var.reply(), Some(Value::Float(10.0)));

    var.set_reply_is_value(false);
    assert_eq!(var.set_value(42.0).unwrap(), Value::Float(42.0));
    assert_eq!(var.reply(), Some(Value::Float(10.0)));
}

#[test]
fn test_setter_error_propagates() {
    let var = Variable::builder()
        .value(1.0)
        .build()
        .unwrap();
    var.set_setter(|_| Err(anyhow::anyhow!("device offline")));

    let err = var.set_value(2.0).unwrap_err();
    assert!(matches!(err, LiveError::Source(_)));
    assert_eq!(var.value(), Some(Value::Float(1.0)));
}

#[test]
fn test_timestamps_follow_time_offset() {
    let var = Variable::builder().value(1.0).build().unwrap();
    let first = var.timestamp();
    assert!(first >= 0.0);

    let earlier = var.time_offset() - chrono::Duration::seconds(100);
    var.set_time_offset(earlier);
    assert_float_eq(var.timestamp(), first + 100.0, 1e-3);

    var.set_value(2.0).unwrap();
    assert!(var.timestamp() >= first + 100.0);
}
