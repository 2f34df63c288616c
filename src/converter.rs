//! Rhai converter scripts
//!
//! A [`Converter`] turns a raw sample into the value a variable stores, e.g.
//! scaling an ADC reading to volts. Scripts are either a bare expression over
//! `value` (also bound as `raw`) or a script defining `fn convert(value)`.
//!
//! ## Context functions
//!
//! - `time()` - timestamp of the sample in seconds
//! - `dt()` - seconds since the previous sample
//! - `prev()` / `prev_raw()` - previous converted / raw value (NaN at first)
//! - `has_prev()`
//!
//! ## Transformers
//!
//! - `derivative(value)` / `derivative(current, previous, dt)`
//! - `integrate(value)`
//! - `smooth(value, alpha)` / `smooth(current, previous, alpha)`
//! - `lowpass(value, cutoff_hz)`
//! - `deadband(value, center, width)`
//! - `map_range(x, in_min, in_max, out_min, out_max)`
//!
//! A converter that fails at runtime falls back to the raw value for that
//! sample, so a bad script never stalls polling.

use crate::error::{LiveError, Result, ResultExt};
use crate::types::Value;
use crate::util::{lock, read, write};
use rhai::{Dynamic, Engine, Scope, AST};
use std::sync::{Arc, Mutex, RwLock};

/// Timing and history visible to a script while it runs
#[derive(Debug, Clone, Copy)]
struct ExecutionContext {
    time_secs: f64,
    dt_secs: f64,
    prev_raw: f64,
    prev_converted: f64,
}

impl ExecutionContext {
    fn first_sample(time_secs: f64) -> Self {
        Self {
            time_secs,
            dt_secs: 0.0,
            prev_raw: f64::NAN,
            prev_converted: f64::NAN,
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::first_sample(0.0)
    }
}

type SharedContext = Arc<RwLock<ExecutionContext>>;

/// A compiled converter script with its own sample history
pub struct Converter {
    name: String,
    source: String,
    engine: Engine,
    ast: AST,
    has_convert_fn: bool,
    context: SharedContext,
    /// Previous sample per column; scalars use column 0
    history: Mutex<Vec<Option<ExecutionContext>>>,
}

impl Converter {
    /// Compile `source`
    pub fn compile(name: impl Into<String>, source: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let source = source.into();
        let context: SharedContext = Arc::new(RwLock::new(ExecutionContext::default()));

        let mut engine = Engine::new();
        configure_engine(&mut engine, context.clone());

        let ast = engine
            .compile(&source)
            .map_err(|e| LiveError::Script(format!("Failed to compile '{}': {}", name, e)))?;
        let has_convert_fn = ast
            .iter_functions()
            .any(|f| f.name == "convert" && f.params.len() == 1);

        Ok(Self {
            name,
            source,
            engine,
            ast,
            has_convert_fn,
            context,
            history: Mutex::new(Vec::new()),
        })
    }

    /// Script name used in logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Script source
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Forget the previous sample (stateful transformers start over)
    pub fn clear_state(&self) {
        lock(&self.history).clear();
    }

    /// Run the script on one number
    pub fn execute(&self, raw: f64, time_secs: f64) -> Result<f64> {
        let mut history = lock(&self.history);
        self.step(&mut history, 0, raw, time_secs)
    }

    /// Evaluate one column with that column's previous sample as context
    ///
    /// The caller holds the history lock for the whole sample, so the shared
    /// script context cannot be overwritten mid-row.
    fn step(
        &self,
        history: &mut Vec<Option<ExecutionContext>>,
        column: usize,
        raw: f64,
        time_secs: f64,
    ) -> Result<f64> {
        if history.len() <= column {
            history.resize(column + 1, None);
        }
        let ctx = match history[column] {
            Some(prev) => ExecutionContext {
                time_secs,
                dt_secs: (time_secs - prev.time_secs).max(0.0),
                prev_raw: prev.prev_raw,
                prev_converted: prev.prev_converted,
            },
            None => ExecutionContext::first_sample(time_secs),
        };
        *write(&self.context) = ctx;

        let result = self.eval(raw);
        let converted = *result.as_ref().unwrap_or(&raw);
        history[column] = Some(ExecutionContext {
            time_secs,
            dt_secs: ctx.dt_secs,
            prev_raw: raw,
            prev_converted: converted,
        });
        result
    }

    /// Convert a sample
    ///
    /// Numbers and booleans go through the script, rows are converted
    /// element by element with per-column history. A runtime failure keeps
    /// the raw sample.
    pub fn apply(&self, raw: Value, time_secs: f64) -> Value {
        match raw {
            Value::Row(items) => {
                let mut history = lock(&self.history);
                Value::Row(
                    items
                        .into_iter()
                        .enumerate()
                        .map(|(column, x)| {
                            self.step(&mut history, column, x, time_secs)
                                .unwrap_or(x)
                        })
                        .collect(),
                )
            }
            other => match other.as_f64() {
                Some(x) => match self.execute(x, time_secs) {
                    Ok(converted) => Value::Float(converted),
                    Err(e) => {
                        tracing::debug!("Converter '{}' failed, keeping raw value: {}", self.name, e);
                        other
                    }
                },
                None => other,
            },
        }
    }

    fn eval(&self, raw: f64) -> Result<f64> {
        let mut scope = Scope::new();
        scope.push("value", raw);
        scope.push("raw", raw);

        let result: Dynamic = if self.has_convert_fn {
            self.engine
                .call_fn::<Dynamic>(&mut scope, &self.ast, "convert", (raw,))
                .with_context(|| format!("Converter '{}'", self.name))?
        } else {
            self.engine
                .eval_ast_with_scope::<Dynamic>(&mut scope, &self.ast)
                .with_context(|| format!("Converter '{}'", self.name))?
        };

        if let Ok(f) = result.as_float() {
            Ok(f)
        } else if let Ok(i) = result.as_int() {
            Ok(i as f64)
        } else {
            Err(LiveError::Script(format!(
                "Converter '{}' must return a number, got {}",
                self.name,
                result.type_name()
            )))
        }
    }

    /// Check a script without keeping it
    pub fn validate(source: &str) -> Result<()> {
        Engine::new()
            .compile(source)
            .map(|_| ())
            .map_err(|e| LiveError::Script(format!("Validation error: {}", e)))
    }
}

impl std::fmt::Debug for Converter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Converter")
            .field("name", &self.name)
            .field("source", &self.source)
            .finish()
    }
}

fn configure_engine(engine: &mut Engine, context: SharedContext) {
    engine.set_max_expr_depths(64, 64);
    engine.set_max_call_levels(32);
    engine.set_max_operations(10_000);
    engine.set_max_string_size(10_000);
    engine.set_max_array_size(1_000);

    {
        let ctx = context.clone();
        engine.register_fn("time", move || -> f64 { read(&ctx).time_secs });
    }
    {
        let ctx = context.clone();
        engine.register_fn("dt", move || -> f64 { read(&ctx).dt_secs });
    }
    {
        let ctx = context.clone();
        engine.register_fn("prev", move || -> f64 { read(&ctx).prev_converted });
    }
    {
        let ctx = context.clone();
        engine.register_fn("prev_raw", move || -> f64 { read(&ctx).prev_raw });
    }
    {
        let ctx = context.clone();
        engine.register_fn("has_prev", move || -> bool {
            !read(&ctx).prev_converted.is_nan()
        });
    }

    engine.register_fn(
        "derivative",
        |current: f64, previous: f64, dt: f64| -> f64 { derivative(current, previous, dt) },
    );
    {
        let ctx = context.clone();
        engine.register_fn("derivative", move |current: f64| -> f64 {
            let c = *read(&ctx);
            derivative(current, c.prev_converted, c.dt_secs)
        });
    }
    {
        let ctx = context.clone();
        engine.register_fn("integrate", move |current: f64| -> f64 {
            let c = *read(&ctx);
            if c.prev_converted.is_nan() {
                current * c.dt_secs
            } else {
                c.prev_converted + current * c.dt_secs
            }
        });
    }

    engine.register_fn("smooth", |current: f64, previous: f64, alpha: f64| -> f64 {
        smooth(current, previous, alpha)
    });
    {
        let ctx = context.clone();
        engine.register_fn("smooth", move |current: f64, alpha: f64| -> f64 {
            smooth(current, read(&ctx).prev_converted, alpha)
        });
    }
    {
        let ctx = context;
        engine.register_fn("lowpass", move |current: f64, cutoff_hz: f64| -> f64 {
            let c = *read(&ctx);
            if !c.prev_converted.is_nan() && c.dt_secs > 0.0 && cutoff_hz > 0.0 {
                let rc = 1.0 / (2.0 * std::f64::consts::PI * cutoff_hz);
                let alpha = c.dt_secs / (rc + c.dt_secs);
                c.prev_converted + alpha * (current - c.prev_converted)
            } else {
                current
            }
        });
    }

    engine.register_fn("deadband", |value: f64, center: f64, width: f64| -> f64 {
        if (value - center).abs() < width / 2.0 {
            center
        } else {
            value
        }
    });
    engine.register_fn(
        "map_range",
        |x: f64, in_min: f64, in_max: f64, out_min: f64, out_max: f64| -> f64 {
            (x - in_min) * (out_max - out_min) / (in_max - in_min) + out_min
        },
    );
    engine.register_fn("clamp", |x: f64, min: f64, max: f64| x.clamp(min, max));
    engine.register_fn("pi", || std::f64::consts::PI);
}

fn derivative(current: f64, previous: f64, dt: f64) -> f64 {
    if dt > 0.0 && !previous.is_nan() {
        (current - previous) / dt
    } else {
        0.0
    }
}

fn smooth(current: f64, previous: f64, alpha: f64) -> f64 {
    let alpha = alpha.clamp(0.0, 1.0);
    if previous.is_nan() {
        current
    } else {
        alpha * previous + (1.0 - alpha) * current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_expression() {
        let conv = Converter::compile("double", "value * 2.0").unwrap();
        assert_eq!(conv.execute(21.0, 0.0).unwrap(), 42.0);
    }

    #[test]
    fn test_convert_function() {
        let conv = Converter::compile("adc", "fn convert(v) { v * 3.3 / 4095.0 }").unwrap();
        let volts = conv.execute(2048.0, 0.0).unwrap();
        assert!((volts - 1.65).abs() < 0.01);
    }

    #[test]
    fn test_integer_result_is_accepted() {
        let conv = Converter::compile("const", "7").unwrap();
        assert_eq!(conv.execute(1.0, 0.0).unwrap(), 7.0);
    }

    #[test]
    fn test_compile_error() {
        let err = Converter::compile("broken", "value * (").unwrap_err();
        assert!(matches!(err, LiveError::Script(_)));
    }

    #[test]
    fn test_smooth_uses_previous_sample() {
        let conv = Converter::compile("smoothed", "smooth(value, 0.5)").unwrap();
        assert_eq!(conv.execute(10.0, 0.0).unwrap(), 10.0);
        assert!((conv.execute(20.0, 0.1).unwrap() - 15.0).abs() < 1e-9);
        assert!((conv.execute(20.0, 0.2).unwrap() - 17.5).abs() < 1e-9);

        conv.clear_state();
        assert_eq!(conv.execute(20.0, 0.3).unwrap(), 20.0);
    }

    #[test]
    fn test_derivative_from_context() {
        let conv = Converter::compile("rate", "derivative(value)").unwrap();
        assert_eq!(conv.execute(0.0, 0.0).unwrap(), 0.0);
        assert!((conv.execute(5.0, 0.5).unwrap() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_apply_falls_back_to_raw() {
        let conv = Converter::compile("text", "\"not a number\"").unwrap();
        assert_eq!(conv.apply(Value::Float(3.0), 0.0), Value::Float(3.0));
    }

    #[test]
    fn test_apply_row_elementwise() {
        let conv = Converter::compile("offset", "value + 1.0").unwrap();
        assert_eq!(
            conv.apply(Value::Row(vec![1.0, 2.0]), 0.0),
            Value::Row(vec![2.0, 3.0])
        );
    }

    #[test]
    fn test_row_columns_keep_their_own_history() {
        let conv = Converter::compile("rate", "derivative(value)").unwrap();
        assert_eq!(
            conv.apply(Value::Row(vec![0.0, 10.0]), 0.0),
            Value::Row(vec![0.0, 0.0])
        );
        assert_eq!(
            conv.apply(Value::Row(vec![1.0, 30.0]), 0.5),
            Value::Row(vec![2.0, 40.0])
        );
    }

    #[test]
    fn test_row_sees_sample_time() {
        let conv = Converter::compile("stamp", "value + time() + dt()").unwrap();
        conv.execute(0.0, 100.0).unwrap();
        assert_eq!(
            conv.apply(Value::Row(vec![1.0, 2.0]), 3.0),
            Value::Row(vec![4.0, 5.0])
        );
    }

    #[test]
    fn test_apply_leaves_text_alone() {
        let conv = Converter::compile("double", "value * 2.0").unwrap();
        assert_eq!(conv.apply(Value::from("abc"), 0.0), Value::from("abc"));
        assert_eq!(conv.apply(Value::Int(2), 0.0), Value::Float(4.0));
    }

    #[test]
    fn test_validate() {
        assert!(Converter::validate("value + 1").is_ok());
        assert!(Converter::validate("value +").is_err());
    }
}
