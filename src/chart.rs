//! Chart models
//!
//! Two toolkit-independent plot models that a renderer turns into pixels:
//!
//! - [`StripChart`] - scrolling time chart of several variables. It listens
//!   to one (driving) variable; on every notification it pulls the current
//!   value of every other plotted variable, so only the driving variable
//!   needs to be polling. Alternatively it polls itself with
//!   [`StripChart::start`], using wall-clock seconds since its time origin
//!   as x.
//! - [`HistoryPlot`] - column pairs taken straight from history getters,
//!   with an autoscaled x range.
//!
//! Both hand a [`ChartFrame`] snapshot to an optional redraw hook whenever
//! new data arrives.

use crate::error::{LiveError, Result};
use crate::getter::HistoryGetter;
use crate::listener::{DeliveryError, Listener, NotificationReceiver};
use crate::scheduler::{validate_interval, PollingTask};
use crate::types::{Notification, VariableId};
use crate::util::{lock, read, seconds_between, write};
use crate::variable::Variable;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// Self-polling interval of a strip chart, in seconds
pub const DEFAULT_CHART_INTERVAL_SECS: f64 = 0.1;

/// Visual style for plotting data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PlotStyle {
    /// Standard line plot (default)
    #[default]
    Line,
    /// Scatter plot showing individual data points
    Scatter,
    /// Step plot with horizontal-then-vertical transitions
    Step,
    /// Area plot filled to the X-axis
    Area,
}

impl PlotStyle {
    /// Get all available plot styles
    pub fn all() -> &'static [PlotStyle] {
        &[PlotStyle::Line, PlotStyle::Scatter, PlotStyle::Step, PlotStyle::Area]
    }

    /// Get display name for this plot style
    pub fn display_name(&self) -> &'static str {
        match self {
            PlotStyle::Line => "Line",
            PlotStyle::Scatter => "Scatter",
            PlotStyle::Step => "Step",
            PlotStyle::Area => "Area",
        }
    }
}

/// Identifies a plot within one chart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlotId(pub u32);

impl std::fmt::Display for PlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "plot#{}", self.0)
    }
}

/// Axis limits
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
}

impl Bounds {
    /// Checked constructor: all finite, min below max
    pub fn new(x_min: f64, x_max: f64, y_min: f64, y_max: f64) -> Result<Self> {
        let all_finite = [x_min, x_max, y_min, y_max].iter().all(|v| v.is_finite());
        if !all_finite || x_min >= x_max || y_min >= y_max {
            return Err(LiveError::Configuration(format!(
                "invalid chart bounds x [{}, {}] y [{}, {}]",
                x_min, x_max, y_min, y_max
            )));
        }
        Ok(Self {
            x_min,
            x_max,
            y_min,
            y_max,
        })
    }

    pub fn width(&self) -> f64 {
        self.x_max - self.x_min
    }
}

impl Default for Bounds {
    fn default() -> Self {
        Self {
            x_min: 0.0,
            x_max: 10.0,
            y_min: 0.0,
            y_max: 10.0,
        }
    }
}

/// One drawable series
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub label: String,
    pub style: PlotStyle,
    pub points: Vec<[f64; 2]>,
}

/// Everything a renderer needs for one redraw
#[derive(Debug, Clone, PartialEq)]
pub struct ChartFrame {
    pub title: String,
    pub x_range: (f64, f64),
    /// `None` lets the renderer autoscale
    pub y_range: Option<(f64, f64)>,
    pub series: Vec<Series>,
}

/// Called with a fresh frame whenever a chart receives data
pub type RedrawFn = Arc<dyn Fn(&ChartFrame) + Send + Sync>;

struct StripPlot {
    id: PlotId,
    variable: Arc<Variable>,
    label: String,
    style: PlotStyle,
    points: VecDeque<[f64; 2]>,
}

/// Scrolling multi-variable time chart
pub struct StripChart {
    title: String,
    plots: RwLock<Vec<StripPlot>>,
    bounds: RwLock<Bounds>,
    max_points: RwLock<Option<usize>>,
    redraw: RwLock<Option<RedrawFn>>,
    next_plot: AtomicU32,
    redraws: AtomicU64,
    interval: Mutex<Duration>,
    task: Mutex<Option<PollingTask>>,
    time_origin: RwLock<DateTime<Utc>>,
}

impl StripChart {
    pub fn new(title: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            title: title.into(),
            plots: RwLock::new(Vec::new()),
            bounds: RwLock::new(Bounds::default()),
            max_points: RwLock::new(None),
            redraw: RwLock::new(None),
            next_plot: AtomicU32::new(1),
            redraws: AtomicU64::new(0),
            interval: Mutex::new(Duration::from_secs_f64(DEFAULT_CHART_INTERVAL_SECS)),
            task: Mutex::new(None),
            time_origin: RwLock::new(Utc::now()),
        })
    }

    /// Plot `variable`; its label defaults to the variable name
    pub fn add_plot(&self, variable: Arc<Variable>, style: PlotStyle) -> PlotId {
        let label = variable.name().to_string();
        self.add_labeled_plot(variable, style, label)
    }

    pub fn add_labeled_plot(
        &self,
        variable: Arc<Variable>,
        style: PlotStyle,
        label: impl Into<String>,
    ) -> PlotId {
        let id = PlotId(self.next_plot.fetch_add(1, Ordering::Relaxed));
        write(&self.plots).push(StripPlot {
            id,
            variable,
            label: label.into(),
            style,
            points: VecDeque::new(),
        });
        tracing::debug!("{}: added {}", self.title, id);
        id
    }

    pub fn remove_plot(&self, id: PlotId) -> Result<()> {
        let mut plots = write(&self.plots);
        let index = plots
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| LiveError::Configuration(format!("{} has no {}", self.title, id)))?;
        plots.remove(index);
        Ok(())
    }

    /// Remove every plot of the variable `source`
    ///
    /// Returns how many plots were removed; a variable that is not plotted
    /// is an error.
    pub fn remove_source(&self, source: VariableId) -> Result<usize> {
        let mut plots = write(&self.plots);
        let before = plots.len();
        plots.retain(|p| p.variable.id() != source);
        match before - plots.len() {
            0 => Err(LiveError::Configuration(format!(
                "{} does not plot {}",
                self.title, source
            ))),
            removed => Ok(removed),
        }
    }

    pub fn plot_count(&self) -> usize {
        read(&self.plots).len()
    }

    /// Visible window; x scrolls once data passes `x_max`
    pub fn set_bounds(&self, x_min: f64, x_max: f64, y_min: f64, y_max: f64) -> Result<()> {
        *write(&self.bounds) = Bounds::new(x_min, x_max, y_min, y_max)?;
        Ok(())
    }

    pub fn bounds(&self) -> Bounds {
        *read(&self.bounds)
    }

    /// Keep at most `points` samples per plot
    pub fn set_max_points(&self, points: Option<usize>) {
        *write(&self.max_points) = points;
        if let Some(max) = points {
            for plot in write(&self.plots).iter_mut() {
                trim(&mut plot.points, max);
            }
        }
    }

    pub fn set_redraw_hook<F>(&self, hook: F)
    where
        F: Fn(&ChartFrame) + Send + Sync + 'static,
    {
        *write(&self.redraw) = Some(Arc::new(hook));
    }

    /// Number of redraws requested so far
    pub fn redraw_count(&self) -> u64 {
        self.redraws.load(Ordering::Relaxed)
    }

    /// Register the chart with its driving variable
    pub fn listen_to(self: &Arc<Self>, variable: &Variable) -> Result<Listener> {
        let listener = Listener::receiver(self);
        variable.add_listener(&listener)?;
        Ok(listener)
    }

    /// Poll every plot every `interval` seconds (default 0.1)
    ///
    /// x is the wall-clock time in seconds since the time origin. Calling
    /// `start` while active only changes the interval. The task holds a weak
    /// reference and ends when the chart is dropped.
    pub fn start(self: &Arc<Self>, interval: Option<f64>) -> Result<()> {
        if let Some(seconds) = interval {
            *lock(&self.interval) = validate_interval(seconds)?;
        }
        let interval = *lock(&self.interval);

        let mut task = lock(&self.task);
        if let Some(running) = task.as_ref().filter(|t| t.is_running()) {
            running.set_interval(interval);
            return Ok(());
        }

        let chart = Arc::downgrade(self);
        *task = Some(PollingTask::spawn(
            format!("chart-{}", self.title),
            interval,
            move || match chart.upgrade() {
                Some(chart) => {
                    chart.sample_now();
                    Ok(())
                }
                None => Err(LiveError::Shutdown),
            },
        )?);
        Ok(())
    }

    /// Stop self-polling and wait for the task to exit
    pub fn stop(&self) {
        let task = lock(&self.task).take();
        if let Some(mut task) = task {
            task.stop();
        }
    }

    /// True while the self-polling task is alive
    pub fn is_active(&self) -> bool {
        lock(&self.task).as_ref().is_some_and(|t| t.is_running())
    }

    /// Self-polling interval in seconds
    pub fn interval(&self) -> f64 {
        lock(&self.interval).as_secs_f64()
    }

    pub fn set_interval(&self, seconds: f64) -> Result<()> {
        let interval = validate_interval(seconds)?;
        *lock(&self.interval) = interval;
        if let Some(task) = lock(&self.task).as_ref() {
            task.set_interval(interval);
        }
        Ok(())
    }

    /// Wall-clock origin of the self-polling x axis
    pub fn time_offset(&self) -> DateTime<Utc> {
        *read(&self.time_origin)
    }

    pub fn set_time_offset(&self, origin: DateTime<Utc>) {
        *write(&self.time_origin) = origin;
    }

    /// Make "now" x = 0
    pub fn reset_time_offset(&self) {
        self.set_time_offset(Utc::now());
    }

    /// Pull every plot once at the current time; returns the x used
    pub fn sample_now(&self) -> f64 {
        let x = seconds_between(self.time_offset(), Utc::now());
        self.record(x, None, None);
        x
    }

    /// Drop all collected points
    pub fn reset_plots(&self) {
        for plot in write(&self.plots).iter_mut() {
            plot.points.clear();
        }
        self.request_redraw();
    }

    /// Points of one plot, oldest first
    pub fn points(&self, id: PlotId) -> Option<Vec<[f64; 2]>> {
        read(&self.plots)
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.points.iter().copied().collect())
    }

    /// x range currently in view
    pub fn visible_x_range(&self) -> (f64, f64) {
        let bounds = self.bounds();
        let latest = read(&self.plots)
            .iter()
            .filter_map(|p| p.points.back().map(|pt| pt[0]))
            .fold(f64::NEG_INFINITY, f64::max);

        if latest > bounds.x_max {
            (latest - bounds.width(), latest)
        } else {
            (bounds.x_min, bounds.x_max)
        }
    }

    pub fn frame(&self) -> ChartFrame {
        let bounds = self.bounds();
        let series = read(&self.plots)
            .iter()
            .map(|p| Series {
                label: p.label.clone(),
                style: p.style,
                points: p.points.iter().copied().collect(),
            })
            .collect();
        ChartFrame {
            title: self.title.clone(),
            x_range: self.visible_x_range(),
            y_range: Some((bounds.y_min, bounds.y_max)),
            series,
        }
    }

    /// Append one sample row at time `x`
    ///
    /// Plots of `source` use `source_value`, every other plot is pulled.
    fn record(&self, x: f64, source: Option<VariableId>, source_value: Option<f64>) {
        // Pull outside the lock: a pulled variable may notify this chart again
        let targets: Vec<(PlotId, Arc<Variable>)> = read(&self.plots)
            .iter()
            .map(|p| (p.id, p.variable.clone()))
            .collect();

        let samples: Vec<(PlotId, Option<f64>)> = targets
            .into_iter()
            .map(|(id, variable)| {
                if Some(variable.id()) == source {
                    return (id, source_value);
                }
                let y = match variable.get_value(false) {
                    Ok(value) => value.and_then(|v| v.as_f64()),
                    Err(e) => {
                        tracing::warn!("{}: pulling {} failed: {}", self.title, variable.name(), e);
                        None
                    }
                };
                (id, y)
            })
            .collect();

        let max_points = *read(&self.max_points);
        {
            let mut plots = write(&self.plots);
            for (id, y) in samples {
                let Some(y) = y else { continue };
                if let Some(plot) = plots.iter_mut().find(|p| p.id == id) {
                    plot.points.push_back([x, y]);
                    if let Some(max) = max_points {
                        trim(&mut plot.points, max);
                    }
                }
            }
        }
        self.request_redraw();
    }

    fn request_redraw(&self) {
        self.redraws.fetch_add(1, Ordering::Relaxed);
        let hook = read(&self.redraw).clone();
        if let Some(hook) = hook {
            hook(&self.frame());
        }
    }
}

impl NotificationReceiver for StripChart {
    fn on_notification(&self, notification: &Notification) -> std::result::Result<(), DeliveryError> {
        self.record(
            notification.timestamp,
            Some(notification.source),
            notification.value.as_f64(),
        );
        Ok(())
    }
}

impl Drop for StripChart {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for StripChart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripChart")
            .field("title", &self.title)
            .field("plots", &self.plot_count())
            .field("bounds", &self.bounds())
            .field("active", &self.is_active())
            .finish()
    }
}

fn trim(points: &mut VecDeque<[f64; 2]>, max: usize) {
    while points.len() > max {
        points.pop_front();
    }
}

struct HistorySeries {
    getter: Arc<HistoryGetter>,
    columns: (usize, usize),
    label: String,
    style: PlotStyle,
}

/// Plot of history getter columns
pub struct HistoryPlot {
    title: String,
    series: RwLock<Vec<HistorySeries>>,
    display_points: RwLock<usize>,
    y_range: RwLock<Option<(f64, f64)>>,
    redraw: RwLock<Option<RedrawFn>>,
}

impl HistoryPlot {
    /// Default number of rows shown per series
    pub const DEFAULT_DISPLAY_POINTS: usize = 100;

    pub fn new(title: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            title: title.into(),
            series: RwLock::new(Vec::new()),
            display_points: RwLock::new(Self::DEFAULT_DISPLAY_POINTS),
            y_range: RwLock::new(None),
            redraw: RwLock::new(None),
        })
    }

    /// Plot column `columns.1` against column `columns.0`
    pub fn add_series(
        &self,
        getter: Arc<HistoryGetter>,
        columns: (usize, usize),
        style: PlotStyle,
        label: impl Into<String>,
    ) -> Result<()> {
        let width = getter.width();
        if columns.0 >= width || columns.1 >= width {
            return Err(LiveError::Configuration(format!(
                "columns {:?} out of range for {} ({} columns)",
                columns,
                getter.name(),
                width
            )));
        }
        write(&self.series).push(HistorySeries {
            getter,
            columns,
            label: label.into(),
            style,
        });
        Ok(())
    }

    pub fn set_display_points(&self, points: usize) {
        *write(&self.display_points) = points;
    }

    /// Fixed y range, or `None` to autoscale
    pub fn set_y_range(&self, range: Option<(f64, f64)>) -> Result<()> {
        if let Some((min, max)) = range {
            if !(min.is_finite() && max.is_finite() && min < max) {
                return Err(LiveError::Configuration(format!(
                    "invalid y range [{}, {}]",
                    min, max
                )));
            }
        }
        *write(&self.y_range) = range;
        Ok(())
    }

    pub fn set_redraw_hook<F>(&self, hook: F)
    where
        F: Fn(&ChartFrame) + Send + Sync + 'static,
    {
        *write(&self.redraw) = Some(Arc::new(hook));
    }

    /// Listen to every getter that has a series on this plot
    pub fn attach(self: &Arc<Self>) -> Result<()> {
        let listener = Listener::receiver(self);
        let getters: Vec<Arc<HistoryGetter>> =
            read(&self.series).iter().map(|s| s.getter.clone()).collect();
        let mut seen: Vec<VariableId> = Vec::new();
        for getter in getters {
            if seen.contains(&getter.id()) {
                continue;
            }
            seen.push(getter.id());
            getter.add_listener(&listener)?;
        }
        Ok(())
    }

    /// Build a frame from the last `display_points` rows of every series
    ///
    /// The x range spans the first to the last x of all series, falling
    /// back to 0..10 without data.
    pub fn frame(&self) -> ChartFrame {
        let display_points = *read(&self.display_points);
        let mut x_min = f64::INFINITY;
        let mut x_max = f64::NEG_INFINITY;

        let series: Vec<Series> = read(&self.series)
            .iter()
            .map(|s| {
                let (xc, yc) = s.columns;
                let points: Vec<[f64; 2]> = s.getter.with_history(|history| {
                    let skip = history.len().saturating_sub(display_points);
                    history.iter().skip(skip).map(|row| [row[xc], row[yc]]).collect()
                });
                if let (Some(first), Some(last)) = (points.first(), points.last()) {
                    x_min = x_min.min(first[0]);
                    x_max = x_max.max(last[0]);
                }
                Series {
                    label: s.label.clone(),
                    style: s.style,
                    points,
                }
            })
            .collect();

        if !x_min.is_finite() {
            x_min = 0.0;
        }
        if !x_max.is_finite() {
            x_max = 10.0;
        }

        ChartFrame {
            title: self.title.clone(),
            x_range: (x_min, x_max),
            y_range: *read(&self.y_range),
            series,
        }
    }
}

impl NotificationReceiver for HistoryPlot {
    fn on_notification(&self, _notification: &Notification) -> std::result::Result<(), DeliveryError> {
        let hook = read(&self.redraw).clone();
        if let Some(hook) = hook {
            hook(&self.frame());
        }
        Ok(())
    }
}

impl std::fmt::Debug for HistoryPlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryPlot")
            .field("title", &self.title)
            .field("series", &read(&self.series).len())
            .finish()
    }
}
