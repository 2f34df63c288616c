//! livevar - Main Entry Point
//!
//! Runs the sources from a config file, prints every notification they
//! produce and follows them with text labels and a strip chart.
//!
//! ```text
//! livevar [CONFIG] [--seconds N] [--init]
//! ```

use clap::Parser;
use livevar::{
    config::{self, LiveConfig},
    Listener, LiveText, PlotStyle, StripChart, Variable,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "livevar")]
#[command(about = "Poll live variables and print their notifications as JSON")]
struct Args {
    /// Config file (defaults to the app data directory)
    config: Option<PathBuf>,

    /// How long to run, in seconds
    #[arg(long, default_value_t = 10.0, value_parser = parse_seconds)]
    seconds: f64,

    /// Write the default config to the config path and exit
    #[arg(long)]
    init: bool,
}

fn parse_seconds(s: &str) -> Result<f64, String> {
    let seconds: f64 = s
        .trim()
        .parse()
        .map_err(|e| format!("invalid number '{}': {}", s, e))?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(format!("'{}' is not a finite, non-negative duration", s));
    }
    Ok(seconds)
}

fn init_logging(settings: &config::LoggingSettings) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.filter));

    let (file_layer, guard) = match &settings.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, &settings.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_names(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    guard
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let path = match args.config.clone().or_else(config::default_path) {
        Some(path) => path,
        None => anyhow::bail!("no config path given and no data directory available"),
    };

    if args.init {
        LiveConfig::default().save(&path)?;
        println!("Wrote default config to {}", path.display());
        return Ok(());
    }

    let config = LiveConfig::load_or_default(&path);
    let _guard = init_logging(&config.logging);
    tracing::info!("Starting livevar with {} sources", config.sources.len());

    let (tx, rx) = crossbeam_channel::bounded(config.polling.channel_capacity);
    let printer = Listener::channel(tx);

    let mut variables: Vec<(bool, Arc<Variable>)> = Vec::with_capacity(config.sources.len());
    let mut labels = Vec::new();
    for source in &config.sources {
        let variable = Arc::new(source.build_variable(&config.polling)?);
        variable.add_listener(&printer)?;
        if let Some(template) = &source.format {
            labels.push(LiveText::bind(template, &variable)?);
        }
        variables.push((source.autostart, variable));
    }

    // The chart follows the first polled source and pulls the rest
    let chart = StripChart::new("livevar");
    chart.set_bounds(0.0, 30.0, -1.0, 1.0)?;
    for (_, variable) in &variables {
        chart.add_plot(variable.clone(), PlotStyle::Line);
    }
    if let Some((_, lead)) = variables.iter().find(|(autostart, _)| *autostart) {
        chart.listen_to(lead)?;
    }

    let all: Vec<Arc<Variable>> = variables.iter().map(|(_, v)| v.clone()).collect();
    let history = config.build_history(&all)?;

    for (autostart, variable) in &variables {
        if *autostart {
            variable.start(None)?;
        }
    }
    history.start(None)?;

    let deadline = Instant::now() + Duration::from_secs_f64(args.seconds);
    let mut received = 0u64;
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match rx.recv_timeout(remaining.min(Duration::from_millis(200))) {
            Ok(notification) => {
                received += 1;
                match serde_json::to_string(&notification) {
                    Ok(json) => println!("{}", json),
                    Err(e) => tracing::warn!("Failed to encode notification: {}", e),
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                for label in &labels {
                    tracing::debug!("{}", label.text());
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }

    history.stop();
    for (_, variable) in &variables {
        variable.stop();
    }

    let frame = chart.frame();
    tracing::info!(
        "Received {} notifications, chart redrawn {} times, x range {:?}",
        received,
        chart.redraw_count(),
        frame.x_range
    );
    tracing::info!(
        "History kept {} of {} rows",
        history.len(),
        history.capacity()
    );
    for label in &labels {
        tracing::info!("{}", label.text());
    }
    for (_, variable) in &variables {
        summarize(variable);
    }

    tracing::info!("livevar shutting down");
    Ok(())
}

fn summarize(variable: &Variable) {
    let dropped = variable.dropped_notifications();
    if dropped > 0 {
        tracing::warn!("{} dropped {} notifications", variable.name(), dropped);
    }
}
