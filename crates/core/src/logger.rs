//! Logging setup: a plain-text file, an optional stdout stream for headless
//! runs, and a channel feeding the TUI log panel.
//!
//! Level is controlled by `TAPFARM_LOG` (e.g. `TAPFARM_LOG=debug`). Events
//! carrying an `instance` field are shown with that value as their prefix.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::{mpsc, Mutex, OnceLock};

use chrono::Local;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

use crate::error::{Error, Result};
use crate::lock;

// Color indices for TUI rendering (mapped in the tui crate)
pub const COLOR_GRAY: u8 = 1;
pub const COLOR_BLUE: u8 = 2;

static PREFIXES: OnceLock<Mutex<HashMap<String, u8>>> = OnceLock::new();

fn prefixes() -> &'static Mutex<HashMap<String, u8>> {
    PREFIXES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Give a log prefix a color in the TUI.
pub fn register_prefix(prefix: &str, color: u8) {
    lock(prefixes()).insert(prefix.to_string(), color);
}

pub fn prefix_color(prefix: &str) -> u8 {
    lock(prefixes()).get(prefix).copied().unwrap_or(0)
}

#[derive(Default)]
pub struct LogOptions {
    pub verbose: bool,
    /// Also print to stdout (headless mode)
    pub stdout: bool,
    pub tui: Option<mpsc::Sender<String>>,
}

/// Initialize the global subscriber. Truncates `<log_dir>/app.log`.
pub fn init(log_dir: &Path, options: LogOptions) -> Result<()> {
    fs::create_dir_all(log_dir)?;
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(log_dir.join("app.log"))?;

    let default_level = if options.verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_env("TAPFARM_LOG").unwrap_or_else(|_| EnvFilter::new(default_level));

    let stdout_layer = options.stdout.then(|| {
        fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::ChronoLocal::new("%H:%M:%S".to_string()))
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_target(false)
                .with_timer(fmt::time::ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string())),
        )
        .with(stdout_layer)
        .with(options.tui.map(TuiLayer::new))
        .try_init()
        .map_err(|e| Error::config(format!("logger already initialized: {}", e)))?;

    tracing::info!("log file: {}", log_dir.join("app.log").display());
    Ok(())
}

/// Forwards events as `level\x1fprefix\x1fcolor\x1ftimestamp\x1fmessage`.
pub struct TuiLayer {
    tx: Mutex<mpsc::Sender<String>>,
}

impl TuiLayer {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx: Mutex::new(tx) }
    }
}

#[derive(Default)]
struct EventFields {
    message: String,
    instance: String,
    extra: String,
}

impl Visit for EventFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message.push_str(value),
            "instance" => self.instance = value.to_string(),
            name => {
                write!(self.extra, " {}={}", name, value).ok();
            }
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        match field.name() {
            "message" => {
                write!(self.message, "{:?}", value).ok();
            }
            "instance" => self.instance = format!("{:?}", value),
            name => {
                write!(self.extra, " {}={:?}", name, value).ok();
            }
        }
    }
}

pub fn format_tui_line(level: &Level, prefix: &str, message: &str) -> String {
    let ts = Local::now().format("%H:%M:%S");
    format!("{}\x1f{}\x1f{}\x1f{}\x1f{}", level, prefix, prefix_color(prefix), ts, message)
}

impl<S: Subscriber> Layer<S> for TuiLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut fields = EventFields::default();
        event.record(&mut fields);
        let message = fields.message + &fields.extra;
        let line = format_tui_line(event.metadata().level(), &fields.instance, &message);
        lock(&self.tx).send(line).ok();
    }
}
