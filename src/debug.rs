//! Optional debug and performance recorder.
//!
//! The recorder only observes: it logs the start and end of invocations and
//! keeps the most recent samples for inspection. Nothing it does changes the
//! outcome of an invocation.
use std::collections::VecDeque;
use std::env;
use std::fmt;
use std::time::{Duration, Instant};

use log::Level;
use may::sync::Mutex;

/// number of samples kept in the ring
pub const SAMPLE_CAPACITY: usize = 64;

/// environment variable read by [`DebugOptions::from_env`]
pub const DEBUG_ENV: &str = "PORT_RPC_DEBUG";

/// Recorder configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DebugOptions {
    /// record anything at all
    pub enabled: bool,
    /// 0 silent, 1 failures, 2 protocol failures, 3 completions, 4 starts, 5 everything
    pub level: u8,
    /// log durations and keep samples
    pub log_performance: bool,
}

impl DebugOptions {
    /// enabled at the given level, clamped to 0..=5
    pub fn level(level: u8) -> Self {
        DebugOptions {
            enabled: true,
            level: level.min(5),
            log_performance: false,
        }
    }

    /// also record durations
    pub fn with_performance(mut self) -> Self {
        self.log_performance = true;
        self
    }

    /// Read `PORT_RPC_DEBUG=<level>[,perf]`, disabled when unset or invalid.
    pub fn from_env() -> Self {
        env::var(DEBUG_ENV)
            .ok()
            .and_then(|v| Self::parse(&v))
            .unwrap_or_default()
    }

    fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split(',').map(str::trim);
        let level = parts.next()?.parse::<u8>().ok()?;
        let mut opts = DebugOptions::level(level);
        if parts.any(|p| p == "perf") {
            opts.log_performance = true;
        }
        Some(opts)
    }
}

/// Which side recorded a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Link,
    Dispatcher,
}

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Failed,
    TimedOut,
    Disconnected,
    Cancelled,
}

impl Outcome {
    fn log_level(self) -> (u8, Level) {
        match self {
            Outcome::Failed => (1, Level::Error),
            Outcome::TimedOut | Outcome::Disconnected => (2, Level::Warn),
            Outcome::Ok | Outcome::Cancelled => (3, Level::Info),
        }
    }
}

/// An operation in flight.
#[derive(Debug)]
pub struct Span {
    side: Side,
    method: &'static str,
    path: String,
    id: String,
    started: Instant,
}

/// A finished operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub side: Side,
    pub method: &'static str,
    pub path: String,
    pub id: String,
    pub outcome: Outcome,
    pub duration: Duration,
}

/// Bounded recorder of recent operations.
pub struct Recorder {
    options: DebugOptions,
    samples: Mutex<VecDeque<Sample>>,
}

impl fmt::Debug for Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorder")
            .field("options", &self.options)
            .finish()
    }
}

impl Recorder {
    pub fn new(options: DebugOptions) -> Self {
        Recorder {
            options,
            samples: Mutex::new(VecDeque::with_capacity(SAMPLE_CAPACITY)),
        }
    }

    pub fn options(&self) -> DebugOptions {
        self.options
    }

    /// Start timing an operation, `None` when the recorder is disabled.
    pub fn begin(&self, side: Side, method: &'static str, path: &str, id: &str) -> Option<Span> {
        if !self.options.enabled {
            return None;
        }
        if self.options.level >= 4 {
            debug!("[{side:?}] {method} {path} started, id={id}");
        }
        Some(Span {
            side,
            method,
            path: path.to_owned(),
            id: id.to_owned(),
            started: Instant::now(),
        })
    }

    /// Trace a raw message, only at level 5.
    pub fn message(&self, side: Side, direction: &str, msg: &serde_json::Value) {
        if self.options.enabled && self.options.level >= 5 {
            trace!("[{side:?}] {direction} {msg}");
        }
    }

    /// Close a span.
    pub fn finish(&self, span: Option<Span>, outcome: Outcome) {
        let Some(span) = span else { return };
        let duration = span.started.elapsed();
        let (min_level, level) = outcome.log_level();
        if self.options.level >= min_level {
            if self.options.log_performance {
                log!(
                    level,
                    "[{:?}] {} {} {:?} in {:?}, id={}",
                    span.side,
                    span.method,
                    span.path,
                    outcome,
                    duration,
                    span.id
                );
            } else {
                log!(
                    level,
                    "[{:?}] {} {} {:?}, id={}",
                    span.side,
                    span.method,
                    span.path,
                    outcome,
                    span.id
                );
            }
        }
        if !self.options.log_performance {
            return;
        }
        let sample = Sample {
            side: span.side,
            method: span.method,
            path: span.path,
            id: span.id,
            outcome,
            duration,
        };
        if let Ok(mut samples) = self.samples.lock() {
            if samples.len() == SAMPLE_CAPACITY {
                samples.pop_front();
            }
            samples.push_back(sample);
        }
    }

    /// Most recent samples, oldest first.
    pub fn recent(&self) -> Vec<Sample> {
        self.samples
            .lock()
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Mean duration of the kept samples.
    pub fn average(&self) -> Option<Duration> {
        let samples = self.samples.lock().ok()?;
        if samples.is_empty() {
            return None;
        }
        let total: Duration = samples.iter().map(|s| s.duration).sum();
        Some(total / samples.len() as u32)
    }
}

impl Default for Recorder {
    fn default() -> Self {
        Recorder::new(DebugOptions::default())
    }
}
