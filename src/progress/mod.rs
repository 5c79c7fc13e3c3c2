//! Structured build events, progress allocations, and console output

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Severity of a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Everything the build pipeline reports while running.
#[derive(Clone)]
pub enum BuildEvent {
    Log {
        level: LogLevel,
        message: String,
    },
    StepStarted {
        step: String,
    },
    StepCompleted {
        step: String,
    },
    /// `units` of the given allocation finished; the remaining work across
    /// all live allocations shrinks by exactly that amount.
    Progress {
        allocation: Arc<Allocation>,
        units: u64,
    },
}

impl fmt::Debug for BuildEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildEvent::Log { level, message } => write!(f, "Log({:?}, {})", level, message),
            BuildEvent::StepStarted { step } => write!(f, "StepStarted({})", step),
            BuildEvent::StepCompleted { step } => write!(f, "StepCompleted({})", step),
            BuildEvent::Progress { allocation, units } => {
                write!(f, "Progress({}, {} units)", allocation.name(), units)
            }
        }
    }
}

/// A node in the progress allocation tree.
///
/// The root owns the whole build as `1.0`. Each child spans one unit of its
/// parent, subdivided into its own unit count (bytes for network steps, 1
/// for bounded steps), so the outstanding allocations always sum to the
/// total remaining work.
pub struct Allocation {
    name: String,
    units: u64,
    fraction_per_unit: f64,
    completed: AtomicU64,
}

impl Allocation {
    pub fn root(name: impl Into<String>, units: u64) -> Arc<Self> {
        let units = units.max(1);
        Arc::new(Allocation {
            name: name.into(),
            units,
            fraction_per_unit: 1.0 / units as f64,
            completed: AtomicU64::new(0),
        })
    }

    /// Derive a child spanning one unit of this allocation.
    pub fn child(self: &Arc<Self>, name: impl Into<String>, units: u64) -> Arc<Self> {
        let units = units.max(1);
        Arc::new(Allocation {
            name: name.into(),
            units,
            fraction_per_unit: self.fraction_per_unit / units as f64,
            completed: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn units(&self) -> u64 {
        self.units
    }

    /// Fraction of the whole build represented by `units` of this node.
    pub fn fraction_of(&self, units: u64) -> f64 {
        self.fraction_per_unit * units as f64
    }

    fn record(&self, units: u64) -> f64 {
        let units = units.min(
            self.units
                .saturating_sub(self.completed.fetch_add(units, Ordering::Relaxed)),
        );
        self.fraction_of(units)
    }
}

type EventHandler = Arc<dyn Fn(&BuildEvent) + Send + Sync>;

/// Fan-out of build events to registered handlers, plus a running total of
/// completed progress. Cheap to clone and share across steps.
#[derive(Clone)]
pub struct EventDispatcher {
    handlers: Arc<Mutex<Vec<EventHandler>>>,
    completed: Arc<Mutex<f64>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        EventDispatcher {
            handlers: Arc::new(Mutex::new(Vec::new())),
            completed: Arc::new(Mutex::new(0.0)),
        }
    }

    /// Dispatcher that renders to the console through a [`Logger`].
    pub fn with_console(logger: Logger) -> Self {
        let dispatcher = Self::new();
        dispatcher.add_handler(move |event| logger.render(event));
        dispatcher
    }

    pub fn add_handler(&self, handler: impl Fn(&BuildEvent) + Send + Sync + 'static) {
        self.handlers
            .lock()
            .expect("event handler list poisoned")
            .push(Arc::new(handler));
    }

    pub fn dispatch(&self, event: BuildEvent) {
        if let BuildEvent::Progress { allocation, units } = &event {
            let fraction = allocation.record(*units);
            let mut completed = self.completed.lock().expect("progress total poisoned");
            *completed = (*completed + fraction).min(1.0);
        }
        let handlers = self
            .handlers
            .lock()
            .expect("event handler list poisoned")
            .clone();
        for handler in handlers {
            handler(&event);
        }
    }

    /// Completed fraction of the whole build, in `0.0..=1.0`.
    pub fn completed_fraction(&self) -> f64 {
        *self.completed.lock().expect("progress total poisoned")
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.dispatch(BuildEvent::Log {
            level,
            message: message.into(),
        });
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    pub fn step_started(&self, step: impl Into<String>) {
        self.dispatch(BuildEvent::StepStarted { step: step.into() });
    }

    pub fn step_completed(&self, step: impl Into<String>) {
        self.dispatch(BuildEvent::StepCompleted { step: step.into() });
    }

    pub fn progress(&self, allocation: &Arc<Allocation>, units: u64) {
        self.dispatch(BuildEvent::Progress {
            allocation: allocation.clone(),
            units,
        });
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Console renderer for build events.
///
/// Supports quiet mode for CI and verbose mode for debugging, and tracks
/// elapsed time since construction.
#[derive(Debug, Clone)]
pub struct Logger {
    pub verbose: bool,
    pub quiet: bool,
    start_time: Instant,
}

impl Logger {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            quiet: false,
            start_time: Instant::now(),
        }
    }

    pub fn new_quiet() -> Self {
        Self {
            verbose: false,
            quiet: true,
            start_time: Instant::now(),
        }
    }

    fn render(&self, event: &BuildEvent) {
        match event {
            BuildEvent::Log { level, message } => match level {
                LogLevel::Debug => {
                    if self.verbose && !self.quiet {
                        println!("[debug] {}", message);
                    }
                }
                LogLevel::Info => {
                    if !self.quiet {
                        println!("{}", message);
                    }
                }
                LogLevel::Warn => {
                    if !self.quiet {
                        println!("warning: {}", message);
                    }
                }
                LogLevel::Error => eprintln!("error: {}", message),
            },
            BuildEvent::StepStarted { step } => {
                if self.verbose && !self.quiet {
                    println!("> {}", step);
                }
            }
            BuildEvent::StepCompleted { step } => {
                if self.verbose && !self.quiet {
                    println!("< {} ({})", step, self.format_duration(self.start_time.elapsed()));
                }
            }
            BuildEvent::Progress { .. } => {}
        }
    }

    /// Format a byte count in human-readable units.
    pub fn format_size(&self, bytes: u64) -> String {
        if bytes < 1024 {
            format!("{} B", bytes)
        } else if bytes < 1024 * 1024 {
            format!("{:.1} KB", bytes as f64 / 1024.0)
        } else if bytes < 1024 * 1024 * 1024 {
            format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
        } else {
            format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
        }
    }

    /// Format a duration as `NsS` / `NmNs` / `NhNmNs`.
    pub fn format_duration(&self, duration: Duration) -> String {
        let secs = duration.as_secs();
        if secs < 60 {
            format!("{}s", secs)
        } else if secs < 3600 {
            format!("{}m{}s", secs / 60, secs % 60)
        } else {
            format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn handlers_receive_dispatched_events() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        dispatcher.add_handler(move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.info("one");
        dispatcher.step_started("two");
        dispatcher.step_completed("two");
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn child_allocations_subdivide_the_root() {
        let root = Allocation::root("build", 4);
        let child = root.child("push layer", 1000);

        // One child unit is worth 1/(4*1000) of the build.
        assert!((child.fraction_of(1) - 1.0 / 4000.0).abs() < 1e-12);
        assert!((child.fraction_of(1000) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn progress_sums_to_one_when_all_allocations_complete() {
        let dispatcher = EventDispatcher::new();
        let root = Allocation::root("build", 2);
        let a = root.child("pull", 100);
        let b = root.child("push", 50);

        dispatcher.progress(&a, 60);
        dispatcher.progress(&a, 40);
        dispatcher.progress(&b, 50);
        assert!((dispatcher.completed_fraction() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn over_reporting_is_clamped() {
        let dispatcher = EventDispatcher::new();
        let root = Allocation::root("build", 1);
        let only = root.child("step", 10);
        dispatcher.progress(&only, 10);
        dispatcher.progress(&only, 10);
        assert!(dispatcher.completed_fraction() <= 1.0 + 1e-9);
    }

    #[test]
    fn size_and_duration_formatting() {
        let logger = Logger::new_quiet();
        assert_eq!(logger.format_size(512), "512 B");
        assert_eq!(logger.format_size(2048), "2.0 KB");
        assert_eq!(logger.format_size(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(logger.format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(logger.format_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(logger.format_duration(Duration::from_secs(3700)), "1h1m40s");
    }
}
