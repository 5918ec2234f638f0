//! An in-process allocation tracker.
//!
//! `leaktrail` intercepts every allocation and deallocation made through
//! the process's default allocation path, records where each block came
//! from (call stack, optionally a usage category and source location) and,
//! when the tracking guard is dropped, reports every allocation that was
//! never released, with call stacks resolved to symbol names.
//!
//! ```no_run
//! use leaktrail::TrackingAllocator;
//!
//! #[global_allocator]
//! static ALLOC: TrackingAllocator = TrackingAllocator;
//!
//! fn main() {
//!     let _leaktrail = leaktrail::init!();
//!
//!     // Reported at guard drop: never released.
//!     std::mem::forget(vec![0u8; 1024]);
//! }
//! ```
//!
//! Only allocations routed through the installed global allocator are
//! seen; direct `libc` calls or allocations from independently linked
//! modules bypass the hook. Identical leak sites are reported
//! individually, not grouped.

mod alloc;
mod capture;
mod output;
mod record;
mod registry;
mod symbolize;

pub use alloc::allocator::{SuppressGuard, TrackingAllocator, MIN_ALIGNMENT};
pub use alloc::bookkeeping::BookkeepingAlloc;
pub use output::{
    DebugSink, JsonPrettyReporter, JsonReporter, LeakReport, Reporter, StderrSink, TextReporter,
};
pub use record::{AllocationRecord, CallSite, MAX_STACK_DEPTH};
pub use registry::{registry, AllocationRegistry, RegistrySnapshot};
pub use symbolize::SymbolResolver;

use arc_swap::ArcSwapOption;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

/// Output format of the teardown report.
#[derive(Clone, Copy, Debug, Default)]
pub enum Format {
    #[default]
    Text,
    Json,
    JsonPretty,
}

struct SessionState {
    caller_name: String,
    start_time: Instant,
}

static LEAKTRAIL_STATE: OnceLock<ArcSwapOption<SessionState>> = OnceLock::new();

/// Configures and builds the [`LeakTracker`] guard.
///
/// ```no_run
/// let _leaktrail = leaktrail::GuardBuilder::new("main")
///     .format(leaktrail::Format::Json)
///     .build();
/// ```
pub struct GuardBuilder {
    caller_name: String,
    format: Format,
    reporter: Option<Box<dyn Reporter>>,
    sink: Option<Arc<dyn DebugSink>>,
}

impl GuardBuilder {
    pub fn new(caller_name: impl Into<String>) -> Self {
        Self {
            caller_name: caller_name.into(),
            format: Format::default(),
            reporter: None,
            sink: None,
        }
    }

    pub fn format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    /// Overrides the format-derived reporter entirely.
    pub fn reporter(mut self, reporter: Box<dyn Reporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn DebugSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Arms leak reporting and returns the guard.
    ///
    /// # Panics
    ///
    /// Panics if another guard is already alive; the report is tied to the
    /// process lifetime and cannot be produced twice concurrently.
    pub fn build(self) -> LeakTracker {
        let slot = LEAKTRAIL_STATE.get_or_init(|| ArcSwapOption::from(None));
        if slot.load().is_some() {
            panic!("More than one leaktrail guard cannot be alive at the same time.");
        }

        let session = Arc::new(SessionState {
            caller_name: self.caller_name,
            start_time: Instant::now(),
        });
        slot.store(Some(Arc::clone(&session)));

        let reporter = self.reporter.unwrap_or_else(|| match self.format {
            Format::Text => Box::new(TextReporter),
            Format::Json => Box::new(JsonReporter),
            Format::JsonPretty => Box::new(JsonPrettyReporter),
        });
        let sink = self.sink.unwrap_or_else(|| Arc::new(StderrSink));

        registry().set_enabled(true);

        LeakTracker {
            session,
            reporter,
            sink,
        }
    }
}

/// Guard whose lifetime wraps the tracked execution window. Dropping it
/// disables further recording, snapshots the registry and writes the leak
/// report.
pub struct LeakTracker {
    session: Arc<SessionState>,
    reporter: Box<dyn Reporter>,
    sink: Arc<dyn DebugSink>,
}

impl LeakTracker {
    pub fn set_reporter(&mut self, reporter: Box<dyn Reporter>) {
        self.reporter = reporter;
    }

    pub fn set_sink(&mut self, sink: Arc<dyn DebugSink>) {
        self.sink = sink;
    }
}

impl Drop for LeakTracker {
    fn drop(&mut self) {
        // Disable first so the resolver's own allocations during the
        // report are not tracked (and cannot re-enter the lock).
        let reg = registry();
        reg.set_enabled(false);

        let report = LeakReport {
            snapshot: reg.snapshot(),
            caller_name: self.session.caller_name.clone(),
            total_elapsed: self.session.start_time.elapsed(),
        };

        if let Err(err) = self.reporter.report(&report, self.sink.as_ref()) {
            self.sink
                .write(&format!("[leaktrail] report failed: {err}\n"));
        }

        if let Some(slot) = LEAKTRAIL_STATE.get() {
            slot.store(None);
        }
    }
}

/// Builds a [`LeakTracker`] guard with the caller's module path as the
/// report title and the default text reporter.
#[macro_export]
macro_rules! init {
    () => {{
        fn __caller_fn() {}
        let caller_name = std::any::type_name_of_val(&__caller_fn);
        let caller_name = caller_name
            .strip_suffix("::__caller_fn")
            .unwrap_or(caller_name)
            .replace("::{{closure}}", "");

        $crate::GuardBuilder::new(caller_name).build()
    }};
}
