//! Observability for the query/read-feed pipeline
//!
//! - Structured logging (JSON lines through a pluggable sink)
//! - Typed pipeline events
//! - Monotonic counters
//! - Begin/complete scopes
//!
//! Observability is read-only: nothing here changes what a pull returns.
//!
//! ```ignore
//! use crossfeed::observability::{log_event, Event, PipelineMetrics};
//!
//! log_event(Event::SplitDetected, &[("range", "[,FF)")]);
//! let metrics = PipelineMetrics::new();
//! metrics.record_page(10, 2.5);
//! ```

mod events;
mod logger;
mod metrics;
mod scope;

pub use events::Event;
pub use logger::{LogSink, Logger, MemorySink, Severity, StderrSink};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use scope::ObservationScope;

/// Log a pipeline event at its default severity
pub fn log_event(event: Event, fields: &[(&str, &str)]) {
    Logger::log(event.severity(), event.as_str(), fields);
}
