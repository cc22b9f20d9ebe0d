//! Forwarding of local warnings to a remote log feed.
//!
//! [`RemoteLog`] is a shared, bounded queue of formatted log lines. Its
//! [`RemoteLogLayer`] plugs into a `tracing_subscriber` registry and queues
//! every event at `WARN` or above. The [`Uplink`](crate::Uplink) drains the
//! queue once per tick into the configured log feed, but only while the
//! channel is usable and publishing is not throttled; lines queued while the
//! uplink cannot publish are discarded.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

const DEFAULT_CAPACITY: usize = 16;

#[derive(Debug)]
struct Shared {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
    target_prefix: Option<String>,
    forwarding: AtomicBool,
}

/// Handle to the queue of log lines awaiting forwarding.
///
/// Clones share the same queue.
#[derive(Debug, Clone)]
pub struct RemoteLog {
    shared: Arc<Shared>,
}

impl Default for RemoteLog {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteLog {
    /// Creates a queue holding up to 16 lines.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a queue holding up to `capacity` lines. The oldest line is
    /// dropped when full.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::build(capacity, None)
    }

    /// Creates a queue that only captures events whose target starts with
    /// `prefix`.
    pub fn for_target(prefix: impl Into<String>) -> Self {
        Self::build(DEFAULT_CAPACITY, Some(prefix.into()))
    }

    fn build(capacity: usize, target_prefix: Option<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                lines: Mutex::new(VecDeque::new()),
                capacity: capacity.max(1),
                target_prefix,
                forwarding: AtomicBool::new(false),
            }),
        }
    }

    /// A subscriber layer feeding this queue.
    pub fn layer(&self) -> RemoteLogLayer {
        RemoteLogLayer {
            log: self.clone(),
        }
    }

    /// Queues a line.
    pub fn push(&self, line: impl Into<String>) {
        if self.shared.forwarding.load(Ordering::Relaxed) {
            return;
        }
        let mut lines = self.shared.lines.lock();
        if lines.len() == self.shared.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    /// Removes and returns every queued line.
    pub fn drain(&self) -> Vec<String> {
        self.shared.lines.lock().drain(..).collect()
    }

    /// Number of queued lines.
    pub fn len(&self) -> usize {
        self.shared.lines.lock().len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Suspends capture while `f` runs, so records raised by forwarding
    /// itself are not queued again.
    pub(crate) fn forwarding<R>(&self, f: impl FnOnce() -> R) -> R {
        self.shared.forwarding.store(true, Ordering::Relaxed);
        let result = f();
        self.shared.forwarding.store(false, Ordering::Relaxed);
        result
    }

    fn captures(&self, event: &Event<'_>) -> bool {
        let meta = event.metadata();
        *meta.level() <= Level::WARN
            && self
                .shared
                .target_prefix
                .as_deref()
                .map_or(true, |prefix| meta.target().starts_with(prefix))
    }
}

/// `tracing_subscriber` layer that queues `WARN` and `ERROR` events into a
/// [`RemoteLog`].
#[derive(Debug, Clone)]
pub struct RemoteLogLayer {
    log: RemoteLog,
}

impl<S: Subscriber> Layer<S> for RemoteLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if !self.log.captures(event) {
            return;
        }
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        let mut line = event.metadata().level().to_string();
        if !visitor.message.is_empty() {
            let _ = write!(line, " {}", visitor.message);
        }
        line.push_str(&visitor.fields);
        self.log.push(line);
    }
}

/// Collects an event as `message` plus ` key=value` pairs.
#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={value}", field.name());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            let _ = write!(self.fields, " {}={value:?}", field.name());
        }
    }
}
