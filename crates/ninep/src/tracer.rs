//! Tracing hooks around connection and request handling.
//!
//! A [`Tracer`] is a capability handed to the listener (or to `serve_rwc`)
//! at construction time; there is no process-wide registry. The connection
//! runtime opens a span per connection, a span per request tagged with the
//! request's tag, operation name and a per-connection request counter, and
//! read/write child spans around the transport phases. When no tracer is
//! configured every hook is a no-op.

use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Opaque handle for an open span.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SpanHandle(pub u64);

/// Tags attached to a request span.
#[derive(Clone, Debug, Default)]
pub struct SpanTags {
    /// Client-assigned tag of the request, if the span covers one.
    pub tag: Option<u16>,
    /// Operation name, e.g. "Twalk".
    pub op: Option<&'static str>,
    /// Per-connection request counter.
    pub request_id: Option<u64>,
}

/// Span hooks invoked by the connection runtime.
pub trait Tracer: Send + Sync {
    /// Open a span. `parent` is the enclosing span, if any.
    fn span_start(&self, name: &str, parent: Option<SpanHandle>, tags: &SpanTags) -> SpanHandle;

    /// Close a span previously returned by [`Tracer::span_start`].
    fn span_finish(&self, handle: SpanHandle);
}

/// The tracer used when none is configured. Does nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn span_start(&self, _name: &str, _parent: Option<SpanHandle>, _tags: &SpanTags) -> SpanHandle {
        SpanHandle(0)
    }

    fn span_finish(&self, _handle: SpanHandle) {}
}

/// A tracer that emits spans through the `log` crate at debug level.
#[derive(Debug, Default)]
pub struct LogTracer {
    next: AtomicU64,
}

impl Tracer for LogTracer {
    fn span_start(&self, name: &str, parent: Option<SpanHandle>, tags: &SpanTags) -> SpanHandle {
        let handle = SpanHandle(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        match (tags.op, tags.tag, tags.request_id) {
            (Some(op), Some(tag), Some(id)) => debug!(
                "span {} start: {} op={} tag={} requestID={} parent={:?}",
                handle.0, name, op, tag, id, parent
            ),
            _ => debug!("span {} start: {} parent={:?}", handle.0, name, parent),
        }
        handle
    }

    fn span_finish(&self, handle: SpanHandle) {
        debug!("span {} finish", handle.0);
    }
}

/// Shared tracer handle as stored by listeners and connections.
pub type SharedTracer = Arc<dyn Tracer>;

/// The default no-op tracer.
pub fn noop() -> SharedTracer {
    Arc::new(NoopTracer)
}
