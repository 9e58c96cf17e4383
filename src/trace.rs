use std::sync::{Arc, Mutex};

use tracing::Span;

use crate::digest::Digest;

/// Fans one logical span out to the spans of every job attached to a vertex.
///
/// New spans started for the vertex are linked to every attached span with a
/// `follows_from` relationship, so each client's trace sees the shared work.
#[derive(Clone, Default)]
pub struct MultiSpan {
    spans: Arc<Mutex<Vec<Span>>>,
}

impl MultiSpan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a span. Disabled spans are ignored.
    pub fn add(&self, span: Span) {
        if span.is_none() {
            return;
        }
        self.spans.lock().unwrap().push(span);
    }

    /// The first attached span, if any.
    pub fn primary(&self) -> Option<Span> {
        self.spans.lock().unwrap().first().cloned()
    }

    pub(crate) fn link(&self, child: &Span) {
        for span in self.spans.lock().unwrap().iter() {
            child.follows_from(span.id());
        }
    }
}

/// Starts a span for work on a vertex, linked to all spans attached to the
/// vertex so far.
pub(crate) fn start_span(mspan: &MultiSpan, label: &str, digest: &Digest) -> Span {
    let span = tracing::info_span!("vertex", label = %label, vertex = %digest);
    mspan.link(&span);
    span
}
