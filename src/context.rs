use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::Span;

use crate::cache::CacheOpts;
use crate::error::Cancelled;
use crate::progress::Writer;

/// The call context threaded through every suspension point of the solver.
///
/// A context carries cancellation (explicit, deadline-based, or joined over
/// a set of callers), the progress sink events should be written to, the
/// active trace span, and the cache options of ancestor vertices so remote
/// cache providers can see the chain they are queried under.
///
/// Contexts are cheap to clone; deriving one never mutates its parent.
#[derive(Clone)]
pub struct Context {
    cancel: CancelState,
    deadline: Option<Instant>,
    progress: Option<Writer>,
    span: Span,
    cache_opts: Option<Arc<Vec<CacheOpts>>>,
}

#[derive(Clone, Default)]
enum CancelState {
    #[default]
    Never,
    Token(Arc<CancelToken>),
    /// Cancelled once every joined caller has cancelled. Used by
    /// single-flight leaders so that a lone caller aborting aborts the work,
    /// while remaining joiners keep it alive.
    Joined(Arc<Mutex<Vec<Context>>>),
}

struct CancelToken {
    parent: Box<Context>,
    cause: Mutex<Option<String>>,
}

/// Cancels the context it was derived from.
#[derive(Clone)]
pub struct CancelHandle(Arc<CancelToken>);

impl CancelHandle {
    pub fn cancel(&self, cause: impl Into<String>) {
        let mut slot = self.0.cause.lock().unwrap();
        if slot.is_none() {
            *slot = Some(cause.into());
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// The root context: never cancelled, no progress, no span.
    pub fn background() -> Self {
        Context {
            cancel: CancelState::Never,
            deadline: None,
            progress: None,
            span: Span::none(),
            cache_opts: None,
        }
    }

    /// Derives a context that can be cancelled through the returned handle.
    pub fn with_cancel(&self) -> (Context, CancelHandle) {
        let token = Arc::new(CancelToken {
            parent: Box::new(self.clone()),
            cause: Mutex::new(None),
        });
        let ctx = Context {
            cancel: CancelState::Token(token.clone()),
            ..self.clone()
        };
        (ctx, CancelHandle(token))
    }

    /// Derives a context cancelled after `timeout`, keeping any earlier
    /// deadline.
    pub fn with_timeout(&self, timeout: Duration) -> Context {
        let deadline = Instant::now() + timeout;
        Context {
            deadline: Some(self.deadline.map_or(deadline, |d| d.min(deadline))),
            ..self.clone()
        }
    }

    /// A context that is cancelled only once every caller in `callers` has
    /// cancelled. The list may grow while the context is live.
    pub(crate) fn joined(callers: Arc<Mutex<Vec<Context>>>) -> Context {
        Context {
            cancel: CancelState::Joined(callers),
            deadline: None,
            progress: None,
            span: Span::none(),
            cache_opts: None,
        }
    }

    pub fn cancelled(&self) -> bool {
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return true;
        }
        match &self.cancel {
            CancelState::Never => false,
            CancelState::Token(token) => {
                token.cause.lock().unwrap().is_some() || token.parent.cancelled()
            }
            CancelState::Joined(callers) => {
                let callers = callers.lock().unwrap();
                !callers.is_empty() && callers.iter().all(Context::cancelled)
            }
        }
    }

    /// The cancellation cause, if any.
    pub fn cause(&self) -> Option<String> {
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Some("context deadline exceeded".to_string());
        }
        match &self.cancel {
            CancelState::Never => None,
            CancelState::Token(token) => token
                .cause
                .lock()
                .unwrap()
                .clone()
                .or_else(|| token.parent.cause()),
            CancelState::Joined(callers) => {
                let callers = callers.lock().unwrap();
                if !callers.is_empty() && callers.iter().all(Context::cancelled) {
                    callers.iter().find_map(Context::cause)
                } else {
                    None
                }
            }
        }
    }

    /// The cancellation error for this context.
    pub fn err(&self) -> anyhow::Error {
        anyhow::Error::new(Cancelled::new(
            self.cause().unwrap_or_else(|| "context cancelled".to_string()),
        ))
    }

    pub fn with_progress(&self, writer: Writer) -> Context {
        Context {
            progress: Some(writer),
            ..self.clone()
        }
    }

    pub fn progress(&self) -> Option<&Writer> {
        self.progress.as_ref()
    }

    pub fn with_span(&self, span: Span) -> Context {
        Context {
            span,
            ..self.clone()
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub(crate) fn with_cache_opts(&self, opts: Arc<Vec<CacheOpts>>) -> Context {
        Context {
            cache_opts: Some(opts),
            ..self.clone()
        }
    }

    /// Cache options of this vertex and its ancestors, nearest first. Remote
    /// cache providers consult these during `records` queries.
    pub fn ancestor_cache_opts(&self) -> &[CacheOpts] {
        self.cache_opts.as_deref().map_or(&[], Vec::as_slice)
    }
}
