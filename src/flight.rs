use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::context::Context;
use crate::error::SharedError;

/// How often a waiting joiner re-checks its own context for cancellation.
const JOIN_POLL: Duration = Duration::from_millis(50);

/// A single-flight group: for any key, at most one execution is in flight at
/// a time and every concurrent caller receives the same result.
///
/// The first caller for a key becomes the leader and runs the closure on its
/// own thread, under a joined context that is cancelled only once *every*
/// caller (leader included) has cancelled. Joiners block until the leader
/// finishes; a joiner whose own context is cancelled detaches early without
/// disturbing the computation.
///
/// Results are not memoised here. Once the leader finishes, the key is
/// vacated; callers that arrive later start a fresh flight. Persistent
/// memoisation is the caller's concern.
pub(crate) struct Group<T: Clone> {
    calls: Mutex<HashMap<String, Arc<Call<T>>>>,
}

struct Call<T> {
    callers: Arc<Mutex<Vec<Context>>>,
    slot: Mutex<Option<Result<T, SharedError>>>,
    cond: Condvar,
}

impl<T: Clone> Default for Group<T> {
    fn default() -> Self {
        Group {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> Group<T> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn do_call(
        &self,
        ctx: &Context,
        key: &str,
        f: impl FnOnce(&Context) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let (call, leader) = {
            let mut calls = self.calls.lock().unwrap();
            match calls.get(key) {
                Some(call) => {
                    call.callers.lock().unwrap().push(ctx.clone());
                    (call.clone(), false)
                }
                None => {
                    let call = Arc::new(Call {
                        callers: Arc::new(Mutex::new(vec![ctx.clone()])),
                        slot: Mutex::new(None),
                        cond: Condvar::new(),
                    });
                    calls.insert(key.to_string(), call.clone());
                    (call, true)
                }
            }
        };

        if leader {
            let fctx = Context::joined(call.callers.clone());
            let res = f(&fctx).map_err(SharedError::new);

            *call.slot.lock().unwrap() = Some(res.clone());
            call.cond.notify_all();
            self.calls.lock().unwrap().remove(key);

            res.map_err(Into::into)
        } else {
            let mut slot = call.slot.lock().unwrap();
            loop {
                if let Some(res) = slot.as_ref() {
                    return res.clone().map_err(Into::into);
                }
                if ctx.cancelled() {
                    // Detach. The cancelled context stays in the caller
                    // list, where it no longer counts against the joined
                    // cancellation.
                    return Err(ctx.err());
                }
                slot = call.cond.wait_timeout(slot, JOIN_POLL).unwrap().0;
            }
        }
    }
}
