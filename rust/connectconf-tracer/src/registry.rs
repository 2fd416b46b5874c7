//! Hands completed traces from the tracing middleware to whoever awaits them.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::builder::Collector;
use crate::trace::Trace;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("{name}: trace already cleared")]
    Cleared { name: String },

    #[error("{name}: timed out waiting for trace")]
    Timeout { name: String },
}

/// Per-test-name slots for traces.
///
/// A consumer calls [`init`](Self::init) before the operation starts,
/// [`await_trace`](Self::await_trace) to get the result and
/// [`clear`](Self::clear) when done. Producers call
/// [`complete`](Collector::complete); only the first completion of a slot
/// is kept, and completions without a slot are dropped.
#[derive(Default)]
pub struct TraceRegistry {
    slots: Mutex<HashMap<String, watch::Sender<Option<Trace>>>>,
}

impl TraceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init(&self, name: &str) {
        let (tx, _) = watch::channel(None);
        self.slots.lock().insert(name.to_string(), tx);
    }

    pub fn clear(&self, name: &str) {
        self.slots.lock().remove(name);
    }

    /// Wait up to `timeout` for the trace of `name`.
    pub async fn await_trace(&self, name: &str, timeout: Duration) -> Result<Trace, RegistryError> {
        let rx = self.slots.lock().get(name).map(watch::Sender::subscribe);
        let cleared = || RegistryError::Cleared {
            name: name.to_string(),
        };
        let mut rx = rx.ok_or_else(cleared)?;
        let waited = tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await;
        match waited {
            Ok(Ok(trace)) => trace.clone().ok_or_else(cleared),
            // the slot was cleared while waiting
            Ok(Err(_)) => Err(cleared()),
            Err(_) => Err(RegistryError::Timeout {
                name: name.to_string(),
            }),
        }
    }
}

impl Collector for TraceRegistry {
    fn complete(&self, trace: Trace) {
        let slots = self.slots.lock();
        let Some(tx) = slots.get(&trace.test_name) else {
            tracing::trace!(test_name = %trace.test_name, "dropping trace without a slot");
            return;
        };
        tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(trace);
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{Event, EventKind, RequestInfo};
    use std::sync::Arc;

    fn trace(name: &str, events: usize) -> Trace {
        let req = http::Request::get("/")
            .header("x-test-case-name", name)
            .body(())
            .unwrap();
        let request = RequestInfo::from_request(&req);
        Trace {
            test_name: name.to_string(),
            request: request.clone(),
            response: None,
            err: None,
            events: (0..events)
                .map(|_| Event {
                    offset: Duration::ZERO,
                    kind: EventKind::RequestStart(request.clone()),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn complete_then_await() {
        let reg = TraceRegistry::new();
        reg.init("a");
        reg.complete(trace("a", 1));
        reg.complete(trace("a", 2));
        let got = reg.await_trace("a", Duration::from_secs(1)).await.unwrap();
        assert_eq!(got.events.len(), 1);
        // awaiting again returns the same trace
        let again = reg.await_trace("a", Duration::from_secs(1)).await.unwrap();
        assert_eq!(again.events.len(), 1);
    }

    #[tokio::test]
    async fn await_blocks_until_complete() {
        let reg = Arc::new(TraceRegistry::new());
        reg.init("b");
        let waiter = {
            let reg = reg.clone();
            tokio::spawn(async move { reg.await_trace("b", Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        reg.complete(trace("b", 3));
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.events.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn await_times_out() {
        let reg = TraceRegistry::new();
        reg.init("slow");
        let err = reg
            .await_trace("slow", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "slow: timed out waiting for trace");
    }

    #[tokio::test]
    async fn cleared_and_unknown_slots() {
        let reg = TraceRegistry::new();
        let err = reg
            .await_trace("never", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "never: trace already cleared");

        reg.init("c");
        reg.clear("c");
        reg.clear("c");
        reg.complete(trace("c", 1));
        assert!(reg.await_trace("c", Duration::from_secs(1)).await.is_err());
    }
}
