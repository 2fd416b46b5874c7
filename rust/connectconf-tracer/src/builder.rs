//! Accumulates the events of one operation into a [`Trace`].

use std::sync::Arc;
use std::time::Instant;

use http::{HeaderMap, Version};
use parking_lot::Mutex;

use crate::trace::{Event, EventKind, RequestInfo, Trace, TraceError};

/// Receives completed traces.
pub trait Collector: Send + Sync {
    fn complete(&self, trace: Trace);
}

impl<F> Collector for F
where
    F: Fn(Trace) + Send + Sync,
{
    fn complete(&self, trace: Trace) {
        self(trace)
    }
}

/// Which half of the operation a body belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

/// Builds the trace of one HTTP operation.
///
/// The first event is always `RequestStart`. The trace is handed to the
/// collector exactly once: when a terminal event arrives, or on
/// [`Builder::build`]. Anything added afterwards is ignored, as is
/// everything for a request without a test case name.
pub struct Builder {
    collector: Arc<dyn Collector>,
    start: Instant,
    client: bool,
    state: Mutex<State>,
}

struct State {
    trace: Option<Trace>,
    req_count: usize,
    resp_count: usize,
}

impl Builder {
    pub fn new(request: RequestInfo, client: bool, collector: Arc<dyn Collector>) -> Arc<Self> {
        let test_name = request.test_name();
        let trace = (!test_name.is_empty()).then(|| Trace {
            test_name,
            request: request.clone(),
            response: None,
            err: None,
            events: vec![Event {
                offset: Default::default(),
                kind: EventKind::RequestStart(request),
            }],
        });
        Arc::new(Builder {
            collector,
            start: Instant::now(),
            client,
            state: Mutex::new(State {
                trace,
                req_count: 0,
                resp_count: 0,
            }),
        })
    }

    pub fn is_client(&self) -> bool {
        self.client
    }

    pub fn add(&self, mut kind: EventKind) {
        let finished = {
            let mut state = self.state.lock();
            let State {
                trace,
                req_count,
                resp_count,
            } = &mut *state;
            let Some(t) = trace.as_mut() else {
                return;
            };
            let mut finish = false;
            match &mut kind {
                EventKind::RequestBodyData { message_index, .. } => {
                    *message_index = *req_count;
                    *req_count += 1;
                }
                EventKind::RequestBodyEnd { err } => {
                    if t.err.is_none() {
                        t.err = err.clone();
                    }
                    // a failed request body fails the whole operation
                    finish = err.is_some();
                }
                EventKind::ResponseStart(resp) => {
                    if self.client {
                        // the client only learns the negotiated version here
                        t.request.version = resp.version;
                    }
                    t.response = Some(resp.clone());
                }
                EventKind::ResponseError { err } => {
                    if self.client && matches!(err, TraceError::Stream { .. }) {
                        t.request.version = Version::HTTP_2;
                    }
                    t.err = Some(err.clone());
                    finish = true;
                }
                EventKind::ResponseBodyData { message_index, .. } => {
                    *message_index = *resp_count;
                    *resp_count += 1;
                }
                EventKind::ResponseBodyEnd { err } => {
                    if t.err.is_none() {
                        t.err = err.clone();
                    }
                    finish = true;
                }
                EventKind::RequestCanceled => {
                    if t.err.is_none() {
                        t.err = Some(TraceError::Canceled);
                    }
                    finish = true;
                }
                EventKind::RequestStart(_) | EventKind::ResponseBodyEndStream { .. } => {}
            }
            t.events.push(Event {
                offset: self.start.elapsed(),
                kind,
            });
            if finish { trace.take() } else { None }
        };
        // never call into the collector with the lock held
        if let Some(trace) = finished {
            self.collector.complete(trace);
        }
    }

    /// Attach trailers to the request or the response.
    pub fn set_trailers(&self, direction: Direction, trailers: HeaderMap) {
        let mut state = self.state.lock();
        let Some(t) = state.trace.as_mut() else {
            return;
        };
        match direction {
            Direction::Request => t.request.trailers = trailers,
            Direction::Response => {
                if let Some(resp) = t.response.as_mut() {
                    resp.trailers = trailers;
                }
            }
        }
    }

    /// Deliver the trace now, complete or not.
    pub fn build(&self) {
        let trace = self.state.lock().trace.take();
        if let Some(trace) = trace {
            self.collector.complete(trace);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::ResponseInfo;
    use connectconf_wire::envelope::Envelope;
    use http::{Request, Response};

    fn collecting() -> (Arc<dyn Collector>, Arc<Mutex<Vec<Trace>>>) {
        let traces = Arc::new(Mutex::new(Vec::new()));
        let sink = traces.clone();
        (Arc::new(move |t: Trace| sink.lock().push(t)), traces)
    }

    fn request(name: &str) -> RequestInfo {
        let mut req = Request::post("http://localhost/svc/Method");
        if !name.is_empty() {
            req = req.header("x-test-case-name", name);
        }
        RequestInfo::from_request(&req.body(()).unwrap())
    }

    fn data(direction: Direction) -> EventKind {
        let envelope = Some(Envelope { flags: 0, len: 1 });
        match direction {
            Direction::Request => EventKind::RequestBodyData {
                envelope,
                len: 1,
                message_index: 99,
            },
            Direction::Response => EventKind::ResponseBodyData {
                envelope,
                len: 1,
                message_index: 99,
            },
        }
    }

    #[test]
    fn indexes_per_direction_and_finishes_once() {
        let (collector, traces) = collecting();
        let b = Builder::new(request("one"), true, collector);
        b.add(data(Direction::Request));
        b.add(data(Direction::Request));
        b.add(EventKind::RequestBodyEnd { err: None });
        let resp = Response::builder()
            .version(Version::HTTP_2)
            .body(())
            .unwrap();
        b.add(EventKind::ResponseStart(ResponseInfo::from_response(&resp)));
        b.add(data(Direction::Response));
        b.add(EventKind::ResponseBodyEnd { err: None });
        b.add(data(Direction::Response));
        b.build();

        let traces = traces.lock();
        assert_eq!(traces.len(), 1);
        let t = &traces[0];
        assert_eq!(t.test_name, "one");
        assert_eq!(t.request.version, Version::HTTP_2);
        assert!(t.err.is_none());
        let indexes: Vec<_> = t
            .events
            .iter()
            .filter_map(|ev| match ev.kind {
                EventKind::RequestBodyData { message_index, .. } => Some(("req", message_index)),
                EventKind::ResponseBodyData { message_index, .. } => Some(("resp", message_index)),
                _ => None,
            })
            .collect();
        assert_eq!(indexes, [("req", 0), ("req", 1), ("resp", 0)]);
        assert!(matches!(t.events[0].kind, EventKind::RequestStart(_)));
        assert!(matches!(
            t.events.last().unwrap().kind,
            EventKind::ResponseBodyEnd { err: None }
        ));
        let offsets: Vec<_> = t.events.iter().map(|ev| ev.offset).collect();
        assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn cancel_sets_error_and_finishes() {
        let (collector, traces) = collecting();
        let b = Builder::new(request("cancel"), true, collector);
        b.add(EventKind::RequestCanceled);
        b.add(EventKind::ResponseBodyEnd {
            err: Some(TraceError::other("late")),
        });
        let traces = traces.lock();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].err, Some(TraceError::Canceled));
        assert_eq!(traces[0].events.len(), 2);
    }

    #[test]
    fn request_body_error_finishes() {
        let (collector, traces) = collecting();
        let b = Builder::new(request("req-err"), false, collector);
        b.add(EventKind::RequestBodyEnd {
            err: Some(TraceError::ClosedEarly),
        });
        assert_eq!(traces.lock()[0].err, Some(TraceError::ClosedEarly));
    }

    #[test]
    fn unnamed_requests_are_not_traced() {
        let (collector, traces) = collecting();
        let b = Builder::new(request(""), true, collector);
        b.add(EventKind::RequestCanceled);
        b.build();
        assert!(traces.lock().is_empty());
    }
}
