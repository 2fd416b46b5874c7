//! The conformance service: echoes what it received and responds the way
//! each request's response definition says.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use http::header::{DATE, HeaderValue, SERVER};
use http::Request;

use connectconf_proto::{
    Any, BidiStreamRequest, BidiStreamResponse, CONFORMANCE_SERVICE, ClientStreamRequest,
    ClientStreamResponse, Code, ConformancePayload, ConnectGetInfo, Error, Header,
    IdempotentUnaryRequest, IdempotentUnaryResponse, Message, Protocol, RawHttpResponse,
    RequestInfo, ServerStreamRequest, ServerStreamResponse, StreamResponseDefinition,
    UnaryOutcome, UnaryRequest, UnaryResponse, UnaryResponseDefinition,
};
use connectconf_rpc::{RpcError, ServerCall};
use connectconf_wire::headers::{add_headers, query_to_proto_headers, to_proto_headers};
use connectconf_wire::http::{Body, Handler, ResponseWriter};

use crate::raw_response::{RawResponseSlot, grpc_error_response};

/// Value of the `Server` header on every response.
pub const SERVER_NAME: &str = concat!(
    "connectconformance-referenceserver/",
    env!("CARGO_PKG_VERSION")
);

pub struct ConformanceService {
    read_max_bytes: u32,
}

impl ConformanceService {
    /// Request messages above `read_max_bytes` fail with
    /// `resource_exhausted`. Zero means no limit.
    pub fn new(read_max_bytes: u32) -> Self {
        ConformanceService { read_max_bytes }
    }
}

/// Current time in the IMF-fixdate form HTTP uses.
fn http_date() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

impl Handler for ConformanceService {
    fn serve<'a>(&'a self, req: Request<Body>, w: &'a mut dyn ResponseWriter) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let slot = req.extensions().get::<Arc<RawResponseSlot>>().cloned();
            let headers = w.headers_mut();
            headers.insert(SERVER, HeaderValue::from_static(SERVER_NAME));
            if let Ok(date) = HeaderValue::from_str(&http_date()) {
                headers.insert(DATE, date);
            }
            let call = match ServerCall::new(req, w, self.read_max_bytes) {
                Ok(call) => call,
                Err(err) => {
                    tracing::debug!(%err, "rejected request");
                    return;
                }
            };
            let mut rpc = Rpc {
                call,
                slot,
                started: Instant::now(),
                raw_error: None,
            };
            let result = rpc.dispatch().await;
            if let Some(raw) = rpc.raw_error.take()
                && let Some(slot) = &rpc.slot
            {
                slot.set(raw);
                return;
            }
            rpc.call.finish(result);
        })
    }
}

/// One call being served.
struct Rpc<'a> {
    call: ServerCall<'a>,
    slot: Option<Arc<RawResponseSlot>>,
    started: Instant,
    /// Set when an error must go out with explicit header and trailer
    /// placement.
    raw_error: Option<RawHttpResponse>,
}

/// Request messages answered with a single response.
trait UnaryLike: Message {
    fn definition(&self) -> Option<&UnaryResponseDefinition>;
}

impl UnaryLike for UnaryRequest {
    fn definition(&self) -> Option<&UnaryResponseDefinition> {
        self.response_definition.as_ref()
    }
}

impl UnaryLike for IdempotentUnaryRequest {
    fn definition(&self) -> Option<&UnaryResponseDefinition> {
        self.response_definition.as_ref()
    }
}

impl UnaryLike for ClientStreamRequest {
    fn definition(&self) -> Option<&UnaryResponseDefinition> {
        self.response_definition.as_ref()
    }
}

trait FromPayload {
    fn from_payload(payload: ConformancePayload) -> Self;
}

macro_rules! impl_from_payload {
    ($($ty:ty),* $(,)?) => {
        $(impl FromPayload for $ty {
            fn from_payload(payload: ConformancePayload) -> Self {
                Self { payload: Some(payload) }
            }
        })*
    };
}

impl_from_payload!(
    UnaryResponse,
    IdempotentUnaryResponse,
    ClientStreamResponse,
    ServerStreamResponse,
    BidiStreamResponse,
);

fn as_any<M: Message>(msg: &M) -> Result<Any, RpcError> {
    Any::pack(msg).map_err(|err| RpcError::internal(format!("unable to convert message: {err}")))
}

fn to_rpc_error(err: &Error) -> RpcError {
    RpcError::new(err.code, err.message.clone().unwrap_or_default()).with_details(err.details.clone())
}

async fn delay(ms: u32) {
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(u64::from(ms))).await;
    }
}

impl Rpc<'_> {
    async fn dispatch(&mut self) -> Result<(), RpcError> {
        let procedure = self.call.procedure().to_string();
        let Some(method) = procedure
            .strip_prefix('/')
            .and_then(|p| p.strip_prefix(CONFORMANCE_SERVICE))
            .and_then(|p| p.strip_prefix('/'))
        else {
            return Err(RpcError::new(
                Code::Unimplemented,
                format!("{procedure} is not implemented"),
            ));
        };
        match method {
            "Unary" => self.unary::<UnaryRequest, UnaryResponse>().await,
            "IdempotentUnary" => {
                self.unary::<IdempotentUnaryRequest, IdempotentUnaryResponse>()
                    .await
            }
            "ServerStream" => self.server_stream().await,
            "ClientStream" => self.client_stream().await,
            "BidiStream" => self.bidi_stream().await,
            other => Err(RpcError::new(
                Code::Unimplemented,
                format!("{CONFORMANCE_SERVICE}.{other} is not implemented"),
            )),
        }
    }

    /// What the call looked like on arrival, for echoing back.
    fn request_info(&self, requests: Vec<Any>) -> RequestInfo {
        let timeout_ms = self.call.timeout().map(|timeout| {
            let left = timeout.saturating_sub(self.started.elapsed());
            left.as_millis() as i64
        });
        let connect_get_info = self.call.get_query().map(|query| ConnectGetInfo {
            query_params: query_to_proto_headers(query),
        });
        RequestInfo {
            request_headers: to_proto_headers(self.call.request_headers()),
            timeout_ms,
            requests,
            connect_get_info,
        }
    }

    fn add_metadata(&mut self, headers: &[Header], trailers: &[Header]) -> Result<(), RpcError> {
        add_headers(headers, &mut self.call.response_headers)
            .and_then(|()| add_headers(trailers, &mut self.call.response_trailers))
            .map_err(|err| RpcError::new(Code::InvalidArgument, err.to_string()))
    }

    /// Park `raw` for the raw responder and abort the call.
    fn use_raw(&self, raw: &RawHttpResponse) -> RpcError {
        match &self.slot {
            Some(slot) => {
                slot.set(raw.clone());
                RpcError::new(Code::Aborted, "use raw response instead")
            }
            None => RpcError::internal(
                "request contains raw response definition but no raw response holder",
            ),
        }
    }

    /// Read and discard the rest of the request stream.
    async fn drain<T: Message>(&mut self) {
        while let Ok(Some(_)) = self.call.receive::<T>().await {}
    }

    async fn first<T: Message>(&mut self) -> Result<T, RpcError> {
        self.call
            .receive()
            .await?
            .ok_or_else(|| RpcError::new(Code::InvalidArgument, "missing request message"))
    }

    /// The outcome shared by unary and client-stream calls.
    async fn respond_unary<Resp: Message + FromPayload>(
        &mut self,
        def: Option<UnaryResponseDefinition>,
        requests: Vec<Any>,
    ) -> Result<(), RpcError> {
        let info = self.request_info(requests);
        let Some(def) = def else {
            return self.call.send(&Resp::from_payload(ConformancePayload {
                data: Vec::new(),
                request_info: Some(info),
            }));
        };
        self.add_metadata(&def.response_headers, &def.response_trailers)?;
        match def.response {
            Some(UnaryOutcome::Error(err)) => {
                let mut err = to_rpc_error(&err);
                err.details.push(as_any(&info)?);
                self.error_with_placement(err, !def.response_headers.is_empty())
            }
            outcome => {
                let data = match outcome {
                    Some(UnaryOutcome::ResponseData(data)) => data,
                    _ => Vec::new(),
                };
                delay(def.response_delay_ms).await;
                self.call.send(&Resp::from_payload(ConformancePayload {
                    data,
                    request_info: Some(info),
                }))
            }
        }
    }

    /// gRPC errors that come with explicit response headers go out as a
    /// raw response, so the headers are not folded into a trailers-only
    /// response.
    fn error_with_placement(&mut self, err: RpcError, has_headers: bool) -> Result<(), RpcError> {
        let wire = self.call.wire();
        let grpc = matches!(wire.protocol, Protocol::Grpc | Protocol::GrpcWeb);
        if grpc && has_headers && !self.call.has_written() && self.slot.is_some() {
            self.raw_error = Some(grpc_error_response(
                wire.protocol,
                wire.codec,
                &err,
                &self.call.response_headers,
                &self.call.response_trailers,
            ));
        }
        Err(err)
    }

    async fn unary<Req, Resp>(&mut self) -> Result<(), RpcError>
    where
        Req: UnaryLike,
        Resp: Message + FromPayload,
    {
        let req: Req = self.first().await?;
        if let Some(raw) = req.definition().and_then(|d| d.raw_response.as_ref()) {
            return Err(self.use_raw(raw));
        }
        let requests = vec![as_any(&req)?];
        let def = req.definition().cloned();
        self.respond_unary::<Resp>(def, requests).await
    }

    async fn client_stream(&mut self) -> Result<(), RpcError> {
        let mut def = None;
        let mut requests = Vec::new();
        let mut first = true;
        while let Some(req) = self.call.receive::<ClientStreamRequest>().await? {
            if first {
                first = false;
                if let Some(raw) = req.definition().and_then(|d| d.raw_response.as_ref()) {
                    let err = self.use_raw(raw);
                    self.drain::<ClientStreamRequest>().await;
                    return Err(err);
                }
                def = req.response_definition.clone();
            }
            requests.push(as_any(&req)?);
        }
        self.respond_unary::<ClientStreamResponse>(def, requests).await
    }

    async fn server_stream(&mut self) -> Result<(), RpcError> {
        let req: ServerStreamRequest = self.first().await?;
        let Some(def) = req.response_definition.clone() else {
            return Ok(());
        };
        if let Some(raw) = &def.raw_response {
            return Err(self.use_raw(raw));
        }
        let requests = vec![as_any(&req)?];
        self.add_metadata(&def.response_headers, &def.response_trailers)?;
        self.call.send_headers();

        let mut sent = 0;
        for data in &def.response_data {
            // request info only changes for the first response
            let request_info = (sent == 0).then(|| self.request_info(requests.clone()));
            delay(def.response_delay_ms).await;
            self.call.send(&ServerStreamResponse::from_payload(ConformancePayload {
                data: data.clone(),
                request_info,
            }))?;
            sent += 1;
        }
        self.stream_error(&def, sent, requests)
    }

    async fn bidi_stream(&mut self) -> Result<(), RpcError> {
        let mut def: Option<StreamResponseDefinition> = None;
        let mut full_duplex = false;
        let mut first = true;
        let mut sent = 0;
        let mut requests = Vec::new();

        while let Some(req) = self.call.receive::<BidiStreamRequest>().await? {
            requests.push(as_any(&req)?);
            if first {
                first = false;
                full_duplex = req.full_duplex;
                def = req.response_definition.clone();
                if let Some(d) = &def {
                    if let Some(raw) = &d.raw_response {
                        let err = self.use_raw(raw);
                        self.drain::<BidiStreamRequest>().await;
                        return Err(err);
                    }
                    self.add_metadata(&d.response_headers, &d.response_trailers)?;
                    self.call.send_headers();
                }
            }
            if !full_duplex {
                continue;
            }
            let Some(d) = &def else {
                break;
            };
            let Some(data) = d.response_data.get(sent).cloned() else {
                break;
            };
            let request_info = if sent == 0 {
                self.request_info(std::mem::take(&mut requests))
            } else {
                RequestInfo {
                    requests: std::mem::take(&mut requests),
                    ..Default::default()
                }
            };
            delay(d.response_delay_ms).await;
            self.call.send(&BidiStreamResponse::from_payload(ConformancePayload {
                data,
                request_info: Some(request_info),
            }))?;
            sent += 1;
        }

        let Some(def) = def else {
            return Ok(());
        };
        // half duplex, or more responses than requests
        while let Some(data) = def.response_data.get(sent).cloned() {
            let request_info = (sent == 0).then(|| self.request_info(requests.clone()));
            delay(def.response_delay_ms).await;
            self.call.send(&BidiStreamResponse::from_payload(ConformancePayload {
                data,
                request_info,
            }))?;
            sent += 1;
        }
        self.stream_error(&def, sent, requests)
    }

    /// The error a stream definition ends with. With no responses sent, the
    /// request info travels in the error details instead.
    fn stream_error(
        &mut self,
        def: &StreamResponseDefinition,
        sent: usize,
        requests: Vec<Any>,
    ) -> Result<(), RpcError> {
        let Some(err) = &def.error else {
            return Ok(());
        };
        let mut err = to_rpc_error(err);
        if sent == 0 {
            err.details.push(as_any(&self.request_info(requests))?);
        }
        Err(err)
    }
}
