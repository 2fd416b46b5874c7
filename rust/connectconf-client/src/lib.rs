#![forbid(unsafe_op_in_unsafe_fn)]

//! Reference conformance client.
//!
//! Reads [`ClientCompatRequest`] directives, runs each one against the server
//! under test with bounded parallelism, and writes a [`ClientCompatResponse`]
//! per directive. In reference mode every result also carries the HTTP status
//! code and feedback about protocol violations seen on the wire.

use std::sync::{Arc, OnceLock};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

use connectconf_proto::{
    ClientCompatRequest, ClientCompatResponse, ClientCompatResult, ClientErrorResult,
};
use connectconf_wire::{CodecError, Printer, RecordFormat, RecordReader, RecordWriter};

pub mod invoke;
pub mod raw_request;
pub mod transports;
pub mod wire_details;

pub use invoke::{Invoker, SetupError};

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("invalid parallelism; must be greater than zero")]
    InvalidParallelism,

    #[error(transparent)]
    Codec(#[from] CodecError),
}

pub struct RunOptions {
    pub format: RecordFormat,
    pub parallelism: usize,
    /// Attach HTTP status codes and wire feedback to results.
    pub reference_mode: bool,
    /// Where feedback is echoed as it is produced, prefixed by test name.
    pub feedback: Option<Arc<dyn Printer>>,
}

impl RunOptions {
    pub fn new(format: RecordFormat) -> Self {
        RunOptions {
            format,
            parallelism: default_parallelism(),
            reference_mode: true,
            feedback: None,
        }
    }
}

/// Four calls in flight per CPU.
pub fn default_parallelism() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get()) * 4
}

/// Run every directive read from `input`, writing one result per directive
/// to `output` in completion order.
///
/// Errors from a single directive become error results. Only failures to
/// read or write records end the run; once a write fails no new directives
/// are started.
pub async fn run<R, W>(input: R, output: W, opts: RunOptions) -> Result<(), RunError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    if opts.parallelism == 0 {
        return Err(RunError::InvalidParallelism);
    }
    let mut reader = RecordReader::new(input, opts.format, "client input");
    let writer = Arc::new(Mutex::new(RecordWriter::new(output, opts.format)));
    let invoker = Arc::new(Invoker::new(opts.reference_mode));
    let semaphore = Arc::new(Semaphore::new(opts.parallelism));
    let failure: Arc<OnceLock<CodecError>> = Arc::new(OnceLock::new());
    let mut tasks = JoinSet::new();

    let read_result = loop {
        let req: ClientCompatRequest = match reader.next().await {
            Ok(Some(req)) => req,
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        };
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break Ok(());
        };
        if failure.get().is_some() {
            break Ok(());
        }
        tracing::debug!(test = %req.test_name, method = %req.method, "starting directive");

        let invoker = invoker.clone();
        let writer = writer.clone();
        let failure = failure.clone();
        let feedback = opts.feedback.clone();
        tasks.spawn(async move {
            let _permit = permit;
            let result = match invoker.invoke(&req).await {
                Ok(result) => {
                    if let Some(p) = &feedback {
                        for line in &result.feedback {
                            p.prefix_printf(&req.test_name, format_args!("{line}"));
                        }
                    }
                    ClientCompatResult::Response(result)
                }
                Err(err) => {
                    tracing::debug!(test = %req.test_name, %err, "directive could not run");
                    ClientCompatResult::Error(ClientErrorResult {
                        message: err.to_string(),
                    })
                }
            };
            let resp = ClientCompatResponse {
                test_name: req.test_name,
                result,
            };
            if let Err(err) = writer.lock().await.write(&resp).await {
                let _ = failure.set(err);
            }
        });
        while tasks.try_join_next().is_some() {}
    };

    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            tracing::error!(%err, "directive task failed");
        }
    }
    read_result?;
    match Arc::try_unwrap(failure).ok().and_then(OnceLock::into_inner) {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connectconf_proto::{Codec, HttpVersion, Protocol};
    use tokio::io::AsyncReadExt;

    async fn run_json(input: Vec<u8>, parallelism: usize) -> (Result<(), RunError>, Vec<u8>) {
        let (out, mut sink) = tokio::io::duplex(64 * 1024);
        let mut opts = RunOptions::new(RecordFormat::Json);
        opts.parallelism = parallelism;
        opts.reference_mode = false;
        let result = run(input.as_slice(), out, opts).await;
        let mut buf = Vec::new();
        sink.read_to_end(&mut buf).await.unwrap();
        (result, buf)
    }

    #[tokio::test]
    async fn empty_input_writes_nothing() {
        let (result, out) = run_json(Vec::new(), 2).await;
        result.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn zero_parallelism_is_rejected() {
        let (result, _) = run_json(Vec::new(), 0).await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("must be greater than zero"), "{err}");
    }

    #[tokio::test]
    async fn setup_failures_become_error_results() {
        let mut input = Vec::new();
        for (name, version) in [("a", HttpVersion::Unspecified), ("b", HttpVersion::Unspecified)] {
            let req = ClientCompatRequest {
                test_name: name.into(),
                http_version: version,
                protocol: Protocol::Connect,
                codec: Codec::Proto,
                host: "127.0.0.1".into(),
                port: 1,
                ..Default::default()
            };
            input.extend(serde_json::to_vec(&req).unwrap());
            input.push(b'\n');
        }
        let (result, out) = run_json(input, 1).await;
        result.unwrap();

        let mut names = Vec::new();
        for resp in serde_json::Deserializer::from_slice(&out).into_iter::<ClientCompatResponse>() {
            let resp = resp.unwrap();
            match resp.result {
                ClientCompatResult::Error(err) => {
                    assert_eq!(err.message, "an HTTP version must be specified")
                }
                other => panic!("unexpected result {other:?}"),
            }
            names.push(resp.test_name);
        }
        names.sort();
        assert_eq!(names, ["a", "b"]);
    }
}
