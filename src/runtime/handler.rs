//! Request handling for a fully buffered client connection.
//!
//! Wire format, both directions netstring-framed:
//!
//! ```text
//! Request:  <headers JSON> <body chunk>* <empty>
//! Response: <status> <headers JSON> <body chunk>* <empty>
//!       or: <error payload JSON>
//! ```
//!
//! The response is encoded completely before anything is written, so a
//! failure at any stage replaces the whole response with the single error
//! frame. Clients never see a partial status/header sequence.

use crate::app::{env, AppError, Application, Body, Env, Request, Response};
use crate::error::{Error, Result};
use crate::netstring;
use bytes::{Bytes, BytesMut};
use serde_json::{json, Value};
use std::any::Any;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, warn};

/// Values of the `HTTPS` header that mean TLS was terminated upstream.
const HTTPS_ON: [&str; 3] = ["yes", "on", "1"];

/// Handle one request and return the bytes to send back.
///
/// Never fails: errors become an encoded error payload.
pub fn handle(input: &[u8], app: &mut dyn Application, max_response_bytes: usize) -> Bytes {
    match respond(input, app, max_response_bytes) {
        Ok(out) => out,
        Err(err) => {
            warn!(error = %err, name = err.name(), "Request failed");
            encode_error(&err)
        }
    }
}

fn respond(input: &[u8], app: &mut dyn Application, max_response_bytes: usize) -> Result<Bytes> {
    let request = decode_request(input)?;
    let method = request.method().unwrap_or("-").to_string();
    let path = request.path().to_string();
    let scheme = request.url_scheme().to_string();

    // Lazy bodies run application code too, so encoding shares the boundary.
    catch_panic(move || {
        let response = app.call(request)?;
        debug!(%method, %path, %scheme, status = response.status, "Dispatched request");
        encode_response(response, max_response_bytes)
    })
}

/// Decode the netstring sequence into a request with the worker's
/// environment fields added.
pub fn decode_request(input: &[u8]) -> Result<Request> {
    let mut env: Option<Env> = None;
    let mut body = Vec::new();
    let mut failure = None;

    let mut source = input;
    netstring::decode_sequence(&mut source, |frame| {
        if env.is_none() {
            match parse_headers(&frame) {
                Ok(headers) => env = Some(headers),
                Err(e) => {
                    failure = Some(e);
                    return ControlFlow::Break(());
                }
            }
        } else if !frame.is_empty() {
            body.extend_from_slice(&frame);
        } else {
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    })?;

    if let Some(err) = failure {
        return Err(err);
    }
    let mut env = env.ok_or(Error::MissingHeaders)?;
    add_runtime_fields(&mut env);

    Ok(Request::new(env, body))
}

fn parse_headers(frame: &[u8]) -> Result<Env> {
    match serde_json::from_slice(frame).map_err(Error::InvalidHeaders)? {
        Value::Object(map) => Ok(map),
        _ => Err(Error::HeadersNotObject),
    }
}

fn add_runtime_fields(env: &mut Env) {
    let https = env
        .get("HTTPS")
        .and_then(Value::as_str)
        .is_some_and(|v| HTTPS_ON.contains(&v));

    env.insert(env::VERSION.into(), json!(env::PROTOCOL_VERSION));
    env.insert(env::MULTITHREAD.into(), Value::Bool(false));
    env.insert(env::MULTIPROCESS.into(), Value::Bool(true));
    env.insert(env::RUN_ONCE.into(), Value::Bool(false));
    env.insert(
        env::URL_SCHEME.into(),
        Value::from(if https { "https" } else { "http" }),
    );
}

/// Run application code, turning a panic into an error.
fn catch_panic<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    panic::catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(Error::Panic(panic_message(payload.as_ref()))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Calls `Body::close` when dropped, on every exit path.
struct CloseOnDrop(Box<dyn Body>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close();
    }
}

impl CloseOnDrop {
    fn next_chunk(&mut self) -> Option<std::result::Result<Bytes, AppError>> {
        self.0.next_chunk()
    }
}

/// Encode a response: status, headers, each non-empty chunk, empty frame.
pub fn encode_response(response: Response, max_body_bytes: usize) -> Result<Bytes> {
    let mut body = CloseOnDrop(response.body);
    let headers = serde_json::to_vec(&response.headers).map_err(Error::EncodeHeaders)?;

    let mut out = BytesMut::new();
    netstring::encode_into(&mut out, response.status.to_string().as_bytes());
    netstring::encode_into(&mut out, &headers);

    let mut body_len = 0usize;
    while let Some(chunk) = body.next_chunk() {
        let chunk = chunk?;
        if chunk.is_empty() {
            continue;
        }
        body_len += chunk.len();
        if body_len > max_body_bytes {
            return Err(Error::ResponseTooLarge {
                limit: max_body_bytes,
            });
        }
        netstring::encode_into(&mut out, &chunk);
    }
    netstring::encode_into(&mut out, b"");

    Ok(out.freeze())
}

/// Encode a failure as the single error frame.
pub fn encode_error(err: &Error) -> Bytes {
    netstring::encode(err.to_payload().to_json().as_bytes())
}
