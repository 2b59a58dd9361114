//! Hosted application boundary.
//!
//! The worker knows nothing about what an application does. It hands the
//! application a [`Request`] (the decoded header map plus a body stream)
//! and expects a [`Response`] back: a status, a header map, and a [`Body`]
//! producing byte chunks.
//!
//! Applications are built from the configuration file by [`builder`].

pub mod builder;
pub mod builtin;

use bytes::Bytes;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Cursor, Write};

/// Request header map as decoded from the first request frame.
pub type Env = Map<String, Value>;

/// Response header map. Order is preserved on the wire.
pub type Headers = IndexMap<String, String>;

/// Environment keys added by the worker before dispatch.
pub mod env {
    pub const VERSION: &str = "worker.version";
    pub const MULTITHREAD: &str = "worker.multithread";
    pub const MULTIPROCESS: &str = "worker.multiprocess";
    pub const RUN_ONCE: &str = "worker.run_once";
    pub const URL_SCHEME: &str = "worker.url_scheme";

    /// Protocol version advertised to applications.
    pub const PROTOCOL_VERSION: [u32; 2] = [1, 3];
}

/// An application invoked once per request.
pub trait Application {
    fn call(&mut self, request: Request) -> Result<Response, AppError>;
}

impl<F> Application for F
where
    F: FnMut(Request) -> Result<Response, AppError>,
{
    fn call(&mut self, request: Request) -> Result<Response, AppError> {
        self(request)
    }
}

/// A response body.
///
/// `close` is the release hook: the worker calls it exactly once after the
/// body has been consumed, whether or not encoding succeeded.
pub trait Body {
    /// Next chunk, or `None` once the body is exhausted.
    fn next_chunk(&mut self) -> Option<Result<Bytes, AppError>>;

    fn close(&mut self) {}
}

/// A body made of chunks known up front.
#[derive(Debug, Default)]
pub struct Chunks(VecDeque<Bytes>);

impl Chunks {
    pub fn new<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self(chunks.into_iter().map(Into::into).collect())
    }
}

impl Body for Chunks {
    fn next_chunk(&mut self) -> Option<Result<Bytes, AppError>> {
        self.0.pop_front().map(Ok)
    }
}

/// A decoded request.
pub struct Request {
    pub env: Env,
    /// Request body, positioned at its start.
    pub input: Cursor<Vec<u8>>,
    /// Diagnostic stream for the application.
    pub errors: Box<dyn Write>,
}

impl Request {
    pub fn new(env: Env, input: Vec<u8>) -> Self {
        Self {
            env,
            input: Cursor::new(input),
            errors: Box::new(io::stderr()),
        }
    }

    /// String value of an env key, if present and a string.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.env.get(key).and_then(Value::as_str)
    }

    pub fn method(&self) -> Option<&str> {
        self.get("REQUEST_METHOD")
    }

    pub fn path(&self) -> &str {
        self.get("PATH_INFO").unwrap_or("/")
    }

    pub fn url_scheme(&self) -> &str {
        self.get(env::URL_SCHEME).unwrap_or("http")
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("env", &self.env)
            .field("input_len", &self.input.get_ref().len())
            .finish_non_exhaustive()
    }
}

/// An application's answer.
pub struct Response {
    pub status: u16,
    pub headers: Headers,
    pub body: Box<dyn Body>,
}

impl Response {
    pub fn new(status: u16, headers: Headers, body: impl Body + 'static) -> Self {
        Self {
            status,
            headers,
            body: Box::new(body),
        }
    }

    /// Response with a single-chunk body.
    pub fn text(status: u16, content_type: &str, body: impl Into<Bytes>) -> Self {
        let mut headers = Headers::new();
        headers.insert("Content-Type".to_string(), content_type.to_string());
        let body: Bytes = body.into();
        Self::new(status, headers, Chunks::new([body]))
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failure raised by an application.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct AppError {
    name: Cow<'static, str>,
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl AppError {
    pub fn new(name: impl Into<Cow<'static, str>>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Wrap an underlying error, keeping it as the cause.
    pub fn wrap<E>(name: impl Into<Cow<'static, str>>, err: E) -> Self
    where
        E: Into<BoxError>,
    {
        let source = err.into();
        Self {
            name: name.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
