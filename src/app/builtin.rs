//! Built-in applications that can be mounted from the config file.

use super::{AppError, Application, Chunks, Env, Headers, Request, Response};
use bytes::Bytes;
use serde_json::Value;
use std::io::Read;

/// Always answers with the same response.
#[derive(Debug, Clone)]
pub struct Static {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
}

impl Application for Static {
    fn call(&mut self, _request: Request) -> Result<Response, AppError> {
        Ok(Response::new(
            self.status,
            self.headers.clone(),
            Chunks::new([self.body.clone()]),
        ))
    }
}

/// Returns the request body.
#[derive(Debug, Default)]
pub struct Echo;

impl Application for Echo {
    fn call(&mut self, mut request: Request) -> Result<Response, AppError> {
        let mut body = Vec::new();
        request
            .input
            .read_to_end(&mut body)
            .map_err(|e| AppError::wrap("IoError", e))?;

        let content_type = request
            .get("CONTENT_TYPE")
            .unwrap_or("application/octet-stream")
            .to_string();
        Ok(Response::text(200, &content_type, body))
    }
}

/// Returns the request header map, including worker-added fields, as JSON.
#[derive(Debug, Default)]
pub struct EnvDump;

impl Application for EnvDump {
    fn call(&mut self, request: Request) -> Result<Response, AppError> {
        let json = serde_json::to_vec(&request.env).map_err(|e| AppError::wrap("EncodeError", e))?;
        Ok(Response::text(200, "application/json", json))
    }
}

#[derive(Debug, Default)]
pub struct NotFound;

impl Application for NotFound {
    fn call(&mut self, request: Request) -> Result<Response, AppError> {
        Ok(Response::text(
            404,
            "text/plain",
            format!("Not Found: {}", request.path()),
        ))
    }
}

/// Fails every request. Useful for exercising the error path.
#[derive(Debug, Clone)]
pub struct Fail {
    pub message: String,
}

impl Application for Fail {
    fn call(&mut self, _request: Request) -> Result<Response, AppError> {
        Err(AppError::new("ApplicationError", self.message.clone()))
    }
}

/// Routes requests to mounted applications by longest path prefix.
///
/// The matched prefix is appended to `SCRIPT_NAME` and stripped from
/// `PATH_INFO` before the mounted application sees the request.
pub struct UrlMap {
    /// Sorted longest prefix first.
    mounts: Vec<(String, Box<dyn Application>)>,
    fallback: NotFound,
}

impl UrlMap {
    pub fn new(mut mounts: Vec<(String, Box<dyn Application>)>) -> Self {
        mounts.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self {
            mounts,
            fallback: NotFound,
        }
    }

    pub fn len(&self) -> usize {
        self.mounts.len()
    }
}

impl Application for UrlMap {
    fn call(&mut self, mut request: Request) -> Result<Response, AppError> {
        let path = request.path().to_string();

        for (location, app) in &mut self.mounts {
            let rest = match path.strip_prefix(location.as_str()) {
                Some(rest) if rest.is_empty() || rest.starts_with('/') => rest.to_string(),
                _ => continue,
            };

            let script_name = request.get("SCRIPT_NAME").unwrap_or("").to_string();
            set(&mut request.env, "SCRIPT_NAME", format!("{script_name}{location}"));
            set(&mut request.env, "PATH_INFO", rest);
            return app.call(request);
        }

        self.fallback.call(request)
    }
}

fn set(env: &mut Env, key: &str, value: String) {
    env.insert(key.to_string(), Value::String(value));
}
