//! Builds the hosted application from the `[[mount]]` tables of the config
//! file.
//!
//! ```toml
//! [[mount]]
//! path = "/"
//! app = { kind = "static", status = 200, body = "hi", headers = { "Content-Type" = "text/plain" } }
//!
//! [[mount]]
//! path = "/echo"
//! app = { kind = "echo" }
//! ```

use super::builtin::{Echo, EnvDump, Fail, NotFound, Static, UrlMap};
use super::{Application, Headers};
use crate::config::ConfigError;
use bytes::Bytes;
use serde::Deserialize;
use tracing::{debug, info};

/// One `[[mount]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct MountConfig {
    pub path: String,
    pub app: AppSpec,
}

/// Which built-in application to mount.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AppSpec {
    Static {
        #[serde(default = "default_status")]
        status: u16,
        #[serde(default)]
        headers: Headers,
        #[serde(default)]
        body: String,
    },
    Echo,
    Env,
    NotFound,
    Fail {
        message: String,
    },
}

fn default_status() -> u16 {
    200
}

impl AppSpec {
    fn build(&self) -> Box<dyn Application> {
        match self {
            AppSpec::Static {
                status,
                headers,
                body,
            } => Box::new(Static {
                status: *status,
                headers: headers.clone(),
                body: Bytes::from(body.clone()),
            }),
            AppSpec::Echo => Box::new(Echo),
            AppSpec::Env => Box::new(EnvDump),
            AppSpec::NotFound => Box::new(NotFound),
            AppSpec::Fail { message } => Box::new(Fail {
                message: message.clone(),
            }),
        }
    }
}

/// Build the application served by this worker.
pub fn build(mounts: &[MountConfig]) -> Result<Box<dyn Application>, ConfigError> {
    if mounts.is_empty() {
        return Err(ConfigError::NoMounts);
    }

    let mut apps: Vec<(String, Box<dyn Application>)> = Vec::with_capacity(mounts.len());
    for mount in mounts {
        let location = normalize(&mount.path)?;
        if apps.iter().any(|(l, _)| *l == location) {
            return Err(ConfigError::InvalidMount(mount.path.clone(), "mounted twice"));
        }
        debug!(path = %mount.path, app = ?mount.app, "Mounting application");
        apps.push((location, mount.app.build()));
    }

    let map = UrlMap::new(apps);
    info!(mounts = map.len(), "Application built");
    Ok(Box::new(map))
}

/// `/` becomes the empty root location; trailing slashes are dropped.
fn normalize(path: &str) -> Result<String, ConfigError> {
    if !path.starts_with('/') {
        return Err(ConfigError::InvalidMount(
            path.to_string(),
            "path must start with '/'",
        ));
    }
    Ok(path.trim_end_matches('/').to_string())
}
