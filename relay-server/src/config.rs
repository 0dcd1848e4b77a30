use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use relay_net::Limits;

const DEFAULT_CONFIG: &str = include_str!("../config.toml");

#[derive(Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    limits: LimitsSection,
}

#[derive(Deserialize, Default)]
struct ServerSection {
    bind: Option<String>,
}

#[derive(Deserialize, Default)]
struct LimitsSection {
    max_frame_len: Option<usize>,
    max_nickname_len: Option<usize>,
    outbound_queue: Option<usize>,
    max_queued_bytes: Option<usize>,
    send_timeout_ms: Option<u64>,
    write_timeout_ms: Option<u64>,
}

pub struct Config {
    server: ServerSection,
    limits: LimitsSection,
}

impl Config {
    /// Embedded defaults overlaid with the user config, if present.
    pub fn load() -> Self {
        Self::load_from(user_config_path().as_deref())
    }

    /// Embedded defaults overlaid with the file at `path`, if given and present.
    pub fn load_from(path: Option<&Path>) -> Self {
        let mut base: ConfigFile = match toml::from_str(DEFAULT_CONFIG) {
            Ok(base) => base,
            Err(e) => {
                log::error!(target: "config", "embedded config.toml is invalid: {}", e);
                ConfigFile::default()
            }
        };

        if let Some(path) = path {
            if path.exists() {
                match std::fs::read_to_string(path) {
                    Ok(contents) => match toml::from_str::<ConfigFile>(&contents) {
                        Ok(user) => {
                            merge_server(&mut base.server, user.server);
                            merge_limits(&mut base.limits, user.limits);
                        }
                        Err(e) => {
                            log::warn!(target: "config", "ignoring malformed config {}: {}", path.display(), e)
                        }
                    },
                    Err(e) => {
                        log::warn!(target: "config", "could not read config {}: {}", path.display(), e)
                    }
                }
            }
        }

        Config {
            server: base.server,
            limits: base.limits,
        }
    }

    /// Override the bind address (from the command line).
    pub fn set_bind(&mut self, addr: String) {
        self.server.bind = Some(addr);
    }

    pub fn bind(&self) -> String {
        self.server
            .bind
            .clone()
            .unwrap_or_else(|| "127.0.0.1:8888".to_string())
    }

    pub fn limits(&self) -> Limits {
        let fallback = Limits::default();
        Limits {
            max_frame_len: self
                .limits
                .max_frame_len
                .unwrap_or(fallback.max_frame_len)
                .max(1024),
            max_nickname_len: self
                .limits
                .max_nickname_len
                .unwrap_or(fallback.max_nickname_len)
                .max(1),
            outbound_queue: self
                .limits
                .outbound_queue
                .unwrap_or(fallback.outbound_queue)
                .max(1),
            max_queued_bytes: self
                .limits
                .max_queued_bytes
                .unwrap_or(fallback.max_queued_bytes)
                .max(1024),
            send_timeout: self
                .limits
                .send_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(fallback.send_timeout),
            write_timeout: self
                .limits
                .write_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(fallback.write_timeout),
        }
    }
}

pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("relay"))
}

fn user_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.toml"))
}

fn merge_server(base: &mut ServerSection, user: ServerSection) {
    if user.bind.is_some() {
        base.bind = user.bind;
    }
}

fn merge_limits(base: &mut LimitsSection, user: LimitsSection) {
    if user.max_frame_len.is_some() {
        base.max_frame_len = user.max_frame_len;
    }
    if user.max_nickname_len.is_some() {
        base.max_nickname_len = user.max_nickname_len;
    }
    if user.outbound_queue.is_some() {
        base.outbound_queue = user.outbound_queue;
    }
    if user.max_queued_bytes.is_some() {
        base.max_queued_bytes = user.max_queued_bytes;
    }
    if user.send_timeout_ms.is_some() {
        base.send_timeout_ms = user.send_timeout_ms;
    }
    if user.write_timeout_ms.is_some() {
        base.write_timeout_ms = user.write_timeout_ms;
    }
}
