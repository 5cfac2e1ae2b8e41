//! Typed settings, each remembering which source last set it.
//!
//! Sources are ranked; a value from a lower-ranked source never replaces one from a higher
//! ranked source, regardless of the order in which sources are applied.

use super::error::{Error, Result};
use super::server::ServerConfig;
use super::socket::ListenAddress;

use tokio::sync::Semaphore;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Prefix for settings taken from the environment, e.g. `FASTCGI_HOST_MAX_CONNECTIONS`.
pub const ENV_PREFIX: &str = "FASTCGI_HOST_";

/// Where a setting's value came from, lowest rank first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SettingSource {
    Default,
    AppConfig,
    Environment,
    File,
    CommandLine,
}

/// A value that can be parsed from the string form every source provides.
pub trait SettingValue: Sized {
    fn parse_setting(raw: &str) -> std::result::Result<Self, String>;
}

impl SettingValue for String {
    fn parse_setting(raw: &str) -> std::result::Result<String, String> {
        Ok(raw.to_owned())
    }
}

impl SettingValue for PathBuf {
    fn parse_setting(raw: &str) -> std::result::Result<PathBuf, String> {
        if raw.is_empty() {
            return Err("empty path".to_owned());
        }
        Ok(PathBuf::from(raw))
    }
}

impl SettingValue for bool {
    fn parse_setting(raw: &str) -> std::result::Result<bool, String> {
        match raw.to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(true),
            "false" | "no" | "off" | "0" => Ok(false),
            _ => Err("expected true or false".to_owned()),
        }
    }
}

impl SettingValue for usize {
    fn parse_setting(raw: &str) -> std::result::Result<usize, String> {
        raw.parse().map_err(|e| format!("{}", e))
    }
}

impl SettingValue for u32 {
    fn parse_setting(raw: &str) -> std::result::Result<u32, String> {
        raw.parse().map_err(|e| format!("{}", e))
    }
}

impl SettingValue for ListenAddress {
    fn parse_setting(raw: &str) -> std::result::Result<ListenAddress, String> {
        raw.parse().map_err(|e: Error| e.to_string())
    }
}

impl<T: SettingValue> SettingValue for Option<T> {
    fn parse_setting(raw: &str) -> std::result::Result<Option<T>, String> {
        if raw.is_empty() {
            Ok(None)
        } else {
            T::parse_setting(raw).map(Some)
        }
    }
}

/// Unix permission bits, written in octal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMode(pub u32);

impl SettingValue for FileMode {
    fn parse_setting(raw: &str) -> std::result::Result<FileMode, String> {
        let digits = raw.strip_prefix("0o").unwrap_or(raw);
        match u32::from_str_radix(digits, 8) {
            Ok(mode) if mode <= 0o7777 => Ok(FileMode(mode)),
            Ok(_) => Err("mode out of range".to_owned()),
            Err(e) => Err(format!("expected an octal mode: {}", e)),
        }
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04o}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Setting<T> {
    name: &'static str,
    value: T,
    source: SettingSource,
}

impl<T: SettingValue> Setting<T> {
    pub fn new(name: &'static str, default: T) -> Setting<T> {
        Setting {
            name,
            value: default,
            source: SettingSource::Default,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn source(&self) -> SettingSource {
        self.source
    }

    /// Store `value` unless the current value came from a higher-ranked source. Returns
    /// whether the value was stored.
    pub fn set(&mut self, value: T, source: SettingSource) -> bool {
        if source < self.source {
            debug!("setting {}: keeping {:?} value over {:?}", self.name, self.source, source);
            return false;
        }
        self.value = value;
        self.source = source;
        true
    }

    pub fn set_raw(&mut self, raw: &str, source: SettingSource) -> Result<bool> {
        let value = T::parse_setting(raw).map_err(|reason| Error::InvalidSetting {
            name: self.name.to_owned(),
            value: raw.to_owned(),
            reason,
        })?;
        Ok(self.set(value, source))
    }
}

/// Everything the host binary and the process manager are configured with.
#[derive(Debug, Clone)]
pub struct HostSettings {
    pub socket: Setting<ListenAddress>,
    pub socket_mode: Setting<Option<FileMode>>,
    pub max_connections: Setting<usize>,
    pub max_requests: Setting<usize>,
    pub multiplex: Setting<bool>,
    pub backlog: Setting<u32>,
    pub apps_dir: Setting<PathBuf>,
    pub launcher: Setting<String>,
    pub user: Setting<Option<String>>,
}

impl Default for HostSettings {
    fn default() -> HostSettings {
        let defaults = ServerConfig::default();
        HostSettings {
            socket: Setting::new("socket", ListenAddress::Tcp(([127, 0, 0, 1], 9000).into())),
            socket_mode: Setting::new("socket_mode", None),
            max_connections: Setting::new("max_connections", defaults.max_connections),
            max_requests: Setting::new("max_requests", defaults.max_requests),
            multiplex: Setting::new("multiplex", defaults.multiplex),
            backlog: Setting::new("backlog", 128),
            apps_dir: Setting::new("apps_dir", PathBuf::from("/etc/fastcgi-host/apps")),
            launcher: Setting::new("launcher", "fastcgi-host worker".to_owned()),
            user: Setting::new("user", None),
        }
    }
}

impl HostSettings {
    /// Set one setting by name from its string form. Dashes in `key` are read as underscores.
    pub fn apply(&mut self, key: &str, raw: &str, source: SettingSource) -> Result<bool> {
        match key.replace('-', "_").as_str() {
            "socket" => self.socket.set_raw(raw, source),
            "socket_mode" => self.socket_mode.set_raw(raw, source),
            "max_connections" => self.max_connections.set_raw(raw, source),
            "max_requests" => self.max_requests.set_raw(raw, source),
            "multiplex" => self.multiplex.set_raw(raw, source),
            "backlog" => self.backlog.set_raw(raw, source),
            "apps_dir" => self.apps_dir.set_raw(raw, source),
            "launcher" => self.launcher.set_raw(raw, source),
            "user" => self.user.set_raw(raw, source),
            _ => Err(Error::InvalidSetting {
                name: key.to_owned(),
                value: raw.to_owned(),
                reason: "no such setting".to_owned(),
            }),
        }
    }

    /// Apply every `FASTCGI_HOST_*` variable in `vars`. Unknown names under the prefix are
    /// logged and skipped.
    pub fn apply_environment<I>(&mut self, vars: I) -> Result<()>
        where I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let name = match key.strip_prefix(ENV_PREFIX) {
                Some(name) => name.to_ascii_lowercase(),
                None => continue,
            };
            match self.apply(&name, &value, SettingSource::Environment) {
                Err(Error::InvalidSetting { ref reason, .. }) if reason == "no such setting" => {
                    warn!("ignoring unknown environment setting {}", key);
                },
                Err(e) => return Err(e),
                Ok(_) => (),
            }
        }
        Ok(())
    }

    /// Apply a flat TOML table of `name = value` pairs.
    pub fn apply_file(&mut self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path)?;
        let table: toml::Table = text.parse().map_err(|source| Error::Config {
            path: path.to_owned(),
            source,
        })?;
        for (key, value) in &table {
            let raw = match value {
                toml::Value::String(s) => s.clone(),
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Boolean(b) => b.to_string(),
                other => {
                    return Err(Error::InvalidSetting {
                        name: key.clone(),
                        value: other.to_string(),
                        reason: format!("unsupported value type in {}", path.display()),
                    });
                },
            };
            self.apply(key, &raw, SettingSource::File)?;
        }
        debug!("applied {} settings from {}", table.len(), path.display());
        Ok(())
    }

    pub fn server_config(&self) -> Result<ServerConfig> {
        for setting in [&self.max_connections, &self.max_requests] {
            let value = *setting.get();
            if value == 0 || value > Semaphore::MAX_PERMITS {
                return Err(Error::InvalidSetting {
                    name: setting.name().to_owned(),
                    value: value.to_string(),
                    reason: format!("must be between 1 and {}", Semaphore::MAX_PERMITS),
                });
            }
        }
        Ok(ServerConfig {
            max_connections: *self.max_connections.get(),
            max_requests: *self.max_requests.get(),
            multiplex: *self.multiplex.get(),
        })
    }

    /// The listen address, with `socket_mode` folded in for Unix paths.
    pub fn listen_address(&self) -> ListenAddress {
        match (self.socket.get().clone(), *self.socket_mode.get()) {
            (ListenAddress::Unix { path, mode }, socket_mode) => ListenAddress::Unix {
                path,
                mode: socket_mode.map(|m| m.0).or(mode),
            },
            (address, _) => address,
        }
    }
}
