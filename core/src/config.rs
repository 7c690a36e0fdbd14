//! Run configuration types
//!
//! A run configuration is a named set of sections, each a string-keyed map of
//! JSON values. The coordinator owns the run-wide instance; every host worker
//! receives its own copy of the sections it needs.

use std::collections::BTreeMap;
use std::net::Ipv6Addr;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default HTTP port of a benchmark candidate node
pub const DEFAULT_HTTP_PORT: u16 = 9200;

/// Sections a host worker copies from the run-wide configuration
pub const WORKER_SECTIONS: [&str; 6] = ["system", "distributions", "client", "track", "mechanic", "race"];

/// A single configuration section
pub type Section = BTreeMap<String, Value>;

/// Run configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Configuration name
    #[serde(default)]
    pub name: String,

    /// Named sections
    #[serde(default)]
    pub sections: BTreeMap<String, Section>,
}

impl Config {
    /// Create an empty configuration with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sections: BTreeMap::new(),
        }
    }

    /// Parse a configuration from JSON
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Read a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> crate::error::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(Self::from_json(&json)?)
    }

    /// Set a single value, replacing any previous value
    pub fn add(&mut self, section: &str, key: &str, value: impl Into<Value>) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }

    /// Builder-style variant of [`Config::add`]
    pub fn with(mut self, section: &str, key: &str, value: impl Into<Value>) -> Self {
        self.add(section, key, value);
        self
    }

    /// Copy a whole section from another configuration
    ///
    /// Keys present in `other` overwrite local keys; a section that `other`
    /// does not have leaves this configuration untouched.
    pub fn add_all(&mut self, other: &Config, section: &str) {
        if let Some(values) = other.sections.get(section) {
            let target = self.sections.entry(section.to_string()).or_default();
            for (key, value) in values {
                target.insert(key.clone(), value.clone());
            }
        }
    }

    /// Get a whole section (empty if absent)
    pub fn all_opts(&self, section: &str) -> Section {
        self.sections.get(section).cloned().unwrap_or_default()
    }

    /// Whether the given section exists
    pub fn has_section(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }

    /// Get a raw value
    pub fn opts(&self, section: &str, key: &str) -> Result<&Value, ConfigError> {
        self.sections
            .get(section)
            .and_then(|s| s.get(key))
            .ok_or_else(|| ConfigError::missing(section, key))
    }

    /// Get a typed value
    pub fn get<T: DeserializeOwned>(&self, section: &str, key: &str) -> Result<T, ConfigError> {
        let value = self.opts(section, key)?;
        serde_json::from_value(value.clone()).map_err(|e| ConfigError::Invalid {
            section: section.to_string(),
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    /// Get a typed value, `None` if the key is absent or null
    pub fn get_opt<T: DeserializeOwned>(
        &self,
        section: &str,
        key: &str,
    ) -> Result<Option<T>, ConfigError> {
        match self.opts(section, key) {
            Ok(Value::Null) | Err(ConfigError::Missing { .. }) => Ok(None),
            Ok(_) => self.get(section, key).map(Some),
            Err(e) => Err(e),
        }
    }

    /// Get a typed value or a default
    pub fn get_or<T: DeserializeOwned>(
        &self,
        section: &str,
        key: &str,
        default: T,
    ) -> Result<T, ConfigError> {
        Ok(self.get_opt(section, key)?.unwrap_or(default))
    }

    /// Target hosts (`client.hosts`)
    pub fn hosts(&self) -> Result<Vec<HostSpec>, ConfigError> {
        self.get_or("client", "hosts", Vec::new())
    }

    /// Whether workers may run on remote hosts
    pub fn remote_benchmarking_supported(&self) -> Result<bool, ConfigError> {
        self.get_or("system", "remote.benchmarking.supported", false)
    }

    /// Node ids assigned to this host (`provisioning.node.ids`)
    pub fn node_ids(&self) -> Result<Vec<usize>, ConfigError> {
        self.get_or("provisioning", "node.ids", Vec::new())
    }

    /// Car name (`mechanic.car.name`)
    pub fn car_name(&self) -> Result<String, ConfigError> {
        self.get("mechanic", "car.name")
    }

    /// Plugin names (`mechanic.car.plugins`)
    pub fn car_plugins(&self) -> Result<Vec<String>, ConfigError> {
        self.get_or("mechanic", "car.plugins", Vec::new())
    }

    /// Root directory of all races (`<node.root.dir>/races`)
    pub fn races_root(&self) -> Result<PathBuf, ConfigError> {
        let root: PathBuf = self.get("node", "root.dir")?;
        Ok(root.join("races"))
    }

    /// Directory of the current race (`<races root>/<system.time.start>`)
    pub fn race_root(&self) -> Result<PathBuf, ConfigError> {
        let start: String = self.get("system", "time.start")?;
        Ok(self.races_root()?.join(start))
    }
}

/// A target host as configured by the user
///
/// Deserializes from either `"host[:port]"` or
/// `{ "host": ..., "port": ..., <options> }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "HostEntry")]
pub struct HostSpec {
    /// Host name or IP address
    pub host: String,

    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Any further options; only externally managed clusters accept them
    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, Value>,
}

fn default_port() -> u16 {
    DEFAULT_HTTP_PORT
}

/// Accepted shapes of a `client.hosts` entry
#[derive(Deserialize)]
#[serde(untagged)]
enum HostEntry {
    Address(String),
    Object(HostObject),
}

#[derive(Deserialize)]
struct HostObject {
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(flatten)]
    options: BTreeMap<String, Value>,
}

impl TryFrom<HostEntry> for HostSpec {
    type Error = ConfigError;

    fn try_from(entry: HostEntry) -> Result<Self, Self::Error> {
        match entry {
            HostEntry::Address(address) => HostSpec::parse(&address),
            HostEntry::Object(HostObject {
                host,
                port,
                options,
            }) => Ok(HostSpec {
                host,
                port,
                options,
            }),
        }
    }
}

fn invalid_host(reason: String) -> ConfigError {
    ConfigError::Invalid {
        section: "client".into(),
        key: "hosts".into(),
        reason,
    }
}

fn parse_port(spec: &str, port: &str) -> Result<u16, ConfigError> {
    port.parse()
        .map_err(|_| invalid_host(format!("invalid port in [{spec}]")))
}

impl HostSpec {
    /// Create a host spec without extra options
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            options: BTreeMap::new(),
        }
    }

    /// Parse `host[:port]`
    ///
    /// IPv6 addresses are given bare (`::1`) or bracketed (`[::1]:9200`).
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        if let Some(rest) = spec.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| invalid_host(format!("unclosed bracket in [{spec}]")))?;
            if host.is_empty() {
                return Err(invalid_host(format!("empty host in [{spec}]")));
            }
            return match tail.strip_prefix(':') {
                Some(port) => Ok(Self::new(host, parse_port(spec, port)?)),
                None if tail.is_empty() => Ok(Self::new(host, DEFAULT_HTTP_PORT)),
                None => Err(invalid_host(format!("unexpected [{tail}] in [{spec}]"))),
            };
        }
        if spec.parse::<Ipv6Addr>().is_ok() {
            return Ok(Self::new(spec, DEFAULT_HTTP_PORT));
        }
        match spec.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => Ok(Self::new(host, parse_port(spec, port)?)),
            Some(_) => Err(invalid_host(format!("empty host in [{spec}]"))),
            None if !spec.is_empty() => Ok(Self::new(spec, DEFAULT_HTTP_PORT)),
            None => Err(invalid_host("empty host".into())),
        }
    }
}

impl std::fmt::Display for HostSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A mandatory key is absent
    #[error("missing mandatory config key [{key}] in section [{section}]")]
    Missing {
        /// Section name
        section: String,
        /// Key name
        key: String,
    },

    /// A key holds a value of the wrong shape
    #[error("invalid value for [{section}.{key}]: {reason}")]
    Invalid {
        /// Section name
        section: String,
        /// Key name
        key: String,
        /// Why the value was rejected
        reason: String,
    },

    /// The configuration document could not be parsed
    #[error("cannot parse configuration: {0}")]
    Parse(String),
}

impl ConfigError {
    /// Create a missing-key error
    pub fn missing(section: &str, key: &str) -> Self {
        Self::Missing {
            section: section.to_string(),
            key: key.to_string(),
        }
    }
}
