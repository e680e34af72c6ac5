use serde::Deserialize;

pub const DEFAULT_CACHE_INTERVAL: u64 = 1_000;
pub const DEFAULT_CACHE_REMOVAL_INTERVAL: u64 = 5_000;
pub const DEFAULT_REQUEST_TIMEOUT: u64 = 10_000;

/// One daemon RPC endpoint.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct DaemonInstance {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl DaemonInstance {
    pub fn new(host: &str, port: u16, username: &str, password: &str) -> Self {
        Self { host: host.to_string(), port, username: username.to_string(), password: password.to_string() }
    }

    pub fn url(&self) -> String {
        format!("http://{}:{}/", self.host, self.port)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DaemonConfig {
    pub instances: Vec<DaemonInstance>,

    /// Milliseconds during which a cached reply is served instead of a new request
    #[serde(default = "default_cache_interval")]
    pub cache_interval: u64,

    /// Milliseconds after which a cached reply is purged
    #[serde(default = "default_cache_removal_interval")]
    pub cache_removal_interval: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

impl DaemonConfig {
    pub fn new(instances: Vec<DaemonInstance>) -> Self {
        Self {
            instances,
            cache_interval: DEFAULT_CACHE_INTERVAL,
            cache_removal_interval: DEFAULT_CACHE_REMOVAL_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

fn default_cache_interval() -> u64 {
    DEFAULT_CACHE_INTERVAL
}

fn default_cache_removal_interval() -> u64 {
    DEFAULT_CACHE_REMOVAL_INTERVAL
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT
}
