use std::net::SocketAddr;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "127.0.0.1:3000")]
    pub address: SocketAddr,

    #[envconfig(from = "GITHUB_API_URL", default = "https://api.github.com")]
    pub github_api_url: String,

    #[envconfig(from = "ACCESS_TOKEN")]
    pub github_access_token: Option<String>,

    #[envconfig(default = "5000")]
    pub request_timeout: EnvMsDuration,

    /// Fetch attempts per tracking run before the run fails.
    #[envconfig(default = "5")]
    pub retry_budget: u32,

    /// Fixed pause between fetch attempts. Zero retries immediately.
    #[envconfig(default = "0")]
    pub retry_backoff: EnvMsDuration,

    #[envconfig(default = "10")]
    pub worker_pool_size: usize,

    /// Trailing window for the popularity ranking, 24h unless overridden.
    #[envconfig(default = "86400000")]
    pub ranking_window: EnvMsDuration,

    #[envconfig(default = "5")]
    pub top_n: usize,

    /// Emit a full aggregation snapshot after every counted event instead
    /// of once at batch completion. For sources that never complete.
    #[envconfig(default = "false")]
    pub snapshot_per_event: bool,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}
