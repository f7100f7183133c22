use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;
use url::Url;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for jukebox.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "jukebox".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Where fetched files live until they are reclaimed.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// The shared directory holding one `{key}.{extension}` file per fetch cycle.
    ///
    /// Defaults to a `jukebox` directory inside the system temp directory.
    pub dir: PathBuf,

    /// The file extension produced by the fetcher.
    pub extension: String,

    /// Removes everything inside `dir` when the server starts.
    ///
    /// Files are only ever owned by a running fetch-serve-purge cycle, so anything found at startup
    /// was left behind by a crash.
    pub clear_on_startup: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: env::temp_dir().join("jukebox"),
            extension: "mp3".into(),
            clear_on_startup: true,
        }
    }
}

/// The user agent handed to the fetch program.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/102.0.5005.63 Safari/537.36";

/// Configures the external program that materializes a key into a file.
///
/// Every argument may contain the placeholders `{key}`, `{url}`, `{output_template}` and
/// `{output_path}`.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// The program to run.
    pub program: PathBuf,

    /// The URL the key is expanded into, available as `{url}`.
    pub url_template: String,

    /// Arguments passed to `program`.
    pub args: Vec<String>,

    /// Upper bound for a single fetch, after which the program is killed.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        let args = [
            "--quiet",
            "--no-warnings",
            "--no-progress",
            "--no-playlist",
            "--format",
            "bestaudio/best",
            "--extract-audio",
            "--audio-format",
            "mp3",
            "--audio-quality",
            "192K",
            "--user-agent",
            DEFAULT_USER_AGENT,
            "--output",
            "{output_template}",
            "{url}",
        ];
        Self {
            program: "yt-dlp".into(),
            url_template: "https://www.youtube.com/watch?v={key}".into(),
            args: args.into_iter().map(String::from).collect(),
            timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// Controls how requests wait for and serve a fetched file.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    /// How often the readiness gate checks the file.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// How long a request may wait for a fetch started by another request, including the
    /// readiness check afterwards.
    #[serde(with = "humantime_serde")]
    pub wait_timeout: Duration,

    /// How long the readiness gate waits for the file once its fetch succeeded.
    ///
    /// A successful fetch has already moved the file into place, so this is only a short grace
    /// for slow filesystems. A file missing after this is reported as not available.
    #[serde(with = "humantime_serde")]
    pub ready_timeout: Duration,

    /// The content type of served files.
    pub content_type: String,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            // A bit longer than the default fetch timeout, so waiters see the fetch failure
            // rather than their own timeout.
            wait_timeout: Duration::from_secs(5 * 60 + 30),
            ready_timeout: Duration::from_secs(2),
            content_type: "audio/mpeg".into(),
        }
    }
}

/// When served files are removed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimMode {
    /// Delete a fixed grace period after the file was handed out.
    Elapsed,
    /// Delete once the response stream is closed, or after `max_age` at the latest.
    StreamClose,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ReclaimConfig {
    pub mode: ReclaimMode,

    /// Delay between serving and deleting a file in `elapsed` mode.
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,

    /// Fallback deadline in `stream_close` mode.
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            mode: ReclaimMode::Elapsed,
            grace_period: Duration::from_secs(20),
            max_age: Duration::from_secs(10 * 60),
        }
    }
}

/// Configures the external search program backing `/search`.
///
/// Arguments may contain the placeholders `{query}` and `{limit}`.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Whether the search endpoint is enabled at all.
    pub enabled: bool,

    /// The program to run.
    pub program: PathBuf,

    /// Arguments passed to `program`.
    pub args: Vec<String>,

    /// The maximum number of results returned.
    pub limit: usize,

    /// Upper bound for a single search.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for SearchConfig {
    fn default() -> Self {
        let args = [
            "--flat-playlist",
            "--dump-json",
            "--no-warnings",
            "ytsearch{limit}:{query}",
        ];
        Self {
            enabled: true,
            program: "yt-dlp".into(),
            args: args.into_iter().map(String::from).collect(),
            limit: 5,
            timeout: Duration::from_secs(15),
        }
    }
}

/// The jukebox configuration, usually read from a YAML file.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host and port to bind the HTTP webserver to.
    pub bind: String,

    /// The externally reachable base URL of this server, used to build audio links.
    ///
    /// Defaults to `http://{bind}`.
    pub public_url: Option<Url>,

    /// Configuration of the shared storage directory.
    pub storage: StorageConfig,

    /// Configuration of the fetch program.
    pub fetch: FetchConfig,

    /// Configuration of waiting for and serving files.
    pub serve: ServeConfig,

    /// Configuration of deferred file removal.
    pub reclaim: ReclaimConfig,

    /// Configuration of the search program.
    pub search: SearchConfig,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: "127.0.0.1:5000".to_owned(),
            public_url: None,
            storage: StorageConfig::default(),
            fetch: FetchConfig::default(),
            serve: ServeConfig::default(),
            reclaim: ReclaimConfig::default(),
            search: SearchConfig::default(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }

    /// The base URL audio links are built from, without a trailing slash.
    pub fn public_base_url(&self) -> String {
        match self.public_url {
            Some(ref url) => url.as_str().trim_end_matches('/').to_owned(),
            None => format!("http://{}", self.bind),
        }
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
