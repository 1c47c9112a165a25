//! Configuration types for qualer-dl

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path, path::PathBuf, time::Duration};
use url::Url;

/// Main configuration for a harvesting run
///
/// Constructed once per run and handed to [`crate::Harvester`]; nothing in the crate
/// reads configuration from globals.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Root of the Qualer tenant (e.g. "https://jgiquality.qualer.com")
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Login flow settings
    #[serde(default)]
    pub auth: AuthConfig,

    /// HTTP client settings
    #[serde(default)]
    pub http: HttpConfig,

    /// Retry policy for the parameterized lookups
    #[serde(default)]
    pub retry: RetryConfig,

    /// Worker pool and batch policy
    #[serde(default)]
    pub fanout: FanOutConfig,

    /// Where and how rows are persisted
    #[serde(default)]
    pub output: OutputConfig,

    /// Upstream endpoint definitions
    #[serde(default)]
    pub endpoints: EndpointsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            auth: AuthConfig::default(),
            http: HttpConfig::default(),
            retry: RetryConfig::default(),
            fanout: FanOutConfig::default(),
            output: OutputConfig::default(),
            endpoints: EndpointsConfig::default(),
        }
    }
}

impl Config {
    /// Load a JSON configuration file and validate it
    ///
    /// Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("failed to read {}: {}", path.display(), e),
            key: None,
        })?;
        let config: Config = serde_json::from_str(&text).map_err(|e| Error::Config {
            message: format!("failed to parse {}: {}", path.display(), e),
            key: None,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot express
    pub fn validate(&self) -> Result<()> {
        let base = self.base()?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(config_error("base_url must be an http(s) URL", "base_url"));
        }
        if self.auth.login_marker.trim().is_empty() {
            return Err(config_error(
                "login_marker must not be empty",
                "auth.login_marker",
            ));
        }
        if self.fanout.workers == 0 {
            return Err(config_error(
                "at least one worker is required",
                "fanout.workers",
            ));
        }
        if self.output.chunk_size == 0 {
            return Err(config_error(
                "chunk_size must be positive",
                "output.chunk_size",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(config_error(
                "max_attempts counts the first attempt and must be at least 1",
                "retry.max_attempts",
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(config_error(
                "backoff_multiplier must be >= 1.0",
                "retry.backoff_multiplier",
            ));
        }
        Ok(())
    }

    /// Parsed base URL
    pub fn base(&self) -> Result<Url> {
        Url::parse(&self.base_url).map_err(|e| Error::Config {
            message: format!("invalid base_url {:?}: {}", self.base_url, e),
            key: Some("base_url".into()),
        })
    }

    /// Resolve an endpoint path against the base URL
    pub fn endpoint_url(&self, path: &str) -> Result<Url> {
        self.base()?.join(path).map_err(|e| Error::Config {
            message: format!("invalid endpoint path {:?}: {}", path, e),
            key: None,
        })
    }

    /// Login page URL
    pub fn login_url(&self) -> Result<Url> {
        self.endpoint_url(&self.auth.login_path)
    }
}

fn config_error(message: &str, key: &str) -> Error {
    Error::Config {
        message: message.to_string(),
        key: Some(key.to_string()),
    }
}

/// Login flow configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Login page path (default: "/login")
    #[serde(default = "default_login_path")]
    pub login_path: String,

    /// Substring identifying the login page in a location (case-insensitive, default: "login")
    #[serde(default = "default_login_marker")]
    pub login_marker: String,

    /// Environment variable holding the account identifier (default: "QUALER_USERNAME")
    #[serde(default = "default_username_env")]
    pub username_env: String,

    /// Environment variable holding the secret (default: "QUALER_PASSWORD")
    #[serde(default = "default_password_env")]
    pub password_env: String,

    /// Form field name for the identifier (default: "Email")
    #[serde(default = "default_username_field")]
    pub username_field: String,

    /// Form field name for the secret (default: "Password")
    #[serde(default = "default_password_field")]
    pub password_field: String,

    /// Hidden anti-forgery input echoed back on submit, if the page has one
    #[serde(default = "default_token_field")]
    pub token_field: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            login_path: default_login_path(),
            login_marker: default_login_marker(),
            username_env: default_username_env(),
            password_env: default_password_env(),
            username_field: default_username_field(),
            password_field: default_password_field(),
            token_field: default_token_field(),
        }
    }
}

impl AuthConfig {
    /// Whether a location points at the login page
    pub fn is_login_location(&self, location: &str) -> bool {
        location
            .to_ascii_lowercase()
            .contains(&self.login_marker.to_ascii_lowercase())
    }
}

/// HTTP client configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Timeout for one navigation (default: 30 seconds)
    #[serde(default = "default_navigation_timeout", with = "duration_serde")]
    pub navigation_timeout: Duration,

    /// User agent sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Headers sent with every request
    #[serde(default = "default_headers")]
    pub headers: HashMap<String, String>,

    /// Session cookies to seed the jar with (transplanted from another client)
    #[serde(default)]
    pub cookies: Vec<CookieConfig>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            navigation_timeout: default_navigation_timeout(),
            user_agent: default_user_agent(),
            headers: default_headers(),
            cookies: Vec::new(),
        }
    }
}

/// A name/value cookie scoped to the base URL
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieConfig {
    /// Cookie name (e.g. "ASP.NET_SessionId")
    pub name: String,
    /// Cookie value
    pub value: String,
}

/// Retry configuration for transient render failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry (default: 2 seconds)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier applied to the delay after each retry (default: 1.0, a fixed delay)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: false)
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: false,
        }
    }
}

/// How task results reach the sink
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionMode {
    /// Hold every row in memory and write once at the end
    Buffer,
    /// Write each task's rows as soon as the task succeeds (default)
    #[default]
    Stream,
}

/// What a batch does when a task ends FAILED
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop dispatching and return the first failure
    FailFast,
    /// Record the failed pair and keep going (default)
    #[default]
    BestEffort,
}

/// Fan-out configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FanOutConfig {
    /// Maximum concurrently running fetch tasks (default: 10)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Buffer or stream results
    #[serde(default)]
    pub mode: CollectionMode,

    /// Fail-fast or best-effort
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            mode: CollectionMode::default(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

/// Behaviour when the destination table already exists
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IfExists {
    /// Drop and recreate the table once per run (full reload, default)
    #[default]
    Replace,
    /// Keep existing rows (incremental load)
    Append,
}

/// Destination kind for a run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputTarget {
    /// CSV files under `csv_dir` (default)
    #[default]
    Csv,
    /// Tables in the SQLite database at `database_path`
    Database,
}

/// Output configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Destination kind
    #[serde(default)]
    pub target: OutputTarget,

    /// Directory for CSV output (default: "./csv")
    #[serde(default = "default_csv_dir")]
    pub csv_dir: PathBuf,

    /// SQLite database file (default: "./qualer.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Rows per database insert transaction (default: 500)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Replace or append existing tables
    #[serde(default)]
    pub if_exists: IfExists,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            target: OutputTarget::default(),
            csv_dir: default_csv_dir(),
            database_path: default_database_path(),
            chunk_size: default_chunk_size(),
            if_exists: IfExists::default(),
        }
    }
}

/// Endpoint returning `{<array_key>: [...]}`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEndpoint {
    /// Path relative to the base URL
    pub path: String,
    /// Field holding the array
    pub array_key: String,
    /// Integer field used as a reference id
    pub id_field: String,
}

/// Endpoint returning `[...]` directly
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatEndpoint {
    /// Path relative to the base URL
    pub path: String,
    /// Integer field used as a reference id
    pub id_field: String,
}

/// Endpoint returning `{<array_key>: [...]}` for `?<dim_a>=<a>&<dim_b>=<b>`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupEndpoint {
    /// Path relative to the base URL
    pub path: String,
    /// Query parameters sent before the dimensions (e.g. empty `sort`, `group`, `filter`)
    #[serde(default)]
    pub static_query: Vec<(String, String)>,
    /// Query parameter for the outer dimension
    pub dim_a: String,
    /// Query parameter for the inner dimension
    pub dim_b: String,
    /// Field holding the array
    pub array_key: String,
}

/// Endpoint returning `{<array_key>: [...]}` for `?<id_param>=<id>`
///
/// Unlike a lookup, a missing `array_key` means no rows.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailEndpoint {
    /// Path relative to the base URL
    pub path: String,
    /// Query parameter carrying the id
    pub id_param: String,
    /// Field holding the array
    pub array_key: String,
}

/// Upstream endpoint definitions
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EndpointsConfig {
    /// Service groups (list endpoint, `views`)
    #[serde(default = "default_service_capabilities")]
    pub service_capabilities: ListEndpoint,

    /// Techniques (flat endpoint)
    #[serde(default = "default_techniques")]
    pub techniques: FlatEndpoint,

    /// Uncertainty budgets per (service group, technique)
    #[serde(default = "default_uncertainty_budgets")]
    pub uncertainty_budgets: LookupEndpoint,

    /// Capabilities per (technique, certification)
    #[serde(default = "default_capabilities")]
    pub capabilities: LookupEndpoint,

    /// Uncertainty components per uncertainty budget
    #[serde(default = "default_uncertainty_components")]
    pub uncertainty_components: DetailEndpoint,

    /// Certification ids crossed with techniques for the capabilities job (default: [284])
    #[serde(default = "default_certification_ids")]
    pub certification_ids: Vec<i64>,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            service_capabilities: default_service_capabilities(),
            techniques: default_techniques(),
            uncertainty_budgets: default_uncertainty_budgets(),
            capabilities: default_capabilities(),
            uncertainty_components: default_uncertainty_components(),
            certification_ids: default_certification_ids(),
        }
    }
}

fn default_base_url() -> String {
    "https://jgiquality.qualer.com".into()
}

fn default_login_path() -> String {
    "/login".into()
}

fn default_login_marker() -> String {
    "login".into()
}

fn default_username_env() -> String {
    "QUALER_USERNAME".into()
}

fn default_password_env() -> String {
    "QUALER_PASSWORD".into()
}

fn default_username_field() -> String {
    "Email".into()
}

fn default_password_field() -> String {
    "Password".into()
}

fn default_token_field() -> String {
    "__RequestVerificationToken".into()
}

fn default_navigation_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_user_agent() -> String {
    format!("qualer-dl/{}", env!("CARGO_PKG_VERSION"))
}

fn default_headers() -> HashMap<String, String> {
    HashMap::from([
        ("accept".to_string(), "application/json".to_string()),
        ("x-requested-with".to_string(), "XMLHttpRequest".to_string()),
    ])
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    1.0
}

fn default_workers() -> usize {
    10
}

fn default_csv_dir() -> PathBuf {
    PathBuf::from("./csv")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./qualer.db")
}

fn default_chunk_size() -> usize {
    500
}

fn grid_query() -> Vec<(String, String)> {
    vec![
        ("sort".into(), String::new()),
        ("group".into(), String::new()),
        ("filter".into(), String::new()),
    ]
}

fn default_service_capabilities() -> ListEndpoint {
    ListEndpoint {
        path: "/ServiceType/ServiceCapabilities".into(),
        array_key: "views".into(),
        id_field: "ServiceGroupId".into(),
    }
}

fn default_techniques() -> FlatEndpoint {
    FlatEndpoint {
        path: "/ServiceGroupTechnique/TechniquesList".into(),
        id_field: "TechniqueId".into(),
    }
}

fn default_uncertainty_budgets() -> LookupEndpoint {
    LookupEndpoint {
        path: "/ServiceGroupTechnique/UncertaintyBudgets".into(),
        static_query: grid_query(),
        dim_a: "serviceGroupId".into(),
        dim_b: "techniqueId".into(),
        array_key: "Data".into(),
    }
}

fn default_capabilities() -> LookupEndpoint {
    LookupEndpoint {
        path: "/CertificationCapability/Capabilities_Read".into(),
        static_query: grid_query(),
        dim_a: "techniqueId".into(),
        dim_b: "certificationId".into(),
        array_key: "Data".into(),
    }
}

fn default_uncertainty_components() -> DetailEndpoint {
    DetailEndpoint {
        path: "/UncertaintyComponent/List".into(),
        id_param: "UncertaintyBudgetId".into(),
        array_key: "uncertaintyComponents".into(),
    }
}

fn default_certification_ids() -> Vec<i64> {
    vec![284]
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
