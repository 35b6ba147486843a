//! User configuration for tollgate.
//!
//! # Resolution
//!
//! [`Config::resolve`] loads the first file it finds:
//!
//! 1. An explicit path (usually from `--config`)
//! 2. The `TOLLGATE_CONFIG_PATH` environment variable
//! 3. `tollgate/config.toml` in the user's config directory
//!
//! A missing file is not an error; every setting has a default.
//!
//! # Example
//!
//! ```toml
//! [openai]
//! model = "gpt-4o"
//! api_key_env = "OPENAI_API_KEY"
//!
//! [mcp]
//! url = "http://localhost:8080/mcp"
//! session_id = "abc123"
//!
//! [policy]
//! namespace_delimiter = "_"
//! host_limits = [{ tool = "fetch", max_calls_per_host = 3 }]
//!
//! [tools]
//! timeout_secs = 60
//! exclude = ["notion_query_database"]
//! ```

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::policy::{
    DEFAULT_NAMESPACE_DELIMITER, PolicyEnforcer, PolicyError, limits::HostCallLimit,
};

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "TOLLGATE_CONFIG_PATH";

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// I/O error when reading a config file.
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error when a config file is malformed.
    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub openai: OpenAiSettings,
    #[serde(default)]
    pub mcp: McpSettings,
    #[serde(default)]
    pub policy: PolicySettings,
    #[serde(default)]
    pub tools: ToolSettings,
}

/// Chat-completions provider settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpenAiSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            model: default_model(),
            temperature: None,
        }
    }
}

impl OpenAiSettings {
    /// Provider parameters sent with every completion request.
    pub fn request_params(&self) -> Map<String, Value> {
        let mut params = Map::new();
        params.insert("model".to_owned(), Value::from(self.model.clone()));
        if let Some(temperature) = self.temperature {
            params.insert("temperature".to_owned(), Value::from(f64::from(temperature)));
        }
        params
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_owned()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_owned()
}

fn default_model() -> String {
    "gpt-4o".to_owned()
}

/// Remote MCP tool server settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct McpSettings {
    /// Streamable HTTP endpoint. No MCP backend is used when unset.
    #[serde(default)]
    pub url: Option<String>,
    /// Sent as the `sessionId` cookie.
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default = "default_profile")]
    pub profile: String,
    /// Extra request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Default for McpSettings {
    fn default() -> Self {
        Self {
            url: None,
            session_id: None,
            profile: default_profile(),
            headers: BTreeMap::new(),
        }
    }
}

fn default_profile() -> String {
    "default".to_owned()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicySettings {
    #[serde(default = "default_delimiter")]
    pub namespace_delimiter: char,
    #[serde(default)]
    pub host_limits: Vec<HostLimitSettings>,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            namespace_delimiter: DEFAULT_NAMESPACE_DELIMITER,
            host_limits: Vec::new(),
        }
    }
}

fn default_delimiter() -> char {
    DEFAULT_NAMESPACE_DELIMITER
}

/// A [`HostCallLimit`] declared in config.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostLimitSettings {
    /// Bare tool name (without namespace).
    pub tool: String,
    pub max_calls_per_host: u64,
    /// Argument holding the URL. Defaults to `url`.
    #[serde(default)]
    pub argument: Option<String>,
}

impl PolicySettings {
    /// Builds an enforcer with the configured delimiter and policies.
    pub fn enforcer(&self) -> Result<PolicyEnforcer, PolicyError> {
        let mut enforcer = PolicyEnforcer::with_delimiter(self.namespace_delimiter);
        for limit in &self.host_limits {
            let mut policy = HostCallLimit::new(&limit.tool, limit.max_calls_per_host);
            if let Some(argument) = &limit.argument {
                policy = policy.with_argument(argument);
            }
            policy.install(&mut enforcer)?;
        }
        Ok(enforcer)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSettings {
    /// Per-call timeout for backend tool execution.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Tool names hidden from the model.
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl ToolSettings {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        self.exclude.iter().any(|excluded| excluded == name)
    }
}

impl Config {
    /// Loads the first config found in resolution order, or defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
            return Self::load(Path::new(&path));
        }
        match default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Loads `path`, returning defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// `tollgate/config.toml` in the user's config directory.
pub fn default_path() -> Option<PathBuf> {
    Some(dirs::config_dir()?.join("tollgate").join("config.toml"))
}
