use crate::codec::Dialect;
use crate::error::{GatewayError, Result};
use crate::providers::ProviderPreset;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "unified-gateway";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Largest accepted request body. Unset means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_body_bytes: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_bytes: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffKind,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffKind::default(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Linear,
    Exponential,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// Per-call timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dialect: Option<Dialect>,
}

// Hand-written so an inline `api_key` never reaches a log line.
impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_key_env", &self.api_key_env)
            .field("timeout", &self.timeout)
            .field("dialect", &self.dialect)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub model: String,
    pub provider: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

impl GatewayConfig {
    /// Load and validate a config file. `.toml` files are parsed as TOML,
    /// everything else as YAML.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

        if is_toml {
            Self::from_toml(&content)
        } else {
            Self::from_yaml(&content)
        }
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.finish()
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.finish()
    }

    /// Search standard locations for a config file and load it.
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        Self::load(&Self::locate(explicit_path)?)
    }

    /// Config file to load.
    /// Priority: CLI arg > CWD > XDG config > home dir
    pub fn locate(explicit_path: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit_path {
            return Ok(path.to_path_buf());
        }

        let candidates = config_search_paths();
        if let Some(found) = candidates.iter().find(|c| c.exists()) {
            return Ok(found.clone());
        }

        Err(GatewayError::config(format!(
            "No config file found. Searched: {}",
            candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )))
    }

    fn finish(mut self) -> Result<Self> {
        if self.server.port == 0 {
            self.server.port = default_port();
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject configurations the gateway cannot serve.
    pub fn validate(&self) -> Result<()> {
        if self.providers.is_empty() {
            return Err(GatewayError::config("no providers configured"));
        }
        if self.routes.is_empty() {
            return Err(GatewayError::config("no routes configured"));
        }
        if self.retry.max_attempts == 0 {
            return Err(GatewayError::config("retry.max_attempts must be at least 1"));
        }

        let mut names = HashSet::new();
        for provider in &self.providers {
            if !names.insert(provider.name.as_str()) {
                return Err(GatewayError::config(format!(
                    "duplicate provider '{}'",
                    provider.name
                )));
            }
            if provider.timeout == Some(0) {
                return Err(GatewayError::config(format!(
                    "provider '{}': timeout must be greater than zero",
                    provider.name
                )));
            }
            provider.effective_base_url()?;
            provider.resolve_credential()?;
        }

        let mut models = HashSet::new();
        for route in &self.routes {
            if !models.insert(route.model.as_str()) {
                return Err(GatewayError::config(format!(
                    "model '{}' is routed more than once",
                    route.model
                )));
            }
        }

        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl ProviderConfig {
    fn preset(&self) -> Option<&'static ProviderPreset> {
        ProviderPreset::from_name(&self.name)
    }

    /// Resolve the effective base URL (config override or provider preset default)
    pub fn effective_base_url(&self) -> Result<String> {
        if let Some(ref url) = self.base_url {
            return Ok(url.clone());
        }

        let preset = self.preset().ok_or_else(|| {
            GatewayError::config(format!(
                "Unknown provider '{}' and no base_url configured. Known providers: {}",
                self.name,
                ProviderPreset::names().join(", ")
            ))
        })?;

        Ok(preset.base_url.to_string())
    }

    pub fn effective_dialect(&self) -> Dialect {
        self.dialect
            .or_else(|| self.preset().map(|p| p.dialect))
            .unwrap_or_default()
    }

    pub fn effective_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS))
    }

    /// Inline key first, then the named environment variable. A preset's
    /// default variable is optional; an explicitly named one must be set.
    pub fn resolve_credential(&self) -> Result<Option<String>> {
        if let Some(ref key) = self.api_key {
            return Ok(Some(key.clone()));
        }

        if let Some(ref var) = self.api_key_env {
            return std::env::var(var).map(Some).map_err(|_| {
                GatewayError::config(format!(
                    "provider '{}': environment variable '{}' not set",
                    self.name, var
                ))
            });
        }

        Ok(self
            .preset()
            .and_then(|p| std::env::var(p.default_api_key_env).ok()))
    }
}

pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from("unified-gateway.yaml"),
        PathBuf::from("unified-gateway.toml"),
        PathBuf::from("config.yaml"),
    ];

    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        paths.push(PathBuf::from(xdg).join(APP_DIR).join("config.yaml"));
    }
    if let Some(home) = home_dir() {
        paths.push(home.join(".config").join(APP_DIR).join("config.yaml"));
    }

    paths
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const YAML: &str = r#"
server:
  port: 9090
logging:
  level: debug
  format: json
retry:
  max_attempts: 5
  backoff: exponential
providers:
  - name: openai-prod
    base_url: https://api.openai.com
    api_key: sk-test
    timeout: 10
  - name: anthropic
routes:
  - model: gpt-4
    provider: openai-prod
  - model: claude-3-5-sonnet
    provider: anthropic
"#;

    fn write_temp(suffix: &str, content: &str) -> NamedTempFile {
        let mut f = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        write!(f, "{content}").unwrap();
        f
    }

    #[test]
    fn test_load_yaml_config() {
        let f = write_temp(".yaml", YAML);
        let config = GatewayConfig::load(f.path()).unwrap();

        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.backoff, BackoffKind::Exponential);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.routes[1].provider, "anthropic");

        let openai = &config.providers[0];
        assert_eq!(openai.effective_timeout(), Duration::from_secs(10));
        assert_eq!(openai.resolve_credential().unwrap().as_deref(), Some("sk-test"));

        let anthropic = &config.providers[1];
        assert_eq!(anthropic.effective_dialect(), Dialect::Anthropic);
        assert_eq!(
            anthropic.effective_base_url().unwrap(),
            "https://api.anthropic.com"
        );
        assert_eq!(
            anthropic.effective_timeout(),
            Duration::from_secs(DEFAULT_TIMEOUT_SECS)
        );
    }

    #[test]
    fn test_load_toml_config() {
        let f = write_temp(
            ".toml",
            r#"
[server]
host = "127.0.0.1"

[[providers]]
name = "local"
base_url = "http://localhost:11434"
dialect = "openai"

[[routes]]
model = "llama3"
provider = "local"
"#,
        );

        let config = GatewayConfig::load(f.path()).unwrap();
        assert_eq!(config.bind_address(), "127.0.0.1:8080");
        assert_eq!(config.providers[0].effective_dialect(), Dialect::OpenAi);
        assert!(config.providers[0].resolve_credential().unwrap().is_none());
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_port_zero_means_default() {
        let config = GatewayConfig::from_yaml(
            r#"
server: {port: 0}
providers: [{name: p, base_url: "http://h"}]
routes: [{model: m, provider: p}]
"#,
        )
        .unwrap();
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_rejects_empty_providers_and_routes() {
        let err = GatewayConfig::from_yaml("routes: [{model: m, provider: p}]").unwrap_err();
        assert!(err.to_string().contains("no providers"));

        let err =
            GatewayConfig::from_yaml(r#"providers: [{name: p, base_url: "http://h"}]"#).unwrap_err();
        assert!(err.to_string().contains("no routes"));
    }

    #[test]
    fn test_rejects_duplicate_route_models() {
        let err = GatewayConfig::from_yaml(
            r#"
providers: [{name: a, base_url: "http://a"}, {name: b, base_url: "http://b"}]
routes:
  - {model: gpt-4, provider: a}
  - {model: gpt-4, provider: b}
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("gpt-4"));
    }

    #[test]
    fn test_rejects_duplicate_provider_names() {
        let err = GatewayConfig::from_yaml(
            r#"
providers: [{name: a, base_url: "http://a"}, {name: a, base_url: "http://b"}]
routes: [{model: m, provider: a}]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate provider"));
    }

    #[test]
    fn test_rejects_unknown_provider_without_base_url() {
        let err = GatewayConfig::from_yaml(
            r#"
providers: [{name: my-vllm}]
routes: [{model: m, provider: my-vllm}]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("no base_url"));
    }

    #[test]
    fn test_rejects_zero_timeout_and_attempts() {
        let err = GatewayConfig::from_yaml(
            r#"
providers: [{name: p, base_url: "http://h", timeout: 0}]
routes: [{model: m, provider: p}]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("timeout"));

        let err = GatewayConfig::from_yaml(
            r#"
retry: {max_attempts: 0}
providers: [{name: p, base_url: "http://h"}]
routes: [{model: m, provider: p}]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_attempts"));
    }

    #[test]
    fn test_missing_api_key_env_fails() {
        let err = GatewayConfig::from_yaml(
            r#"
providers: [{name: p, base_url: "http://h", api_key_env: UNIFIED_GATEWAY_TEST_UNSET_KEY}]
routes: [{model: m, provider: p}]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("UNIFIED_GATEWAY_TEST_UNSET_KEY"));
    }

    #[test]
    fn test_api_key_env_is_read() {
        std::env::set_var("UNIFIED_GATEWAY_TEST_SET_KEY", "sk-from-env");
        let config = GatewayConfig::from_yaml(
            r#"
providers: [{name: p, base_url: "http://h", api_key_env: UNIFIED_GATEWAY_TEST_SET_KEY}]
routes: [{model: m, provider: p}]
"#,
        )
        .unwrap();
        assert_eq!(
            config.providers[0].resolve_credential().unwrap().as_deref(),
            Some("sk-from-env")
        );
    }

    #[test]
    fn test_dangling_route_is_accepted() {
        let config = tokio_test::assert_ok!(GatewayConfig::from_yaml(
            r#"
providers: [{name: p, base_url: "http://h"}]
routes: [{model: m, provider: ghost}]
"#,
        ));
        assert_eq!(config.routes[0].provider, "ghost");
    }

    #[test]
    fn test_debug_redacts_inline_key() {
        let provider = ProviderConfig {
            name: "p".to_string(),
            base_url: None,
            api_key: Some("sk-secret".to_string()),
            api_key_env: None,
            timeout: None,
            dialect: None,
        };
        let debug = format!("{provider:?}");
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_explicit_missing_path_is_config_error() {
        let err = tokio_test::assert_err!(GatewayConfig::find_and_load(Some(Path::new(
            "/nonexistent/gw.yaml"
        ))));
        assert!(matches!(err, GatewayError::Config { .. }));
    }

    #[test]
    fn test_search_paths_start_in_cwd() {
        let paths = config_search_paths();
        assert_eq!(paths[0], PathBuf::from("unified-gateway.yaml"));
        assert_eq!(paths[1], PathBuf::from("unified-gateway.toml"));
    }
}
