//! Model → provider routing.
//!
//! The table is built once at startup and never mutated, so request tasks
//! share it behind an `Arc` without locking. Lookups are linear scans; a
//! gateway routes tens of models, not thousands.

use std::fmt;
use std::time::Duration;

use crate::codec::Dialect;
use crate::config::{GatewayConfig, ProviderConfig};
use crate::error::Result;

/// One `model → provider` mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub model: String,
    pub provider: String,
}

impl RouteEntry {
    pub fn new(model: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            provider: provider.into(),
        }
    }
}

/// Everything needed to reach one upstream.
#[derive(Clone)]
pub struct ProviderDescriptor {
    pub name: String,
    pub base_url: String,
    pub credential: Option<String>,
    pub timeout: Duration,
    pub dialect: Dialect,
}

impl ProviderDescriptor {
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        Ok(Self {
            name: config.name.clone(),
            base_url: config.effective_base_url()?,
            credential: config.resolve_credential()?,
            timeout: config.effective_timeout(),
            dialect: config.effective_dialect(),
        })
    }
}

impl fmt::Debug for ProviderDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderDescriptor")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .field("dialect", &self.dialect)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    routes: Vec<RouteEntry>,
    providers: Vec<ProviderDescriptor>,
}

impl RoutingTable {
    pub fn new(routes: Vec<RouteEntry>, providers: Vec<ProviderDescriptor>) -> Self {
        Self { routes, providers }
    }

    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let providers = config
            .providers
            .iter()
            .map(ProviderDescriptor::from_config)
            .collect::<Result<Vec<_>>>()?;

        let routes = config
            .routes
            .iter()
            .map(|r| RouteEntry::new(&r.model, &r.provider))
            .collect();

        let table = Self::new(routes, providers);
        for route in table.dangling_routes() {
            tracing::warn!(
                model = %route.model,
                provider = %route.provider,
                "Route names an unknown provider; requests for this model will fail"
            );
        }
        Ok(table)
    }

    /// Routes whose provider is not in the table.
    pub fn dangling_routes(&self) -> impl Iterator<Item = &RouteEntry> {
        self.routes
            .iter()
            .filter(|r| self.resolve_descriptor(&r.provider).is_none())
    }

    /// Provider serving `model`. The first matching entry wins.
    pub fn resolve_provider(&self, model: &str) -> Option<&str> {
        self.routes
            .iter()
            .find(|r| r.model == model)
            .map(|r| r.provider.as_str())
    }

    pub fn resolve_descriptor(&self, provider: &str) -> Option<&ProviderDescriptor> {
        self.providers.iter().find(|p| p.name == provider)
    }

    /// `(model, provider)` for every model a request can actually reach:
    /// shadowed duplicates and dangling routes are left out.
    pub fn models(&self) -> Vec<(&str, &str)> {
        let mut out: Vec<(&str, &str)> = Vec::with_capacity(self.routes.len());
        for route in &self.routes {
            if out.iter().any(|(model, _)| *model == route.model) {
                continue;
            }
            if self.resolve_descriptor(&route.provider).is_some() {
                out.push((route.model.as_str(), route.provider.as_str()));
            }
        }
        out
    }

    pub fn routes(&self) -> &[RouteEntry] {
        &self.routes
    }

    pub fn providers(&self) -> &[ProviderDescriptor] {
        &self.providers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    /// Log output captured from a scoped subscriber.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    fn descriptor(name: &str) -> ProviderDescriptor {
        ProviderDescriptor {
            name: name.to_string(),
            base_url: format!("https://{name}.example.com"),
            credential: Some("sk-secret".to_string()),
            timeout: Duration::from_secs(30),
            dialect: Dialect::OpenAi,
        }
    }

    fn table() -> RoutingTable {
        RoutingTable::new(
            vec![
                RouteEntry::new("gpt-4", "openai-prod"),
                RouteEntry::new("claude-3", "anthropic"),
                RouteEntry::new("gpt-4", "backup"),
                RouteEntry::new("orphan", "ghost"),
            ],
            vec![
                descriptor("openai-prod"),
                descriptor("anthropic"),
                descriptor("backup"),
            ],
        )
    }

    #[test]
    fn test_resolve_provider() {
        let table = table();
        assert_eq!(table.resolve_provider("claude-3"), Some("anthropic"));
        assert_eq!(table.resolve_provider("llama-70b"), None);
    }

    #[test]
    fn test_first_match_wins() {
        assert_eq!(table().resolve_provider("gpt-4"), Some("openai-prod"));
    }

    #[test]
    fn test_resolve_descriptor() {
        let table = table();
        let desc = table.resolve_descriptor("openai-prod").unwrap();
        assert_eq!(desc.base_url, "https://openai-prod.example.com");
        assert!(table.resolve_descriptor("ghost").is_none());
    }

    #[test]
    fn test_models_lists_only_reachable_routes() {
        assert_eq!(
            table().models(),
            vec![("gpt-4", "openai-prod"), ("claude-3", "anthropic")]
        );
    }

    #[test]
    fn test_debug_never_prints_credential() {
        let debug = format!("{:?}", descriptor("openai-prod"));
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("openai-prod"));
    }

    #[test]
    fn test_from_config() {
        let config = GatewayConfig::from_yaml(
            r#"
providers:
  - {name: openai, api_key: sk-1, timeout: 5}
  - {name: local, base_url: "http://localhost:8000", dialect: anthropic}
routes:
  - {model: gpt-4o, provider: openai}
  - {model: local-model, provider: local}
"#,
        )
        .unwrap();

        let table = RoutingTable::from_config(&config).unwrap();
        assert_eq!(table.routes().len(), 2);

        let openai = table.resolve_descriptor("openai").unwrap();
        assert_eq!(openai.base_url, "https://api.openai.com");
        assert_eq!(openai.credential.as_deref(), Some("sk-1"));
        assert_eq!(openai.timeout, Duration::from_secs(5));

        let local = table.resolve_descriptor("local").unwrap();
        assert_eq!(local.dialect, Dialect::Anthropic);
        assert_eq!(table.resolve_provider("local-model"), Some("local"));
    }

    #[test]
    fn test_dangling_routes() {
        let table = table();
        let dangling: Vec<&RouteEntry> = table.dangling_routes().collect();
        assert_eq!(dangling, vec![&RouteEntry::new("orphan", "ghost")]);
    }

    #[test]
    fn test_from_config_warns_about_dangling_route() {
        let config = GatewayConfig::from_yaml(
            r#"
providers: [{name: p, base_url: "http://h"}]
routes:
  - {model: m, provider: p}
  - {model: orphan, provider: ghost}
"#,
        )
        .unwrap();

        let logs = Captured::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();

        let table = tracing::subscriber::with_default(subscriber, || {
            RoutingTable::from_config(&config)
        })
        .unwrap();

        assert_eq!(table.resolve_provider("orphan"), Some("ghost"));
        let text = logs.text();
        assert!(text.contains("WARN"), "{text}");
        assert!(text.contains("Route names an unknown provider"), "{text}");
        assert!(text.contains("orphan") && text.contains("ghost"), "{text}");
    }
}
