use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::filtering::{Category, EngineOption, OptionSet};
use crate::mitm::InterceptorSettings;

/// A list file to load at startup, tagged with its category
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListSource {
    pub category: Category,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    // Listeners
    pub bind_host: String,
    pub http_port: u16,
    pub https_port: u16,

    // Worker threads; 0 uses the available parallelism
    pub num_threads: usize,

    // Upstream verification roots; webpki roots when unset
    pub ca_bundle_path: Option<PathBuf>,

    // Root CA material; generated when unset
    pub ca_cert_path: Option<PathBuf>,
    pub ca_key_path: Option<PathBuf>,

    // Leaf certificates
    pub cert_cache_size: usize,
    pub leaf_validity_days: u32,

    // Timeouts
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub shutdown_timeout: Duration,

    // Largest HTML body buffered for filtering
    pub max_filter_body: usize,

    // Options enabled at construction
    pub options: OptionSet,

    // Lists loaded by the daemon at startup
    pub filter_lists: Vec<ListSource>,
    pub trigger_lists: Vec<ListSource>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            http_port: 8080,
            https_port: 8443,
            num_threads: 0,
            ca_bundle_path: None,
            ca_cert_path: None,
            ca_key_path: None,
            cert_cache_size: 10_000,
            leaf_validity_days: 365,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
            max_filter_body: 10 * 1024 * 1024,
            options: [EngineOption::InterceptTls, EngineOption::ElementHiding]
                .into_iter()
                .collect(),
            filter_lists: Vec::new(),
            trigger_lists: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present

        let defaults = Self::default();

        let bind_host = env::var("FILTER_BIND_HOST").unwrap_or(defaults.bind_host);
        let http_port = parse_var("FILTER_HTTP_PORT", defaults.http_port)?;
        let https_port = parse_var("FILTER_HTTPS_PORT", defaults.https_port)?;
        let num_threads = parse_var("FILTER_THREADS", defaults.num_threads)?;

        let ca_bundle_path = path_var("FILTER_CA_BUNDLE");
        let ca_cert_path = path_var("FILTER_CA_CERT");
        let ca_key_path = path_var("FILTER_CA_KEY");
        if ca_cert_path.is_some() != ca_key_path.is_some() {
            return Err(anyhow!(
                "FILTER_CA_CERT and FILTER_CA_KEY must be set together"
            ));
        }

        let cert_cache_size = parse_var("FILTER_CERT_CACHE_SIZE", defaults.cert_cache_size)?;
        let leaf_validity_days =
            parse_var("FILTER_LEAF_VALIDITY_DAYS", defaults.leaf_validity_days)?;
        if leaf_validity_days == 0 {
            return Err(anyhow!("FILTER_LEAF_VALIDITY_DAYS must be at least 1"));
        }

        let connect_timeout = Duration::from_secs(parse_var(
            "FILTER_CONNECT_TIMEOUT_SECONDS",
            defaults.connect_timeout.as_secs(),
        )?);
        let read_timeout = Duration::from_secs(parse_var(
            "FILTER_READ_TIMEOUT_SECONDS",
            defaults.read_timeout.as_secs(),
        )?);
        let shutdown_timeout = Duration::from_secs(parse_var(
            "FILTER_SHUTDOWN_TIMEOUT_SECONDS",
            defaults.shutdown_timeout.as_secs(),
        )?);
        let max_filter_body = parse_var("FILTER_MAX_BODY_BYTES", defaults.max_filter_body)?;

        let mut options = defaults.options;
        for (name, option) in [
            ("FILTER_INTERCEPT_TLS", EngineOption::InterceptTls),
            ("FILTER_ELEMENT_HIDING", EngineOption::ElementHiding),
            ("FILTER_SCAN_CONTENT", EngineOption::ScanContentTriggers),
            ("FILTER_TUNNEL_ON_FAILURE", EngineOption::TunnelOnInterceptFailure),
        ] {
            options = match bool_var(name)? {
                Some(true) => options.with(option),
                Some(false) => options.without(option),
                None => options,
            };
        }

        let filter_lists = match env::var("FILTER_LISTS") {
            Ok(value) => parse_list_sources(&value).context("Invalid FILTER_LISTS")?,
            Err(_) => Vec::new(),
        };
        let trigger_lists = match env::var("FILTER_TRIGGER_LISTS") {
            Ok(value) => parse_list_sources(&value).context("Invalid FILTER_TRIGGER_LISTS")?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            bind_host,
            http_port,
            https_port,
            num_threads,
            ca_bundle_path,
            ca_cert_path,
            ca_key_path,
            cert_cache_size,
            leaf_validity_days,
            connect_timeout,
            read_timeout,
            shutdown_timeout,
            max_filter_body,
            options,
            filter_lists,
            trigger_lists,
        })
    }

    /// Worker threads after resolving 0 to the available parallelism
    pub fn worker_threads(&self) -> usize {
        if self.num_threads > 0 {
            return self.num_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    pub fn interceptor_settings(&self) -> InterceptorSettings {
        InterceptorSettings {
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            max_filter_body: self.max_filter_body,
        }
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}", name)),
        Err(_) => Ok(default),
    }
}

fn path_var(name: &str) -> Option<PathBuf> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn bool_var(name: &str) -> Result<Option<bool>> {
    let Ok(value) = env::var(name) else {
        return Ok(None);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        other => Err(anyhow!("Invalid {}: {:?} is not a boolean", name, other)),
    }
}

/// Parse `category:path` pairs separated by commas
pub fn parse_list_sources(value: &str) -> Result<Vec<ListSource>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (category, path) = entry
                .split_once(':')
                .ok_or_else(|| anyhow!("expected category:path, got {:?}", entry))?;
            let category: u8 = category
                .trim()
                .parse()
                .with_context(|| format!("invalid category in {:?}", entry))?;
            let path = path.trim();
            if path.is_empty() {
                return Err(anyhow!("missing path in {:?}", entry));
            }
            Ok(ListSource {
                category: Category(category),
                path: PathBuf::from(path),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Global mutex to serialize config tests (env vars are process-global)
    static TEST_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "FILTER_HTTP_PORT",
        "FILTER_HTTPS_PORT",
        "FILTER_CA_CERT",
        "FILTER_CA_KEY",
        "FILTER_SCAN_CONTENT",
        "FILTER_INTERCEPT_TLS",
        "FILTER_LISTS",
        "FILTER_LEAF_VALIDITY_DAYS",
    ];

    fn clear_test_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.cert_cache_size, 10_000);
        assert!(config.options.contains(EngineOption::InterceptTls));
        assert!(config.options.contains(EngineOption::ElementHiding));
        assert!(!config.options.contains(EngineOption::ScanContentTriggers));
        assert!(config.worker_threads() >= 1);
    }

    #[test]
    fn test_config_from_env_overrides() {
        let _lock = TEST_MUTEX.lock().unwrap();
        clear_test_env();
        env::set_var("FILTER_HTTP_PORT", "0");
        env::set_var("FILTER_SCAN_CONTENT", "true");
        env::set_var("FILTER_INTERCEPT_TLS", "off");
        env::set_var("FILTER_LISTS", "1:/tmp/ads.txt, 2:/tmp/social.txt");

        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.http_port, 0);
        assert!(config.options.contains(EngineOption::ScanContentTriggers));
        assert!(!config.options.contains(EngineOption::InterceptTls));
        assert_eq!(config.filter_lists.len(), 2);
        assert_eq!(config.filter_lists[1].category, Category(2));

        clear_test_env();
    }

    #[test]
    fn test_config_from_env_rejects_bad_port() {
        let _lock = TEST_MUTEX.lock().unwrap();
        clear_test_env();
        env::set_var("FILTER_HTTP_PORT", "not-a-port");

        let err = EngineConfig::from_env().unwrap_err().to_string();
        assert!(err.contains("FILTER_HTTP_PORT"), "unexpected error: {}", err);

        clear_test_env();
    }

    #[test]
    fn test_config_from_env_requires_cert_and_key_together() {
        let _lock = TEST_MUTEX.lock().unwrap();
        clear_test_env();
        env::set_var("FILTER_CA_CERT", "/tmp/ca.crt");

        assert!(EngineConfig::from_env().is_err());

        clear_test_env();
    }

    #[test]
    fn test_parse_list_sources() {
        let sources = parse_list_sources("3:/etc/lists/a.txt,,4: b.txt ").unwrap();
        assert_eq!(
            sources,
            vec![
                ListSource {
                    category: Category(3),
                    path: PathBuf::from("/etc/lists/a.txt"),
                },
                ListSource {
                    category: Category(4),
                    path: PathBuf::from("b.txt"),
                },
            ]
        );

        assert!(parse_list_sources("nocategory").is_err());
        assert!(parse_list_sources("300:/a").is_err());
        assert!(parse_list_sources("1:").is_err());
    }
}
