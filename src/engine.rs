//! Filtering engine lifecycle
//!
//! The engine owns its tokio runtime, the rule store, the root CA and the
//! option/category toggles. `start` binds both listeners and spawns one
//! accept loop per listener; `stop` broadcasts shutdown, waits up to the
//! configured timeout for connections to finish, then aborts the rest.

use crate::callbacks::{EngineCallbacks, EventReporter, ListenerKind};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::filtering::{Category, EngineOption, EngineToggles, LoadCounts, RuleCounts, RuleStore};
use crate::mitm::{
    CaConfig, CacheStats, CertificateAuthority, MitmInterceptor, RootCa, TlsVersion,
    UpstreamTlsConfig,
};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Handles of a started engine
struct Running {
    shutdown: watch::Sender<bool>,
    accept_loops: Vec<JoinHandle<()>>,
    http_port: u16,
    https_port: u16,
}

pub struct FilteringEngine {
    config: EngineConfig,
    store: Arc<RuleStore>,
    toggles: Arc<EngineToggles>,
    reporter: Arc<EventReporter>,
    ca: Arc<CertificateAuthority>,
    interceptor: Arc<MitmInterceptor>,
    runtime: Option<Runtime>,
    running: Mutex<Option<Running>>,
}

impl FilteringEngine {
    /// Build an engine; nothing is bound until [`FilteringEngine::start`]
    ///
    /// Unusable CA material, an unreadable CA bundle or a runtime that cannot
    /// be built are configuration errors.
    pub fn new(config: EngineConfig, callbacks: EngineCallbacks) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads())
            .thread_name("filterproxy-worker")
            .enable_all()
            .build()
            .map_err(|e| EngineError::configuration(format!("Failed to build runtime: {}", e)))?;

        let root = match (&config.ca_cert_path, &config.ca_key_path) {
            (Some(cert), Some(key)) => RootCa::from_files(cert, key),
            (None, None) => RootCa::generate(&CaConfig::default()),
            _ => {
                return Err(EngineError::configuration(
                    "CA certificate and key paths must be given together",
                ))
            }
        }
        .map_err(|e| EngineError::configuration(e.to_string()))?;

        let upstream_tls = match &config.ca_bundle_path {
            Some(path) => UpstreamTlsConfig::from_ca_bundle(path, TlsVersion::default()),
            None => UpstreamTlsConfig::new(TlsVersion::default()),
        }
        .map_err(|e| EngineError::configuration(e.to_string()))?;

        let ca = Arc::new(CertificateAuthority::new(
            Arc::new(root),
            config.cert_cache_size,
            config.leaf_validity_days,
        ));
        let store = Arc::new(RuleStore::new());
        let toggles = Arc::new(EngineToggles::new(config.options));
        let reporter = Arc::new(EventReporter::new(callbacks));

        let interceptor = Arc::new(MitmInterceptor::new(
            Arc::clone(&ca),
            &upstream_tls,
            Arc::clone(&store),
            Arc::clone(&toggles),
            Arc::clone(&reporter),
            config.interceptor_settings(),
        ));

        info!(
            http_port = config.http_port,
            https_port = config.https_port,
            worker_threads = config.worker_threads(),
            "Filtering engine created"
        );

        Ok(Self {
            config,
            store,
            toggles,
            reporter,
            ca,
            interceptor,
            runtime: Some(runtime),
            running: Mutex::new(None),
        })
    }

    /// Bind both listeners and start accepting; a no-op when already running
    pub fn start(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }
        let runtime = self.runtime.as_ref().ok_or(EngineError::NotRunning)?;

        let http = bind(&self.config.bind_host, self.config.http_port)?;
        let https = bind(&self.config.bind_host, self.config.https_port)?;
        let http_port = http.local_addr()?.port();
        let https_port = https.local_addr()?.port();

        // from_std needs the reactor of the runtime the listeners will live on
        let _guard = runtime.enter();
        let http = TcpListener::from_std(http)?;
        let https = TcpListener::from_std(https)?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let drain = self.config.shutdown_timeout;
        let accept_loops = vec![
            runtime.spawn(accept_loop(
                http,
                ListenerKind::Http,
                Arc::clone(&self.interceptor),
                shutdown_rx.clone(),
                drain,
            )),
            runtime.spawn(accept_loop(
                https,
                ListenerKind::Https,
                Arc::clone(&self.interceptor),
                shutdown_rx,
                drain,
            )),
        ];

        *running = Some(Running {
            shutdown,
            accept_loops,
            http_port,
            https_port,
        });

        self.reporter.info(&format!(
            "Engine started: HTTP on {}:{}, HTTPS on {}:{}",
            self.config.bind_host, http_port, self.config.bind_host, https_port
        ));
        Ok(())
    }

    /// Stop accepting and close every connection; a no-op when stopped
    pub fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        let Some(runtime) = self.runtime.as_ref() else {
            return;
        };

        let _ = running.shutdown.send(true);
        let loops = running.accept_loops;
        let wait = async move {
            for handle in loops {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Accept loop ended abnormally");
                }
            }
        };

        // block_on panics on a runtime thread; wait from a plain thread instead
        if tokio::runtime::Handle::try_current().is_ok() {
            std::thread::scope(|scope| {
                scope.spawn(|| runtime.block_on(wait));
            });
        } else {
            runtime.block_on(wait);
        }

        self.reporter.info("Engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Bound port while running, configured port otherwise
    pub fn http_listener_port(&self) -> u16 {
        self.running
            .lock()
            .as_ref()
            .map_or(self.config.http_port, |r| r.http_port)
    }

    /// Bound port while running, configured port otherwise
    pub fn https_listener_port(&self) -> u16 {
        self.running
            .lock()
            .as_ref()
            .map_or(self.config.https_port, |r| r.https_port)
    }

    pub fn option_enabled(&self, option: EngineOption) -> bool {
        self.toggles.option_enabled(option)
    }

    pub fn set_option_enabled(&self, option: EngineOption, enabled: bool) {
        self.toggles.set_option_enabled(option, enabled);
    }

    pub fn category_enabled(&self, category: Category) -> bool {
        self.toggles.category_enabled(category)
    }

    pub fn set_category_enabled(&self, category: Category, enabled: bool) {
        self.toggles.set_category_enabled(category, enabled);
    }

    pub fn load_filtering_list_from_string(
        &self,
        text: &str,
        category: Category,
        flush: bool,
    ) -> LoadCounts {
        let counts = self.store.load_filter_list(text, category, flush);
        self.report_load("filter list", category, counts);
        counts
    }

    pub fn load_filtering_list_from_file(
        &self,
        path: impl AsRef<Path>,
        category: Category,
        flush: bool,
    ) -> Result<LoadCounts> {
        let counts = self.store.load_filter_list_file(path, category, flush)?;
        self.report_load("filter list", category, counts);
        Ok(counts)
    }

    pub fn load_text_triggers_from_string(
        &self,
        text: &str,
        category: Category,
        flush: bool,
    ) -> LoadCounts {
        let counts = self.store.load_text_triggers(text, category, flush);
        self.report_load("text triggers", category, counts);
        counts
    }

    pub fn load_text_triggers_from_file(
        &self,
        path: impl AsRef<Path>,
        category: Category,
        flush: bool,
    ) -> Result<LoadCounts> {
        let counts = self.store.load_text_triggers_file(path, category, flush)?;
        self.report_load("text triggers", category, counts);
        Ok(counts)
    }

    pub fn unload_rules_for_category(&self, category: Category) {
        self.store.unload(category);
        debug!(category = category.id(), "Rules unloaded");
    }

    pub fn rule_counts(&self, category: Category) -> Option<RuleCounts> {
        self.store.rule_counts(category)
    }

    /// PEM of the root clients must trust
    pub fn root_certificate_pem(&self) -> &str {
        self.ca.root().pem()
    }

    pub fn certificate_cache_stats(&self) -> Option<CacheStats> {
        let runtime = self.runtime.as_ref()?;
        let ca = Arc::clone(&self.ca);
        let stats = async move { ca.cache_stats().await };
        if tokio::runtime::Handle::try_current().is_ok() {
            std::thread::scope(|scope| scope.spawn(|| runtime.block_on(stats)).join().ok())
        } else {
            Some(runtime.block_on(stats))
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn reporter(&self) -> &EventReporter {
        &self.reporter
    }

    fn report_load(&self, kind: &str, category: Category, counts: LoadCounts) {
        self.reporter.info(&format!(
            "Loaded {} for {}: {} rules, {} failed",
            kind, category, counts.loaded, counts.failed
        ));
    }
}

impl Drop for FilteringEngine {
    fn drop(&mut self) {
        self.stop();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for FilteringEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilteringEngine")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

fn bind(host: &str, port: u16) -> Result<std::net::TcpListener> {
    let listener = std::net::TcpListener::bind((host, port)).map_err(|e| {
        EngineError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to bind {}:{}: {}", host, port, e),
        ))
    })?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

async fn accept_loop(
    listener: TcpListener,
    kind: ListenerKind,
    interceptor: Arc<MitmInterceptor>,
    mut shutdown: watch::Receiver<bool>,
    drain: Duration,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accept = listener.accept() => {
                let (stream, peer): (_, SocketAddr) = match accept {
                    Ok(tuple) => tuple,
                    Err(e) => {
                        warn!(listener = ?kind, error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                };

                let interceptor = Arc::clone(&interceptor);
                let mut stop = shutdown.clone();
                connections.spawn(async move {
                    tokio::select! {
                        _ = interceptor.handle_connection(stream, peer, kind) => {}
                        _ = stop.wait_for(|stopping| *stopping) => {
                            debug!(peer = %peer, "Connection closed by shutdown");
                        }
                    }
                });
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    drop(listener);

    let drained = timeout(drain, async {
        while connections.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(
            listener = ?kind,
            remaining = connections.len(),
            "Aborting connections after shutdown timeout"
        );
        connections.abort_all();
        while connections.join_next().await.is_some() {}
    }

    debug!(listener = ?kind, "Accept loop stopped");
}
