//! Host callbacks and the reporter that fans events out to them
//!
//! Every callback is optional. Events are always logged through `tracing`
//! first, then handed to the host.

use crate::filtering::{Category, ClassifyRequest, ContentVerdict};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub type FirewallFn = Arc<dyn Fn(&FirewallRequest) -> bool + Send + Sync>;
pub type ClassifyFn = Arc<dyn Fn(&ClassifyRequest<'_>) -> ContentVerdict + Send + Sync>;
pub type MessageFn = Arc<dyn Fn(&str) + Send + Sync>;
pub type RequestBlockedFn = Arc<dyn Fn(&BlockedRequest) + Send + Sync>;
pub type ElementsBlockedFn = Arc<dyn Fn(&str, usize) + Send + Sync>;

/// Which listener accepted a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    /// Plain HTTP, including CONNECT
    Http,
    /// Transparent TLS, SNI-addressed
    Https,
}

/// Facts handed to the firewall callback before anything is read
#[derive(Debug, Clone, Copy)]
pub struct FirewallRequest {
    pub peer: SocketAddr,
    pub listener: ListenerKind,
    pub local_port: u16,
}

/// Why a request never reached the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// A network rule matched the request URL
    UrlTrigger,
    /// A content phrase was found in the document text
    ContentTrigger,
    /// The classify callback returned `Block` for an enabled category
    Classification,
}

/// A request answered with the block page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedRequest {
    pub host: String,
    pub url: String,
    pub category: Category,
    /// Rule text that matched; empty for classification blocks
    pub rule: String,
    pub reason: BlockReason,
}

/// Optional host callbacks
#[derive(Clone, Default)]
pub struct EngineCallbacks {
    pub firewall_check: Option<FirewallFn>,
    pub classify: Option<ClassifyFn>,
    pub on_info: Option<MessageFn>,
    pub on_warn: Option<MessageFn>,
    pub on_error: Option<MessageFn>,
    pub on_request_blocked: Option<RequestBlockedFn>,
    pub on_elements_blocked: Option<ElementsBlockedFn>,
}

impl EngineCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_firewall_check(
        mut self,
        f: impl Fn(&FirewallRequest) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.firewall_check = Some(Arc::new(f));
        self
    }

    pub fn with_classify(
        mut self,
        f: impl Fn(&ClassifyRequest<'_>) -> ContentVerdict + Send + Sync + 'static,
    ) -> Self {
        self.classify = Some(Arc::new(f));
        self
    }

    pub fn with_on_info(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_info = Some(Arc::new(f));
        self
    }

    pub fn with_on_warn(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_warn = Some(Arc::new(f));
        self
    }

    pub fn with_on_error(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn with_on_request_blocked(
        mut self,
        f: impl Fn(&BlockedRequest) + Send + Sync + 'static,
    ) -> Self {
        self.on_request_blocked = Some(Arc::new(f));
        self
    }

    pub fn with_on_elements_blocked(
        mut self,
        f: impl Fn(&str, usize) + Send + Sync + 'static,
    ) -> Self {
        self.on_elements_blocked = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for EngineCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineCallbacks")
            .field("firewall_check", &self.firewall_check.is_some())
            .field("classify", &self.classify.is_some())
            .field("on_info", &self.on_info.is_some())
            .field("on_warn", &self.on_warn.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_request_blocked", &self.on_request_blocked.is_some())
            .field("on_elements_blocked", &self.on_elements_blocked.is_some())
            .finish()
    }
}

/// Logs engine events and forwards them to the host callbacks
#[derive(Debug, Clone, Default)]
pub struct EventReporter {
    callbacks: EngineCallbacks,
}

impl EventReporter {
    pub fn new(callbacks: EngineCallbacks) -> Self {
        Self { callbacks }
    }

    pub fn info(&self, message: &str) {
        info!("{}", message);
        if let Some(cb) = &self.callbacks.on_info {
            cb(message);
        }
    }

    pub fn warn(&self, message: &str) {
        warn!("{}", message);
        if let Some(cb) = &self.callbacks.on_warn {
            cb(message);
        }
    }

    pub fn error(&self, message: &str) {
        error!("{}", message);
        if let Some(cb) = &self.callbacks.on_error {
            cb(message);
        }
    }

    /// Allow unless the firewall callback says otherwise
    pub fn firewall_allows(&self, request: &FirewallRequest) -> bool {
        match &self.callbacks.firewall_check {
            Some(cb) => {
                let allowed = cb(request);
                if !allowed {
                    debug!(
                        peer = %request.peer,
                        listener = ?request.listener,
                        "Connection denied by firewall"
                    );
                }
                allowed
            }
            None => true,
        }
    }

    /// Ask the host for a verdict; `Default` when no callback is set
    pub fn classify(&self, request: &ClassifyRequest<'_>) -> ContentVerdict {
        self.callbacks
            .classify
            .as_ref()
            .map(|cb| cb(request))
            .unwrap_or(ContentVerdict::Default)
    }

    pub fn request_blocked(&self, event: &BlockedRequest) {
        info!(
            target_host = %event.host,
            url = %event.url,
            category = event.category.id(),
            rule = %event.rule,
            reason = ?event.reason,
            "Request blocked"
        );
        if let Some(cb) = &self.callbacks.on_request_blocked {
            cb(event);
        }
    }

    /// Report removed elements; zero counts are not reported
    pub fn elements_blocked(&self, host: &str, count: usize) {
        if count == 0 {
            return;
        }
        debug!(target_host = %host, count, "Elements removed");
        if let Some(cb) = &self.callbacks.on_elements_blocked {
            cb(host, count);
        }
    }
}
