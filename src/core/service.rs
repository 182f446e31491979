//! Service resolution for child session requests.
//!
//! A child's request is resolved against, in order: its own binary ROM,
//! its own config ROM, then the parent's services. Requests nothing can
//! serve are parked; when a service is announced later, every live policy
//! retries its parked requests and forwards the ones that now resolve.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::binary::BinaryImage;

/// Label under which a child sees its own binary.
pub const BINARY_ROM_LABEL: &str = "binary";

/// Label under which a child sees its own configuration.
pub const CONFIG_ROM_LABEL: &str = "config";

/// Services the parent always provides.
pub const PARENT_SERVICES: [&str; 11] = [
    "CAP", "RAM", "RM", "PD", "CPU", "IO_MEM", "IO_PORT", "IRQ", "ROM", "LOG", "SIGNAL",
];

/// Who serves a resolved session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceProvider {
    /// The task's binary image.
    BinaryRom(Arc<BinaryImage>),
    /// The task's config blob.
    ConfigRom(Arc<[u8]>),
    /// A parent-provided service.
    Parent(String),
}

/// A session that could be routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    /// Requested service name.
    pub service: String,
    /// Provider.
    pub provider: ServiceProvider,
}

/// Session request as issued by a child.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionRequest {
    /// Service name.
    pub service: String,
    /// Session arguments, e.g. `label="config"`.
    pub args: String,
}

/// Parked request that resolved after an announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSession {
    /// Original request.
    pub request: SessionRequest,
    /// Resolved route.
    pub handle: ServiceHandle,
}

/// Result of routing one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Routed immediately.
    Resolved(ServiceHandle),
    /// Parked until the service is announced.
    Pending,
}

/// Extract the last `label="..."` value from session arguments.
///
/// Labels of nested sessions are joined with `" -> "`; only the innermost
/// element names the ROM module.
#[must_use]
pub fn session_label(args: &str) -> Option<&str> {
    let start = args.find("label=\"")? + "label=\"".len();
    let rest = &args[start..];
    let label = &rest[..rest.find('"')?];
    Some(label.rsplit(" -> ").next().unwrap_or(label))
}

/// One link in the resolution chain.
pub trait ServiceResolver: Send + Sync {
    /// Route `service` with `args`, or `None` if this resolver cannot.
    fn resolve(&self, service: &str, args: &str) -> Option<ServiceHandle>;
}

/// Serves a single labelled ROM module.
#[derive(Debug, Clone)]
pub struct RomResolver {
    label: &'static str,
    provider: ServiceProvider,
}

impl RomResolver {
    /// Serve `image` as the child's binary ROM.
    #[must_use]
    pub fn binary(image: Arc<BinaryImage>) -> Self {
        Self {
            label: BINARY_ROM_LABEL,
            provider: ServiceProvider::BinaryRom(image),
        }
    }

    /// Serve `config` as the child's config ROM.
    #[must_use]
    pub fn config(config: Arc<[u8]>) -> Self {
        Self {
            label: CONFIG_ROM_LABEL,
            provider: ServiceProvider::ConfigRom(config),
        }
    }
}

impl ServiceResolver for RomResolver {
    fn resolve(&self, service: &str, args: &str) -> Option<ServiceHandle> {
        (service == "ROM" && session_label(args) == Some(self.label)).then(|| ServiceHandle {
            service: service.to_owned(),
            provider: self.provider.clone(),
        })
    }
}

/// Receives a nudge whenever the parent announces a service.
pub trait ServiceListener: Send + Sync {
    /// Retry parked requests.
    fn service_announced(&self, service: &str);
}

/// Services provided by the parent, plus any announced at runtime.
pub struct ServiceRegistry {
    services: RwLock<BTreeSet<String>>,
    listeners: Mutex<Vec<Weak<dyn ServiceListener>>>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    /// Registry holding the always-present parent services.
    #[must_use]
    pub fn new() -> Self {
        Self {
            services: RwLock::new(PARENT_SERVICES.iter().map(|s| (*s).to_owned()).collect()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Whether the parent currently provides `service`.
    pub fn provides(&self, service: &str) -> bool {
        self.services.read().contains(service)
    }

    /// Names of all provided services.
    pub fn services(&self) -> Vec<String> {
        self.services.read().iter().cloned().collect()
    }

    /// Register a listener; it is dropped automatically once it dies.
    pub fn subscribe(&self, listener: Weak<dyn ServiceListener>) {
        let mut listeners = self.listeners.lock();
        listeners.retain(|l| l.strong_count() > 0);
        listeners.push(listener);
    }

    /// Make `service` available and wake every listener.
    pub fn announce(&self, service: &str) {
        let inserted = self.services.write().insert(service.to_owned());
        if !inserted {
            debug!(service, "service already announced");
            return;
        }
        info!(service, "service announced");
        let live: Vec<Arc<dyn ServiceListener>> = {
            let mut listeners = self.listeners.lock();
            listeners.retain(|l| l.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in live {
            listener.service_announced(service);
        }
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &*self.services.read())
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

/// Resolver backed by the parent registry.
#[derive(Debug, Clone)]
pub struct ParentResolver {
    registry: Arc<ServiceRegistry>,
}

impl ParentResolver {
    /// Resolve against `registry`.
    #[must_use]
    pub const fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self { registry }
    }
}

impl ServiceResolver for ParentResolver {
    fn resolve(&self, service: &str, _args: &str) -> Option<ServiceHandle> {
        self.registry.provides(service).then(|| ServiceHandle {
            service: service.to_owned(),
            provider: ServiceProvider::Parent(service.to_owned()),
        })
    }
}

/// Per-child resolution chain with a parking lot for unresolved requests.
pub struct SessionRouter {
    owner: String,
    chain: Vec<Box<dyn ServiceResolver>>,
    pending: Mutex<Vec<SessionRequest>>,
    late: Mutex<Option<Sender<ResolvedSession>>>,
}

impl SessionRouter {
    /// Chain binary ROM, config ROM and parent services for `owner`.
    #[must_use]
    pub fn new(
        owner: impl Into<String>,
        image: Arc<BinaryImage>,
        config: Arc<[u8]>,
        parent: Arc<ServiceRegistry>,
    ) -> Self {
        Self::with_chain(
            owner,
            vec![
                Box::new(RomResolver::binary(image)),
                Box::new(RomResolver::config(config)),
                Box::new(ParentResolver::new(parent)),
            ],
        )
    }

    /// Router over an explicit chain.
    #[must_use]
    pub fn with_chain(owner: impl Into<String>, chain: Vec<Box<dyn ServiceResolver>>) -> Self {
        Self {
            owner: owner.into(),
            chain,
            pending: Mutex::new(Vec::new()),
            late: Mutex::new(None),
        }
    }

    /// Set where late resolutions go; replaces the previous sink.
    pub fn connect(&self, late: Sender<ResolvedSession>) {
        *self.late.lock() = Some(late);
    }

    fn lookup(&self, service: &str, args: &str) -> Option<ServiceHandle> {
        self.chain.iter().find_map(|r| r.resolve(service, args))
    }

    /// Route a request, parking it if nothing can serve it yet.
    pub fn resolve(&self, service: &str, args: &str) -> Resolution {
        if let Some(handle) = self.lookup(service, args) {
            debug!(child = %self.owner, service, "session resolved");
            return Resolution::Resolved(handle);
        }
        info!(child = %self.owner, service, args, "session request pending");
        self.pending.lock().push(SessionRequest {
            service: service.to_owned(),
            args: args.to_owned(),
        });
        Resolution::Pending
    }

    /// Number of parked requests.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Retry parked requests, forwarding those that now resolve.
    /// Returns how many were forwarded.
    pub fn retry_pending(&self) -> usize {
        let resolved: Vec<ResolvedSession> = {
            let mut pending = self.pending.lock();
            let mut resolved = Vec::new();
            pending.retain(|request| match self.lookup(&request.service, &request.args) {
                Some(handle) => {
                    resolved.push(ResolvedSession {
                        request: request.clone(),
                        handle,
                    });
                    false
                }
                None => true,
            });
            resolved
        };
        let count = resolved.len();
        if count == 0 {
            return 0;
        }
        let late = self.late.lock();
        for session in resolved {
            info!(child = %self.owner, service = %session.request.service, "pending session resolved");
            if let Some(tx) = late.as_ref() {
                if tx.send(session).is_err() {
                    debug!(child = %self.owner, "late session receiver gone");
                }
            }
        }
        count
    }
}

impl std::fmt::Debug for SessionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRouter")
            .field("owner", &self.owner)
            .field("chain", &self.chain.len())
            .field("pending", &self.pending.lock().len())
            .finish_non_exhaustive()
    }
}
