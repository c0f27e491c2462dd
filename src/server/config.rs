use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::Duration;
use util::Conn;

use crate::allocation::AllocationInfo;
use crate::error::*;
use crate::filter::Filter;
use crate::nonce::DEFAULT_NONCE_CAP;
use crate::proto::lifetime::{DEFAULT_LIFETIME, MAX_LIFETIME};
use crate::relay::RelayAddressGenerator;

/// `ConnConfig` is a pair of a listening socket and the generator producing
/// relayed sockets for allocations arriving on it.
pub struct ConnConfig {
    pub conn: Arc<dyn Conn + Send + Sync>,

    pub relay_addr_generator: Box<dyn RelayAddressGenerator + Send + Sync>,
}

impl ConnConfig {
    pub fn validate(&self) -> Result<()> {
        self.relay_addr_generator.validate()
    }
}

/// `Options` is the plain-old-data tunables snapshot a request handler reads
/// once at entry. Hot reload publishes a whole new snapshot through the
/// [`OptionsUpdater`]; no field is read from two different snapshots within
/// one request.
#[derive(Clone)]
pub struct Options {
    /// Realm sent in challenges and used for credential lookup.
    pub realm: String,

    /// SOFTWARE banner; emitted in every response when set.
    pub software: Option<String>,

    /// Read-loop tasks spawned per listening socket. Read when
    /// [`Server::new`](crate::server::Server::new) starts serving; later
    /// snapshots do not resize running workers.
    pub workers: usize,

    /// Require long-term-credential auth for plain STUN Binding requests
    /// too, not only for TURN methods.
    pub auth_for_stun: bool,

    /// Lifetime granted to allocations (and used when a request carries no
    /// LIFETIME attribute).
    pub default_lifetime: Duration,

    /// Ceiling for client-requested lifetimes.
    pub max_lifetime: Duration,

    /// Lifetime granted to channel bindings.
    pub channel_bind_lifetime: Duration,

    /// Nonce rotation period; zero means issued nonces never rotate.
    pub nonce_lifetime: Duration,

    /// Bound on the nonce table (records are evicted LRU by last-seen).
    pub nonce_cap: usize,

    /// Filter over client source addresses. Held for future use.
    pub client_rules: Filter,

    /// Filter over peer addresses, applied by CreatePermission and
    /// ChannelBind.
    pub peer_rules: Filter,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            realm: String::new(),
            software: None,
            workers: 1,
            auth_for_stun: false,
            default_lifetime: DEFAULT_LIFETIME,
            max_lifetime: MAX_LIFETIME,
            channel_bind_lifetime: DEFAULT_LIFETIME,
            nonce_lifetime: Duration::from_secs(0),
            nonce_cap: DEFAULT_NONCE_CAP,
            client_rules: Filter::default(),
            peer_rules: Filter::default(),
        }
    }
}

/// Single-writer/many-reader cell of [`Options`] snapshots.
#[derive(Clone)]
pub struct OptionsUpdater {
    tx: Arc<watch::Sender<Arc<Options>>>,
    // Keeps the channel open so `set` cannot fail with zero subscribers.
    _rx: watch::Receiver<Arc<Options>>,
}

impl OptionsUpdater {
    pub fn new(options: Options) -> Self {
        let (tx, rx) = watch::channel(Arc::new(options));
        OptionsUpdater {
            tx: Arc::new(tx),
            _rx: rx,
        }
    }

    /// Publishes a new snapshot and wakes subscribers. Requests in flight
    /// keep the snapshot they started with.
    pub fn set(&self, options: Options) {
        let _ = self.tx.send(Arc::new(options));
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<Options> {
        self.tx.borrow().clone()
    }

    /// A receiver that yields every future snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Options>> {
        self.tx.subscribe()
    }
}

/// `ServerConfig` configures the server at construction.
pub struct ServerConfig {
    /// The listening sockets to serve, each with its relay generator.
    pub conn_configs: Vec<ConnConfig>,

    /// Initial tunables snapshot; reachable later via
    /// [`Server::updater`](crate::server::Server::updater).
    pub options: Options,

    /// Credential backend. `None` disables authentication entirely.
    pub auth_handler: Option<Arc<dyn crate::auth::AuthHandler + Send + Sync>>,

    /// Receives a notification for every allocation that closes.
    pub alloc_close_notify: Option<mpsc::Sender<AllocationInfo>>,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.conn_configs.is_empty() {
            return Err(Error::ErrNoAvailableConns);
        }

        for c in &self.conn_configs {
            c.validate()?;
        }

        Ok(())
    }
}
