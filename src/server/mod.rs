
pub mod config;
pub mod request;

use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt as _;
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc, Mutex,
};
use tokio::time::{Duration, Instant};
use util::Conn;

use crate::allocation::allocation_manager::{Manager, ManagerConfig};
use crate::allocation::five_tuple::FiveTuple;
use crate::allocation::{AllocationInfo, Stats};
use crate::auth::AuthHandler;
use crate::error::*;
use crate::nonce::NonceManager;
use config::*;
use request::*;

/// Period of the sweep that expires allocations, permissions and bindings.
const PRUNE_PERIOD: Duration = Duration::from_secs(1);

/// The protocol to communicate between the [`Server`]'s public methods and
/// the tasks spawned in [`Server::new`].
#[derive(Clone)]
enum Command {
    /// Command to close the [`Server`].
    Close(Arc<mpsc::Receiver<()>>),
}

/// `Server` is an instance of the STUN/TURN server. Construction spawns the
/// worker read loops and the prune timer; `close` shuts everything down
/// cooperatively.
pub struct Server {
    auth_handler: Option<Arc<dyn AuthHandler + Send + Sync>>,
    updater: OptionsUpdater,
    nonces: Arc<NonceManager>,
    managers: Vec<Arc<Manager>>,
    handle: Mutex<Option<broadcast::Sender<Command>>>,
}

impl Server {
    /// Creates the server and starts serving every configured conn.
    pub async fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        let updater = OptionsUpdater::new(config.options);
        let options = updater.snapshot();
        let nonces = Arc::new(NonceManager::new(
            options.nonce_lifetime,
            options.nonce_cap,
        ));

        let (handle, _) = broadcast::channel(16);
        let mut managers = Vec::with_capacity(config.conn_configs.len());

        for p in config.conn_configs.into_iter() {
            let conn = p.conn;
            let allocation_manager = Arc::new(Manager::new(ManagerConfig {
                relay_addr_generator: p.relay_addr_generator,
                alloc_close_notify: config.alloc_close_notify.clone(),
            }));
            managers.push(Arc::clone(&allocation_manager));

            tokio::spawn(Server::prune_loop(
                Arc::clone(&allocation_manager),
                handle.subscribe(),
            ));

            let workers = std::cmp::max(options.workers, 1);
            for _ in 0..workers {
                tokio::spawn(Server::read_loop(
                    Arc::clone(&conn),
                    Arc::clone(&allocation_manager),
                    Arc::clone(&nonces),
                    config.auth_handler.clone(),
                    updater.clone(),
                    handle.subscribe(),
                ));
            }
        }

        Ok(Server {
            auth_handler: config.auth_handler,
            updater,
            nonces,
            managers,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// The updater publishing [`Options`] snapshots to the workers.
    pub fn updater(&self) -> OptionsUpdater {
        self.updater.clone()
    }

    /// `true` when the server was constructed with an authenticator.
    pub fn has_auth(&self) -> bool {
        self.auth_handler.is_some()
    }

    /// Counts of live allocations, permissions and bindings across every
    /// listener.
    pub async fn stats(&self) -> Stats {
        let mut total = Stats::default();
        for m in &self.managers {
            let s = m.stats().await;
            total.allocations += s.allocations;
            total.permissions += s.permissions;
            total.bindings += s.bindings;
        }
        total
    }

    /// Information about the allocations for the given tuples, or all of
    /// them when `None`.
    pub async fn get_allocations_info(
        &self,
        five_tuples: Option<Vec<FiveTuple>>,
    ) -> HashMap<FiveTuple, AllocationInfo> {
        let mut infos = HashMap::new();
        for m in &self.managers {
            infos.extend(m.get_allocations_info(five_tuples.clone()).await);
        }
        infos
    }

    /// Deletes every allocation created under `username`.
    pub async fn delete_allocations_by_username(&self, username: &str) {
        for m in &self.managers {
            m.delete_allocations_by_username(username).await;
        }
    }

    async fn read_loop(
        conn: Arc<dyn Conn + Send + Sync>,
        allocation_manager: Arc<Manager>,
        nonces: Arc<NonceManager>,
        auth_handler: Option<Arc<dyn AuthHandler + Send + Sync>>,
        updater: OptionsUpdater,
        mut handle_rx: broadcast::Receiver<Command>,
    ) {
        let dst_addr = match conn.local_addr().await {
            Ok(addr) => addr,
            Err(err) => {
                log::error!("exit read loop, no local addr: {err}");
                return;
            }
        };

        let mut buf = vec![0u8; INBOUND_MTU];
        loop {
            let (n, addr) = futures::select! {
                v = conn.recv_from(&mut buf).fuse() => {
                    match v {
                        Ok(v) => v,
                        Err(err) => {
                            log::debug!("exit read loop on error: {err}");
                            break;
                        }
                    }
                },
                cmd = handle_rx.recv().fuse() => {
                    match cmd {
                        Err(RecvError::Closed) | Ok(Command::Close(_)) => break,
                        Err(RecvError::Lagged(n)) => {
                            log::error!("turn server has lagged by {n} messages");
                            continue;
                        }
                    }
                }
            };

            let mut r = Request {
                conn: Arc::clone(&conn),
                src_addr: addr,
                dst_addr,
                buff: buf[..n].to_vec(),
                allocation_manager: Arc::clone(&allocation_manager),
                nonces: Arc::clone(&nonces),
                auth_handler: auth_handler.clone(),
                options: updater.snapshot(),
                now: Instant::now(),
            };

            if let Err(err) = r.handle_request().await {
                log::error!("error when handling datagram: {}", err);
            }
        }

        let _ = allocation_manager.close().await;
        let _ = conn.close().await;
    }

    async fn prune_loop(
        allocation_manager: Arc<Manager>,
        mut handle_rx: broadcast::Receiver<Command>,
    ) {
        let mut interval = tokio::time::interval(PRUNE_PERIOD);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    allocation_manager.prune(Instant::now()).await;
                }
                cmd = handle_rx.recv() => {
                    match cmd {
                        Err(RecvError::Closed) | Ok(Command::Close(_)) => break,
                        Err(RecvError::Lagged(_)) => continue,
                    }
                }
            }
        }
    }

    /// Close stops the TURN Server. It cleans up any associated state and
    /// closes all connections it is managing.
    pub async fn close(&self) -> Result<()> {
        let tx = self.handle.lock().await.take();
        if let Some(tx) = tx {
            if tx.receiver_count() == 0 {
                return Ok(());
            }

            let (closed_tx, closed_rx) = mpsc::channel(1);
            let _ = tx.send(Command::Close(Arc::new(closed_rx)));
            closed_tx.closed().await
        }

        Ok(())
    }
}
