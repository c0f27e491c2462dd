#[cfg(test)]
mod allocation_manager_test;

use std::collections::HashSet;

use stun::textattrs::Username;
use tokio::sync::{mpsc, Mutex};
use util::Conn;

use super::*;
use crate::relay::*;

/// `ManagerConfig` a bag of config params for `Manager`.
pub struct ManagerConfig {
    pub relay_addr_generator: Box<dyn RelayAddressGenerator + Send + Sync>,
    pub alloc_close_notify: Option<mpsc::Sender<AllocationInfo>>,
}

/// `Manager` is the registry of active allocations, keyed by [`FiveTuple`].
///
/// Every operation takes the caller's monotonic `now` where expiry matters;
/// state whose timeout is not in the future is treated as absent.
pub struct Manager {
    allocations: AllocationMap,
    reservations: Mutex<HashSet<FiveTuple>>,
    relay_addr_generator: Box<dyn RelayAddressGenerator + Send + Sync>,
    alloc_close_notify: Option<mpsc::Sender<AllocationInfo>>,
}

impl Manager {
    /// Creates a new [`Manager`].
    pub fn new(config: ManagerConfig) -> Self {
        Manager {
            allocations: Arc::new(RwLock::new(HashMap::new())),
            reservations: Mutex::new(HashSet::new()),
            relay_addr_generator: config.relay_addr_generator,
            alloc_close_notify: config.alloc_close_notify,
        }
    }

    /// Closes this [`Manager`] and all the [`Allocation`]s it manages.
    pub async fn close(&self) -> Result<()> {
        let drained: Vec<Allocation> = {
            let mut allocs = self.allocations.write().await;
            allocs.drain().map(|(_, a)| a).collect()
        };
        for a in drained {
            self.finish_close(a).await;
        }
        Ok(())
    }

    /// `true` if an allocation exists for the tuple.
    pub async fn has_allocation(&self, five_tuple: &FiveTuple) -> bool {
        let allocs = self.allocations.read().await;
        allocs.contains_key(five_tuple)
    }

    /// Returns the information about all [`Allocation`]s associated with
    /// the specified [`FiveTuple`]s, or about every allocation when `None`.
    pub async fn get_allocations_info(
        &self,
        five_tuples: Option<Vec<FiveTuple>>,
    ) -> HashMap<FiveTuple, AllocationInfo> {
        let mut infos = HashMap::new();

        let guarded = self.allocations.read().await;

        guarded.iter().for_each(|(five_tuple, alloc)| {
            if five_tuples.is_none() || five_tuples.as_ref().unwrap().contains(five_tuple) {
                infos.insert(*five_tuple, alloc.info());
            }
        });

        infos
    }

    /// Creates a new [`Allocation`] with the given absolute timeout and
    /// starts its peer-read pump, returning the relayed transport address.
    ///
    /// The tuple is reserved before the relayed socket is bound so the map
    /// lock is never held across socket I/O; a duplicate tuple in either
    /// stage fails with [`Error::ErrDupeFiveTuple`].
    pub async fn create_allocation(
        &self,
        five_tuple: FiveTuple,
        turn_socket: Arc<dyn Conn + Send + Sync>,
        timeout: Instant,
        now: Instant,
        username: Username,
    ) -> Result<SocketAddr> {
        if timeout <= now {
            return Err(Error::ErrLifetimeZero);
        }

        {
            let allocs = self.allocations.read().await;
            let mut reservations = self.reservations.lock().await;
            if allocs.contains_key(&five_tuple) || !reservations.insert(five_tuple) {
                return Err(Error::ErrDupeFiveTuple);
            }
        }

        let use_ipv4 = five_tuple.src_addr.is_ipv4();
        let (relay_socket, relay_addr) = match self
            .relay_addr_generator
            .allocate_conn(use_ipv4, 0)
            .await
        {
            Ok(v) => v,
            Err(err) => {
                self.reservations.lock().await.remove(&five_tuple);
                return Err(err);
            }
        };

        let mut a = Allocation::new(
            five_tuple,
            username,
            relay_addr,
            Arc::clone(&relay_socket),
            timeout,
        );
        let (drop_tx, drop_rx) = oneshot::channel();
        a.drop_tx = Some(drop_tx);

        log::debug!("listening on relay addr: {:?}", a.relay_addr);

        packet_handler(
            Arc::clone(&self.allocations),
            five_tuple,
            relay_addr,
            relay_socket,
            turn_socket,
            drop_rx,
            #[cfg(feature = "metrics")]
            Arc::clone(&a.relayed_bytes),
        );

        {
            let mut allocs = self.allocations.write().await;
            allocs.insert(five_tuple, a);
        }
        self.reservations.lock().await.remove(&five_tuple);

        Ok(relay_addr)
    }

    /// Installs or refreshes the permission for `peer_addr`'s IP. The last
    /// write wins on the timeout; the set of permissions never shrinks here.
    pub async fn create_permission(
        &self,
        five_tuple: &FiveTuple,
        peer_addr: SocketAddr,
        timeout: Instant,
    ) -> Result<()> {
        let mut allocs = self.allocations.write().await;
        let a = allocs
            .get_mut(five_tuple)
            .ok_or(Error::ErrNoAllocationFound)?;

        match a.permission_mut(peer_addr.ip()) {
            Some(p) => p.timeout = timeout,
            None => a
                .permissions
                .push(Permission::new(peer_addr.ip(), timeout)),
        }

        Ok(())
    }

    /// Creates or refreshes the channel binding `number` -> `peer_addr`,
    /// installing the covering permission as needed.
    ///
    /// Conflict rules within one allocation: a channel number already bound
    /// under a different peer IP conflicts; a peer IP whose permission
    /// already carries a binding with a different number conflicts;
    /// rebinding the same number refreshes port and timeout. Creating or
    /// refreshing raises the permission timeout to at least the binding's.
    pub async fn channel_bind(
        &self,
        five_tuple: &FiveTuple,
        number: ChannelNumber,
        peer_addr: SocketAddr,
        timeout: Instant,
    ) -> Result<()> {
        if !number.valid() {
            return Err(Error::ErrInvalidChannelNumber);
        }

        let mut allocs = self.allocations.write().await;
        let a = allocs
            .get_mut(five_tuple)
            .ok_or(Error::ErrNoAllocationFound)?;

        for p in &a.permissions {
            if p.ip != peer_addr.ip() && p.bindings.iter().any(|b| b.number == number) {
                return Err(Error::ErrSameChannelDifferentPeer);
            }
        }

        match a.permission_mut(peer_addr.ip()) {
            None => {
                let mut p = Permission::new(peer_addr.ip(), timeout);
                p.bindings.push(Binding {
                    number,
                    port: peer_addr.port(),
                    timeout,
                });
                a.permissions.push(p);
            }
            Some(p) => {
                if let Some(b) = p.bindings.iter_mut().find(|b| b.number == number) {
                    b.port = peer_addr.port();
                    b.timeout = timeout;
                } else if p.bindings.is_empty() {
                    p.bindings.push(Binding {
                        number,
                        port: peer_addr.port(),
                        timeout,
                    });
                } else {
                    // The peer address is already aliased by another number.
                    return Err(Error::ErrSameChannelDifferentPeer);
                }

                if p.timeout < timeout {
                    p.timeout = timeout;
                }
            }
        }

        Ok(())
    }

    /// Moves the allocation's expiry to `timeout`.
    pub async fn refresh_allocation(
        &self,
        five_tuple: &FiveTuple,
        timeout: Instant,
    ) -> Result<()> {
        let mut allocs = self.allocations.write().await;
        let a = allocs
            .get_mut(five_tuple)
            .ok_or(Error::ErrNoAllocationFound)?;
        a.timeout = timeout;
        Ok(())
    }

    /// Removes an [`Allocation`], closing its relayed socket and dropping
    /// all nested permissions and bindings.
    pub async fn delete_allocation(&self, five_tuple: &FiveTuple) -> Result<()> {
        let a = {
            let mut allocs = self.allocations.write().await;
            allocs
                .remove(five_tuple)
                .ok_or(Error::ErrNoAllocationFound)?
        };
        self.finish_close(a).await;
        Ok(())
    }

    /// Deletes the [`Allocation`]s according to the specified username `name`.
    pub async fn delete_allocations_by_username(&self, name: &str) {
        let to_delete: Vec<Allocation> = {
            let mut allocations = self.allocations.write().await;

            let keys: Vec<FiveTuple> = allocations
                .iter()
                .filter(|(_, a)| a.username.text == name)
                .map(|(k, _)| *k)
                .collect();

            keys.into_iter()
                .filter_map(|k| allocations.remove(&k))
                .collect()
        };

        for a in to_delete {
            self.finish_close(a).await;
        }
    }

    /// Writes `data` to `peer_addr` through the tuple's relayed socket,
    /// provided an active permission covers the peer's IP.
    pub async fn relay(
        &self,
        five_tuple: &FiveTuple,
        peer_addr: SocketAddr,
        data: &[u8],
        now: Instant,
    ) -> Result<usize> {
        let relay_socket = {
            let allocs = self.allocations.read().await;
            let a = allocs.get(five_tuple).ok_or(Error::ErrNoAllocationFound)?;
            if a.permission(peer_addr.ip(), now).is_none() {
                return Err(Error::ErrNoPermission);
            }
            #[cfg(feature = "metrics")]
            a.relayed_bytes.fetch_add(data.len(), Ordering::AcqRel);
            Arc::clone(&a.relay_socket)
        };

        send_with_deadline(&relay_socket, data, peer_addr).await
    }

    /// Writes `data` to the peer bound to `number` under the tuple's
    /// allocation.
    pub async fn relay_to_channel(
        &self,
        five_tuple: &FiveTuple,
        number: ChannelNumber,
        data: &[u8],
        now: Instant,
    ) -> Result<usize> {
        let (relay_socket, peer_addr) = {
            let allocs = self.allocations.read().await;
            let a = allocs.get(five_tuple).ok_or(Error::ErrNoAllocationFound)?;
            let peer = a
                .peer_for_channel(number, now)
                .ok_or(Error::ErrNoSuchChannelBind)?;
            #[cfg(feature = "metrics")]
            a.relayed_bytes.fetch_add(data.len(), Ordering::AcqRel);
            (Arc::clone(&a.relay_socket), peer)
        };

        send_with_deadline(&relay_socket, data, peer_addr).await
    }

    /// The channel bound to the exact peer transport address, if any.
    pub async fn channel_for_peer(
        &self,
        five_tuple: &FiveTuple,
        peer_addr: SocketAddr,
        now: Instant,
    ) -> Option<ChannelNumber> {
        let allocs = self.allocations.read().await;
        allocs
            .get(five_tuple)
            .and_then(|a| a.channel_for_peer(peer_addr, now))
    }

    /// Drops expired bindings, then expired permissions, then expired
    /// allocations. Monotonic: state expired at `now` is unreachable from
    /// any operation carrying the same `now`.
    pub async fn prune(&self, now: Instant) {
        let expired: Vec<Allocation> = {
            let mut allocs = self.allocations.write().await;
            for a in allocs.values_mut() {
                a.prune(now);
            }

            let keys: Vec<FiveTuple> = allocs
                .iter()
                .filter(|(_, a)| a.timeout <= now)
                .map(|(k, _)| *k)
                .collect();
            keys.into_iter()
                .filter_map(|k| allocs.remove(&k))
                .collect()
        };

        for a in expired {
            log::trace!("allocation with {} pruned", a.five_tuple);
            self.finish_close(a).await;
        }
    }

    /// Counts of live allocations, permissions and bindings.
    pub async fn stats(&self) -> Stats {
        let allocs = self.allocations.read().await;
        let mut stats = Stats {
            allocations: allocs.len(),
            ..Default::default()
        };
        for a in allocs.values() {
            stats.permissions += a.permissions.len();
            for p in &a.permissions {
                stats.bindings += p.bindings.len();
            }
        }
        stats
    }

    async fn finish_close(&self, mut a: Allocation) {
        let info = a.info();
        if let Err(err) = a.close().await {
            log::error!("Failed to close allocation: {}", err);
        }
        if let Some(notify_tx) = &self.alloc_close_notify {
            let _ = notify_tx.send(info).await;
        }
    }
}
