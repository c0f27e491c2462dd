
pub mod allocation_manager;
pub mod five_tuple;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
#[cfg(feature = "metrics")]
use std::sync::atomic::Ordering;
use std::sync::Arc;

use five_tuple::*;
#[cfg(feature = "metrics")]
use portable_atomic::AtomicUsize;
use stun::agent::TransactionId;
use stun::message::*;
use stun::textattrs::Username;
use tokio::sync::{oneshot, RwLock};
use tokio::time::{timeout, Duration, Instant};
use util::Conn;

use crate::error::*;
use crate::proto::chandata::ChannelData;
use crate::proto::channum::ChannelNumber;
use crate::proto::data::Data;
use crate::proto::peeraddr::PeerAddress;

pub(crate) const RELAY_MTU: usize = 1500;

/// Read deadline on the relayed socket; hitting it only re-arms the loop so
/// the pump stays responsive to shutdown.
pub(crate) const RELAY_READ_DEADLINE: Duration = Duration::from_secs(60);

/// Deadline applied to every datagram write so a stuck sender cannot wedge a
/// worker or a pump.
pub(crate) const WRITE_DEADLINE: Duration = Duration::from_secs(1);

pub type AllocationMap = Arc<RwLock<HashMap<FiveTuple, Allocation>>>;

/// Information about an [`Allocation`].
#[derive(Debug, Clone)]
pub struct AllocationInfo {
    /// [`FiveTuple`] of this [`Allocation`].
    pub five_tuple: FiveTuple,

    /// Username of this [`Allocation`].
    pub username: String,

    /// Relayed bytes with this [`Allocation`].
    #[cfg(feature = "metrics")]
    pub relayed_bytes: usize,
}

/// Registry-wide gauge snapshot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub allocations: usize,
    pub permissions: usize,
    pub bindings: usize,
}

/// Binding is a TURN channel binding: a 16-bit alias for one peer transport
/// address under an allocation.
///
/// RFC 5766 Section 2.5
#[derive(Debug, Clone, Copy)]
pub struct Binding {
    pub number: ChannelNumber,
    pub port: u16,
    pub(crate) timeout: Instant,
}

impl Binding {
    pub(crate) fn is_active(&self, now: Instant) -> bool {
        self.timeout > now
    }
}

/// Permission is the address-restricted filter installed for one peer IP
/// under an allocation; its channel bindings nest inside it. TURN
/// permissions mimic the filtering of NATs that comply with RFC 4787.
///
/// RFC 5766 Section 2.3
#[derive(Debug, Clone)]
pub struct Permission {
    pub ip: IpAddr,
    pub(crate) timeout: Instant,
    pub(crate) bindings: Vec<Binding>,
}

impl Permission {
    pub(crate) fn new(ip: IpAddr, timeout: Instant) -> Self {
        Permission {
            ip,
            timeout,
            bindings: vec![],
        }
    }

    pub(crate) fn is_active(&self, now: Instant) -> bool {
        self.timeout > now
    }
}

/// `Allocation` is tied to a [`FiveTuple`] and relays traffic between the
/// client and its peers through an exclusively owned relayed socket.
pub struct Allocation {
    pub(crate) five_tuple: FiveTuple,
    pub(crate) username: Username,
    pub(crate) relay_addr: SocketAddr,
    pub(crate) relay_socket: Arc<dyn Conn + Send + Sync>,
    pub(crate) permissions: Vec<Permission>,
    pub(crate) timeout: Instant,
    #[cfg(feature = "metrics")]
    pub(crate) relayed_bytes: Arc<AtomicUsize>,
    closed: bool,
    // Dropping the sender stops the peer-read pump.
    pub(crate) drop_tx: Option<oneshot::Sender<()>>,
}

impl Allocation {
    pub(crate) fn new(
        five_tuple: FiveTuple,
        username: Username,
        relay_addr: SocketAddr,
        relay_socket: Arc<dyn Conn + Send + Sync>,
        timeout: Instant,
    ) -> Self {
        Allocation {
            five_tuple,
            username,
            relay_addr,
            relay_socket,
            permissions: vec![],
            timeout,
            #[cfg(feature = "metrics")]
            relayed_bytes: Arc::new(AtomicUsize::new(0)),
            closed: false,
            drop_tx: None,
        }
    }

    /// The active permission covering `ip`, if any. Expired records count as
    /// absent even before the next prune sweep.
    pub(crate) fn permission(&self, ip: IpAddr, now: Instant) -> Option<&Permission> {
        self.permissions
            .iter()
            .find(|p| p.ip == ip && p.is_active(now))
    }

    pub(crate) fn permission_mut(&mut self, ip: IpAddr) -> Option<&mut Permission> {
        self.permissions.iter_mut().find(|p| p.ip == ip)
    }

    /// The channel bound to the exact `(ip, port)` peer address.
    pub(crate) fn channel_for_peer(
        &self,
        peer: SocketAddr,
        now: Instant,
    ) -> Option<ChannelNumber> {
        self.permissions
            .iter()
            .filter(|p| p.ip == peer.ip() && p.is_active(now))
            .flat_map(|p| p.bindings.iter())
            .find(|b| b.port == peer.port() && b.is_active(now))
            .map(|b| b.number)
    }

    /// The peer transport address bound to channel `number`.
    pub(crate) fn peer_for_channel(
        &self,
        number: ChannelNumber,
        now: Instant,
    ) -> Option<SocketAddr> {
        for p in self.permissions.iter().filter(|p| p.is_active(now)) {
            for b in p.bindings.iter().filter(|b| b.is_active(now)) {
                if b.number == number {
                    return Some(SocketAddr::new(p.ip, b.port));
                }
            }
        }
        None
    }

    /// Drops expired bindings, then permissions whose timeout has passed.
    /// The enclosing allocation is the manager's to reap.
    pub(crate) fn prune(&mut self, now: Instant) {
        for p in self.permissions.iter_mut() {
            p.bindings.retain(|b| b.is_active(now));
        }
        self.permissions.retain(|p| p.is_active(now));
    }

    pub(crate) fn info(&self) -> AllocationInfo {
        AllocationInfo {
            five_tuple: self.five_tuple,
            username: self.username.text.clone(),
            #[cfg(feature = "metrics")]
            relayed_bytes: self.relayed_bytes.load(Ordering::Acquire),
        }
    }

    /// Closes the [`Allocation`], releasing the relayed socket and stopping
    /// the peer-read pump. Closing twice is an error.
    pub(crate) async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::ErrClosed);
        }
        self.closed = true;
        self.drop_tx.take();

        let _ = self.relay_socket.close().await;

        log::trace!("allocation with {} closed!", self.five_tuple);
        Ok(())
    }
}

enum ClientRoute {
    Channel(ChannelNumber),
    Indication,
}

//  https://tools.ietf.org/html/rfc5766#section-10.3
//  When the server receives a UDP datagram at a currently allocated
//  relayed transport address, the server looks up the allocation
//  associated with the relayed transport address and checks whether the
//  set of permissions for the allocation allows the relaying of the
//  datagram.
//
//  If relaying is permitted and a channel is bound to the peer that sent
//  the datagram, the payload is framed as ChannelData. If relaying is
//  permitted but no channel is bound, the server forms a Data indication
//  carrying both XOR-PEER-ADDRESS and DATA and sends it on the 5-tuple
//  associated with the allocation.
#[allow(clippy::too_many_arguments)]
pub(crate) fn packet_handler(
    allocations: AllocationMap,
    five_tuple: FiveTuple,
    relay_addr: SocketAddr,
    relay_socket: Arc<dyn Conn + Send + Sync>,
    turn_socket: Arc<dyn Conn + Send + Sync>,
    drop_rx: oneshot::Receiver<()>,
    #[cfg(feature = "metrics")] relayed_bytes: Arc<AtomicUsize>,
) {
    tokio::spawn(async move {
        let mut buffer = vec![0u8; RELAY_MTU];

        tokio::pin!(drop_rx);

        loop {
            let (n, src_addr) = tokio::select! {
                result = timeout(RELAY_READ_DEADLINE, relay_socket.recv_from(&mut buffer)) => {
                    match result {
                        Ok(Ok((n, src_addr))) => (n, src_addr),
                        Ok(Err(_)) => {
                            // Fatal socket error; the allocation is left to
                            // expire via the prune sweep.
                            break;
                        }
                        // Read deadline: nothing from peers, keep listening.
                        Err(_) => continue,
                    }
                }
                _ = drop_rx.as_mut() => {
                    log::trace!("allocation has stopped, stop packet_handler. five_tuple: {:?}", five_tuple);
                    break;
                }
            };

            log::debug!(
                "relay socket {:?} received {} bytes from {}",
                relay_socket.local_addr().await,
                n,
                src_addr
            );

            let now = Instant::now();
            let route = {
                let allocs = allocations.read().await;
                match allocs.get(&five_tuple) {
                    None => break,
                    Some(a) => {
                        if let Some(number) = a.channel_for_peer(src_addr, now) {
                            Some(ClientRoute::Channel(number))
                        } else if a.permission(src_addr.ip(), now).is_some() {
                            Some(ClientRoute::Indication)
                        } else {
                            None
                        }
                    }
                }
            };

            match route {
                Some(ClientRoute::Channel(number)) => {
                    let mut channel_data = ChannelData {
                        data: buffer[..n].to_vec(),
                        number,
                        raw: vec![],
                    };
                    channel_data.encode();

                    if let Err(err) =
                        send_with_deadline(&turn_socket, &channel_data.raw, five_tuple.src_addr)
                            .await
                    {
                        log::error!(
                            "Failed to send ChannelData from allocation {} {}",
                            src_addr,
                            err
                        );
                    } else {
                        #[cfg(feature = "metrics")]
                        relayed_bytes.fetch_add(n, Ordering::AcqRel);
                    }
                }
                Some(ClientRoute::Indication) => {
                    let peer_address_attr = PeerAddress {
                        ip: src_addr.ip(),
                        port: src_addr.port(),
                    };
                    let data_attr = Data(buffer[..n].to_vec());

                    let mut msg = Message::new();
                    if let Err(err) = msg.build(&[
                        Box::new(TransactionId::new()),
                        Box::new(MessageType::new(METHOD_DATA, CLASS_INDICATION)),
                        Box::new(peer_address_attr),
                        Box::new(data_attr),
                    ]) {
                        log::error!(
                            "Failed to build DataIndication from allocation {} {}",
                            src_addr,
                            err
                        );
                        continue;
                    }

                    log::debug!(
                        "relaying message from {} to client at {}",
                        src_addr,
                        five_tuple.src_addr
                    );
                    if let Err(err) =
                        send_with_deadline(&turn_socket, &msg.raw, five_tuple.src_addr).await
                    {
                        log::error!(
                            "Failed to send DataIndication from allocation {} {}",
                            src_addr,
                            err
                        );
                    } else {
                        #[cfg(feature = "metrics")]
                        relayed_bytes.fetch_add(n, Ordering::AcqRel);
                    }
                }
                None => {
                    log::info!(
                        "No Permission or Channel exists for {} on allocation {}",
                        src_addr,
                        relay_addr
                    );
                }
            }
        }
    });
}

/// Writes `data` to `dst`, bounded by [`WRITE_DEADLINE`].
pub(crate) async fn send_with_deadline(
    conn: &Arc<dyn Conn + Send + Sync>,
    data: &[u8],
    dst: SocketAddr,
) -> Result<usize> {
    match timeout(WRITE_DEADLINE, conn.send_to(data, dst)).await {
        Ok(Ok(n)) => Ok(n),
        Ok(Err(err)) => Err(Error::Util(err)),
        Err(_) => Err(Error::ErrWriteDeadlineExceeded),
    }
}
