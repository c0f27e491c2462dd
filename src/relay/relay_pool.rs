
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;

use portable_atomic::AtomicBool;
use rand::{thread_rng, Rng};
use tokio::sync::Mutex;
use util::vnet::net::*;

use super::*;

struct Slot {
    port: u16,
    // None while the port is handed out to an allocation.
    conn: Option<Arc<dyn Conn + Send + Sync>>,
}

/// `RelayAddressGeneratorPool` pre-binds every port in
/// `[min_port, max_port]` up front and hands the sockets out one allocation
/// at a time. Picking starts at a random index so concurrent servers sharing
/// a range do not stampede the same ports. The conn handed out is a wrapper
/// whose `close` re-binds a fresh socket on the same port, returning the
/// slot to the pool.
pub struct RelayAddressGeneratorPool {
    /// The IP address reported in XOR-RELAYED-ADDRESS.
    pub relay_address: IpAddr,

    /// The address the relayed sockets bind on, without a port.
    pub address: String,

    pub min_port: u16,
    pub max_port: u16,

    pub net: Arc<Net>,

    slots: Arc<Mutex<Vec<Slot>>>,
}

impl RelayAddressGeneratorPool {
    pub fn new(
        relay_address: IpAddr,
        address: String,
        min_port: u16,
        max_port: u16,
        net: Arc<Net>,
    ) -> Self {
        RelayAddressGeneratorPool {
            relay_address,
            address,
            min_port,
            max_port,
            net,
            slots: Arc::new(Mutex::new(vec![])),
        }
    }

    /// Binds the whole port range. Must be called once before the generator
    /// is used; a port that cannot be bound fails the entire pool.
    pub async fn bind_all(&self) -> Result<()> {
        self.validate()?;

        let mut slots = self.slots.lock().await;
        if !slots.is_empty() {
            return Err(Error::Other("port pool already bound".to_owned()));
        }

        for port in self.min_port..=self.max_port {
            let addr = self
                .net
                .resolve_addr(true, &format!("{}:{}", self.address, port))
                .await?;
            let conn = self.net.bind(addr).await?;
            slots.push(Slot {
                port,
                conn: Some(conn),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl RelayAddressGenerator for RelayAddressGeneratorPool {
    fn validate(&self) -> Result<()> {
        if self.min_port == 0 {
            Err(Error::ErrMinPortNotZero)
        } else if self.max_port == 0 {
            Err(Error::ErrMaxPortNotZero)
        } else if self.max_port < self.min_port {
            Err(Error::ErrMaxPortLessThanMinPort)
        } else if self.address.is_empty() {
            Err(Error::ErrListeningAddressInvalid)
        } else {
            Ok(())
        }
    }

    async fn allocate_conn(
        &self,
        _use_ipv4: bool,
        requested_port: u16,
    ) -> Result<(Arc<dyn Conn + Send + Sync>, SocketAddr)> {
        let mut slots = self.slots.lock().await;
        if slots.is_empty() {
            return Err(Error::ErrPortPoolUnbound);
        }

        // The OS RNG seeds thread_rng; its userspace generator is the
        // fallback source once seeded.
        let offset = thread_rng().gen_range(0..slots.len());
        for i in 0..slots.len() {
            let idx = (offset + i) % slots.len();
            if requested_port != 0 && slots[idx].port != requested_port {
                continue;
            }
            if let Some(conn) = slots[idx].conn.take() {
                let mut relay_addr = conn.local_addr().await?;
                relay_addr.set_ip(self.relay_address);

                let wrapper: Arc<dyn Conn + Send + Sync> = Arc::new(PoolConn {
                    conn,
                    port: slots[idx].port,
                    address: self.address.clone(),
                    net: Arc::clone(&self.net),
                    slots: Arc::clone(&self.slots),
                    closed: AtomicBool::new(false),
                });
                return Ok((wrapper, relay_addr));
            }
        }

        Err(Error::ErrPortPoolExhausted)
    }
}

/// The socket handed out by the pool. Closing it returns the slot by
/// re-binding a fresh socket on the same port.
struct PoolConn {
    conn: Arc<dyn Conn + Send + Sync>,
    port: u16,
    address: String,
    net: Arc<Net>,
    slots: Arc<Mutex<Vec<Slot>>>,
    closed: AtomicBool,
}

#[async_trait]
impl Conn for PoolConn {
    async fn connect(&self, addr: SocketAddr) -> std::result::Result<(), util::Error> {
        self.conn.connect(addr).await
    }

    async fn recv(&self, buf: &mut [u8]) -> std::result::Result<usize, util::Error> {
        self.conn.recv(buf).await
    }

    async fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> std::result::Result<(usize, SocketAddr), util::Error> {
        self.conn.recv_from(buf).await
    }

    async fn send(&self, buf: &[u8]) -> std::result::Result<usize, util::Error> {
        self.conn.send(buf).await
    }

    async fn send_to(
        &self,
        buf: &[u8],
        target: SocketAddr,
    ) -> std::result::Result<usize, util::Error> {
        self.conn.send_to(buf, target).await
    }

    async fn local_addr(&self) -> std::result::Result<SocketAddr, util::Error> {
        self.conn.local_addr().await
    }

    async fn remote_addr(&self) -> Option<SocketAddr> {
        self.conn.remote_addr().await
    }

    async fn close(&self) -> std::result::Result<(), util::Error> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(util::Error::Other("already closed".to_owned()));
        }

        let result = self.conn.close().await;

        let fresh = match self
            .net
            .resolve_addr(true, &format!("{}:{}", self.address, self.port))
            .await
        {
            Ok(addr) => self.net.bind(addr).await,
            Err(err) => Err(err),
        };

        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.iter_mut().find(|s| s.port == self.port) {
            match fresh {
                Ok(conn) => slot.conn = Some(conn),
                Err(err) => {
                    log::warn!("failed to re-bind pool port {}: {}", self.port, err);
                }
            }
        }

        result
    }

}
