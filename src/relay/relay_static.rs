use std::net::IpAddr;

use util::vnet::net::*;

use super::*;

/// `RelayAddressGeneratorStatic` binds a fresh socket with a
/// system-ephemeral port for every allocation and advertises a fixed relay
/// IP. This is the right generator when the server sits directly on the
/// interface peers reach it at.
pub struct RelayAddressGeneratorStatic {
    /// The IP address reported in XOR-RELAYED-ADDRESS.
    pub relay_address: IpAddr,

    /// The address the relayed sockets bind on, without a port.
    pub address: String,

    pub net: Arc<Net>,
}

#[async_trait]
impl RelayAddressGenerator for RelayAddressGeneratorStatic {
    fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            Err(Error::ErrListeningAddressInvalid)
        } else {
            Ok(())
        }
    }

    async fn allocate_conn(
        &self,
        use_ipv4: bool,
        requested_port: u16,
    ) -> Result<(Arc<dyn Conn + Send + Sync>, SocketAddr)> {
        let addr = self
            .net
            .resolve_addr(use_ipv4, &format!("{}:{}", self.address, requested_port))
            .await?;
        let conn = self.net.bind(addr).await?;
        let mut relay_addr = conn.local_addr().await?;
        relay_addr.set_ip(self.relay_address);
        Ok((conn, relay_addr))
    }
}
