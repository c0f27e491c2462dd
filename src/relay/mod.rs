pub mod relay_pool;
pub mod relay_static;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use util::Conn;

use crate::error::*;

/// `RelayAddressGenerator` is used to generate a relayed socket when an
/// allocation is created. Implementations decide how the server's outbound
/// ports are managed: fresh system-ephemeral binds, or a pre-allocated pool.
#[async_trait]
pub trait RelayAddressGenerator {
    /// Confirms that this generator is properly configured.
    fn validate(&self) -> Result<()>;

    /// Reserves a relayed socket and returns it together with the address
    /// peers should use to reach it. Closing the returned conn releases the
    /// reservation.
    async fn allocate_conn(
        &self,
        use_ipv4: bool,
        requested_port: u16,
    ) -> Result<(Arc<dyn Conn + Send + Sync>, SocketAddr)>;
}
