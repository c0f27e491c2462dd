use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;

use stun::attributes::*;
use stun::error_code::*;
use stun::fingerprint::FINGERPRINT;
use stun::integrity::MessageIntegrity;
use stun::message::*;
use stun::textattrs::TextAttribute;
use stun::xoraddr::XorMappedAddress;
use tokio::time::{Duration, Instant};
use util::Conn;

use super::config::Options;
use crate::allocation::allocation_manager::Manager;
use crate::allocation::five_tuple::FiveTuple;
use crate::allocation::send_with_deadline;
use crate::auth::AuthHandler;
use crate::error::*;
use crate::nonce::{NonceManager, NonceStatus};
use crate::proto::chandata::ChannelData;
use crate::proto::channum::ChannelNumber;
use crate::proto::data::Data;
use crate::proto::lifetime::Lifetime;
use crate::proto::peeraddr::PeerAddress;
use crate::proto::relayaddr::RelayedAddress;
use crate::proto::reqtrans::RequestedTransport;
use crate::proto::PROTO_UDP;

pub(crate) const INBOUND_MTU: usize = 1500;

/// Authentication state a request accumulates; the response builder emits
/// whatever is present, in its fixed slot of the attribute order.
#[derive(Default)]
struct AuthContext {
    nonce: Option<String>,
    realm: Option<String>,
    integrity_key: Option<Vec<u8>>,
    username: Option<TextAttribute>,
}

/// `Request` handles one inbound datagram end to end: classify,
/// authenticate, dispatch, respond.
pub struct Request {
    pub conn: Arc<dyn Conn + Send + Sync>,
    pub src_addr: SocketAddr,
    pub dst_addr: SocketAddr,
    pub buff: Vec<u8>,
    pub allocation_manager: Arc<Manager>,
    pub nonces: Arc<NonceManager>,
    pub auth_handler: Option<Arc<dyn AuthHandler + Send + Sync>>,
    pub options: Arc<Options>,
    pub now: Instant,
}

impl Request {
    /// Processes the datagram in `buff`, producing at most one response on
    /// `conn`. Garbage that is neither STUN nor ChannelData is dropped
    /// without a trace besides a log line.
    pub async fn handle_request(&mut self) -> Result<()> {
        log::debug!(
            "received {} bytes of udp from {} on {:?}",
            self.buff.len(),
            self.src_addr,
            self.conn.local_addr().await,
        );

        if is_message(&self.buff) {
            self.handle_stun_packet().await
        } else if ChannelData::is_channel_data(&self.buff) {
            self.handle_data_packet().await
        } else {
            log::trace!("dropping non-STUN, non-ChannelData datagram from {}", self.src_addr);
            Ok(())
        }
    }

    async fn handle_data_packet(&mut self) -> Result<()> {
        log::debug!("received DataPacket from {}", self.src_addr);

        let mut channel_data = ChannelData {
            raw: mem::take(&mut self.buff),
            ..Default::default()
        };
        channel_data
            .decode()
            .map_err(|_| Error::ErrFailedToCreateChannelData)?;

        let five_tuple = self.five_tuple();
        // ChannelData never produces a response; a missing binding only
        // drops the payload.
        if let Err(err) = self
            .allocation_manager
            .relay_to_channel(&five_tuple, channel_data.number, &channel_data.data, self.now)
            .await
        {
            log::debug!(
                "dropping ChannelData {} from {}: {}",
                channel_data.number,
                self.src_addr,
                err
            );
        }

        Ok(())
    }

    async fn handle_stun_packet(&mut self) -> Result<()> {
        let mut m = Message::new();
        m.raw = mem::take(&mut self.buff);
        // A datagram that looks like STUN but does not decode is dropped
        // silently.
        m.decode().map_err(|_| Error::ErrFailedToCreateStunpacket)?;

        self.process_message(m).await
    }

    async fn process_message(&mut self, mut m: Message) -> Result<()> {
        let class = m.typ.class;
        let method = m.typ.method;

        log::debug!("received {} of size {} from {}", m.typ, m.raw.len(), self.src_addr);

        if m.contains(ATTR_FINGERPRINT) && FINGERPRINT.check(&m).is_err() {
            self.respond_error(&m, &AuthContext::default(), CODE_BAD_REQUEST)
                .await?;
            return Ok(());
        }

        // Auth is required whenever an authenticator is configured, except
        // for indications, and for Binding requests unless auth-for-STUN is
        // on.
        let needs_auth = self.auth_handler.is_some()
            && class != CLASS_INDICATION
            && (!(method == METHOD_BINDING && class == CLASS_REQUEST)
                || self.options.auth_for_stun);

        let ctx = if needs_auth {
            match self.authenticate(&mut m).await? {
                Some(ctx) => ctx,
                // A challenge or denial went out (or an unauthenticated
                // indication was dropped); this datagram is done.
                None => return Ok(()),
            }
        } else {
            AuthContext::default()
        };

        match (method, class) {
            (METHOD_BINDING, CLASS_REQUEST) => self.handle_binding_request(&m, &ctx).await,
            (METHOD_ALLOCATE, CLASS_REQUEST) => self.handle_allocate_request(&m, &ctx).await,
            (METHOD_REFRESH, CLASS_REQUEST) => self.handle_refresh_request(&m, &ctx).await,
            (METHOD_CREATE_PERMISSION, CLASS_REQUEST) => {
                self.handle_create_permission_request(&m, &ctx).await
            }
            (METHOD_CHANNEL_BIND, CLASS_REQUEST) => {
                self.handle_channel_bind_request(&m, &ctx).await
            }
            (METHOD_SEND, CLASS_INDICATION) => self.handle_send_indication(&m).await,
            (METHOD_BINDING, CLASS_INDICATION) => Ok(()),
            _ => {
                self.respond_error(&m, &ctx, CODE_BAD_REQUEST).await?;
                Err(Error::ErrUnexpectedMethod)
            }
        }
    }

    // https://tools.ietf.org/html/rfc5389#section-10.2
    async fn authenticate(&mut self, m: &mut Message) -> Result<Option<AuthContext>> {
        // NONCE may be absent; that simply presents the empty value.
        let presented = TextAttribute::get_from_as(m, ATTR_NONCE)
            .map(|n| n.text)
            .unwrap_or_default();

        let (nonce, status) = self
            .nonces
            .check(self.five_tuple(), &presented, self.now)
            .await;

        let mut ctx = AuthContext {
            nonce: Some(nonce),
            realm: Some(self.options.realm.clone()),
            ..Default::default()
        };

        if !m.contains(ATTR_MESSAGE_INTEGRITY) {
            self.respond_error(m, &ctx, CODE_UNAUTHORIZED).await?;
            return Ok(None);
        }

        if status == NonceStatus::Stale {
            self.respond_error(m, &ctx, CODE_STALE_NONCE).await?;
            return Ok(None);
        }

        let (username, realm) = match (
            TextAttribute::get_from_as(m, ATTR_USERNAME),
            TextAttribute::get_from_as(m, ATTR_REALM),
        ) {
            (Ok(u), Ok(r)) => (u, r),
            _ => {
                self.respond_error(m, &ctx, CODE_UNAUTHORIZED).await?;
                return Ok(None);
            }
        };

        let auth_handler = match &self.auth_handler {
            Some(h) => h,
            None => return Ok(Some(ctx)),
        };

        let key = match auth_handler.auth_handle(&username.text, &realm.text, self.src_addr) {
            Ok(key) => key,
            Err(err) => {
                log::warn!(
                    "no such user exists or auth failed: {} from {}: {}",
                    username.text,
                    self.src_addr,
                    err
                );
                self.respond_error(m, &ctx, CODE_UNAUTHORIZED).await?;
                return Ok(None);
            }
        };

        if MessageIntegrity(key.clone()).check(m).is_err() {
            log::warn!(
                "MESSAGE-INTEGRITY mismatch for user {} from {}",
                username.text,
                self.src_addr
            );
            self.respond_error(m, &ctx, CODE_UNAUTHORIZED).await?;
            return Ok(None);
        }

        ctx.integrity_key = Some(key);
        ctx.username = Some(username);
        Ok(Some(ctx))
    }

    // https://tools.ietf.org/html/rfc5389#section-7.3.1
    async fn handle_binding_request(&mut self, m: &Message, ctx: &AuthContext) -> Result<()> {
        log::debug!("received BindingRequest from {}", self.src_addr);

        let attrs: Vec<Box<dyn Setter>> = vec![Box::new(XorMappedAddress {
            ip: self.src_addr.ip(),
            port: self.src_addr.port(),
        })];

        self.respond(m, MessageType::new(METHOD_BINDING, CLASS_SUCCESS_RESPONSE), ctx, attrs)
            .await
    }

    // https://tools.ietf.org/html/rfc5766#section-6.2
    async fn handle_allocate_request(&mut self, m: &Message, ctx: &AuthContext) -> Result<()> {
        log::debug!("received AllocateRequest from {}", self.src_addr);

        let mut requested_transport = RequestedTransport::default();
        if requested_transport.get_from(m).is_err()
            || requested_transport.protocol != PROTO_UDP
        {
            return self.respond_error(m, ctx, CODE_BAD_REQUEST).await;
        }

        let five_tuple = self.five_tuple();
        let lifetime = self.options.default_lifetime;
        let username = ctx
            .username
            .clone()
            .unwrap_or_else(|| TextAttribute::new(ATTR_USERNAME, String::new()));

        let relay_addr = match self
            .allocation_manager
            .create_allocation(
                five_tuple,
                Arc::clone(&self.conn),
                self.now + lifetime,
                self.now,
                username,
            )
            .await
        {
            Ok(addr) => addr,
            Err(Error::ErrDupeFiveTuple) => {
                return self.respond_error(m, ctx, CODE_ALLOC_MISMATCH).await;
            }
            Err(err) => {
                log::warn!("failed to allocate relay for {}: {}", five_tuple, err);
                return self.respond_error(m, ctx, CODE_SERVER_ERROR).await;
            }
        };

        let attrs: Vec<Box<dyn Setter>> = vec![
            Box::new(XorMappedAddress {
                ip: self.src_addr.ip(),
                port: self.src_addr.port(),
            }),
            Box::new(RelayedAddress {
                ip: relay_addr.ip(),
                port: relay_addr.port(),
            }),
            Box::new(Lifetime(lifetime)),
        ];

        self.respond(m, MessageType::new(METHOD_ALLOCATE, CLASS_SUCCESS_RESPONSE), ctx, attrs)
            .await
    }

    // https://tools.ietf.org/html/rfc5766#section-7.2
    async fn handle_refresh_request(&mut self, m: &Message, ctx: &AuthContext) -> Result<()> {
        log::debug!("received RefreshRequest from {}", self.src_addr);

        let lifetime = self.requested_lifetime(m);
        let five_tuple = self.five_tuple();

        let result = if lifetime == Duration::from_secs(0) {
            self.allocation_manager.delete_allocation(&five_tuple).await
        } else {
            self.allocation_manager
                .refresh_allocation(&five_tuple, self.now + lifetime)
                .await
        };

        match result {
            Ok(()) => {
                let attrs: Vec<Box<dyn Setter>> = vec![Box::new(Lifetime(lifetime))];
                self.respond(
                    m,
                    MessageType::new(METHOD_REFRESH, CLASS_SUCCESS_RESPONSE),
                    ctx,
                    attrs,
                )
                .await
            }
            Err(Error::ErrNoAllocationFound) => {
                self.respond_error(m, ctx, CODE_ALLOC_MISMATCH).await
            }
            Err(err) => {
                log::warn!("refresh failed for {}: {}", five_tuple, err);
                self.respond_error(m, ctx, CODE_SERVER_ERROR).await
            }
        }
    }

    // https://tools.ietf.org/html/rfc5766#section-9.2
    async fn handle_create_permission_request(
        &mut self,
        m: &Message,
        ctx: &AuthContext,
    ) -> Result<()> {
        log::debug!("received CreatePermission from {}", self.src_addr);

        let mut peer = PeerAddress::default();
        if peer.get_from(m).is_err() {
            return self.respond_error(m, ctx, CODE_BAD_REQUEST).await;
        }

        if !self.options.peer_rules.allows(peer.ip) {
            return self.respond_error(m, ctx, CODE_FORBIDDEN).await;
        }

        let lifetime = self.requested_lifetime(m);
        let five_tuple = self.five_tuple();

        match self
            .allocation_manager
            .create_permission(
                &five_tuple,
                SocketAddr::new(peer.ip, peer.port),
                self.now + lifetime,
            )
            .await
        {
            Ok(()) => {
                let attrs: Vec<Box<dyn Setter>> = vec![Box::new(Lifetime(lifetime))];
                self.respond(
                    m,
                    MessageType::new(METHOD_CREATE_PERMISSION, CLASS_SUCCESS_RESPONSE),
                    ctx,
                    attrs,
                )
                .await
            }
            Err(Error::ErrNoAllocationFound) => {
                self.respond_error(m, ctx, CODE_ALLOC_MISMATCH).await
            }
            Err(err) => {
                log::warn!("create permission failed for {}: {}", five_tuple, err);
                self.respond_error(m, ctx, CODE_SERVER_ERROR).await
            }
        }
    }

    // https://tools.ietf.org/html/rfc5766#section-11.2
    async fn handle_channel_bind_request(
        &mut self,
        m: &Message,
        ctx: &AuthContext,
    ) -> Result<()> {
        log::debug!("received ChannelBindRequest from {}", self.src_addr);

        let mut peer = PeerAddress::default();
        let mut number = ChannelNumber::default();
        if peer.get_from(m).is_err() || number.get_from(m).is_err() {
            return self.respond_error(m, ctx, CODE_BAD_REQUEST).await;
        }

        if !self.options.peer_rules.allows(peer.ip) {
            return self.respond_error(m, ctx, CODE_FORBIDDEN).await;
        }

        let five_tuple = self.five_tuple();

        match self
            .allocation_manager
            .channel_bind(
                &five_tuple,
                number,
                SocketAddr::new(peer.ip, peer.port),
                self.now + self.options.channel_bind_lifetime,
            )
            .await
        {
            Ok(()) => {
                self.respond(
                    m,
                    MessageType::new(METHOD_CHANNEL_BIND, CLASS_SUCCESS_RESPONSE),
                    ctx,
                    vec![],
                )
                .await
            }
            Err(Error::ErrInvalidChannelNumber) => {
                self.respond_error(m, ctx, CODE_BAD_REQUEST).await
            }
            Err(Error::ErrNoAllocationFound) | Err(Error::ErrSameChannelDifferentPeer) => {
                self.respond_error(m, ctx, CODE_ALLOC_MISMATCH).await
            }
            Err(err) => {
                log::warn!("channel bind failed for {}: {}", five_tuple, err);
                self.respond_error(m, ctx, CODE_SERVER_ERROR).await
            }
        }
    }

    // https://tools.ietf.org/html/rfc5766#section-10.2
    async fn handle_send_indication(&mut self, m: &Message) -> Result<()> {
        log::debug!("received SendIndication from {}", self.src_addr);

        let mut data = Data::default();
        let mut peer = PeerAddress::default();
        if data.get_from(m).is_err() || peer.get_from(m).is_err() {
            // Indications never produce a response, malformed included.
            return Ok(());
        }

        let five_tuple = self.five_tuple();
        if let Err(err) = self
            .allocation_manager
            .relay(
                &five_tuple,
                SocketAddr::new(peer.ip, peer.port),
                &data.0,
                self.now,
            )
            .await
        {
            log::debug!(
                "dropping SendIndication to {} from {}: {}",
                peer,
                self.src_addr,
                err
            );
        }

        Ok(())
    }

    fn five_tuple(&self) -> FiveTuple {
        FiveTuple {
            protocol: PROTO_UDP,
            src_addr: self.src_addr,
            dst_addr: self.dst_addr,
        }
    }

    /// Optional LIFETIME, clamped to `[0, max_lifetime]`; absent means the
    /// default.
    fn requested_lifetime(&self, m: &Message) -> Duration {
        let mut lifetime = Lifetime::default();
        if lifetime.get_from(m).is_ok() {
            lifetime.clamped(self.options.max_lifetime)
        } else {
            self.options.default_lifetime
        }
    }

    /// Builds and writes a response with the fixed attribute order: header,
    /// NONCE, REALM, SOFTWARE, handler attributes, MESSAGE-INTEGRITY,
    /// FINGERPRINT. Write failures are logged and abandoned.
    async fn respond(
        &self,
        req: &Message,
        typ: MessageType,
        ctx: &AuthContext,
        attrs: Vec<Box<dyn Setter>>,
    ) -> Result<()> {
        let mut setters: Vec<Box<dyn Setter>> =
            vec![Box::new(typ), Box::new(req.transaction_id)];

        if let Some(nonce) = &ctx.nonce {
            setters.push(Box::new(TextAttribute::new(ATTR_NONCE, nonce.clone())));
        }
        if let Some(realm) = &ctx.realm {
            setters.push(Box::new(TextAttribute::new(ATTR_REALM, realm.clone())));
        }
        if let Some(software) = &self.options.software {
            setters.push(Box::new(TextAttribute::new(
                ATTR_SOFTWARE,
                software.clone(),
            )));
        }

        setters.extend(attrs);

        if let Some(key) = &ctx.integrity_key {
            setters.push(Box::new(MessageIntegrity(key.clone())));
        }
        setters.push(Box::new(FINGERPRINT));

        let mut msg = Message::new();
        {
            let setters = setters;
            msg.build(&setters)?;
        }

        if let Err(err) = send_with_deadline(&self.conn, &msg.raw, self.src_addr).await {
            log::error!("failed to write {} to {}: {}", msg.typ, self.src_addr, err);
        }

        Ok(())
    }

    /// Error response for a request; indications are dropped instead.
    async fn respond_error(
        &self,
        req: &Message,
        ctx: &AuthContext,
        code: ErrorCode,
    ) -> Result<()> {
        if req.typ.class != CLASS_REQUEST {
            return Ok(());
        }

        let typ = MessageType::new(req.typ.method, CLASS_ERROR_RESPONSE);
        self.respond(req, typ, ctx, vec![Box::new(code)]).await
    }
}
