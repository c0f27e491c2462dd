use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use stun::attributes::ATTR_USERNAME;
use stun::textattrs::TextAttribute;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use util::vnet::net::*;

use super::*;
use crate::proto::chandata;
use crate::proto::channum::{MAX_CHANNEL_NUMBER, MIN_CHANNEL_NUMBER};
use crate::proto::data::Data;
use crate::proto::lifetime::DEFAULT_LIFETIME;
use crate::relay::relay_static::RelayAddressGeneratorStatic;

fn new_test_manager() -> Manager {
    Manager::new(ManagerConfig {
        relay_addr_generator: Box::new(RelayAddressGeneratorStatic {
            relay_address: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            address: "127.0.0.1".to_owned(),
            net: Arc::new(Net::new(None)),
        }),
        alloc_close_notify: None,
    })
}

fn random_five_tuple() -> FiveTuple {
    /* #nosec */
    FiveTuple {
        src_addr: SocketAddr::new(Ipv4Addr::new(0, 0, 0, 0).into(), rand::random()),
        dst_addr: SocketAddr::new(Ipv4Addr::new(0, 0, 0, 0).into(), rand::random()),
        ..Default::default()
    }
}

fn test_username() -> Username {
    TextAttribute::new(ATTR_USERNAME, "user".to_owned())
}

async fn turn_socket() -> Result<Arc<dyn Conn + Send + Sync>> {
    Ok(Arc::new(UdpSocket::bind("127.0.0.1:0").await?))
}

#[tokio::test]
async fn test_create_allocation_duplicate_five_tuple() -> Result<()> {
    let m = new_test_manager();
    let now = Instant::now();
    let five_tuple = random_five_tuple();

    m.create_allocation(
        five_tuple,
        turn_socket().await?,
        now + DEFAULT_LIFETIME,
        now,
        test_username(),
    )
    .await?;

    let result = m
        .create_allocation(
            five_tuple,
            turn_socket().await?,
            now + DEFAULT_LIFETIME,
            now,
            test_username(),
        )
        .await;
    assert_eq!(result, Err(Error::ErrDupeFiveTuple));

    m.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_create_allocation_zero_lifetime() -> Result<()> {
    let m = new_test_manager();
    let now = Instant::now();

    let result = m
        .create_allocation(
            random_five_tuple(),
            turn_socket().await?,
            now,
            now,
            test_username(),
        )
        .await;
    assert_eq!(result, Err(Error::ErrLifetimeZero));

    Ok(())
}

#[tokio::test]
async fn test_create_permission_last_write_wins() -> Result<()> {
    let m = new_test_manager();
    let now = Instant::now();
    let five_tuple = random_five_tuple();
    let peer = SocketAddr::from_str("127.0.0.1:56780")?;

    m.create_allocation(
        five_tuple,
        turn_socket().await?,
        now + DEFAULT_LIFETIME,
        now,
        test_username(),
    )
    .await?;

    let t1 = now + Duration::from_secs(60);
    let t2 = now + Duration::from_secs(30);
    m.create_permission(&five_tuple, peer, t1).await?;
    m.create_permission(&five_tuple, peer, t2).await?;

    {
        let allocs = m.allocations.read().await;
        let a = allocs.get(&five_tuple).unwrap();
        assert_eq!(a.permissions.len(), 1, "same peer IP must not duplicate");
        assert_eq!(a.permissions[0].timeout, t2, "last write wins");
    }

    assert_eq!(
        m.create_permission(&random_five_tuple(), peer, t1).await,
        Err(Error::ErrNoAllocationFound)
    );

    m.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_channel_bind_refresh_and_conflicts() -> Result<()> {
    let m = new_test_manager();
    let now = Instant::now();
    let five_tuple = random_five_tuple();
    let peer = SocketAddr::from_str("127.0.0.1:56780")?;
    let number = ChannelNumber(MIN_CHANNEL_NUMBER + 1);

    m.create_allocation(
        five_tuple,
        turn_socket().await?,
        now + DEFAULT_LIFETIME,
        now,
        test_username(),
    )
    .await?;

    let t1 = now + Duration::from_secs(60);
    let t2 = now + Duration::from_secs(120);
    m.channel_bind(&five_tuple, number, peer, t1).await?;
    m.channel_bind(&five_tuple, number, peer, t2).await?;

    {
        let allocs = m.allocations.read().await;
        let a = allocs.get(&five_tuple).unwrap();
        assert_eq!(a.permissions.len(), 1);
        assert_eq!(a.permissions[0].bindings.len(), 1, "refresh must not duplicate");
        assert_eq!(a.permissions[0].bindings[0].timeout, t2);
        assert!(
            a.permissions[0].timeout >= t2,
            "extending a binding extends its permission"
        );
    }

    // Same peer IP, different channel number: conflict.
    assert_eq!(
        m.channel_bind(&five_tuple, ChannelNumber(MIN_CHANNEL_NUMBER + 2), peer, t2)
            .await,
        Err(Error::ErrSameChannelDifferentPeer)
    );

    // Different peer IP, same channel number: conflict.
    let other_peer = SocketAddr::from_str("127.0.0.2:56780")?;
    assert_eq!(
        m.channel_bind(&five_tuple, number, other_peer, t2).await,
        Err(Error::ErrSameChannelDifferentPeer)
    );

    // Unknown tuple: allocation mismatch.
    assert_eq!(
        m.channel_bind(&random_five_tuple(), number, peer, t2).await,
        Err(Error::ErrNoAllocationFound)
    );

    m.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_channel_bind_number_boundaries() -> Result<()> {
    let m = new_test_manager();
    let now = Instant::now();
    let five_tuple = random_five_tuple();
    let peer = SocketAddr::from_str("127.0.0.1:56780")?;
    let timeout = now + DEFAULT_LIFETIME;

    m.create_allocation(
        five_tuple,
        turn_socket().await?,
        timeout,
        now,
        test_username(),
    )
    .await?;

    assert_eq!(
        m.channel_bind(&five_tuple, ChannelNumber(MIN_CHANNEL_NUMBER - 1), peer, timeout)
            .await,
        Err(Error::ErrInvalidChannelNumber),
        "0x3FFF is out of range"
    );
    assert_eq!(
        m.channel_bind(&five_tuple, ChannelNumber(MAX_CHANNEL_NUMBER + 1), peer, timeout)
            .await,
        Err(Error::ErrInvalidChannelNumber),
        "0x8000 is out of range"
    );

    m.channel_bind(&five_tuple, ChannelNumber(MIN_CHANNEL_NUMBER), peer, timeout)
        .await?;

    m.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_refresh_and_delete() -> Result<()> {
    let m = new_test_manager();
    let now = Instant::now();
    let five_tuple = random_five_tuple();

    assert_eq!(
        m.refresh_allocation(&five_tuple, now + DEFAULT_LIFETIME).await,
        Err(Error::ErrNoAllocationFound)
    );
    assert_eq!(
        m.delete_allocation(&five_tuple).await,
        Err(Error::ErrNoAllocationFound)
    );

    m.create_allocation(
        five_tuple,
        turn_socket().await?,
        now + DEFAULT_LIFETIME,
        now,
        test_username(),
    )
    .await?;

    let later = now + Duration::from_secs(3600);
    m.refresh_allocation(&five_tuple, later).await?;
    {
        let allocs = m.allocations.read().await;
        assert_eq!(allocs.get(&five_tuple).unwrap().timeout, later);
    }

    m.delete_allocation(&five_tuple).await?;
    assert!(!m.has_allocation(&five_tuple).await);

    Ok(())
}

#[tokio::test]
async fn test_relay_requires_active_permission() -> Result<()> {
    let m = new_test_manager();
    let now = Instant::now();
    let five_tuple = random_five_tuple();
    let peer = SocketAddr::from_str("127.0.0.1:56780")?;

    m.create_allocation(
        five_tuple,
        turn_socket().await?,
        now + DEFAULT_LIFETIME,
        now,
        test_username(),
    )
    .await?;

    assert_eq!(
        m.relay(&five_tuple, peer, b"hello", now).await,
        Err(Error::ErrNoPermission),
        "no permission yet"
    );

    let t = now + Duration::from_secs(60);
    m.create_permission(&five_tuple, peer, t).await?;
    let n = m.relay(&five_tuple, peer, b"hello", now).await?;
    assert_eq!(n, 5);

    assert_eq!(
        m.relay(&five_tuple, peer, b"hello", t).await,
        Err(Error::ErrNoPermission),
        "an expired permission is absent"
    );

    m.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_relay_to_channel_and_bound_lookup() -> Result<()> {
    let m = new_test_manager();
    let now = Instant::now();
    let five_tuple = random_five_tuple();
    let peer = SocketAddr::from_str("127.0.0.1:56780")?;
    let number = ChannelNumber(MIN_CHANNEL_NUMBER);

    m.create_allocation(
        five_tuple,
        turn_socket().await?,
        now + DEFAULT_LIFETIME,
        now,
        test_username(),
    )
    .await?;

    assert_eq!(
        m.relay_to_channel(&five_tuple, number, b"hello", now).await,
        Err(Error::ErrNoSuchChannelBind)
    );
    assert_eq!(m.channel_for_peer(&five_tuple, peer, now).await, None);

    m.channel_bind(&five_tuple, number, peer, now + Duration::from_secs(60))
        .await?;

    assert_eq!(
        m.channel_for_peer(&five_tuple, peer, now).await,
        Some(number)
    );
    assert_eq!(
        m.channel_for_peer(&five_tuple, SocketAddr::from_str("127.0.0.1:56781")?, now)
            .await,
        None,
        "bound() matches the full peer address"
    );

    let n = m.relay_to_channel(&five_tuple, number, b"hello", now).await?;
    assert_eq!(n, 5);

    m.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_prune_expires_everything() -> Result<()> {
    let m = new_test_manager();
    let now = Instant::now();
    let five_tuple = random_five_tuple();
    let peer = SocketAddr::from_str("127.0.0.1:56780")?;

    m.create_allocation(
        five_tuple,
        turn_socket().await?,
        now + Duration::from_secs(30),
        now,
        test_username(),
    )
    .await?;
    m.create_permission(&five_tuple, peer, now + Duration::from_secs(10))
        .await?;

    assert_eq!(
        m.stats().await,
        Stats {
            allocations: 1,
            permissions: 1,
            bindings: 0
        }
    );

    m.prune(now + Duration::from_secs(10)).await;
    assert_eq!(
        m.stats().await,
        Stats {
            allocations: 1,
            permissions: 0,
            bindings: 0
        },
        "permission expired, allocation survives"
    );

    m.prune(now + Duration::from_secs(30)).await;
    assert_eq!(m.stats().await, Stats::default(), "allocation expired");
    assert!(!m.has_allocation(&five_tuple).await);

    Ok(())
}

#[tokio::test]
async fn test_alloc_close_notify() -> Result<()> {
    let (tx, mut rx) = mpsc::channel(1);
    let m = Manager::new(ManagerConfig {
        relay_addr_generator: Box::new(RelayAddressGeneratorStatic {
            relay_address: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            address: "127.0.0.1".to_owned(),
            net: Arc::new(Net::new(None)),
        }),
        alloc_close_notify: Some(tx),
    });

    let now = Instant::now();
    let five_tuple = random_five_tuple();
    m.create_allocation(
        five_tuple,
        turn_socket().await?,
        now + Duration::from_secs(1),
        now,
        test_username(),
    )
    .await?;

    m.prune(now + Duration::from_secs(1)).await;

    let info = rx
        .recv()
        .await
        .ok_or(Error::Other("notify channel closed".to_owned()))?;
    assert_eq!(info.five_tuple, five_tuple);
    assert_eq!(info.username, "user");

    Ok(())
}

// The full relay path: a peer with a plain permission comes back as a Data
// indication, a peer with a channel binding comes back as ChannelData.
#[tokio::test]
async fn test_packet_handler() -> Result<()> {
    // env_logger::init();

    let turn_socket = UdpSocket::bind("127.0.0.1:0").await?;

    let client_listener = UdpSocket::bind("127.0.0.1:0").await?;
    let src_addr = client_listener.local_addr()?;
    let (data_ch_tx, mut data_ch_rx) = mpsc::channel(1);
    // client listener read data
    tokio::spawn(async move {
        let mut buffer = vec![0u8; RELAY_MTU];
        loop {
            let n = match client_listener.recv_from(&mut buffer).await {
                Ok((n, _)) => n,
                Err(_) => break,
            };

            let _ = data_ch_tx.send(buffer[..n].to_vec()).await;
        }
    });

    let m = new_test_manager();
    let now = Instant::now();
    let five_tuple = FiveTuple {
        src_addr,
        dst_addr: turn_socket.local_addr()?,
        ..Default::default()
    };

    let relay_addr = m
        .create_allocation(
            five_tuple,
            Arc::new(turn_socket),
            now + DEFAULT_LIFETIME,
            now,
            test_username(),
        )
        .await?;

    let peer_listener1 = UdpSocket::bind("127.0.0.1:0").await?;
    let peer_listener2 = UdpSocket::bind("127.0.0.1:0").await?;

    // add permission with peer1 address
    m.create_permission(
        &five_tuple,
        peer_listener1.local_addr()?,
        now + DEFAULT_LIFETIME,
    )
    .await?;
    // add channel with min channel number and peer2 address
    let number = ChannelNumber(MIN_CHANNEL_NUMBER);
    m.channel_bind(
        &five_tuple,
        number,
        peer_listener2.local_addr()?,
        now + DEFAULT_LIFETIME,
    )
    .await?;

    // test for permission and data message
    let target_text = "permission";
    let _ = peer_listener1
        .send_to(target_text.as_bytes(), relay_addr)
        .await?;
    let data = data_ch_rx
        .recv()
        .await
        .ok_or(Error::Other("data ch closed".to_owned()))?;

    // resolve stun data message
    assert!(is_message(&data), "should be stun message");

    let mut msg = Message::new();
    msg.raw = data;
    msg.decode()?;

    let mut msg_data = Data::default();
    msg_data.get_from(&msg)?;
    assert_eq!(
        msg_data.0,
        target_text.as_bytes(),
        "get message doesn't equal the target text"
    );

    // test for channel bind and channel data
    let target_text2 = "channel bind";
    let _ = peer_listener2
        .send_to(target_text2.as_bytes(), relay_addr)
        .await?;
    let data = data_ch_rx
        .recv()
        .await
        .ok_or(Error::Other("data ch closed".to_owned()))?;

    // resolve channel data
    assert!(
        chandata::ChannelData::is_channel_data(&data),
        "should be channel data"
    );

    let mut channel_data = chandata::ChannelData {
        raw: data,
        ..Default::default()
    };
    channel_data.decode()?;
    assert_eq!(channel_data.number, number, "get channel data's channel is wrong");
    assert_eq!(
        channel_data.data,
        target_text2.as_bytes(),
        "get data doesn't equal the target text"
    );

    m.close().await?;
    Ok(())
}
