use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;

use super::*;
use crate::error::Result;

#[test]
fn test_five_tuple_equal() -> Result<()> {
    let src_addr1: SocketAddr = SocketAddr::from_str("0.0.0.0:3478")?;
    let src_addr2: SocketAddr = SocketAddr::from_str("0.0.0.0:3479")?;

    let dst_addr1: SocketAddr = SocketAddr::from_str("0.0.0.0:3480")?;
    let dst_addr2: SocketAddr = SocketAddr::from_str("0.0.0.0:3481")?;

    let tests = vec![
        (
            "Equal",
            true,
            FiveTuple {
                protocol: PROTO_UDP,
                src_addr: src_addr1,
                dst_addr: dst_addr1,
            },
            FiveTuple {
                protocol: PROTO_UDP,
                src_addr: src_addr1,
                dst_addr: dst_addr1,
            },
        ),
        (
            "DifferentProtocol",
            false,
            FiveTuple {
                protocol: Protocol(6),
                src_addr: src_addr1,
                dst_addr: dst_addr1,
            },
            FiveTuple {
                protocol: PROTO_UDP,
                src_addr: src_addr1,
                dst_addr: dst_addr1,
            },
        ),
        (
            "DifferentSrcAddr",
            false,
            FiveTuple {
                protocol: PROTO_UDP,
                src_addr: src_addr1,
                dst_addr: dst_addr1,
            },
            FiveTuple {
                protocol: PROTO_UDP,
                src_addr: src_addr2,
                dst_addr: dst_addr1,
            },
        ),
        (
            "DifferentDstAddr",
            false,
            FiveTuple {
                protocol: PROTO_UDP,
                src_addr: src_addr1,
                dst_addr: dst_addr1,
            },
            FiveTuple {
                protocol: PROTO_UDP,
                src_addr: src_addr1,
                dst_addr: dst_addr2,
            },
        ),
    ];

    for (name, expect, a, b) in tests {
        let fact = a == b;
        assert_eq!(
            expect, fact,
            "{name}: expected {a}, {b} equal check be {expect}, but {fact}"
        );
    }

    Ok(())
}

#[test]
fn test_five_tuple_as_map_key() -> Result<()> {
    let tuple = FiveTuple {
        protocol: PROTO_UDP,
        src_addr: SocketAddr::from_str("127.0.0.1:40000")?,
        dst_addr: SocketAddr::from_str("127.0.0.1:3478")?,
    };

    let mut m = HashMap::new();
    m.insert(tuple, 1);

    let same = FiveTuple {
        protocol: PROTO_UDP,
        src_addr: SocketAddr::from_str("127.0.0.1:40000")?,
        dst_addr: SocketAddr::from_str("127.0.0.1:3478")?,
    };
    assert_eq!(m.get(&same), Some(&1), "same tuple must hit the same slot");

    Ok(())
}
