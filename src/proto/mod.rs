pub mod chandata;
pub mod channum;
pub mod data;
pub mod lifetime;
pub mod peeraddr;
pub mod relayaddr;
pub mod reqtrans;

use std::fmt;

/// DEFAULT_PORT is the IANA assigned port for "stun" and "turn".
pub const DEFAULT_PORT: u16 = 3478;

/// Protocol is an IANA assigned protocol number.
#[derive(PartialEq, Eq, Hash, Copy, Clone, Default, Debug)]
pub struct Protocol(pub u8);

/// PROTO_UDP is IANA assigned protocol number 17 (UDP).
pub const PROTO_UDP: Protocol = Protocol(17);

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let others = format!("{}", self.0);
        let s = if *self == PROTO_UDP {
            "UDP"
        } else {
            others.as_str()
        };

        write!(f, "{s}")
    }
}
