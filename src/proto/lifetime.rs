#[cfg(test)]
mod lifetime_test;

use std::fmt;
use std::time::Duration;

use stun::attributes::ATTR_LIFETIME;
use stun::checks::*;
use stun::message::*;

/// DEFAULT_LIFETIME is the lifetime an allocation gets when the client does
/// not ask for a specific one.
///
/// RFC 5766 Section 2.2
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(10 * 60);

/// MAX_LIFETIME is the ceiling applied to client-requested lifetimes.
pub const MAX_LIFETIME: Duration = Duration::from_secs(3600);

const LIFETIME_SIZE: usize = 4; // 4 bytes, 32 bits

/// Lifetime represents LIFETIME attribute.
///
/// The LIFETIME attribute represents the duration for which the server
/// will maintain an allocation in the absence of a refresh. Expressed in
/// seconds on the wire.
///
/// RFC 5766 Section 14.2
#[derive(Default, Debug, PartialEq, Eq, Copy, Clone)]
pub struct Lifetime(pub Duration);

impl fmt::Display for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.0.as_secs())
    }
}

impl Setter for Lifetime {
    // add_to adds LIFETIME to message.
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        let v = (self.0.as_secs() as u32).to_be_bytes();
        m.add(ATTR_LIFETIME, &v);
        Ok(())
    }
}

impl Getter for Lifetime {
    // get_from decodes LIFETIME from message.
    fn get_from(&mut self, m: &Message) -> Result<(), stun::Error> {
        let v = m.get(ATTR_LIFETIME)?;

        check_size(ATTR_LIFETIME, v.len(), LIFETIME_SIZE)?;

        let seconds = u32::from_be_bytes([v[0], v[1], v[2], v[3]]);
        self.0 = Duration::from_secs(seconds as u64);

        Ok(())
    }
}

impl Lifetime {
    /// Clamps the carried duration to `[0, max]`.
    pub fn clamped(&self, max: Duration) -> Duration {
        std::cmp::min(self.0, max)
    }
}
