
use std::collections::HashMap;

use rand::{thread_rng, Rng};
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

use crate::allocation::five_tuple::FiveTuple;

/// NONCE_RAW_LENGTH random bytes rendered as lowercase hex make up a nonce
/// value, so the wire form is 24 characters.
const NONCE_RAW_LENGTH: usize = 12;

/// DEFAULT_NONCE_CAP bounds the record table; one record exists per distinct
/// 5-tuple that ever authenticated.
pub const DEFAULT_NONCE_CAP: usize = 8192;

/// Outcome of a nonce check. `Stale` steers the client through the 401/438
/// challenge loop with the authoritative value that was returned alongside.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum NonceStatus {
    Valid,
    Stale,
}

struct NonceRecord {
    value: String,
    // None means the value never rotates.
    valid_until: Option<Instant>,
    last_seen: Instant,
}

impl NonceRecord {
    fn is_valid(&self, now: Instant) -> bool {
        match self.valid_until {
            None => true,
            Some(until) => until > now,
        }
    }
}

/// `NonceManager` issues, validates and rotates the opaque nonce for each
/// client 5-tuple.
///
/// Never answering `Stale` would void the replay protection of RFC 5766
/// Section 4, so an unknown tuple, a mismatched value and an expired record
/// all come back stale together with the value the client must use next.
pub struct NonceManager {
    duration: Duration,
    cap: usize,
    records: Mutex<HashMap<FiveTuple, NonceRecord>>,
}

impl NonceManager {
    /// `duration` is the rotation period; zero means issued nonces never
    /// rotate.
    pub fn new(duration: Duration, cap: usize) -> Self {
        NonceManager {
            duration,
            cap: std::cmp::max(cap, 1),
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Validates the nonce `presented` by `tuple` and returns the
    /// authoritative value. Missing, mismatched or expired nonces rotate the
    /// record and come back [`NonceStatus::Stale`].
    pub async fn check(
        &self,
        tuple: FiveTuple,
        presented: &str,
        now: Instant,
    ) -> (String, NonceStatus) {
        let mut records = self.records.lock().await;

        if let Some(record) = records.get_mut(&tuple) {
            record.last_seen = now;
            if record.is_valid(now) {
                let status = if record.value == presented {
                    NonceStatus::Valid
                } else {
                    NonceStatus::Stale
                };
                return (record.value.clone(), status);
            }

            record.value = new_nonce();
            record.valid_until = self.valid_until(now);
            return (record.value.clone(), NonceStatus::Stale);
        }

        if records.len() >= self.cap {
            evict_oldest(&mut records);
        }

        let value = new_nonce();
        records.insert(
            tuple,
            NonceRecord {
                value: value.clone(),
                valid_until: self.valid_until(now),
                last_seen: now,
            },
        );
        (value, NonceStatus::Stale)
    }

    /// Number of tracked records.
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    fn valid_until(&self, now: Instant) -> Option<Instant> {
        if self.duration == Duration::from_secs(0) {
            None
        } else {
            Some(now + self.duration)
        }
    }
}

fn new_nonce() -> String {
    let mut raw = [0u8; NONCE_RAW_LENGTH];
    thread_rng().fill(&mut raw[..]);
    hex::encode(raw)
}

fn evict_oldest(records: &mut HashMap<FiveTuple, NonceRecord>) {
    let oldest = records
        .iter()
        .min_by_key(|(_, r)| r.last_seen)
        .map(|(k, _)| *k);
    if let Some(key) = oldest {
        records.remove(&key);
    }
}
