
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use md5::{Digest, Md5};
use ring::hmac;

use crate::error::*;

pub trait AuthHandler {
    fn auth_handle(&self, username: &str, realm: &str, src_addr: SocketAddr) -> Result<Vec<u8>>;
}

// generate_long_term_credentials can be used to create credentials valid for [duration] time
pub fn generate_long_term_credentials(
    shared_secret: &str,
    duration: Duration,
) -> Result<(String, String)> {
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Error::Other(e.to_string()))?
        + duration;
    let username = format!("{}", t.as_secs());
    let password = long_term_credentials(&username, shared_secret);
    Ok((username, password))
}

fn long_term_credentials(username: &str, shared_secret: &str) -> String {
    let mac = hmac::Key::new(
        hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
        shared_secret.as_bytes(),
    );
    let password = hmac::sign(&mac, username.as_bytes()).as_ref().to_vec();
    base64::encode(password)
}

// generate_auth_key is a convenience function to easily generate keys in the format used by AuthHandler
pub fn generate_auth_key(username: &str, realm: &str, password: &str) -> Vec<u8> {
    let s = format!("{username}:{realm}:{password}");

    let mut h = Md5::new();
    h.update(s.as_bytes());
    h.finalize().as_slice().to_vec()
}

/// One entry of the static credential table.
#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    pub realm: String,
    pub secret: Secret,
}

/// Either a plain password or the precomputed 16-byte long-term key.
#[derive(Debug, Clone)]
pub enum Secret {
    Password(String),
    Key(Vec<u8>),
}

impl Credential {
    pub fn new(username: &str, realm: &str, password: &str) -> Self {
        Credential {
            username: username.to_owned(),
            realm: realm.to_owned(),
            secret: Secret::Password(password.to_owned()),
        }
    }

    pub fn with_key(username: &str, realm: &str, key: Vec<u8>) -> Self {
        Credential {
            username: username.to_owned(),
            realm: realm.to_owned(),
            secret: Secret::Key(key),
        }
    }

    fn integrity_key(&self) -> Vec<u8> {
        match &self.secret {
            Secret::Password(password) => {
                generate_auth_key(&self.username, &self.realm, password)
            }
            Secret::Key(key) => key.clone(),
        }
    }
}

type CredentialTable = HashMap<(String, String), Vec<u8>>;

/// `StaticAuthHandler` authenticates against an immutable (username, realm)
/// -> key table. `replace` swaps the whole snapshot atomically for hot
/// reload; a request keeps whichever snapshot it loaded first.
pub struct StaticAuthHandler {
    table: ArcSwap<CredentialTable>,
}

impl StaticAuthHandler {
    pub fn new<I>(credentials: I) -> Self
    where
        I: IntoIterator<Item = Credential>,
    {
        StaticAuthHandler {
            table: ArcSwap::from_pointee(Self::build_table(credentials)),
        }
    }

    /// Publishes a new credential snapshot.
    pub fn replace<I>(&self, credentials: I)
    where
        I: IntoIterator<Item = Credential>,
    {
        self.table.store(Arc::new(Self::build_table(credentials)));
    }

    fn build_table<I>(credentials: I) -> CredentialTable
    where
        I: IntoIterator<Item = Credential>,
    {
        credentials
            .into_iter()
            .map(|c| {
                let key = c.integrity_key();
                ((c.username, c.realm), key)
            })
            .collect()
    }
}

impl AuthHandler for StaticAuthHandler {
    fn auth_handle(&self, username: &str, realm: &str, src_addr: SocketAddr) -> Result<Vec<u8>> {
        log::trace!(
            "Authentication username={} realm={} src_addr={}",
            username,
            realm,
            src_addr
        );

        let table = self.table.load();
        table
            .get(&(username.to_owned(), realm.to_owned()))
            .cloned()
            .ok_or(Error::ErrNoSuchUser)
    }
}

pub struct LongTermAuthHandler {
    shared_secret: String,
}

impl AuthHandler for LongTermAuthHandler {
    fn auth_handle(&self, username: &str, realm: &str, src_addr: SocketAddr) -> Result<Vec<u8>> {
        log::trace!(
            "Authentication username={} realm={} src_addr={}",
            username,
            realm,
            src_addr
        );

        let t = Duration::from_secs(
            username
                .parse::<u64>()
                .map_err(|e| Error::Other(e.to_string()))?,
        );
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::Other(e.to_string()))?;
        if t < since_epoch {
            return Err(Error::Other(format!(
                "Expired time-windowed username {username}"
            )));
        }

        let password = long_term_credentials(username, &self.shared_secret);
        Ok(generate_auth_key(username, realm, &password))
    }
}

impl LongTermAuthHandler {
    // https://tools.ietf.org/search/rfc5389#section-10.2
    pub fn new(shared_secret: String) -> Self {
        LongTermAuthHandler { shared_secret }
    }
}
