use super::{HashQueue, StoreError};
use r2d2::{Pool, PooledConnection};
use redis::{Client, Commands};
use std::{collections::HashMap, time::Duration};
use tracing::{debug, info};
use url::Url;

pub const SCHEME: &str = "redis";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Redis backed coordination store.
///
/// Hashes map onto `HSET`/`HGETALL`, queues onto `LPUSH` + `BRPOP`. Connections
/// are pooled so a worker blocked in `BRPOP` never holds up state updates.
pub struct RedisStore {
    address: String,
    pool: Pool<Client>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("address", &self.address)
            .field("connections", &self.pool.state().connections)
            .finish()
    }
}

impl RedisStore {
    pub fn connect(url: &str, connections: u32) -> Result<Self, StoreError> {
        let normalized = normalize_url(url)?;
        let address = redacted(url);
        info!(address = %address, "Connecting to Redis coordination store");

        let client = Client::open(normalized.as_str())?;
        let pool = Pool::builder()
            .max_size(connections.max(2))
            .connection_timeout(CONNECT_TIMEOUT)
            .build(client)?;

        let mut connection = pool.get()?;
        let _: () = redis::cmd("PING").query(&mut *connection)?;
        debug!("Redis coordination store is reachable");

        Ok(Self { address, pool })
    }

    fn connection(&self) -> Result<PooledConnection<Client>, StoreError> {
        Ok(self.pool.get()?)
    }
}

/// Accept `redis://password@host:port` next to the standard
/// `redis://:password@host:port` form.
pub fn normalize_url(raw: &str) -> Result<String, StoreError> {
    let mut url = Url::parse(raw).map_err(|_| StoreError::InvalidUrl(raw.to_string()))?;

    if !url.username().is_empty() && url.password().is_none() {
        let password = url.username().to_string();

        url.set_username("")
            .and_then(|_| url.set_password(Some(&password)))
            .map_err(|_| StoreError::InvalidUrl(raw.to_string()))?;
    }

    Ok(url.into())
}

/// strip credentials before an address ends up in a log line
fn redacted(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            let _ = url.set_username("");
            let _ = url.set_password(None);
            url.into()
        }
        Err(_) => String::from("<invalid url>"),
    }
}

impl HashQueue for RedisStore {
    fn address(&self) -> &str {
        &self.address
    }

    fn hash_set(&self, key: &str, fields: &[(&str, &str)]) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }

        let _: () = self.connection()?.hset_multiple(key, fields)?;
        Ok(())
    }

    fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        Ok(self.connection()?.hget(key, field)?)
    }

    fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        Ok(self.connection()?.hgetall(key)?)
    }

    fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }

        let _: () = self.connection()?.del(keys)?;
        Ok(())
    }

    fn push(&self, queue: &str, value: &str) -> Result<(), StoreError> {
        let _: () = self.connection()?.lpush(queue, value)?;
        Ok(())
    }

    fn pop_blocking(&self, queue: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
        let popped: Option<(String, String)> =
            self.connection()?.brpop(queue, timeout.as_secs_f64())?;

        Ok(popped.map(|(_, value)| value))
    }
}
