use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::debug;

use crate::error::Result;
use crate::handle::HolderToken;
use crate::store::{LeaseStore, Subscription};

/// Marker published on release; waiters treat any message as a wake and
/// never read state out of it.
const WAKE_PAYLOAD: &str = "released";

/// Delete the entry only while it still holds the caller's token. A plain
/// GET-then-DEL from the client would race an expiry-and-reacquire; the
/// script keeps the check and the delete in one store-side step.
const DELETE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

/// Reset the TTL only while the entry still holds the caller's token.
const EXTEND_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('pexpire', KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Redis implementation of the store primitives.
///
/// Acquisition is `SET key token NX PX ttl`; release and extend run the
/// token-checked Lua scripts above; release notifications ride Redis
/// pub/sub. Transport failures map to `StoreUnavailable`.
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    delete_script: Script,
    extend_script: Script,
}

impl RedisStore {
    /// Connect to a Redis instance, e.g. `redis://127.0.0.1:6379/`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        debug!(url, "connected to redis");
        Ok(Self {
            client,
            conn,
            delete_script: Script::new(DELETE_SCRIPT),
            extend_script: Script::new(EXTEND_SCRIPT),
        })
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    // PX 0 is rejected by the server.
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl LeaseStore for RedisStore {
    async fn try_put(&self, key: &str, token: &HolderToken, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token.as_str())
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn conditional_delete(&self, key: &str, token: &HolderToken) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .delete_script
            .key(key)
            .arg(token.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn conditional_extend(
        &self,
        key: &str,
        token: &HolderToken,
        ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .extend_script
            .key(key)
            .arg(token.as_str())
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn publish(&self, channel: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(WAKE_PAYLOAD)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        Ok(Box::new(RedisSubscription {
            channel: channel.to_string(),
            pubsub: Some(pubsub),
        }))
    }
}

struct RedisSubscription {
    channel: String,
    pubsub: Option<redis::aio::PubSub>,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn recv(&mut self, timeout: Duration) -> Result<bool> {
        let Some(pubsub) = self.pubsub.as_mut() else {
            return Ok(false);
        };
        let mut messages = pubsub.on_message();
        match tokio::time::timeout(timeout, messages.next()).await {
            Ok(Some(_msg)) => Ok(true),
            Ok(None) => Ok(false),
            Err(_elapsed) => Ok(false),
        }
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        if let Some(mut pubsub) = self.pubsub.take() {
            pubsub.unsubscribe(&self.channel).await?;
        }
        Ok(())
    }
}
