use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, Script};

use crate::{
    error::Result,
    store::{ttl_secs, KeyTtl, TtlStore},
};

const DELETE_IF_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// [`TtlStore`] backed by a redis server.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    delete_if: Script,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            delete_if: Script::new(DELETE_IF_SCRIPT),
        }
    }

    pub async fn open(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;

        Ok(Self::new(conn))
    }
}

#[async_trait]
impl TtlStore for RedisStore {
    async fn create(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;

        Ok(reply.is_some())
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let mut conn = self.conn.clone();
        let reply: i64 = redis::cmd("TTL").arg(key).query_async(&mut conn).await?;

        Ok(KeyTtl::from_secs(reply))
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;

        Ok(reply)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;

        Ok(reply == 1)
    }

    async fn delete_if(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: i64 = self
            .delete_if
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;

        Ok(reply == 1)
    }
}
