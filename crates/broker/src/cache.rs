use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use shared::rpc::StatusEvent;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("{0}")]
    Redis(#[from] redis::RedisError),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

/// Redis-backed status cache and pub/sub publisher. Owns two keyspaces:
/// `task_status:{id}` (latest status event, TTL'd) and
/// `backtest:{id}:{ticker}` (per-ticker chart detail, TTL'd), plus the
/// `backtest_updates` pub/sub channel that the API's WebSocket fan-out
/// subscribes to.
#[derive(Clone)]
pub struct Cache {
    conn: ConnectionManager,
    pub_sub_channel: String,
    status_ttl_secs: u64,
    detail_ttl_secs: u64,
}

impl Cache {
    pub async fn connect(
        redis_url: &str,
        pub_sub_channel: &str,
        status_ttl_secs: u64,
        detail_ttl_secs: u64,
    ) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn, pub_sub_channel: pub_sub_channel.to_string(), status_ttl_secs, detail_ttl_secs })
    }

    fn status_key(task_id: &str) -> String {
        format!("task_status:{task_id}")
    }

    fn detail_key(task_id: &str, ticker: &str) -> String {
        format!("backtest:{task_id}:{ticker}")
    }

    /// Write the latest status under `task_status:{id}` and publish it on
    /// `backtest_updates` in the same call, so the API and the worker see a
    /// consistent cache-then-publish ordering.
    pub async fn publish_status(&mut self, event: &StatusEvent) -> Result<(), CacheError> {
        let body = serde_json::to_vec(event)?;
        let key = Self::status_key(event.task_id());
        self.conn.set_ex::<_, _, ()>(&key, &body, self.status_ttl_secs).await?;
        self.conn.publish::<_, _, ()>(&self.pub_sub_channel, &body).await?;
        Ok(())
    }

    pub async fn get_status(&mut self, task_id: &str) -> Result<Option<StatusEvent>, CacheError> {
        let raw: Option<Vec<u8>> = self.conn.get(Self::status_key(task_id)).await?;
        match raw {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn clear_status(&mut self, task_id: &str) -> Result<(), CacheError> {
        let _: () = self.conn.del(Self::status_key(task_id)).await?;
        Ok(())
    }

    /// Cache one ticker's chart detail for the `GET /chart/{task_id}/{ticker}`
    /// lookup. Called once per ticker in the portfolio summary after a
    /// successful backtest.
    pub async fn set_detail(
        &mut self,
        task_id: &str,
        ticker: &str,
        detail: &serde_json::Value,
    ) -> Result<(), CacheError> {
        let body = serde_json::to_vec(detail)?;
        self.conn
            .set_ex::<_, _, ()>(Self::detail_key(task_id, ticker), &body, self.detail_ttl_secs)
            .await?;
        Ok(())
    }

    pub async fn get_detail(
        &mut self,
        task_id: &str,
        ticker: &str,
    ) -> Result<Option<serde_json::Value>, CacheError> {
        let raw: Option<Vec<u8>> = self.conn.get(Self::detail_key(task_id, ticker)).await?;
        match raw {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_by_task_and_ticker() {
        assert_eq!(Cache::status_key("abc123"), "task_status:abc123");
        assert_eq!(Cache::detail_key("abc123", "AAPL"), "backtest:abc123:AAPL");
    }
}
