use crate::{
    config::DaemonConfig,
    error::Result,
    interface::DaemonInterface,
    protocol::{RpcReply, RpcRequest},
    transport::{HttpTransport, RpcTransport},
};
use log::trace;
use parking_lot::Mutex;
use pool_core::time::unix_now;
use std::{collections::HashMap, sync::Arc};

#[derive(Clone, Debug)]
struct CachedReplies {
    /// Time, in milliseconds, at which the replies were received
    time: u64,
    replies: Vec<RpcReply>,
}

/// Daemon access with short-lived reply caching keyed by the serialized request set.
pub struct Daemon {
    config: DaemonConfig,
    interface: DaemonInterface,
    responses: Mutex<HashMap<String, CachedReplies>>,
}

impl Daemon {
    pub fn new(config: DaemonConfig) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(config.request_timeout)?);
        Ok(Self::with_transport(config, transport))
    }

    pub fn with_transport(config: DaemonConfig, transport: Arc<dyn RpcTransport>) -> Self {
        let interface = DaemonInterface::new(config.instances.clone(), transport);
        Self { config, interface, responses: Mutex::new(HashMap::new()) }
    }

    pub fn interface(&self) -> &DaemonInterface {
        &self.interface
    }

    pub async fn check_instances(&self) -> Result<()> {
        self.interface.check_initialized().await
    }

    /// Sends `requests`, answering from the cache when `cacheable` and a reply to
    /// the identical request set arrived less than `cache_interval` ms ago.
    pub async fn send_commands(&self, requests: &[RpcRequest], cacheable: bool, streaming: bool) -> Vec<RpcReply> {
        let key = cache_key(requests);

        if cacheable {
            if let Some(replies) = self.cached(&key, unix_now()) {
                self.purge_cache(unix_now());
                return replies;
            }
        }

        let replies = self.interface.send_commands(requests, streaming).await;
        let now = unix_now();
        self.responses.lock().insert(key, CachedReplies { time: now, replies: replies.clone() });
        self.purge_cache(now);
        replies
    }

    fn cached(&self, key: &str, now: u64) -> Option<Vec<RpcReply>> {
        let responses = self.responses.lock();
        let entry = responses.get(key)?;
        if entry.time + self.config.cache_interval >= now {
            trace!("[DAEMON] serving cached replies for {}", key);
            Some(entry.replies.clone())
        } else {
            None
        }
    }

    /// Drops every cached reply older than `cache_removal_interval`.
    pub fn purge_cache(&self, now: u64) {
        let threshold = now.saturating_sub(self.config.cache_removal_interval);
        self.responses.lock().retain(|_, entry| entry.time >= threshold);
    }

    pub fn cache_len(&self) -> usize {
        self.responses.lock().len()
    }
}

#[cfg(test)]
impl Daemon {
    fn cached_time(&self, requests: &[RpcRequest]) -> Option<u64> {
        self.responses.lock().get(&cache_key(requests)).map(|entry| entry.time)
    }
}

fn cache_key(requests: &[RpcRequest]) -> String {
    serde_json::to_string(requests).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::DaemonInstance, transport::mock::MockTransport};

    const SINGLE_OK: &str = r#"{"error":null,"result":{"height":100},"instance":"mock"}"#;

    fn daemon(transport: MockTransport) -> (Daemon, Arc<MockTransport>) {
        let transport = Arc::new(transport);
        let config = DaemonConfig::new(vec![DaemonInstance::new("127.0.0.1", 8332, "pool", "pool")]);
        (Daemon::with_transport(config, transport.clone()), transport)
    }

    fn requests() -> Vec<RpcRequest> {
        vec![RpcRequest::new("getblocktemplate", vec![])]
    }

    #[tokio::test]
    async fn test_check_instances() {
        let (daemon, _) = daemon(MockTransport::default().reply("127.0.0.1", 200, SINGLE_OK));
        assert!(daemon.check_instances().await.is_ok());

        let (daemon, _) = self::daemon(MockTransport::default().reply("127.0.0.1", 401, SINGLE_OK));
        let err = daemon.check_instances().await.unwrap_err();
        assert!(err.to_string().contains("Unauthorized RPC access"));
    }

    #[tokio::test]
    async fn test_replies_are_cached() {
        let (daemon, transport) = daemon(MockTransport::default().reply("127.0.0.1", 200, SINGLE_OK));
        let first = daemon.send_commands(&requests(), true, false).await;
        let second = daemon.send_commands(&requests(), true, false).await;
        assert_eq!(first, second);
        assert_eq!(transport.post_count(), 1);
        assert_eq!(daemon.cache_len(), 1);
    }

    #[tokio::test]
    async fn test_uncacheable_always_requests() {
        let (daemon, transport) = daemon(MockTransport::default().reply("127.0.0.1", 200, SINGLE_OK));
        daemon.send_commands(&requests(), false, false).await;
        daemon.send_commands(&requests(), false, false).await;
        assert_eq!(transport.post_count(), 2);
    }

    #[tokio::test]
    async fn test_cache_purge() {
        let (daemon, _) = daemon(MockTransport::default().reply("127.0.0.1", 200, SINGLE_OK));
        daemon.send_commands(&requests(), true, false).await;
        let stored = daemon.cached_time(&requests()).unwrap();

        daemon.purge_cache(stored + 5_000);
        assert_eq!(daemon.cache_len(), 1);
        daemon.purge_cache(stored + 1_000_000);
        assert_eq!(daemon.cache_len(), 0);
    }

    #[tokio::test]
    async fn test_stale_entry_is_refreshed() {
        let (daemon, transport) = daemon(MockTransport::default().reply("127.0.0.1", 200, SINGLE_OK));
        daemon.send_commands(&requests(), true, false).await;
        let stored = daemon.cached_time(&requests()).unwrap();
        assert!(daemon.cached(&cache_key(&requests()), stored + 1_000).is_some());
        assert!(daemon.cached(&cache_key(&requests()), stored + 1_001).is_none());
        assert_eq!(transport.post_count(), 1);
    }
}
