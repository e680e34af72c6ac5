use crate::{
    config::DaemonInstance,
    error::{Error, Result},
    protocol::{RpcReply, RpcRequest, RpcResponse, UNAUTHORIZED_MESSAGE, UNPARSEABLE_MESSAGE},
    transport::RpcTransport,
};
use futures::future::join_all;
use log::{debug, warn};
use pool_core::time::unix_now;
use serde_json::Value;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tokio::sync::mpsc;

/// Fan-out JSON-RPC access to every configured daemon endpoint.
pub struct DaemonInterface {
    instances: Vec<DaemonInstance>,
    transport: Arc<dyn RpcTransport>,
    next_id: AtomicU64,
}

impl DaemonInterface {
    pub fn new(instances: Vec<DaemonInstance>, transport: Arc<dyn RpcTransport>) -> Self {
        Self { instances, transport, next_id: AtomicU64::new(unix_now()) }
    }

    pub fn instances(&self) -> &[DaemonInstance] {
        &self.instances
    }

    /// Probes every endpoint with `getpeerinfo`; succeeds only if all of them answer without error.
    pub async fn check_initialized(&self) -> Result<()> {
        if self.instances.is_empty() {
            return Err(Error::NoInstances);
        }
        let replies = self.send_commands(&[RpcRequest::new("getpeerinfo", vec![])], false).await;
        let failures = replies
            .into_iter()
            .filter(RpcReply::is_error)
            .filter_map(RpcReply::into_single)
            .collect::<Vec<_>>();
        if failures.is_empty() {
            debug!("[DAEMON] all {} instance(s) online", self.instances.len());
            Ok(())
        } else {
            warn!("[DAEMON] {} of {} instance(s) failed to respond", failures.len(), self.instances.len());
            Err(Error::Offline(failures))
        }
    }

    /// Sends `requests` as one call (or one batch) to the endpoints.
    ///
    /// Without streaming the result holds one reply per endpoint, in configuration
    /// order. With streaming it holds the first successful reply only; slower
    /// endpoints keep running in the background and their replies are dropped.
    /// If every endpoint fails, the last failure is returned.
    pub async fn send_commands(&self, requests: &[RpcRequest], streaming: bool) -> Vec<RpcReply> {
        if requests.is_empty() {
            return vec![RpcReply::Single(RpcResponse::no_commands())];
        }
        let body = self.encode(requests);

        if streaming {
            return vec![self.first_success(body).await];
        }
        join_all(self.instances.iter().map(|instance| perform(self.transport.as_ref(), instance, body.clone()))).await
    }

    fn encode(&self, requests: &[RpcRequest]) -> String {
        let body = match requests {
            [single] => single.to_body(self.next_id.fetch_add(1, Ordering::Relaxed)),
            batch => Value::Array(batch.iter().map(|r| r.to_body(self.next_id.fetch_add(1, Ordering::Relaxed))).collect()),
        };
        body.to_string()
    }

    async fn first_success(&self, body: String) -> RpcReply {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        for instance in self.instances.iter().cloned() {
            let transport = self.transport.clone();
            let body = body.clone();
            let sender = sender.clone();
            tokio::spawn(async move {
                let reply = perform(transport.as_ref(), &instance, body).await;
                let _ = sender.send(reply);
            });
        }
        drop(sender);

        let mut last_failure = None;
        while let Some(reply) = receiver.recv().await {
            if !reply.is_error() {
                return reply;
            }
            last_failure = Some(reply);
        }
        last_failure.unwrap_or_else(|| RpcReply::Single(RpcResponse::no_commands()))
    }
}

/// Posts one body to one endpoint and folds every outcome into reply data.
async fn perform(transport: &dyn RpcTransport, instance: &DaemonInstance, body: String) -> RpcReply {
    let host = instance.host.as_str();
    let reply = match transport.post(instance, body).await {
        Ok(reply) => reply,
        Err(err) => {
            let message = match err {
                Error::Transport(message) => message,
                other => other.to_string(),
            };
            debug!("[DAEMON] instance {} unreachable: {}", host, message);
            return RpcReply::Single(RpcResponse::failure(Some(host), &message, None));
        }
    };

    if reply.status == 401 {
        return RpcReply::Single(RpcResponse::failure(Some(host), UNAUTHORIZED_MESSAGE, Some(reply.body)));
    }

    match serde_json::from_str::<Value>(&reply.body) {
        Ok(Value::Array(items)) => RpcReply::Batch(
            items.iter().map(|item| RpcResponse::from_reply(host, item, item.to_string())).collect(),
        ),
        Ok(value @ Value::Object(_)) => RpcReply::Single(RpcResponse::from_reply(host, &value, reply.body)),
        _ => RpcReply::Single(RpcResponse::failure(Some(host), UNPARSEABLE_MESSAGE, Some(reply.body))),
    }
}
