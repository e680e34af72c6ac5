use crate::{config::DaemonInstance, error::Result};
use async_trait::async_trait;
use std::time::Duration;

/// Raw HTTP outcome of posting a JSON-RPC body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

/// Delivers request bodies to a daemon endpoint. `Err` means the endpoint
/// could not be reached at all.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn post(&self, instance: &DaemonInstance, body: String) -> Result<HttpReply>;
}

/// HTTP transport with basic authentication.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout_ms: u64) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(Duration::from_millis(timeout_ms)).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn post(&self, instance: &DaemonInstance, body: String) -> Result<HttpReply> {
        let response = self
            .client
            .post(instance.url())
            .basic_auth(&instance.username, Some(&instance.password))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(HttpReply { status, body })
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use crate::error::Error;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Clone)]
    pub(crate) enum Behavior {
        Reply { status: u16, body: String, delay: Duration },
        Refused,
    }

    /// Scripted per-host transport that records every body it was handed.
    #[derive(Default)]
    pub(crate) struct MockTransport {
        behaviors: Mutex<HashMap<String, Behavior>>,
        pub(crate) posted: Mutex<Vec<(String, String)>>,
    }

    impl MockTransport {
        pub(crate) fn reply(self, host: &str, status: u16, body: &str) -> Self {
            self.delayed_reply(host, status, body, 0)
        }

        pub(crate) fn delayed_reply(self, host: &str, status: u16, body: &str, delay_ms: u64) -> Self {
            let behavior = Behavior::Reply { status, body: body.to_string(), delay: Duration::from_millis(delay_ms) };
            self.behaviors.lock().insert(host.to_string(), behavior);
            self
        }

        pub(crate) fn refuse(self, host: &str) -> Self {
            self.behaviors.lock().insert(host.to_string(), Behavior::Refused);
            self
        }

        pub(crate) fn post_count(&self) -> usize {
            self.posted.lock().len()
        }
    }

    #[async_trait]
    impl RpcTransport for MockTransport {
        async fn post(&self, instance: &DaemonInstance, body: String) -> Result<HttpReply> {
            self.posted.lock().push((instance.host.clone(), body));
            let behavior = self.behaviors.lock().get(&instance.host).cloned().unwrap_or(Behavior::Refused);
            match behavior {
                Behavior::Reply { status, body, delay } => {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    Ok(HttpReply { status, body })
                }
                Behavior::Refused => Err(Error::Transport(format!("connect ECONNREFUSED {}:{}", instance.host, instance.port))),
            }
        }
    }
}
