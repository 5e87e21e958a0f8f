//! HTTP agent channel
//!
//! Posts JSON-encoded commands to the agent running on each host and decodes
//! the tagged [`Answer`] it returns. Anything that prevents an answer from
//! arriving is reported as a [`TransportError`], never as a failure answer.

use crate::config::AgentChannelConfig;
use crate::domain::ports::AgentChannel;
use crate::error::Result;
use crate::protocol::{Answer, Command, Endpoint, RemoteReply, TransportError};
use async_trait::async_trait;
use tracing::{debug, warn};

/// Agent channel speaking JSON over HTTP
pub struct HttpAgentChannel {
    client: reqwest::Client,
    config: AgentChannelConfig,
}

impl HttpAgentChannel {
    pub fn new(config: AgentChannelConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.command_timeout())
            .build()?;

        Ok(Self { client, config })
    }

    fn url(&self, endpoint: &Endpoint) -> String {
        format!(
            "{}://{}:{}{}",
            self.config.scheme, endpoint.address, self.config.port, self.config.request_path
        )
    }

    fn transport_error(&self, endpoint: &Endpoint, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::TimedOut {
                endpoint: endpoint.to_string(),
                after: self.config.command_timeout(),
            }
        } else {
            TransportError::Unreachable {
                endpoint: endpoint.to_string(),
                reason: err.to_string(),
            }
        }
    }
}

#[async_trait]
impl AgentChannel for HttpAgentChannel {
    async fn send(&self, endpoint: &Endpoint, command: Command) -> RemoteReply {
        let url = self.url(endpoint);
        let kind = command.kind();
        debug!("Sending {} to {}", kind, url);

        let response = self
            .client
            .post(&url)
            .json(&command)
            .send()
            .await
            .map_err(|e| self.transport_error(endpoint, e))?;

        let status = response.status();
        if !status.is_success() {
            warn!("Agent {} answered {} with HTTP {}", endpoint, kind, status);
            return Err(TransportError::Unreachable {
                endpoint: endpoint.to_string(),
                reason: format!("HTTP {}", status),
            });
        }

        response
            .json::<Answer>()
            .await
            .map_err(|e| self.transport_error(endpoint, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::host;

    #[test]
    fn test_url_layout() {
        let channel = HttpAgentChannel::new(AgentChannelConfig::default()).unwrap();
        let endpoint = Endpoint::for_host(&host("h1", "c1"));
        assert_eq!(channel.url(&endpoint), "http://h1.lab.local:8250/api/v1/commands");
    }

    #[tokio::test]
    async fn test_refused_connection_is_unreachable() {
        let config = AgentChannelConfig {
            port: 1,
            connect_timeout_secs: 1,
            command_timeout_secs: 2,
            ..Default::default()
        };
        let channel = HttpAgentChannel::new(config).unwrap();
        let endpoint = Endpoint {
            host_id: "h1".into(),
            address: "127.0.0.1".into(),
        };

        let reply = channel
            .send(
                &endpoint,
                Command::CompleteMigration(crate::protocol::CompleteMigrationCommand {
                    vm: crate::testing::vm("vm-1"),
                }),
            )
            .await;
        assert!(matches!(reply, Err(TransportError::Unreachable { .. })));
    }
}
