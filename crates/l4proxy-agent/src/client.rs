//! One-shot control RPCs

use crate::agent::AgentError;
use futures::{SinkExt, StreamExt};
use l4proxy_proto::{BackendServiceUser, ClientInfo, ControlCodec, ControlMessage};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

/// Issues listing requests against a control server, one connection per call
#[derive(Debug, Clone)]
pub struct ControlClient {
    server_addr: String,
}

impl ControlClient {
    pub fn new(server_addr: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
        }
    }

    pub fn server_addr(&self) -> &str {
        &self.server_addr
    }

    pub async fn list_clients(&self) -> Result<Vec<ClientInfo>, AgentError> {
        match self.call(ControlMessage::ListClients).await? {
            ControlMessage::Clients { clients } => Ok(clients),
            other => Err(AgentError::UnexpectedMessage(format!("{:?}", other))),
        }
    }

    /// Users of the client registered under `name`
    pub async fn list_users(&self, name: &str) -> Result<Vec<BackendServiceUser>, AgentError> {
        let request = ControlMessage::ListBackendServiceUsers {
            parent: name.to_string(),
        };
        match self.call(request).await? {
            ControlMessage::BackendServiceUsers { users } => Ok(users),
            other => Err(AgentError::UnexpectedMessage(format!("{:?}", other))),
        }
    }

    async fn call(&self, request: ControlMessage) -> Result<ControlMessage, AgentError> {
        let stream = TcpStream::connect(&self.server_addr)
            .await
            .map_err(|source| AgentError::Connect {
                addr: self.server_addr.clone(),
                source,
            })?;
        let mut framed = Framed::new(stream, ControlCodec::new());
        framed.send(request).await?;

        match framed.next().await {
            Some(Ok(ControlMessage::Error { code, message })) => {
                Err(AgentError::Rejected { code, message })
            }
            Some(Ok(response)) => Ok(response),
            Some(Err(e)) => Err(e.into()),
            None => Err(AgentError::StreamClosed),
        }
    }
}
