use super::{CopyResult, NodeClient, NodeError, NodeId, NodeLoad, WorkspaceStatus};
use crate::WorkspaceId;
use async_trait::async_trait;
use reqwest::{Client, Response};
use std::time::Duration;
use tracing::debug;

/// Node client over the node's HTTP admin API.
///
/// Only the poll requests carry `poll_timeout`. Copies and deletes are
/// bounded by the caller's batch deadline.
#[derive(Debug, Clone)]
pub struct HttpNodeClient {
    id: NodeId,
    base_url: String,
    client: Client,
    poll_timeout: Duration,
}

impl HttpNodeClient {
    pub fn new(id: &str, address: &str, poll_timeout: Duration) -> Result<Self, NodeError> {
        let client = Client::builder().build()?;
        let base_url = if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address.trim_end_matches('/'))
        };
        Ok(Self {
            id: id.to_string(),
            base_url,
            client,
            poll_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Turn a non-2xx response into a [`NodeError::Status`].
async fn check(resp: Response) -> Result<Response, NodeError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(NodeError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    fn id(&self) -> &str {
        &self.id
    }

    async fn copy(&self, workspace: WorkspaceId, source: &str) -> Result<CopyResult, NodeError> {
        let url = self.url(&format!(
            "/workspaces/{}/fetch?source={}",
            workspace,
            urlencoding::encode(source)
        ));
        debug!("POST {}", url);
        let resp = check(self.client.post(&url).send().await?).await?;
        Ok(resp.json().await?)
    }

    async fn delete(&self, workspace: WorkspaceId) -> Result<(), NodeError> {
        let url = self.url(&format!("/workspaces/{}", workspace));
        debug!("DELETE {}", url);
        check(self.client.delete(&url).send().await?).await?;
        Ok(())
    }

    async fn report_load(&self) -> Result<NodeLoad, NodeError> {
        let req = self.client.get(self.url("/load")).timeout(self.poll_timeout);
        let resp = check(req.send().await?).await?;
        Ok(resp.json().await?)
    }

    async fn poll_status(&self) -> Result<Vec<WorkspaceStatus>, NodeError> {
        let req = self.client.get(self.url("/workspaces/all")).timeout(self.poll_timeout);
        let resp = check(req.send().await?).await?;
        Ok(resp.json().await?)
    }
}
