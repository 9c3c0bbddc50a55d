//! REST-backed [`HostClient`] implementation against the host agent running
//! on each hypervisor.
//!
//! The agent exposes a small JSON API under `https://{host}/api/v1` with
//! basic authentication using the credentials from the pool topology. Lab
//! hosts use self-signed certificates. Mutating endpoints block until the
//! underlying host task completes.

use anyhow::Result;
use async_trait::async_trait;
use log::debug;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::json;

use gwbench_rs::host::{HostClient, HostError, SnapshotNode, VmInfo};
use gwbench_rs::pool::HostSpec;
use gwbench_rs::tag::PowerStatus;

#[derive(Debug, Deserialize)]
struct VmRecord {
    id: String,
    power_state: String,
    #[serde(default)]
    annotation: String,
}

pub struct HostAgentClient {
    client: Client,
}

impl HostAgentClient {
    pub fn new() -> Result<HostAgentClient> {
        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(HostAgentClient { client })
    }

    fn url(host: &HostSpec, path: &str) -> String {
        format!("https://{}/api/v1{path}", host.address)
    }

    fn authed(&self, builder: RequestBuilder, host: &HostSpec) -> RequestBuilder {
        builder.basic_auth(&host.username, Some(&host.password))
    }

    async fn expect_success(response: Response) -> Result<Response, HostError> {
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(HostError::Api(format!("HTTP {status}: {detail}")));
        }
        Ok(response)
    }

    async fn send(
        &self,
        host: &HostSpec,
        builder: RequestBuilder,
    ) -> Result<Response, HostError> {
        let response = self
            .authed(builder, host)
            .send()
            .await
            .map_err(|e| HostError::Transport(e.to_string()))?;
        Self::expect_success(response).await
    }
}

#[async_trait]
impl HostClient for HostAgentClient {
    async fn find_vm(&self, host: &HostSpec, name: &str) -> Result<VmInfo, HostError> {
        let url = Self::url(host, "/vms");
        debug!("GET {url} name={name}");
        let response = self
            .send(host, self.client.get(&url).query(&[("name", name)]))
            .await?;
        let records: Vec<VmRecord> = response
            .json()
            .await
            .map_err(|e| HostError::Api(format!("invalid VM listing: {e}")))?;
        // The agent filters by name; if it ever reports several, the first
        // one wins, matching inventory-order convention elsewhere.
        let record = records
            .into_iter()
            .next()
            .ok_or_else(|| HostError::VmNotFound(name.to_string()))?;
        Ok(VmInfo {
            id: record.id,
            power: PowerStatus::parse(&record.power_state),
            annotation: record.annotation,
        })
    }

    async fn set_annotation(
        &self,
        host: &HostSpec,
        vm_id: &str,
        annotation: &str,
    ) -> Result<(), HostError> {
        let url = Self::url(host, &format!("/vms/{vm_id}/annotation"));
        debug!("PUT {url}");
        self.send(
            host,
            self.client
                .put(&url)
                .json(&json!({ "annotation": annotation })),
        )
        .await?;
        Ok(())
    }

    async fn snapshot_tree(
        &self,
        host: &HostSpec,
        vm_id: &str,
    ) -> Result<Vec<SnapshotNode>, HostError> {
        let url = Self::url(host, &format!("/vms/{vm_id}/snapshots"));
        debug!("GET {url}");
        let response = self.send(host, self.client.get(&url)).await?;
        response
            .json()
            .await
            .map_err(|e| HostError::Api(format!("invalid snapshot tree: {e}")))
    }

    async fn revert_to_snapshot(
        &self,
        host: &HostSpec,
        vm_id: &str,
        snapshot_id: &str,
    ) -> Result<(), HostError> {
        let url = Self::url(host, &format!("/vms/{vm_id}/snapshots/{snapshot_id}/revert"));
        debug!("POST {url}");
        self.send(host, self.client.post(&url)).await?;
        Ok(())
    }

    async fn revert_to_current(&self, host: &HostSpec, vm_id: &str) -> Result<(), HostError> {
        let url = Self::url(host, &format!("/vms/{vm_id}/snapshots/current/revert"));
        debug!("POST {url}");
        self.send(host, self.client.post(&url)).await?;
        Ok(())
    }

    async fn power_on(&self, host: &HostSpec, vm_id: &str) -> Result<(), HostError> {
        let url = Self::url(host, &format!("/vms/{vm_id}/power/on"));
        debug!("POST {url}");
        self.send(host, self.client.post(&url)).await?;
        Ok(())
    }

    async fn create_snapshot(
        &self,
        host: &HostSpec,
        vm_id: &str,
        name: &str,
    ) -> Result<(), HostError> {
        let url = Self::url(host, &format!("/vms/{vm_id}/snapshots"));
        debug!("POST {url} name={name}");
        self.send(host, self.client.post(&url).json(&json!({ "name": name })))
            .await?;
        Ok(())
    }

    async fn remove_snapshot(
        &self,
        host: &HostSpec,
        vm_id: &str,
        snapshot_id: &str,
    ) -> Result<(), HostError> {
        let url = Self::url(host, &format!("/vms/{vm_id}/snapshots/{snapshot_id}"));
        debug!("DELETE {url}");
        self.send(host, self.client.delete(&url)).await?;
        Ok(())
    }
}
