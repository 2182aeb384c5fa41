//! HTTP clients for the services convergence talks to.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use data_model::{ActualLrpInstanceKey, ActualLrpKey, CellPresence, CellSet, LrpStartRequest};
use processor::{Auctioneer, CellClient, CellClientError, CellRegistry};
use reqwest::StatusCode;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context("error building http client")
}

pub struct HttpAuctioneerClient {
    client: reqwest::Client,
    url: String,
}

impl HttpAuctioneerClient {
    pub fn new(auctioneer_url: &str) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            url: format!("{}/v1/lrps/auctions", auctioneer_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl Auctioneer for HttpAuctioneerClient {
    async fn request_lrp_starts(&self, requests: Vec<LrpStartRequest>) -> Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .json(&requests)
            .send()
            .await
            .map_err(|e| anyhow!("unable to reach auctioneer: {}", e))?;
        if !resp.status().is_success() {
            return Err(anyhow!(
                "auctioneer rejected start requests: status: {}, error: {}",
                resp.status(),
                resp.text().await.unwrap_or_default()
            ));
        }
        Ok(())
    }
}

/// Cell registry backed by the cells listed in the configuration.
pub struct StaticCellRegistry {
    cells: CellSet,
}

impl StaticCellRegistry {
    pub fn new(cells: impl IntoIterator<Item = CellPresence>) -> Self {
        Self {
            cells: cells.into_iter().collect(),
        }
    }
}

#[async_trait]
impl CellRegistry for StaticCellRegistry {
    async fn list_cells(&self) -> Result<CellSet> {
        Ok(self.cells.clone())
    }
}

/// Talks to the rep running on each cell.
pub struct HttpCellClient {
    client: reqwest::Client,
}

impl HttpCellClient {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: http_client()?,
        })
    }
}

#[async_trait]
impl CellClient for HttpCellClient {
    async fn stop_lrp(
        &self,
        cell: &CellPresence,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<(), CellClientError> {
        let url = format!(
            "{}/v1/lrps/{}/instances/{}/stop",
            cell.rep_address.trim_end_matches('/'),
            key.process_guid,
            instance_key.instance_guid
        );
        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| anyhow!("unable to reach cell {}: {}", cell.cell_id, e))?;
        match resp.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(CellClientError::NotFound(cell.cell_id.clone())),
            status => Err(anyhow!(
                "cell {} failed to stop lrp: status: {}, error: {}",
                cell.cell_id,
                status,
                resp.text().await.unwrap_or_default()
            )
            .into()),
        }
    }
}
