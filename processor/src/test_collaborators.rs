use std::{collections::HashSet, sync::Arc};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use data_model::{ActualLrpInstanceKey, ActualLrpKey, CellId, CellPresence, CellSet, LrpStartRequest};
use tokio::sync::Mutex;

use crate::collaborators::{Auctioneer, CellClient, CellClientError, CellRegistry};

/// Records every batch of start requests it receives.
#[derive(Default, Clone)]
pub struct FakeAuctioneer {
    pub requests: Arc<Mutex<Vec<LrpStartRequest>>>,
}

impl FakeAuctioneer {
    pub async fn requests(&self) -> Vec<LrpStartRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl Auctioneer for FakeAuctioneer {
    async fn request_lrp_starts(&self, requests: Vec<LrpStartRequest>) -> Result<()> {
        self.requests.lock().await.extend(requests);
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct FakeCellRegistry {
    pub cells: Arc<Mutex<CellSet>>,
}

impl FakeCellRegistry {
    pub fn with_cells(cells: impl IntoIterator<Item = CellPresence>) -> Self {
        Self {
            cells: Arc::new(Mutex::new(cells.into_iter().collect())),
        }
    }
}

#[async_trait]
impl CellRegistry for FakeCellRegistry {
    async fn list_cells(&self) -> Result<CellSet> {
        Ok(self.cells.lock().await.clone())
    }
}

/// Stop calls are recorded. Cells listed in `missing` answer not found and
/// the first `failures` calls fail.
#[derive(Default, Clone)]
pub struct FakeCellClient {
    pub stopped: Arc<Mutex<Vec<(CellId, ActualLrpKey, ActualLrpInstanceKey)>>>,
    pub missing: Arc<Mutex<HashSet<CellId>>>,
    pub failures: Arc<Mutex<u32>>,
}

impl FakeCellClient {
    pub async fn stopped(&self) -> Vec<(CellId, ActualLrpKey, ActualLrpInstanceKey)> {
        self.stopped.lock().await.clone()
    }
}

#[async_trait]
impl CellClient for FakeCellClient {
    async fn stop_lrp(
        &self,
        cell: &CellPresence,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<(), CellClientError> {
        if self.missing.lock().await.contains(&cell.cell_id) {
            return Err(CellClientError::NotFound(cell.cell_id.clone()));
        }
        {
            let mut failures = self.failures.lock().await;
            if *failures > 0 {
                *failures -= 1;
                return Err(anyhow!("connection refused").into());
            }
        }
        self.stopped
            .lock()
            .await
            .push((cell.cell_id.clone(), key.clone(), instance_key.clone()));
        Ok(())
    }
}
