//! Interfaces to the services around the consistency core.

use anyhow::Result;
use async_trait::async_trait;
use data_model::{ActualLrpInstanceKey, ActualLrpKey, CellId, CellPresence, CellSet, LrpStartRequest};

/// Placement service. Requests are fire-and-forget: a failed submission is
/// logged by the caller and picked up again by the next convergence run.
#[async_trait]
pub trait Auctioneer: Send + Sync {
    async fn request_lrp_starts(&self, requests: Vec<LrpStartRequest>) -> Result<()>;
}

/// Live set of cells. A registry that knows no cells returns an empty set.
#[async_trait]
pub trait CellRegistry: Send + Sync {
    async fn list_cells(&self) -> Result<CellSet>;
}

#[derive(Debug, thiserror::Error)]
pub enum CellClientError {
    /// The cell is gone or does not know the container.
    #[error("cell {0} not found")]
    NotFound(CellId),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CellClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CellClientError::NotFound(_))
    }
}

/// Talks to the agent running on a cell.
#[async_trait]
pub trait CellClient: Send + Sync {
    async fn stop_lrp(
        &self,
        cell: &CellPresence,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<(), CellClientError>;
}
