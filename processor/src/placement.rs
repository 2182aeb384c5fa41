use std::sync::Arc;

use data_model::ActualLrpKey;
use state_store::StateStore;
use tracing::{debug, error};

use crate::{collaborators::Auctioneer, resolver::StartRequestBatch};

/// Hands start requests to the placement service. Submission is fire and
/// forget: failures are logged and left for the next convergence run.
#[derive(Clone)]
pub struct StartRequester {
    store: Arc<StateStore>,
    auctioneer: Arc<dyn Auctioneer>,
}

impl StartRequester {
    pub fn new(store: Arc<StateStore>, auctioneer: Arc<dyn Auctioneer>) -> Self {
        Self { store, auctioneer }
    }

    /// Requests a start for one slot, looking up its scheduling info. Slots
    /// whose desired record is gone are not started.
    pub async fn request_start(&self, key: &ActualLrpKey) {
        let scheduling_info = match self.store.desired_scheduling_info(&key.process_guid).await {
            Ok(scheduling_info) => scheduling_info,
            Err(err) if err.is_not_found() => {
                debug!(process_guid = key.process_guid, "no desired lrp, not requesting a start");
                return;
            }
            Err(err) => {
                error!(process_guid = key.process_guid, "failed to read desired lrp: {err}");
                return;
            }
        };
        let mut batch = StartRequestBatch::default();
        batch.add(&scheduling_info, key.index);
        self.submit(batch).await;
    }

    /// Returns the number of instances submitted.
    pub async fn submit(&self, batch: StartRequestBatch) -> usize {
        if batch.is_empty() {
            return 0;
        }
        let requests = batch.into_requests();
        let instances = requests.iter().map(|request| request.indices.len()).sum();
        if let Err(err) = self.auctioneer.request_lrp_starts(requests).await {
            error!(instances, "failed to submit start requests: {err:#}");
            return 0;
        }
        debug!(instances, "submitted start requests");
        instances
    }
}
