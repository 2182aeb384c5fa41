use data_model::{
    DesiredLrp,
    DesiredLrpFilter,
    DesiredLrpRunInfo,
    DesiredLrpSchedulingInfo,
    DesiredLrpUpdate,
};
use lrp_utils::retry_with_policy;
use tracing::{info, warn};

use crate::{Error, Scan, StateStore, Table};

impl StateStore {
    /// Writes the run info first, then the scheduling info. A scheduling
    /// info without its run info is never visible; a run info left behind
    /// by a failed second write is collected by convergence.
    #[tracing::instrument(skip_all, fields(process_guid = %desired.process_guid))]
    pub async fn desire_lrp(&self, desired: &DesiredLrp) -> Result<(), Error> {
        desired
            .validate()
            .map_err(|source| Error::invalid_record(Table::DesiredRunInfos, &desired.process_guid, source))?;

        let run_info = desired.run_info();
        self.create_record(Table::DesiredRunInfos, &run_info.key(), &run_info)
            .await?;
        let scheduling_info = desired.scheduling_info();
        self.create_record(
            Table::DesiredSchedulingInfos,
            &scheduling_info.key(),
            &scheduling_info,
        )
        .await?;
        info!(instances = desired.instances, "desired lrp");
        Ok(())
    }

    pub async fn desired_lrp(&self, process_guid: &str) -> Result<DesiredLrp, Error> {
        let (scheduling_info, _) = self
            .read_record::<DesiredLrpSchedulingInfo>(Table::DesiredSchedulingInfos, process_guid)
            .await?;
        let (run_info, _) = self
            .read_record::<DesiredLrpRunInfo>(Table::DesiredRunInfos, process_guid)
            .await?;
        Ok(DesiredLrp::from_parts(scheduling_info, run_info))
    }

    pub async fn desired_scheduling_info(
        &self,
        process_guid: &str,
    ) -> Result<DesiredLrpSchedulingInfo, Error> {
        let (scheduling_info, _) = self
            .read_record(Table::DesiredSchedulingInfos, process_guid)
            .await?;
        Ok(scheduling_info)
    }

    pub async fn desired_lrp_scheduling_infos(
        &self,
        filter: &DesiredLrpFilter,
    ) -> Result<Vec<DesiredLrpSchedulingInfo>, Error> {
        let scan = self.scan_desired_scheduling_infos().await?;
        Ok(scan
            .records
            .into_iter()
            .map(|(info, _)| info)
            .filter(|info| filter.matches(info))
            .collect())
    }

    pub async fn scan_desired_scheduling_infos(
        &self,
    ) -> Result<Scan<DesiredLrpSchedulingInfo>, Error> {
        self.scan(Table::DesiredSchedulingInfos, "").await
    }

    pub async fn scan_desired_run_infos(&self) -> Result<Scan<DesiredLrpRunInfo>, Error> {
        self.scan(Table::DesiredRunInfos, "").await
    }

    /// Applies `update` to the scheduling info with compare-and-swap, trying
    /// again on a lost race as the configured retry policy allows. Any other
    /// failure is returned right away. Returns the scheduling info as it was
    /// before the update.
    #[tracing::instrument(skip_all, fields(process_guid = %process_guid))]
    pub async fn update_desired_lrp(
        &self,
        process_guid: &str,
        update: &DesiredLrpUpdate,
    ) -> Result<DesiredLrpSchedulingInfo, Error> {
        let policy = self.config.desired_update_retry;
        let before = retry_with_policy(
            &policy,
            |err: &Error| err.is_retryable(),
            |attempt| async move {
                let (before, version) = self
                    .read_record::<DesiredLrpSchedulingInfo>(
                        Table::DesiredSchedulingInfos,
                        process_guid,
                    )
                    .await?;
                let mut after = before.clone();
                after.apply_update(update);
                after.version.increment();
                let result = self
                    .swap_record(Table::DesiredSchedulingInfos, process_guid, version, &after)
                    .await;
                if let Err(err) = &result {
                    if err.is_retryable() {
                        warn!(attempt, "desired lrp update lost a race");
                    }
                }
                result.map(|_| before)
            },
        )
        .await?;
        info!(?update, "updated desired lrp");
        Ok(before)
    }

    /// Deletes both halves of a desired record. Fails with NotFound when
    /// neither half exists.
    #[tracing::instrument(skip_all, fields(process_guid = %process_guid))]
    pub async fn remove_desired_lrp(&self, process_guid: &str) -> Result<(), Error> {
        let mut removed = false;
        for table in [Table::DesiredSchedulingInfos, Table::DesiredRunInfos] {
            match self.db.read(table, process_guid).await {
                Ok(stored) => {
                    self.delete_record(table, process_guid, stored.version)
                        .await?;
                    removed = true;
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        if !removed {
            return Err(Error::not_found(Table::DesiredSchedulingInfos, process_guid));
        }
        info!("removed desired lrp");
        Ok(())
    }
}
