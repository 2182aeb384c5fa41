use std::time::Duration;

use data_model::{DomainMarker, DomainSet};
use tracing::info;

use crate::{Error, Scan, StateStore, Table};

impl StateStore {
    /// Marks `domain` fresh for `ttl`. A zero TTL never expires.
    #[tracing::instrument(skip(self))]
    pub async fn upsert_domain(&self, domain: &str, ttl: Duration) -> Result<(), Error> {
        let expires_at = if ttl.is_zero() {
            0
        } else {
            self.now().saturating_add(ttl.as_millis() as u64)
        };
        let marker = DomainMarker {
            domain: domain.to_string(),
            expires_at,
        };

        match self.read_record::<DomainMarker>(Table::Domains, domain).await {
            Ok((_, version)) => {
                self.swap_record(Table::Domains, domain, version, &marker)
                    .await?
            }
            Err(err) if err.is_not_found() => {
                self.create_record(Table::Domains, domain, &marker).await?;
            }
            Err(err) => return Err(err),
        }
        info!(expires_at, "upserted domain");
        Ok(())
    }

    /// Domains whose marker has not expired at `now`.
    pub async fn fresh_domains(&self, now: u64) -> Result<DomainSet, Error> {
        let scan: Scan<DomainMarker> = self.scan(Table::Domains, "").await?;
        Ok(scan
            .records
            .into_iter()
            .map(|(marker, _)| marker)
            .filter(|marker| marker.is_fresh(now))
            .map(|marker| marker.domain)
            .collect())
    }
}
