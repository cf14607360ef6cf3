use crate::etl::{Etl, EtlHarvestOutcome, EtlHealth};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, instrument};

/// Runs ETL harvests with bounded concurrency.
#[derive(Debug, Clone)]
pub struct HarvestExecutor {
    semaphore: Arc<Semaphore>,
}

impl HarvestExecutor {
    pub fn new(concurrency_limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency_limit.max(1))),
        }
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    #[instrument(skip(self, etl), fields(etl = %etl.name()))]
    pub async fn execute(&self, etl: Arc<Etl>, force: bool) -> EtlHarvestOutcome {
        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(e) => return etl.fail(EtlHealth::HarvestFailed, format!("Semaphore error: {}", e)),
        };

        info!("Starting harvest");
        let outcome = etl.harvest(force).await;
        info!(
            status = %outcome.status,
            health = %outcome.health,
            documents = outcome.documents,
            "Finished harvest"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etl::entity::tests::{stub_etl, StubExtractor};
    use crate::etl::EtlStatus;

    #[tokio::test]
    async fn test_execute_harvests_etl() {
        let executor = HarvestExecutor::new(2);
        let etl = Arc::new(stub_etl("dblp", StubExtractor::new("v1", 4)));
        etl.init().await.unwrap();
        etl.queue().unwrap();

        let outcome = executor.execute(Arc::clone(&etl), false).await;

        assert!(outcome.success());
        assert_eq!(outcome.documents, 4);
        assert_eq!(etl.status(), EtlStatus::Done);
        assert_eq!(executor.available_permits(), 2);
    }

    #[test]
    fn test_zero_limit_still_runs() {
        assert_eq!(HarvestExecutor::new(0).available_permits(), 1);
    }
}
