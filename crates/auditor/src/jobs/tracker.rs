use anyhow::Result;
use common::store::Store;
use std::time::Instant;

/// One `run_history` row for the lifetime of a job.
pub struct RunTracker {
    store: Store,
    id: i64,
    job: &'static str,
    start_time: Instant,
}

impl RunTracker {
    pub async fn start(store: &Store, run_id: &str, job: &'static str) -> Result<Self> {
        let id = store.start_run(run_id, job).await?;
        Ok(Self {
            store: store.clone(),
            id,
            job,
            start_time: Instant::now(),
        })
    }

    /// `status` is `completed`, `aborted` or `cancelled`.
    pub async fn finish(self, status: &str, report: serde_json::Value) -> Result<()> {
        let duration_ms = self.start_time.elapsed().as_millis() as i64;
        tracing::info!(job = self.job, status, duration_ms, "run finished");
        self.store
            .finish_run(self.id, status, duration_ms, Some(report), None)
            .await
    }

    pub async fn fail(self, error: &anyhow::Error) -> Result<()> {
        let duration_ms = self.start_time.elapsed().as_millis() as i64;
        self.store
            .finish_run(
                self.id,
                "failed",
                duration_ms,
                None,
                Some(format!("{error:#}")),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_finish_records_status_and_report() {
        let store = Store::open(":memory:").await.unwrap();

        let tracker = RunTracker::start(&store, "run-1", "audit").await.unwrap();
        let running = store.recent_runs(5).await.unwrap();
        assert_eq!(running[0].status, "running");

        tracker
            .finish("completed", serde_json::json!({ "audited": 3 }))
            .await
            .unwrap();

        let runs = store.recent_runs(5).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id, "run-1");
        assert_eq!(runs[0].job, "audit");
        assert_eq!(runs[0].status, "completed");
        assert!(runs[0].duration_ms.is_some());
        assert_eq!(runs[0].report_json.as_deref(), Some(r#"{"audited":3}"#));
        assert_eq!(runs[0].error, None);
    }

    #[tokio::test]
    async fn test_fail_keeps_error_chain() {
        let store = Store::open(":memory:").await.unwrap();
        let tracker = RunTracker::start(&store, "run-2", "discovery").await.unwrap();

        let err = anyhow::anyhow!("disk full").context("record_audit failed");
        tracker.fail(&err).await.unwrap();

        let runs = store.recent_runs(1).await.unwrap();
        assert_eq!(runs[0].status, "failed");
        assert_eq!(runs[0].error.as_deref(), Some("record_audit failed: disk full"));
    }
}
