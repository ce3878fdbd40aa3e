//! Background progress reporting for a running sweep.

use std::sync::Arc;

use qdaq_core::data::Dataset;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Log progress whenever a row is finalized.
///
/// The task only reads finalized rows and ends when the sweep finishes,
/// returning the final row count.
pub fn spawn_progress_monitor(dataset: Arc<Dataset>) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let total = dataset.metadata().total_steps();
        let run_id = dataset.metadata().run_id;
        let mut updates = dataset.subscribe();
        let mut last = 0;
        loop {
            let progress = *updates.borrow_and_update();
            if progress.rows != last {
                last = progress.rows;
                info!(%run_id, rows = last, total, "Sweep progress");
            }
            if progress.finished || updates.changed().await.is_err() {
                break;
            }
        }
        debug!(%run_id, rows = last, "Progress monitor finished");
        last
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use qdaq_core::data::{DatasetRow, SweepMetadata};
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_monitor_returns_final_row_count() {
        let (dataset, mut writer) = Dataset::create(SweepMetadata::new("do1d"));
        let monitor = spawn_progress_monitor(Arc::clone(&dataset));
        for index in 0..3 {
            writer.finalize_row(DatasetRow {
                index,
                setpoints: vec![index as f64],
                results: BTreeMap::new(),
            });
            tokio::task::yield_now().await;
        }
        writer.finish();
        assert_eq!(monitor.await.unwrap(), 3);
    }
}
