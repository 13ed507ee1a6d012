//! Cost aggregation onto workflow roots.

use crate::domain::{ItemId, UsageTotals};
use crate::ports::WorkStore;

/// Sum subtask usage onto `root`.
///
/// Failures are logged and swallowed; the next completion (or a manual
/// re-run) recomputes the totals from scratch.
pub async fn aggregate_usage(store: &dyn WorkStore, root: ItemId) -> Option<UsageTotals> {
    match store.aggregate_usage(root).await {
        Ok(totals) => {
            tracing::debug!(
                root_id = %root,
                input_tokens = totals.input_tokens,
                output_tokens = totals.output_tokens,
                total_cost = totals.total_cost,
                "usage aggregated"
            );
            Some(totals)
        }
        Err(e) => {
            tracing::error!(root_id = %root, error = %e, "usage aggregation failed");
            None
        }
    }
}
