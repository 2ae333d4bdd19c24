//! The background index refresher.
//!
//! One long-lived task that wakes on an interval (or a forced wake),
//! re-discovers the sitemap, diffs it against the indexed set, tombstones
//! stale content, indexes fresh content in lastmod-descending batches, and
//! triggers a full rebuild when deletion pressure passes the threshold.
//! Updated URLs without a comparable lastmod are not tombstoned blindly:
//! they are refetched and their content hashes decide whether anything
//! changed. Between batches the task observes the advisory pause flag and
//! the terminal cancellation flag.

use std::sync::Arc;

use crate::rag::index::DocIndex;

/// Run the updater until cancellation. Spawn with `tokio::spawn`.
pub async fn run_updater(index: Arc<DocIndex>) {
    let interval = index.settings().update_interval();
    let signals = Arc::clone(index.signals());
    tracing::info!(interval_secs = interval.as_secs(), "Index updater started");

    loop {
        signals.wait_for_wake(interval).await;
        if signals.cancelled() {
            break;
        }
        signals.yield_while_paused().await;
        if signals.cancelled() {
            break;
        }

        if let Err(e) = run_cycle(&index).await {
            tracing::warn!(error = %e, "Update cycle failed");
        }
    }

    tracing::info!("Index updater stopped");
}

/// One update cycle: discover → diff → tombstone → batch-index → maybe
/// rebuild.
pub async fn run_cycle(index: &Arc<DocIndex>) -> anyhow::Result<()> {
    let signals = Arc::clone(index.signals());
    let batch_size = index.settings().update_batch_size.max(1);

    let discovered = index.discover().await;
    if discovered.is_empty() {
        tracing::warn!("Update cycle discovered no URLs, skipping");
        return Ok(());
    }

    let diff = index.compute_diff(&discovered).await;
    tracing::info!(
        new = diff.new.len(),
        updated = diff.updated.len(),
        removed = diff.removed.len(),
        unchanged = diff.unchanged.len(),
        "Sitemap diff computed"
    );

    // URLs with a comparable lastmod really changed; URLs without one fall
    // back to a content-hash comparison on fetch instead of a blind
    // tombstone-and-reindex.
    let (updated_known, updated_unknown): (Vec<_>, Vec<_>) = diff
        .updated
        .into_iter()
        .partition(|(_, lastmod)| lastmod.is_some());

    // Old chunks of removed and known-changed URLs become invisible first,
    // so a search between batches never sees stale content.
    let mut stale: Vec<String> = diff.removed.clone();
    stale.extend(updated_known.iter().map(|(url, _)| url.clone()));
    if !stale.is_empty() {
        let dead = index.tombstone_urls(&stale).await;
        tracing::info!(urls = stale.len(), chunks = dead, "Tombstoned stale content");
    }

    // Freshest first, so the newest content becomes searchable earliest.
    let mut pending: Vec<(String, Option<String>)> = updated_known;
    pending.extend(diff.new);
    pending.sort_by(|a, b| b.1.cmp(&a.1));

    let mut indexed = 0usize;
    for batch in pending.chunks(batch_size) {
        if signals.cancelled() {
            tracing::info!("Cancellation observed between batches, stopping cycle");
            return Ok(());
        }
        signals.yield_while_paused().await;

        match index.index_batch(&to_discovered(batch)).await {
            Ok(count) => indexed += count,
            Err(e) => tracing::warn!(error = %e, "Batch indexing failed"),
        }
    }

    let mut refreshed = 0usize;
    let mut kept = 0usize;
    for batch in updated_unknown.chunks(batch_size) {
        if signals.cancelled() {
            tracing::info!("Cancellation observed between batches, stopping cycle");
            return Ok(());
        }
        signals.yield_while_paused().await;

        match index.refresh_batch(&to_discovered(batch)).await {
            Ok((changed, unchanged)) => {
                refreshed += changed;
                kept += unchanged;
            }
            Err(e) => tracing::warn!(error = %e, "Refresh batch failed"),
        }
    }

    let ratio = index.tombstone_ratio().await;
    if ratio > index.settings().rebuild_threshold {
        tracing::info!(
            ratio = format!("{ratio:.2}"),
            threshold = index.settings().rebuild_threshold,
            "Tombstone pressure over threshold, rebuilding"
        );
        index.rebuild().await?;
    }

    tracing::info!(
        pages = indexed,
        refreshed = refreshed,
        unchanged_by_hash = kept,
        tombstone_ratio = format!("{ratio:.2}"),
        "Update cycle complete"
    );
    Ok(())
}

fn to_discovered(batch: &[(String, Option<String>)]) -> Vec<crate::rag::crawler::DiscoveredUrl> {
    batch
        .iter()
        .map(|(url, lastmod)| crate::rag::crawler::DiscoveredUrl {
            url: url.clone(),
            lastmod: lastmod.clone(),
        })
        .collect()
}
