use anyhow::Result;
use log::{info, warn};

use crate::batch::{BatchMode, BatchStore};
use crate::search::{DateRange, PressSearchApi, cursor_after_page};

#[derive(Debug, Clone, Copy, Default)]
pub struct IngestStats {
    /// Records received, tied re-serves included.
    pub fetched: usize,
    /// Total the remote reported for the range.
    pub total: u64,
    /// Records the batch store had never seen before.
    pub inserted: usize,
}

/// Drives search pages into the batch store. The store is persisted after
/// every page, so an interrupted ingest loses at most one page of work and a
/// rerun merges cleanly over what was already saved.
pub struct Collector<'a> {
    api: &'a mut dyn PressSearchApi,
    store: &'a mut BatchStore,
}

impl<'a> Collector<'a> {
    pub fn new(api: &'a mut dyn PressSearchApi, store: &'a mut BatchStore) -> Self {
        Self { api, store }
    }

    pub fn run(&mut self, range: &DateRange) -> Result<IngestStats> {
        let mut stats = IngestStats::default();
        // A resume run replays the leftover queue; nothing new is ingested.
        if self.store.mode() == BatchMode::Resume {
            return Ok(stats);
        }

        let mut after: Option<i64> = None;
        loop {
            let page = self.api.fetch_page(range, after)?;
            stats.total = stats.total.max(page.total);
            if page.exhausted || page.records.is_empty() {
                break;
            }

            let sort_keys: Vec<i64> = page.records.iter().map(|record| record.sort_key).collect();
            for record in page.records {
                self.store.upsert(record);
                stats.fetched += 1;
            }
            let merge = self.store.merge_and_save()?;
            stats.inserted += merge.inserted;
            info!("processed {} of {} records", stats.fetched, stats.total);

            match cursor_after_page(&sort_keys) {
                None => break,
                Some(step) => {
                    if step.whole_page_tied {
                        warn!(
                            "entire page shares sort value {}; unseen records tied at it may be skipped",
                            step.value
                        );
                    }
                    after = Some(step.value);
                }
            }
        }

        if stats.fetched as u64 != stats.total {
            info!(
                "ingest finished with {} fetched of {} reported",
                stats.fetched, stats.total
            );
        }
        Ok(stats)
    }
}
