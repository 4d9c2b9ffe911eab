use anyhow::Result;
use log::{info, warn};

use crate::batch::{BatchMode, BatchStore};
use crate::collector::Collector;
use crate::commons::CommonsApi;
use crate::config::BotConfig;
use crate::ledger::IdLedger;
use crate::record::{PressImage, RecordStatus};
use crate::resume::ResumeManager;
use crate::search::{DateRange, PressSearchApi};
use crate::upload::{UploadDisposition, Uploader, is_disallowed_subject};

#[derive(Debug, Clone, Copy, Default)]
pub struct RunReport {
    pub fetched: usize,
    pub eligible: usize,
    pub uploaded: usize,
    pub rejected: usize,
    pub pending: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub range: DateRange,
    /// Load the whole persisted history before deciding what is new.
    pub full_history: bool,
    /// Run everything except the destination writes.
    pub debug: bool,
}

/// One bot session end to end: ingest (unless a leftover queue forces a
/// resume), gate against the ledger, upload sequentially, then tear down all
/// durable state. Per-item upload failures leave the item queued and the
/// session running; persistence failures abort.
pub fn run_session(
    config: &BotConfig,
    search: &mut dyn PressSearchApi,
    commons: &mut dyn CommonsApi,
    options: &SessionOptions,
) -> Result<RunReport> {
    let (mut resume, resuming) = ResumeManager::open(&config.queue_path())?;
    let mode = if resuming {
        BatchMode::Resume
    } else if options.full_history {
        BatchMode::Full
    } else {
        BatchMode::Light
    };
    let mut batch = BatchStore::open(&config.batch_path(), mode)?;

    let mut report = RunReport::default();
    if resuming {
        batch.retain_only(resume.queue())?;
    } else {
        let ingest = Collector::new(search, &mut batch).run(&options.range)?;
        report.fetched = ingest.fetched;
    }

    let mut ledger = IdLedger::new(&config.ledger_prefix());
    ledger.load(commons)?;

    let window = if resuming {
        None
    } else {
        Some((options.range.start, options.range.end))
    };
    let mut queued: Vec<PressImage> = Vec::new();
    for record in batch.new_records(window) {
        if ledger.is_blacklisted(&record.id) {
            batch.set_status(&record.id, RecordStatus::Blacklisted);
            report.skipped += 1;
            continue;
        }
        if ledger.is_copyright(&record.id) {
            batch.set_status(&record.id, RecordStatus::Copyright);
            report.skipped += 1;
            continue;
        }
        if is_disallowed_subject(&record.title) {
            info!("title of {} needs copyright review: {}", record.id, record.title);
            ledger.mark_pending(&record.id);
            batch.set_status(&record.id, RecordStatus::Pending);
            report.pending += 1;
            continue;
        }
        queued.push(record);
    }
    report.eligible = queued.len();

    let ids: Vec<String> = queued.iter().map(|record| record.id.clone()).collect();
    resume.enqueue(&ids)?;

    let total = queued.len();
    let mut uploader = Uploader::new(commons, config.max_filename_bytes(), options.debug);
    for (index, record) in queued.iter_mut().enumerate() {
        match uploader.process(record) {
            Ok(UploadDisposition::Uploaded) => {
                batch.set_status(&record.id, RecordStatus::Uploaded);
                resume.resolve_uploaded(&record.id)?;
                report.uploaded += 1;
            }
            Ok(UploadDisposition::AlreadyPresent { .. })
            | Ok(UploadDisposition::Rejected { .. }) => {
                // marked Uploaded so the id never surfaces as new again
                batch.set_status(&record.id, RecordStatus::Uploaded);
                resume.resolve_rejected(&record.id)?;
                report.rejected += 1;
            }
            Ok(UploadDisposition::DryRun) => {}
            Err(error) => {
                warn!(
                    "upload of {} failed, left queued for resume: {error:#}",
                    record.id
                );
            }
        }
        info!("processed {} of {total}", index + 1);
    }

    resume.close()?;
    let resolved = resume.reveal();
    ledger.record_uploaded(&resolved);
    ledger.flush(commons)?;
    batch.merge_and_save()?;
    Ok(report)
}
