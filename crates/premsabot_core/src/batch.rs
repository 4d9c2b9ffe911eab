use std::collections::BTreeMap;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::record::{PressImage, RecordStatus};

pub const BATCH_SCHEMA_VERSION: u32 = 1;

/// On-disk envelope for the batch history. The schema is versioned on its own
/// so the wire format does not depend on in-memory layout.
#[derive(Debug, Serialize, Deserialize)]
struct BatchFile {
    schema_version: u32,
    records: BTreeMap<String, PressImage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// Only this run's fetched records are visible; history is merged on save.
    Light,
    /// The whole persisted history is loaded before deciding what is new.
    Full,
    /// Leftover queue replay; ingestion is skipped entirely.
    Resume,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct MergeStats {
    pub collected: usize,
    pub inserted: usize,
}

/// Append/merge-only mapping of id to record, persisted as a whole unit.
#[derive(Debug)]
pub struct BatchStore {
    path: PathBuf,
    mode: BatchMode,
    records: BTreeMap<String, PressImage>,
}

impl BatchStore {
    pub fn open(path: &Path, mode: BatchMode) -> Result<Self> {
        let records = match mode {
            BatchMode::Full => read_batch_file(path)?,
            BatchMode::Light | BatchMode::Resume => BTreeMap::new(),
        };
        Ok(Self {
            path: path.to_path_buf(),
            mode,
            records,
        })
    }

    pub fn mode(&self) -> BatchMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&PressImage> {
        self.records.get(id)
    }

    /// Insert or replace a record in the in-memory view (last write wins).
    pub fn upsert(&mut self, record: PressImage) {
        self.records.insert(record.id.clone(), record);
    }

    pub fn set_status(&mut self, id: &str, status: RecordStatus) {
        if let Some(record) = self.records.get_mut(id) {
            record.status = status;
        }
    }

    /// Merge the in-memory view into the persisted history and write the
    /// whole file back. Idempotent: replaying the same records changes
    /// neither size nor content.
    pub fn merge_and_save(&mut self) -> Result<MergeStats> {
        let mut merged = read_batch_file(&self.path)?;
        let persisted_size = merged.len();
        for (id, record) in &self.records {
            merged.insert(id.clone(), record.clone());
        }
        let inserted = merged.len() - persisted_size;
        write_batch_file(&self.path, &merged)?;
        if self.mode == BatchMode::Full {
            self.records = merged;
        }
        Ok(MergeStats {
            collected: self.records.len(),
            inserted,
        })
    }

    /// Load history filtered to the given ids; used when resuming a run so
    /// only the leftover queue is visible.
    pub fn retain_only(&mut self, ids: &[String]) -> Result<()> {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let history = read_batch_file(&self.path)?;
        self.records = history
            .into_iter()
            .filter(|(id, _)| wanted.contains(id.as_str()))
            .collect();
        Ok(())
    }

    /// Records still awaiting upload, optionally restricted to a publication
    /// date window. The window only has an effect when history beyond the
    /// queried range is loaded; a light run's records already come from the
    /// ranged query.
    pub fn new_records(&self, window: Option<(NaiveDate, NaiveDate)>) -> Vec<PressImage> {
        self.records
            .values()
            .filter(|record| record.status == RecordStatus::New)
            .filter(|record| match window {
                None => true,
                Some((start, end)) => record
                    .published_at()
                    .map(|moment| {
                        let day = moment.date();
                        day >= start && day <= end
                    })
                    .unwrap_or(false),
            })
            .cloned()
            .collect()
    }
}

fn read_batch_file(path: &Path) -> Result<BTreeMap<String, PressImage>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let parsed: BatchFile = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    if parsed.schema_version != BATCH_SCHEMA_VERSION {
        bail!(
            "unsupported batch schema version {} in {}",
            parsed.schema_version,
            path.display()
        );
    }
    Ok(parsed.records)
}

fn write_batch_file(path: &Path, records: &BTreeMap<String, PressImage>) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let envelope = BatchFile {
        schema_version: BATCH_SCHEMA_VERSION,
        records: records.clone(),
    };
    let rendered = serde_json::to_string_pretty(&envelope).context("failed to serialize batch")?;
    fs::write(path, rendered).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeparse::parse_day;
    use tempfile::tempdir;

    fn record(id: &str, date: &str) -> PressImage {
        PressImage {
            id: id.to_string(),
            title: format!("Image {id}"),
            subtitle: String::new(),
            download_url: format!("https://govern.cat/photo/{id}.jpg"),
            extension: ".jpg".to_string(),
            publication_date: date.to_string(),
            agencies: vec![],
            subtype: "19".to_string(),
            sort_key: 1,
            status: RecordStatus::New,
            width: None,
            height: None,
        }
    }

    #[test]
    fn missing_file_is_an_empty_store() {
        let temp = tempdir().expect("tempdir");
        let store = BatchStore::open(&temp.path().join("batch.json"), BatchMode::Full)
            .expect("open");
        assert!(store.is_empty());
    }

    #[test]
    fn merge_and_save_is_idempotent() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("batch.json");

        let mut store = BatchStore::open(&path, BatchMode::Light).expect("open");
        store.upsert(record("1", "2024-05-01T10:00:00.000"));
        store.upsert(record("2", "2024-05-01T11:00:00.000"));
        let first = store.merge_and_save().expect("save");
        assert_eq!(first.inserted, 2);
        let second = store.merge_and_save().expect("save again");
        assert_eq!(second.inserted, 0);

        let reloaded = BatchStore::open(&path, BatchMode::Full).expect("reopen");
        assert_eq!(reloaded.len(), 2);
    }

    #[test]
    fn light_mode_keeps_only_this_runs_records_in_view() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("batch.json");

        let mut seeded = BatchStore::open(&path, BatchMode::Light).expect("open");
        seeded.upsert(record("old", "2024-01-01T10:00:00.000"));
        seeded.merge_and_save().expect("save");

        let mut store = BatchStore::open(&path, BatchMode::Light).expect("open");
        store.upsert(record("fresh", "2024-05-01T10:00:00.000"));
        store.merge_and_save().expect("save");

        assert_eq!(store.len(), 1);
        assert!(store.get("fresh").is_some());

        let full = BatchStore::open(&path, BatchMode::Full).expect("reopen full");
        assert_eq!(full.len(), 2);
    }

    #[test]
    fn new_records_filters_by_status_and_window() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("batch.json");
        let mut store = BatchStore::open(&path, BatchMode::Full).expect("open");

        store.upsert(record("in", "2024-05-01T10:00:00.000"));
        store.upsert(record("out", "2024-06-01T10:00:00.000"));
        let mut resolved = record("done", "2024-05-01T12:00:00.000");
        resolved.status = RecordStatus::Uploaded;
        store.upsert(resolved);

        let window = Some((
            parse_day("01-05-2024").expect("start"),
            parse_day("31-05-2024").expect("end"),
        ));
        let visible = store.new_records(window);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, "in");

        assert_eq!(store.new_records(None).len(), 2);
    }

    #[test]
    fn retain_only_loads_the_leftover_subset() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("batch.json");

        let mut seeded = BatchStore::open(&path, BatchMode::Light).expect("open");
        seeded.upsert(record("1", "2024-05-01T10:00:00.000"));
        seeded.upsert(record("2", "2024-05-01T11:00:00.000"));
        seeded.upsert(record("3", "2024-05-01T12:00:00.000"));
        seeded.merge_and_save().expect("save");

        let mut store = BatchStore::open(&path, BatchMode::Resume).expect("open");
        store
            .retain_only(&["1".to_string(), "3".to_string()])
            .expect("retain");
        assert_eq!(store.len(), 2);
        assert!(store.get("2").is_none());
    }

    #[test]
    fn mismatched_schema_version_is_rejected() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("batch.json");
        fs::write(&path, r#"{"schema_version": 99, "records": {}}"#).expect("write");
        let error = BatchStore::open(&path, BatchMode::Full).expect_err("must fail");
        assert!(error.to_string().contains("unsupported batch schema"));
    }
}
