use anyhow::Result;
use chrono::NaiveDateTime;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::timeparse;

/// Disposition of a press-room image across runs. Transitions only move
/// forward, except `New -> Pending` which may be reverted by editing the
/// ledger pages by hand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    #[default]
    New,
    Pending,
    Uploaded,
    Copyright,
    Blacklisted,
}

/// One image record from the press-room search API. Records are never
/// deleted from the batch store once observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PressImage {
    pub id: String,
    pub title: String,
    pub subtitle: String,
    pub download_url: String,
    /// File extension including the leading dot, derived from the download
    /// URL path. May be corrected after a MIME mismatch rejection.
    pub extension: String,
    /// API publication timestamp, kept in its wire form.
    pub publication_date: String,
    /// Ordered agency short codes.
    pub agencies: Vec<String>,
    /// Document subtype code; part of the public source URL.
    pub subtype: String,
    /// Opaque per-item sort value from the remote, used only for pagination.
    pub sort_key: i64,
    #[serde(default)]
    pub status: RecordStatus,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

impl PressImage {
    pub fn source_url(&self) -> String {
        format!(
            "https://govern.cat/salapremsa/audiovisual/imatge/{}/{}",
            self.subtype, self.id
        )
    }

    pub fn published_at(&self) -> Result<NaiveDateTime> {
        timeparse::parse_api_datetime(&self.publication_date)
    }
}

/// Extension of the URL path, including the leading dot. Query strings and
/// fragments do not count; a path without a suffix yields an empty string.
pub fn extension_from_url(url: &str) -> String {
    let path = match Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.split(['?', '#']).next().unwrap_or("").to_string(),
    };
    let file_name = path.rsplit('/').next().unwrap_or("");
    match file_name.rfind('.') {
        Some(position) if position > 0 => file_name[position..].to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PressImage {
        PressImage {
            id: "123".to_string(),
            title: "Foto 7".to_string(),
            subtitle: "Roda de premsa".to_string(),
            download_url: "https://govern.cat/photo/123.JPG".to_string(),
            extension: ".JPG".to_string(),
            publication_date: "2024-05-01T10:00:00.000".to_string(),
            agencies: vec!["PRE".to_string()],
            subtype: "19".to_string(),
            sort_key: 1_714_557_600_000,
            status: RecordStatus::New,
            width: None,
            height: None,
        }
    }

    #[test]
    fn source_url_combines_subtype_and_id() {
        assert_eq!(
            sample().source_url(),
            "https://govern.cat/salapremsa/audiovisual/imatge/19/123"
        );
    }

    #[test]
    fn extension_from_url_reads_the_path_only() {
        assert_eq!(extension_from_url("https://a.example/x/photo.jpg"), ".jpg");
        assert_eq!(
            extension_from_url("https://a.example/x/photo.JPG?token=1.2"),
            ".JPG"
        );
        assert_eq!(extension_from_url("https://a.example/x/photo"), "");
    }

    #[test]
    fn status_round_trips_through_serde() {
        let serialized = serde_json::to_string(&sample()).expect("serialize");
        assert!(serialized.contains("\"status\":\"new\""));
        let parsed: PressImage = serde_json::from_str(&serialized).expect("parse");
        assert_eq!(parsed, sample());
    }
}
