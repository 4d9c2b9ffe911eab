use anyhow::Result;
use log::{info, warn};

use crate::commons::{CommonsApi, UploadOutcome};
use crate::record::PressImage;
use crate::timeparse;

pub const UPLOAD_COMMENT: &str = "Uploading Generalitat de Catalunya Press Room image";

/// Characters MediaWiki forbids or mangles in titles.
const STRIPPED_CHARS: [char; 11] = ['#', '<', '>', '[', ']', '|', ':', '/', '{', '}', '\n'];

/// Title prefixes that flag likely third-party works; those go to the
/// pending list for manual copyright review instead of being uploaded.
pub const DISALLOWED_SUBJECTS: [&str; 5] = [
    "Obra d",
    "Peça d",
    "Imatge de '",
    "Cartells d",
    "Obres traduïdes al",
];

const DESCRIPTION_TEMPLATE: &str = "\
== {{int:filedesc}} ==

{{Information
 |description    = {{ca|$title}}
 |date           = {{Published on|$date}}
 |source         = [$source $subtitle] (press release)
 |author         = {{Institution:Govern de Catalunya}}
 |permission     = {{Attribution-govern}}
 |other versions =
 |other_fields 1 = {{InFi|Government agency|$agency}}
}}

[[Category:Images from Generalitat de Catalunya Press Room in $datecat]]
";

/// Final word on one record after the upload attempt, corrections included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadDisposition {
    Uploaded,
    /// The content or a name for it already exists remotely.
    AlreadyPresent { filename: String },
    Rejected { code: String, info: String },
    /// Debug run: everything up to the write happened, the write did not.
    DryRun,
}

/// Result of deriving a destination name for a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameProbe {
    Fresh(String),
    /// A file page with this name already describes this record's id.
    AlreadyPresent(String),
}

pub fn is_disallowed_subject(title: &str) -> bool {
    DISALLOWED_SUBJECTS
        .iter()
        .any(|subject| title.starts_with(subject))
}

pub struct Uploader<'a> {
    api: &'a mut dyn CommonsApi,
    max_filename_bytes: usize,
    debug: bool,
}

impl<'a> Uploader<'a> {
    pub fn new(api: &'a mut dyn CommonsApi, max_filename_bytes: usize, debug: bool) -> Self {
        Self {
            api,
            max_filename_bytes,
            debug,
        }
    }

    /// Upload one record end to end. On a correctable rejection the record is
    /// mutated (extension after a MIME mismatch, title after a normalized name
    /// collision) and the attempt repeats; each correction fires at most once,
    /// so the loop runs at most three times.
    pub fn process(&mut self, record: &mut PressImage) -> Result<UploadDisposition> {
        let mut extension_fixed = false;
        let mut title_fixed = false;
        loop {
            let filename = match self.destination_name(record)? {
                NameProbe::Fresh(filename) => filename,
                NameProbe::AlreadyPresent(filename) => {
                    info!("content {} already uploaded as {filename}", record.id);
                    return Ok(UploadDisposition::AlreadyPresent { filename });
                }
            };
            if self.debug {
                info!("debug: would upload {} as {filename}", record.id);
                return Ok(UploadDisposition::DryRun);
            }

            let text = description_page(record)?;
            let outcome = self.api.upload_from_url(
                &filename,
                &record.download_url,
                &text,
                UPLOAD_COMMENT,
            )?;
            match outcome {
                UploadOutcome::Success => {
                    info!("uploaded {} as {filename}", record.id);
                    return Ok(UploadDisposition::Uploaded);
                }
                UploadOutcome::MimeMismatch { declared } if !extension_fixed => {
                    record.extension = extension_from_mime(&declared);
                    extension_fixed = true;
                    warn!("fixing declared file type for {filename}: {declared}");
                }
                UploadOutcome::MimeMismatch { declared } => {
                    return Ok(UploadDisposition::Rejected {
                        code: "verification-error".to_string(),
                        info: format!("file type still mismatched after correction: {declared}"),
                    });
                }
                UploadOutcome::Duplicate => {
                    info!("content {} already uploaded, rejected as duplicate", record.id);
                    return Ok(UploadDisposition::AlreadyPresent { filename });
                }
                UploadOutcome::ExistsNormalized if !title_fixed => {
                    record.title = format!("GENCAT - {} ({})", record.title, record.id);
                    title_fixed = true;
                    warn!("fixing normalized name collision for {filename}");
                }
                UploadOutcome::ExistsNormalized => {
                    return Ok(UploadDisposition::Rejected {
                        code: "exists-normalized".to_string(),
                        info: format!("name still collides after retitling: {filename}"),
                    });
                }
                UploadOutcome::Rejected { code, info } => {
                    warn!("upload of {} rejected [{code}]: {info}", record.id);
                    return Ok(UploadDisposition::Rejected { code, info });
                }
            }
        }
    }

    /// Derive the destination filename: sanitize, synthesize context for
    /// low-information titles, truncate, append the publication day, then
    /// probe the remote for this record and for name collisions.
    pub fn destination_name(&mut self, record: &PressImage) -> Result<NameProbe> {
        let mut base = strip_forbidden(&record.title);
        base = contextualize(&base);
        base = truncate_bytes(&base, self.max_filename_bytes);
        base = format!("{base} ({})", timeparse::day_suffix(record.published_at()?));

        let probe_title = format!("File:{base}{}", record.extension);
        if let Some(text) = self.api.page_text(&probe_title)?
            && text.contains(&record.id)
        {
            return Ok(NameProbe::AlreadyPresent(format!(
                "{base}{}",
                record.extension
            )));
        }

        let in_use = self.api.count_file_prefix(&base)?;
        if in_use > 0 {
            base = format!("{base} - {in_use}");
        }
        Ok(NameProbe::Fresh(format!(
            "{base}{}",
            record.extension.to_lowercase()
        )))
    }
}

/// Wikitext for the file description page.
pub fn description_page(record: &PressImage) -> Result<String> {
    let published = record.published_at()?;
    Ok(DESCRIPTION_TEMPLATE
        .replace("$datecat", &timeparse::category_fragment(published))
        .replace("$date", &timeparse::publication_day(published))
        .replace("$source", &record.source_url())
        .replace("$title", &record.title)
        .replace("$subtitle", &record.subtitle)
        .replace("$agency", &record.agencies.join("/")))
}

fn strip_forbidden(title: &str) -> String {
    title
        .chars()
        .filter(|character| !STRIPPED_CHARS.contains(character))
        .collect()
}

/// Titles like "Foto 7" or "imatge" carry no searchable information, so they
/// get a project prefix: "Generalitat de Catalunya Press Room - Foto 7".
pub fn contextualize(title: &str) -> String {
    match low_information_expression(title) {
        Some(expression) => format!("Generalitat de Catalunya Press Room - {expression}"),
        None => title.to_string(),
    }
}

/// Recognize a title that is nothing but filler, an optional photo keyword
/// and an optional number. Returns the normalized expression when it is.
fn low_information_expression(title: &str) -> Option<String> {
    let mut rest = skip_filler(title);
    let mut parts: Vec<String> = Vec::new();

    let lowered = rest.to_lowercase();
    for keyword in ["fotografia", "foto", "imatge", "image"] {
        if lowered.starts_with(keyword) {
            parts.push(title_case(keyword));
            rest = &rest[keyword.len()..];
            break;
        }
    }

    rest = skip_filler(rest);
    let digits = rest.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 {
        parts.push(rest[..digits].to_string());
        rest = &rest[digits..];
    }

    if !skip_filler(rest).is_empty() {
        return None;
    }
    Some(parts.join(" "))
}

fn skip_filler(text: &str) -> &str {
    text.trim_start_matches(['.', ' '])
}

fn title_case(word: &str) -> String {
    let mut characters = word.chars();
    match characters.next() {
        Some(first) => first.to_uppercase().collect::<String>() + characters.as_str(),
        None => String::new(),
    }
}

/// Cut at the last character boundary within the byte budget and mark the cut.
fn truncate_bytes(name: &str, max_bytes: usize) -> String {
    if name.len() <= max_bytes {
        return name.to_string();
    }
    let mut end = max_bytes;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &name[..end])
}

/// New extension after a MIME mismatch rejection; the remote reports the
/// detected type as either a bare extension or a full MIME type.
fn extension_from_mime(declared: &str) -> String {
    match declared.strip_prefix("image/") {
        Some(subtype) => format!(".{subtype}"),
        None => format!(".{declared}"),
    }
}
