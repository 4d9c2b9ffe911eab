use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::config::BotConfig;

pub const FILE_NAMESPACE: i32 = 6;

/// Classified result of one upload attempt. Everything short of a transport
/// failure is a value, not an error, because the pipeline must keep going.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Success,
    /// The remote rejected the declared extension and told us the real type.
    MimeMismatch { declared: String },
    /// Identical content already exists under some name.
    Duplicate,
    /// The normalized destination name collides with an existing page.
    ExistsNormalized,
    /// Anything else the remote refused; carries the full diagnostic.
    Rejected { code: String, info: String },
}

/// Seam over the destination wiki. Production uses [`CommonsClient`]; tests
/// drive the pipeline with in-memory fakes.
pub trait CommonsApi {
    fn login(&mut self, username: &str, password: &str) -> Result<()>;
    fn page_exists(&mut self, title: &str) -> Result<bool>;
    fn page_text(&mut self, title: &str) -> Result<Option<String>>;
    /// Edit comment of the latest revision, used for ledger size deltas.
    fn latest_comment(&mut self, title: &str) -> Result<Option<String>>;
    fn edit_page(&mut self, title: &str, content: &str, summary: &str) -> Result<()>;
    /// Number of existing File-namespace pages starting with the prefix.
    fn count_file_prefix(&mut self, prefix: &str) -> Result<usize>;
    fn upload_from_url(
        &mut self,
        filename: &str,
        source_url: &str,
        text: &str,
        comment: &str,
    ) -> Result<UploadOutcome>;
}

#[derive(Debug, Clone)]
pub struct CommonsClientConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_read_ms: u64,
    pub rate_limit_write_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl CommonsClientConfig {
    pub fn from_config(config: &BotConfig) -> Self {
        Self {
            api_url: config.commons_api_url(),
            user_agent: config.user_agent(),
            timeout_ms: config.commons.timeout_ms.unwrap_or(30_000),
            rate_limit_read_ms: config.commons.rate_limit_read_ms.unwrap_or(300),
            rate_limit_write_ms: config.commons.rate_limit_write_ms.unwrap_or(1_000),
            max_retries: config.commons.max_retries.unwrap_or(2),
            retry_delay_ms: config.commons.retry_delay_ms.unwrap_or(500),
        }
    }
}

pub struct CommonsClient {
    client: Client,
    config: CommonsClientConfig,
    last_request_at: Option<Instant>,
    csrf_token: Option<String>,
}

impl CommonsClient {
    pub fn new(config: CommonsClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .cookie_store(true)
            .build()
            .context("failed to build Commons HTTP client")?;
        Ok(Self {
            client,
            config,
            last_request_at: None,
            csrf_token: None,
        })
    }

    fn api_get(&mut self, params: &[(&str, String)]) -> Result<Value> {
        let payload = self.send_with_retries(params, false, false)?;
        fail_on_api_error(&payload)?;
        Ok(payload)
    }

    fn api_post(&mut self, params: &[(&str, String)]) -> Result<Value> {
        let payload = self.send_with_retries(params, true, true)?;
        fail_on_api_error(&payload)?;
        Ok(payload)
    }

    /// POST without interpreting the API error payload; upload classification
    /// needs the raw error body.
    fn api_post_raw(&mut self, params: &[(&str, String)]) -> Result<Value> {
        self.send_with_retries(params, true, true)
    }

    fn send_with_retries(
        &mut self,
        params: &[(&str, String)],
        is_post: bool,
        is_write: bool,
    ) -> Result<Value> {
        let mut pairs = Vec::with_capacity(params.len() + 2);
        pairs.push(("format".to_string(), "json".to_string()));
        pairs.push(("formatversion".to_string(), "2".to_string()));
        for (key, value) in params {
            if !value.is_empty() {
                pairs.push(((*key).to_string(), value.clone()));
            }
        }

        for attempt in 0..=self.config.max_retries {
            self.apply_rate_limit(is_write);
            let request = if is_post {
                self.client.post(&self.config.api_url).form(&pairs)
            } else {
                self.client.get(&self.config.api_url).query(&pairs)
            };
            let response = request
                .header("User-Agent", self.config.user_agent.clone())
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < self.config.max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt);
                            continue;
                        }
                        bail!("Commons API request failed with HTTP {status}");
                    }
                    return response
                        .json()
                        .context("failed to decode Commons API JSON response");
                }
                Err(error) => {
                    if attempt < self.config.max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Err(error).context("failed to call Commons API");
                }
            }
        }

        bail!("Commons API request exhausted retry budget")
    }

    fn apply_rate_limit(&mut self, is_write: bool) {
        let delay = if is_write {
            Duration::from_millis(self.config.rate_limit_write_ms)
        } else {
            Duration::from_millis(self.config.rate_limit_read_ms)
        };
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
    }

    fn wait_before_retry(&self, attempt: usize) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        sleep(Duration::from_millis(base.saturating_add(jitter)));
    }

    fn ensure_csrf_token(&mut self) -> Result<String> {
        if let Some(token) = &self.csrf_token {
            return Ok(token.clone());
        }
        let response = self.api_get(&[
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
        ])?;
        let parsed: TokenQueryResponse =
            serde_json::from_value(response).context("failed to decode csrf token response")?;
        let token = parsed
            .query
            .tokens
            .as_ref()
            .and_then(|tokens| tokens.csrftoken.as_ref())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("failed to get Commons csrf token"))?;
        self.csrf_token = Some(token.clone());
        Ok(token)
    }

    fn first_page(&mut self, title: &str, properties: &[(&str, String)]) -> Result<Option<PageInfo>> {
        let mut params = vec![
            ("action", "query".to_string()),
            ("titles", title.to_string()),
        ];
        params.extend(properties.iter().map(|(key, value)| (*key, value.clone())));
        let response = self.api_get(&params)?;
        let parsed: QueryResponse =
            serde_json::from_value(response).context("failed to decode page query response")?;
        let page = match parsed.query.pages.into_iter().next() {
            Some(page) => page,
            None => return Ok(None),
        };
        if page.missing.unwrap_or(false) {
            return Ok(None);
        }
        Ok(Some(page))
    }
}

impl CommonsApi for CommonsClient {
    fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let token_response = self.api_get(&[
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
            ("type", "login".to_string()),
        ])?;
        let token_payload: TokenQueryResponse = serde_json::from_value(token_response)
            .context("failed to decode login token response")?;
        let login_token = token_payload
            .query
            .tokens
            .as_ref()
            .and_then(|tokens| tokens.logintoken.as_ref())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("failed to get Commons login token"))?;

        let login_response = self.api_post(&[
            ("action", "login".to_string()),
            ("lgname", username.to_string()),
            ("lgpassword", password.to_string()),
            ("lgtoken", login_token),
        ])?;
        let login_payload: LoginResponse =
            serde_json::from_value(login_response).context("failed to decode login response")?;
        match login_payload.login.result.as_deref() {
            Some("Success") => {
                self.csrf_token = None;
                Ok(())
            }
            other => bail!(
                "Commons login failed: {}",
                login_payload
                    .login
                    .reason
                    .or_else(|| other.map(ToString::to_string))
                    .unwrap_or_else(|| "unknown error".to_string())
            ),
        }
    }

    fn page_exists(&mut self, title: &str) -> Result<bool> {
        let page = self.first_page(title, &[("prop", "info".to_string())])?;
        Ok(page.is_some())
    }

    fn page_text(&mut self, title: &str) -> Result<Option<String>> {
        let page = self.first_page(
            title,
            &[
                ("prop", "revisions".to_string()),
                ("rvprop", "content".to_string()),
                ("rvslots", "main".to_string()),
            ],
        )?;
        Ok(page.and_then(|page| {
            page.revisions
                .into_iter()
                .next()
                .and_then(|revision| revision.slots)
                .and_then(|slots| slots.main)
                .map(|slot| slot.content)
        }))
    }

    fn latest_comment(&mut self, title: &str) -> Result<Option<String>> {
        let page = self.first_page(
            title,
            &[
                ("prop", "revisions".to_string()),
                ("rvprop", "comment".to_string()),
            ],
        )?;
        Ok(page.and_then(|page| {
            page.revisions
                .into_iter()
                .next()
                .and_then(|revision| revision.comment)
        }))
    }

    fn edit_page(&mut self, title: &str, content: &str, summary: &str) -> Result<()> {
        let token = self.ensure_csrf_token()?;
        let response = self.api_post(&[
            ("action", "edit".to_string()),
            ("title", title.to_string()),
            ("text", content.to_string()),
            ("summary", summary.to_string()),
            ("bot", "1".to_string()),
            ("token", token),
        ])?;
        let edit_payload: EditResponse =
            serde_json::from_value(response).context("failed to decode edit response")?;
        let result = edit_payload.edit.and_then(|edit| edit.result);
        if result.as_deref() != Some("Success") {
            bail!(
                "Commons edit failed for {title}: {}",
                result.unwrap_or_else(|| "unknown".to_string())
            );
        }
        Ok(())
    }

    fn count_file_prefix(&mut self, prefix: &str) -> Result<usize> {
        let mut count = 0usize;
        let mut continue_token: Option<String> = None;
        loop {
            let mut params = vec![
                ("action", "query".to_string()),
                ("list", "allpages".to_string()),
                ("apnamespace", FILE_NAMESPACE.to_string()),
                ("apprefix", prefix.to_string()),
                ("aplimit", "500".to_string()),
            ];
            if let Some(token) = &continue_token {
                params.push(("apcontinue", token.clone()));
            }

            let response = self.api_get(&params)?;
            let parsed: QueryResponse = serde_json::from_value(response)
                .context("failed to decode allpages API response")?;
            count += parsed.query.allpages.len();
            continue_token = parsed.continuation.and_then(|cont| cont.apcontinue);
            if continue_token.is_none() {
                break;
            }
        }
        Ok(count)
    }

    fn upload_from_url(
        &mut self,
        filename: &str,
        source_url: &str,
        text: &str,
        comment: &str,
    ) -> Result<UploadOutcome> {
        let token = self.ensure_csrf_token()?;
        let payload = self.api_post_raw(&[
            ("action", "upload".to_string()),
            ("filename", filename.to_string()),
            ("url", source_url.to_string()),
            ("text", text.to_string()),
            ("comment", comment.to_string()),
            ("token", token),
        ])?;
        Ok(classify_upload(&payload))
    }
}

/// Map a raw upload response to the pipeline's outcome taxonomy. API errors
/// and warnings both surface duplicates and name collisions, depending on the
/// remote's configuration.
pub fn classify_upload(payload: &Value) -> UploadOutcome {
    if let Some(error) = payload.get("error") {
        let code = error
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error");
        if code.contains("verification-error")
            && let Some(details) = error.get("details").and_then(Value::as_array)
            && details.first().and_then(Value::as_str) == Some("filetype-mime-mismatch")
            && let Some(declared) = details.get(2).and_then(Value::as_str)
        {
            return UploadOutcome::MimeMismatch {
                declared: declared.to_string(),
            };
        }
        if code.contains("duplicate") {
            return UploadOutcome::Duplicate;
        }
        if code.contains("exists-normalized") {
            return UploadOutcome::ExistsNormalized;
        }
        let info = error
            .get("info")
            .and_then(Value::as_str)
            .unwrap_or("unknown info");
        return UploadOutcome::Rejected {
            code: code.to_string(),
            info: info.to_string(),
        };
    }

    if let Some(upload) = payload.get("upload") {
        return match upload.get("result").and_then(Value::as_str) {
            Some("Success") => UploadOutcome::Success,
            Some("Warning") => {
                let warnings = upload
                    .get("warnings")
                    .and_then(Value::as_object)
                    .map(|map| map.keys().cloned().collect::<Vec<_>>())
                    .unwrap_or_default();
                if warnings.iter().any(|key| key.contains("duplicate")) {
                    UploadOutcome::Duplicate
                } else if warnings.iter().any(|key| key == "exists-normalized") {
                    UploadOutcome::ExistsNormalized
                } else {
                    UploadOutcome::Rejected {
                        code: "warning".to_string(),
                        info: warnings.join(", "),
                    }
                }
            }
            other => UploadOutcome::Rejected {
                code: "unexpected-result".to_string(),
                info: other.unwrap_or("missing result").to_string(),
            },
        };
    }

    UploadOutcome::Rejected {
        code: "unknown".to_string(),
        info: payload.to_string(),
    }
}

fn fail_on_api_error(payload: &Value) -> Result<()> {
    if let Some(error) = payload.get("error") {
        let code = error
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error");
        let info = error
            .get("info")
            .and_then(Value::as_str)
            .unwrap_or("unknown info");
        bail!("Commons API error [{code}]: {info}");
    }
    Ok(())
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect()
}

#[derive(Debug, Deserialize)]
struct TokenQueryResponse {
    query: TokenQuery,
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    tokens: Option<Tokens>,
}

#[derive(Debug, Deserialize)]
struct Tokens {
    csrftoken: Option<String>,
    logintoken: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    login: LoginBody,
}

#[derive(Debug, Deserialize)]
struct LoginBody {
    result: Option<String>,
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EditResponse {
    edit: Option<EditBody>,
}

#[derive(Debug, Deserialize)]
struct EditBody {
    result: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    query: QueryBody,
    #[serde(rename = "continue")]
    continuation: Option<Continuation>,
}

#[derive(Debug, Default, Deserialize)]
struct QueryBody {
    #[serde(default)]
    pages: Vec<PageInfo>,
    #[serde(default)]
    allpages: Vec<TitleEntry>,
}

#[derive(Debug, Deserialize)]
struct PageInfo {
    #[serde(default)]
    missing: Option<bool>,
    #[serde(default)]
    revisions: Vec<Revision>,
}

#[derive(Debug, Deserialize)]
struct Revision {
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    slots: Option<Slots>,
}

#[derive(Debug, Deserialize)]
struct Slots {
    main: Option<Slot>,
}

#[derive(Debug, Deserialize)]
struct Slot {
    content: String,
}

#[derive(Debug, Deserialize)]
struct TitleEntry {
    #[allow(dead_code)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct Continuation {
    apcontinue: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classify_upload_reads_mime_mismatch_details() {
        let payload = json!({
            "error": {
                "code": "verification-error",
                "info": "This file did not pass file verification",
                "details": ["filetype-mime-mismatch", "jpg", "image/png"]
            }
        });
        assert_eq!(
            classify_upload(&payload),
            UploadOutcome::MimeMismatch {
                declared: "image/png".to_string()
            }
        );
    }

    #[test]
    fn classify_upload_maps_duplicate_error_and_warning() {
        let as_error = json!({"error": {"code": "fileexists-duplicate", "info": "dup"}});
        assert_eq!(classify_upload(&as_error), UploadOutcome::Duplicate);

        let as_warning = json!({
            "upload": { "result": "Warning", "warnings": { "duplicate": ["Other.jpg"] } }
        });
        assert_eq!(classify_upload(&as_warning), UploadOutcome::Duplicate);
    }

    #[test]
    fn classify_upload_maps_exists_normalized() {
        let payload = json!({"error": {"code": "exists-normalized", "info": "collision"}});
        assert_eq!(classify_upload(&payload), UploadOutcome::ExistsNormalized);
    }

    #[test]
    fn classify_upload_success() {
        let payload = json!({"upload": {"result": "Success", "filename": "X.jpg"}});
        assert_eq!(classify_upload(&payload), UploadOutcome::Success);
    }

    #[test]
    fn classify_upload_keeps_unknown_diagnostics() {
        let payload = json!({"error": {"code": "ratelimited", "info": "slow down"}});
        match classify_upload(&payload) {
            UploadOutcome::Rejected { code, info } => {
                assert_eq!(code, "ratelimited");
                assert_eq!(info, "slow down");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn retryable_statuses_cover_server_errors_and_throttling() {
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable_status(StatusCode::FORBIDDEN));
    }
}
