use std::collections::HashSet;

use anyhow::Result;
use log::info;

use crate::commons::CommonsApi;

/// Wiki subpages holding one id list each, in flush order.
pub const LEDGER_SUBPAGES: [&str; 4] = ["uploaded", "copyvio", "pending", "blacklist"];

/// One id list with O(1) membership and the size it had when loaded, so a
/// flush can skip lists nothing touched.
#[derive(Debug, Default)]
struct IdList {
    ids: Vec<String>,
    index: HashSet<String>,
    baseline: usize,
}

impl IdList {
    fn replace(&mut self, ids: Vec<String>) {
        self.index = ids.iter().cloned().collect();
        self.ids = ids;
        self.baseline = self.ids.len();
    }

    fn contains(&self, id: &str) -> bool {
        self.index.contains(id)
    }

    fn push_unique(&mut self, id: &str) {
        if self.index.insert(id.to_string()) {
            self.ids.push(id.to_string());
        }
    }

    fn dirty(&self) -> bool {
        self.ids.len() != self.baseline
    }
}

/// The shared dedup state: four id lists hosted as wiki pages under a common
/// prefix, readable and editable by anyone. `uploaded` and `pending` are
/// maintained by the bot, `copyvio` and `blacklist` by hand.
pub struct IdLedger {
    prefix: String,
    uploaded: IdList,
    copyvio: IdList,
    pending: IdList,
    blacklist: IdList,
}

impl IdLedger {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            uploaded: IdList::default(),
            copyvio: IdList::default(),
            pending: IdList::default(),
            blacklist: IdList::default(),
        }
    }

    /// Pull all four lists from the wiki. A missing subpage is an empty list.
    pub fn load(&mut self, api: &mut dyn CommonsApi) -> Result<()> {
        for subpage in LEDGER_SUBPAGES {
            let title = format!("{}{subpage}", self.prefix);
            let ids = match api.page_text(&title)? {
                Some(text) => extract_ids(&text),
                None => Vec::new(),
            };
            info!("ledger {subpage} loaded: {} items", ids.len());
            self.list_mut(subpage).replace(ids);
        }
        Ok(())
    }

    pub fn is_uploaded(&self, id: &str) -> bool {
        self.uploaded.contains(id)
    }

    pub fn is_copyright(&self, id: &str) -> bool {
        self.copyvio.contains(id)
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains(id)
    }

    pub fn is_blacklisted(&self, id: &str) -> bool {
        self.blacklist.contains(id)
    }

    /// Queue an id for manual copyright review. Idempotent.
    pub fn mark_pending(&mut self, id: &str) {
        self.pending.push_unique(id);
    }

    /// Union newly resolved ids into the uploaded list.
    pub fn record_uploaded(&mut self, ids: &[String]) {
        for id in ids {
            self.uploaded.push_unique(id);
        }
    }

    /// Write back every list whose size changed since load. The edit summary
    /// carries the new size and the delta against the size announced by the
    /// previous edit, so page history doubles as a growth log.
    pub fn flush(&mut self, api: &mut dyn CommonsApi) -> Result<()> {
        for subpage in LEDGER_SUBPAGES {
            if !self.list_mut(subpage).dirty() {
                continue;
            }
            let title = format!("{}{subpage}", self.prefix);
            let previous = api
                .latest_comment(&title)?
                .as_deref()
                .and_then(parse_announced_size)
                .unwrap_or(0);

            let list = self.list_mut(subpage);
            let size = list.ids.len();
            let diff = size as i64 - previous as i64;
            let content = list.ids.join("\n");
            let summary = format!("Bot, updating ids. Size: {size} ({diff:+}).");
            api.edit_page(&title, &content, &summary)?;
            list.baseline = size;
            info!("ledger {subpage} flushed: {size} items ({diff:+})");
        }
        Ok(())
    }

    fn list_mut(&mut self, subpage: &str) -> &mut IdList {
        match subpage {
            "uploaded" => &mut self.uploaded,
            "copyvio" => &mut self.copyvio,
            "pending" => &mut self.pending,
            _ => &mut self.blacklist,
        }
    }
}

/// Every maximal digit run in the page text is an id. Tolerates any markup
/// humans wrap around the lists.
pub fn extract_ids(text: &str) -> Vec<String> {
    let mut ids = Vec::new();
    let mut current = String::new();
    for character in text.chars() {
        if character.is_ascii_digit() {
            current.push(character);
        } else if !current.is_empty() {
            ids.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        ids.push(current);
    }
    ids
}

/// Pull the size a previous edit summary announced ("Size: 417 (+12).").
fn parse_announced_size(comment: &str) -> Option<usize> {
    let start = comment.find("Size: ")? + "Size: ".len();
    let digits: String = comment[start..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::commons::UploadOutcome;

    #[derive(Default)]
    struct FakeWiki {
        pages: HashMap<String, String>,
        comments: HashMap<String, String>,
        edits: Vec<(String, String, String)>,
    }

    impl CommonsApi for FakeWiki {
        fn login(&mut self, _username: &str, _password: &str) -> Result<()> {
            Ok(())
        }

        fn page_exists(&mut self, title: &str) -> Result<bool> {
            Ok(self.pages.contains_key(title))
        }

        fn page_text(&mut self, title: &str) -> Result<Option<String>> {
            Ok(self.pages.get(title).cloned())
        }

        fn latest_comment(&mut self, title: &str) -> Result<Option<String>> {
            Ok(self.comments.get(title).cloned())
        }

        fn edit_page(&mut self, title: &str, content: &str, summary: &str) -> Result<()> {
            self.pages.insert(title.to_string(), content.to_string());
            self.comments.insert(title.to_string(), summary.to_string());
            self.edits
                .push((title.to_string(), content.to_string(), summary.to_string()));
            Ok(())
        }

        fn count_file_prefix(&mut self, _prefix: &str) -> Result<usize> {
            Ok(0)
        }

        fn upload_from_url(
            &mut self,
            _filename: &str,
            _source_url: &str,
            _text: &str,
            _comment: &str,
        ) -> Result<UploadOutcome> {
            Ok(UploadOutcome::Success)
        }
    }

    const PREFIX: &str = "User:TestBot/Ids/";

    #[test]
    fn extract_ids_tolerates_markup() {
        let text = "* 123\n* 456\n<!-- manual -->789";
        assert_eq!(extract_ids(text), ["123", "456", "789"]);
        assert!(extract_ids("no numbers here").is_empty());
    }

    #[test]
    fn load_reads_all_four_lists_and_misses_are_empty() {
        let mut wiki = FakeWiki::default();
        wiki.pages
            .insert(format!("{PREFIX}uploaded"), "111\n222".to_string());
        wiki.pages
            .insert(format!("{PREFIX}blacklist"), "333".to_string());

        let mut ledger = IdLedger::new(PREFIX);
        ledger.load(&mut wiki).expect("load");

        assert!(ledger.is_uploaded("111"));
        assert!(ledger.is_blacklisted("333"));
        assert!(!ledger.is_copyright("111"));
        assert!(!ledger.is_pending("222"));
    }

    #[test]
    fn flush_writes_only_dirty_lists() {
        let mut wiki = FakeWiki::default();
        wiki.pages
            .insert(format!("{PREFIX}uploaded"), "111".to_string());

        let mut ledger = IdLedger::new(PREFIX);
        ledger.load(&mut wiki).expect("load");
        ledger.record_uploaded(&["222".to_string()]);
        ledger.flush(&mut wiki).expect("flush");

        assert_eq!(wiki.edits.len(), 1);
        let (title, content, _) = &wiki.edits[0];
        assert_eq!(title, &format!("{PREFIX}uploaded"));
        assert_eq!(content, "111\n222");
    }

    #[test]
    fn flush_summary_carries_delta_against_the_previous_edit() {
        let mut wiki = FakeWiki::default();
        wiki.pages
            .insert(format!("{PREFIX}uploaded"), "1\n2\n3".to_string());
        wiki.comments.insert(
            format!("{PREFIX}uploaded"),
            "Bot, updating ids. Size: 3 (+1).".to_string(),
        );

        let mut ledger = IdLedger::new(PREFIX);
        ledger.load(&mut wiki).expect("load");
        ledger.record_uploaded(&["4".to_string(), "5".to_string()]);
        ledger.flush(&mut wiki).expect("flush");

        let (_, _, summary) = &wiki.edits[0];
        assert_eq!(summary, "Bot, updating ids. Size: 5 (+2).");
    }

    #[test]
    fn flush_without_a_prior_comment_counts_from_zero() {
        let mut wiki = FakeWiki::default();
        let mut ledger = IdLedger::new(PREFIX);
        ledger.load(&mut wiki).expect("load");
        ledger.mark_pending("900");
        ledger.flush(&mut wiki).expect("flush");

        let (title, content, summary) = &wiki.edits[0];
        assert_eq!(title, &format!("{PREFIX}pending"));
        assert_eq!(content, "900");
        assert_eq!(summary, "Bot, updating ids. Size: 1 (+1).");
    }

    #[test]
    fn record_uploaded_and_mark_pending_are_idempotent() {
        let mut wiki = FakeWiki::default();
        let mut ledger = IdLedger::new(PREFIX);
        ledger.load(&mut wiki).expect("load");

        ledger.record_uploaded(&["1".to_string(), "1".to_string()]);
        ledger.mark_pending("2");
        ledger.mark_pending("2");
        ledger.flush(&mut wiki).expect("flush");

        let uploaded = wiki.pages.get(&format!("{PREFIX}uploaded")).expect("page");
        assert_eq!(uploaded, "1");
        let pending = wiki.pages.get(&format!("{PREFIX}pending")).expect("page");
        assert_eq!(pending, "2");
    }

    #[test]
    fn second_flush_after_no_changes_writes_nothing() {
        let mut wiki = FakeWiki::default();
        let mut ledger = IdLedger::new(PREFIX);
        ledger.load(&mut wiki).expect("load");
        ledger.record_uploaded(&["1".to_string()]);
        ledger.flush(&mut wiki).expect("flush");
        ledger.flush(&mut wiki).expect("flush again");
        assert_eq!(wiki.edits.len(), 1);
    }
}
