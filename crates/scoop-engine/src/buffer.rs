use std::collections::HashSet;
use std::sync::Mutex;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Where the tip came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TipSource {
    /// Extracted from a `[TIP]…[/TIP]` block in model text.
    Native,
    /// Filled in afterwards because no native tip was present.
    Generated,
}

/// One suggested follow-up reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuickReply {
    pub title: String,
    pub payload: String,
}

/// Immutable snapshot of buffer state, safe to emit externally.
#[derive(Debug, Clone, Serialize)]
pub struct BufferSnapshot {
    pub text: String,
    pub products: Vec<serde_json::Value>,
    pub tip: Option<String>,
    pub tip_source: Option<TipSource>,
    pub quick_replies: Vec<QuickReply>,
    pub product_count: usize,
    pub has_content: bool,
}

#[derive(Default)]
struct Inner {
    text: String,
    products: Vec<serde_json::Value>,
    product_ids: HashSet<String>,
    tip: Option<String>,
    tip_source: Option<TipSource>,
    quick_replies: Vec<QuickReply>,
    tip_extracted: bool,
    quick_replies_extracted: bool,
}

/// Thread-safe accumulator for one assistant turn: text, products, tip,
/// and quick replies.
///
/// Every public method takes the lock exactly once and delegates to
/// unlocked helpers — the extraction helpers call each other, so the
/// lock is never re-acquired on an internal path.
pub struct ResponseBuffer {
    inner: Mutex<Inner>,
    tip_re: Regex,
    quick_replies_re: Regex,
    /// Open tag with no closing tag — recovery path for truncated output.
    quick_replies_open_re: Regex,
    /// Georgian "next step" heading fallback.
    next_step_re: Regex,
}

impl Default for ResponseBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseBuffer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            tip_re: Regex::new(r"(?is)\[TIP\](.*?)\[/TIP\]").expect("tip pattern"),
            quick_replies_re: Regex::new(r"(?is)\[QUICK_REPLIES\](.*?)\[/QUICK_REPLIES\]")
                .expect("quick replies pattern"),
            quick_replies_open_re: Regex::new(r"(?is)\[QUICK_REPLIES\](.*)\z")
                .expect("open quick replies pattern"),
            next_step_re: Regex::new(r"(?i)შემდეგი ნაბიჯი[:\s]*").expect("next step pattern"),
        }
    }

    // ── Text ────────────────────────────────────────────────────────────────

    /// Append a streamed text chunk.
    pub fn append_text(&self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.text.push_str(chunk);
    }

    /// Replace the whole text. Resets extraction flags — the new text
    /// must be scanned again.
    pub fn set_text(&self, text: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.text = text.to_string();
        inner.tip_extracted = false;
        inner.quick_replies_extracted = false;
    }

    pub fn text(&self) -> String {
        self.inner.lock().unwrap().text.clone()
    }

    pub fn has_text(&self) -> bool {
        !self.inner.lock().unwrap().text.trim().is_empty()
    }

    /// Drop all state (fallback re-execution starts from a clean buffer).
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = Inner::default();
    }

    // ── Products ────────────────────────────────────────────────────────────

    /// Add products, deduplicating by whichever of `id`, `_id`,
    /// `product_id` is present. First occurrence wins; items without any
    /// id are always appended. Returns how many were actually added.
    pub fn add_products(&self, products: &[serde_json::Value]) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let mut added = 0;
        for product in products {
            match product_id(product) {
                Some(pid) => {
                    if inner.product_ids.insert(pid) {
                        inner.products.push(product.clone());
                        added += 1;
                    }
                }
                None => {
                    inner.products.push(product.clone());
                    added += 1;
                }
            }
        }
        added
    }

    pub fn products(&self) -> Vec<serde_json::Value> {
        self.inner.lock().unwrap().products.clone()
    }

    pub fn product_count(&self) -> usize {
        self.inner.lock().unwrap().products.len()
    }

    pub fn has_products(&self) -> bool {
        !self.inner.lock().unwrap().products.is_empty()
    }

    // ── Tip ─────────────────────────────────────────────────────────────────

    /// Extract a `[TIP]…[/TIP]` block from the text, if present, and store
    /// it as the native tip. The block is removed from the text in place.
    /// Idempotent: runs at most once per text mutation.
    pub fn extract_and_set_tip(&self) -> Option<String> {
        let mut inner = self.inner.lock().unwrap();
        self.extract_tip_unlocked(&mut inner);
        inner.tip.clone()
    }

    /// Fill the tip only when no native tip was extracted.
    pub fn set_generated_tip(&self, tip: &str) -> bool {
        if tip.is_empty() {
            return false;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.tip.is_none() {
            inner.tip = Some(tip.to_string());
            inner.tip_source = Some(TipSource::Generated);
            true
        } else {
            false
        }
    }

    pub fn tip(&self) -> Option<String> {
        self.inner.lock().unwrap().tip.clone()
    }

    pub fn tip_source(&self) -> Option<TipSource> {
        self.inner.lock().unwrap().tip_source
    }

    // ── Quick replies ───────────────────────────────────────────────────────

    /// Extract the `[QUICK_REPLIES]` block (or its fallbacks) from the
    /// text. The region is removed from the text; at most 4 replies are
    /// kept. Idempotent per text mutation.
    pub fn parse_quick_replies(&self) -> Vec<QuickReply> {
        let mut inner = self.inner.lock().unwrap();
        self.parse_quick_replies_unlocked(&mut inner);
        inner.quick_replies.clone()
    }

    pub fn quick_replies(&self) -> Vec<QuickReply> {
        self.inner.lock().unwrap().quick_replies.clone()
    }

    /// Set replies directly (external generation path).
    pub fn set_quick_replies(&self, replies: Vec<QuickReply>) {
        let mut inner = self.inner.lock().unwrap();
        inner.quick_replies = replies.into_iter().take(4).collect();
        inner.quick_replies_extracted = true;
    }

    // ── Assembly ────────────────────────────────────────────────────────────

    /// Run both extractions and return `(clean_text, tip, quick_replies)`.
    pub fn finalize(&self) -> (String, Option<String>, Vec<QuickReply>) {
        let mut inner = self.inner.lock().unwrap();
        self.extract_tip_unlocked(&mut inner);
        self.parse_quick_replies_unlocked(&mut inner);
        (
            inner.text.clone(),
            inner.tip.clone(),
            inner.quick_replies.clone(),
        )
    }

    /// Immutable snapshot of the current state.
    pub fn snapshot(&self) -> BufferSnapshot {
        let inner = self.inner.lock().unwrap();
        BufferSnapshot {
            text: inner.text.clone(),
            products: inner.products.clone(),
            tip: inner.tip.clone(),
            tip_source: inner.tip_source,
            quick_replies: inner.quick_replies.clone(),
            product_count: inner.products.len(),
            has_content: !inner.text.trim().is_empty() || !inner.products.is_empty(),
        }
    }

    pub fn has_content(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        !inner.text.trim().is_empty() || !inner.products.is_empty()
    }

    /// Render accumulated products as markdown cards (UI contract).
    pub fn format_products_markdown(&self) -> String {
        let inner = self.inner.lock().unwrap();
        let mut lines = Vec::new();
        for (i, product) in inner.products.iter().take(10).enumerate() {
            let name = product
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("პროდუქტი");
            let mut line = format!("**{}. {}**", i + 1, name);
            if let Some(brand) = product.get("brand").and_then(|v| v.as_str()) {
                if !brand.is_empty() {
                    line.push_str(&format!(" - {brand}"));
                }
            }
            if let Some(price) = product.get("price").and_then(|v| v.as_f64()) {
                if price > 0.0 {
                    line.push_str(&format!(" - ₾{}", format_price(price)));
                }
            }
            lines.push(line);
        }
        lines.join("\n")
    }

    /// Does the text already carry product markdown of its own?
    pub fn has_valid_product_markdown(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        if inner.text.is_empty() {
            return false;
        }
        let numbered = Regex::new(r"\*\*\d+\.").unwrap();
        if numbered.is_match(&inner.text) {
            return true;
        }
        let bold = Regex::new(r"\*\*[^*]+\*\*").unwrap();
        bold.find_iter(&inner.text).count() >= 2
    }

    // ── Unlocked internals ──────────────────────────────────────────────────

    fn extract_tip_unlocked(&self, inner: &mut Inner) {
        if inner.tip_extracted {
            return;
        }
        if let Some(caps) = self.tip_re.captures(&inner.text) {
            let tip = caps.get(1).map(|m| m.as_str().trim().to_string());
            inner.text = self.tip_re.replace_all(&inner.text, "").trim().to_string();
            inner.tip = tip;
            inner.tip_source = Some(TipSource::Native);
        }
        inner.tip_extracted = true;
    }

    fn parse_quick_replies_unlocked(&self, inner: &mut Inner) {
        if inner.quick_replies_extracted {
            return;
        }

        let mut replies = Vec::new();
        if let Some(caps) = self.quick_replies_re.captures(&inner.text) {
            replies = parse_reply_content(caps.get(1).map(|m| m.as_str()).unwrap_or(""));
            inner.text = self
                .quick_replies_re
                .replace_all(&inner.text, "")
                .trim()
                .to_string();
        } else if let Some(caps) = self.quick_replies_open_re.captures(&inner.text) {
            // Truncated output: no closing tag. Salvage the complete
            // bullet items up to the cut and drop the whole region.
            let content = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            replies = parse_reply_content(trim_truncated_tail(content));
            inner.text = self
                .quick_replies_open_re
                .replace_all(&inner.text, "")
                .trim()
                .to_string();
        } else if let Some(m) = self.next_step_re.find(&inner.text) {
            // Georgian heading fallback: items run until a blank line,
            // an opening bracket, or end of text.
            let tail = &inner.text[m.end()..];
            let end = tail
                .find("\n\n")
                .or_else(|| tail.find('['))
                .unwrap_or(tail.len());
            replies = parse_reply_content(&tail[..end]);
            let region_end = m.end() + end;
            let mut text = String::with_capacity(inner.text.len());
            text.push_str(&inner.text[..m.start()]);
            text.push_str(&inner.text[region_end..]);
            inner.text = text.trim().to_string();
        }

        inner.quick_replies = replies;
        inner.quick_replies_extracted = true;
    }
}

/// Dedup key for a product object.
pub(crate) fn product_id(product: &serde_json::Value) -> Option<String> {
    for key in ["id", "_id", "product_id"] {
        if let Some(v) = product.get(key) {
            match v {
                serde_json::Value::String(s) if !s.is_empty() => return Some(s.clone()),
                serde_json::Value::Number(n) => return Some(n.to_string()),
                _ => {}
            }
        }
    }
    None
}

/// Parse a reply region into normalised titles: bullets, numbered items,
/// and semicolon-separated lists all collapse to plain lines.
fn parse_reply_content(content: &str) -> Vec<QuickReply> {
    let bullet_prefix = Regex::new(r"^[\s\-\*•\d.]+").unwrap();
    content
        .split(['\n', ';'])
        .filter_map(|line| {
            let line = bullet_prefix.replace(line, "").trim().to_string();
            if line.chars().count() > 2 {
                let title: String = line.chars().take(100).collect();
                Some(QuickReply {
                    payload: title.clone(),
                    title,
                })
            } else {
                None
            }
        })
        .take(4)
        .collect()
}

/// Drop the final line of a truncated region — it was cut mid-word.
fn trim_truncated_tail(content: &str) -> &str {
    match content.trim_end().rfind('\n') {
        Some(idx) => &content[..idx],
        None => "",
    }
}

fn format_price(price: f64) -> String {
    if price.fract() == 0.0 {
        format!("{}", price as i64)
    } else {
        format!("{price}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(id: &str, name: &str) -> serde_json::Value {
        serde_json::json!({"id": id, "name": name, "price": 89.0, "brand": "ON"})
    }

    #[test]
    fn append_accumulates() {
        let buf = ResponseBuffer::new();
        buf.append_text("გამარჯობა ");
        buf.append_text("მსოფლიო");
        assert_eq!(buf.text(), "გამარჯობა მსოფლიო");
    }

    #[test]
    fn product_dedup_first_occurrence_wins() {
        let buf = ResponseBuffer::new();
        let first = serde_json::json!({"id": "1", "name": "Original"});
        let dup = serde_json::json!({"id": "1", "name": "Duplicate"});
        assert_eq!(buf.add_products(&[first.clone()]), 1);
        assert_eq!(buf.add_products(&[dup]), 0);
        assert_eq!(buf.product_count(), 1);
        assert_eq!(buf.products()[0]["name"], "Original");
    }

    #[test]
    fn dedup_covers_alternate_id_fields() {
        let buf = ResponseBuffer::new();
        buf.add_products(&[serde_json::json!({"_id": "x", "name": "a"})]);
        buf.add_products(&[serde_json::json!({"product_id": "x", "name": "b"})]);
        assert_eq!(buf.product_count(), 1);
    }

    #[test]
    fn products_without_id_always_append() {
        let buf = ResponseBuffer::new();
        buf.add_products(&[serde_json::json!({"name": "anon"})]);
        buf.add_products(&[serde_json::json!({"name": "anon"})]);
        assert_eq!(buf.product_count(), 2);
    }

    #[test]
    fn tip_extraction_removes_block_and_is_idempotent() {
        let buf = ResponseBuffer::new();
        buf.set_text("რეკომენდაცია.\n[TIP]დალიე წყალი ვარჯიშის შემდეგ[/TIP]\nსხვა ტექსტი.");
        let tip = buf.extract_and_set_tip();
        assert_eq!(tip.as_deref(), Some("დალიე წყალი ვარჯიშის შემდეგ"));
        assert_eq!(buf.tip_source(), Some(TipSource::Native));
        assert!(!buf.text().contains("[TIP]"));

        // repeated calls with no text mutation change nothing
        let again = buf.extract_and_set_tip();
        assert_eq!(again, tip);
        assert!(!buf.text().contains("TIP"));
    }

    #[test]
    fn tip_extraction_is_case_insensitive_and_multiline() {
        let buf = ResponseBuffer::new();
        buf.set_text("text [tip]first line\nsecond line[/tip] more");
        let tip = buf.extract_and_set_tip().unwrap();
        assert!(tip.contains("second line"));
    }

    #[test]
    fn generated_tip_never_overrides_native() {
        let buf = ResponseBuffer::new();
        buf.set_text("[TIP]native[/TIP]");
        buf.extract_and_set_tip();
        assert!(!buf.set_generated_tip("generated"));
        assert_eq!(buf.tip().as_deref(), Some("native"));
        assert_eq!(buf.tip_source(), Some(TipSource::Native));

        let buf2 = ResponseBuffer::new();
        buf2.set_text("no tip here");
        buf2.extract_and_set_tip();
        assert!(buf2.set_generated_tip("generated"));
        assert_eq!(buf2.tip_source(), Some(TipSource::Generated));
    }

    #[test]
    fn quick_replies_block_parses_bullets() {
        let buf = ResponseBuffer::new();
        buf.set_text(
            "პასუხი.\n[QUICK_REPLIES]\n- პროტეინის დოზირება\n- სხვა ვიტამინები\n2. კრეატინი\n[/QUICK_REPLIES]",
        );
        let replies = buf.parse_quick_replies();
        assert_eq!(replies.len(), 3);
        assert_eq!(replies[0].title, "პროტეინის დოზირება");
        assert_eq!(replies[2].title, "კრეატინი");
        assert!(!buf.text().contains("QUICK_REPLIES"));
    }

    #[test]
    fn quick_replies_cap_at_four() {
        let buf = ResponseBuffer::new();
        buf.set_text("[QUICK_REPLIES]one one;two two;three three;four four;five five[/QUICK_REPLIES]");
        assert_eq!(buf.parse_quick_replies().len(), 4);
    }

    #[test]
    fn truncated_block_recovers_complete_items() {
        let buf = ResponseBuffer::new();
        buf.set_text("პასუხი.\n[QUICK_REPLIES]\n- პროტეინის დოზირება\n- სხვა ვიტამინები\n- შეკვ...");
        let replies = buf.parse_quick_replies();
        assert!(replies.len() >= 2);
        assert_eq!(replies[0].title, "პროტეინის დოზირება");
        assert_eq!(replies[1].title, "სხვა ვიტამინები");
        assert!(!buf.text().contains("[QUICK_REPLIES]"));
    }

    #[test]
    fn georgian_heading_fallback() {
        let buf = ResponseBuffer::new();
        buf.set_text("რეკომენდაცია აქ.\n\nშემდეგი ნაბიჯი:\n- დოზირების გარკვევა\n- გემოს არჩევა\n\nდამატებითი ტექსტი.");
        let replies = buf.parse_quick_replies();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].title, "დოზირების გარკვევა");
        assert!(!buf.text().contains("შემდეგი ნაბიჯი"));
        assert!(buf.text().contains("დამატებითი ტექსტი"));
    }

    #[test]
    fn set_text_resets_extraction_flags() {
        let buf = ResponseBuffer::new();
        buf.set_text("[TIP]first[/TIP]");
        buf.extract_and_set_tip();
        buf.set_text("[TIP]second[/TIP]");
        let tip = buf.extract_and_set_tip();
        assert_eq!(tip.as_deref(), Some("second"));
    }

    #[test]
    fn snapshot_is_complete() {
        let buf = ResponseBuffer::new();
        buf.set_text("text body");
        buf.add_products(&[product("1", "Whey")]);
        let snap = buf.snapshot();
        assert_eq!(snap.text, "text body");
        assert_eq!(snap.product_count, 1);
        assert!(snap.has_content);
    }

    #[test]
    fn markdown_formatting() {
        let buf = ResponseBuffer::new();
        buf.add_products(&[product("1", "Whey Protein")]);
        let md = buf.format_products_markdown();
        assert_eq!(md, "**1. Whey Protein** - ON - ₾89");
    }

    #[test]
    fn valid_product_markdown_detection() {
        let buf = ResponseBuffer::new();
        buf.set_text("აი ვარიანტები:\n**1. Whey** - 89₾");
        assert!(buf.has_valid_product_markdown());

        let buf2 = ResponseBuffer::new();
        buf2.set_text("უბრალო ტექსტი ყოველგვარი ფორმატირების გარეშე");
        assert!(!buf2.has_valid_product_markdown());
    }

    #[test]
    fn clear_resets_everything() {
        let buf = ResponseBuffer::new();
        buf.set_text("text");
        buf.add_products(&[product("1", "x")]);
        buf.clear();
        assert!(!buf.has_content());
        // same id can be added again after clear
        assert_eq!(buf.add_products(&[product("1", "x")]), 1);
    }
}
