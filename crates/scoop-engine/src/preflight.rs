use tracing::debug;

/// Product-noun stems, Georgian and English. The matched stem doubles as
/// the search keyword.
const PRODUCT_NOUNS: [&str; 16] = [
    "პროტეინ",
    "კრეატინ",
    "ვიტამინ",
    "გეინერ",
    "ამინომჟავ",
    "ომეგა",
    "მაგნიუმ",
    "ცინკ",
    "კოლაგენ",
    "ელექტროლიტ",
    "protein",
    "creatine",
    "bcaa",
    "gainer",
    "vitamin",
    "omega",
];

/// Verbs and adjectives signalling purchase/recommendation intent.
const INTENT_VERBS: [&str; 10] = [
    "მინდა",
    "მჭირდება",
    "მირჩიე",
    "მირჩევ",
    "გირჩევ",
    "საუკეთესო",
    "ვეძებ",
    "want",
    "need",
    "recommend",
];

/// Interrogative markers besides a literal question mark.
const INTERROGATIVES: [&str; 4] = ["რა ", "რომელი", "როგორი", "which"];

/// Past-tense and complaint markers that veto the preflight — the user
/// is talking about a product, not asking for one.
const NEGATIVE_MARKERS: [&str; 7] = [
    "ვიყიდე",
    "ვცადე",
    "ცუდი",
    "დაბრუნება",
    " იყო",
    "არ მომეწონა",
    "მქონდა",
];

/// Mid-conversation cutoff: the preflight only fires early on.
const MAX_HISTORY_LEN: usize = 4;

/// Maximum products injected into the reference block.
pub const MAX_INJECTED_PRODUCTS: usize = 5;

/// Rule-based search-first classifier.
///
/// Fires when a product noun co-occurs with an intent verb or an
/// interrogative marker, the conversation is young, and no negative
/// marker is present. Returns the matched keyword stem.
pub fn product_query_keyword(message: &str, history_len: usize) -> Option<String> {
    if history_len > MAX_HISTORY_LEN {
        return None;
    }

    let lower = message.to_lowercase();

    let keyword = PRODUCT_NOUNS.iter().find(|noun| lower.contains(*noun))?;

    if NEGATIVE_MARKERS.iter().any(|m| lower.contains(m)) {
        debug!(message, "preflight vetoed by negative marker");
        return None;
    }

    let has_intent = INTENT_VERBS.iter().any(|v| lower.contains(v));
    let has_question = lower.contains('?') || INTERROGATIVES.iter().any(|q| lower.contains(q));
    if !(has_intent || has_question) {
        return None;
    }

    debug!(keyword, "preflight triggered");
    Some((*keyword).to_string())
}

/// Render products for context injection: `N. Name - P₾ (Brand)`.
pub fn format_products_for_injection(products: &[serde_json::Value]) -> String {
    products
        .iter()
        .take(MAX_INJECTED_PRODUCTS)
        .enumerate()
        .map(|(i, p)| {
            let name = p.get("name").and_then(|v| v.as_str()).unwrap_or("პროდუქტი");
            let mut line = format!("{}. {}", i + 1, name);
            if let Some(price) = p.get("price").and_then(|v| v.as_f64()) {
                if price.fract() == 0.0 {
                    line.push_str(&format!(" - {}₾", price as i64));
                } else {
                    line.push_str(&format!(" - {price}₾"));
                }
            }
            if let Some(brand) = p.get("brand").and_then(|v| v.as_str()) {
                if !brand.is_empty() {
                    line.push_str(&format!(" ({brand})"));
                }
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Wrap the user message with a clearly delimited reference block of
/// pre-searched products.
pub fn inject_products(message: &str, products: &[serde_json::Value]) -> String {
    if products.is_empty() {
        return message.to_string();
    }
    format!(
        "{message}\n\n[REFERENCE_PRODUCTS]\nკატალოგიდან წინასწარ ნაპოვნი პროდუქტები — \
         გამოიყენე ეს მონაცემები და ნუ ეძებ ხელახლა იგივეს:\n{}\n[/REFERENCE_PRODUCTS]",
        format_products_for_injection(products)
    )
}
