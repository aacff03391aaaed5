use std::fmt;

/// How thinking progress is surfaced to the UI. Orthogonal to
/// correctness; selectable per engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThinkingStrategy {
    /// No thinking events at all.
    None,
    /// A small number of Georgian progress strings guessed from the
    /// message's intent class, paced with a short delay.
    #[default]
    SimpleLoader,
    /// Forward the model's thought parts as thinking events.
    Native,
}

impl ThinkingStrategy {
    /// Parse from the config slug. Case-insensitive; unknown values fall
    /// back to `SimpleLoader`.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "none" => ThinkingStrategy::None,
            "native" => ThinkingStrategy::Native,
            _ => ThinkingStrategy::SimpleLoader,
        }
    }
}

impl fmt::Display for ThinkingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ThinkingStrategy::None => "none",
            ThinkingStrategy::SimpleLoader => "simple_loader",
            ThinkingStrategy::Native => "native",
        };
        f.write_str(s)
    }
}

/// Intent class guessed from the user message for loader strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IntentClass {
    ProductSearch,
    ProfileUpdate,
    Greeting,
    General,
}

fn classify_intent(message: &str) -> IntentClass {
    let lower = message.to_lowercase();
    const PRODUCT: [&str; 8] = [
        "პროტეინ", "კრეატინ", "ვიტამინ", "გეინერ", "bcaa", "ომეგა", "protein", "creatine",
    ];
    const PROFILE: [&str; 5] = ["წლის ვარ", "ვიწონი", "ალერგია", "მიზანი", "სიმაღლე"];
    const GREETING: [&str; 4] = ["გამარჯობა", "სალამი", "hello", "hi"];

    if PRODUCT.iter().any(|k| lower.contains(k)) {
        IntentClass::ProductSearch
    } else if PROFILE.iter().any(|k| lower.contains(k)) {
        IntentClass::ProfileUpdate
    } else if GREETING.iter().any(|k| lower.contains(k)) {
        IntentClass::Greeting
    } else {
        IntentClass::General
    }
}

/// Progress strings for the simple-loader strategy.
pub fn loader_steps(message: &str) -> Vec<String> {
    let steps: &[&str] = match classify_intent(message) {
        IntentClass::ProductSearch => &[
            "ვეძებ შესაბამის პროდუქტებს კატალოგში...",
            "ვადარებ ვარიანტებს შენს საჭიროებებთან...",
            "ვამზადებ რეკომენდაციას...",
        ],
        IntentClass::ProfileUpdate => &[
            "ვიმახსოვრებ შენს მონაცემებს...",
            "ვაახლებ შენს პროფილს...",
        ],
        IntentClass::Greeting => &["ვფიქრობ პასუხზე..."],
        IntentClass::General => &[
            "ვფიქრობ შენს კითხვაზე...",
            "ვამზადებ პასუხს...",
        ],
    };
    steps.iter().map(|s| s.to_string()).collect()
}
