use scoop_memory::UserProfile;

/// Placeholder replaced with the rendered fact list at session build.
pub const USER_FACTS_PLACEHOLDER: &str = "{{USER_FACTS}}";

/// Budget for the rendered fact section.
const FACTS_MAX_CHARS: usize = 2000;

/// Base system prompt for the sports-nutrition consultant. Carries the
/// output-format contract the response buffer parses: the optional
/// `[TIP]` block and the `[QUICK_REPLIES]` block.
pub const BASE_SYSTEM_PROMPT: &str = "\
შენ ხარ Scoop — სპორტული კვების კონსულტანტი. პასუხობ ქართულად, \
მეგობრულად და კონკრეტულად.

წესები:
- პროდუქტების მოსაძებნად გამოიყენე search_products ფუნქცია. ერთი და \
იგივე ძიება ორჯერ არ გაიმეორო.
- მომხმარებლის ალერგიები და მიზნები ყოველთვის გაითვალისწინე.
- ახალი პირადი ფაქტი (ასაკი, წონა, მიზანი, ალერგია) შეინახე \
update_user_profile ფუნქციით.
- რეკომენდაციის ბოლოს შეგიძლია დაურთო ერთი ჯანმრთელობის რჩევა ბლოკში \
[TIP]...[/TIP].
- პასუხის ბოლოს შესთავაზე მაქსიმუმ 4 მოკლე გაგრძელების ვარიანტი ბლოკში \
[QUICK_REPLIES]...[/QUICK_REPLIES], თითო ხაზზე თითო ვარიანტი.

რაც ვიცით მომხმარებელზე:
{{USER_FACTS}}";

/// Build the merged system instruction: base prompt with the
/// `{{USER_FACTS}}` placeholder replaced by a compact rendering of the
/// user's curated + daily facts and core attributes.
pub fn build_system_instruction(base: &str, profile: &UserProfile) -> String {
    let mut facts = String::new();

    if let Some(name) = &profile.name {
        facts.push_str(&format!("- სახელი: {name}\n"));
    }
    if !profile.allergies.is_empty() {
        facts.push_str(&format!("- ალერგიები: {}\n", profile.allergies.join(", ")));
    }
    if !profile.goals.is_empty() {
        facts.push_str(&format!("- მიზნები: {}\n", profile.goals.join(", ")));
    }
    if let Some(level) = &profile.fitness_level {
        facts.push_str(&format!("- დონე: {level}\n"));
    }
    facts.push_str(&profile.render_facts(FACTS_MAX_CHARS));

    if facts.is_empty() {
        facts.push_str("(ჯერ არაფერი)");
    }

    base.replace(USER_FACTS_PLACEHOLDER, facts.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use scoop_memory::{Fact, FactSource};

    #[test]
    fn placeholder_is_replaced() {
        let profile = UserProfile::default();
        let prompt = build_system_instruction(BASE_SYSTEM_PROMPT, &profile);
        assert!(!prompt.contains(USER_FACTS_PLACEHOLDER));
        assert!(prompt.contains("(ჯერ არაფერი)"));
    }

    #[test]
    fn attributes_and_facts_are_rendered() {
        let mut profile = UserProfile::default();
        profile.name = Some("გიორგი".to_string());
        profile.allergies.push("ლაქტოზა".to_string());
        profile.curated_facts.push(Fact {
            text: "ვარჯიშობს კვირაში 5-ჯერ".to_string(),
            embedding: vec![0.0; 768],
            created_at: Utc::now(),
            importance: 0.9,
            source: FactSource::UserStated,
            is_sensitive: false,
            expires_at: None,
        });
        let prompt = build_system_instruction(BASE_SYSTEM_PROMPT, &profile);
        assert!(prompt.contains("გიორგი"));
        assert!(prompt.contains("ლაქტოზა"));
        assert!(prompt.contains("ვარჯიშობს კვირაში 5-ჯერ"));
    }
}
