//! Alt-text candidate composition.
//!
//! Turns raw keyword text, a product description and the current visual
//! attributes into a fixed set of templated candidates, each capped to a
//! display length suitable for an `alt` attribute.

pub const MISSING_INPUT_MESSAGE: &str = "Please enter both keywords and product description.";

pub const ELLIPSIS: char = '\u{2026}';

/// Longest description embedded verbatim in a template.
pub const SHORT_DESC_LIMIT: usize = 60;

/// Longest candidate kept as-is.
pub const CANDIDATE_LIMIT: usize = 125;

/// Characters kept in front of the ellipsis when a candidate is cut.
pub const CANDIDATE_KEEP: usize = 122;

/// Split comma-separated keyword text into trimmed, non-empty tokens.
pub fn split_keywords(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn short_description(description: &str) -> String {
    if description.chars().count() <= SHORT_DESC_LIMIT {
        return description.to_string();
    }
    let head = description.chars().take(SHORT_DESC_LIMIT).collect::<String>();
    let mut out = head.trim_end().to_string();
    out.push(ELLIPSIS);
    out
}

/// Cap a composed candidate at [`CANDIDATE_LIMIT`] characters.
///
/// Longer strings keep their first [`CANDIDATE_KEEP`] characters followed by
/// a single ellipsis, so a cut candidate is always 123 characters long.
pub fn truncate_candidate(text: &str) -> String {
    if text.chars().count() <= CANDIDATE_LIMIT {
        return text.to_string();
    }
    let mut out = text.chars().take(CANDIDATE_KEEP).collect::<String>();
    out.push(ELLIPSIS);
    out
}

/// Build the alt-text candidates.
///
/// Returns exactly one explanatory string when either raw input is empty,
/// otherwise exactly three candidates. The check runs on the raw text, so
/// whitespace-only input still counts as supplied.
pub fn compose_alt_texts(raw_keywords: &str, raw_description: &str, attributes: &[String]) -> Vec<String> {
    if raw_keywords.is_empty() || raw_description.is_empty() {
        return vec![MISSING_INPUT_MESSAGE.to_string()];
    }

    let keywords = split_keywords(raw_keywords);
    let primary = keywords.first().map(String::as_str).unwrap_or("");
    let secondary = keywords.get(1).map(String::as_str).unwrap_or("");
    let short_desc = short_description(raw_description.trim());
    let highlights = attributes.join(", ");

    let secondary_clause = if secondary.is_empty() {
        String::new()
    } else {
        format!(" and {secondary}")
    };

    let variations = [
        format!("{short_desc}. Features {highlights}. Includes {primary}{secondary_clause}."),
        format!("Product with {highlights}, crafted for {primary} appeal. {short_desc}."),
        format!("{primary} product showcasing {highlights} and {secondary}. Ideal for {short_desc}"),
    ];

    variations.iter().map(|v| truncate_candidate(v)).collect()
}
