//! Concept extraction and text condensing
//!
//! Pure string heuristics used by handshake composition. Kept free of
//! storage so they can be tested exhaustively on their own.

use std::sync::OnceLock;

use regex::Regex;

/// Maximum concepts returned per text
const MAX_CONCEPTS: usize = 3;

fn capitalized_phrase() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[A-Z][a-z]+(?:\s+[A-Z][a-z]+)+").expect("capitalized phrase pattern")
    })
}

/// Extract salient concepts from a text.
///
/// Primary heuristic: capitalized multi-word phrases, deduplicated in
/// order of appearance, first three kept. Fallback: the first two
/// content words longer than four characters.
pub fn extract_concepts(text: &str) -> Vec<String> {
    let mut concepts: Vec<String> = Vec::new();
    for m in capitalized_phrase().find_iter(text) {
        let phrase = m.as_str().to_string();
        if !concepts.contains(&phrase) {
            concepts.push(phrase);
        }
        if concepts.len() == MAX_CONCEPTS {
            return concepts;
        }
    }
    if !concepts.is_empty() {
        return concepts;
    }

    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| w.chars().count() > 4)
        .take(2)
        .map(str::to_string)
        .collect()
}

/// First sentence of a text, truncated to `max_chars` codepoints
pub fn condense(text: &str, max_chars: usize) -> String {
    let first_sentence = text
        .split_inclusive(['.', '!', '?'])
        .next()
        .unwrap_or(text)
        .trim();

    if first_sentence.chars().count() <= max_chars {
        return first_sentence.to_string();
    }

    let truncated: String = first_sentence.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", truncated.trim_end())
}

/// Short theme label for a memory: its category with underscores
/// opened up, else the leading words of its content
pub fn theme_label(category: Option<&str>, content: &str) -> String {
    if let Some(category) = category {
        if !category.is_empty() {
            return category.replace('_', " ");
        }
    }
    condense(content, 60)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_capitalized_phrases_in_order() {
        let text = "Notes on Substrate Independence and the Pattern Persistence question, \
                    plus Substrate Independence again.";
        let concepts = extract_concepts(text);
        assert_eq!(concepts, vec!["Substrate Independence", "Pattern Persistence"]);
    }

    #[test]
    fn test_caps_at_three_concepts() {
        let text = "First Thing then Second Thing then Third Thing then Fourth Thing.";
        assert_eq!(extract_concepts(text).len(), 3);
    }

    #[test]
    fn test_fallback_to_long_words() {
        let concepts = extract_concepts("the resonance between distant memories");
        assert_eq!(concepts, vec!["resonance", "between"]);
    }

    #[test]
    fn test_fallback_strips_punctuation() {
        let concepts = extract_concepts("exploring, considering: nothing else");
        assert_eq!(concepts, vec!["exploring", "considering"]);
    }

    #[test]
    fn test_empty_text_yields_nothing() {
        assert!(extract_concepts("").is_empty());
        assert!(extract_concepts("a an it of to").is_empty());
    }

    #[test]
    fn test_condense_takes_first_sentence() {
        let text = "Short claim. Much longer elaboration that should not appear.";
        assert_eq!(condense(text, 140), "Short claim.");
    }

    #[test]
    fn test_condense_truncates_on_char_boundary() {
        let text = "one sentence that just keeps going and going without any terminal punctuation at all";
        let out = condense(text, 30);
        assert!(out.chars().count() <= 30);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn test_theme_label_prefers_category() {
        assert_eq!(theme_label(Some("research_thread"), "x"), "research thread");
        assert_eq!(theme_label(None, "Plain content here."), "Plain content here.");
    }
}
