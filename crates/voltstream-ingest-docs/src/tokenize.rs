//! Lexical tokenizer shared by indexing and querying.

const MIN_TOKEN_LEN: usize = 2;
const MAX_TOKEN_LEN: usize = 64;
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "do", "does", "for", "how", "if", "in", "is",
    "it", "of", "on", "or", "the", "to", "what", "when", "why", "with",
];

/// Lowercased alphanumeric runs, split at camelCase boundaries, minus
/// stopwords and one-character noise.
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut prev_was_lower = false;

    for c in text.chars() {
        if c.is_alphanumeric() {
            // "lensCover" -> "lens" "cover"
            if c.is_uppercase() && prev_was_lower && !current.is_empty() {
                push_token(&mut tokens, &mut current);
            }
            if current.chars().count() < MAX_TOKEN_LEN {
                current.extend(c.to_lowercase());
            }
            prev_was_lower = c.is_lowercase();
            continue;
        }
        if !current.is_empty() {
            push_token(&mut tokens, &mut current);
        }
        prev_was_lower = false;
    }
    if !current.is_empty() {
        push_token(&mut tokens, &mut current);
    }
    tokens
}

fn push_token(tokens: &mut Vec<String>, current: &mut String) {
    if current.chars().count() >= MIN_TOKEN_LEN && !STOPWORDS.contains(&current.as_str()) {
        tokens.push(std::mem::take(current));
    } else {
        current.clear();
    }
}
