// Key canonicalisation
// Business keys are compared case- and diacritic-insensitively everywhere:
// in the in-file seen-set, in staging deduplication and in parent lookups.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Separator between key parts (ASCII unit separator, never valid in input)
pub const KEY_SEPARATOR: char = '\u{1f}';

/// Canonical form of a single key part: trimmed, accents stripped, upper-cased.
pub fn canonical_part(value: &str) -> String {
    value
        .trim()
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_uppercase()
}

/// Canonical form of a composite business key.
pub fn canonical_key(parts: &[&str]) -> String {
    let mut key = String::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            key.push(KEY_SEPARATOR);
        }
        key.push_str(&canonical_part(part));
    }
    key
}

/// Human-readable rendering of a key, used in error messages.
pub fn display_key(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim())
        .collect::<Vec<_>>()
        .join("/")
}
