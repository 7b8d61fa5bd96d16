//! SQL `LIKE` / shell-glob compilation for [super::Dictionary::pattern_search].

use regex::Regex;

/// Translate a `LIKE`-style pattern (`%`, `_`, `*`, `?`, `\`-escape) into an
/// anchored regex.
pub fn compile(pattern: &str, case_sensitive: bool) -> Regex {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    out.push_str(&regex::escape(&next.to_string()));
                }
            }
            '%' | '*' => out.push_str(".*"),
            '_' | '?' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    let folded = if case_sensitive { out } else { out.to_ascii_uppercase() };
    let mut builder = regex::RegexBuilder::new(&folded);
    builder.case_insensitive(!case_sensitive);
    builder.build().expect("LIKE pattern translates to a valid regex")
}

/// Extract the literal prefix (characters before the first metacharacter),
/// used to narrow the key-space scan.
pub fn constant_prefix(pattern: &str) -> String {
    let mut out = String::new();
    let mut chars = pattern.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            '%' | '*' | '_' | '?' => break,
            '\\' => {
                chars.next();
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            _ => {
                out.push(c);
                chars.next();
            }
        }
    }
    out
}

#[cfg(test)]
mod pattern_test {
    use super::*;

    #[test]
    fn test_like_translation() {
        let re = compile("A%x", true);
        assert!(re.is_match("Apex"));
        assert!(!re.is_match("Axe"));
        assert!(!re.is_match("ax"));
    }

    #[test]
    fn test_prefix_extraction() {
        assert_eq!(constant_prefix("foo%bar"), "foo");
        assert_eq!(constant_prefix("a_b"), "a");
        assert_eq!(constant_prefix("noglob"), "noglob");
    }
}
