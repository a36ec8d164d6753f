//! Flag string helpers
//!
//! A flag string is a space separated list of tokens. System flags carry a
//! leading backslash (`\Seen`), keywords do not. Matching ignores ASCII case.

pub const SEEN: &str = "\\Seen";
pub const ANSWERED: &str = "\\Answered";
pub const FLAGGED: &str = "\\Flagged";
pub const DELETED: &str = "\\Deleted";
pub const DRAFT: &str = "\\Draft";
pub const RECENT: &str = "\\Recent";

/// Iterate over the tokens of a flag string
pub fn tokens(flags: &str) -> impl Iterator<Item = &str> {
    flags.split_whitespace()
}

/// Collapse runs of whitespace and trim
pub fn normalize(flags: &str) -> String {
    tokens(flags).collect::<Vec<_>>().join(" ")
}

/// Check whether `flags` carries `flag`
pub fn contains(flags: &str, flag: &str) -> bool {
    tokens(flags).any(|t| t.eq_ignore_ascii_case(flag))
}

/// Union of `flags` and `added`, keeping the existing order
pub fn add<'a>(flags: &str, added: impl IntoIterator<Item = &'a str>) -> String {
    let mut result: Vec<&str> = tokens(flags).collect();
    for flag in added {
        if !result.iter().any(|t| t.eq_ignore_ascii_case(flag)) {
            result.push(flag);
        }
    }
    result.join(" ")
}

/// `flags` without any of `removed`
pub fn remove<'a>(flags: &str, removed: impl IntoIterator<Item = &'a str>) -> String {
    let removed: Vec<&str> = removed.into_iter().collect();
    tokens(flags)
        .filter(|t| !removed.iter().any(|r| r.eq_ignore_ascii_case(t)))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_is_case_insensitive() {
        assert!(contains("\\Seen \\Answered", "\\seen"));
        assert!(contains("$Work  \\Flagged", "$work"));
        assert!(!contains("\\Seen", "\\Answered"));
        assert!(!contains("\\Seenx", "\\Seen"));
        assert!(!contains("", SEEN));
    }

    #[test]
    fn test_add_and_remove() {
        assert_eq!(add("\\Seen", ["\\seen", "\\Flagged"]), "\\Seen \\Flagged");
        assert_eq!(remove("\\Seen \\Flagged $A", ["\\flagged"]), "\\Seen $A");
        assert_eq!(normalize("  \\Seen   \\Draft "), "\\Seen \\Draft");
    }
}
