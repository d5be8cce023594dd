//! `$VAR` / `${VAR}` substitution in instruction arguments.
//!
//! Applied to ENV values and to COPY/ADD path arguments before use.
//! Substitution is a single left-to-right pass: names match `[A-Za-z0-9_]+`,
//! a reference immediately preceded by an odd run of backslashes stays
//! literal, unknown names are left untouched, and substituted values are
//! never re-scanned.

/// Substitute environment references in `value` from ordered `KEY=VALUE`
/// entries. The first entry whose key matches wins.
pub fn substitute_env(value: &str, env: &[String]) -> String {
    let mut out = String::with_capacity(value.len());
    let mut backslashes = 0usize;
    let mut i = 0;

    while i < value.len() {
        let rest = &value[i..];
        let Some(c) = rest.chars().next() else {
            break;
        };
        if c == '\\' {
            backslashes += 1;
            out.push(c);
            i += 1;
            continue;
        }
        if c == '$' && backslashes % 2 == 0 {
            if let Some((name, token_len)) = parse_reference(rest) {
                match lookup(env, name) {
                    Some(v) => out.push_str(v),
                    None => out.push_str(&rest[..token_len]),
                }
                backslashes = 0;
                i += token_len;
                continue;
            }
        }
        backslashes = 0;
        out.push(c);
        i += c.len_utf8();
    }

    out
}

/// Parse a `$NAME` or `${NAME}` reference at the start of `s`.
/// Returns the name and the total token length consumed.
fn parse_reference(s: &str) -> Option<(&str, usize)> {
    let rest = s.strip_prefix('$')?;
    if let Some(braced) = rest.strip_prefix('{') {
        let end = braced.find('}')?;
        let name = &braced[..end];
        if name.is_empty() || !is_name(name) {
            return None;
        }
        return Some((name, name.len() + 3));
    }
    let end = rest
        .char_indices()
        .find(|(_, c)| !c.is_ascii_alphanumeric() && *c != '_')
        .map(|(i, _)| i)
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    Some((&rest[..end], end + 1))
}

fn is_name(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn lookup<'a>(env: &'a [String], name: &str) -> Option<&'a str> {
    env.iter().find_map(|entry| {
        let (k, v) = entry.split_once('=')?;
        (k == name).then_some(v)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_plain_reference() {
        assert_eq!(substitute_env("$A", &env(&["A=1"])), "1");
    }

    #[test]
    fn test_braced_reference() {
        assert_eq!(substitute_env("${A}x", &env(&["A=1"])), "1x");
    }

    #[test]
    fn test_embedded_references() {
        assert_eq!(
            substitute_env("pre-$A-${B}-post", &env(&["A=1", "B=2"])),
            "pre-1-2-post"
        );
    }

    #[test]
    fn test_unknown_name_left_untouched() {
        assert_eq!(substitute_env("$MISSING/x", &env(&["A=1"])), "$MISSING/x");
        assert_eq!(substitute_env("${MISSING}", &env(&[])), "${MISSING}");
    }

    #[test]
    fn test_escaped_reference_is_literal() {
        assert_eq!(substitute_env(r"\$A", &env(&["A=1"])), r"\$A");
    }

    #[test]
    fn test_double_backslash_allows_substitution() {
        assert_eq!(substitute_env(r"\\$A", &env(&["A=1"])), r"\\1");
        assert_eq!(substitute_env(r"\\\$A", &env(&["A=1"])), r"\\\$A");
    }

    #[test]
    fn test_first_matching_entry_wins() {
        // The invariant keeps env unique per key; defend the lookup anyway
        assert_eq!(substitute_env("$A", &env(&["A=first", "A=second"])), "first");
    }

    #[test]
    fn test_not_recursive() {
        assert_eq!(substitute_env("$A", &env(&["A=$B", "B=2"])), "$B");
    }

    #[test]
    fn test_bare_dollar_passes_through() {
        assert_eq!(substitute_env("cost: $ 5", &env(&[])), "cost: $ 5");
        assert_eq!(substitute_env("${}", &env(&[])), "${}");
    }

    #[test]
    fn test_name_charset() {
        assert_eq!(
            substitute_env("$A_1b-tail", &env(&["A_1b=x"])),
            "x-tail"
        );
    }
}
