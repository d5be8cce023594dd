//! Recipe preprocessing.
//!
//! Turns raw recipe text into logical steps: comment lines are dropped
//! before continuations are joined, so a comment inside a continued
//! command does not break the join. Tabs are normalized to spaces and
//! each logical line is trimmed of surrounding whitespace and `\r`.

/// Split recipe text into non-blank logical lines.
pub fn logical_lines(text: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();

    for line in text.lines() {
        if line.trim_start().starts_with('#') {
            continue;
        }
        let trimmed_end = line.trim_end();
        if let Some(joined) = trimmed_end.strip_suffix('\\') {
            current.push_str(joined);
            continue;
        }
        current.push_str(line);

        let logical = normalize(&current);
        if !logical.is_empty() {
            lines.push(logical);
        }
        current.clear();
    }

    // Trailing continuation with no final line
    let logical = normalize(&current);
    if !logical.is_empty() {
        lines.push(logical);
    }

    lines
}

fn normalize(line: &str) -> String {
    line.replace('\t', " ").trim_matches([' ', '\r']).to_string()
}

/// Split a logical line once on the first whitespace run into
/// `(instruction, arguments)`. Returns `None` when the line carries no
/// arguments.
pub fn split_instruction(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    let pos = line.find(char::is_whitespace)?;
    let (keyword, rest) = line.split_at(pos);
    let arguments = rest.trim_start();
    if arguments.is_empty() {
        return None;
    }
    Some((keyword, arguments))
}
