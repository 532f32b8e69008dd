//! JSONC preprocessing for devcontainer files.
//!
//! Devcontainer specifications are JSON with comments and trailing commas.
//! This module strips both so the result can be fed to a strict JSON parser.

/// Strip `//` and `/* */` comments and trailing commas from JSONC input.
///
/// String literals are left untouched, including escaped quotes inside them.
#[must_use]
pub fn strip(input: &str) -> String {
    let without_comments = strip_comments(input);
    strip_trailing_commas(&without_comments)
}

fn strip_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for next in chars.by_ref() {
                    // Preserve line numbers for parser diagnostics.
                    if next == '\n' {
                        out.push('\n');
                    }
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
            }
            _ => out.push(c),
        }
    }

    out
}

fn strip_trailing_commas(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;

    for c in input.chars() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '}' | ']' => {
                // Drop a comma that is only separated from the closer by
                // whitespace.
                let trailing_ws: String = out
                    .chars()
                    .rev()
                    .take_while(|ch| ch.is_whitespace())
                    .collect();
                let trimmed_len = out.len() - trailing_ws.len();
                if out[..trimmed_len].ends_with(',') {
                    out.truncate(trimmed_len - 1);
                    out.extend(trailing_ws.chars().rev());
                }
                out.push(c);
            }
            _ => out.push(c),
        }
    }

    out
}
