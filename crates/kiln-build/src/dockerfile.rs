//! Dockerfile final-stage normalization.
//!
//! A build always targets the Dockerfile's final stage, but authors are
//! free to leave it unnamed. Normalization guarantees a named final stage
//! without touching any earlier stage, so downstream tagging and hashing
//! see a stable shape regardless of authoring style.

use kiln_common::{KilnError, KilnResult};

/// Stage name applied when the final stage is unnamed.
pub const DEFAULT_FINAL_STAGE: &str = "kiln_auto_final_stage";

/// A Dockerfile guaranteed to expose a named final stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedDockerfile {
    /// The original content as read from disk.
    pub raw: String,
    /// Content guaranteed to carry the final stage name. Identical to
    /// `raw` when the final stage was already named.
    pub content: String,
    /// The final stage name.
    pub final_stage: String,
}

/// Ensure the Dockerfile's final build stage carries a name.
///
/// A pre-existing name on the final stage is preserved and returned
/// unchanged; an unnamed final stage gets `AS <default_name>` appended to
/// its `FROM` line only. Idempotent: normalizing already-normalized
/// content returns identical content and name.
pub fn ensure_final_stage_name(raw: &str, default_name: &str) -> KilnResult<NormalizedDockerfile> {
    let (line_index, existing) = final_from_line(raw)?;

    if let Some(name) = existing {
        return Ok(NormalizedDockerfile {
            raw: raw.to_string(),
            content: raw.to_string(),
            final_stage: name,
        });
    }

    let content = rewrite_line(raw, line_index, |body| format!("{body} AS {default_name}"));
    Ok(NormalizedDockerfile {
        raw: raw.to_string(),
        content,
        final_stage: default_name.to_string(),
    })
}

/// Rewrite the final stage to carry `name`, replacing any existing name.
///
/// Used to canonicalize content for hashing, so that a purely cosmetic
/// rename of the final stage never changes build identity.
pub fn rename_final_stage(content: &str, name: &str) -> KilnResult<String> {
    let (line_index, _) = final_from_line(content)?;

    Ok(rewrite_line(content, line_index, |body| {
        let mut tokens: Vec<&str> = body.split_whitespace().collect();
        if let Some(pos) = tokens.iter().position(|t| t.eq_ignore_ascii_case("AS")) {
            tokens.truncate(pos);
        }
        tokens.push("AS");
        tokens.push(name);
        tokens.join(" ")
    }))
}

/// Locate the last `FROM` instruction, returning the index of its last
/// physical line (where any rewrite must land) and the stage name from
/// its `AS` clause when present. `\` continuations are joined first, so
/// an `AS` clause split onto a continuation line is still recognized.
fn final_from_line(content: &str) -> KilnResult<(usize, Option<String>)> {
    let lines: Vec<&str> = content.lines().collect();
    let mut result = None;
    let mut index = 0;

    while index < lines.len() {
        let trimmed = lines[index].trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            index += 1;
            continue;
        }

        let start = index;
        let mut tokens: Vec<String> = Vec::new();
        let last = loop {
            let line = lines[index].trim();
            let (body, continued) = match line.strip_suffix('\\') {
                Some(body) => (body, true),
                None => (line, false),
            };
            tokens.extend(body.split_whitespace().map(str::to_string));
            if continued && index + 1 < lines.len() {
                index += 1;
            } else {
                break index;
            }
        };
        index += 1;

        if tokens
            .first()
            .is_some_and(|t| t.eq_ignore_ascii_case("FROM"))
        {
            // Skip flags like --platform=..., then the base image.
            let mut rest = tokens.iter().skip(1).skip_while(|t| t.starts_with("--"));
            if rest.next().is_none() {
                return Err(KilnError::Parse {
                    message: format!("FROM instruction on line {} has no image", start + 1),
                });
            }
            let name = match rest.next() {
                Some(keyword) if keyword.eq_ignore_ascii_case("AS") => rest.next().cloned(),
                _ => None,
            };
            result = Some((last, name));
        }
    }

    result.ok_or_else(|| KilnError::Parse {
        message: "Dockerfile has no build stages".to_string(),
    })
}

fn rewrite_line(content: &str, line_index: usize, rewrite: impl Fn(&str) -> String) -> String {
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    if let Some(line) = lines.get_mut(line_index) {
        // Keep any carriage return where it was.
        let (body, ending) = match line.strip_suffix('\r') {
            Some(body) => (body, "\r"),
            None => (line.as_str(), ""),
        };
        *line = format!("{}{}", rewrite(body.trim_end()), ending);
    }

    let mut out = lines.join("\n");
    if content.ends_with('\n') {
        out.push('\n');
    }
    out
}
