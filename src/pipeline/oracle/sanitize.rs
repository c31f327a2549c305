// Text hygiene on both sides of the oracle call.
// Inbound: strip invisible Unicode and prompt-injection lines from clinical text.
// Outbound: strip model artifacts (thinking blocks, stray tokens) before parsing.

use std::sync::LazyLock;

use regex::Regex;

/// Clinical text beyond this many bytes is cut before it reaches the oracle.
pub const MAX_INPUT_LENGTH: usize = 50_000;

/// Sanitize clinical text for LLM consumption. Logs how many lines were
/// removed as injection attempts, never their content.
pub fn sanitize_for_llm(raw: &str, source_ref: &str) -> String {
    let cleaned = strip_invisible(raw);
    let (no_injection, removed) = drop_injection_lines(&cleaned);

    if removed > 0 {
        tracing::warn!(
            source_ref = %source_ref,
            removed_lines = removed,
            "Injection patterns detected and removed from clinical text"
        );
    }

    truncate_at_word(&tidy_lines(&no_injection), MAX_INPUT_LENGTH)
}

/// Remove zero-width/bidi formatting characters and C0 controls, keeping
/// ordinary whitespace.
fn strip_invisible(text: &str) -> String {
    text.chars()
        .filter(|c| {
            if matches!(*c, ' ' | '\n' | '\t' | '\r') {
                return true;
            }
            if matches!(
                *c,
                '\u{200B}'..='\u{200F}'
                    | '\u{202A}'..='\u{202E}'
                    | '\u{2060}'..='\u{2064}'
                    | '\u{FEFF}'
            ) {
                return false;
            }
            !c.is_control()
        })
        .collect()
}

fn is_role_marker(trimmed: &str) -> bool {
    const MARKERS: &[&str] = &[
        "system:",
        "assistant:",
        "user:",
        "[system]",
        "[assistant]",
        "[inst]",
        "[/inst]",
        "<<sys>>",
        "note to ai:",
        "instructions:",
    ];
    MARKERS.iter().any(|m| trimmed.starts_with(m))
}

fn is_override_attempt(text: &str) -> bool {
    const PATTERNS: &[&str] = &[
        "ignore previous instructions",
        "ignore all instructions",
        "ignore the above instructions",
        "disregard your instructions",
        "disregard all instructions",
        "forget your instructions",
        "new instructions:",
        "override:",
    ];
    PATTERNS.iter().any(|p| text.contains(p))
}

fn is_instruction_tag(trimmed: &str) -> bool {
    trimmed.starts_with("<instruction")
        || trimmed.starts_with("</instruction")
        || trimmed.starts_with("<system")
        || trimmed.starts_with("</system")
        || trimmed.starts_with("</clinical_text")
}

/// Drop lines that look like prompt-injection. Returns the kept text and the
/// number of dropped lines.
fn drop_injection_lines(text: &str) -> (String, usize) {
    let mut kept = Vec::new();
    let mut removed = 0usize;
    for line in text.lines() {
        let lowered = line.trim().to_lowercase();
        if is_role_marker(&lowered)
            || is_override_attempt(&lowered)
            || is_instruction_tag(&lowered)
        {
            removed += 1;
            continue;
        }
        kept.push(line);
    }
    (kept.join("\n"), removed)
}

/// Collapse runs of blank lines and trim every line.
fn tidy_lines(text: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() && out.last().map_or(true, |last| last.is_empty()) {
            continue;
        }
        out.push(line);
    }
    if out.last() == Some(&"") {
        out.pop();
    }
    out.join("\n")
}

/// Truncate to at most `max_len` bytes, breaking at the last word boundary.
fn truncate_at_word(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }
    let mut cut = max_len;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let slice = &text[..cut];
    match slice.rfind(char::is_whitespace) {
        Some(pos) if pos > 0 => slice[..pos].to_string(),
        _ => slice.to_string(),
    }
}

/// Remove reasoning preambles and control tokens some models emit around
/// their answer: a `<unusedN>thought` prefix, `<think>` blocks, and stray
/// `<unusedN>` tokens.
pub fn strip_model_artifacts(raw: &str) -> String {
    static THOUGHT_PREFIX: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)^.*?<unused\d+>\s*thought\n").expect("valid regex"));
    static THINK_BLOCK: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid regex"));
    static CONTROL_TOKEN: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"<unused\d+>").expect("valid regex"));

    let text = THOUGHT_PREFIX.replace(raw, "");
    let text = THINK_BLOCK.replace_all(&text, "");
    CONTROL_TOKEN.replace_all(&text, "").trim().to_string()
}
