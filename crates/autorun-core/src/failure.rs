use once_cell::sync::Lazy;
use regex::Regex;

use autorun_types::ActionKind;

const MAX_SIGNATURE_CHARS: usize = 160;

static DATE_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}(?:[T ]\d{2}:\d{2}(?::\d{2}(?:\.\d+)?)?(?:Z|[+-]\d{2}:?\d{2})?)?").ok()
});
static UUID_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b").ok()
});
static PATH_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r#"(?:[A-Za-z]:)?(?:\.{0,2}[\\/])?(?:[\w.\-]+[\\/])+[\w.\-]*"#).ok()
});
static NUMBER_RE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\d+").ok());
static SPACE_RE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\s+").ok());

fn replace(re: &Lazy<Option<Regex>>, input: &str, with: &str) -> String {
    match re.as_ref() {
        Some(re) => re.replace_all(input, with).into_owned(),
        None => input.to_string(),
    }
}

/// Fingerprint of a failure with volatile details (dates, ids, paths,
/// numbers) redacted so repeats of the same problem collide.
pub fn failure_signature(kind: Option<ActionKind>, error: &str) -> String {
    let mut text = error.to_lowercase();
    text = replace(&DATE_RE, &text, "<date>");
    text = replace(&UUID_RE, &text, "<id>");
    text = replace(&PATH_RE, &text, "<path>");
    text = replace(&NUMBER_RE, &text, "<n>");
    text = replace(&SPACE_RE, &text, " ");
    let text: String = text.trim().chars().take(MAX_SIGNATURE_CHARS).collect();
    format!("{}|{}", kind.map(|k| k.as_str()).unwrap_or("none"), text)
}
