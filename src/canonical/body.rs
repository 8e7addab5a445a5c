//! Body canonicalization.
//!
//! The canonical body exists only for identity and comparison. It is
//! derived from, and never replaces, the raw body.

use crate::canonical::header::decode_header_bytes;
use crate::canonical::patterns::PatternSet;
use crate::model::raw::RawBody;

/// Alphanumeric characters that must precede a footer marker for the
/// body to be cut there. Short messages keep their footer.
pub const MIN_ALNUM_BEFORE_FOOTER: usize = 50;

/// Canonical body text plus the rules that shaped it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CanonicalBody {
    pub text: String,
    /// Names of the banner/footer rules that fired, in the order they fired.
    pub stripped_rules: Vec<String>,
}

/// Decode a raw body to text (UTF-8, else Windows-1252).
pub fn decode_body(body: &RawBody) -> String {
    match body {
        RawBody::Text(text) => text.clone(),
        RawBody::Bytes(bytes) => decode_header_bytes(bytes),
    }
}

/// Produce the canonical body.
///
/// Steps, in order: line endings to LF, invisible characters dropped,
/// HTML flattened, banner lines dropped, footer cut, separator lines
/// dropped, horizontal whitespace collapsed, blank runs collapsed,
/// case-folded.
pub fn canonicalize_body(text: &str, patterns: &PatternSet) -> CanonicalBody {
    let mut stripped_rules = Vec::new();

    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let text: String = text.chars().filter(|c| !is_invisible(*c)).collect();
    let text = if looks_like_html(&text) {
        html_to_text(&text)
    } else {
        text
    };

    let mut lines: Vec<&str> = Vec::new();
    for line in text.lines() {
        if let Some(rule) = patterns.banner_match(line) {
            push_unique(&mut stripped_rules, rule);
            continue;
        }
        lines.push(line);
    }

    if let Some((cut, rule)) = lines
        .iter()
        .enumerate()
        .find_map(|(i, line)| patterns.footer_match(line).map(|rule| (i, rule)))
    {
        let before: usize = lines[..cut]
            .iter()
            .map(|l| l.chars().filter(|c| c.is_alphanumeric()).count())
            .sum();
        if before >= MIN_ALNUM_BEFORE_FOOTER {
            push_unique(&mut stripped_rules, rule);
            lines.truncate(cut);
        }
    }

    let mut out = String::with_capacity(text.len());
    let mut prev_blank = true;
    for line in lines {
        let collapsed = collapse_whitespace(line);
        if is_separator(&collapsed) {
            continue;
        }
        if collapsed.is_empty() {
            if !prev_blank {
                out.push('\n');
                prev_blank = true;
            }
            continue;
        }
        out.push_str(&collapsed.to_lowercase());
        out.push('\n');
        prev_blank = false;
    }

    CanonicalBody {
        text: out.trim().to_string(),
        stripped_rules,
    }
}

fn push_unique(rules: &mut Vec<String>, rule: &str) {
    if !rules.iter().any(|r| r == rule) {
        rules.push(rule.to_string());
    }
}

/// NUL, zero-width characters, soft hyphens, BOMs and other controls
/// (tab and newline excepted).
fn is_invisible(c: char) -> bool {
    matches!(c, '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{FEFF}' | '\u{00AD}')
        || (c.is_control() && c != '\n' && c != '\t')
}

fn collapse_whitespace(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `----` or `____` on a line of its own.
fn is_separator(line: &str) -> bool {
    line.len() >= 2 && line.chars().all(|c| c == '-' || c == '_')
}

fn looks_like_html(text: &str) -> bool {
    let head: String = text.chars().take(2048).collect::<String>().to_ascii_lowercase();
    ["<html", "<body", "<div", "<p>", "<br", "<table"]
        .iter()
        .any(|tag| head.contains(tag))
}

/// Flatten HTML to text: drop script/style blocks, turn block elements
/// into line breaks, strip tags, decode the common entities.
pub fn html_to_text(html: &str) -> String {
    let mut text = remove_tag_block(html, "script");
    text = remove_tag_block(&text, "style");

    for tag in ["br", "br/", "br /"] {
        text = replace_ci(&text, &format!("<{tag}>"), "\n");
    }
    for tag in ["p", "div", "tr", "li", "h1", "h2", "h3", "h4", "h5", "h6"] {
        text = replace_ci(&text, &format!("<{tag}>"), "\n");
        text = replace_ci(&text, &format!("<{tag} "), "\n<");
        text = replace_ci(&text, &format!("</{tag}>"), "\n");
    }

    let mut result = String::with_capacity(text.len());
    let mut in_tag = false;
    for ch in text.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }

    result
        .replace("&nbsp;", " ")
        .replace("&#160;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// ASCII case-insensitive replace.
fn replace_ci(haystack: &str, needle: &str, with: &str) -> String {
    let lower = haystack.to_ascii_lowercase();
    let needle = needle.to_ascii_lowercase();
    let mut out = String::with_capacity(haystack.len());
    let mut last = 0;
    for (pos, _) in lower.match_indices(&needle) {
        out.push_str(&haystack[last..pos]);
        out.push_str(with);
        last = pos + needle.len();
    }
    out.push_str(&haystack[last..]);
    out
}

/// Remove an entire tag block (e.g. `<script>…</script>`).
fn remove_tag_block(html: &str, tag: &str) -> String {
    let lower = html.to_ascii_lowercase();
    let open = format!("<{tag}");
    let close = format!("</{tag}>");
    let mut result = String::with_capacity(html.len());
    let mut pos = 0;

    while let Some(rel) = lower[pos..].find(&open) {
        let start = pos + rel;
        result.push_str(&html[pos..start]);
        match lower[start..].find(&close) {
            Some(end) => pos = start + end + close.len(),
            None => return result,
        }
    }
    result.push_str(&html[pos..]);
    result
}
