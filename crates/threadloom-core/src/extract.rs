//! Entity and markup extraction over message text.
//!
//! Pure, total functions: malformed or partial markup is left as text and
//! never produces an error.

use std::collections::{BTreeSet, HashSet};
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::models::{CodeBlock, CodeBlockKind};

static FENCED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(.*?)```|~~~(.*?)~~~").unwrap());
static INLINE_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`([^`\n]{1,200})`").unwrap());
static HTML_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<code[^>]*>(.*?)</code>").unwrap());
static FENCE_LANG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z0-9_+#.-]{1,32})[ \t]*\n").unwrap());
static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<?(https?://[^\s<>|]+)>?").unwrap());
static MENTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^a-zA-Z0-9._\-/])@([a-zA-Z0-9][a-zA-Z0-9._\-]*[a-zA-Z0-9]|[a-zA-Z0-9])").unwrap()
});

static SLACK_USER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<@([A-Z0-9]+)(?:\|([^>]+))?>").unwrap());
static SLACK_CHANNEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<#([A-Z0-9]+)(?:\|([^>]*))?>").unwrap());
static SLACK_SPECIAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<!(here|channel|everyone)(?:\|[^>]*)?>").unwrap());
static SLACK_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<((?:https?://|mailto:)[^|>\s]+)(?:\|([^>]+))?>").unwrap());
static ENTITY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"&(lt|gt|amp);").unwrap());

/// Returns fenced, inline and HTML code blocks, in that order.
///
/// Inline spans are only kept when they look like code (contain punctuation
/// or whitespace), so a single backticked word is treated as emphasis.
pub fn extract_code_blocks(text: &str) -> Vec<CodeBlock> {
    let mut blocks = Vec::new();

    for caps in FENCED_RE.captures_iter(text) {
        let body = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
        let (language, code) = split_fence_language(body);
        let code = code.trim();
        if !code.is_empty() {
            blocks.push(CodeBlock {
                kind: CodeBlockKind::Fenced,
                language,
                code: code.to_string(),
            });
        }
    }

    // Inline spans inside fences were already captured above.
    let outside_fences = FENCED_RE.replace_all(text, " ");
    for caps in INLINE_CODE_RE.captures_iter(&outside_fences) {
        let code = caps[1].trim();
        if !code.is_empty() && looks_like_code(code) {
            blocks.push(CodeBlock {
                kind: CodeBlockKind::Inline,
                language: None,
                code: code.to_string(),
            });
        }
    }

    for caps in HTML_CODE_RE.captures_iter(text) {
        let code = caps[1].trim();
        if !code.is_empty() {
            blocks.push(CodeBlock {
                kind: CodeBlockKind::Html,
                language: None,
                code: code.to_string(),
            });
        }
    }

    blocks
}

fn split_fence_language(body: &str) -> (Option<String>, &str) {
    match FENCE_LANG_RE.captures(body) {
        Some(caps) => {
            let whole = caps.get(0).map_or(0, |m| m.end());
            (Some(caps[1].to_string()), &body[whole..])
        }
        None => (None, body),
    }
}

fn looks_like_code(s: &str) -> bool {
    s.chars()
        .any(|c| c.is_whitespace() || "(){}[]<>.:;=+-*/%&|!_$#@".contains(c))
}

/// Returns every http(s) URL in first-seen order, without duplicates.
///
/// Accepts both angle-bracket-delimited and bare URLs. Trailing sentence
/// punctuation and unbalanced closing brackets are not part of the URL.
pub fn extract_urls(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut urls = Vec::new();
    for caps in URL_RE.captures_iter(text) {
        let url = trim_url(&caps[1]);
        if url.len() <= "https://".len() {
            continue;
        }
        if seen.insert(url.to_string()) {
            urls.push(url.to_string());
        }
    }
    urls
}

fn trim_url(mut url: &str) -> &str {
    loop {
        let Some(last) = url.chars().last() else {
            return url;
        };
        let trim = match last {
            '.' | ',' | ';' | ':' | '!' | '?' | '\'' | '"' | '*' | '`' => true,
            ')' => url.matches('(').count() < url.matches(')').count(),
            ']' => url.matches('[').count() < url.matches(']').count(),
            _ => false,
        };
        if !trim {
            return url;
        }
        url = &url[..url.len() - last.len_utf8()];
    }
}

/// Returns the set of `@handle` mentions, without the `@`.
///
/// An `@` preceded by an alphanumeric character is treated as part of an
/// email address or path and ignored.
pub fn extract_mentions(text: &str) -> BTreeSet<String> {
    let mut mentions = BTreeSet::new();
    // Matches consume the boundary character, so scan again from each
    // handle's end to catch back-to-back mentions like "@a @b".
    let mut start = 0;
    while let Some(caps) = MENTION_RE.captures_at(text, start) {
        let handle = caps.get(1).map_or("", |m| m.as_str());
        mentions.insert(handle.to_string());
        start = caps.get(1).map_or(text.len(), |m| m.end());
    }
    mentions
}

/// Rewrites chat-style markup into plain text.
///
/// * `<@U123|label>` becomes `@label`, `<@U123>` becomes `@U123`
/// * `<#C123|label>` becomes `#label`, `<#C123>` becomes `#C123`
/// * `<!here>` becomes `@here`
/// * `<https://x|label>` becomes `label (https://x)`, `<https://x>` becomes `https://x`
/// * `&lt;`, `&gt;` and `&amp;` are decoded
///
/// Decoding can expose new markup (`&lt;@U1&gt;`), so the rules run until
/// the text stops changing. The result is a fixed point: re-applying
/// `normalize_markup` to it is a no-op. Every rewrite either shortens the
/// text or removes a `<`, so the loop terminates.
pub fn normalize_markup(text: &str) -> String {
    let mut current = markup_pass(text);
    loop {
        let next = markup_pass(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn markup_pass(text: &str) -> String {
    let s = SLACK_USER_RE.replace_all(text, |c: &Captures| match c.get(2) {
        Some(label) => format!("@{}", label.as_str()),
        None => format!("@{}", &c[1]),
    });
    let s = SLACK_CHANNEL_RE.replace_all(&s, |c: &Captures| match c.get(2) {
        Some(label) if !label.as_str().is_empty() => format!("#{}", label.as_str()),
        _ => format!("#{}", &c[1]),
    });
    let s = SLACK_SPECIAL_RE.replace_all(&s, "@$1");
    let s = SLACK_LINK_RE.replace_all(&s, |c: &Captures| {
        let target = c[1].strip_prefix("mailto:").unwrap_or(&c[1]);
        match c.get(2) {
            Some(label) if label.as_str() == target => target.to_string(),
            Some(label) => format!("{} ({})", label.as_str(), target),
            None => target.to_string(),
        }
    });
    decode_entities(&s)
}

/// Light cleanup for markdown bodies: line endings and HTML entities.
///
/// Markdown itself is kept, since code spans and fences carry meaning.
pub fn normalize_markdown(text: &str) -> String {
    decode_entities(&text.replace("\r\n", "\n")).trim().to_string()
}

fn decode_entities(text: &str) -> String {
    ENTITY_RE
        .replace_all(text, |c: &Captures| match &c[1] {
            "lt" => "<",
            "gt" => ">",
            _ => "&",
        })
        .into_owned()
}
