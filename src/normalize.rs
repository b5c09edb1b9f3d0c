//! Textual Normalization - Repair Tier A
//!
//! Rewrites raw markup text so that the common defects of generated
//! documents (bare ampersands and quotes inside attribute values, leaf tags
//! left open, a missing declaration) stop breaking the parser. Every step
//! is a fixed point on its own output, so normalizing twice equals
//! normalizing once.

use crate::markup::is_forbidden_char;

pub const DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

/// Elements that never need content in a diagram document.
pub const LEAF_TAGS: [&str; 3] = ["mxCell", "mxGeometry", "mxPoint"];

const MAX_ENTITY_LEN: usize = 10;

pub fn normalize(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .filter(|c| *c != '\u{feff}' && !is_forbidden_char(*c))
        .collect();
    let trimmed = cleaned.trim();

    let escaped = escape_attribute_values(trimmed);
    let closed = close_leaf_tags(&escaped);

    if closed.starts_with("<?xml") {
        closed
    } else if closed.is_empty() {
        DECLARATION.to_string()
    } else {
        format!("{DECLARATION}\n{closed}")
    }
}

fn is_name_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == ':'
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | ':' | '-' | '.')
}

/// Length of a comment, CDATA section, processing instruction, doctype or
/// closing tag at the start of `rest`. These are copied through untouched.
fn passthrough_len(rest: &str) -> Option<usize> {
    let until = |terminator: &str, from: usize| {
        rest[from..]
            .find(terminator)
            .map_or(rest.len(), |i| from + i + terminator.len())
    };

    if rest.starts_with("<!--") {
        Some(until("-->", 4))
    } else if rest.starts_with("<![CDATA[") {
        Some(until("]]>", 9))
    } else if rest.starts_with("<?") {
        Some(until("?>", 2))
    } else if rest.starts_with("<!") || rest.starts_with("</") {
        Some(until(">", 2))
    } else {
        None
    }
}

fn opens_element(rest: &str) -> bool {
    rest[1..].chars().next().is_some_and(is_name_start)
}

/// True when a quote followed by `after` plausibly ends an attribute value:
/// the tag ends, the input ends, or another `name=` pair follows.
fn closes_attribute_value(after: &str) -> bool {
    let trimmed = after.trim_start();
    if trimmed.is_empty()
        || trimmed.starts_with('>')
        || trimmed.starts_with("/>")
        || trimmed.starts_with("?>")
    {
        return true;
    }
    if trimmed.len() == after.len() || !trimmed.starts_with(is_name_start) {
        return false;
    }
    let name_len = trimmed.find(|c: char| !is_name_char(c)).unwrap_or(trimmed.len());
    trimmed[name_len..].trim_start().starts_with('=')
}

/// True when `s` (starting at `&`) begins with a predefined or numeric
/// entity reference.
fn starts_with_entity(s: &str) -> bool {
    let Some(semi) = s.bytes().take(MAX_ENTITY_LEN).position(|b| b == b';') else {
        return false;
    };
    let name = &s[1..semi];
    match name {
        "amp" | "lt" | "gt" | "quot" | "apos" => true,
        _ => {
            if let Some(hex) = name.strip_prefix("#x") {
                !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit())
            } else if let Some(dec) = name.strip_prefix('#') {
                !dec.is_empty() && dec.chars().all(|c| c.is_ascii_digit())
            } else {
                false
            }
        }
    }
}

fn escape_value_into(value: &str, out: &mut String) {
    for (i, c) in value.char_indices() {
        match c {
            '&' if starts_with_entity(&value[i..]) => out.push('&'),
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
}

/// Escape `& < > " '` inside attribute values only. Text content, comments
/// and other constructs are left alone.
pub fn escape_attribute_values(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(lt) = rest.find('<') {
        out.push_str(&rest[..lt]);
        rest = &rest[lt..];

        if let Some(len) = passthrough_len(rest) {
            out.push_str(&rest[..len]);
            rest = &rest[len..];
        } else if opens_element(rest) {
            let consumed = escape_tag(rest, &mut out);
            rest = &rest[consumed..];
        } else {
            out.push('<');
            rest = &rest[1..];
        }
    }

    out.push_str(rest);
    out
}

/// Copy one start tag from `tag` into `out`, escaping its attribute values.
/// Returns the number of bytes consumed.
fn escape_tag(tag: &str, out: &mut String) -> usize {
    let mut pos = 1;
    out.push('<');

    while pos < tag.len() {
        let Some(c) = tag[pos..].chars().next() else {
            break;
        };
        match c {
            '>' => {
                out.push('>');
                return pos + 1;
            }
            // Unterminated tag: leave the next tag for the caller.
            '<' => return pos,
            '"' | '\'' => {
                out.push(c);
                let value_start = pos + 1;
                let Some(close) = find_closing_quote(&tag[value_start..], c) else {
                    out.push_str(&tag[value_start..]);
                    return tag.len();
                };
                escape_value_into(&tag[value_start..value_start + close], out);
                out.push(c);
                pos = value_start + close + 1;
            }
            _ => {
                out.push(c);
                pos += c.len_utf8();
            }
        }
    }

    tag.len()
}

/// Offset of the quote that ends the value starting at `value`: the first
/// quote followed by a plausible tag continuation, else the first quote.
fn find_closing_quote(value: &str, quote: char) -> Option<usize> {
    let mut first = None;
    for (i, c) in value.char_indices() {
        if c != quote {
            continue;
        }
        if closes_attribute_value(&value[i + 1..]) {
            return Some(i);
        }
        first.get_or_insert(i);
    }
    first
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagKind {
    Open,
    Close,
    SelfClosing,
}

#[derive(Debug)]
struct TagToken<'a> {
    name: &'a str,
    kind: TagKind,
    /// Byte offset of the closing `>`, if the tag is terminated.
    end: Option<usize>,
}

/// Quote-aware scan of element tags, skipping comments, CDATA and
/// processing instructions.
fn scan_tags(text: &str) -> Vec<TagToken<'_>> {
    let mut tokens = Vec::new();
    let mut pos = 0;

    while let Some(lt) = text[pos..].find('<') {
        let start = pos + lt;
        let rest = &text[start..];

        if rest.starts_with("</") {
            let name_end = rest[2..]
                .find(|c: char| !is_name_char(c))
                .map_or(rest.len(), |i| i + 2);
            let end = rest.find('>').map(|i| start + i);
            tokens.push(TagToken {
                name: &rest[2..name_end],
                kind: TagKind::Close,
                end,
            });
            pos = end.map_or(text.len(), |e| e + 1);
            continue;
        }
        if let Some(len) = passthrough_len(rest) {
            pos = start + len;
            continue;
        }
        if !opens_element(rest) {
            pos = start + 1;
            continue;
        }

        let name_end = rest[1..]
            .find(|c: char| !is_name_char(c))
            .map_or(rest.len(), |i| i + 1);
        let name = &rest[1..name_end];

        let mut quote = None;
        let mut end = None;
        let mut resume = text.len();
        for (i, c) in rest[name_end..].char_indices() {
            let at = start + name_end + i;
            match (quote, c) {
                (Some(q), c) if c == q => quote = None,
                (Some(_), _) => {}
                (None, '"' | '\'') => quote = Some(c),
                (None, '>') => {
                    end = Some(at);
                    resume = at + 1;
                    break;
                }
                (None, '<') => {
                    resume = at;
                    break;
                }
                _ => {}
            }
        }

        let kind = match end {
            Some(e) if text[..e].ends_with('/') => TagKind::SelfClosing,
            _ => TagKind::Open,
        };
        tokens.push(TagToken { name, kind, end });
        pos = resume;
    }

    tokens
}

fn mark_unmatched(token: &TagToken<'_>, unmatched: &mut Vec<usize>) {
    if LEAF_TAGS.contains(&token.name) {
        if let Some(end) = token.end {
            unmatched.push(end);
        }
    }
}

/// Turn every leaf open tag that has no matching close tag into a
/// self-closing tag.
pub fn close_leaf_tags(text: &str) -> String {
    let tokens = scan_tags(text);
    let mut stack: Vec<&TagToken<'_>> = Vec::new();
    let mut unmatched: Vec<usize> = Vec::new();

    for token in &tokens {
        match token.kind {
            TagKind::Open => stack.push(token),
            TagKind::SelfClosing => {}
            TagKind::Close => {
                let Some(pos) = stack.iter().rposition(|t| t.name == token.name) else {
                    continue;
                };
                for open in stack.drain(pos + 1..) {
                    mark_unmatched(open, &mut unmatched);
                }
                stack.pop();
            }
        }
    }
    for open in stack.drain(..) {
        mark_unmatched(open, &mut unmatched);
    }

    if unmatched.is_empty() {
        return text.to_string();
    }

    unmatched.sort_unstable();
    let mut out = String::with_capacity(text.len() + unmatched.len());
    let mut copied = 0;
    for end in unmatched {
        out.push_str(&text[copied..end]);
        out.push('/');
        copied = end;
    }
    out.push_str(&text[copied..]);
    out
}
