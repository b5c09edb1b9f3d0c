//! Markup Layer - Tolerant Tree Reader and Writer
//!
//! The reader never fails: it returns the best-effort element tree it could
//! build together with every well-formedness issue it saw, each tagged with a
//! byte offset into the input. Repair works on that tree instead of on raw
//! text.

use std::fmt;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MarkupError {
    #[error("Failed to serialize markup: {0}")]
    Serialize(String),

    #[error("Serialized markup is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// One element of a parsed document. Attribute values are stored unescaped.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Element>,
    pub text: String,
    /// Byte offset of the opening tag in the source text.
    pub offset: usize,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((key, value)),
        }
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MarkupIssue {
    pub offset: usize,
    pub message: String,
}

impl fmt::Display for MarkupIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (at byte {})", self.message, self.offset)
    }
}

/// Best-effort parse result.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedMarkup {
    pub root: Option<Element>,
    pub issues: Vec<MarkupIssue>,
}

impl ParsedMarkup {
    pub fn is_well_formed(&self) -> bool {
        self.root.is_some() && self.issues.is_empty()
    }

    /// All issues joined into one line, for error details.
    pub fn summary(&self) -> String {
        if self.root.is_none() && self.issues.is_empty() {
            return "no root element".to_string();
        }
        self.issues
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Characters XML 1.0 does not allow anywhere in a document.
pub fn is_forbidden_char(c: char) -> bool {
    matches!(
        c,
        '\u{0}'..='\u{8}' | '\u{b}' | '\u{c}' | '\u{e}'..='\u{1f}' | '\u{fffe}' | '\u{ffff}'
    )
}

pub fn parse(text: &str) -> ParsedMarkup {
    let mut builder = TreeBuilder::default();

    if let Some((offset, c)) = text.char_indices().find(|(_, c)| is_forbidden_char(*c)) {
        builder.issue(offset, format!("forbidden character U+{:04X}", c as u32));
    }

    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text_start = true;
    reader.config_mut().trim_text_end = true;
    // Mismatched end tags are resolved by the builder so the tree survives them.
    reader.config_mut().check_end_names = false;

    loop {
        let offset = reader.buffer_position() as usize;
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let element = builder.open(&e, offset);
                builder.stack.push(element);
            }
            Ok(Event::Empty(e)) => {
                let element = builder.open(&e, offset);
                builder.attach(element);
            }
            Ok(Event::End(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                builder.close(&name, offset);
            }
            Ok(Event::Text(e)) => match e.unescape() {
                Ok(content) => builder.text(&content, offset),
                Err(err) => builder.issue(offset, format!("invalid text content: {err}")),
            },
            Ok(Event::CData(e)) => {
                let content = String::from_utf8_lossy(&e).into_owned();
                builder.text(&content, offset);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => {
                builder.issue(reader.buffer_position() as usize, err.to_string());
                break;
            }
        }
    }

    builder.finish()
}

#[derive(Default)]
struct TreeBuilder {
    stack: Vec<Element>,
    root: Option<Element>,
    issues: Vec<MarkupIssue>,
}

impl TreeBuilder {
    fn issue(&mut self, offset: usize, message: String) {
        self.issues.push(MarkupIssue { offset, message });
    }

    fn open(&mut self, start: &BytesStart<'_>, offset: usize) -> Element {
        let mut element = Element::new(String::from_utf8_lossy(start.name().as_ref()));
        element.offset = offset;

        for attr in start.attributes() {
            let attr = match attr {
                Ok(attr) => attr,
                Err(err) => {
                    self.issue(offset, format!("malformed attribute in <{}>: {err}", element.name));
                    break;
                }
            };
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            if attr.value.contains(&b'<') {
                self.issue(offset, format!("raw '<' in attribute '{key}' of <{}>", element.name));
            }
            let value = match attr.unescape_value() {
                Ok(value) => value.into_owned(),
                Err(err) => {
                    let name = &element.name;
                    self.issue(offset, format!("bad escape in attribute '{key}' of <{name}>: {err}"));
                    String::from_utf8_lossy(&attr.value).into_owned()
                }
            };
            element.attributes.push((key, value));
        }

        element
    }

    fn attach(&mut self, element: Element) {
        if let Some(parent) = self.stack.last_mut() {
            parent.children.push(element);
        } else if self.root.is_none() {
            self.root = Some(element);
        } else {
            let offset = element.offset;
            self.issue(offset, format!("extra root element <{}>", element.name));
        }
    }

    fn close(&mut self, name: &str, offset: usize) {
        let Some(pos) = self.stack.iter().rposition(|e| e.name == name) else {
            self.issue(offset, format!("unexpected closing tag </{name}>"));
            return;
        };
        while self.stack.len() > pos + 1 {
            if let Some(unclosed) = self.stack.pop() {
                self.issue(unclosed.offset, format!("element <{}> is never closed", unclosed.name));
                self.attach(unclosed);
            }
        }
        if let Some(element) = self.stack.pop() {
            self.attach(element);
        }
    }

    fn text(&mut self, content: &str, offset: usize) {
        match self.stack.last_mut() {
            Some(parent) => parent.text.push_str(content),
            None if content.trim().is_empty() => {}
            None => self.issue(offset, "text outside the root element".to_string()),
        }
    }

    fn finish(mut self) -> ParsedMarkup {
        while let Some(unclosed) = self.stack.pop() {
            self.issue(unclosed.offset, format!("element <{}> is never closed", unclosed.name));
            self.attach(unclosed);
        }
        ParsedMarkup {
            root: self.root,
            issues: self.issues,
        }
    }
}

/// Serialize `root` with an XML declaration and two-space indentation.
pub fn write_document(root: &Element) -> Result<String, MarkupError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(|e| MarkupError::Serialize(e.to_string()))?;
    write_element(&mut writer, root)?;
    Ok(String::from_utf8(writer.into_inner())?)
}

fn write_element(writer: &mut Writer<Vec<u8>>, element: &Element) -> Result<(), MarkupError> {
    let mut start = BytesStart::new(element.name.as_str());
    for (key, value) in &element.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }

    if element.children.is_empty() && element.text.is_empty() {
        return writer
            .write_event(Event::Empty(start))
            .map_err(|e| MarkupError::Serialize(e.to_string()));
    }

    writer
        .write_event(Event::Start(start))
        .map_err(|e| MarkupError::Serialize(e.to_string()))?;
    if !element.text.is_empty() {
        writer
            .write_event(Event::Text(BytesText::new(&element.text)))
            .map_err(|e| MarkupError::Serialize(e.to_string()))?;
    }
    for child in &element.children {
        write_element(writer, child)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new(element.name.as_str())))
        .map_err(|e| MarkupError::Serialize(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_formed_tree() {
        let parsed = parse(r#"<a x="1"><b/><c y="&amp;"></c></a>"#);
        assert!(parsed.is_well_formed());
        let root = parsed.root.unwrap();
        assert_eq!(root.name, "a");
        assert_eq!(root.attr("x"), Some("1"));
        assert_eq!(root.children.len(), 2);
        assert_eq!(root.child("c").unwrap().attr("y"), Some("&"));
    }

    #[test]
    fn test_bare_ampersand_is_reported() {
        let parsed = parse(r#"<a label="R&D"/>"#);
        assert!(!parsed.is_well_formed());
        assert!(parsed.root.is_some());
    }

    #[test]
    fn test_unclosed_elements_keep_partial_tree() {
        let parsed = parse(r#"<a><b id="1"><c id="2"/></a>"#);
        assert!(!parsed.is_well_formed());
        let root = parsed.root.unwrap();
        assert!(root.child("b").and_then(|b| b.child("c")).is_some());
        assert!(parsed.issues.iter().any(|i| i.message.contains("<b>")));
    }

    #[test]
    fn test_truncated_input_reports_issue() {
        let parsed = parse(r#"<a><b id="1""#);
        assert!(!parsed.is_well_formed());
        assert_eq!(parsed.root.map(|r| r.name), Some("a".to_string()));
    }

    #[test]
    fn test_raw_lt_in_attribute_is_reported() {
        let parsed = parse(r#"<a v="x<y"/>"#);
        assert!(!parsed.is_well_formed());
    }

    #[test]
    fn test_written_document_reparses() {
        let tree = Element::new("a")
            .with_attr("q", "say \"hi\" & 'bye'")
            .with_child(Element::new("b").with_attr("n", "<1>"));
        let text = write_document(&tree).unwrap();
        assert!(text.starts_with("<?xml"));
        let parsed = parse(&text);
        assert!(parsed.is_well_formed());
        let root = parsed.root.unwrap();
        assert_eq!(root.attr("q"), Some("say \"hi\" & 'bye'"));
        assert_eq!(root.child("b").unwrap().attr("n"), Some("<1>"));
    }
}
