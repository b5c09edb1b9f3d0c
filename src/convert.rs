//! Format Converter - One-Way Projections
//!
//! Projects a document's labelled nodes into other graph notations. The
//! projection is lossy: edges are not rendered and nothing converts back.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document::{CellKind, DiagramDocument};
use crate::introspect::{classify_style, ElementKind};
use crate::markup::MarkupError;

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("Unsupported target notation: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Markup(#[from] MarkupError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Notation {
    Native,
    Mermaid,
    PlantUml,
}

impl FromStr for Notation {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" | "drawio" | "xml" => Ok(Notation::Native),
            "mermaid" => Ok(Notation::Mermaid),
            "plantuml" => Ok(Notation::PlantUml),
            _ => Err(ConversionError::Unsupported(s.to_string())),
        }
    }
}

impl fmt::Display for Notation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Notation::Native => "native",
            Notation::Mermaid => "mermaid",
            Notation::PlantUml => "plantuml",
        })
    }
}

/// Projected diagram text, tagged with its notation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "notation", content = "text", rename_all = "lowercase")]
pub enum Projection {
    Native(String),
    Mermaid(String),
    PlantUml(String),
}

impl Projection {
    pub fn notation(&self) -> Notation {
        match self {
            Projection::Native(_) => Notation::Native,
            Projection::Mermaid(_) => Notation::Mermaid,
            Projection::PlantUml(_) => Notation::PlantUml,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Projection::Native(text) | Projection::Mermaid(text) | Projection::PlantUml(text) => {
                text
            }
        }
    }

    pub fn into_text(self) -> String {
        match self {
            Projection::Native(text) | Projection::Mermaid(text) | Projection::PlantUml(text) => {
                text
            }
        }
    }
}

struct Node<'a> {
    id: &'a str,
    label: &'a str,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FormatConverter;

impl FormatConverter {
    pub fn new() -> Self {
        Self
    }

    pub fn project(
        &self,
        document: &DiagramDocument,
        target: Notation,
    ) -> Result<Projection, ConversionError> {
        Ok(match target {
            Notation::Native => Projection::Native(document.to_xml()?),
            Notation::Mermaid => Projection::Mermaid(mermaid(&nodes(document))),
            Notation::PlantUml => Projection::PlantUml(plantuml(&nodes(document))),
        })
    }
}

/// Labelled, non-edge, non-arrow cells in document order.
fn nodes(document: &DiagramDocument) -> Vec<Node<'_>> {
    document
        .cells()
        .filter(|c| c.kind != CellKind::Edge && !c.label.is_empty())
        .filter(|c| classify_style(&c.style) != ElementKind::Arrow)
        .map(|c| Node {
            id: &c.id,
            label: &c.label,
        })
        .collect()
}

/// Keeps identifiers inside an alphabet and unique within one projection.
struct IdAllocator {
    allow: fn(char) -> bool,
    used: HashSet<String>,
}

impl IdAllocator {
    fn new(allow: fn(char) -> bool) -> Self {
        Self {
            allow,
            used: HashSet::new(),
        }
    }

    fn allocate(&mut self, raw: &str) -> String {
        let mut base: String = raw.chars().filter(|c| (self.allow)(*c)).collect();
        if base.is_empty() {
            base = "node".to_string();
        }

        let mut candidate = base.clone();
        let mut n = 2;
        while self.used.contains(&candidate) {
            candidate = format!("{base}{n}");
            n += 1;
        }
        self.used.insert(candidate.clone());
        candidate
    }
}

fn mermaid(nodes: &[Node<'_>]) -> String {
    let mut ids = IdAllocator::new(|c| c.is_ascii_alphanumeric());
    let mut out = String::from("graph TD\n");
    for node in nodes {
        let label = node
            .label
            .replace('"', "#quot;")
            .replace("\r\n", "<br/>")
            .replace('\n', "<br/>");
        out.push_str(&format!("    {}[\"{}\"]\n", ids.allocate(node.id), label));
    }
    out
}

fn plantuml(nodes: &[Node<'_>]) -> String {
    let mut ids = IdAllocator::new(|c| c.is_ascii_alphanumeric() || c == '_');
    let mut out = String::from("@startuml\n");
    for node in nodes {
        let label = node
            .label
            .replace('"', "'")
            .replace("\r\n", "\\n")
            .replace('\n', "\\n");
        out.push_str(&format!("class \"{}\" as {} {{\n}}\n", label, ids.allocate(node.id)));
    }
    out.push_str("@enduml\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markup::parse;

    fn document() -> DiagramDocument {
        let xml = r#"<mxfile><diagram><mxGraphModel><root>
            <mxCell id="0"/><mxCell id="1" parent="0"/>
            <mxCell id="api-1" value="API &quot;v2&quot;" style="rounded=1;" vertex="1" parent="1"/>
            <mxCell id="db_1" value="DB" vertex="1" parent="1"/>
            <mxCell id="e1" value="calls" edge="1" parent="1" source="api-1" target="db_1"/>
            <mxCell id="arr" value="flow" style="shape=singleArrow;" vertex="1" parent="1"/>
            <mxCell id="---" value="Cache" vertex="1" parent="1"/>
            <mxCell id="blank" vertex="1" parent="1"/>
        </root></mxGraphModel></diagram></mxfile>"#;
        DiagramDocument::from_element(parse(xml).root.as_ref().unwrap()).unwrap()
    }

    #[test]
    fn test_mermaid_projection() {
        let projection = FormatConverter::new().project(&document(), Notation::Mermaid).unwrap();
        assert_eq!(projection.notation(), Notation::Mermaid);
        assert_eq!(
            projection.text(),
            "graph TD\n    api1[\"API #quot;v2#quot;\"]\n    db1[\"DB\"]\n    node[\"Cache\"]\n"
        );
    }

    #[test]
    fn test_plantuml_projection() {
        let projection = FormatConverter::new().project(&document(), Notation::PlantUml).unwrap();
        assert_eq!(
            projection.into_text(),
            "@startuml\nclass \"API 'v2'\" as api1 {\n}\nclass \"DB\" as db_1 {\n}\nclass \"Cache\" as node {\n}\n@enduml\n"
        );
    }

    #[test]
    fn test_native_projection_reparses() {
        let projection = FormatConverter::new().project(&document(), Notation::Native).unwrap();
        let again =
            DiagramDocument::from_element(parse(projection.text()).root.as_ref().unwrap()).unwrap();
        assert_eq!(again.element_count(), document().element_count());
    }

    #[test]
    fn test_notation_names() {
        assert_eq!("drawio".parse::<Notation>().unwrap(), Notation::Native);
        assert_eq!("PlantUML".parse::<Notation>().unwrap(), Notation::PlantUml);
        assert!(matches!(
            "graphviz".parse::<Notation>(),
            Err(ConversionError::Unsupported(n)) if n == "graphviz"
        ));
    }

    #[test]
    fn test_colliding_ids_get_suffixes() {
        let mut ids = IdAllocator::new(|c| c.is_ascii_alphanumeric());
        assert_eq!(ids.allocate("a-b"), "ab");
        assert_eq!(ids.allocate("a_b"), "ab2");
        assert_eq!(ids.allocate("!!"), "node");
        assert_eq!(ids.allocate(""), "node2");
    }
}
