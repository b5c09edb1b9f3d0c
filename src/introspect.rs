//! Introspector - Element Graph, Layout and Suggestions
//!
//! Reads a valid document into labelled element descriptors, a coarse
//! layout summary and a list of rule-based improvement suggestions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::IntrospectionConfig;
use crate::document::{CellKind, DiagramDocument, DEFAULT_PAGE_HEIGHT, DEFAULT_PAGE_WIDTH};

pub const SUGGEST_MORE_ELEMENTS: &str =
    "Consider adding more elements to make the diagram more informative";
pub const SUGGEST_SPLIT: &str =
    "The diagram is quite complex - consider breaking it into smaller, focused diagrams";
pub const SUGGEST_GROUPING: &str =
    "Consider using grouping or layers to organize related elements";
pub const SUGGEST_LABELS: &str =
    "Add descriptive labels to make the diagram more understandable";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Rectangle,
    Ellipse,
    Diamond,
    Arrow,
    Shape,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementDescriptor {
    pub id: String,
    pub kind: ElementKind,
    pub label: String,
    pub position: Position,
    pub connections: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutSummary {
    pub width: f64,
    pub height: f64,
    pub complexity: Complexity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Introspection {
    pub elements: Vec<ElementDescriptor>,
    pub layout: LayoutSummary,
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagramInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub element_count: usize,
    pub bounds: Bounds,
}

/// Split a style string into lowercased `(key, value)` pairs. Bare entries
/// such as `ellipse` get an empty value.
fn style_entries(style: &str) -> Vec<(String, String)> {
    style
        .split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((key, value)) => (key.trim().to_lowercase(), value.trim().to_lowercase()),
            None => (entry.to_lowercase(), String::new()),
        })
        .collect()
}

/// Element kind from style keywords, first match wins: rounded, ellipse,
/// rhombus, arrow.
pub fn classify_style(style: &str) -> ElementKind {
    let entries = style_entries(style);
    let marked = |name: &str| {
        entries
            .iter()
            .any(|(k, v)| (k == name && v != "0") || (k == "shape" && v == name))
    };

    if marked("rounded") {
        ElementKind::Rectangle
    } else if marked("ellipse") {
        ElementKind::Ellipse
    } else if marked("rhombus") {
        ElementKind::Diamond
    } else if entries
        .iter()
        .any(|(k, v)| k == "arrow" || (k == "shape" && v.contains("arrow")))
    {
        ElementKind::Arrow
    } else {
        ElementKind::Shape
    }
}

pub struct Introspector {
    config: IntrospectionConfig,
}

impl Introspector {
    pub fn new(config: IntrospectionConfig) -> Self {
        Self { config }
    }

    pub fn introspect(&self, document: &DiagramDocument) -> Introspection {
        let elements = self.elements(document);
        let layout = self.layout(document);
        let suggestions = self.suggestions(document, &elements, &layout);
        Introspection {
            elements,
            layout,
            suggestions,
        }
    }

    pub fn elements(&self, document: &DiagramDocument) -> Vec<ElementDescriptor> {
        let mut elements: Vec<ElementDescriptor> = document
            .cells()
            .filter(|cell| !cell.label.is_empty())
            .map(|cell| ElementDescriptor {
                id: cell.id.clone(),
                kind: classify_style(&cell.style),
                label: cell.label.clone(),
                position: cell
                    .geometry
                    .map(|g| Position { x: g.x, y: g.y })
                    .unwrap_or_default(),
                connections: vec![],
            })
            .collect();

        if self.config.link_connections {
            link_connections(document, &mut elements);
        }
        elements
    }

    pub fn layout(&self, document: &DiagramDocument) -> LayoutSummary {
        let (max_x, max_y) = document
            .cells()
            .filter_map(|cell| cell.geometry)
            .filter(|g| !g.relative)
            .fold((0.0_f64, 0.0_f64), |(mx, my), g| {
                (mx.max(g.x + g.width), my.max(g.y + g.height))
            });

        LayoutSummary {
            width: max_x + self.config.padding,
            height: max_y + self.config.padding,
            complexity: self.classify(content_cell_count(document)),
        }
    }

    fn classify(&self, cells: usize) -> Complexity {
        if cells <= self.config.simple_max {
            Complexity::Simple
        } else if cells <= self.config.moderate_max {
            Complexity::Moderate
        } else {
            Complexity::Complex
        }
    }

    fn suggestions(
        &self,
        document: &DiagramDocument,
        elements: &[ElementDescriptor],
        layout: &LayoutSummary,
    ) -> Vec<String> {
        let mut suggestions = vec![];

        if elements.is_empty() {
            suggestions.push(SUGGEST_MORE_ELEMENTS.to_string());
        }
        if layout.complexity == Complexity::Complex {
            suggestions.push(SUGGEST_SPLIT.to_string());
        }
        if content_cell_count(document) > self.config.grouping_threshold {
            suggestions.push(SUGGEST_GROUPING.to_string());
        }
        if !elements.iter().any(|e| !e.label.trim().is_empty()) {
            suggestions.push(SUGGEST_LABELS.to_string());
        }

        suggestions
    }

    /// Title, cell count and page bounds of the first page.
    pub fn diagram_info(&self, document: &DiagramDocument) -> DiagramInfo {
        let first = document.diagrams.first();
        let title = first.and_then(|d| {
            d.attributes
                .iter()
                .find(|(k, _)| k == "name")
                .map(|(_, v)| v.clone())
        });
        let bounds = first.map_or(
            Bounds {
                width: DEFAULT_PAGE_WIDTH,
                height: DEFAULT_PAGE_HEIGHT,
            },
            |d| Bounds {
                width: d.model.viewport.page_width,
                height: d.model.viewport.page_height,
            },
        );

        DiagramInfo {
            title,
            element_count: document.element_count(),
            bounds,
        }
    }

    /// Every non-empty label, space separated, in document order.
    pub fn extract_text(&self, document: &DiagramDocument) -> String {
        document
            .cells()
            .map(|c| c.label.trim())
            .filter(|label| !label.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Default for Introspector {
    fn default() -> Self {
        Self::new(IntrospectionConfig::default())
    }
}

fn content_cell_count(document: &DiagramDocument) -> usize {
    document.cells().filter(|c| !c.is_default()).count()
}

fn link_connections(document: &DiagramDocument, elements: &mut [ElementDescriptor]) {
    let index: HashMap<String, usize> = elements
        .iter()
        .enumerate()
        .map(|(i, e)| (e.id.clone(), i))
        .collect();

    for diagram in &document.diagrams {
        let cells = &diagram.model.cells;
        for edge in cells.iter().filter(|c| c.kind == CellKind::Edge) {
            let (Some(source), Some(target)) = (&edge.source, &edge.target) else {
                continue;
            };
            if !cells.contains(target) {
                continue;
            }
            if let Some(&i) = index.get(source) {
                if !elements[i].connections.contains(target) {
                    elements[i].connections.push(target.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markup::parse;

    fn document(cells: &str) -> DiagramDocument {
        let xml = format!(
            "<mxfile><diagram name=\"Flow\"><mxGraphModel pageWidth=\"1600\"><root>\
             <mxCell id=\"0\"/><mxCell id=\"1\" parent=\"0\"/>{cells}</root></mxGraphModel></diagram></mxfile>"
        );
        DiagramDocument::from_element(parse(&xml).root.as_ref().unwrap()).unwrap()
    }

    #[test]
    fn test_style_precedence() {
        assert_eq!(classify_style("rounded=1;ellipse;"), ElementKind::Rectangle);
        assert_eq!(classify_style("rounded=0;ellipse;whiteSpace=wrap;"), ElementKind::Ellipse);
        assert_eq!(classify_style("rhombus;"), ElementKind::Diamond);
        assert_eq!(classify_style("shape=flexArrow;"), ElementKind::Arrow);
        assert_eq!(classify_style("endArrow=classic;html=1;"), ElementKind::Shape);
        assert_eq!(classify_style(""), ElementKind::Shape);
    }

    #[test]
    fn test_only_labelled_cells_are_elements() {
        let doc = document(
            r#"<mxCell id="a" value="Start" style="ellipse;" vertex="1" parent="1"><mxGeometry x="10" y="20" width="80" height="40" as="geometry"/></mxCell>
               <mxCell id="b" vertex="1" parent="1"/>"#,
        );
        let elements = Introspector::default().elements(&doc);
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].kind, ElementKind::Ellipse);
        assert_eq!(elements[0].position, Position { x: 10.0, y: 20.0 });
        assert!(elements[0].connections.is_empty());
    }

    #[test]
    fn test_layout_extents_and_padding() {
        let doc = document(
            r#"<mxCell id="a" value="A" vertex="1" parent="1"><mxGeometry x="100" y="50" width="120" height="60" as="geometry"/></mxCell>
               <mxCell id="e" edge="1" parent="1"><mxGeometry x="900" y="900" relative="1" as="geometry"/></mxCell>"#,
        );
        let layout = Introspector::default().layout(&doc);
        assert_eq!(layout.width, 420.0);
        assert_eq!(layout.height, 310.0);
        assert_eq!(layout.complexity, Complexity::Simple);
    }

    #[test]
    fn test_twenty_labelled_cells() {
        let cells: String = (0..20)
            .map(|i| format!(r#"<mxCell id="n{i}" value="A" vertex="1" parent="1"/>"#))
            .collect();
        let result = Introspector::default().introspect(&document(&cells));
        assert_eq!(result.layout.complexity, Complexity::Complex);
        assert_eq!(result.suggestions, vec![SUGGEST_SPLIT, SUGGEST_GROUPING]);
    }

    #[test]
    fn test_empty_diagram_suggestions() {
        let result = Introspector::default().introspect(&document(""));
        assert_eq!(result.suggestions, vec![SUGGEST_MORE_ELEMENTS, SUGGEST_LABELS]);
        assert_eq!(result.layout.width, 200.0);
    }

    #[test]
    fn test_complexity_boundaries() {
        let introspector = Introspector::default();
        assert_eq!(introspector.classify(5), Complexity::Simple);
        assert_eq!(introspector.classify(6), Complexity::Moderate);
        assert_eq!(introspector.classify(15), Complexity::Moderate);
        assert_eq!(introspector.classify(16), Complexity::Complex);
    }

    #[test]
    fn test_connections_when_enabled() {
        let doc = document(
            r#"<mxCell id="a" value="A" vertex="1" parent="1"/><mxCell id="b" value="B" vertex="1" parent="1"/>
               <mxCell id="e" edge="1" parent="1" source="a" target="b"/>"#,
        );
        assert!(Introspector::default().elements(&doc)[0].connections.is_empty());

        let linked = Introspector::new(IntrospectionConfig {
            link_connections: true,
            ..IntrospectionConfig::default()
        });
        assert_eq!(linked.elements(&doc)[0].connections, vec!["b".to_string()]);
    }

    #[test]
    fn test_info_and_text() {
        let doc = document(
            r#"<mxCell id="a" value="Load" vertex="1" parent="1"/><mxCell id="b" value=" Save " vertex="1" parent="1"/>"#,
        );
        let introspector = Introspector::default();
        let info = introspector.diagram_info(&doc);
        assert_eq!(info.title.as_deref(), Some("Flow"));
        assert_eq!(info.element_count, 4);
        assert_eq!(info.bounds, Bounds { width: 1600.0, height: DEFAULT_PAGE_HEIGHT });
        assert_eq!(introspector.extract_text(&doc), "Load Save");
    }
}
