//! Diagram Document Model
//!
//! Typed view of an mxfile: root container -> diagrams -> graph model ->
//! root -> cells. Cells live in an id-indexed arena; parent, source and
//! target are plain id lookups, never references.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::markup::{self, Element, MarkupError};

pub const ROOT_TAG: &str = "mxfile";
pub const DIAGRAM_TAG: &str = "diagram";
pub const GRAPH_MODEL_TAG: &str = "mxGraphModel";
pub const CELLS_TAG: &str = "root";
pub const CELL_TAG: &str = "mxCell";
/// Elements draw.io wraps around an mxCell to attach custom properties.
pub const USER_OBJECT_TAGS: [&str; 2] = ["UserObject", "object"];
pub const GEOMETRY_TAG: &str = "mxGeometry";

/// Id of the invisible canvas root cell.
pub const CANVAS_CELL_ID: &str = "0";
/// Id of the default layer cell.
pub const LAYER_CELL_ID: &str = "1";

pub const DEFAULT_PAGE_WIDTH: f64 = 827.0;
pub const DEFAULT_PAGE_HEIGHT: f64 = 1169.0;

/// First missing level of the document hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructureError {
    #[error("Missing <mxfile> root element (found <{0}>)")]
    MissingRoot(String),

    #[error("Missing <diagram> element")]
    MissingDiagram,

    #[error("Diagram '{0}' has no <mxGraphModel> (compressed diagrams are not supported)")]
    MissingGraphModel(String),

    #[error("Diagram '{0}' has no <root> element in its graph model")]
    MissingRootCells(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellKind {
    Vertex,
    Edge,
    Container,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Geometry {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    /// Relative geometries (edge labels, edges) are offsets, not positions.
    #[serde(default)]
    pub relative: bool,
}

impl Geometry {
    fn from_element(element: &Element) -> Self {
        Self {
            x: number_attr(element, "x").unwrap_or(0.0),
            y: number_attr(element, "y").unwrap_or(0.0),
            width: number_attr(element, "width").unwrap_or(0.0),
            height: number_attr(element, "height").unwrap_or(0.0),
            relative: element.attr("relative") == Some("1"),
        }
    }
}

/// A single mxCell, possibly inside a `UserObject` wrapper. The typed fields
/// are derived from `element`, which is kept so the cell can be written back
/// exactly as it was read.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub id: String,
    pub parent: Option<String>,
    pub kind: CellKind,
    pub label: String,
    pub style: String,
    pub geometry: Option<Geometry>,
    pub source: Option<String>,
    pub target: Option<String>,
    element: Element,
}

impl Cell {
    /// Read a cell from an `mxCell` or a wrapper around one. A wrapper
    /// supplies the id and label; everything else comes from the inner cell.
    pub fn from_element(element: &Element) -> Self {
        let (body, label) = match wrapped_cell(element) {
            Some(body) => (body, element.attr("label")),
            None => (element, element.attr("value")),
        };

        let kind = if body.attr("edge") == Some("1") {
            CellKind::Edge
        } else if body.attr("vertex") == Some("1") {
            CellKind::Vertex
        } else {
            CellKind::Container
        };
        let geometry = body
            .children_named(GEOMETRY_TAG)
            .find(|g| g.attr("as").map_or(true, |a| a == "geometry"))
            .map(Geometry::from_element);

        Self {
            id: element.attr("id").unwrap_or_default().to_string(),
            parent: non_empty_attr(body, "parent"),
            kind,
            label: label.unwrap_or_default().to_string(),
            style: body.attr("style").unwrap_or_default().to_string(),
            geometry,
            source: non_empty_attr(body, "source"),
            target: non_empty_attr(body, "target"),
            element: element.clone(),
        }
    }

    pub fn canvas() -> Self {
        Self::from_element(&Element::new(CELL_TAG).with_attr("id", CANVAS_CELL_ID))
    }

    pub fn layer() -> Self {
        Self::from_element(
            &Element::new(CELL_TAG)
                .with_attr("id", LAYER_CELL_ID)
                .with_attr("parent", CANVAS_CELL_ID),
        )
    }

    pub fn is_default(&self) -> bool {
        self.id == CANVAS_CELL_ID || self.id == LAYER_CELL_ID
    }

    pub fn element(&self) -> &Element {
        &self.element
    }
}

/// Whether `element` is a cell: a bare `mxCell` or a wrapper holding one.
pub fn is_cell_element(element: &Element) -> bool {
    element.name == CELL_TAG || wrapped_cell(element).is_some()
}

/// The inner `mxCell` of a `UserObject`/`object` wrapper.
pub fn wrapped_cell(element: &Element) -> Option<&Element> {
    if USER_OBJECT_TAGS.contains(&element.name.as_str()) {
        element.child(CELL_TAG)
    } else {
        None
    }
}

fn non_empty_attr(element: &Element, key: &str) -> Option<String> {
    element
        .attr(key)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn number_attr(element: &Element, key: &str) -> Option<f64> {
    element
        .attr(key)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

/// Cells of one graph model, addressable by id and kept in document order.
///
/// Cells without an id and repeated ids are not stored but counted, so the
/// validator can still report them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CellArena {
    cells: IndexMap<String, Cell>,
    duplicate_ids: Vec<String>,
    unnamed: usize,
}

impl CellArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a cell; returns false if it was rejected (no id or id taken).
    pub fn insert(&mut self, cell: Cell) -> bool {
        if cell.id.is_empty() {
            self.unnamed += 1;
            return false;
        }
        if self.cells.contains_key(&cell.id) {
            self.duplicate_ids.push(cell.id);
            return false;
        }
        self.cells.insert(cell.id.clone(), cell);
        true
    }

    pub fn get(&self, id: &str) -> Option<&Cell> {
        self.cells.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.cells.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cell> {
        self.cells.values()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Number of cell elements as they appeared in the source.
    pub fn raw_count(&self) -> usize {
        self.cells.len() + self.duplicate_ids.len() + self.unnamed
    }

    pub fn duplicate_ids(&self) -> &[String] {
        &self.duplicate_ids
    }

    pub fn unnamed_count(&self) -> usize {
        self.unnamed
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&Cell) -> bool) {
        self.cells.retain(|_, cell| keep(cell));
    }
}

/// Page and grid settings of a graph model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    pub scale: f64,
    pub page_width: f64,
    pub page_height: f64,
    pub grid: bool,
    pub grid_size: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            scale: 1.0,
            page_width: DEFAULT_PAGE_WIDTH,
            page_height: DEFAULT_PAGE_HEIGHT,
            grid: true,
            grid_size: 10.0,
        }
    }
}

impl Viewport {
    fn from_element(element: &Element) -> Self {
        let defaults = Self::default();
        Self {
            scale: number_attr(element, "pageScale").unwrap_or(defaults.scale),
            page_width: number_attr(element, "pageWidth").unwrap_or(defaults.page_width),
            page_height: number_attr(element, "pageHeight").unwrap_or(defaults.page_height),
            grid: element.attr("grid").map_or(defaults.grid, |g| g == "1"),
            grid_size: number_attr(element, "gridSize").unwrap_or(defaults.grid_size),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphModel {
    pub viewport: Viewport,
    pub attributes: Vec<(String, String)>,
    pub cells: CellArena,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Diagram {
    pub id: String,
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub model: GraphModel,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiagramDocument {
    pub attributes: Vec<(String, String)>,
    pub diagrams: Vec<Diagram>,
}

impl DiagramDocument {
    /// Build the typed document from a parsed tree, stopping at the first
    /// missing level of the hierarchy.
    pub fn from_element(root: &Element) -> Result<Self, StructureError> {
        if root.name != ROOT_TAG {
            return Err(StructureError::MissingRoot(root.name.clone()));
        }

        let mut diagrams = Vec::new();
        for (index, diagram) in root.children_named(DIAGRAM_TAG).enumerate() {
            let name = diagram
                .attr("name")
                .map(str::to_string)
                .unwrap_or_else(|| format!("Page-{}", index + 1));
            let graph = diagram
                .child(GRAPH_MODEL_TAG)
                .ok_or_else(|| StructureError::MissingGraphModel(name.clone()))?;
            let cells_root = graph
                .child(CELLS_TAG)
                .ok_or_else(|| StructureError::MissingRootCells(name.clone()))?;

            let mut cells = CellArena::new();
            for cell in cells_root.children.iter().filter(|c| is_cell_element(c)) {
                cells.insert(Cell::from_element(cell));
            }

            diagrams.push(Diagram {
                id: diagram.attr("id").unwrap_or_default().to_string(),
                name,
                attributes: diagram.attributes.clone(),
                model: GraphModel {
                    viewport: Viewport::from_element(graph),
                    attributes: graph.attributes.clone(),
                    cells,
                },
            });
        }

        if diagrams.is_empty() {
            return Err(StructureError::MissingDiagram);
        }

        Ok(Self {
            attributes: root.attributes.clone(),
            diagrams,
        })
    }

    /// Minimal valid document: one diagram whose root holds only the canvas
    /// and layer cells.
    pub fn skeleton(etag: &str) -> Self {
        let attributes = vec![
            ("host".to_string(), "app.diagrams.net".to_string()),
            ("agent".to_string(), "diagram-exchange".to_string()),
            ("version".to_string(), "21.7.5".to_string()),
            ("etag".to_string(), etag.to_string()),
        ];

        let model_attributes: Vec<(String, String)> = [
            ("dx", "1422"),
            ("dy", "794"),
            ("grid", "1"),
            ("gridSize", "10"),
            ("guides", "1"),
            ("tooltips", "1"),
            ("connect", "1"),
            ("arrows", "1"),
            ("fold", "1"),
            ("page", "1"),
            ("pageScale", "1"),
            ("pageWidth", "827"),
            ("pageHeight", "1169"),
            ("math", "0"),
            ("shadow", "0"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let mut cells = CellArena::new();
        cells.insert(Cell::canvas());
        cells.insert(Cell::layer());

        Self {
            attributes,
            diagrams: vec![Diagram {
                id: "generated-diagram".to_string(),
                name: "Generated Diagram".to_string(),
                attributes: vec![
                    ("id".to_string(), "generated-diagram".to_string()),
                    ("name".to_string(), "Generated Diagram".to_string()),
                ],
                model: GraphModel {
                    viewport: Viewport::default(),
                    attributes: model_attributes,
                    cells,
                },
            }],
        }
    }

    /// All cells of all pages, page by page.
    pub fn cells(&self) -> impl Iterator<Item = &Cell> {
        self.diagrams.iter().flat_map(|d| d.model.cells.iter())
    }

    /// Cell elements across all pages, as counted in the source.
    pub fn element_count(&self) -> usize {
        self.diagrams.iter().map(|d| d.model.cells.raw_count()).sum()
    }

    pub fn to_element(&self) -> Element {
        let mut root = Element::new(ROOT_TAG);
        root.attributes = self.attributes.clone();

        for diagram in &self.diagrams {
            let mut cells_root = Element::new(CELLS_TAG);
            cells_root.children = diagram.model.cells.iter().map(|c| c.element().clone()).collect();

            let mut graph = Element::new(GRAPH_MODEL_TAG);
            graph.attributes = diagram.model.attributes.clone();
            graph.children.push(cells_root);

            let mut page = Element::new(DIAGRAM_TAG);
            page.attributes = diagram.attributes.clone();
            page.children.push(graph);

            root.children.push(page);
        }

        root
    }

    pub fn to_xml(&self) -> Result<String, MarkupError> {
        markup::write_document(&self.to_element())
    }
}
