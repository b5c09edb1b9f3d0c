//! Schema Validation - Structural Rules over Diagram Documents
//!
//! The hierarchy checks (root container down to the cell collection) are
//! ordered and short-circuit. Once the hierarchy exists, independent cell
//! rules run per page and produce structured errors.

use std::fmt;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ValidationConfig;
use crate::document::{
    CellKind, DiagramDocument, GraphModel, StructureError, CANVAS_CELL_ID, LAYER_CELL_ID,
};
use crate::markup::{self, Element};
use crate::normalize::normalize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    MalformedMarkup,
    MissingRoot,
    MissingDiagram,
    MissingGraphModel,
    MissingRootCells,
    MissingDefaultCells,
    MissingCellId,
    DuplicateCellId,
    UnresolvedParent,
    DanglingEdge,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MalformedMarkup => "MalformedMarkup",
            ErrorKind::MissingRoot => "MissingRoot",
            ErrorKind::MissingDiagram => "MissingDiagram",
            ErrorKind::MissingGraphModel => "MissingGraphModel",
            ErrorKind::MissingRootCells => "MissingRootCells",
            ErrorKind::MissingDefaultCells => "MissingDefaultCells",
            ErrorKind::MissingCellId => "MissingCellId",
            ErrorKind::DuplicateCellId => "DuplicateCellId",
            ErrorKind::UnresolvedParent => "UnresolvedParent",
            ErrorKind::DanglingEdge => "DanglingEdge",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&StructureError> for ErrorKind {
    fn from(err: &StructureError) -> Self {
        match err {
            StructureError::MissingRoot(_) => ErrorKind::MissingRoot,
            StructureError::MissingDiagram => ErrorKind::MissingDiagram,
            StructureError::MissingGraphModel(_) => ErrorKind::MissingGraphModel,
            StructureError::MissingRootCells(_) => ErrorKind::MissingRootCells,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {detail}")]
pub struct ValidationError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl ValidationError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<ValidationError>,
    pub element_count: usize,
    /// Document produced by textual normalization when the input itself
    /// was not well-formed.
    #[serde(skip)]
    pub repaired: Option<DiagramDocument>,
    #[serde(skip)]
    pub normalized_xml: Option<String>,
    /// The checked document, whenever its hierarchy could be read.
    #[serde(skip)]
    pub document: Option<DiagramDocument>,
    /// Best-effort tree of the input, kept for structural reconstruction.
    #[serde(skip)]
    pub best_effort: Option<Element>,
}

impl ValidationResult {
    fn failure(error: ValidationError, best_effort: Option<Element>) -> Self {
        Self {
            is_valid: false,
            errors: vec![error],
            best_effort,
            ..Self::default()
        }
    }

    pub fn error_kinds(&self) -> Vec<ErrorKind> {
        self.errors.iter().map(|e| e.kind).collect()
    }

    pub fn has_error(&self, kind: ErrorKind) -> bool {
        self.errors.iter().any(|e| e.kind == kind)
    }
}

/// Validation rule trait - checks one page's graph model
pub trait ValidationRule {
    fn name(&self) -> &'static str;
    fn validate(&self, model: &GraphModel, page: &str) -> Vec<ValidationError>;
}

// --- Concrete Rules ---

pub struct DefaultCellsRule;

impl ValidationRule for DefaultCellsRule {
    fn name(&self) -> &'static str { "default_cells" }

    fn validate(&self, model: &GraphModel, page: &str) -> Vec<ValidationError> {
        let cells = &model.cells;
        let detail = if cells.raw_count() < 2 {
            format!(
                "page '{}' has {} cell(s), the canvas cell \"0\" and layer cell \"1\" are required",
                page,
                cells.raw_count()
            )
        } else if !cells.contains(CANVAS_CELL_ID) || !cells.contains(LAYER_CELL_ID) {
            format!("page '{}' is missing the canvas cell \"0\" or layer cell \"1\"", page)
        } else if cells.get(CANVAS_CELL_ID).is_some_and(|c| c.parent.is_some()) {
            format!("canvas cell \"0\" on page '{}' must not have a parent", page)
        } else if cells
            .get(LAYER_CELL_ID)
            .is_some_and(|c| c.parent.as_deref() != Some(CANVAS_CELL_ID))
        {
            format!("layer cell \"1\" on page '{}' must have parent \"0\"", page)
        } else {
            return vec![];
        };

        vec![ValidationError::new(ErrorKind::MissingDefaultCells, detail)]
    }
}

pub struct CellIdRule;

impl ValidationRule for CellIdRule {
    fn name(&self) -> &'static str { "cell_id" }

    fn validate(&self, model: &GraphModel, page: &str) -> Vec<ValidationError> {
        let mut errors = vec![];

        let unnamed = model.cells.unnamed_count();
        if unnamed > 0 {
            errors.push(ValidationError::new(
                ErrorKind::MissingCellId,
                format!("{} cell(s) on page '{}' have no id", unnamed, page),
            ));
        }

        let duplicates = model.cells.duplicate_ids();
        if !duplicates.is_empty() {
            errors.push(ValidationError::new(
                ErrorKind::DuplicateCellId,
                format!("duplicate cell ids on page '{}': {}", page, duplicates.join(", ")),
            ));
        }

        errors
    }
}

pub struct ParentRule;

impl ValidationRule for ParentRule {
    fn name(&self) -> &'static str { "parent" }

    fn validate(&self, model: &GraphModel, page: &str) -> Vec<ValidationError> {
        let orphans: Vec<&str> = model
            .cells
            .iter()
            .filter(|c| !c.is_default())
            .filter(|c| match &c.parent {
                Some(parent) => !model.cells.contains(parent),
                None => true,
            })
            .map(|c| c.id.as_str())
            .collect();

        if orphans.is_empty() {
            return vec![];
        }
        vec![ValidationError::new(
            ErrorKind::UnresolvedParent,
            format!("cells on page '{}' with unresolved parent: {}", page, orphans.join(", ")),
        )]
    }
}

/// Edge endpoints must name an existing non-edge cell. Only installed when
/// `checkEdgeEndpoints` is enabled.
pub struct EdgeEndpointRule;

impl ValidationRule for EdgeEndpointRule {
    fn name(&self) -> &'static str { "edge_endpoints" }

    fn validate(&self, model: &GraphModel, page: &str) -> Vec<ValidationError> {
        let dangling: Vec<&str> = model
            .cells
            .iter()
            .filter(|c| c.kind == CellKind::Edge)
            .filter(|edge| {
                [&edge.source, &edge.target]
                    .into_iter()
                    .flatten()
                    .any(|end| !resolves_to_node(model, end))
            })
            .map(|c| c.id.as_str())
            .collect();

        if dangling.is_empty() {
            return vec![];
        }
        vec![ValidationError::new(
            ErrorKind::DanglingEdge,
            format!("edges on page '{}' with unresolved endpoints: {}", page, dangling.join(", ")),
        )]
    }
}

pub(crate) fn resolves_to_node(model: &GraphModel, id: &str) -> bool {
    model.cells.get(id).is_some_and(|c| c.kind != CellKind::Edge)
}

/// SchemaValidator runs the hierarchy checks, then every cell rule
pub struct SchemaValidator {
    rules: Vec<Box<dyn ValidationRule>>,
}

impl SchemaValidator {
    pub fn new(config: &ValidationConfig) -> Self {
        let mut rules: Vec<Box<dyn ValidationRule>> = vec![
            Box::new(DefaultCellsRule),
            Box::new(CellIdRule),
            Box::new(ParentRule),
        ];
        if config.check_edge_endpoints {
            rules.push(Box::new(EdgeEndpointRule));
        }
        Self { rules }
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    pub fn validate(&self, xml: &str) -> ValidationResult {
        let parsed = markup::parse(xml);

        let (root, normalized_xml) = if parsed.is_well_formed() {
            (parsed.root, None)
        } else {
            let normalized = normalize(xml);
            let reparsed = markup::parse(&normalized);
            if !reparsed.is_well_formed() {
                debug!(issues = reparsed.issues.len(); "markup is malformed after normalization");
                let detail = parsed.summary();
                let best_effort = reparsed.root.or(parsed.root);
                return ValidationResult::failure(
                    ValidationError::new(ErrorKind::MalformedMarkup, detail),
                    best_effort,
                );
            }
            warn!(issues = parsed.issues.len(); "markup was not well-formed, normalized text used");
            (reparsed.root, Some(normalized))
        };

        let Some(root) = root else {
            return ValidationResult::failure(
                ValidationError::new(ErrorKind::MalformedMarkup, "no root element"),
                None,
            );
        };

        let document = match DiagramDocument::from_element(&root) {
            Ok(document) => document,
            Err(err) => {
                debug!(err:% = err; "document hierarchy incomplete");
                let mut result = ValidationResult::failure(
                    ValidationError::new(ErrorKind::from(&err), err.to_string()),
                    Some(root),
                );
                result.normalized_xml = normalized_xml;
                return result;
            }
        };

        let mut errors = vec![];
        for diagram in &document.diagrams {
            for rule in &self.rules {
                errors.extend(rule.validate(&diagram.model, &diagram.name));
            }
        }

        let element_count = document.element_count();
        debug!(errors = errors.len(), element_count; "validated document");

        ValidationResult {
            is_valid: errors.is_empty(),
            errors,
            element_count,
            repaired: normalized_xml.as_ref().map(|_| document.clone()),
            normalized_xml,
            document: Some(document),
            best_effort: Some(root),
        }
    }
}

impl Default for SchemaValidator {
    fn default() -> Self {
        Self::new(&ValidationConfig::default())
    }
}
