//! Repair Engine - Normalization, then Structural Reconstruction
//!
//! Tier A rewrites the text (see `normalize`). If the result still does not
//! validate, Tier B builds a fresh skeleton document and splices in every
//! cell that can be found in a best-effort parse of the input.
//!
//! Dangling references are resolved by removal: salvaged edges whose
//! endpoints do not name a node, and cells whose parent is gone, are dropped
//! until nothing else changes.

use std::collections::HashSet;

use log::{debug, warn};
use serde::Serialize;
use thiserror::Error;

use crate::config::ValidationConfig;
use crate::document::{is_cell_element, wrapped_cell, Cell, CellKind, DiagramDocument, CELL_TAG};
use crate::hashing::sha256_hex;
use crate::markup::{self, is_forbidden_char, Element, MarkupError};
use crate::normalize::normalize;
use crate::validation::SchemaValidator;

#[cfg(feature = "test-hooks")]
thread_local! {
    static REPAIR_CALL_COUNT: std::cell::Cell<u32> = const { std::cell::Cell::new(0) };
}

/// Repair attempts made on the current thread.
#[cfg(feature = "test-hooks")]
pub fn get_repair_call_count() -> u32 {
    REPAIR_CALL_COUNT.with(|c| c.get())
}

#[cfg(feature = "test-hooks")]
pub fn reset_repair_call_count() {
    REPAIR_CALL_COUNT.with(|c| c.set(0));
}

const ETAG_LEN: usize = 20;

#[derive(Debug, Error)]
pub enum RepairError {
    #[error("Failed to serialize reconstructed document: {0}")]
    Serialize(#[from] MarkupError),

    #[error("Reconstructed document is still invalid: {0}")]
    StillInvalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RepairTier {
    Normalization,
    Reconstruction,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Repaired {
    pub xml: String,
    pub tier: RepairTier,
    /// Cells carried over from the input (reconstruction only).
    pub salvaged: usize,
    /// Ids of salvaged cells removed for dangling references.
    pub dropped: Vec<String>,
}

pub struct RepairEngine {
    validator: SchemaValidator,
}

impl RepairEngine {
    pub fn new(config: &ValidationConfig) -> Self {
        Self {
            validator: SchemaValidator::new(config),
        }
    }

    /// Repair `xml`, returning markup that validates.
    pub fn repair(&self, xml: &str, best_effort: Option<&Element>) -> Result<String, RepairError> {
        self.repair_detailed(xml, best_effort).map(|r| r.xml)
    }

    pub fn repair_detailed(
        &self,
        xml: &str,
        best_effort: Option<&Element>,
    ) -> Result<Repaired, RepairError> {
        #[cfg(feature = "test-hooks")]
        REPAIR_CALL_COUNT.with(|c| c.set(c.get() + 1));

        let normalized = normalize(xml);
        let check = self.validator.validate(&normalized);
        if check.is_valid {
            debug!("normalization produced a valid document");
            return Ok(Repaired {
                xml: normalized,
                tier: RepairTier::Normalization,
                salvaged: 0,
                dropped: vec![],
            });
        }

        warn!(
            errors:? = check.error_kinds();
            "normalization insufficient, reconstructing document"
        );
        let tree = match best_effort {
            Some(tree) => Some(tree.clone()),
            None => check.best_effort.or_else(|| markup::parse(xml).root),
        };
        self.reconstruct(tree.as_ref())
    }

    fn reconstruct(&self, tree: Option<&Element>) -> Result<Repaired, RepairError> {
        let candidates = tree.map(salvage_cells).unwrap_or_default();
        let salvaged = candidates.len();

        let mut cell_ids: HashSet<String> = candidates.iter().map(|c| c.id.clone()).collect();
        let mut node_ids: HashSet<String> = candidates
            .iter()
            .filter(|c| c.kind != CellKind::Edge)
            .map(|c| c.id.clone())
            .collect();
        for default in [Cell::canvas(), Cell::layer()] {
            cell_ids.insert(default.id.clone());
            node_ids.insert(default.id);
        }

        let mut kept = candidates;
        let mut dropped = Vec::new();
        loop {
            let (keep, drop): (Vec<Cell>, Vec<Cell>) = kept
                .into_iter()
                .partition(|cell| references_resolve(cell, &cell_ids, &node_ids));
            kept = keep;
            if drop.is_empty() {
                break;
            }
            for cell in drop {
                cell_ids.remove(&cell.id);
                node_ids.remove(&cell.id);
                dropped.push(cell.id);
            }
        }

        if !dropped.is_empty() {
            warn!(count = dropped.len(), ids:? = dropped; "dropped cells with dangling references");
        }

        let mut document = DiagramDocument::skeleton(&content_etag(&kept));
        if let Some(page) = document.diagrams.first_mut() {
            for cell in kept {
                page.model.cells.insert(cell);
            }
        }

        let xml = document.to_xml()?;
        let check = self.validator.validate(&xml);
        if !check.is_valid {
            let detail = check
                .errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(RepairError::StillInvalid(detail));
        }

        debug!(salvaged, dropped = dropped.len(); "reconstructed document");
        Ok(Repaired {
            xml,
            tier: RepairTier::Reconstruction,
            salvaged,
            dropped,
        })
    }
}

impl Default for RepairEngine {
    fn default() -> Self {
        Self::new(&ValidationConfig::default())
    }
}

/// Every cell of `tree` except the default cells, without nested cells and
/// forbidden characters, first occurrence of each id only.
fn salvage_cells(tree: &Element) -> Vec<Cell> {
    let mut found = Vec::new();
    if is_cell_element(tree) {
        found.push(tree);
    }
    collect_cell_elements(tree, &mut found);

    let mut seen = HashSet::new();
    let mut cells = Vec::new();

    for found in found {
        let mut element = found.clone();
        strip_nested_cells(&mut element);
        sanitize(&mut element);

        let cell = Cell::from_element(&element);
        if cell.id.is_empty() || cell.is_default() || !seen.insert(cell.id.clone()) {
            continue;
        }
        cells.push(cell);
    }

    cells
}

/// Cell elements below `element` in document order. The inner `mxCell` of a
/// wrapper belongs to the wrapper and is not collected on its own.
fn collect_cell_elements<'a>(element: &'a Element, found: &mut Vec<&'a Element>) {
    let scope = wrapped_cell(element).unwrap_or(element);
    for child in &scope.children {
        if is_cell_element(child) {
            found.push(child);
        }
        collect_cell_elements(child, found);
    }
}

fn strip_nested_cells(element: &mut Element) {
    let is_wrapper = wrapped_cell(element).is_some();
    let body_index = element.children.iter().position(|c| c.name == CELL_TAG);
    let body = match body_index {
        Some(index) if is_wrapper => &mut element.children[index],
        _ => element,
    };
    body.children.retain(|c| !is_cell_element(c));
}

fn sanitize(element: &mut Element) {
    for (_, value) in element.attributes.iter_mut() {
        value.retain(|c| !is_forbidden_char(c));
    }
    element.text.retain(|c| !is_forbidden_char(c));
    for child in element.children.iter_mut() {
        sanitize(child);
    }
}

fn references_resolve(cell: &Cell, cell_ids: &HashSet<String>, node_ids: &HashSet<String>) -> bool {
    let parent_ok = cell.parent.as_ref().is_some_and(|p| cell_ids.contains(p));
    let endpoints_ok = cell.kind != CellKind::Edge
        || [&cell.source, &cell.target]
            .into_iter()
            .flatten()
            .all(|end| node_ids.contains(end));
    parent_ok && endpoints_ok
}

/// Deterministic etag over the salvaged content.
fn content_etag(cells: &[Cell]) -> String {
    let fingerprint: String = cells
        .iter()
        .map(|c| {
            format!(
                "{}|{}|{}|{}\n",
                c.id,
                c.parent.as_deref().unwrap_or_default(),
                c.label,
                c.style
            )
        })
        .collect();
    let mut etag = sha256_hex(fingerprint.as_bytes());
    etag.truncate(ETAG_LEN);
    etag
}
