//! Contract Invariant Tests
//!
//! These tests verify the pipeline guarantees end to end.

use std::io::Write;

use diagram_exchange::{
    config::{EnvelopeConfig, PipelineConfig},
    document::{DiagramDocument, CANVAS_CELL_ID, LAYER_CELL_ID},
    introspect::{SUGGEST_GROUPING, SUGGEST_LABELS, SUGGEST_SPLIT},
    markup::parse,
    Complexity, ConfidenceScorer, DiagramPipeline, EnvelopeParser, ErrorKind, GenerationRequest,
    Introspector, RecoveryStage, RepairEngine, SchemaValidator,
};
use proptest::prelude::*;

const SCENARIO_C: &str =
    r#"<mxfile><diagram><mxGraphModel><root><mxCell id="0"/></root></mxGraphModel></diagram></mxfile>"#;

fn read_document(xml: &str) -> DiagramDocument {
    DiagramDocument::from_element(parse(xml).root.as_ref().unwrap()).unwrap()
}

#[test]
fn scenario_a_fenced_envelope() {
    let inner = r#"{"xml":"<mxfile>...</mxfile>","commentary":"ok"}"#;
    let raw = format!("```json\n{}\n```", inner);

    let recovered = EnvelopeParser::default().recover(&raw).unwrap();
    assert_eq!(recovered.stage, RecoveryStage::Direct);
    assert_eq!(recovered.envelope.xml, "<mxfile>...</mxfile>");
    assert_eq!(recovered.envelope.commentary, "ok");
}

#[test]
fn scenario_b_raw_newline_in_outer_string() {
    let raw = "```json\n{\"xml\":\"<mxfile>...</mxfile>\",\"commentary\":\"first\nsecond\"}\n```";

    let recovered = EnvelopeParser::default().recover(raw).unwrap();
    assert_eq!(recovered.stage, RecoveryStage::EscapedLineBreaks);
    assert_eq!(recovered.envelope.xml, "<mxfile>...</mxfile>");
    assert_eq!(recovered.envelope.commentary, "first\nsecond");
}

#[test]
fn scenario_c_single_default_cell() {
    let result = SchemaValidator::default().validate(SCENARIO_C);
    assert!(!result.is_valid);
    assert_eq!(result.error_kinds(), vec![ErrorKind::MissingDefaultCells]);
    assert_eq!(result.element_count, 1);
}

#[test]
fn scenario_d_repair_adds_default_cells() {
    let repaired = RepairEngine::default().repair(SCENARIO_C, None).unwrap();

    let document = read_document(&repaired);
    let cells = &document.diagrams[0].model.cells;
    assert!(cells.contains(CANVAS_CELL_ID));
    assert_eq!(cells.get(LAYER_CELL_ID).unwrap().parent.as_deref(), Some(CANVAS_CELL_ID));
    assert!(SchemaValidator::default().validate(&repaired).is_valid);
}

#[test]
fn scenario_e_twenty_labelled_cells() {
    let cells: String = (0..20)
        .map(|i| format!(r#"<mxCell id="c{i}" value="A" vertex="1" parent="1"/>"#))
        .collect();
    let xml = format!(
        r#"<mxfile><diagram><mxGraphModel><root><mxCell id="0"/><mxCell id="1" parent="0"/>{cells}</root></mxGraphModel></diagram></mxfile>"#
    );

    let result = Introspector::default().introspect(&read_document(&xml));
    assert_eq!(result.elements.len(), 20);
    assert_eq!(result.layout.complexity, Complexity::Complex);
    assert!(result.suggestions.iter().any(|s| s == SUGGEST_SPLIT));
    assert!(result.suggestions.iter().any(|s| s == SUGGEST_GROUPING));
    assert!(!result.suggestions.iter().any(|s| s == SUGGEST_LABELS));
}

#[test]
fn invariant_recovery_passes_are_noops_on_valid_envelopes() {
    let raw = r#"{"xml":"<mxfile>\n<diagram/>\n</mxfile>","commentary":"path C:\\tmp \u00e9"}"#;
    let direct: serde_json::Value = serde_json::from_str(raw).unwrap();

    let recovered = EnvelopeParser::default().recover(raw).unwrap();
    assert_eq!(recovered.stage, RecoveryStage::Direct);
    assert_eq!(diagram_exchange::envelope::escape_line_breaks(raw), raw);
    assert_eq!(diagram_exchange::envelope::escape_stray_backslashes(raw), raw);
    assert_eq!(recovered.envelope.commentary, direct["commentary"].as_str().unwrap());
}

#[test]
fn invariant_partial_envelope_is_rejected() {
    let raw = r#"{"xml": "<mxfile></mxfile>"}"#;
    let lenient = EnvelopeParser::new(&EnvelopeConfig { bare_markup_fallback: true });
    assert!(lenient.parse(raw).is_err());
    assert!(EnvelopeParser::default().parse(raw).is_err());
}

#[test]
fn invariant_valid_means_default_cells_present() {
    let validator = SchemaValidator::default();
    let repaired = RepairEngine::default()
        .repair("<mxfile><diagram name=\"x\"></diagram></mxfile>", None)
        .unwrap();

    let result = validator.validate(&repaired);
    assert!(result.is_valid);
    assert!(result.element_count >= 2);
    let document = result.document.unwrap();
    assert!(document.diagrams[0].model.cells.contains(CANVAS_CELL_ID));
    assert!(document.diagrams[0].model.cells.contains(LAYER_CELL_ID));
}

#[test]
fn invariant_repaired_edges_never_dangle() {
    let xml = r#"<mxfile><diagram><mxGraphModel><root>
        <mxCell id="0"/>
        <mxCell id="a" value="A" vertex="1" parent="1"/>
        <mxCell id="e" edge="1" parent="1" source="a" target="missing"/>
    </root></mxGraphModel></diagram></mxfile>"#;

    let repaired = RepairEngine::default().repair(xml, None).unwrap();
    let document = read_document(&repaired);
    let cells = &document.diagrams[0].model.cells;
    assert!(cells.contains("a"));
    assert!(!cells.contains("e"));
}

#[test]
fn invariant_pipeline_outcome_is_valid() {
    let raw = serde_json::json!({
        "xml": "<mxfile><diagram><mxGraphModel><root><mxCell id=\"0\"/><mxCell id=\"2\" value=\"Queue & Worker\" vertex=\"1\" parent=\"1\"></root></mxGraphModel></diagram></mxfile>",
        "commentary": "A queue",
    })
    .to_string();

    let pipeline = DiagramPipeline::default();
    let outcome = pipeline
        .generate(&GenerationRequest {
            raw_response: raw,
            prompt: "queue worker".to_string(),
        })
        .unwrap();

    assert!(outcome.repaired);
    assert!(pipeline.validate_only(&outcome.xml).is_valid);
    assert!(outcome.elements.iter().any(|e| e.label == "Queue & Worker"));
    assert!((0.0..=1.0).contains(&outcome.confidence));
}

#[test]
fn invariant_user_object_cells_are_kept() {
    let xml = r#"<mxfile><diagram><mxGraphModel><root>
        <mxCell id="0"/><mxCell id="1" parent="0"/>
        <UserObject label="Group" id="g">
          <mxCell style="swimlane" vertex="1" parent="1">
            <mxGeometry x="0" y="0" width="300" height="200" as="geometry"/>
          </mxCell>
        </UserObject>
        <mxCell id="a" value="Inside" vertex="1" parent="g"/>
    </root></mxGraphModel></diagram></mxfile>"#;

    let pipeline = DiagramPipeline::default();
    let result = pipeline.validate_only(xml);
    assert!(result.is_valid, "{:?}", result.errors);
    assert_eq!(result.element_count, 4);

    let outcome = pipeline
        .generate(&GenerationRequest {
            raw_response: serde_json::json!({"xml": xml, "commentary": "grouped"}).to_string(),
            prompt: String::new(),
        })
        .unwrap();
    assert!(!outcome.repaired);
    assert!(outcome.elements.iter().any(|e| e.id == "g" && e.label == "Group"));
    assert!(outcome.elements.iter().any(|e| e.id == "a"));
}

#[test]
fn invariant_config_loads_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"configVersion": "1.0.0", "introspection": {{"simpleMax": 1}}, "envelope": {{"bareMarkupFallback": true}}}}"#
    )
    .unwrap();

    let config = PipelineConfig::load_from_file(file.path()).unwrap();
    assert_eq!(config.introspection.simple_max, 1);
    assert!(config.envelope.bare_markup_fallback);

    let pipeline = DiagramPipeline::new(config).unwrap();
    let outcome = pipeline
        .generate(&GenerationRequest {
            raw_response: "Sure!\n<mxfile><diagram><mxGraphModel><root><mxCell id=\"0\"/><mxCell id=\"1\" parent=\"0\"/></root></mxGraphModel></diagram></mxfile>".to_string(),
            prompt: String::new(),
        })
        .unwrap();
    assert_eq!(outcome.recovery_stage, RecoveryStage::BareMarkup);
    assert_eq!(outcome.commentary, "Sure!");
}

#[test]
fn invariant_missing_config_file_is_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(PipelineConfig::load_from_file(&dir.path().join("absent.json")).is_err());
}

#[test]
fn invariant_engine_version_enforced() {
    let config = PipelineConfig {
        engine_min_version: "42.0.0".to_string(),
        ..PipelineConfig::default()
    };
    let err = DiagramPipeline::new(config).err().unwrap();
    assert!(err.to_string().contains("requires engine >= 42.0.0"));
}

#[cfg(feature = "test-hooks")]
#[test]
fn invariant_repair_attempted_at_most_once() {
    use diagram_exchange::repair::{get_repair_call_count, reset_repair_call_count};

    let pipeline = DiagramPipeline::default();
    let request = |xml: &str| GenerationRequest {
        raw_response: serde_json::json!({"xml": xml, "commentary": "c"}).to_string(),
        prompt: String::new(),
    };

    reset_repair_call_count();
    pipeline.generate(&request(SCENARIO_C)).unwrap();
    assert_eq!(get_repair_call_count(), 1);

    reset_repair_call_count();
    let complete = r#"<mxfile><diagram><mxGraphModel><root><mxCell id="0"/><mxCell id="1" parent="0"/></root></mxGraphModel></diagram></mxfile>"#;
    pipeline.generate(&request(complete)).unwrap();
    assert_eq!(get_repair_call_count(), 0);
}

fn markup_fragment() -> impl Strategy<Value = String> {
    prop::collection::vec(
        prop_oneof![
            Just("<mxfile>".to_string()),
            Just("</mxfile>".to_string()),
            Just("<diagram name=\"p\">".to_string()),
            Just("<mxGraphModel><root>".to_string()),
            Just("</root></mxGraphModel></diagram>".to_string()),
            Just("<mxCell id=\"0\"/>".to_string()),
            Just("<mxCell id=\"1\" parent=\"0\"/>".to_string()),
            Just("<mxCell id=\"v\" value=\"R&D \"x\"\" vertex=\"1\" parent=\"1\">".to_string()),
            Just("<mxGeometry x=\"1\" as=\"geometry\">".to_string()),
            Just("<UserObject id=\"w\" label=\"W\"><mxCell vertex=\"1\" parent=\"1\"/></UserObject>".to_string()),
            Just("<mxCell id=\"e\" edge=\"1\" parent=\"1\" source=\"v\" target=\"q\"/>".to_string()),
            "[a-z &<>\"']{0,8}",
        ],
        0..12,
    )
    .prop_map(|parts| parts.concat())
}

proptest! {
    #[test]
    fn prop_confidence_is_bounded(xml in ".{0,200}", prompt in ".{0,80}") {
        let score = ConfidenceScorer::default().score(&xml, &prompt);
        prop_assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn prop_repair_is_idempotent(xml in markup_fragment()) {
        let engine = RepairEngine::default();
        let once = engine.repair(&xml, None).unwrap();
        let twice = engine.repair(&once, None).unwrap();
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn prop_repair_output_validates(xml in markup_fragment()) {
        let repaired = RepairEngine::default().repair(&xml, None).unwrap();
        prop_assert!(SchemaValidator::default().validate(&repaired).is_valid);
    }

    #[test]
    fn prop_validation_is_deterministic(xml in markup_fragment()) {
        let validator = SchemaValidator::default();
        prop_assert_eq!(validator.validate(&xml), validator.validate(&xml));
    }
}
