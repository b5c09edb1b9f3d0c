//! Exchange Pipeline - Single Entry Point
//!
//! parse -> validate -> (repair once, re-validate) -> introspect + score.
//! Every handler (generation, validate-only, export, analysis) goes through
//! this type so the same validator and repair policy always apply.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::{ConfigError, PipelineConfig};
use crate::convert::{ConversionError, FormatConverter, Notation, Projection};
use crate::document::DiagramDocument;
use crate::envelope::{EnvelopeParser, ParseFailure, RecoveryStage};
use crate::hashing::{compute_content_hash, document_hash};
use crate::introspect::{DiagramInfo, ElementDescriptor, Introspection, Introspector, LayoutSummary};
use crate::markup::MarkupError;
use crate::prompts::PromptBuilder;
use crate::repair::{RepairEngine, RepairError, RepairTier};
use crate::scoring::ConfidenceScorer;
use crate::validation::{SchemaValidator, ValidationError, ValidationResult};
use crate::{ENGINE_VERSION, MIN_CONFIG_VERSION};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Parse(#[from] ParseFailure),

    #[error("Repair failed: {0}")]
    Repair(#[from] RepairError),

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error("Document is not valid: {0}")]
    InvalidDocument(String),

    #[error("Config version {0} requires engine >= {1}, current is {2}")]
    EngineVersionMismatch(String, String, String),

    #[error("Config version {0} is older than the supported minimum {1}")]
    UnsupportedConfigVersion(String, String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Markup(#[from] MarkupError),
}

impl PipelineError {
    /// Stable name of the failing stage, for logs and error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Parse(_) => "parse_failure",
            PipelineError::Repair(_) => "repair_failure",
            PipelineError::Conversion(ConversionError::Unsupported(_)) => "conversion_unsupported",
            PipelineError::Conversion(ConversionError::Markup(_)) => "conversion_failure",
            PipelineError::InvalidDocument(_) => "invalid_document",
            PipelineError::EngineVersionMismatch(..) => "engine_version_mismatch",
            PipelineError::UnsupportedConfigVersion(..) => "unsupported_config_version",
            PipelineError::Config(_) => "config_error",
            PipelineError::Serialization(_) => "serialization_error",
            PipelineError::Markup(_) => "markup_error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    /// Raw completion text returned by the generative model.
    pub raw_response: String,
    /// The user prompt the completion answers, used for scoring.
    #[serde(default)]
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationOutcome {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub engine_version: String,
    pub xml: String,
    pub commentary: String,
    pub elements: Vec<ElementDescriptor>,
    pub layout: LayoutSummary,
    pub suggestions: Vec<String>,
    pub confidence: f64,
    pub element_count: usize,
    pub recovery_stage: RecoveryStage,
    pub repaired: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repair_tier: Option<RepairTier>,
    pub initial_errors: Vec<ValidationError>,
    pub document_hash: String,
    pub content_hash: String,
}

/// Deterministic part of an outcome, hashed into `contentHash`.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutcomeContent<'a> {
    xml: &'a str,
    commentary: &'a str,
    elements: &'a [ElementDescriptor],
    layout: &'a LayoutSummary,
    suggestions: &'a [String],
    confidence: f64,
}

/// Response of the validate-only handler.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<ValidationError>,
    pub element_count: usize,
    #[serde(rename = "correctedXML", skip_serializing_if = "Option::is_none")]
    pub corrected_xml: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    #[serde(flatten)]
    pub introspection: Introspection,
    pub info: DiagramInfo,
    pub text: String,
    pub repaired: bool,
}

/// A valid document together with the text it was read from.
struct Checked {
    xml: String,
    document: DiagramDocument,
    repaired: bool,
    tier: Option<RepairTier>,
}

pub struct DiagramPipeline {
    config: PipelineConfig,
    parser: EnvelopeParser,
    validator: SchemaValidator,
    repairer: RepairEngine,
    introspector: Introspector,
    scorer: ConfidenceScorer,
    converter: FormatConverter,
    prompts: PromptBuilder,
}

impl DiagramPipeline {
    /// Build a pipeline, refusing configurations this engine cannot honor.
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        check_engine_version(&config)?;
        Ok(Self::assemble(config))
    }

    fn assemble(config: PipelineConfig) -> Self {
        Self {
            parser: EnvelopeParser::new(&config.envelope),
            validator: SchemaValidator::new(&config.validation),
            repairer: RepairEngine::new(&config.validation),
            introspector: Introspector::new(config.introspection.clone()),
            scorer: ConfidenceScorer::new(config.scoring.clone()),
            converter: FormatConverter::new(),
            prompts: PromptBuilder::new(config.prompts.clone()),
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn prompts(&self) -> &PromptBuilder {
        &self.prompts
    }

    /// Full generation handler: envelope, validation, at most one repair,
    /// then introspection and scoring of the final document.
    pub fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutcome, PipelineError> {
        let recovered = self.parser.recover(&request.raw_response)?;
        debug!(stage:? = recovered.stage; "envelope parsed");

        let initial = self.validator.validate(&recovered.envelope.xml);
        let initial_errors = initial.errors.clone();
        let checked = self.settle(&recovered.envelope.xml, initial)?;

        let introspection = self.introspector.introspect(&checked.document);
        let confidence = self.scorer.score(&checked.xml, &request.prompt);

        let content_hash = compute_content_hash(
            &OutcomeContent {
                xml: &checked.xml,
                commentary: &recovered.envelope.commentary,
                elements: &introspection.elements,
                layout: &introspection.layout,
                suggestions: &introspection.suggestions,
                confidence,
            },
            ENGINE_VERSION,
        )?;

        let outcome = GenerationOutcome {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            engine_version: ENGINE_VERSION.to_string(),
            document_hash: document_hash(&checked.xml),
            content_hash,
            element_count: checked.document.element_count(),
            xml: checked.xml,
            commentary: recovered.envelope.commentary,
            elements: introspection.elements,
            layout: introspection.layout,
            suggestions: introspection.suggestions,
            confidence,
            recovery_stage: recovered.stage,
            repaired: checked.repaired,
            repair_tier: checked.tier,
            initial_errors,
        };

        info!(
            id = outcome.id.as_str(),
            repaired = outcome.repaired,
            confidence = outcome.confidence;
            "diagram generated"
        );
        Ok(outcome)
    }

    /// Validate-only handler. The report describes `xml` as given; a
    /// corrected document is attached when one repair attempt succeeds.
    pub fn validate_only(&self, xml: &str) -> ValidationReport {
        let result = self.validator.validate(xml);

        let corrected_xml = if result.is_valid {
            result.normalized_xml.clone()
        } else {
            match self.repairer.repair(xml, result.best_effort.as_ref()) {
                Ok(corrected) => Some(corrected),
                Err(err) => {
                    warn!(err:% = err; "document could not be corrected");
                    None
                }
            }
        };

        ValidationReport {
            is_valid: result.is_valid,
            errors: result.errors,
            element_count: result.element_count,
            corrected_xml,
        }
    }

    /// Export handler. The document must already be valid.
    pub fn project(&self, xml: &str, target: Notation) -> Result<Projection, PipelineError> {
        let result = self.validator.validate(xml);
        if !result.is_valid {
            return Err(PipelineError::InvalidDocument(describe(&result)));
        }

        let Some(document) = result.document else {
            return Err(PipelineError::InvalidDocument("no document".to_string()));
        };
        if target == Notation::Native {
            return Ok(Projection::Native(
                result.normalized_xml.unwrap_or_else(|| xml.to_string()),
            ));
        }
        Ok(self.converter.project(&document, target)?)
    }

    /// Introspection of the best available document for `xml`.
    pub fn analyze(&self, xml: &str) -> Result<Analysis, PipelineError> {
        let initial = self.validator.validate(xml);
        let checked = self.settle(xml, initial)?;

        Ok(Analysis {
            introspection: self.introspector.introspect(&checked.document),
            info: self.introspector.diagram_info(&checked.document),
            text: self.introspector.extract_text(&checked.document),
            repaired: checked.repaired,
        })
    }

    pub fn score(&self, xml: &str, prompt: &str) -> f64 {
        self.scorer.score(xml, prompt)
    }

    /// Turn a validation result into a valid document, repairing at most
    /// once.
    fn settle(&self, xml: &str, initial: ValidationResult) -> Result<Checked, PipelineError> {
        if initial.is_valid {
            let repaired = initial.normalized_xml.is_some();
            let document = initial
                .document
                .ok_or_else(|| PipelineError::InvalidDocument("no document".to_string()))?;
            return Ok(Checked {
                xml: initial.normalized_xml.unwrap_or_else(|| xml.to_string()),
                document,
                repaired,
                tier: repaired.then_some(RepairTier::Normalization),
            });
        }

        warn!(errors:? = initial.error_kinds(); "document invalid, attempting repair");
        let repaired = self.repairer.repair_detailed(xml, initial.best_effort.as_ref())?;

        let check = self.validator.validate(&repaired.xml);
        match check.document {
            Some(document) if check.is_valid => Ok(Checked {
                xml: repaired.xml,
                document,
                repaired: true,
                tier: Some(repaired.tier),
            }),
            _ => Err(PipelineError::Repair(RepairError::StillInvalid(describe(&check)))),
        }
    }
}

impl Default for DiagramPipeline {
    fn default() -> Self {
        Self::assemble(PipelineConfig::default())
    }
}

fn describe(result: &ValidationResult) -> String {
    result
        .errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn parse_version(text: &str) -> Result<semver::Version, ConfigError> {
    semver::Version::parse(text).map_err(|_| ConfigError::InvalidVersion(text.to_string()))
}

pub fn check_engine_version(config: &PipelineConfig) -> Result<(), PipelineError> {
    let engine_ver = parse_version(ENGINE_VERSION)?;
    let min_ver = parse_version(&config.engine_min_version)?;

    if engine_ver < min_ver {
        return Err(PipelineError::EngineVersionMismatch(
            config.config_version.clone(),
            config.engine_min_version.clone(),
            ENGINE_VERSION.to_string(),
        ));
    }

    let config_ver = parse_version(&config.config_version)?;
    if config_ver < parse_version(MIN_CONFIG_VERSION)? {
        return Err(PipelineError::UnsupportedConfigVersion(
            config.config_version.clone(),
            MIN_CONFIG_VERSION.to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::ErrorKind;

    const VALID: &str = r#"<mxfile><diagram name="P"><mxGraphModel><root><mxCell id="0"/><mxCell id="1" parent="0"/><mxCell id="2" value="Checkout Service" style="rounded=1;" vertex="1" parent="1"><mxGeometry x="40" y="40" width="120" height="60" as="geometry"/></mxCell></root></mxGraphModel></diagram></mxfile>"#;

    fn envelope(xml: &str) -> String {
        serde_json::json!({"xml": xml, "commentary": "here it is"}).to_string()
    }

    fn request(xml: &str) -> GenerationRequest {
        GenerationRequest {
            raw_response: envelope(xml),
            prompt: "checkout service".to_string(),
        }
    }

    #[test]
    fn test_valid_generation() {
        let outcome = DiagramPipeline::default().generate(&request(VALID)).unwrap();
        assert_eq!(outcome.xml, VALID);
        assert!(!outcome.repaired);
        assert!(outcome.initial_errors.is_empty());
        assert_eq!(outcome.elements.len(), 1);
        assert_eq!(outcome.confidence, 1.0);
        assert_eq!(outcome.recovery_stage, RecoveryStage::Direct);
        assert_eq!(outcome.document_hash, document_hash(VALID));
    }

    #[test]
    fn test_invalid_document_is_repaired_once() {
        let broken = "<mxfile><diagram><mxGraphModel><root><mxCell id=\"0\"/></root></mxGraphModel></diagram></mxfile>";
        let outcome = DiagramPipeline::default().generate(&request(broken)).unwrap();
        assert!(outcome.repaired);
        assert_eq!(outcome.repair_tier, Some(RepairTier::Reconstruction));
        assert_eq!(outcome.initial_errors[0].kind, ErrorKind::MissingDefaultCells);
        assert!(DiagramPipeline::default().validate_only(&outcome.xml).is_valid);
    }

    #[test]
    fn test_content_hash_is_stable_across_runs() {
        let pipeline = DiagramPipeline::default();
        let a = pipeline.generate(&request(VALID)).unwrap();
        let b = pipeline.generate(&request(VALID)).unwrap();
        assert_eq!(a.content_hash, b.content_hash);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_parse_failure_kind() {
        let err = DiagramPipeline::default()
            .generate(&GenerationRequest {
                raw_response: "no json here".to_string(),
                prompt: String::new(),
            })
            .unwrap_err();
        assert_eq!(err.kind(), "parse_failure");
    }

    #[test]
    fn test_validate_only_report() {
        let pipeline = DiagramPipeline::default();
        let report = pipeline.validate_only(VALID);
        assert!(report.is_valid);
        assert!(report.corrected_xml.is_none());

        let report = pipeline.validate_only("<mxfile/>");
        assert!(!report.is_valid);
        assert_eq!(report.errors[0].kind, ErrorKind::MissingDiagram);
        let corrected = report.corrected_xml.unwrap();
        assert!(pipeline.validate_only(&corrected).is_valid);

        let json = serde_json::to_value(pipeline.validate_only("<mxfile/>")).unwrap();
        assert!(json.get("correctedXML").is_some());
        assert_eq!(json["isValid"], false);
    }

    #[test]
    fn test_project_requires_valid_document() {
        let pipeline = DiagramPipeline::default();
        let err = pipeline.project("<mxfile/>", Notation::Mermaid).unwrap_err();
        assert_eq!(err.kind(), "invalid_document");

        let projection = pipeline.project(VALID, Notation::Mermaid).unwrap();
        assert_eq!(
            projection,
            Projection::Mermaid("graph TD\n    2[\"Checkout Service\"]\n".to_string())
        );
        assert_eq!(pipeline.project(VALID, Notation::Native).unwrap().text(), VALID);
    }

    #[test]
    fn test_analyze() {
        let analysis = DiagramPipeline::default().analyze(VALID).unwrap();
        assert_eq!(analysis.info.title.as_deref(), Some("P"));
        assert_eq!(analysis.text, "Checkout Service");
        assert_eq!(analysis.introspection.layout.width, 360.0);
        assert!(!analysis.repaired);
    }

    #[test]
    fn test_version_gates() {
        let newer_engine = PipelineConfig {
            engine_min_version: "99.0.0".to_string(),
            ..PipelineConfig::default()
        };
        let err = DiagramPipeline::new(newer_engine).err().unwrap();
        assert_eq!(err.kind(), "engine_version_mismatch");

        let old_config = PipelineConfig {
            config_version: "0.9.0".to_string(),
            ..PipelineConfig::default()
        };
        assert_eq!(
            DiagramPipeline::new(old_config).err().unwrap().kind(),
            "unsupported_config_version"
        );

        let garbage = PipelineConfig {
            config_version: "one".to_string(),
            ..PipelineConfig::default()
        };
        assert_eq!(DiagramPipeline::new(garbage).err().unwrap().kind(), "config_error");
        assert!(DiagramPipeline::new(PipelineConfig::default()).is_ok());
    }
}
