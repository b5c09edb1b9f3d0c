//! Prompt Builder - Renders Configured Templates

use serde::{Deserialize, Serialize};

use crate::config::PromptTemplates;

const FILES_PREAMBLE: &str = "The user has provided the following files:\n";

/// A source file the user attached to a generation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInput {
    pub name: String,
    pub content: String,
}

pub struct PromptBuilder {
    templates: PromptTemplates,
}

impl PromptBuilder {
    pub fn new(templates: PromptTemplates) -> Self {
        Self { templates }
    }

    pub fn templates(&self) -> &PromptTemplates {
        &self.templates
    }

    pub fn system_prompt(&self) -> &str {
        &self.templates.system_prompt
    }

    pub fn style_guide(&self) -> &str {
        &self.templates.style_guide
    }

    pub fn initial(&self, files: &[FileInput], context: &str) -> String {
        self.templates
            .initial
            .replace("{{files}}", &format_files(files))
            .replace("{{context}}", context)
    }

    pub fn follow_up(&self, request: &str) -> String {
        self.templates.follow_up.replace("{{follow_up}}", request)
    }

    pub fn correct(&self, xml: &str) -> String {
        self.templates.correct.replace("{{xml}}", xml)
    }

    pub fn verify(&self, xml: &str) -> String {
        self.templates.verify.replace("{{xml}}", xml)
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(PromptTemplates::default())
    }
}

pub fn format_files(files: &[FileInput]) -> String {
    let mut out = String::from(FILES_PREAMBLE);
    for (i, file) in files.iter().enumerate() {
        out.push_str(&format!("File {} ({}):\n{}\n\n", i + 1, file.name, file.content));
    }
    out
}
