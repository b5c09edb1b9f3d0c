//! Diagram Exchange CLI - Bridge interface for request handlers
//!
//! Commands: generate, validate, convert, analyze, prompt, config
//! Outputs JSON to stdout, logs to stderr
//! Returns 2 on validation or pipeline failure, 1 on usage or IO errors

use clap::{Parser, Subcommand};
use log::{debug, error, info, LevelFilter};
use serde::Serialize;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;

use diagram_exchange::{
    DiagramPipeline, FileInput, GenerationRequest, Notation, PipelineConfig, PipelineError,
};

#[derive(Parser, Debug)]
#[command(name = "diagram-exchange-cli")]
#[command(about = "Diagram Exchange CLI - recover, validate and describe generated diagrams")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a pipeline configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the full pipeline over a raw model response
    Generate {
        /// File holding the raw response, or - for stdin
        #[arg(short, long, default_value = "-")]
        input: String,

        /// Prompt the response answers, used for scoring
        #[arg(short, long, default_value = "")]
        prompt: String,
    },

    /// Validate a document, attaching a corrected version when possible
    Validate {
        /// Document file, or - for stdin
        #[arg(short, long, default_value = "-")]
        xml: String,
    },

    /// Project a valid document into another notation
    Convert {
        /// Document file, or - for stdin
        #[arg(short, long, default_value = "-")]
        xml: String,

        /// Target notation (mermaid, plantuml, native)
        #[arg(short, long)]
        target: String,
    },

    /// Describe the elements, layout and page of a document
    Analyze {
        /// Document file, or - for stdin
        #[arg(short, long, default_value = "-")]
        xml: String,
    },

    /// Render the configured prompts
    Prompt {
        /// Additional context for the initial prompt
        #[arg(long, default_value = "")]
        context: String,

        /// Follow-up request to render
        #[arg(long)]
        follow_up: Option<String>,

        /// Source files to attach
        files: Vec<PathBuf>,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RenderedPrompts {
    system_prompt: String,
    style_guide: String,
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    follow_up: Option<String>,
}

fn read_source(source: &str) -> std::io::Result<String> {
    if source == "-" {
        let mut buffer = String::new();
        std::io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        fs::read_to_string(source)
    }
}

fn print_json<T: Serialize>(value: &T) -> bool {
    match serde_json::to_string_pretty(value) {
        Ok(text) => {
            println!("{}", text);
            true
        }
        Err(e) => {
            eprintln!(r#"{{"error": "Failed to serialize output: {}"}}"#, e);
            false
        }
    }
}

fn emit<T: Serialize>(value: &T, code: ExitCode) -> ExitCode {
    if print_json(value) {
        code
    } else {
        ExitCode::FAILURE
    }
}

fn fail(err: &PipelineError) -> ExitCode {
    error!(kind = err.kind(), err:% = err; "pipeline failed");
    let output = serde_json::json!({
        "success": false,
        "kind": err.kind(),
        "error": err.to_string(),
    });
    emit(&output, ExitCode::from(2))
}

fn io_failure(what: &str, e: impl std::fmt::Display) -> ExitCode {
    eprintln!("{}", serde_json::json!({ "error": format!("{}: {}", what, e) }));
    ExitCode::FAILURE
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig, diagram_exchange::ConfigError> {
    match path {
        Some(path) => {
            info!(path = path.display().to_string(); "loading configuration");
            PipelineConfig::load_from_file(path)
        }
        None => Ok(PipelineConfig::default()),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = LevelFilter::from_str(&cli.log_level).unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', falling back to warn", cli.log_level);
        LevelFilter::Warn
    });
    env_logger::Builder::from_env(env_logger::Env::default())
        .filter_level(log_level)
        .init();
    debug!(args:? = cli; "parsed arguments");

    let config = match load_config(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => return io_failure("Failed to load config", e),
    };

    let pipeline = match DiagramPipeline::new(config) {
        Ok(p) => p,
        Err(e) => return fail(&e),
    };

    match cli.command {
        Commands::Generate { input, prompt } => {
            let raw_response = match read_source(&input) {
                Ok(text) => text,
                Err(e) => return io_failure("Failed to read input", e),
            };

            match pipeline.generate(&GenerationRequest { raw_response, prompt }) {
                Ok(outcome) => {
                    let output = serde_json::json!({
                        "success": true,
                        "outcome": outcome,
                    });
                    emit(&output, ExitCode::SUCCESS)
                }
                Err(e) => fail(&e),
            }
        }

        Commands::Validate { xml } => {
            let text = match read_source(&xml) {
                Ok(text) => text,
                Err(e) => return io_failure("Failed to read document", e),
            };

            let report = pipeline.validate_only(&text);
            let code = if report.is_valid {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)  // Validation failure
            };
            emit(&report, code)
        }

        Commands::Convert { xml, target } => {
            let notation = match Notation::from_str(&target) {
                Ok(n) => n,
                Err(e) => return fail(&PipelineError::from(e)),
            };
            let text = match read_source(&xml) {
                Ok(text) => text,
                Err(e) => return io_failure("Failed to read document", e),
            };

            match pipeline.project(&text, notation) {
                Ok(projection) => emit(&projection, ExitCode::SUCCESS),
                Err(e) => fail(&e),
            }
        }

        Commands::Analyze { xml } => {
            let text = match read_source(&xml) {
                Ok(text) => text,
                Err(e) => return io_failure("Failed to read document", e),
            };

            match pipeline.analyze(&text) {
                Ok(analysis) => emit(&analysis, ExitCode::SUCCESS),
                Err(e) => fail(&e),
            }
        }

        Commands::Prompt { context, follow_up, files } => {
            let mut inputs = Vec::with_capacity(files.len());
            for path in &files {
                match fs::read_to_string(path) {
                    Ok(content) => inputs.push(FileInput {
                        name: path.display().to_string(),
                        content,
                    }),
                    Err(e) => return io_failure("Failed to read file", e),
                }
            }

            let prompts = pipeline.prompts();
            let rendered = RenderedPrompts {
                system_prompt: prompts.system_prompt().to_string(),
                style_guide: prompts.style_guide().to_string(),
                prompt: prompts.initial(&inputs, &context),
                follow_up: follow_up.as_deref().map(|f| prompts.follow_up(f)),
            };
            emit(&rendered, ExitCode::SUCCESS)
        }

        Commands::Config => emit(pipeline.config(), ExitCode::SUCCESS),
    }
}
