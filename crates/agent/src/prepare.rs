//! Prompt preparation: templates, context presets and the size limit.
//!
//! Runs before an interaction lock is taken; failures are reported with
//! `failure_stage = "prepare"`.

use chatcell_core::{Config, ContextPreset, ErrorCode, ErrorRecord, Evidence, StageLog};
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

pub const STAGE_PREPARE: &str = "prepare";

static PLACEHOLDER: OnceLock<Option<Regex>> = OnceLock::new();

fn placeholder() -> Option<&'static Regex> {
    PLACEHOLDER
        .get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.-]+)\s*\}\}").ok())
        .as_ref()
}

#[derive(Debug, Default, Clone)]
pub struct PromptInput<'a> {
    pub prompt: &'a str,
    pub template: Option<&'a str>,
    pub template_vars: Option<&'a HashMap<String, String>>,
    pub context_preset: Option<&'a str>,
}

pub struct PromptPreparer {
    templates: HashMap<String, String>,
    presets: HashMap<String, ContextPreset>,
    max_chars: usize,
    /// Relative preset file paths resolve against this directory.
    base_dir: PathBuf,
}

fn prepare_error(code: ErrorCode, message: String, evidence: Evidence) -> ErrorRecord {
    ErrorRecord::new(code, message)
        .with_evidence(evidence)
        .at_stage(STAGE_PREPARE, &StageLog::new())
}

/// Fill `{{name}}` placeholders from `vars`. Unknown names stay verbatim.
pub fn render_template(template: &str, vars: &HashMap<String, String>) -> String {
    let Some(re) = placeholder() else {
        return template.to_string();
    };
    re.replace_all(template, |caps: &Captures| {
        vars.get(&caps[1])
            .cloned()
            .unwrap_or_else(|| caps[0].to_string())
    })
    .into_owned()
}

impl PromptPreparer {
    pub fn new(
        templates: HashMap<String, String>,
        presets: HashMap<String, ContextPreset>,
        max_chars: usize,
        base_dir: PathBuf,
    ) -> Self {
        Self {
            templates,
            presets,
            max_chars,
            base_dir,
        }
    }

    pub fn from_config(config: &Config, base_dir: PathBuf) -> Self {
        Self::new(
            config.templates.clone(),
            config.context_presets.clone(),
            config.max_context_chars,
            base_dir,
        )
    }

    pub async fn prepare(&self, input: &PromptInput<'_>) -> Result<String, ErrorRecord> {
        let mut prompt = match input.template {
            Some(name) => {
                let template = self.templates.get(name).ok_or_else(|| {
                    let mut ev = Evidence::default();
                    let mut names: Vec<String> = self.templates.keys().cloned().collect();
                    names.sort();
                    ev.available = Some(names);
                    prepare_error(
                        ErrorCode::TemplateNotFound,
                        format!("Unknown template '{}'", name),
                        ev,
                    )
                })?;
                let mut vars = input.template_vars.cloned().unwrap_or_default();
                vars.entry("prompt".to_string())
                    .or_insert_with(|| input.prompt.to_string());
                render_template(template, &vars)
            }
            None => input.prompt.to_string(),
        };

        if let Some(name) = input.context_preset {
            let context = self.build_context(name).await?;
            prompt = format!("{}\n\n{}", context, prompt);
        }

        let size = prompt.chars().count();
        if size > self.max_chars {
            return Err(prepare_error(
                ErrorCode::ContextTooLarge,
                format!(
                    "Prepared prompt is {} characters; the limit is {}",
                    size, self.max_chars
                ),
                Evidence::default(),
            ));
        }
        Ok(prompt)
    }

    fn resolve(&self, file: &str) -> PathBuf {
        let path = Path::new(file);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    async fn build_context(&self, name: &str) -> Result<String, ErrorRecord> {
        let preset = self.presets.get(name).ok_or_else(|| {
            prepare_error(
                ErrorCode::ContextGenerationFailed,
                format!("Unknown context preset '{}'", name),
                Evidence::default(),
            )
        })?;

        let mut out = String::new();
        if let Some(header) = preset.header.as_deref().filter(|h| !h.trim().is_empty()) {
            out.push_str(header.trim_end());
            out.push_str("\n\n");
        }
        for file in &preset.files {
            let path = self.resolve(file);
            let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
                prepare_error(
                    ErrorCode::ContextGenerationFailed,
                    format!("Cannot read context file {}: {}", path.display(), e),
                    Evidence {
                        snippet: Some(file.clone()),
                        ..Default::default()
                    },
                )
            })?;
            out.push_str(&format!("### {}\n```\n{}\n```\n\n", file, content.trim_end()));
        }
        debug!(preset = name, files = preset.files.len(), "Context preset built");
        Ok(out.trim_end().to_string())
    }
}
