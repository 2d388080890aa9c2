//! External response generator.
//!
//! The generator is opaque: prompt in, text out, and it may fail or hang.
//! `ProcessGenerator` runs a local inference script as a child process and
//! reads its stdout. Callers bound the call with a timeout; the child is
//! killed if the future is dropped.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

/// Longest stderr excerpt carried in an error.
const MAX_STDERR_BYTES: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("generation failed: {0}")]
    Failed(String),
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),
    #[error("generator setup invalid: {0}")]
    Setup(String),
}

/// Produces a response text for a prompt.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError>;

    /// Check the generator can run at all. Called once before the service starts.
    fn validate(&self) -> Result<(), GenerationError> {
        Ok(())
    }
}

/// `[generator]` configuration table.
#[derive(Debug, Clone, Deserialize)]
pub struct GeneratorConfig {
    /// Executable to run (interpreter or binary).
    #[serde(default = "default_program")]
    pub program: String,
    /// Leading arguments, typically the inference script.
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    /// Directory the generator runs in. Empty means the agent's cwd.
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    /// Model file passed with `-m`. Empty lets the script choose.
    #[serde(default)]
    pub model_path: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_threads")]
    pub threads: u32,
    #[serde(default = "default_ctx_size")]
    pub ctx_size: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Pass `-cnv` for chat-tuned models.
    #[serde(default)]
    pub conversation: bool,
}

fn default_program() -> String {
    "python3".into()
}
fn default_args() -> Vec<String> {
    vec!["run_inference.py".into()]
}
fn default_working_dir() -> PathBuf {
    PathBuf::from("../BitNet")
}
fn default_max_tokens() -> u32 {
    128
}
fn default_threads() -> u32 {
    2
}
fn default_ctx_size() -> u32 {
    2048
}
fn default_temperature() -> f32 {
    0.8
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            working_dir: default_working_dir(),
            model_path: String::new(),
            max_tokens: default_max_tokens(),
            threads: default_threads(),
            ctx_size: default_ctx_size(),
            temperature: default_temperature(),
            conversation: false,
        }
    }
}

/// Runs the configured program once per prompt.
#[derive(Debug, Clone)]
pub struct ProcessGenerator {
    config: GeneratorConfig,
}

impl ProcessGenerator {
    pub fn new(config: GeneratorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    /// Check that the working directory, script and model exist.
    pub fn check_setup(&self) -> Result<(), GenerationError> {
        let dir = &self.config.working_dir;
        if !dir.as_os_str().is_empty() && !dir.is_dir() {
            return Err(GenerationError::Setup(format!(
                "working directory {} not found",
                dir.display()
            )));
        }

        if let Some(script) = self.config.args.first().filter(|a| !a.starts_with('-')) {
            let path = self.resolve(script);
            if !path.is_file() {
                return Err(GenerationError::Setup(format!(
                    "script {} not found",
                    path.display()
                )));
            }
        }

        if !self.config.model_path.is_empty() {
            let path = self.resolve(&self.config.model_path);
            if !path.exists() {
                return Err(GenerationError::Setup(format!(
                    "model {} not found",
                    path.display()
                )));
            }
        }

        tracing::info!(
            program = %self.config.program,
            dir = %dir.display(),
            "generator setup validated"
        );
        Ok(())
    }

    fn resolve(&self, relative: &str) -> PathBuf {
        let path = Path::new(relative);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config.working_dir.join(path)
        }
    }

    /// Arguments appended after `args` for one prompt.
    pub fn prompt_args(&self, prompt: &str) -> Vec<String> {
        let c = &self.config;
        let mut args = vec![
            "-p".to_string(),
            prompt.to_string(),
            "-n".to_string(),
            c.max_tokens.to_string(),
            "-t".to_string(),
            c.threads.to_string(),
            "-c".to_string(),
            c.ctx_size.to_string(),
            "-temp".to_string(),
            c.temperature.to_string(),
        ];
        if !c.model_path.is_empty() {
            args.push("-m".to_string());
            args.push(c.model_path.clone());
        }
        if c.conversation {
            args.push("-cnv".to_string());
        }
        args
    }
}

#[async_trait]
impl ResponseGenerator for ProcessGenerator {
    fn validate(&self) -> Result<(), GenerationError> {
        self.check_setup()
    }

    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .args(self.prompt_args(prompt))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if !self.config.working_dir.as_os_str().is_empty() {
            command.current_dir(&self.config.working_dir);
        }

        let started = tokio::time::Instant::now();
        let output = command.output().await.map_err(|e| {
            GenerationError::Failed(format!("failed to run {}: {e}", self.config.program))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let mut excerpt = stderr.trim().to_string();
            if excerpt.len() > MAX_STDERR_BYTES {
                let mut cut = MAX_STDERR_BYTES;
                while !excerpt.is_char_boundary(cut) {
                    cut -= 1;
                }
                excerpt.truncate(cut);
            }
            return Err(GenerationError::Failed(format!(
                "exit status {:?}: {excerpt}",
                output.status.code()
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if text.is_empty() {
            return Err(GenerationError::Failed("empty output".into()));
        }

        tracing::debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            chars = text.len(),
            "generator finished"
        );
        Ok(text)
    }
}
