//! Instruction resolution for agent system prompts.
//!
//! Effective instruction text resolves in priority order: inline override,
//! template file, auto-derived filename from the agent name (convention
//! `UPPER_SNAKE.md`). File-based sources render with strict-undefined
//! semantics: an unresolved `{{placeholder}}` is an error, not silence.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Environment variable overriding the prompts root directory.
pub const PROMPTS_DIR_ENV: &str = "AFK_AGENT_PROMPTS_DIR";
/// Default prompts root, relative to the working directory.
pub const DEFAULT_PROMPTS_DIR: &str = ".agents/prompt";

/// Where an agent's instructions come from.
#[derive(Debug, Clone, PartialEq)]
pub enum InstructionSource {
    /// Literal instruction text, used verbatim.
    Inline(String),
    /// Template file under the prompts root, rendered with the run context.
    TemplateFile {
        /// Path, absolute or relative to the prompts root.
        path: PathBuf,
        /// Extra render context merged under the run context.
        context: Map<String, Value>,
    },
    /// Load `UPPER_SNAKE.md` derived from the agent name.
    Auto,
}

impl Default for InstructionSource {
    fn default() -> Self {
        Self::Inline(String::new())
    }
}

/// Convert an agent name into its deterministic prompt filename.
///
/// `ChatAgent` → `CHAT_AGENT.md`; a lowercase `agent` suffix such as
/// `chatagent` also splits to `CHAT_AGENT.md`.
pub fn derive_auto_prompt_filename(agent_name: &str) -> Result<String> {
    let value = agent_name.trim();
    if value.is_empty() {
        return Err(Error::instruction(
            "agent name must be non-empty for auto prompt loading",
        ));
    }

    // Split camel/pascal boundaries first.
    let mut normalized = String::with_capacity(value.len() + 4);
    let chars: Vec<char> = value.chars().collect();
    for (index, ch) in chars.iter().enumerate() {
        if index > 0
            && ch.is_ascii_uppercase()
            && chars[index - 1].is_ascii_alphanumeric()
            && !chars[index - 1].is_ascii_uppercase()
        {
            normalized.push('_');
        }
        normalized.push(*ch);
    }

    // Special-case lowercase *agent suffixes such as `chatagent`.
    let lowered = normalized.to_ascii_lowercase();
    if lowered.ends_with("agent") && !lowered.ends_with("_agent") {
        let split = normalized.len() - 5;
        let prefix = &normalized[..split];
        if prefix
            .chars()
            .last()
            .is_some_and(|ch| ch.is_ascii_alphanumeric())
        {
            normalized = format!("{prefix}_agent");
        }
    }

    let mut collapsed = String::with_capacity(normalized.len());
    let mut last_was_underscore = false;
    for ch in normalized.chars() {
        if ch.is_ascii_alphanumeric() {
            collapsed.push(ch);
            last_was_underscore = false;
        } else if !last_was_underscore {
            collapsed.push('_');
            last_was_underscore = true;
        }
    }
    let collapsed = collapsed.trim_matches('_');
    if collapsed.is_empty() {
        return Err(Error::instruction(format!(
            "unable to derive auto prompt filename from agent name '{agent_name}'"
        )));
    }
    Ok(format!("{}.md", collapsed.to_uppercase()))
}

/// Render a template with strict-undefined semantics.
///
/// `{{ key }}` placeholders are replaced from `context` (strings verbatim,
/// other values as JSON). Unknown keys and unterminated placeholders are
/// errors.
pub fn render_template(template: &str, context: &Map<String, Value>) -> Result<String> {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        output.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            return Err(Error::instruction("unterminated '{{' placeholder"));
        };
        let key = after_open[..close].trim();
        let value = context.get(key).ok_or_else(|| {
            Error::instruction(format!("unresolved template placeholder '{key}'"))
        })?;
        match value {
            Value::String(text) => output.push_str(text),
            other => output.push_str(&other.to_string()),
        }
        rest = &after_open[close + 2..];
    }
    output.push_str(rest);
    Ok(output)
}

/// Loads prompt files from a root-constrained directory.
#[derive(Debug, Clone)]
pub struct InstructionStore {
    root: PathBuf,
}

impl InstructionStore {
    /// Resolve the effective prompts root: explicit argument, the
    /// `AFK_AGENT_PROMPTS_DIR` environment variable, then the default.
    pub fn new(prompts_dir: Option<PathBuf>) -> Result<Self> {
        let source = match prompts_dir {
            Some(dir) => dir,
            None => match std::env::var(PROMPTS_DIR_ENV) {
                Ok(raw) => {
                    let trimmed = raw.trim();
                    if trimmed.is_empty() {
                        return Err(Error::instruction(format!(
                            "environment variable {PROMPTS_DIR_ENV} is set but empty"
                        )));
                    }
                    PathBuf::from(trimmed)
                }
                Err(_) => PathBuf::from(DEFAULT_PROMPTS_DIR),
            },
        };

        let root = if source.is_absolute() {
            source
        } else {
            std::env::current_dir()
                .map_err(|e| Error::instruction(format!("cannot resolve working directory: {e}")))?
                .join(source)
        };
        if root.exists() && !root.is_dir() {
            return Err(Error::instruction(format!(
                "prompts_dir is not a directory: {}",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    /// The resolved prompts root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Load a prompt file, absolute or relative to the root. Paths that
    /// escape the root are rejected.
    pub fn load_file(&self, file: &Path) -> Result<String> {
        let target = if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.root.join(file)
        };
        let resolved = target.canonicalize().map_err(|_| {
            Error::instruction(format!("prompt file not found: {}", target.display()))
        })?;
        let root = self.root.canonicalize().map_err(|_| {
            Error::instruction(format!(
                "prompts root does not exist: {}",
                self.root.display()
            ))
        })?;
        if !resolved.starts_with(&root) {
            return Err(Error::instruction(format!(
                "prompt path escapes configured prompts root (path='{}', root='{}')",
                resolved.display(),
                root.display()
            )));
        }
        std::fs::read_to_string(&resolved)
            .map_err(|e| Error::instruction(format!("cannot read prompt file: {e}")))
    }

    /// Load the auto-derived prompt file for an agent name.
    pub fn load_auto(&self, agent_name: &str) -> Result<String> {
        let filename = derive_auto_prompt_filename(agent_name)?;
        self.load_file(Path::new(&filename))
    }
}
