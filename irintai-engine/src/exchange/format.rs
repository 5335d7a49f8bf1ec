//! Prompt templates

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Turns user input into the text written to the engine.
///
/// The result is sent as a single line, so implementations should not
/// introduce newlines of their own.
pub trait PromptFormatter: Send + Sync {
    fn format(&self, prompt: &str) -> String;
}

impl<F> PromptFormatter for F
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn format(&self, prompt: &str) -> String {
        self(prompt)
    }
}

/// Template families, guessed from the model name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptFormat {
    #[default]
    Default,
    #[serde(rename = "chatml")]
    ChatMl,
    Llama,
    Coder,
}

impl PromptFormat {
    pub fn for_model(model: &str) -> Self {
        let name = model.to_lowercase();
        let has = |keys: &[&str]| keys.iter().any(|k| name.contains(k));

        if has(&["gpt", "claude", "chatgpt", "deepseek"]) {
            PromptFormat::ChatMl
        } else if has(&["llama", "mistral", "mixtral", "alpaca"]) {
            PromptFormat::Llama
        } else if has(&["starcoder", "codellama"]) {
            PromptFormat::Coder
        } else {
            PromptFormat::Default
        }
    }
}

impl PromptFormatter for PromptFormat {
    fn format(&self, prompt: &str) -> String {
        let prompt = prompt.trim();
        match self {
            PromptFormat::Default => format!("User: {prompt} Assistant:"),
            PromptFormat::ChatMl => {
                format!("<|im_start|>user {prompt}<|im_end|> <|im_start|>assistant")
            }
            PromptFormat::Llama => format!("<|user|> {prompt} <|assistant|>"),
            PromptFormat::Coder => format!("[INST] {prompt} [/INST]"),
        }
    }
}

impl fmt::Display for PromptFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PromptFormat::Default => "default",
            PromptFormat::ChatMl => "chatml",
            PromptFormat::Llama => "llama",
            PromptFormat::Coder => "coder",
        };
        f.write_str(name)
    }
}

impl FromStr for PromptFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "default" => Ok(PromptFormat::Default),
            "chatml" => Ok(PromptFormat::ChatMl),
            "llama" => Ok(PromptFormat::Llama),
            "coder" => Ok(PromptFormat::Coder),
            other => Err(format!(
                "unknown prompt format '{other}' (expected default, chatml, llama or coder)"
            )),
        }
    }
}
