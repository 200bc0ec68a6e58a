//! Chat templates.
//!
//! Models ship their prompt format as template source. Rather than run a
//! template engine, the source is fingerprinted into one of the families
//! below and rendered natively.

use serde::{Deserialize, Serialize};

use crate::{TokenizerError, TokenizerResult};

/// One role-tagged message to render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// Supported prompt formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChatTemplate {
    /// `<|im_start|>role ... <|im_end|>` (Qwen, Hermes, SmolLM).
    #[default]
    ChatMl,
    /// `<|start_header_id|>role<|end_header_id|>` (Llama 3).
    Llama3,
    /// `<|role|> ... </s>` (Zephyr, TinyLlama chat).
    Zephyr,
}

impl ChatTemplate {
    /// Identify the family a template source belongs to.
    pub fn detect(source: &str) -> TokenizerResult<Self> {
        if source.contains("<|im_start|>") {
            Ok(ChatTemplate::ChatMl)
        } else if source.contains("<|start_header_id|>") {
            Ok(ChatTemplate::Llama3)
        } else if source.contains("<|user|>") {
            Ok(ChatTemplate::Zephyr)
        } else {
            let preview: String = source.chars().take(40).collect();
            Err(TokenizerError::UnknownTemplate(preview))
        }
    }

    /// Render `turns` into a single prompt. With `add_generation_prompt` the
    /// output ends with the opening of an assistant turn.
    pub fn render(&self, turns: &[ChatTurn], add_generation_prompt: bool) -> String {
        let mut out = String::new();
        for turn in turns {
            self.push_turn(&mut out, turn);
        }
        if add_generation_prompt {
            self.push_generation_prompt(&mut out);
        }
        out
    }

    fn push_turn(&self, out: &mut String, turn: &ChatTurn) {
        match self {
            ChatTemplate::ChatMl => {
                out.push_str("<|im_start|>");
                out.push_str(&turn.role);
                out.push('\n');
                out.push_str(&turn.content);
                out.push_str("<|im_end|>\n");
            }
            ChatTemplate::Llama3 => {
                out.push_str("<|start_header_id|>");
                out.push_str(&turn.role);
                out.push_str("<|end_header_id|>\n\n");
                out.push_str(&turn.content);
                out.push_str("<|eot_id|>");
            }
            ChatTemplate::Zephyr => {
                out.push_str("<|");
                out.push_str(&turn.role);
                out.push_str("|>\n");
                out.push_str(&turn.content);
                out.push_str("</s>\n");
            }
        }
    }

    fn push_generation_prompt(&self, out: &mut String) {
        match self {
            ChatTemplate::ChatMl => out.push_str("<|im_start|>assistant\n"),
            ChatTemplate::Llama3 => {
                out.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n")
            }
            ChatTemplate::Zephyr => out.push_str("<|assistant|>\n"),
        }
    }
}
