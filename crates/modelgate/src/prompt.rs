//! Chat prompt rendering.
//!
//! Turns a new user prompt plus the prior conversation into the exact text a
//! completion backend receives. The algorithm is the same for every style:
//! a preamble, then one segment per turn (history, the new user turn, and an
//! empty assistant turn that primes the backend). Styles only differ in how
//! the preamble and each segment are formatted.

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StyleName {
    #[serde(rename = "ADD_COLON_SINGLE")]
    AddColonSingle,
    #[serde(rename = "ADD_COLON_TWO")]
    AddColonTwo,
    #[serde(rename = "NO_COLON_TWO")]
    NoColonTwo,
    #[serde(rename = "LLAMA2")]
    Llama2,
    #[serde(rename = "CHATML")]
    ChatMl,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptStyle {
    pub style_name: StyleName,
    #[serde(default)]
    pub system_prompt: String,
    pub roles: Vec<String>,
    #[serde(default)]
    pub intra_message_sep: String,
    #[serde(default)]
    pub inter_message_sep: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_token_ids: Option<Vec<u32>>,
}

impl PromptStyle {
    /// Rejects styles that do not carry exactly a user and an assistant role.
    pub fn validate(&self) -> Result<()> {
        if self.roles.len() != 2 {
            return Err(OrchestratorError::InvalidSpec(format!(
                "prompt style {:?} must define exactly two roles, got {}",
                self.style_name,
                self.roles.len()
            )));
        }
        Ok(())
    }

    pub fn user_role(&self) -> &str {
        &self.roles[0]
    }

    pub fn assistant_role(&self) -> &str {
        &self.roles[1]
    }

    /// Separator closing a turn; even turns use the intra separator, odd turns the inter one.
    fn turn_sep(&self, index: usize) -> &str {
        if index % 2 == 0 {
            &self.intra_message_sep
        } else {
            &self.inter_message_sep
        }
    }
}

/// Render `prompt` as the next user turn after `chat_history`.
///
/// Every history message must use one of the style's two roles.
pub fn render_chat_prompt(
    prompt: &str,
    chat_history: &[ChatMessage],
    style: &PromptStyle,
) -> Result<String> {
    style.validate()?;

    if let Some(bad) = chat_history
        .iter()
        .find(|m| m.role != style.user_role() && m.role != style.assistant_role())
    {
        return Err(OrchestratorError::InvalidArgument(format!(
            "chat history role `{}` is not one of {:?}",
            bad.role, style.roles
        )));
    }

    let turns = chat_history
        .iter()
        .map(|m| (m.role.as_str(), m.content.as_str()))
        .chain([(style.user_role(), prompt), (style.assistant_role(), "")]);

    let mut out = preamble(style);
    for (index, (role, content)) in turns.enumerate() {
        render_turn(style, index, role, content, &mut out);
    }
    Ok(out)
}

fn preamble(style: &PromptStyle) -> String {
    match style.style_name {
        StyleName::AddColonSingle | StyleName::AddColonTwo => {
            format!("{}{}", style.system_prompt, style.intra_message_sep)
        }
        StyleName::NoColonTwo => style.system_prompt.clone(),
        // The system block is emitted inside the first user turn.
        StyleName::Llama2 => String::new(),
        StyleName::ChatMl if style.system_prompt.is_empty() => String::new(),
        StyleName::ChatMl => format!("{}{}\n", style.system_prompt, style.intra_message_sep),
    }
}

fn render_turn(style: &PromptStyle, index: usize, role: &str, content: &str, out: &mut String) {
    // An empty content is the trailing assistant turn: role marker only.
    let open = content.is_empty();
    match style.style_name {
        StyleName::AddColonSingle => {
            if open {
                out.push_str(&format!("{}:", role));
            } else {
                out.push_str(&format!("{}: {}{}", role, content, style.intra_message_sep));
            }
        }
        StyleName::AddColonTwo => {
            if open {
                out.push_str(&format!("{}:", role));
            } else {
                out.push_str(&format!("{}: {}{}", role, content, style.turn_sep(index)));
            }
        }
        StyleName::NoColonTwo => {
            if open {
                out.push_str(role);
            } else {
                out.push_str(&format!("{}{}{}", role, content, style.turn_sep(index)));
            }
        }
        StyleName::Llama2 => {
            if open {
                out.push_str(role);
            } else if index == 0 {
                out.push_str(&style.system_prompt);
                out.push_str(content);
            } else {
                out.push_str(&format!("{} {}{}", role, content, style.turn_sep(index)));
            }
        }
        StyleName::ChatMl => {
            if open {
                out.push_str(&format!("{}\n", role));
            } else {
                out.push_str(&format!("{}\n{}{}\n", role, content, style.intra_message_sep));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn history(style: &PromptStyle) -> Vec<ChatMessage> {
        vec![
            ChatMessage::new(style.user_role(), "Hi there."),
            ChatMessage::new(style.assistant_role(), "Hello, how may I help you?"),
        ]
    }

    fn style(name: StyleName, system: &str, roles: [&str; 2], intra: &str, inter: &str) -> PromptStyle {
        PromptStyle {
            style_name: name,
            system_prompt: system.to_string(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            intra_message_sep: intra.to_string(),
            inter_message_sep: inter.to_string(),
            stop: None,
            stop_token_ids: None,
        }
    }

    #[test]
    fn test_add_colon_single() {
        let s = style(
            StyleName::AddColonSingle,
            "A chat between a curious human and an artificial intelligence assistant. The \
             assistant gives helpful, detailed, and polite answers to the human's questions.",
            ["user", "assistant"],
            "\n### ",
            "",
        );
        let expected = "A chat between a curious human and an artificial intelligence assistant. The assistant \
             gives helpful, detailed, and polite answers to the human's questions.\
             \n### user: Hi there.\
             \n### assistant: Hello, how may I help you?\
             \n### user: Write a poem.\
             \n### assistant:";
        let rendered = render_chat_prompt("Write a poem.", &history(&s), &s).unwrap();
        assert_eq!(rendered, expected);
    }

    #[test]
    fn test_add_colon_two() {
        let s = style(
            StyleName::AddColonTwo,
            "A chat between a curious user and an artificial intelligence assistant. The \
             assistant gives helpful, detailed, and polite answers to the user's questions.",
            ["USER", "ASSISTANT"],
            " ",
            "</s>",
        );
        let expected = "A chat between a curious user and an artificial intelligence assistant. The \
             assistant gives helpful, detailed, and polite answers to the user's questions. \
             USER: Hi there. \
             ASSISTANT: Hello, how may I help you?</s>\
             USER: Write a poem. \
             ASSISTANT:";
        let rendered = render_chat_prompt("Write a poem.", &history(&s), &s).unwrap();
        assert_eq!(rendered, expected);
    }

    #[test]
    fn test_no_colon_two() {
        let mut s = style(
            StyleName::NoColonTwo,
            "",
            [" <reserved_102> ", " <reserved_103> "],
            "",
            "</s>",
        );
        s.stop_token_ids = Some(vec![2, 195]);
        let expected = concat!(
            " <reserved_102> Hi there.",
            " <reserved_103> Hello, how may I help you?</s>",
            " <reserved_102> Write a poem.",
            " <reserved_103> ",
        );
        let rendered = render_chat_prompt("Write a poem.", &history(&s), &s).unwrap();
        assert_eq!(rendered, expected);
    }

    #[test]
    fn test_llama2() {
        let system = "<s>[INST] <<SYS>>\nYou are a helpful, respectful and honest assistant. Always answer \
             as helpfully as possible, while being safe. Your answers should not include any \
             harmful, unethical, racist, sexist, toxic, dangerous, or illegal content. Please \
             ensure that your responses are socially unbiased and positive in nature.\n\nIf a \
             question does not make any sense, or is not factually coherent, explain why instead \
             of answering something not correct. If you don't know the answer to a question, \
             please don't share false information.\n<</SYS>>\n\n";
        let mut s = style(StyleName::Llama2, system, ["[INST]", "[/INST]"], " ", " </s><s>");
        s.stop_token_ids = Some(vec![2]);
        let expected = format!(
            "{}Hi there.[/INST] Hello, how may I help you? </s><s>[INST] Write a poem. [/INST]",
            system
        );
        let rendered = render_chat_prompt("Write a poem.", &history(&s), &s).unwrap();
        assert_eq!(rendered, expected);
    }

    #[test]
    fn test_chatml() {
        let s = style(
            StyleName::ChatMl,
            "<|im_start|>system\nYou are a helpful assistant.",
            ["<|im_start|>user", "<|im_start|>assistant"],
            "<|im_end|>",
            "",
        );
        let rendered = render_chat_prompt("Write a poem.", &[], &s).unwrap();
        assert_eq!(
            rendered,
            "<|im_start|>system\nYou are a helpful assistant.<|im_end|>\n\
             <|im_start|>user\nWrite a poem.<|im_end|>\n\
             <|im_start|>assistant\n"
        );
    }

    #[test]
    fn test_empty_history_llama2_puts_system_before_prompt() {
        let s = style(StyleName::Llama2, "<s>[INST] ", ["[INST]", "[/INST]"], " ", " </s><s>");
        let rendered = render_chat_prompt("Hello", &[], &s).unwrap();
        assert_eq!(rendered, "<s>[INST] Hello[/INST]");
    }

    #[test]
    fn test_foreign_role_is_rejected() {
        let s = style(StyleName::AddColonSingle, "", ["user", "assistant"], "\n", "");
        let err = render_chat_prompt("hi", &[ChatMessage::new("system", "x")], &s).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidArgument(_)));
    }

    #[test]
    fn test_style_requires_two_roles() {
        let mut s = style(StyleName::AddColonSingle, "", ["user", "assistant"], "\n", "");
        s.roles.push("tool".to_string());
        let err = render_chat_prompt("hi", &[], &s).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidSpec(_)));
    }

    #[test]
    fn test_style_name_wire_format() {
        let parsed: StyleName = serde_json::from_str("\"LLAMA2\"").unwrap();
        assert_eq!(parsed, StyleName::Llama2);
        assert_eq!(
            serde_json::to_string(&StyleName::AddColonSingle).unwrap(),
            "\"ADD_COLON_SINGLE\""
        );
    }

    proptest! {
        #[test]
        fn prop_add_colon_single_frames_conversation(
            system in "[a-zA-Z ]{0,40}",
            prompt in "[a-zA-Z .]{1,40}",
            turns in proptest::collection::vec("[a-zA-Z .]{1,20}", 0..6),
        ) {
            let s = style(StyleName::AddColonSingle, &system, ["user", "assistant"], "\n### ", "");
            let chat_history: Vec<ChatMessage> = turns
                .iter()
                .enumerate()
                .map(|(i, c)| ChatMessage::new(s.roles[i % 2].clone(), c.clone()))
                .collect();
            let rendered = render_chat_prompt(&prompt, &chat_history, &s).unwrap();
            let expected_prompt = format!("user: {}\n### ", prompt);
            prop_assert!(rendered.starts_with(&system));
            prop_assert!(rendered.ends_with("assistant:"));
            prop_assert!(rendered.contains(&expected_prompt));
        }
    }
}
