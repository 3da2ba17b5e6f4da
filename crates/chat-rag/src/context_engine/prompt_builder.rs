//! System prompt template for grounded, cited answers

use crate::llm::PromptMessage;

const SYSTEM_RULES: &str = "You are an assistant that answers questions about this workspace's chat history.

Follow these rules:
1. Answer only from the chat messages in the CONTEXT section below. Do not use outside knowledge.
2. Never invent users, channels, messages or conversations that do not appear in the context.
3. End every answer with a line containing exactly \"Sources:\" followed by one line per message you relied on, in this exact format:
   [N] @username in #channel: <verbatim content of the message>
   where N is the number of the message in the context.
4. Only cite messages in the Sources section. Do not put [N] markers in the body of the answer.
5. Quote message content verbatim in citations. Do not paraphrase or shorten it.
6. If the context does not contain enough information to answer, say so plainly instead of guessing.";

pub struct PromptBuilder;

impl PromptBuilder {
    /// Rules followed by the numbered context block.
    pub fn build_system_prompt(context_block: &str) -> String {
        format!("{}\n\nCONTEXT:\n{}", SYSTEM_RULES, context_block)
    }

    /// `[system, user]` messages for the chat model.
    pub fn build_messages(system_prompt: &str, question: &str) -> Vec<PromptMessage> {
        vec![PromptMessage::system(system_prompt), PromptMessage::user(question)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_contains_rules_then_context() {
        let prompt = PromptBuilder::build_system_prompt("[1] alice in #general at 2024-01-01 12:00 UTC:\nhi");

        let rules_at = prompt.find("[N] @username in #channel:").unwrap();
        let context_at = prompt.find("CONTEXT:\n[1] alice").unwrap();
        assert!(rules_at < context_at);
        assert!(prompt.contains("\"Sources:\""));
        assert!(prompt.contains("not contain enough information"));
    }

    #[test]
    fn test_prompt_is_deterministic() {
        assert_eq!(PromptBuilder::build_system_prompt("x"), PromptBuilder::build_system_prompt("x"));
    }

    #[test]
    fn test_messages_are_system_then_user() {
        let messages = PromptBuilder::build_messages("rules", "when is the deploy?");
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1], PromptMessage::user("when is the deploy?"));
    }
}
