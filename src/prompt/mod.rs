// src/prompt/mod.rs
// Assembles the retrieval-augmented prompt: grouped context, conversation
// ordering, gap banners, and the instruction sections. Pure and synchronous.

use std::collections::HashSet;

use crate::config::PromptBuilderConfig;
use crate::document::{Document, MetadataValue, is_real_message_id, split_id_list};

/// Messages further apart than this render a gap banner.
const GAP_THRESHOLD_SECS: i64 = 5 * 60;

const DEFAULT_TEMPLATE: &str = r#"
# Retrieval-Augmented Response Instructions

## How to Understand This Prompt
{understanding_instructions}

## How to Read Context Messages
{reading_instructions}

## Message Direction Guidelines
{direction_instructions}

## Relevant Context
{context}

## Question
{question}
"#;

const DEFAULT_FALLBACK_TEMPLATE: &str = "Answer based on general knowledge: {question}";
const DEFAULT_ERROR_TEMPLATE: &str = "Unable to process: {error}";

const UNDERSTANDING_INSTRUCTIONS: &str = "
This prompt contains contextual information followed by a question. Your task is to answer the question based on the provided context. The context includes messages from various sources, structured by conversations and participants.
";

const READING_INSTRUCTIONS: &str = r#"
Each message follows this format:
- **Source**: The origin of the message (chat group, conversation)
- **Author**: Who wrote the message
- **Timestamp**: When the message was sent
- **Previous Message ID**: Reference to the message that came before (if available)
- **Next Message ID**: Reference to the message that follows (if available)
- **Content**: The actual message text

Messages are grouped under headings showing their Message ID for clarity.
When a message shows a Previous/Next Message ID that isn't included in the context, it indicates parts of the conversation are not shown.
"#;

const DIRECTION_INSTRUCTIONS: &str = r#"
Pay close attention to message recipients and authorship:
- Each message will be under correct conversation ID or chat name. It can happen that when I'm chatting with a friend via DM, the conversation name or ID is my friend name and the author is also my friend. Ensure we are not mixing up conversations and authors.
- Messages with author "Me" are written by me, the current user asking the question
- Messages with any other author are written by someone else
- Content may include tags like "@username" or "@userId" referencing specific users
- All of these terms refer to me, the current user: {user_reference_terms}
- If a message has tags that don't match any of these terms, the message is directed to someone else
- Use message metadata and content to determine the conversation flow and direction
"#;

pub struct PromptBuilder {
    template: String,
    fallback_template: String,
    error_template: String,
    user_reference_terms: Vec<String>,
}

impl PromptBuilder {
    pub fn from_config(config: &PromptBuilderConfig) -> Self {
        Self {
            template: config
                .template
                .clone()
                .unwrap_or_else(|| DEFAULT_TEMPLATE.to_string()),
            fallback_template: config
                .fallback_template
                .clone()
                .unwrap_or_else(|| DEFAULT_FALLBACK_TEMPLATE.to_string()),
            error_template: config
                .error_template
                .clone()
                .unwrap_or_else(|| DEFAULT_ERROR_TEMPLATE.to_string()),
            user_reference_terms: if config.user_reference.enabled {
                config.user_reference.terms.clone()
            } else {
                Vec::new()
            },
        }
    }

    /// Build the full prompt for a question over retrieved documents.
    pub fn build_prompt(&self, question: &str, documents: &[Document]) -> String {
        if question.trim().is_empty() {
            return self
                .error_template
                .replace("{error}", "empty question");
        }
        if documents.is_empty() {
            return self.fallback_template.replace("{question}", question);
        }

        let context = render_context(documents);
        let direction = DIRECTION_INSTRUCTIONS
            .replace("{user_reference_terms}", &self.user_reference_terms.join(", "));

        self.template
            .replace("{understanding_instructions}", UNDERSTANDING_INSTRUCTIONS.trim_matches('\n'))
            .replace("{reading_instructions}", READING_INSTRUCTIONS.trim_matches('\n'))
            .replace("{direction_instructions}", direction.trim_matches('\n'))
            .replace("{context}", &context)
            .replace("{question}", question)
    }
}

/// The single previous-message reference: the newest of the listed ids.
fn previous_message_id(document: &Document) -> Option<String> {
    let joined = document.meta_str("previous_message_ids")?;
    split_id_list(joined).last().map(|id| id.to_string())
}

/// The single next-message reference: the earliest of the listed ids.
fn next_message_id(document: &Document) -> Option<String> {
    let joined = document.meta_str("next_message_ids")?;
    split_id_list(joined).first().map(|id| id.to_string())
}

fn message_id(document: &Document) -> Option<&str> {
    document.meta_str("message_id")
}

fn display_timestamp(document: &Document) -> String {
    match document.metadata.get("timestamp") {
        Some(MetadataValue::Str(s)) => s.clone(),
        Some(MetadataValue::Int(n)) => n.to_string(),
        Some(MetadataValue::Float(f)) => f.to_string(),
        _ => document
            .timestamp_sec()
            .map(|s| s.to_string())
            .unwrap_or_default(),
    }
}

/// Group by first-seen key, preserving encounter order.
fn group_by<'a, F>(documents: &[&'a Document], key: F) -> Vec<(String, Vec<&'a Document>)>
where
    F: Fn(&Document) -> String,
{
    let mut groups: Vec<(String, Vec<&'a Document>)> = Vec::new();
    for document in documents {
        let group_key = key(document);
        match groups.iter_mut().find(|(k, _)| k == &group_key) {
            Some((_, members)) => members.push(document),
            None => groups.push((group_key, vec![document])),
        }
    }
    groups
}

fn conversation_display_name(conversation_id: &str, documents: &[&Document]) -> String {
    documents
        .iter()
        .find_map(|d| d.meta_str("conversation_name"))
        .unwrap_or(conversation_id)
        .to_string()
}

/// Whether the conversation references earlier messages not in the context.
fn has_earlier_messages(first: &Document, known_ids: &HashSet<String>) -> bool {
    if let Some(previous) = previous_message_id(first)
        && !known_ids.contains(&previous)
    {
        return true;
    }
    first.text.starts_with("Re:") || first.text.contains("replied to")
}

/// Whether the conversation references later messages not in the context.
fn has_later_messages(last: &Document, known_ids: &HashSet<String>) -> bool {
    match next_message_id(last) {
        Some(next) => !known_ids.contains(&next),
        None => false,
    }
}

/// Gap between two consecutive rendered messages: broken link chains in
/// either direction, or more than five minutes of silence.
fn has_gap_between(previous: &Document, current: &Document, known_ids: &HashSet<String>) -> bool {
    let previous_id = message_id(previous).unwrap_or_default();
    let current_id = message_id(current).unwrap_or_default();

    if let Some(next) = next_message_id(previous)
        && is_real_message_id(&next)
        && next != current_id
        && !known_ids.contains(&next)
    {
        return true;
    }

    if let Some(prev_ref) = previous_message_id(current)
        && is_real_message_id(&prev_ref)
        && prev_ref != previous_id
        && !known_ids.contains(&prev_ref)
    {
        return true;
    }

    match (previous.timestamp_sec(), current.timestamp_sec()) {
        (Some(a), Some(b)) => (b - a) > GAP_THRESHOLD_SECS,
        _ => false,
    }
}

/// Render the `Source → Conversation → Message` hierarchy as Markdown.
fn render_context(documents: &[Document]) -> String {
    let mut parts: Vec<String> = Vec::new();

    let refs: Vec<&Document> = documents.iter().collect();
    let sources = group_by(&refs, |d| {
        d.meta_str("source").unwrap_or("unknown").to_string()
    });
    let source_count = sources.len();

    for (source_index, (source_name, source_docs)) in sources.into_iter().enumerate() {
        parts.push(format!("### Source: {source_name}"));

        let conversations = group_by(&source_docs, |d| {
            d.meta_str("conversation_id")
                .unwrap_or("default_conversation")
                .to_string()
        });
        let conversation_count = conversations.len();

        for (conversation_index, (conversation_id, mut conversation_docs)) in
            conversations.into_iter().enumerate()
        {
            conversation_docs.sort_by_key(|d| d.timestamp_sec().unwrap_or(0));

            let known_ids: HashSet<String> = conversation_docs
                .iter()
                .filter_map(|d| message_id(d).map(str::to_string))
                .collect();

            let conversation_name =
                conversation_display_name(&conversation_id, &conversation_docs);
            parts.push(format!("\n#### Conversation: {conversation_name}"));

            if let Some(first) = conversation_docs.first()
                && has_earlier_messages(first, &known_ids)
            {
                parts.push(
                    "*Note: This conversation has earlier messages not shown here*".to_string(),
                );
            }

            for (index, document) in conversation_docs.iter().enumerate() {
                if index > 0
                    && has_gap_between(conversation_docs[index - 1], document, &known_ids)
                {
                    parts.push(
                        "\n*Some messages between these timestamps are not included*\n".to_string(),
                    );
                }

                let id = message_id(document)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{}_{}", conversation_id, index + 1));
                parts.push(format!("#### Message ID: {id}"));
                parts.push(format!("- **Source**: {conversation_name}"));
                parts.push(format!(
                    "- **Author**: {}",
                    document.meta_str("author").unwrap_or("unknown")
                ));
                parts.push(format!("- **Timestamp**: {}", display_timestamp(document)));

                if let Some(previous) = previous_message_id(document) {
                    parts.push(format!("- **Previous Message ID**: {previous}"));
                }
                if let Some(next) = next_message_id(document) {
                    parts.push(format!("- **Next Message ID**: {next}"));
                }
                parts.push(format!("- **Content**: {}", document.text));
            }

            if let Some(last) = conversation_docs.last()
                && has_later_messages(last, &known_ids)
            {
                parts.push(
                    "*Note: This conversation has more recent messages not shown here*".to_string(),
                );
            }

            if conversation_index < conversation_count - 1 {
                parts.push("\n---\n".to_string());
            }
        }

        if source_index < source_count - 1 {
            parts.push("\n\n==========\n\n".to_string());
        }
    }

    parts.join("\n")
}
