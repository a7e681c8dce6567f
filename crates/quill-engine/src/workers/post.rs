use std::collections::BTreeSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};

use crate::parse::ParseError;
use crate::quality::{check_content, ContentKind};
use crate::worker::{Worker, WorkerError, WorkerInput};
use crate::workers::research::research_brief;
use crate::workers::{word_count, Generator};

pub const PERSONA: &str = "You are a professional content creator specializing in LinkedIn posts.";

const SYSTEM_PROMPT: &str = "You are a professional content creator specializing in LinkedIn posts. \
Write an engaging, professional post that hooks the reader in the first lines, \
shares two or three concrete insights from the research, works in a few of the \
suggested keywords naturally, ends with a question, and closes with relevant hashtags. \
Stay between 150 and 250 words. Reply with the post text only.";

static HASHTAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"#\w+").unwrap());

/// Strip markdown emphasis and normalise paragraphs to single blank lines.
pub fn clean_post(text: &str) -> String {
    let text = text.replace("**", "").replace('*', "").replace("\\n", "\n");
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Distinct hashtags in the post, sorted.
pub fn extract_hashtags(text: &str) -> Vec<String> {
    HASHTAG
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn keyword_context(keywords: Option<&Value>) -> String {
    let Some(keywords) = keywords else {
        return String::new();
    };
    let list = |key: &str, n: usize| -> String {
        keywords[key]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .take(n)
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default()
    };
    format!(
        "\n\nAvailable Keywords: {}\nAvailable Hashtags: {}",
        list("keywords", 8),
        list("hashtags", 5)
    )
}

/// Writes the post. Needs research; keyword output is used when present.
pub struct PostWorker {
    generator: Generator,
}

impl PostWorker {
    pub fn new(generator: Generator) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl Worker for PostWorker {
    fn name(&self) -> &str {
        "post"
    }

    fn required_inputs(&self) -> &[&str] {
        &["topic", "research"]
    }

    async fn run(&self, input: &WorkerInput) -> Result<Value, WorkerError> {
        let research = input
            .dep("research")
            .ok_or_else(|| WorkerError::MissingInput("research".into()))?;

        let user = format!(
            "Topic: {}\n\nResearch:\n{}{}\n\nWrite the post.",
            input.topic,
            research_brief(research, 5),
            keyword_context(input.dep("keywords")),
        );
        let content = clean_post(&self.generator.complete(SYSTEM_PROMPT, &user).await?);
        if content.is_empty() {
            return Err(ParseError::Empty.into());
        }

        Ok(json!({
            "word_count": word_count(&content),
            "hashtags_included": extract_hashtags(&content),
            "call_to_action": content.contains('?'),
            "validation": check_content(&content, ContentKind::Post),
            "content": content,
        }))
    }
}
