use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};

use crate::parse::ParseError;
use crate::quality::{check_content, ContentKind};
use crate::worker::{Worker, WorkerError, WorkerInput};
use crate::workers::research::research_brief;
use crate::workers::{word_count, Generator};

pub const PERSONA: &str = "You are a voice content creator and podcast scriptwriter.";

const SYSTEM_PROMPT: &str = "You are a voice content creator and podcast scriptwriter. \
Turn the research into a natural, conversational script for a two to three minute delivery. \
Use contractions and transitions, mark key points as [Emphasis] and natural breaks as (Pause), \
add [Music] or [Intro] cues where they fit, and leave a blank line between paragraphs.";

const WORDS_PER_MINUTE: f64 = 150.0;

static BOLD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*\*([^*]+)\*\*").unwrap());
static ITALIC: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*([^*]+)\*").unwrap());

/// Turn markdown emphasis into spoken cues, normalise paragraphs and decode
/// the common HTML entities.
pub fn clean_dialog(text: &str) -> String {
    let text = BOLD.replace_all(text, "[Emphasis: $1]");
    let text = ITALIC.replace_all(&text, "[Emphasis: $1]");
    let text = text.replace("\\n", "\n");
    let joined = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
    joined
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
        .trim()
        .to_string()
}

/// Speaking time at 150 words per minute.
pub fn estimated_duration_secs(words: usize) -> u64 {
    (words as f64 / WORDS_PER_MINUTE * 60.0) as u64
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Segment {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub content: String,
    pub word_count: usize,
}

fn segment_kind(paragraph: &str) -> &'static str {
    if !(paragraph.starts_with('[') && paragraph.ends_with(']')) {
        return "content";
    }
    let lower = paragraph.to_lowercase();
    if lower.contains("music") || lower.contains("intro") {
        "music_cue"
    } else if lower.contains("emphasis") {
        "emphasis"
    } else if lower.contains("pause") {
        "pause"
    } else {
        "cue"
    }
}

/// One segment per paragraph.
pub fn segments(dialog: &str) -> Vec<Segment> {
    dialog
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| Segment {
            kind: segment_kind(p),
            content: p.to_string(),
            word_count: word_count(p),
        })
        .collect()
}

pub struct DialogWorker {
    generator: Generator,
}

impl DialogWorker {
    pub fn new(generator: Generator) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl Worker for DialogWorker {
    fn name(&self) -> &str {
        "dialog"
    }

    fn required_inputs(&self) -> &[&str] {
        &["topic", "research"]
    }

    async fn run(&self, input: &WorkerInput) -> Result<Value, WorkerError> {
        let research = input
            .dep("research")
            .ok_or_else(|| WorkerError::MissingInput("research".into()))?;

        let user = format!(
            "Topic: {}\n\nResearch:\n{}\n\nWrite the script.",
            input.topic,
            research_brief(research, 5),
        );
        let dialog = clean_dialog(&self.generator.complete(SYSTEM_PROMPT, &user).await?);
        if dialog.is_empty() {
            return Err(ParseError::Empty.into());
        }

        let words = word_count(&dialog);
        Ok(json!({
            "word_count": words,
            "estimated_duration": estimated_duration_secs(words),
            "segments": segments(&dialog),
            "validation": check_content(&dialog, ContentKind::Dialog),
            "dialog": dialog,
        }))
    }
}
