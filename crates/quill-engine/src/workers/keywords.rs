use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::parse::{or_fallback, parse_json_reply};
use crate::worker::{Worker, WorkerError, WorkerInput};
use crate::workers::analysis::analysis_context;
use crate::workers::Generator;

pub const PERSONA: &str = "You are an SEO strategist and social media marketer.";

const SYSTEM_PROMPT: &str = "You are an SEO strategist and social media marketer. \
Suggest keywords and hashtags for content about the given topic: primary keywords, \
long-tail phrases, question-based keywords and platform-friendly hashtags.\n\n\
Return JSON with these keys: keywords (array of strings), hashtags (array of strings), \
categories (array of strings).";

const MAX_KEYWORDS: usize = 30;
const MAX_HASHTAGS: usize = 20;

static KEYWORD_JUNK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w\s\-&']").unwrap());
static HASHTAG_JUNK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w#]").unwrap());
static PUNCTUATION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w\s]").unwrap());
static WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\w+\b").unwrap());

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct KeywordReply {
    pub keywords: Vec<String>,
    pub hashtags: Vec<String>,
    pub categories: Vec<String>,
}

/// Keywords derived from the topic alone.
pub fn fallback_keywords(topic: &str) -> KeywordReply {
    let clean = PUNCTUATION.replace_all(&topic.to_lowercase(), "").into_owned();
    let clean = clean.split_whitespace().collect::<Vec<_>>().join(" ");

    let keywords = vec![
        topic.to_string(),
        format!("{clean} guide"),
        format!("{clean} tips"),
        format!("best {clean}"),
        format!("{clean} trends"),
        format!("{clean} news"),
        format!("how to {clean}"),
        format!("{clean} for beginners"),
        format!("latest {clean}"),
        format!("{clean} insights"),
    ];

    let camel: String = clean.split_whitespace().map(capitalize).collect();
    let hashtags = vec![
        format!("#{camel}"),
        format!("#{}", clean.replace(' ', "")),
        "#ContentCreation".into(),
        "#DigitalMarketing".into(),
        "#SEO".into(),
        "#SocialMedia".into(),
    ];

    KeywordReply {
        keywords,
        hashtags,
        categories: vec!["primary".into(), "long_tail".into(), "questions".into()],
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn clean_keyword(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let filtered = KEYWORD_JUNK.replace_all(&collapsed, "");
    filtered.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalise, filter to 3..=80 characters, de-duplicate case-insensitively,
/// and keep the first 30.
pub fn clean_keywords(raw: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.iter()
        .map(|k| clean_keyword(k))
        .filter(|k| (3..=80).contains(&k.chars().count()))
        .filter(|k| seen.insert(k.to_lowercase()))
        .take(MAX_KEYWORDS)
        .collect()
}

/// Prefix `#`, strip everything but word characters, filter to 2..=100
/// characters, de-duplicate case-insensitively, and keep the first 20.
pub fn clean_hashtags(raw: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.iter()
        .map(|h| {
            let tagged = if h.starts_with('#') { h.clone() } else { format!("#{h}") };
            HASHTAG_JUNK.replace_all(&tagged, "").into_owned()
        })
        .filter(|h| (2..=100).contains(&h.chars().count()))
        .filter(|h| seen.insert(h.to_lowercase()))
        .take(MAX_HASHTAGS)
        .collect()
}

fn words(text: &str) -> HashSet<String> {
    WORD.find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Relevance of one keyword to the topic in `[0, 1]`.
///
/// Jaccard overlap of the word sets, +0.3 when one contains the other, and
/// +0.1 per word beyond the first.
pub fn relevance(topic: &str, keyword: &str) -> f64 {
    let topic_words = words(topic);
    let keyword_words = words(keyword);

    let union = topic_words.union(&keyword_words).count();
    let mut score = if union == 0 {
        0.0
    } else {
        topic_words.intersection(&keyword_words).count() as f64 / union as f64
    };

    let (t, k) = (topic.to_lowercase(), keyword.to_lowercase());
    if t.contains(&k) || k.contains(&t) {
        score = (score + 0.3).min(1.0);
    }
    if keyword_words.len() > 1 {
        score = (score + (keyword_words.len() - 1) as f64 * 0.1).min(1.0);
    }
    (score * 1000.0).round() / 1000.0
}

pub fn relevance_scores(topic: &str, keywords: &[String]) -> BTreeMap<String, f64> {
    keywords
        .iter()
        .map(|k| (k.clone(), relevance(topic, k)))
        .collect()
}

pub struct KeywordsWorker {
    generator: Generator,
}

impl KeywordsWorker {
    pub fn new(generator: Generator) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl Worker for KeywordsWorker {
    fn name(&self) -> &str {
        "keywords"
    }

    fn required_inputs(&self) -> &[&str] {
        &["topic"]
    }

    async fn run(&self, input: &WorkerInput) -> Result<Value, WorkerError> {
        let user = format!(
            "Topic: {}{}\n\nGenerate keyword and hashtag suggestions for content creation, \
             social media posts and SEO.",
            input.topic,
            analysis_context(input.dep("analysis")),
        );
        let text = self.generator.complete(SYSTEM_PROMPT, &user).await?;
        let reply = or_fallback(parse_json_reply::<KeywordReply>(&text), "keywords", || {
            fallback_keywords(&input.topic)
        });

        let keywords = clean_keywords(&reply.keywords);
        let hashtags = clean_hashtags(&reply.hashtags);
        let scores = relevance_scores(&input.topic, &keywords);

        Ok(json!({
            "topic": input.topic,
            "total_keywords": keywords.len(),
            "total_hashtags": hashtags.len(),
            "keywords": keywords,
            "hashtags": hashtags,
            "keyword_scores": scores,
            "categories": reply.categories,
        }))
    }
}
