use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use quill_core::validate::sanitize_text;

use crate::parse::{or_fallback, parse_json_reply, ParseError};
use crate::worker::{Worker, WorkerError, WorkerInput};
use crate::workers::analysis::analysis_context;
use crate::workers::Generator;

pub const PERSONA: &str = "You are a meticulous research analyst.";

const SYSTEM_PROMPT: &str = "You are a meticulous research analyst. \
Research the given topic and report what a well-informed professional should know: \
current state, notable developments, data points and open debates.\n\n\
Return JSON with these keys: \
summary (string, 2-4 paragraphs), \
findings (array of objects with title, content, and relevance_score and credibility_score \
between 0 and 1), \
sources (array of strings).";

const MAX_SUMMARY_CHARS: usize = 8_000;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub relevance_score: f64,
    #[serde(default = "default_credibility")]
    pub credibility_score: f64,
}

fn default_credibility() -> f64 {
    0.5
}

/// Mean credibility of the findings, 0 when there are none.
pub fn overall_credibility(findings: &[Finding]) -> f64 {
    if findings.is_empty() {
        return 0.0;
    }
    let total: f64 = findings.iter().map(|f| f.credibility_score.clamp(0.0, 1.0)).sum();
    ((total / findings.len() as f64) * 1000.0).round() / 1000.0
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResearchReply {
    pub summary: String,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub sources: Vec<String>,
}

/// Used when the reply is prose rather than JSON: the text itself becomes
/// the summary.
pub fn fallback_research(text: &str) -> ResearchReply {
    ResearchReply {
        summary: sanitize_text(text.trim(), MAX_SUMMARY_CHARS),
        ..Default::default()
    }
}

pub struct ResearchWorker {
    generator: Generator,
}

impl ResearchWorker {
    pub fn new(generator: Generator) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl Worker for ResearchWorker {
    fn name(&self) -> &str {
        "research"
    }

    fn required_inputs(&self) -> &[&str] {
        &["topic"]
    }

    async fn run(&self, input: &WorkerInput) -> Result<Value, WorkerError> {
        let user = format!(
            "Topic: {}{}\n\nProduce a comprehensive research brief on this topic.",
            input.topic,
            analysis_context(input.dep("analysis")),
        );
        let text = self.generator.complete(SYSTEM_PROMPT, &user).await?;
        if text.trim().is_empty() {
            return Err(ParseError::Empty.into());
        }

        let mut reply = or_fallback(parse_json_reply::<ResearchReply>(&text), "research", || {
            fallback_research(&text)
        });
        reply.summary = sanitize_text(&reply.summary, MAX_SUMMARY_CHARS);
        reply
            .findings
            .sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));

        Ok(json!({
            "topic": input.topic,
            "summary": reply.summary,
            "findings": reply.findings,
            "sources": reply.sources,
            "total_sources": reply.sources.len().max(reply.findings.len()),
            "credibility_score": overall_credibility(&reply.findings),
        }))
    }
}

/// Readable research text for downstream prompts.
pub fn research_brief(research: &Value, max_findings: usize) -> String {
    let mut brief = research["summary"].as_str().unwrap_or_default().to_string();
    let findings = research["findings"].as_array().map(Vec::as_slice).unwrap_or_default();
    for (i, finding) in findings.iter().take(max_findings).enumerate() {
        let title = finding["title"].as_str().unwrap_or_default();
        let content: String = finding["content"].as_str().unwrap_or_default().chars().take(200).collect();
        brief.push_str(&format!("\n{}. {title}: {content}", i + 1));
    }
    brief
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::config::ModelSettings;
    use quill_core::errors::RemoteError;
    use quill_gateway::{MockClient, MockReply};
    use std::sync::Arc;

    fn worker(reply: MockReply) -> ResearchWorker {
        let mock = Arc::new(MockClient::new(vec![reply]));
        ResearchWorker::new(Generator::new(mock, ModelSettings::default().research))
    }

    #[tokio::test]
    async fn structured_reply() {
        let reply = r#"{"summary": "Async Rust is mature.",
            "findings": [{"title": "a", "content": "low", "relevance_score": 0.2},
                         {"title": "b", "content": "high", "relevance_score": 0.9}],
            "sources": ["https://example.com"]}"#;
        let out = worker(MockReply::text(reply))
            .run(&WorkerInput::new("async rust"))
            .await
            .unwrap();
        assert_eq!(out["summary"], "Async Rust is mature.");
        assert_eq!(out["findings"][0]["title"], "b");
        assert_eq!(out["total_sources"], 2);
        // both findings left credibility unset
        assert_eq!(out["credibility_score"], 0.5);
    }

    #[test]
    fn credibility_is_the_mean_of_findings() {
        let finding = |score| Finding {
            title: "t".into(),
            credibility_score: score,
            ..Default::default()
        };
        assert_eq!(overall_credibility(&[]), 0.0);
        assert_eq!(overall_credibility(&[finding(0.9), finding(0.6)]), 0.75);
        assert_eq!(overall_credibility(&[finding(1.7), finding(0.2)]), 0.6);
    }

    #[tokio::test]
    async fn prompt_carries_topic_analysis() {
        let mock = Arc::new(MockClient::new(vec![MockReply::text(r#"{"summary": "S"}"#)]));
        let worker = ResearchWorker::new(Generator::new(mock.clone(), ModelSettings::default().research));
        let input = WorkerInput::new("async rust").with_dep(
            "analysis",
            json!({"themes": ["runtimes"], "research_directions": ["benchmarks"]}),
        );
        let out = worker.run(&input).await.unwrap();
        assert_eq!(out["credibility_score"], 0.0);

        let prompt = &mock.requests()[0].messages[1].content;
        assert!(prompt.contains("Themes: runtimes"));
        assert!(prompt.contains("Research directions: benchmarks"));
    }

    #[tokio::test]
    async fn prose_reply_becomes_summary() {
        let out = worker(MockReply::text("Plain prose about the topic."))
            .run(&WorkerInput::new("async rust"))
            .await
            .unwrap();
        assert_eq!(out["summary"], "Plain prose about the topic.");
        assert_eq!(out["findings"], json!([]));
    }

    #[tokio::test]
    async fn empty_reply_fails() {
        let err = worker(MockReply::text("  "))
            .run(&WorkerInput::new("async rust"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Parse(ParseError::Empty)));
    }

    #[tokio::test]
    async fn remote_error_propagates() {
        let err = worker(MockReply::Error(RemoteError::Overloaded))
            .run(&WorkerInput::new("async rust"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Remote(RemoteError::Overloaded)));
    }

    #[test]
    fn prompt_opens_with_persona() {
        assert!(SYSTEM_PROMPT.starts_with(PERSONA));
    }

    #[test]
    fn brief_lists_findings() {
        let research = json!({
            "summary": "Summary.",
            "findings": [{"title": "One", "content": "first"}, {"title": "Two", "content": "second"}],
        });
        assert_eq!(research_brief(&research, 1), "Summary.\n1. One: first");
    }
}
