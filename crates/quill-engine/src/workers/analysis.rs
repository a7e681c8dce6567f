use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::parse::{or_fallback, parse_json_reply, ParseError};
use crate::worker::{Worker, WorkerError, WorkerInput};
use crate::workers::Generator;

pub const PERSONA: &str = "You are an expert content strategist.";

const SYSTEM_PROMPT: &str = "You are an expert content strategist. \
Analyze the topic before any research starts: which themes it covers, who the \
audience is, what the content should achieve and where research should look.\n\n\
Return JSON with these keys: themes (array of strings), audience (string), \
goals (array of strings), research_directions (array of strings), style (string).";

/// Plan shared by the research and keywords tasks.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicAnalysis {
    pub themes: Vec<String>,
    pub audience: String,
    pub goals: Vec<String>,
    pub research_directions: Vec<String>,
    pub style: String,
}

pub fn fallback_analysis(topic: &str) -> TopicAnalysis {
    TopicAnalysis {
        themes: vec![topic.to_string()],
        audience: "general professional audience".into(),
        goals: vec!["inform and engage".into()],
        research_directions: vec!["general information gathering".into()],
        style: "professional and conversational".into(),
    }
}

/// Prompt section built from an analysis output, empty when there is none.
pub fn analysis_context(analysis: Option<&Value>) -> String {
    let Some(analysis) = analysis else {
        return String::new();
    };
    let list = |key: &str| -> String {
        analysis[key]
            .as_array()
            .map(|items| items.iter().filter_map(Value::as_str).collect::<Vec<_>>().join(", "))
            .unwrap_or_default()
    };
    let mut context = String::new();
    for (label, value) in [
        ("Themes", list("themes")),
        ("Audience", analysis["audience"].as_str().unwrap_or_default().to_string()),
        ("Research directions", list("research_directions")),
        ("Style", analysis["style"].as_str().unwrap_or_default().to_string()),
    ] {
        if !value.is_empty() {
            context.push_str(&format!("\n{label}: {value}"));
        }
    }
    if context.is_empty() {
        return context;
    }
    format!("\n\nTopic analysis:{context}")
}

pub struct AnalysisWorker {
    generator: Generator,
}

impl AnalysisWorker {
    pub fn new(generator: Generator) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl Worker for AnalysisWorker {
    fn name(&self) -> &str {
        "analysis"
    }

    fn required_inputs(&self) -> &[&str] {
        &["topic"]
    }

    async fn run(&self, input: &WorkerInput) -> Result<Value, WorkerError> {
        let user = format!("Topic: {}\n\nAnalyze this topic for content creation.", input.topic);
        let text = self.generator.complete(SYSTEM_PROMPT, &user).await?;
        if text.trim().is_empty() {
            return Err(ParseError::Empty.into());
        }

        let mut analysis = or_fallback(parse_json_reply::<TopicAnalysis>(&text), "analysis", || {
            fallback_analysis(&input.topic)
        });
        if analysis.themes.is_empty() {
            analysis.themes.push(input.topic.clone());
        }
        Ok(json!({
            "themes": analysis.themes,
            "audience": analysis.audience,
            "goals": analysis.goals,
            "research_directions": analysis.research_directions,
            "style": analysis.style,
        }))
    }
}
