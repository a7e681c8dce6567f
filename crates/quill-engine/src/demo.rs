//! Canned provider replies for offline runs (`quill run --mock`).
//!
//! Each built-in worker opens its system prompt with a fixed persona, so the
//! reply is chosen by persona and shaped the way that worker expects.

use serde_json::json;

use quill_core::errors::RemoteError;
use quill_core::messages::{ChatRequest, Role};
use quill_gateway::{MockClient, MockReply};

use crate::workers::{analysis, dialog, keywords, post, research};

fn message(request: &ChatRequest, role: Role) -> &str {
    request
        .messages
        .iter()
        .find(|m| m.role == role)
        .map(|m| m.content.as_str())
        .unwrap_or_default()
}

/// Topic from the `Topic: ...` line every worker prompt starts with.
fn topic_of(request: &ChatRequest) -> String {
    message(request, Role::User)
        .lines()
        .next()
        .and_then(|line| line.strip_prefix("Topic:"))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or("this topic")
        .to_string()
}

/// Reply to one request as the matching worker's provider would.
pub fn demo_reply(request: &ChatRequest) -> MockReply {
    let system = message(request, Role::System);
    let topic = topic_of(request);

    if system.starts_with(analysis::PERSONA) {
        let body = json!({
            "themes": [topic.clone(), "adoption", "tooling"],
            "audience": "technology leads and practitioners",
            "goals": ["explain where it helps", "start a discussion"],
            "research_directions": ["recent surveys", "adoption case studies"],
            "style": "professional and conversational"
        });
        MockReply::text(body.to_string())
    } else if system.starts_with(research::PERSONA) {
        let body = json!({
            "summary": format!("{topic} is drawing steady attention from practitioners and analysts."),
            "findings": [
                {
                    "title": "Adoption",
                    "content": format!("Teams adopting {topic} report faster delivery."),
                    "relevance_score": 0.9,
                    "credibility_score": 0.8
                },
                {
                    "title": "Challenges",
                    "content": "Tooling maturity and training remain the main hurdles.",
                    "relevance_score": 0.7,
                    "credibility_score": 0.7
                },
                {
                    "title": "Outlook",
                    "content": "Most surveys expect continued growth over the next two years.",
                    "relevance_score": 0.6,
                    "credibility_score": 0.6
                }
            ],
            "sources": ["https://example.com/survey", "https://example.com/report"]
        });
        MockReply::text(format!("```json\n{body:#}\n```"))
    } else if system.starts_with(keywords::PERSONA) {
        let body = json!({
            "keywords": [
                topic.clone(),
                format!("{topic} best practices"),
                format!("{topic} trends"),
                format!("learn {topic}")
            ],
            "hashtags": ["#Innovation", "#Tech", "Learning"],
            "categories": ["technology", "education"]
        });
        MockReply::text(body.to_string())
    } else if system.starts_with(post::PERSONA) {
        MockReply::text(format!(
            "**{topic} is changing how teams work.**\n\n\
             Early adopters report faster delivery and fewer surprises in production.\n\n\
             The hard part is rarely the technology. It is the training and the tooling around it.\n\n\
             How is your team approaching {topic}?\n\n\
             #Innovation #Tech"
        ))
    } else if system.starts_with(dialog::PERSONA) {
        MockReply::text(format!(
            "[Intro music]\n\n\
             Hey everyone, and welcome back. Today we're talking about **{topic}**.\n\n\
             (Pause)\n\n\
             Here's the thing: teams that adopt it early tend to ship faster. But it's not all smooth sailing.\n\n\
             [Emphasis: training matters]\n\n\
             Thanks for listening, and see you next time."
        ))
    } else {
        MockReply::Error(RemoteError::InvalidRequest(
            "demo provider has no reply for this prompt".into(),
        ))
    }
}

pub fn demo_client() -> MockClient {
    MockClient::with_handler(demo_reply)
}
