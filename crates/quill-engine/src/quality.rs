//! Heuristic checks on generated content.
//!
//! Problems that make the content unusable land in `issues` and clear
//! `is_valid`; everything else is a warning attached to the task output.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::workers::word_count;

static HASHTAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"#\w+").unwrap());
static CUE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[.*?\]").unwrap());
static PAUSE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\(pause\)").unwrap());
static EMPHASIS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\[emphasis:.*?\]").unwrap());

const SPOKEN_WORDS_PER_MINUTE: f64 = 150.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentKind {
    Post,
    Dialog,
    General,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ContentStats {
    pub length: usize,
    pub word_count: usize,
    pub line_count: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PostChecks {
    pub hashtag_count: usize,
    pub question_count: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DialogChecks {
    pub has_timing_indicators: bool,
    pub pause_count: usize,
    pub emphasis_count: usize,
    pub estimated_duration_minutes: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ContentReport {
    pub is_valid: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    pub stats: ContentStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_checks: Option<PostChecks>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dialog_checks: Option<DialogChecks>,
}

pub fn check_content(content: &str, kind: ContentKind) -> ContentReport {
    let words = word_count(content);
    let mut report = ContentReport {
        is_valid: true,
        issues: Vec::new(),
        warnings: Vec::new(),
        stats: ContentStats {
            length: content.chars().count(),
            word_count: words,
            line_count: content.split('\n').count(),
        },
        post_checks: None,
        dialog_checks: None,
    };

    if content.trim().is_empty() {
        report.is_valid = false;
        report.issues.push("content is empty".into());
        return report;
    }

    match kind {
        ContentKind::Post => report.post_checks = Some(check_post(content, words, &mut report.warnings)),
        ContentKind::Dialog => report.dialog_checks = Some(check_dialog(content, words, &mut report.warnings)),
        ContentKind::General => {}
    }

    if content.trim().chars().count() < 10 {
        report.warnings.push("content is very short".into());
    }
    if words > 1000 {
        report.warnings.push("content is very long".into());
    }
    report
}

fn check_post(content: &str, words: usize, warnings: &mut Vec<String>) -> PostChecks {
    let hashtag_count = HASHTAG.find_iter(content).count();
    match hashtag_count {
        0 => warnings.push("no hashtags found".into()),
        n if n > 5 => warnings.push("too many hashtags".into()),
        _ => {}
    }

    if words < 50 {
        warnings.push("post is quite short".into());
    } else if words > 300 {
        warnings.push("post is quite long".into());
    }

    let question_count = content.matches('?').count();
    if question_count == 0 {
        warnings.push("no questions found".into());
    }

    PostChecks {
        hashtag_count,
        question_count,
    }
}

fn check_dialog(content: &str, words: usize, warnings: &mut Vec<String>) -> DialogChecks {
    let minutes = words as f64 / SPOKEN_WORDS_PER_MINUTE;
    if minutes < 1.0 {
        warnings.push("content is very short for audio".into());
    } else if minutes > 5.0 {
        warnings.push("content is very long for audio".into());
    }

    DialogChecks {
        has_timing_indicators: CUE.is_match(content),
        pause_count: PAUSE.find_iter(content).count(),
        emphasis_count: EMPHASIS.find_iter(content).count(),
        estimated_duration_minutes: (minutes * 10.0).round() / 10.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize) -> String {
        vec!["word"; n].join(" ")
    }

    #[test]
    fn empty_content_is_invalid() {
        let report = check_content("  \n ", ContentKind::Post);
        assert!(!report.is_valid);
        assert_eq!(report.issues, vec!["content is empty"]);
        assert_eq!(report.post_checks, None);
        assert_eq!(report.stats.line_count, 2);
    }

    #[test]
    fn short_post_collects_every_warning() {
        let report = check_content("Just shipped it", ContentKind::Post);
        assert!(report.is_valid);
        assert_eq!(
            report.warnings,
            vec!["no hashtags found", "post is quite short", "no questions found"]
        );
        assert_eq!(
            report.post_checks,
            Some(PostChecks {
                hashtag_count: 0,
                question_count: 0
            })
        );
    }

    #[test]
    fn healthy_post_has_no_warnings() {
        let post = format!("{} What do you think? #Rust #Async", words(60));
        let report = check_content(&post, ContentKind::Post);
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
        assert_eq!(report.post_checks.unwrap().hashtag_count, 2);
    }

    #[test]
    fn hashtag_and_length_limits() {
        let post = format!("{}? #a #b #c #d #e #f", words(301));
        let report = check_content(&post, ContentKind::Post);
        assert_eq!(report.warnings, vec!["too many hashtags", "post is quite long"]);
    }

    #[test]
    fn dialog_cues_and_duration() {
        let script = format!(
            "[Intro music]\n\n[Emphasis: Welcome] back. (Pause) {} (pause)",
            words(220)
        );
        let report = check_content(&script, ContentKind::Dialog);
        let checks = report.dialog_checks.unwrap();
        assert!(checks.has_timing_indicators);
        assert_eq!(checks.pause_count, 2);
        assert_eq!(checks.emphasis_count, 1);
        // 227 words at 150 per minute
        assert_eq!(checks.estimated_duration_minutes, 1.5);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn dialog_duration_bounds() {
        let short = check_content("A quick hello there.", ContentKind::Dialog);
        assert_eq!(short.warnings, vec!["content is very short for audio"]);

        let long = check_content(&words(1001), ContentKind::Dialog);
        assert_eq!(
            long.warnings,
            vec!["content is very long for audio", "content is very long"]
        );
        assert!(!long.dialog_checks.unwrap().has_timing_indicators);
    }

    #[test]
    fn general_content_only_gets_size_checks() {
        let report = check_content("tiny", ContentKind::General);
        assert_eq!(report.warnings, vec!["content is very short"]);
        assert!(report.post_checks.is_none() && report.dialog_checks.is_none());
        assert_eq!(
            report.stats,
            ContentStats {
                length: 4,
                word_count: 1,
                line_count: 1
            }
        );
    }
}
