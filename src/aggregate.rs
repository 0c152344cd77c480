//! Folding stream events into one answer.
//!
//! A [`ResponseAggregator`] lives for exactly one request. While it exists it
//! is accumulating; [`ResponseAggregator::finish`] consumes it, runs the single
//! extraction pass over the collected tool results and yields the
//! [`FinalAnswer`]. Folding after finishing is therefore impossible.

use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::stream::{StreamEvent, ToolResult};

pub const FAILURE_TEXT: &str = "An error occurred.";

/// Footnote markers the agent leaves in cited text, e.g. `【†1†】`.
static FOOTNOTE_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"【†\d+†】").expect("footnote pattern is valid"));

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinalAnswer {
    pub text: String,
    /// Empty when the agent produced no SQL.
    pub sql: String,
    /// Empty when the agent cited nothing.
    pub citations: String,
}

/// What the caller should do with an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerKind {
    Sql,
    Cited,
    Plain,
}

impl FinalAnswer {
    pub fn failure() -> Self {
        Self {
            text: FAILURE_TEXT.to_string(),
            ..Self::default()
        }
    }

    pub fn kind(&self) -> AnswerKind {
        if !self.sql.is_empty() {
            AnswerKind::Sql
        } else if !self.citations.is_empty() {
            AnswerKind::Cited
        } else {
            AnswerKind::Plain
        }
    }
}

/// How search-result sources are written into the citations string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CitationStyle {
    /// Every cited text is kept but only the last result's `[Source: …]`
    /// tag survives, which is what the Cortex agent demo client emits.
    #[default]
    LastSource,
    /// One `[Source: …]` tag per search result.
    EverySource,
}

impl FromStr for CitationStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "last" | "last_source" => Ok(CitationStyle::LastSource),
            "every" | "every_source" => Ok(CitationStyle::EverySource),
            other => Err(format!("expected `last` or `every`, got `{}`", other)),
        }
    }
}

/// Running text and tool results for one request. Append-only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Accumulation {
    pub text: String,
    pub tool_results: Vec<ToolResult>,
}

/// Event counts for one request, logged at finalization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FoldStats {
    pub messages: usize,
    pub other: usize,
    pub malformed: usize,
    pub done_seen: bool,
}

#[derive(Debug, Default)]
pub struct ResponseAggregator {
    accumulation: Accumulation,
    citation_style: CitationStyle,
    stats: FoldStats,
}

impl ResponseAggregator {
    pub fn new(citation_style: CitationStyle) -> Self {
        Self {
            citation_style,
            ..Self::default()
        }
    }

    /// Only `Message` events change the accumulation.
    pub fn fold(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Message(delta) => {
                self.stats.messages += 1;
                self.accumulation.text.push_str(&delta.text);
                self.accumulation.tool_results.extend(delta.tool_results);
            }
            StreamEvent::Done => self.stats.done_seen = true,
            StreamEvent::Other(value) => {
                self.stats.other += 1;
                debug!(payload = %value, "ignoring non-delta event");
            }
            StreamEvent::Malformed(reason) => {
                self.stats.malformed += 1;
                warn!(%reason, "skipping malformed stream record");
            }
        }
    }

    pub fn accumulation(&self) -> &Accumulation {
        &self.accumulation
    }

    pub fn stats(&self) -> FoldStats {
        self.stats
    }

    /// Ends accumulation and extracts the answer. Call on end-of-stream,
    /// whether or not a `Done` event was seen.
    pub fn finish(self) -> FinalAnswer {
        debug!(
            messages = self.stats.messages,
            other = self.stats.other,
            malformed = self.stats.malformed,
            done_seen = self.stats.done_seen,
            "finalizing agent response"
        );
        extract_answer(self.accumulation, self.citation_style)
    }
}

#[derive(Debug, Deserialize)]
struct ToolResultBody {
    #[serde(default)]
    content: Vec<ToolContent>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ToolContent {
    Json { json: ToolJson },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Deserialize)]
struct ToolJson {
    sql: Option<String>,
    #[serde(rename = "searchResults")]
    search_results: Option<Vec<SearchResult>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchResult {
    #[serde(default)]
    pub text: String,
    #[serde(default, alias = "docId")]
    pub doc_id: String,
}

/// What a single JSON tool content item contributed.
#[derive(Debug)]
enum ToolOutput {
    Sql(String),
    Search(Vec<SearchResult>),
}

fn tool_outputs(result: &ToolResult) -> Vec<ToolOutput> {
    let body = match ToolResultBody::deserialize(&result.0) {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "skipping undecodable tool result");
            return Vec::new();
        }
    };

    let mut outputs = Vec::new();
    for item in body.content {
        match item {
            ToolContent::Json { json } => {
                if let Some(results) = json.search_results {
                    outputs.push(ToolOutput::Search(results));
                }
                if let Some(sql) = json.sql {
                    outputs.push(ToolOutput::Sql(sql));
                }
            }
            ToolContent::Unsupported => {}
        }
    }
    outputs
}

fn extract_answer(accumulation: Accumulation, style: CitationStyle) -> FinalAnswer {
    let mut text = accumulation.text;
    let mut sql = String::new();
    let mut citations = String::new();
    let mut cited_text = String::new();
    let mut sources: Vec<String> = Vec::new();

    for result in &accumulation.tool_results {
        for output in tool_outputs(result) {
            match output {
                // One statement is expected per response; the last one wins.
                ToolOutput::Sql(statement) => sql = statement,
                ToolOutput::Search(results) => {
                    for hit in results {
                        cited_text.push_str(&hit.text);
                        text = FOOTNOTE_MARKER.replace_all(&text, "").into_owned();
                        text.push('+');

                        let tags = match style {
                            CitationStyle::LastSource => source_tag(&hit.doc_id),
                            CitationStyle::EverySource => {
                                sources.push(source_tag(&hit.doc_id));
                                sources.join("\n")
                            }
                        };
                        citations = format!(" \n {} \n\n{}", cited_text, tags);
                    }
                }
            }
        }
    }

    FinalAnswer {
        text,
        sql,
        citations,
    }
}

fn source_tag(doc_id: &str) -> String {
    format!("[Source: {}]", doc_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MessageDelta;
    use serde_json::json;

    fn text(fragment: &str) -> StreamEvent {
        StreamEvent::Message(MessageDelta {
            text: fragment.to_string(),
            tool_results: Vec::new(),
        })
    }

    fn tool(json: serde_json::Value) -> StreamEvent {
        StreamEvent::Message(MessageDelta {
            text: String::new(),
            tool_results: vec![ToolResult(json!({"content": [{"type": "json", "json": json}]}))],
        })
    }

    fn run(events: Vec<StreamEvent>, style: CitationStyle) -> FinalAnswer {
        let mut aggregator = ResponseAggregator::new(style);
        for event in events {
            aggregator.fold(event);
        }
        aggregator.finish()
    }

    #[test]
    fn text_fragments_keep_delivery_order() {
        let mut aggregator = ResponseAggregator::default();
        aggregator.fold(text("Hello, "));
        aggregator.fold(text("world"));
        assert_eq!(aggregator.accumulation().text, "Hello, world");
    }

    #[test]
    fn plain_reply_has_no_sql_or_citations() {
        let answer = run(vec![text("Four "), text("vehicles."), StreamEvent::Done], CitationStyle::default());
        assert_eq!(answer.text, "Four vehicles.");
        assert!(answer.sql.is_empty());
        assert!(answer.citations.is_empty());
        assert_eq!(answer.kind(), AnswerKind::Plain);
    }

    #[test]
    fn malformed_and_other_events_contribute_nothing() {
        let mut aggregator = ResponseAggregator::default();
        aggregator.fold(text("a"));
        aggregator.fold(StreamEvent::Malformed("bad json".into()));
        aggregator.fold(StreamEvent::Other(json!({"object": "response.status"})));
        aggregator.fold(text("b"));

        let stats = aggregator.stats();
        assert_eq!(stats.messages, 2);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.other, 1);
        assert!(!stats.done_seen);
        assert_eq!(aggregator.finish().text, "ab");
    }

    #[test]
    fn sql_is_extracted() {
        let answer = run(vec![text("Here is the query."), tool(json!({"sql": "SELECT 1"}))], CitationStyle::default());
        assert_eq!(answer.sql, "SELECT 1");
        assert_eq!(answer.text, "Here is the query.");
        assert_eq!(answer.kind(), AnswerKind::Sql);
    }

    #[test]
    fn last_sql_wins() {
        let answer = run(
            vec![tool(json!({"sql": "SELECT 1"})), tool(json!({"sql": "SELECT 2"}))],
            CitationStyle::default(),
        );
        assert_eq!(answer.sql, "SELECT 2");
    }

    #[test]
    fn search_result_is_cited_and_markers_stripped() {
        let answer = run(
            vec![
                text("X is true【†1†】."),
                tool(json!({"searchResults": [{"text": "Doc says X", "doc_id": "D1"}]})),
            ],
            CitationStyle::default(),
        );
        assert_eq!(answer.text, "X is true.+");
        assert_eq!(answer.citations, " \n Doc says X \n\n[Source: D1]");
        assert_eq!(answer.kind(), AnswerKind::Cited);
    }

    #[test]
    fn last_source_style_keeps_all_text_but_only_last_source() {
        let answer = run(
            vec![
                text("A【†1†】 B【†2†】"),
                tool(json!({"searchResults": [
                    {"text": "first. ", "doc_id": "D1"},
                    {"text": "second.", "doc_id": "D2"}
                ]})),
            ],
            CitationStyle::LastSource,
        );
        assert_eq!(answer.text, "A B++");
        assert!(answer.citations.contains("first. second."));
        assert!(answer.citations.ends_with("[Source: D2]"));
        assert!(!answer.citations.contains("[Source: D1]"));
    }

    #[test]
    fn every_source_style_tags_each_result() {
        let answer = run(
            vec![tool(json!({"searchResults": [
                {"text": "first. ", "doc_id": "D1"},
                {"text": "second.", "doc_id": "D2"}
            ]}))],
            CitationStyle::EverySource,
        );
        assert_eq!(answer.citations, " \n first. second. \n\n[Source: D1]\n[Source: D2]");
    }

    #[test]
    fn camel_case_doc_id_is_accepted() {
        let answer = run(
            vec![tool(json!({"searchResults": [{"text": "t", "docId": "D9"}]}))],
            CitationStyle::default(),
        );
        assert!(answer.citations.ends_with("[Source: D9]"));
    }

    #[test]
    fn undecodable_tool_results_are_skipped() {
        let mut aggregator = ResponseAggregator::default();
        aggregator.fold(StreamEvent::Message(MessageDelta {
            text: "ok".into(),
            tool_results: vec![
                ToolResult(json!("not an object")),
                ToolResult(json!({"content": [{"type": "text", "text": "ignored"}]})),
            ],
        }));
        let answer = aggregator.finish();
        assert_eq!(answer, FinalAnswer { text: "ok".into(), ..FinalAnswer::default() });
    }

    #[test]
    fn failure_answer_is_generic() {
        let answer = FinalAnswer::failure();
        assert_eq!(answer.text, "An error occurred.");
        assert!(answer.sql.is_empty() && answer.citations.is_empty());
    }

    #[test]
    fn citation_style_parses_from_config_strings() {
        assert_eq!("last".parse::<CitationStyle>(), Ok(CitationStyle::LastSource));
        assert_eq!("EVERY".parse::<CitationStyle>(), Ok(CitationStyle::EverySource));
        assert!("all".parse::<CitationStyle>().is_err());
    }
}
