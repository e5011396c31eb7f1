//! Extracts the `STORIES_JSON:` block embedded in agent output and
//! validates it against the story schema.

use serde::Deserialize;
use thiserror::Error;

const MAX_STORIES: usize = 20;
const SENTINEL: &str = "STORIES_JSON:";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoryParseError {
    #[error("no STORIES_JSON: block found in output")]
    SentinelNotFound,
    #[error("STORIES_JSON payload is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("STORIES_JSON payload must be a JSON array")]
    NotAnArray,
    #[error("STORIES_JSON contains {0} stories, which exceeds the limit of {MAX_STORIES}")]
    TooManyStories(usize),
    #[error("story at index {0} is missing a non-empty '{1}' field")]
    MissingField(usize, &'static str),
}

/// A single story as decoded straight off the wire, before the engine
/// assigns it a run id, index, or persistent id.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ParsedStory {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(alias = "acceptance_criteria")]
    pub acceptance_criteria: Vec<String>,
}

/// Locate and parse the `STORIES_JSON:` block in `output`.
///
/// The payload runs from the text after the sentinel up to (but not
/// including) the next line matching `^[A-Z_]+:\s`, or EOF.
pub fn parse(output: &str) -> Result<Vec<ParsedStory>, StoryParseError> {
    let payload = extract_payload(output).ok_or(StoryParseError::SentinelNotFound)?;

    let value: serde_json::Value =
        serde_json::from_str(&payload).map_err(|e| StoryParseError::InvalidJson(e.to_string()))?;

    let array = value.as_array().ok_or(StoryParseError::NotAnArray)?;

    if array.len() > MAX_STORIES {
        return Err(StoryParseError::TooManyStories(array.len()));
    }

    let mut stories = Vec::with_capacity(array.len());
    for (index, entry) in array.iter().enumerate() {
        let story: ParsedStory = serde_json::from_value(entry.clone())
            .map_err(|e| StoryParseError::InvalidJson(e.to_string()))?;

        if story.id.trim().is_empty() {
            return Err(StoryParseError::MissingField(index, "id"));
        }
        if story.title.trim().is_empty() {
            return Err(StoryParseError::MissingField(index, "title"));
        }
        if story.description.trim().is_empty() {
            return Err(StoryParseError::MissingField(index, "description"));
        }
        if story.acceptance_criteria.is_empty() {
            return Err(StoryParseError::MissingField(index, "acceptanceCriteria"));
        }

        stories.push(story);
    }

    Ok(stories)
}

fn extract_payload(output: &str) -> Option<String> {
    let key_line = regex_once();

    let mut lines = output.lines();
    let mut payload = String::new();
    let mut found = false;

    for line in &mut lines {
        if let Some(rest) = line.strip_prefix(SENTINEL) {
            payload.push_str(rest);
            found = true;
            break;
        }
    }

    if !found {
        return None;
    }

    for line in lines {
        if key_line.is_match(line) {
            break;
        }
        payload.push('\n');
        payload.push_str(line);
    }

    Some(payload)
}

fn regex_once() -> &'static regex::Regex {
    use std::sync::LazyLock;
    static KEY_LINE: LazyLock<regex::Regex> =
        LazyLock::new(|| regex::Regex::new(r"^[A-Z_]+:\s").unwrap());
    &KEY_LINE
}
