//! Response parsing
//!
//! Extracts structured sections from the raw model output and strips them
//! from the text shown to the user:
//!
//! | tag                           | field              |
//! |-------------------------------|--------------------|
//! | `<think>` / `<thinking>`      | `reasoning`        |
//! | `<options>` (one per line)    | `next_prompts`     |
//! | `<event>`                     | `events`           |
//! | `<vars>` (JSON object)        | `variable_updates` |
//! | `<initvar>` (JSON object)     | `init_variables`   |

use async_trait::async_trait;
use chat_core::VariableState;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use super::{fields, ids};
use crate::error::StageError;
use crate::stage::{FieldMap, FieldMapExt, Stage, StageDescriptor};

static THINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<think(?:ing)?>(.*?)</think(?:ing)?>").expect("Failed to compile think regex")
});
static OPTIONS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<options>(.*?)</options>").expect("Failed to compile options regex")
});
static EVENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<event>(.*?)</event>").expect("Failed to compile event regex"));
static VARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<vars>(.*?)</vars>").expect("Failed to compile vars regex"));
static INITVAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<initvar>(.*?)</initvar>").expect("Failed to compile initvar regex")
});
static OPTION_BULLET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[-*•]|\d+[.)])\s*").expect("Failed to compile option bullet regex")
});
static BLANK_RUNS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n{3,}").expect("Failed to compile blank line regex"));

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedResponse {
    /// Text shown to the user.
    pub response: String,
    pub reasoning: Option<String>,
    pub next_prompts: Vec<String>,
    pub events: Vec<String>,
    /// Merged `<vars>` blocks; a `null` value removes the variable.
    pub variable_updates: VariableState,
    /// Replacement state from an `<initvar>` block.
    pub init_variables: Option<VariableState>,
}

fn captures(pattern: &Regex, text: &str) -> Vec<String> {
    pattern
        .captures_iter(text)
        .filter_map(|captures| captures.get(1))
        .map(|body| body.as_str().trim().to_string())
        .collect()
}

fn json_object(tag: &str, body: &str) -> Option<VariableState> {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => Some(map),
        Ok(_) => {
            tracing::warn!(tag, "ResponseParsing: block is not a JSON object, ignoring");
            None
        }
        Err(error) => {
            tracing::warn!(tag, error = %error, "ResponseParsing: invalid JSON block, ignoring");
            None
        }
    }
}

pub fn parse_response(raw: &str) -> ParsedResponse {
    let reasoning = captures(&THINK, raw);
    let next_prompts = captures(&OPTIONS, raw)
        .iter()
        .flat_map(|block| block.lines())
        .map(|line| OPTION_BULLET.replace(line.trim(), "").trim().to_string())
        .filter(|line| !line.is_empty())
        .collect();
    let events = captures(&EVENT, raw)
        .into_iter()
        .filter(|event| !event.is_empty())
        .collect();

    let mut variable_updates = VariableState::new();
    for block in captures(&VARS, raw) {
        if let Some(update) = json_object("vars", &block) {
            variable_updates.extend(update);
        }
    }
    let init_variables = captures(&INITVAR, raw)
        .last()
        .and_then(|block| json_object("initvar", block));

    let mut screen = raw.to_string();
    for pattern in [&*THINK, &*OPTIONS, &*EVENT, &*VARS, &*INITVAR] {
        screen = pattern.replace_all(&screen, "").into_owned();
    }
    let response = BLANK_RUNS.replace_all(screen.trim(), "\n\n").into_owned();

    ParsedResponse {
        response,
        reasoning: (!reasoning.is_empty()).then(|| reasoning.join("\n")),
        next_prompts,
        events,
        variable_updates,
        init_variables,
    }
}

pub struct ResponseParsingStage {
    descriptor: StageDescriptor,
}

impl Default for ResponseParsingStage {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseParsingStage {
    pub fn new() -> Self {
        Self {
            descriptor: StageDescriptor::new(ids::RESPONSE_PARSING)
                .inputs([fields::RAW_RESPONSE])
                .outputs([
                    fields::RESPONSE,
                    fields::REASONING,
                    fields::NEXT_PROMPTS,
                    fields::EVENTS,
                    fields::VARIABLE_UPDATES,
                    fields::INIT_VARIABLES,
                ])
                .then(ids::RESPONSE_HOOKS),
        }
    }
}

#[async_trait]
impl Stage for ResponseParsingStage {
    fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    async fn transform(&self, input: FieldMap) -> Result<FieldMap, StageError> {
        let parsed = parse_response(input.require_str(fields::RAW_RESPONSE)?);

        let strings = |items: Vec<String>| Value::Array(items.into_iter().map(Value::String).collect());
        let mut output = FieldMap::new();
        output.insert(fields::RESPONSE.to_string(), Value::String(parsed.response));
        output.insert(
            fields::REASONING.to_string(),
            parsed.reasoning.map(Value::String).unwrap_or(Value::Null),
        );
        output.insert(fields::NEXT_PROMPTS.to_string(), strings(parsed.next_prompts));
        output.insert(fields::EVENTS.to_string(), strings(parsed.events));
        output.insert(
            fields::VARIABLE_UPDATES.to_string(),
            Value::Object(parsed.variable_updates),
        );
        output.insert(
            fields::INIT_VARIABLES.to_string(),
            parsed.init_variables.map(Value::Object).unwrap_or(Value::Null),
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_all_sections() {
        let raw = "<think>they want gold</think>You dig and find coins.\n\n\n\
                   <vars>{\"gold\": 10, \"shovel\": null}</vars>\n\
                   <event>found_treasure</event>\n\
                   <options>\n- Dig deeper\n2. Leave\n\n</options>";
        let parsed = parse_response(raw);

        assert_eq!(parsed.response, "You dig and find coins.");
        assert_eq!(parsed.reasoning.as_deref(), Some("they want gold"));
        assert_eq!(parsed.next_prompts, vec!["Dig deeper", "Leave"]);
        assert_eq!(parsed.events, vec!["found_treasure"]);
        assert_eq!(Value::Object(parsed.variable_updates), json!({"gold": 10, "shovel": null}));
        assert!(parsed.init_variables.is_none());
    }

    #[test]
    fn later_vars_blocks_win_and_bad_json_is_ignored() {
        let raw = "<vars>{\"hp\": 1}</vars><vars>not json</vars><vars>{\"hp\": 2}</vars>ok";
        let parsed = parse_response(raw);
        assert_eq!(Value::Object(parsed.variable_updates), json!({"hp": 2}));
        assert_eq!(parsed.response, "ok");
    }

    #[test]
    fn initvar_and_thinking_variant() {
        let raw = "<thinking>a</thinking><thinking>b</thinking>Begin.<initvar>{\"hp\": 100}</initvar>";
        let parsed = parse_response(raw);
        assert_eq!(parsed.reasoning.as_deref(), Some("a\nb"));
        assert_eq!(parsed.init_variables.map(Value::Object), Some(json!({"hp": 100})));
        assert_eq!(parsed.response, "Begin.");
    }

    #[test]
    fn plain_text_passes_through() {
        let parsed = parse_response("  Just a reply.  ");
        assert_eq!(parsed, ParsedResponse {
            response: "Just a reply.".to_string(),
            ..Default::default()
        });
    }
}
