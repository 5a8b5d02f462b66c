//! Inline tool-call grammar
//!
//! Three syntaxes are recognized, tried in this order:
//!
//! 1. slash command: `/name args` alone on a line
//! 2. bracket tag: `[tool:name]params[/tool]`
//! 3. template brace: `{{name}}` or `{{name::params}}`
//!
//! A rule only claims text no earlier rule has claimed, so a brace inside a
//! slash-command line belongs to the slash command.

use std::ops::Range;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallSyntax {
    SlashCommand,
    BracketTag,
    TemplateBrace,
}

impl ToolCallSyntax {
    pub const ORDER: [ToolCallSyntax; 3] = [
        ToolCallSyntax::SlashCommand,
        ToolCallSyntax::BracketTag,
        ToolCallSyntax::TemplateBrace,
    ];

    fn pattern(self) -> &'static Regex {
        match self {
            ToolCallSyntax::SlashCommand => &*SLASH_COMMAND,
            ToolCallSyntax::BracketTag => &*BRACKET_TAG,
            ToolCallSyntax::TemplateBrace => &*TEMPLATE_BRACE,
        }
    }
}

static SLASH_COMMAND: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^[ \t]*/([A-Za-z][\w-]*)(?:[ \t]+([^\n]*))?$")
        .expect("Failed to compile slash command regex")
});
static BRACKET_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)\[tool:([A-Za-z][\w-]*)\](.*?)\[/tool\]")
        .expect("Failed to compile bracket tag regex")
});
static TEMPLATE_BRACE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)\{\{\s*([A-Za-z][\w-]*)\s*(?:::(.*?))?\}\}")
        .expect("Failed to compile template brace regex")
});

/// One detected invocation, normalized across syntaxes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolCall {
    pub syntax: ToolCallSyntax,
    pub tool_name: String,
    pub raw_params: String,
    /// Byte range of the whole call in the scanned text.
    pub span: Range<usize>,
}

/// Detect every tool call in `text`, returned in document order.
pub fn detect_tool_calls(text: &str) -> Vec<ToolCall> {
    let mut calls: Vec<ToolCall> = Vec::new();

    for syntax in ToolCallSyntax::ORDER {
        for captures in syntax.pattern().captures_iter(text) {
            let Some(whole) = captures.get(0) else {
                continue;
            };
            let span = whole.range();
            if calls.iter().any(|call| overlaps(&call.span, &span)) {
                continue;
            }
            let Some(name) = captures.get(1) else {
                continue;
            };
            let raw_params = captures
                .get(2)
                .map(|params| params.as_str().trim().to_string())
                .unwrap_or_default();

            calls.push(ToolCall {
                syntax,
                tool_name: name.as_str().to_string(),
                raw_params,
                span,
            });
        }
    }

    calls.sort_by_key(|call| call.span.start);
    calls
}

fn overlaps(a: &Range<usize>, b: &Range<usize>) -> bool {
    a.start < b.end && b.start < a.end
}
