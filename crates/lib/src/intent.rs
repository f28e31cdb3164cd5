//! Intent classification: ask the model to analyse a question with a fixed template,
//! then decode its tagged-field answer into an [`IntentResult`].
//!
//! The decoder is strict and fails closed: a reply with no recognised field, or a
//! boolean field holding anything but true/false, is a parse failure and the
//! classifier degrades to the all-false intent (plain chat).

use std::sync::Arc;
use std::time::Duration;

use crate::llm::{bounded, ChatMessage, ChatModel};

/// Analysis template; `{question}` is the only substitution.
pub const ANALYSIS_TEMPLATE: &str = "\
あなたは与えられた質問を分析するアシスタントです。次の点を判断してください：
1. 最新の情報が必要かどうか
2. URLが含まれているかどうか
3. 画像生成が必要かどうか

質問: {question}

以下の形式で、各項目を1行ずつ、説明を付けずに応答してください：
NEEDS_SEARCH: true または false（最新の情報が必要な場合は true）
HAS_URL: true または false（URLが含まれている場合は true）
SEARCH_QUERY: 検索クエリ（NEEDS_SEARCH が true の場合のみ）
NEEDS_GENERATEIMG: true または false（画像生成が必要な場合は true）
IMAGE_QUERY: 画像生成プロンプト（NEEDS_GENERATEIMG が true の場合のみ。英語で書いてください）
IMAGE_QUERY_mini: 画像の特定の視覚要素に絞った短い画像生成プロンプト（NEEDS_GENERATEIMG が true の場合のみ。英語で書いてください）
";

/// Structured intent of one message. Only [`decode_intent`] builds non-default values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntentResult {
    pub needs_search: bool,
    pub has_url: bool,
    /// Only ever set when `needs_search` is true.
    pub search_query: Option<String>,
    pub needs_image: bool,
    pub image_query: Option<String>,
    pub image_query_short: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntentParseError {
    #[error("classifier reply contained no recognised field")]
    NoFields,
    #[error("field {field} has non-boolean value {value:?}")]
    InvalidBool { field: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    NeedsSearch,
    HasUrl,
    SearchQuery,
    NeedsImage,
    ImageQuery,
    ImageQueryShort,
}

impl Field {
    fn tag(self) -> &'static str {
        match self {
            Field::NeedsSearch => "NEEDS_SEARCH",
            Field::HasUrl => "HAS_URL",
            Field::SearchQuery => "SEARCH_QUERY",
            Field::NeedsImage => "NEEDS_GENERATEIMG",
            Field::ImageQuery => "IMAGE_QUERY",
            Field::ImageQueryShort => "IMAGE_QUERY_mini",
        }
    }
}

// `IMAGE_QUERY_mini` before `IMAGE_QUERY` so the longer tag wins.
const FIELDS: [Field; 6] = [
    Field::NeedsSearch,
    Field::HasUrl,
    Field::SearchQuery,
    Field::NeedsImage,
    Field::ImageQueryShort,
    Field::ImageQuery,
];

/// Split a line into (field, raw value) if it starts with a known tag and a colon.
fn parse_line(line: &str) -> Option<(Field, &str)> {
    let line = line.trim();
    let line = line
        .strip_prefix("- ")
        .or_else(|| line.strip_prefix("* "))
        .unwrap_or(line)
        .trim_start();
    FIELDS.iter().find_map(|&f| {
        let rest = line.strip_prefix(f.tag())?;
        let value = rest.trim_start().strip_prefix(':')?;
        Some((f, value.trim()))
    })
}

fn strip_brackets(value: &str) -> &str {
    value
        .strip_prefix('[')
        .and_then(|v| v.strip_suffix(']'))
        .unwrap_or(value)
        .trim()
}

fn parse_bool(field: Field, value: &str) -> Result<bool, IntentParseError> {
    let v = strip_brackets(value);
    if v.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if v.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err(IntentParseError::InvalidBool {
            field: field.tag(),
            value: value.to_string(),
        })
    }
}

fn parse_text(value: &str) -> Option<String> {
    let v = strip_brackets(value);
    if v.is_empty() {
        None
    } else {
        Some(v.to_string())
    }
}

/// Decode the model's tagged-field reply. First occurrence of a tag wins.
pub fn decode_intent(reply: &str) -> Result<IntentResult, IntentParseError> {
    let mut seen: Vec<Field> = Vec::new();
    let mut out = IntentResult::default();
    for (field, value) in reply.lines().filter_map(parse_line) {
        if seen.contains(&field) {
            continue;
        }
        seen.push(field);
        match field {
            Field::NeedsSearch => out.needs_search = parse_bool(field, value)?,
            Field::HasUrl => out.has_url = parse_bool(field, value)?,
            Field::NeedsImage => out.needs_image = parse_bool(field, value)?,
            Field::SearchQuery => out.search_query = parse_text(value),
            Field::ImageQuery => out.image_query = parse_text(value),
            Field::ImageQueryShort => out.image_query_short = parse_text(value),
        }
    }
    if seen.is_empty() {
        return Err(IntentParseError::NoFields);
    }
    if !out.needs_search {
        out.search_query = None;
    }
    if !out.needs_image {
        out.image_query = None;
        out.image_query_short = None;
    }
    Ok(out)
}

/// Render the analysis template for one question.
pub fn render_template(question: &str) -> String {
    ANALYSIS_TEMPLATE.replace("{question}", question)
}

/// Classifies questions with one model call each.
pub struct IntentClassifier<M: ?Sized> {
    model: Arc<M>,
    timeout: Duration,
}

impl<M: ChatModel + ?Sized> IntentClassifier<M> {
    pub fn new(model: Arc<M>, timeout: Duration) -> Self {
        Self { model, timeout }
    }

    /// Classify `question`. Never fails: upstream errors and malformed replies yield the default intent.
    pub async fn classify(&self, question: &str) -> IntentResult {
        let prompt = render_template(question);
        let call = self.model.chat(vec![ChatMessage::user(prompt)]);
        let reply = match bounded(self.timeout, call).await {
            Ok(r) => r,
            Err(e) => {
                log::warn!("intent: classification call failed: {}", e);
                return IntentResult::default();
            }
        };
        match decode_intent(&reply) {
            Ok(intent) => {
                log::debug!("intent: {:?}", intent);
                intent
            }
            Err(e) => {
                log::warn!("intent: could not decode classifier reply: {}", e);
                IntentResult::default()
            }
        }
    }
}
