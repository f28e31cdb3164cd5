//! Per-message dispatch: decide how to answer one inbound message and send the reply.
//!
//! Commands (`!schedule`, `!time`) short-circuit the pipeline. Everything else is
//! classified once and answered with a URL summary, a search-augmented reply, or a
//! plain conversational reply built from channel history.

use chrono::Local;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use crate::channels::{ChannelError, ChannelHandle, InboundMessage};
use crate::config::Config;
use crate::context::ConversationContextBuilder;
use crate::fetch::{extract_urls, WebContentFetcher};
use crate::intent::{IntentClassifier, IntentResult};
use crate::llm::{bounded, ChatMessage, ChatModel, UpstreamError};
use crate::scheduler::{parse_time_of_day, DeliveryTarget, Scheduler, SchedulerError};
use crate::search::SearchProvider;

pub const URL_SUMMARY_PREFIX: &str = "**URLを要約中...**\n\n";
pub const SEARCH_PREFIX: &str = "**Webを検索中...**\n\n";
pub const SCHEDULE_FORMAT_ERROR: &str =
    "形式が正しくありません。`!schedule HH:MM メッセージ` の形式で入力してください。";

const SCHEDULER_STOPPED: &str =
    "スケジューラーが停止しているため、メッセージをスケジュールできません。";

const TIMEOUT_APOLOGY: &str =
    "すみません、応答の生成がタイムアウトしました。しばらくしてからもう一度お試しください。";
const UNAVAILABLE_APOLOGY: &str =
    "すみません、現在応答を生成できません。しばらくしてからもう一度お試しください。";

/// `[<#conversation>] <time> <payload>`; the payload may span lines.
static SCHEDULE_ARGS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?s)(?:<#([\w-]+)>\s+)?(\S+)\s+(.*\S.*)$").expect("valid schedule regex")
});

/// How one message is answered. Derived once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchDecision {
    PlainChat,
    SearchAugmented(String),
    UrlSummary(String),
    ScheduleCommand(ScheduleRequest),
    TimeQuery,
}

/// A well-formed `!schedule` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleRequest {
    /// `HH:MM`, already validated as a time of day.
    pub time: String,
    pub payload: String,
    /// Delivery conversation from `<#id>`; `None` means the conversation the command came from.
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("malformed schedule command: {0}")]
    MalformedSchedule(String),
}

#[derive(Debug, thiserror::Error)]
enum ReplyError {
    #[error("reading history: {0}")]
    History(#[from] ChannelError),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

/// Dispatcher knobs, usually taken from the `bot` and `dispatch` config sections.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub bot_id: String,
    pub schedule_prefix: String,
    pub time_prefix: String,
    pub history_limit: usize,
    pub upstream_timeout: Duration,
    pub augmented_directive: Option<String>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl DispatchSettings {
    pub fn from_config(config: &Config) -> Self {
        let d = &config.dispatch;
        Self {
            bot_id: config.bot.id.clone(),
            schedule_prefix: d.schedule_prefix.clone(),
            time_prefix: d.time_prefix.clone(),
            history_limit: d.history_limit,
            upstream_timeout: d.upstream_timeout(),
            augmented_directive: d
                .augmented_directive
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        }
    }
}

/// Answers inbound messages. Holds no per-message state, so one instance is shared across tasks.
pub struct Dispatcher {
    model: Arc<dyn ChatModel>,
    classifier: IntentClassifier<dyn ChatModel>,
    fetcher: Arc<dyn WebContentFetcher>,
    search: Arc<dyn SearchProvider>,
    context: ConversationContextBuilder,
    scheduler: Scheduler,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        model: Arc<dyn ChatModel>,
        fetcher: Arc<dyn WebContentFetcher>,
        search: Arc<dyn SearchProvider>,
        context: ConversationContextBuilder,
        scheduler: Scheduler,
        settings: DispatchSettings,
    ) -> Self {
        let classifier = IntentClassifier::new(model.clone(), settings.upstream_timeout);
        Self {
            model,
            classifier,
            fetcher,
            search,
            context,
            scheduler,
            settings,
        }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Handle one inbound message: ignore it, or answer with a threaded reply on `channel`.
    /// Returns the reply text that was sent.
    pub async fn handle(&self, msg: &InboundMessage, channel: &dyn ChannelHandle) -> Option<String> {
        if msg.author.is_bot {
            log::debug!("dispatch: ignoring bot message {}", msg.message_id);
            return None;
        }
        if !msg.mentions_user(&self.settings.bot_id) {
            return None;
        }
        let prompt = strip_bot_mention(&msg.text, &self.settings.bot_id);
        let reply = match self.decide(&prompt).await {
            Ok(decision) => {
                log::info!(
                    "dispatch: {} in {}/{} -> {:?}",
                    msg.message_id,
                    msg.channel_id,
                    msg.conversation_id,
                    decision
                );
                self.execute(decision, msg, &prompt, channel).await
            }
            Err(e) => {
                log::info!("dispatch: {}", e);
                SCHEDULE_FORMAT_ERROR.to_string()
            }
        };
        let reply = sanitize_reply(&reply);
        if reply.is_empty() {
            log::warn!("dispatch: empty reply for {}, nothing sent", msg.message_id);
            return None;
        }
        if let Err(e) = channel
            .reply(&msg.conversation_id, &msg.message_id, &reply)
            .await
        {
            log::warn!("dispatch: failed to send reply to {}: {}", msg.message_id, e);
            return None;
        }
        Some(reply)
    }

    /// Decide the strategy for a working prompt (bot mention already removed).
    pub async fn decide(&self, prompt: &str) -> Result<DispatchDecision, CommandError> {
        if let Some(args) = strip_command(prompt, &self.settings.schedule_prefix) {
            return parse_schedule_args(args).map(DispatchDecision::ScheduleCommand);
        }
        if strip_command(prompt, &self.settings.time_prefix).is_some() {
            return Ok(DispatchDecision::TimeQuery);
        }
        let intent = self.classifier.classify(prompt).await;
        Ok(decision_from_intent(&intent, prompt))
    }

    async fn execute(
        &self,
        decision: DispatchDecision,
        msg: &InboundMessage,
        prompt: &str,
        channel: &dyn ChannelHandle,
    ) -> String {
        match decision {
            DispatchDecision::ScheduleCommand(req) => self.register(req, msg, channel),
            DispatchDecision::TimeQuery => Local::now().format("%H:%M").to_string(),
            DispatchDecision::UrlSummary(url) => {
                let content = self.fetch_page(&url).await;
                let augmented = url_prompt(&content, prompt);
                self.augmented_reply(URL_SUMMARY_PREFIX, augmented, msg, channel)
                    .await
            }
            DispatchDecision::SearchAugmented(query) => {
                let results = self.run_search(&query).await;
                let augmented = search_prompt(&results, prompt);
                self.augmented_reply(SEARCH_PREFIX, augmented, msg, channel)
                    .await
            }
            DispatchDecision::PlainChat => match self.generate(msg, channel, None).await {
                Ok(reply) => reply,
                Err(e) => apology(msg, &e),
            },
        }
    }

    fn register(
        &self,
        req: ScheduleRequest,
        msg: &InboundMessage,
        channel: &dyn ChannelHandle,
    ) -> String {
        let conversation = req
            .conversation_id
            .clone()
            .unwrap_or_else(|| msg.conversation_id.clone());
        if !channel.knows_conversation(&conversation) {
            log::info!(
                "dispatch: schedule target {} unknown to {}",
                conversation,
                channel.id()
            );
            return format!("<#{}> にはメッセージを送信できません。", conversation);
        }
        let target = DeliveryTarget::new(msg.channel_id.clone(), conversation);
        match self.scheduler.schedule(&req.time, req.payload, target) {
            Ok(_) => match &req.conversation_id {
                Some(c) => format!("{} に <#{}> でメッセージをスケジュールしました", req.time, c),
                None => format!("{} にメッセージをスケジュールしました", req.time),
            },
            Err(SchedulerError::Stopped) => {
                log::warn!("dispatch: schedule refused, scheduler stopped");
                SCHEDULER_STOPPED.to_string()
            }
            Err(e) => {
                log::info!("dispatch: schedule rejected: {}", e);
                SCHEDULE_FORMAT_ERROR.to_string()
            }
        }
    }

    async fn fetch_page(&self, url: &str) -> String {
        let limit = self.settings.upstream_timeout;
        match tokio::time::timeout(limit, self.fetcher.fetch(url)).await {
            Ok(text) => text,
            Err(_) => {
                log::warn!("dispatch: fetching {} timed out", url);
                format!("Error fetching webpage: timed out after {:?}", limit)
            }
        }
    }

    async fn run_search(&self, query: &str) -> String {
        match bounded(self.settings.upstream_timeout, self.search.search(query)).await {
            Ok(results) => results,
            Err(e) => {
                log::warn!("dispatch: search for {:?} failed: {}", query, e);
                format!("Error searching the web: {}", e)
            }
        }
    }

    async fn augmented_reply(
        &self,
        prefix: &str,
        augmented: String,
        msg: &InboundMessage,
        channel: &dyn ChannelHandle,
    ) -> String {
        match self.generate(msg, channel, Some(augmented)).await {
            Ok(reply) => {
                let reply = sanitize_reply(&reply);
                if reply.is_empty() {
                    reply
                } else {
                    format!("{}{}", prefix, reply)
                }
            }
            Err(e) => apology(msg, &e),
        }
    }

    /// History context, then the augmented prompt and directive when given, then one model call.
    async fn generate(
        &self,
        msg: &InboundMessage,
        channel: &dyn ChannelHandle,
        augmented: Option<String>,
    ) -> Result<String, ReplyError> {
        let context = self
            .context
            .build(channel, &msg.conversation_id, self.settings.history_limit)
            .await?;
        let mut messages: Vec<ChatMessage> =
            context.iter().map(|m| m.to_chat_message()).collect();
        if let Some(augmented) = augmented {
            messages.push(ChatMessage::user(augmented));
            if let Some(directive) = &self.settings.augmented_directive {
                messages.push(ChatMessage::system(directive.clone()));
            }
        }
        let reply = bounded(self.settings.upstream_timeout, self.model.chat(messages)).await?;
        Ok(reply)
    }
}

fn apology(msg: &InboundMessage, e: &ReplyError) -> String {
    log::error!("dispatch: reply to {} failed: {}", msg.message_id, e);
    match e {
        ReplyError::Upstream(UpstreamError::Timeout(_)) => TIMEOUT_APOLOGY.to_string(),
        _ => UNAVAILABLE_APOLOGY.to_string(),
    }
}

/// Pick the strategy from a classification. A URL wins over search; flags without a
/// usable URL or query fall through.
pub fn decision_from_intent(intent: &IntentResult, prompt: &str) -> DispatchDecision {
    if intent.has_url {
        if let Some(url) = extract_urls(prompt).first() {
            return DispatchDecision::UrlSummary(url.to_string());
        }
        log::debug!("dispatch: has_url set but no URL in prompt");
    }
    if intent.needs_search {
        match intent.search_query.as_deref() {
            Some(q) => return DispatchDecision::SearchAugmented(q.to_string()),
            None => log::debug!("dispatch: needs_search set without a query"),
        }
    }
    DispatchDecision::PlainChat
}

/// Remove `<@id>` and `<@!id>` for the bot and trim.
pub fn strip_bot_mention(text: &str, bot_id: &str) -> String {
    text.replace(&format!("<@{}>", bot_id), "")
        .replace(&format!("<@!{}>", bot_id), "")
        .trim()
        .to_string()
}

/// If `prompt` starts with `prefix` followed by whitespace or the end, return the trimmed rest.
pub fn strip_command<'a>(prompt: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix.is_empty() {
        return None;
    }
    let rest = prompt.strip_prefix(prefix)?;
    match rest.chars().next() {
        None => Some(rest),
        Some(c) if c.is_whitespace() => Some(rest.trim()),
        Some(_) => None,
    }
}

/// Parse `[<#conversation>] HH:MM <payload>`.
pub fn parse_schedule_args(args: &str) -> Result<ScheduleRequest, CommandError> {
    let malformed = || CommandError::MalformedSchedule(args.to_string());
    let caps = SCHEDULE_ARGS_RE.captures(args.trim()).ok_or_else(malformed)?;
    let time = caps.get(2).map(|m| m.as_str()).ok_or_else(malformed)?;
    parse_time_of_day(time).map_err(|_| malformed())?;
    let payload = caps
        .get(3)
        .map(|m| m.as_str().trim())
        .filter(|p| !p.is_empty())
        .ok_or_else(malformed)?;
    Ok(ScheduleRequest {
        time: time.to_string(),
        payload: payload.to_string(),
        conversation_id: caps.get(1).map(|m| m.as_str().to_string()),
    })
}

pub fn url_prompt(content: &str, question: &str) -> String {
    format!(
        "以下のWebページの内容に基づいて適切な返答を考えてください。広告や関連記事などに気を取られないでください。\n\nWebページ内容: {}\n\n質問: {}",
        content, question
    )
}

pub fn search_prompt(results: &str, question: &str) -> String {
    format!(
        "以下の検索結果の内容に基づいて適切な返答を考えてください。広告や関連記事などに気を取られないでください。\nできるだけ最新の情報を含めて回答してください。\n\n検索結果: {}\n\n質問: {}",
        results, question
    )
}

/// Normalize model output for posting: LF line endings, no trailing spaces,
/// at most one blank line in a row, trimmed.
pub fn sanitize_reply(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n");
    let mut lines: Vec<&str> = Vec::new();
    let mut prev_blank = false;
    for line in normalized.lines() {
        let line = line.trim_end();
        let blank = line.is_empty();
        if blank && prev_blank {
            continue;
        }
        prev_blank = blank;
        lines.push(line);
    }
    lines.join("\n").trim().to_string()
}
