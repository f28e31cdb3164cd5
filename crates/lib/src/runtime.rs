//! Wires config into a running agent: model, fetcher, search, channels, scheduler, dispatcher.
//!
//! Inbound messages from every channel go through one mpsc queue; each message is
//! handled in its own task so a slow model call never blocks the next message.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::channels::{Author, ChannelHandle, ChannelRegistry, ConsoleChannel, InboundMessage};
use crate::config::{self, Config};
use crate::context::{load_system_prompt, ConversationContextBuilder, SystemPrompt};
use crate::dispatch::{DispatchSettings, Dispatcher};
use crate::fetch::HttpFetcher;
use crate::llm::{ChatModel, OllamaClient};
use crate::scheduler::{ChannelDelivery, Scheduler};
use crate::search::{DisabledSearch, DuckDuckGoSearch, SearchProvider};

const INBOUND_QUEUE: usize = 64;

/// System directive for `config`: the static `systemPrompt`, overridden by
/// `<workspace>/SYSTEM.md`, which is re-read on every context build.
pub fn system_prompt(config: &Config, workspace: &Path) -> SystemPrompt {
    let base = match &config.agents.system_prompt {
        Some(p) => SystemPrompt::fixed(p.clone()),
        None => SystemPrompt::none(),
    };
    let workspace = workspace.to_path_buf();
    base.with_provider(move || load_system_prompt(Some(&workspace)))
}

/// Build the dispatcher and its collaborators from config.
pub fn build_dispatcher(
    config: &Config,
    config_path: &Path,
    model_override: Option<&str>,
    scheduler: Scheduler,
) -> Dispatcher {
    let model_name = config::resolve_model(config, model_override);
    let ollama = OllamaClient::new(config::resolve_ollama_base_url(config), model_name);
    spawn_model_check(ollama.clone());

    let settings = DispatchSettings::from_config(config);
    let fetcher = HttpFetcher::new(config.dispatch.fetch_max_chars, settings.upstream_timeout)
        .allow_private_hosts(config.dispatch.fetch_allow_private_hosts);
    let search: Arc<dyn SearchProvider> = if config.search.enabled {
        Arc::new(DuckDuckGoSearch::new(config.search.max_results))
    } else {
        log::info!("web search disabled by config");
        Arc::new(DisabledSearch)
    };
    let workspace = config::resolve_workspace_dir(config, config_path);
    log::debug!("workspace: {}", workspace.display());
    let context = ConversationContextBuilder::new(system_prompt(config, &workspace));
    let model: Arc<dyn ChatModel> = Arc::new(ollama);
    Dispatcher::new(
        model,
        Arc::new(fetcher),
        search,
        context,
        scheduler,
        settings,
    )
}

/// Warn early when the configured model is not installed; the first reply would fail anyway.
fn spawn_model_check(ollama: OllamaClient) {
    tokio::spawn(async move {
        match ollama.list_models().await {
            Ok(models) => {
                if !models.iter().any(|m| m.name == ollama.model()) {
                    log::warn!(
                        "model {} not found in ollama (have: {})",
                        ollama.model(),
                        models
                            .iter()
                            .map(|m| m.name.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                }
            }
            Err(e) => log::warn!("ollama model discovery failed: {}", e),
        }
    });
}

async fn process_inbound_message(
    dispatcher: Arc<Dispatcher>,
    registry: Arc<ChannelRegistry>,
    msg: InboundMessage,
) {
    let Some(handle) = registry.get(&msg.channel_id).await else {
        log::warn!("inbound: message from unregistered channel {}", msg.channel_id);
        return;
    };
    dispatcher.handle(&msg, handle.as_ref()).await;
}

/// Drain `inbound_rx`, handling each message in its own task. Returns once the queue
/// is closed and every in-flight message has been answered.
pub async fn process_inbound(
    dispatcher: Arc<Dispatcher>,
    registry: Arc<ChannelRegistry>,
    mut inbound_rx: mpsc::Receiver<InboundMessage>,
) {
    let mut tasks = JoinSet::new();
    while let Some(msg) = inbound_rx.recv().await {
        tasks.spawn(process_inbound_message(
            dispatcher.clone(),
            registry.clone(),
            msg,
        ));
        while tasks.try_join_next().is_some() {}
    }
    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            log::warn!("inbound: message task failed: {}", e);
        }
    }
}

/// Run an interactive console session until EOF, `/exit`, or Ctrl+C.
pub async fn run_console(
    config: Config,
    config_path: PathBuf,
    model_override: Option<String>,
) -> Result<()> {
    let bot = Author::bot(config.bot.id.clone(), config.bot.name.clone());
    let user = Author::human("console-user", whoami_or_default());
    let console = Arc::new(ConsoleChannel::new(bot, user));

    let registry = Arc::new(ChannelRegistry::new());
    registry
        .register(console.id().to_string(), console.clone())
        .await;

    let scheduler = Scheduler::new();
    scheduler.start(Arc::new(ChannelDelivery::new(registry.clone())));

    let dispatcher = Arc::new(build_dispatcher(
        &config,
        &config_path,
        model_override.as_deref(),
        scheduler.clone(),
    ));

    let (inbound_tx, inbound_rx) = mpsc::channel::<InboundMessage>(INBOUND_QUEUE);
    let _stdin_task = console.clone().start_inbound(inbound_tx);
    let processor = tokio::spawn(process_inbound(
        dispatcher.clone(),
        registry.clone(),
        inbound_rx,
    ));

    println!(
        "courier chat: mention is implicit, {} HH:MM <message> schedules, /exit quits",
        dispatcher.settings().schedule_prefix
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("interrupted, shutting down");
        }
        res = processor => {
            if let Err(e) = res {
                log::warn!("inbound processor failed: {}", e);
            }
            log::info!("console closed, shutting down");
        }
    }

    scheduler.stop().await;
    registry.stop_all().await;
    Ok(())
}

fn whoami_or_default() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "user".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_file_overrides_static_prompt_and_is_reread() {
        let dir = std::env::temp_dir().join(format!("courier-rt-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut config = Config::default();
        config.agents.system_prompt = Some("static prompt".into());

        let prompt = system_prompt(&config, &dir);
        assert_eq!(prompt.resolve().as_deref(), Some("static prompt"));

        std::fs::write(dir.join("SYSTEM.md"), "from workspace").unwrap();
        assert_eq!(prompt.resolve().as_deref(), Some("from workspace"));

        std::fs::write(dir.join("SYSTEM.md"), "edited").unwrap();
        assert_eq!(prompt.resolve().as_deref(), Some("edited"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn no_prompt_anywhere_resolves_to_none() {
        let dir = std::env::temp_dir().join(format!("courier-rt-{}", uuid::Uuid::new_v4()));
        let prompt = system_prompt(&Config::default(), &dir);
        assert_eq!(prompt.resolve(), None);
    }
}
