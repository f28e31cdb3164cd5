//! Courier core library: intent classification, dispatch, web fetch/search, channels,
//! and the one-shot message scheduler used by the CLI.

pub mod channels;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod fetch;
pub mod init;
pub mod intent;
pub mod llm;
pub mod runtime;
pub mod scheduler;
pub mod search;
