//! Communication channels.
//!
//! Channel trait and registry so the runtime can start/stop channel connectors,
//! read conversation history and deliver replies. Platform transports implement
//! [`ChannelHandle`]; the console channel is the in-process one.

mod console;
mod inbound;
mod registry;

pub use console::{ConsoleChannel, CONSOLE_CONVERSATION};
pub use inbound::{Author, HistoryMessage, InboundMessage};
pub use registry::{ChannelError, ChannelHandle, ChannelRegistry};
