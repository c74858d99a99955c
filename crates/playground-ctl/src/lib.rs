//! Client side of the playground: finds instances and talks to their command servers.

pub mod client;
pub mod commands;
pub mod launcher;
pub mod target;

pub use client::{COMMAND_TIMEOUT, ClientError, fetch_display, send_command};
pub use commands::{ClientContext, NO_INSTANCES};
pub use launcher::{StartOptions, daemon_binary, start};
pub use target::{Target, TargetError, list_live, resolve_target, should_suggest_not_running};
