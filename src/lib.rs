#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::doc_markdown,
    clippy::items_after_statements,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::new_without_default,
    clippy::redundant_closure_for_method_calls,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

pub mod config;
pub mod coordination;
pub mod daemon;
pub mod gateway;
pub mod health;
pub mod heartbeat;
pub mod observability;
pub mod transport;

pub use config::Config;
pub use coordination::{
    AgentRegistration, Envelope, MessageType, RouterError, TaskRequest, TaskResponse,
    TaskRouter, TaskStatus,
};
pub use transport::{InProcessTransport, MessageHandler, TaskClient, Transport};
