//! A Maelstrom node that talks newline-delimited JSON over stdin/stdout.
//!
//! Each module focuses on one concern:
//!
//! - [`message`] defines the envelope and body wire shapes.
//! - [`codec`] frames envelopes as JSON lines on async readers and writers.
//! - [`identity`] holds the node id, cluster membership and message-id counter.
//! - [`dispatch`] maps message types to [`dispatch::Handler`]s.
//! - [`handlers`] provides the built-in `init`, `echo` and `generate` handlers.
//! - [`engine`] wires decoder, worker pool and writer together and owns the
//!   shutdown protocol.
//! - [`cli`] parses the binary's flags into an [`engine::EngineConfig`].
//! - [`error`] holds the error types shared by the modules above.

pub mod cli;
pub mod codec;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod message;
