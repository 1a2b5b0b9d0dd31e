//! Reply pipeline.
//!
//! Every unhandled message in a watched folder flows through:
//! 1. `ReplyDrafter::draft()` - LLM reply, or the static fallback
//! 2. `Confirmer::confirm()` - operator approval when enabled
//! 3. `ReplySender::send()` - SMTP delivery plus a saved copy
//!
//! `Poller` drives the loop and records handled messages in the dedup store.

pub mod confirm;
pub mod drafter;
pub mod poller;

pub use confirm::{AutoApprove, Confirmer, Decision, PromptConfirmer, TerminalConfirmer};
pub use drafter::{Draft, LlmDrafter, ReplyDrafter};
pub use poller::{CycleReport, Pacer, PollState, Poller, PollerConfig, PollerDeps, TokioPacer};
