//! Support Responder: answers support mail with LLM-drafted replies.

pub mod config;
pub mod error;
pub mod llm;
pub mod mail;
pub mod pipeline;
pub mod store;
