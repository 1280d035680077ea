//! drover-intelligence — the LLM layer behind the reviewer, summarizer,
//! watchdog, and notification query paths.
//!
//! The heavy lifting (writing code) belongs to the external agent CLI; this
//! crate only makes cheap classification and extraction calls.

pub mod classify;
pub mod llm;
