//! Execution runtime for overlapped communication and computation
//!
//! A [`Lane`] is an ordered queue of operations drained by its own worker
//! thread. Lanes only order against each other through
//! [`CompletionToken`]s: one lane records a token, another waits on it.
//! [`BufferPool`] holds the per-chunk slots handed between lanes and audits
//! every hand-off.
//!
//! ```text
//!  issuing thread ──enqueue──▶ input-comm ──token──▶ compute ──token──▶ output-comm
//!                                  │                    │                    │
//!                             input pool ─────────▶ output pool ─────────▶ results
//! ```

pub mod buffers;
pub mod lane;
pub mod token;

pub use buffers::{BufferAudit, BufferPool, SlotReader, SlotWriter};
pub use lane::{Lane, LaneOptions, LaneSet, LaneStats};
pub use token::CompletionToken;
