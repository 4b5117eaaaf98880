//! # Core Infrastructure Module
//!
//! Hand-off primitives shared between the caller thread and the pump thread.

pub mod mailbox;

pub use mailbox::{Delivery, FrameMailbox, Handoff, MailboxStats};
