//! Run correlation: turns the gateway's `chat` event stream into durable,
//! exactly-once messages.
//!
//! A [`ChatSession`] owns the runs it started. When it closes mid-stream its
//! active runs move to the process-wide [`OrphanRegistry`], which persists
//! them once their terminal event arrives or their safety expiry passes.

pub mod orphan;
pub mod run;
pub mod session;
pub mod store;
pub mod tracker;

pub use {
    orphan::{HandOff, OrphanRegistry},
    run::{Run, RunPhase, RunSnapshot, RunUpdate},
    session::{ChatSession, SessionOptions},
    store::{
        MemoryMessageStore, Message, MessagePatch, MessageStatus, MessageStore, NewMessage,
        SqliteMessageStore,
    },
    tracker::{RunOwner, RunTracker},
};
