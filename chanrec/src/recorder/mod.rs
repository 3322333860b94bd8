//! Recording primitives: stream capture, chat logging and finalization.
//!
//! Each primitive sits behind a trait so the supervisor can be driven with
//! in-process fakes.

pub mod capture;
pub mod chat;
pub mod finalizer;

pub use capture::{CaptureHandle, CaptureStatus, StreamCapture, StreamlinkCapture};
pub use chat::{ChatFeed, ChatMessage, ChatRecord, ChatRecorder, ChatSubscription, TwitchIrcFeed};
pub use finalizer::{ArchivedPaths, FfmpegFinalizer, Finalizer};
