//! External collaborator traits for the parcelnet reliability layer.
//!
//! `parcel_transport` is deliberately agnostic to the concrete datagram
//! socket, crypto library, and platform scheduling primitives it runs on top
//! of. This crate defines the narrow interfaces those collaborators must
//! satisfy: [`transport::Transport`] (the raw send/recv socket),
//! [`worker::Checksum`] and [`worker::Worker`] (checksum computation offload),
//! [`timer::TimerDriver`] (resend/expiry/heartbeat timers), and
//! [`sequencer::Sequencer`] (deferred-callback serialisation onto one owning
//! thread).
//!
//! Each trait also ships a minimal in-line implementation suitable for
//! single-threaded, deterministic tests: [`sequencer::InlineSequencer`] and
//! [`worker::InlineWorker`].

pub mod clock;
pub mod sequencer;
pub mod timer;
pub mod transport;
pub mod worker;

pub use web_time::Instant;
