//! A reliable/sequenced/unreliable multi-bus fragmented message delivery
//! layer on top of an unordered, unreliable datagram transport.
//!
//! A [`context::Context`] owns every pooled entity ([`sender::Sender`],
//! [`dispatcher::Dispatcher`], [`receiver::Receiver`], [`endpoint::Endpoint`])
//! behind generation-checked [`pool::Handle`]s, drives them through small
//! linear [`pipeline::Pipeline`]s, and treats the datagram socket, checksum
//! algorithm, off-thread work submission, callback serialisation, and
//! platform timers as external collaborators defined in `parcel_io`.
//!
//! An embedding application owns one `Context`, calls
//! [`context::Context::create_endpoint`] per peer connection, feeds inbound
//! datagrams to [`context::Context::recv_datagram`] (or lets
//! [`context::Context::poll_transports`] pull them), submits outbound data
//! via [`context::Context::send`], and calls [`context::Context::poll`]
//! periodically to drive timers and off-thread completions. Completed
//! deliveries are drained with [`context::Context::drain_deliveries`].

pub mod bus;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod fragment;
pub mod heartbeat;
pub mod packet;
pub mod parcel;
pub mod pending_result;
pub mod pipeline;
pub mod pool;
pub mod receiver;
pub mod rtt;
pub mod sender;
pub mod stats;
pub mod system;
pub mod timer_flag;

pub use config::Config;
pub use context::{Context, Delivery};
pub use parcel::{Parcel, ParcelReader, ParcelWriter};
pub use pool::Handle;
pub use sender::Transmission;
pub use stats::Stats;
