//! Consume ZeroMQ PULL sockets one message at a time.
//!
//! [`PullConsumer`](zmq::PullConsumer) is the blocking handle: connect once,
//! then call [`consume`](zmq::PullConsumer::consume) for each message.
//! [`BackgroundConsumer`](zmq::BackgroundConsumer) wraps the same loop on a
//! dedicated thread for use from tokio.

pub mod config;
pub mod zmq;

pub use config::PullConfig;
pub use crate::zmq::{BackgroundConsumer, PullConsumer};
