//! STOMP 1.2 client over TCP
//!
//! - [`frame`] - frame model and well-known commands/headers
//! - [`codec`] - `tokio_util` codec with STOMP header escaping
//! - [`client`] - [`StompClient`] session and [`StompConnector`]

pub mod client;
pub mod codec;
pub mod frame;

pub use client::{StompClient, StompConnector};
pub use codec::StompCodec;
pub use frame::Frame;
