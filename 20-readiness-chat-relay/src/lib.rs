//! Multiplexed TCP chat relay driven by a single readiness loop.
//!
//! One thread waits for socket readiness, accepts new clients and relays
//! whatever a client sends, verbatim, to every other client. There is no
//! framing: a message is whatever one drain of a socket returned.
//!
//! - [`registry`] tracks the listening socket and client connections
//!   subscribed to the poller.
//! - [`event_loop`] blocks for readiness and dispatches tagged events.
//! - [`fanout`] writes one message to every connection but its source.
//! - [`message`] drains non-blocking readers and writes raw text.
//! - [`server`] is the relay dispatcher; [`client`] connects, prints what it
//!   receives from a background loop and forwards stdin.
//! - [`cli`] parses the command-line interface for both modes.

pub mod cli;
pub mod client;
pub mod event_loop;
pub mod fanout;
pub mod message;
pub mod registry;
pub mod server;
