//! A lottery where several agencies submit bets to one server over TCP.
//!
//! Agencies stream their bets in batches; the server appends every batch to
//! a ledger and acknowledges it. Once every agency has announced it is done,
//! the server draws the winners once and tells each agency which of its
//! bettors won. Each module focuses on a concrete responsibility:
//!
//! - [`codec`] maps typed records to ordered string fields via static schemas.
//! - [`framer`] turns byte streams into comma-separated, newline-terminated
//!   records and back.
//! - [`message`] defines the protocol messages and a typed [`message::Connection`].
//! - [`server`] accepts agencies; [`handler`] serves one of them.
//! - [`registry`], [`store`] and [`coordinator`] hold the shared server state:
//!   who is connected, the bet ledger and the draw barrier.
//! - [`client`] submits a [`dataset`] on behalf of one agency.
//! - [`shutdown`] carries cooperative cancellation through all of it.
//!
//! Integration tests drive the server and client in-process over real
//! sockets; an end-to-end test runs the binary.

pub mod bet;
pub mod cli;
pub mod client;
pub mod codec;
pub mod coordinator;
pub mod dataset;
pub mod framer;
pub mod handler;
pub mod message;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod store;
