pub(crate) use backend::BackendConnection;
pub(crate) use client::{ClientConnection, Outbox};
use tokio::io;

use super::packet;

mod backend;
mod client;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Packet error: {0}")]
    Packet(#[from] packet::Error),
    #[error("I/O: {0}")]
    IO(#[from] io::Error),
    #[error("Idle timeout")]
    IdleTimeout,
    #[error("Connection closed by peer")]
    ConnectionAborted,
}
