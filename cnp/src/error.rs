use std::io;

use crate::{config, network, store};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Network conn error: {0}")]
    Network(#[from] network::Error),
    #[error("Config error: {0}")]
    Config(#[from] config::Error),
    #[error("Credential store error: {0}")]
    Store(#[from] store::StoreError),
    #[error("I/O: {0}")]
    IO(#[from] io::Error),
}
