use std::io;

use thiserror::Error;

/// Errors surfaced by option handlers to the hosting transport.
#[derive(Error, Debug)]
pub enum TelOptError {
    /// A subnegotiation that must carry a payload arrived empty.
    #[error("{option}: received empty subnegotiation")]
    EmptySubnegotiation { option: &'static str },

    /// A GMCP payload could not be decoded or a message could not be encoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Installing or using a stream layer failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("unknown telnet option: {0}")]
    UnknownOption(String),
}
