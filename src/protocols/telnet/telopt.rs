use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use bytes::Bytes;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::{
    error::TelOptError,
    protocols::telnet::{
        codes as tc,
        gmcp::Message,
        mccp::CompressionStatus,
        mssp::MsspData,
        stream::StreamLayer,
    },
};

/// Which end of the connection this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalSide {
    Client,
    Server,
}

impl TerminalSide {
    pub fn opposite(self) -> Self {
        match self {
            TerminalSide::Client => TerminalSide::Server,
            TerminalSide::Server => TerminalSide::Client,
        }
    }
}

/// The only negotiation states an option ever sees. Pending states stay with the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TelOptState {
    #[default]
    Inactive,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Perspective {
    Local,
    Remote,
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelOptUsage {
    pub allow_local: bool,
    pub allow_remote: bool,
    pub start_local: bool,
    pub start_remote: bool,
}

impl TelOptUsage {
    /// The same policy seen from the other end of the wire.
    pub fn mirrored(self) -> Self {
        Self {
            allow_local: self.allow_remote,
            allow_remote: self.allow_local,
            start_local: self.start_remote,
            start_remote: self.start_local,
        }
    }
}

// Server perspective. Clients use the mirrored policy.
static SERVER_USAGE: Lazy<HashMap<u8, TelOptUsage>> = Lazy::new(|| {
    let mut map: HashMap<u8, TelOptUsage> = Default::default();

    map.insert(tc::MSSP, TelOptUsage {allow_local: true, allow_remote: false, start_remote: false, start_local: true});
    map.insert(tc::MCCP2, TelOptUsage {allow_local: true, allow_remote: false, start_remote: false, start_local: true});
    map.insert(tc::MCCP3, TelOptUsage {allow_local: true, allow_remote: false, start_remote: false, start_local: true});
    map.insert(tc::GMCP, TelOptUsage {allow_local: true, allow_remote: false, start_remote: false, start_local: true});
    map
});

pub fn default_usage(code: u8, side: TerminalSide) -> Option<TelOptUsage> {
    let usage = SERVER_USAGE.get(&code).copied()?;
    match side {
        TerminalSide::Server => Some(usage),
        TerminalSide::Client => Some(usage.mirrored()),
    }
}

/// Work the transport runs once the negotiation response (or a subnegotiation) has been flushed.
pub type PostWrite = Box<dyn FnOnce() -> Result<(), TelOptError> + Send>;

/// Called by the transport when the remote ends a compressed inbound stream on its own.
/// Whatever it returns is raised as an event.
pub type StreamEnd = Box<dyn FnOnce() -> Option<TelOptEvent> + Send>;

/// What an option needs from the hosting transport.
pub trait Terminal: Send + Sync {
    fn side(&self) -> TerminalSide;

    /// Write `IAC SB <option> <payload> IAC SE`. `after` must run only once the
    /// frame has gone through the current outbound layer.
    fn write_subnegotiation(&self, option: u8, payload: Bytes, after: Option<PostWrite>) -> Result<(), TelOptError>;

    /// Replace the outbound byte sink's layer.
    fn wrap_writer(&self, layer: StreamLayer) -> Result<(), TelOptError>;

    /// Replace the inbound byte source with a fresh `layer`. Returns the layer left
    /// installed, which is `Plain` when buffered bytes already held the whole stream.
    /// `on_end` runs if a zlib layer later reaches the end of its stream.
    fn wrap_reader(&self, layer: StreamLayer, on_end: Option<StreamEnd>) -> Result<StreamLayer, TelOptError>;

    fn raise_event(&self, event: TelOptEvent);
}

/// The extension contract every option handler implements for the transport.
pub trait TelnetOption: Send + Sync {
    fn code(&self) -> u8;
    fn name(&self) -> &'static str;
    fn usage(&self) -> TelOptUsage;
    fn local_state(&self) -> TelOptState;
    fn remote_state(&self) -> TelOptState;

    fn transition_local_state(&self, new_state: TelOptState) -> Result<Option<PostWrite>, TelOptError>;
    fn transition_remote_state(&self, new_state: TelOptState) -> Result<Option<PostWrite>, TelOptError>;

    fn subnegotiate(&self, subnegotiation: &[u8]) -> Result<(), TelOptError>;

    /// Diagnostic rendering with no side effects.
    fn subnegotiation_string(&self, subnegotiation: &[u8]) -> Result<String, TelOptError>;
}

#[derive(Default, Debug, Clone, Copy)]
pub struct TelnetOptionState {
    pub local: TelOptState,
    pub remote: TelOptState,
}

/// Identity, usage and negotiation state shared by every option.
pub struct BaseTelOpt {
    code: u8,
    name: &'static str,
    usage: TelOptUsage,
    terminal: Arc<dyn Terminal>,
    state: Mutex<TelnetOptionState>,
}

impl BaseTelOpt {
    pub fn new(code: u8, name: &'static str, usage: TelOptUsage, terminal: Arc<dyn Terminal>) -> Self {
        Self {
            code,
            name,
            usage,
            terminal,
            state: Mutex::new(TelnetOptionState::default()),
        }
    }

    pub fn code(&self) -> u8 {
        self.code
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn usage(&self) -> TelOptUsage {
        self.usage
    }

    pub fn terminal(&self) -> &Arc<dyn Terminal> {
        &self.terminal
    }

    pub fn side(&self) -> TerminalSide {
        self.terminal.side()
    }

    fn snapshot(&self) -> TelnetOptionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn local_state(&self) -> TelOptState {
        self.snapshot().local
    }

    pub fn remote_state(&self) -> TelOptState {
        self.snapshot().remote
    }

    pub fn state(&self, perspective: Perspective) -> TelOptState {
        match perspective {
            Perspective::Local => self.local_state(),
            Perspective::Remote => self.remote_state(),
        }
    }

    pub fn set_state(&self, perspective: Perspective, new_state: TelOptState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match perspective {
            Perspective::Local => state.local = new_state,
            Perspective::Remote => state.remote = new_state,
        }
    }

    pub fn is_active(&self) -> bool {
        let state = self.snapshot();
        state.local == TelOptState::Active || state.remote == TelOptState::Active
    }
}

/// Everything an option raises to the application.
#[derive(Debug)]
pub enum TelOptEvent {
    Gmcp(Box<dyn Message>),
    MsspUpdated(MsspData),
    Compression(CompressionStatus),
}

impl fmt::Display for TelOptEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelOptEvent::Gmcp(msg) => write!(f, "{}", msg),
            TelOptEvent::MsspUpdated(_) => write!(f, "MSSP Data Updated"),
            TelOptEvent::Compression(status) => write!(f, "{}", status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_usage_is_the_mirror_of_server_usage() {
        let server = default_usage(tc::GMCP, TerminalSide::Server).unwrap();
        let client = default_usage(tc::GMCP, TerminalSide::Client).unwrap();
        assert!(server.allow_local && server.start_local);
        assert!(client.allow_remote && client.start_remote);
        assert!(!client.allow_local);
        assert_eq!(client.mirrored(), server);
    }

    #[test]
    fn unknown_codes_have_no_default_usage() {
        assert!(default_usage(31, TerminalSide::Server).is_none());
    }
}
