//! Telnet sub-protocols for MUD clients and servers: GMCP structured messages,
//! MSSP server status, and MCCP2/MCCP3 stream compression.
//!
//! The options here plug into a host transport through the [`Terminal`] and
//! [`TelnetOption`] traits. The host owns the socket, the IAC framing and the
//! WILL/WONT/DO/DONT bookkeeping; the options own everything that happens
//! once an option flips active.

pub mod config;
pub mod error;
pub mod protocols;

pub use config::{ClientInfo, Config};
pub use error::TelOptError;
pub use protocols::telnet::{
    gmcp::Gmcp,
    mccp::Mccp,
    mssp::{Mssp, MsspData},
    telopt::{TelOptEvent, TelOptState, TelOptUsage, TelnetOption, Terminal, TerminalSide},
    terminal::BufferedTerminal,
};
