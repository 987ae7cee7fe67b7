use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use tracing::{debug, info};

use crate::{
    error::TelOptError,
    protocols::telnet::{
        codes as tc,
        stream::StreamLayer,
        telopt::{
            BaseTelOpt, Perspective, PostWrite, StreamEnd, TelOptEvent, TelOptState, TelOptUsage, TelnetOption,
            Terminal,
        },
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionStatus {
    pub option: &'static str,
    pub started: bool,
    pub sending: bool,
}

impl fmt::Display for CompressionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: compression status change- compression: {} {}",
            self.option,
            if self.sending { "SENDING" } else { "RECEIVING" },
            if self.started { "STARTED" } else { "STOPPED" }
        )
    }
}

pub fn render_subnegotiation() -> &'static str {
    "BEGIN COMPRESSION"
}

/// Which negotiation perspective gates compressed sending. Receiving is gated by the other one.
#[derive(Debug, Clone, Copy)]
pub struct MccpVariant {
    pub code: u8,
    pub name: &'static str,
    pub sending_gate: Perspective,
}

impl MccpVariant {
    fn receiving_gate(&self) -> Perspective {
        match self.sending_gate {
            Perspective::Local => Perspective::Remote,
            Perspective::Remote => Perspective::Local,
        }
    }
}

// MCCP2 compresses what we send once we are allowed to WILL it.
pub const MCCP2: MccpVariant = MccpVariant { code: tc::MCCP2, name: "MCCP2", sending_gate: Perspective::Local };

// MCCP3 is the same dance with the roles swapped.
pub const MCCP3: MccpVariant = MccpVariant { code: tc::MCCP3, name: "MCCP3", sending_gate: Perspective::Remote };

#[derive(Default)]
struct CompressionFlags {
    sending: AtomicBool,
    receiving: AtomicBool,
}

/// One compression toggle. [`Mccp::mccp2`] and [`Mccp::mccp3`] differ only in which
/// side's activation starts which direction.
pub struct Mccp {
    base: BaseTelOpt,
    variant: MccpVariant,
    flags: Arc<CompressionFlags>,
}

impl Mccp {
    pub fn new(variant: MccpVariant, usage: TelOptUsage, terminal: Arc<dyn Terminal>) -> Self {
        Self {
            base: BaseTelOpt::new(variant.code, variant.name, usage, terminal),
            variant,
            flags: Default::default(),
        }
    }

    pub fn mccp2(usage: TelOptUsage, terminal: Arc<dyn Terminal>) -> Self {
        Self::new(MCCP2, usage, terminal)
    }

    pub fn mccp3(usage: TelOptUsage, terminal: Arc<dyn Terminal>) -> Self {
        Self::new(MCCP3, usage, terminal)
    }

    pub fn sending_compressed(&self) -> bool {
        self.flags.sending.load(Ordering::SeqCst)
    }

    pub fn receiving_compressed(&self) -> bool {
        self.flags.receiving.load(Ordering::SeqCst)
    }

    fn status(&self, started: bool, sending: bool) -> TelOptEvent {
        TelOptEvent::Compression(CompressionStatus {
            option: self.variant.name,
            started,
            sending,
        })
    }

    // Announce with an empty subnegotiation, then compress everything after it.
    fn start_sending(&self) -> PostWrite {
        let terminal = self.base.terminal().clone();
        let flags = self.flags.clone();
        let code = self.variant.code;
        let started = self.status(true, true);

        Box::new(move || {
            let inner = terminal.clone();
            terminal.write_subnegotiation(code, Bytes::new(), Some(Box::new(move || {
                inner.wrap_writer(StreamLayer::Zlib)?;
                flags.sending.store(true, Ordering::SeqCst);
                info!("{}", started);
                inner.raise_event(started);
                Ok(())
            })))
        })
    }

    /// Finishes the deflate stream and goes back to plain. Withdrawing an offer that
    /// never got as far as compressing swaps nothing and raises no event.
    fn stop_sending(&self) -> PostWrite {
        let terminal = self.base.terminal().clone();
        let flags = self.flags.clone();
        let stopped = self.status(false, true);

        Box::new(move || {
            if !flags.sending.load(Ordering::SeqCst) {
                return Ok(());
            }
            terminal.wrap_writer(StreamLayer::Plain)?;
            flags.sending.store(false, Ordering::SeqCst);
            info!("{}", stopped);
            terminal.raise_event(stopped);
            Ok(())
        })
    }

    fn stop_receiving(&self) -> Result<(), TelOptError> {
        if !self.receiving_compressed() {
            return Ok(());
        }
        self.base.terminal().wrap_reader(StreamLayer::Plain, None)?;
        self.flags.receiving.store(false, Ordering::SeqCst);

        let stopped = self.status(false, false);
        info!("{}", stopped);
        self.base.terminal().raise_event(stopped);
        Ok(())
    }

    // The remote finished its zlib stream without renegotiating.
    fn receiving_ended(&self) -> StreamEnd {
        let flags = self.flags.clone();
        let stopped = self.status(false, false);

        Box::new(move || {
            if !flags.receiving.swap(false, Ordering::SeqCst) {
                return None;
            }
            info!("{}", stopped);
            Some(stopped)
        })
    }

    fn transition(&self, perspective: Perspective, new_state: TelOptState) -> Result<Option<PostWrite>, TelOptError> {
        self.base.set_state(perspective, new_state);

        if perspective == self.variant.sending_gate {
            return Ok(Some(match new_state {
                TelOptState::Active => self.start_sending(),
                TelOptState::Inactive => self.stop_sending(),
            }));
        }

        if new_state == TelOptState::Inactive {
            self.stop_receiving()?;
        }
        Ok(None)
    }
}

impl TelnetOption for Mccp {
    fn code(&self) -> u8 {
        self.base.code()
    }

    fn name(&self) -> &'static str {
        self.base.name()
    }

    fn usage(&self) -> TelOptUsage {
        self.base.usage()
    }

    fn local_state(&self) -> TelOptState {
        self.base.local_state()
    }

    fn remote_state(&self) -> TelOptState {
        self.base.remote_state()
    }

    fn transition_local_state(&self, new_state: TelOptState) -> Result<Option<PostWrite>, TelOptError> {
        self.transition(Perspective::Local, new_state)
    }

    fn transition_remote_state(&self, new_state: TelOptState) -> Result<Option<PostWrite>, TelOptError> {
        self.transition(Perspective::Remote, new_state)
    }

    fn subnegotiate(&self, _subnegotiation: &[u8]) -> Result<(), TelOptError> {
        if self.base.state(self.variant.receiving_gate()) != TelOptState::Active {
            debug!("{}: ignoring compression start while inactive", self.variant.name);
            return Ok(());
        }

        // Every start begins a new zlib stream, even if the old one never ended.
        let installed = self.base.terminal().wrap_reader(StreamLayer::Zlib, Some(self.receiving_ended()))?;
        if self.flags.receiving.swap(true, Ordering::SeqCst) {
            debug!("{}: compression restarted, fresh decoder installed", self.variant.name);
        } else {
            let started = self.status(true, false);
            info!("{}", started);
            self.base.terminal().raise_event(started);
        }

        if installed == StreamLayer::Plain {
            self.flags.receiving.store(false, Ordering::SeqCst);
            let stopped = self.status(false, false);
            info!("{}", stopped);
            self.base.terminal().raise_event(stopped);
        }
        Ok(())
    }

    fn subnegotiation_string(&self, _subnegotiation: &[u8]) -> Result<String, TelOptError> {
        Ok(render_subnegotiation().to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, sync::mpsc::Receiver};

    use flate2::{write::ZlibEncoder, Compression};

    use super::*;
    use crate::protocols::telnet::{telopt::TerminalSide, terminal::BufferedTerminal};

    fn server(variant: MccpVariant) -> (Mccp, Arc<BufferedTerminal>, Receiver<TelOptEvent>) {
        let (terminal, rx) = BufferedTerminal::new(TerminalSide::Server);
        let terminal = Arc::new(terminal);
        (Mccp::new(variant, TelOptUsage::default(), terminal.clone()), terminal, rx)
    }

    fn deflated(data: &[u8], finish: bool) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        if finish {
            encoder.finish().unwrap()
        } else {
            encoder.flush().unwrap();
            encoder.get_ref().clone()
        }
    }

    fn statuses(rx: &Receiver<TelOptEvent>) -> Vec<CompressionStatus> {
        rx.try_iter()
            .filter_map(|event| match event {
                TelOptEvent::Compression(status) => Some(status),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn status_renders_direction_and_change() {
        let status = CompressionStatus { option: "MCCP2", started: true, sending: false };
        assert_eq!(status.to_string(), "MCCP2: compression status change- compression: RECEIVING STARTED");
    }

    #[test]
    fn mccp2_local_activation_starts_sending() {
        let (mccp, terminal, rx) = server(MCCP2);
        let post = mccp.transition_local_state(TelOptState::Active).unwrap().unwrap();
        assert!(!mccp.sending_compressed());
        post().unwrap();

        assert!(mccp.sending_compressed());
        assert_eq!(terminal.outbound_layer(), StreamLayer::Zlib);
        assert_eq!(terminal.take_output(), vec![tc::IAC, tc::SB, tc::MCCP2, tc::IAC, tc::SE]);
        assert_eq!(statuses(&rx), vec![CompressionStatus { option: "MCCP2", started: true, sending: true }]);
    }

    #[test]
    fn mccp2_local_deactivation_stops_sending() {
        let (mccp, terminal, rx) = server(MCCP2);
        mccp.transition_local_state(TelOptState::Active).unwrap().unwrap()().unwrap();
        mccp.transition_local_state(TelOptState::Inactive).unwrap().unwrap()().unwrap();

        assert!(!mccp.sending_compressed());
        assert_eq!(terminal.outbound_layer(), StreamLayer::Plain);
        let seen = statuses(&rx);
        assert_eq!(seen.len(), 2);
        assert!(!seen[1].started && seen[1].sending);
    }

    #[test]
    fn withdrawal_without_compression_is_silent() {
        let (mccp, _terminal, rx) = server(MCCP2);
        mccp.transition_local_state(TelOptState::Inactive).unwrap().unwrap()().unwrap();
        assert!(statuses(&rx).is_empty());
    }

    #[test]
    fn mccp2_subnegotiation_needs_remote_active() {
        let (mccp, terminal, rx) = server(MCCP2);
        mccp.subnegotiate(&[]).unwrap();
        assert!(!mccp.receiving_compressed());

        mccp.transition_remote_state(TelOptState::Active).unwrap();
        mccp.subnegotiate(&[]).unwrap();
        assert!(mccp.receiving_compressed());
        assert_eq!(terminal.inbound_layer(), StreamLayer::Zlib);

        mccp.transition_remote_state(TelOptState::Inactive).unwrap();
        assert!(!mccp.receiving_compressed());
        assert_eq!(terminal.inbound_layer(), StreamLayer::Plain);
        let seen = statuses(&rx);
        assert_eq!(seen.len(), 2);
        assert!(seen[0].started && !seen[0].sending);
        assert!(!seen[1].started && !seen[1].sending);
    }

    #[test]
    fn mccp3_roles_are_mirrored() {
        let (mccp, terminal, _rx) = server(MCCP3);
        assert!(mccp.transition_local_state(TelOptState::Active).unwrap().is_none());
        mccp.subnegotiate(&[]).unwrap();
        assert!(mccp.receiving_compressed());

        mccp.transition_remote_state(TelOptState::Active).unwrap().unwrap()().unwrap();
        assert!(mccp.sending_compressed());
        assert_eq!(terminal.take_output(), vec![tc::IAC, tc::SB, tc::MCCP3, tc::IAC, tc::SE]);
    }

    #[test]
    fn malformed_stream_leaves_receiving_unset() {
        let (mccp, terminal, rx) = server(MCCP2);
        mccp.transition_remote_state(TelOptState::Active).unwrap();
        terminal.set_residual(b"definitely not zlib");
        assert!(mccp.subnegotiate(&[]).is_err());
        assert!(!mccp.receiving_compressed());
        assert!(statuses(&rx).is_empty());
    }

    #[test]
    fn remote_stream_end_stops_receiving_and_allows_restart() {
        let (mccp, terminal, rx) = server(MCCP2);
        mccp.transition_remote_state(TelOptState::Active).unwrap();
        mccp.subnegotiate(&[]).unwrap();

        // The stream ends exactly at the end of the read.
        assert_eq!(terminal.receive(&deflated(b"first", true)).unwrap().as_ref(), b"first");
        assert!(!mccp.receiving_compressed());
        assert_eq!(terminal.inbound_layer(), StreamLayer::Plain);
        assert_eq!(terminal.receive(b"plain").unwrap().as_ref(), b"plain");

        mccp.subnegotiate(&[]).unwrap();
        assert!(mccp.receiving_compressed());
        assert_eq!(terminal.receive(&deflated(b"second", false)).unwrap().as_ref(), b"second");

        let seen = statuses(&rx);
        let changes: Vec<_> = seen.iter().map(|s| (s.started, s.sending)).collect();
        assert_eq!(changes, vec![(true, false), (false, false), (true, false)]);
    }

    #[test]
    fn residual_holding_a_whole_stream_reverts_at_once() {
        let (mccp, terminal, rx) = server(MCCP2);
        mccp.transition_remote_state(TelOptState::Active).unwrap();
        let mut residual = deflated(b"short", true);
        residual.extend_from_slice(b"tail");
        terminal.set_residual(&residual);

        mccp.subnegotiate(&[]).unwrap();
        assert!(!mccp.receiving_compressed());
        assert_eq!(terminal.inbound_layer(), StreamLayer::Plain);
        assert_eq!(terminal.take_residual().as_ref(), b"shorttail");

        let changes: Vec<_> = statuses(&rx).iter().map(|s| s.started).collect();
        assert_eq!(changes, vec![true, false]);
    }

    #[test]
    fn restart_mid_stream_installs_a_fresh_decoder() {
        let (mccp, terminal, rx) = server(MCCP2);
        mccp.transition_remote_state(TelOptState::Active).unwrap();
        mccp.subnegotiate(&[]).unwrap();
        assert_eq!(terminal.receive(&deflated(b"old", false)).unwrap().as_ref(), b"old");

        // A new stream carries its own zlib header, which the old decoder would reject.
        mccp.subnegotiate(&[]).unwrap();
        assert!(mccp.receiving_compressed());
        assert_eq!(terminal.receive(&deflated(b"new", false)).unwrap().as_ref(), b"new");
        assert_eq!(statuses(&rx).len(), 1);
    }

    #[test]
    fn withdrawal_after_stream_end_is_silent() {
        let (mccp, terminal, rx) = server(MCCP2);
        mccp.transition_remote_state(TelOptState::Active).unwrap();
        mccp.subnegotiate(&[]).unwrap();
        terminal.receive(&deflated(b"done", true)).unwrap();
        assert_eq!(statuses(&rx).len(), 2);

        mccp.transition_remote_state(TelOptState::Inactive).unwrap();
        assert!(statuses(&rx).is_empty());
    }
}
