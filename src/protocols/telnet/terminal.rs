use std::sync::{
    mpsc::{channel, Receiver, SendError, Sender},
    Mutex, PoisonError,
};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::{
    error::TelOptError,
    protocols::telnet::{
        codes as tc,
        stream::{InboundStream, OutboundStream, StreamLayer},
        telopt::{PostWrite, StreamEnd, TelOptEvent, Terminal, TerminalSide},
    },
};

/// What the terminal writes to the outbound stream.
#[derive(Clone, Debug)]
pub enum TelnetEvent {
    // IAC SB <OPTION> <DATA> IAC SE
    SubNegotiate(u8, Bytes),

    // Raw data. The application will have to figure out what these mean.
    Data(Bytes),
}

impl From<TelnetEvent> for Bytes {
    fn from(src: TelnetEvent) -> Self {
        match src {
            TelnetEvent::Data(data) => data,
            TelnetEvent::SubNegotiate(op, data) => {
                let mut out = BytesMut::with_capacity(5 + data.len());
                out.extend_from_slice(&[tc::IAC, tc::SB, op]);
                for byte in data.iter() {
                    if *byte == tc::IAC {
                        out.put_u8(tc::IAC);
                    }
                    out.put_u8(*byte);
                }
                out.extend_from_slice(&[tc::IAC, tc::SE]);
                out.freeze()
            },
        }
    }
}

/// An in-memory [`Terminal`] for hosts that run their own socket loop.
///
/// Outbound bytes accumulate in a buffer the host drains with [`take_output`](Self::take_output);
/// inbound socket bytes go through [`receive`](Self::receive) before telnet parsing. Events
/// are delivered on the channel returned by [`new`](Self::new).
pub struct BufferedTerminal {
    side: TerminalSide,
    outbound: OutboundStream<Vec<u8>>,
    inbound: InboundStream,
    // Held across a subnegotiation write and its continuation so nothing interleaves
    // between a frame and the layer swap it triggers.
    write_gate: Mutex<()>,
    residual: Mutex<BytesMut>,
    on_stream_end: Mutex<Option<StreamEnd>>,
    tx_event: Sender<TelOptEvent>,
}

impl BufferedTerminal {
    pub fn new(side: TerminalSide) -> (Self, Receiver<TelOptEvent>) {
        let (tx_event, rx_event) = channel();

        let terminal = Self {
            side,
            outbound: OutboundStream::new(Vec::new()),
            inbound: InboundStream::new(),
            write_gate: Mutex::new(()),
            residual: Mutex::new(BytesMut::new()),
            on_stream_end: Mutex::new(None),
            tx_event,
        };
        (terminal, rx_event)
    }

    pub fn send_data(&self, data: &[u8]) -> Result<(), TelOptError> {
        let _gate = self.write_gate.lock().unwrap_or_else(PoisonError::into_inner);
        let out = Bytes::from(TelnetEvent::Data(Bytes::copy_from_slice(data)));
        self.outbound.write_all(&out)?;
        Ok(())
    }

    /// Drains everything written so far, exactly as it would go on the wire.
    pub fn take_output(&self) -> Vec<u8> {
        self.outbound.with_inner(std::mem::take).unwrap_or_default()
    }

    pub fn outbound_layer(&self) -> StreamLayer {
        self.outbound.layer()
    }

    pub fn inbound_layer(&self) -> StreamLayer {
        self.inbound.layer()
    }

    /// Runs raw socket bytes through the current inbound layer. If the remote ends
    /// its compressed stream in these bytes, the owning option hears about it before
    /// this returns.
    pub fn receive(&self, raw: &[u8]) -> Result<Bytes, TelOptError> {
        let inflated = self.inbound.decode(raw)?;
        if inflated.ended {
            self.stream_ended();
        }
        Ok(inflated.data)
    }

    fn stream_ended(&self) {
        let hook = self.on_stream_end.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(event) = hook.and_then(|hook| hook()) {
            self.raise_event(event);
        }
    }

    /// Stashes bytes the host's parser read past the last subnegotiation. They are
    /// decoded by the next reader swap.
    pub fn set_residual(&self, raw: &[u8]) {
        let mut residual = self.residual.lock().unwrap_or_else(PoisonError::into_inner);
        residual.clear();
        residual.extend_from_slice(raw);
    }

    /// Takes what the last reader swap decoded out of the residual bytes.
    pub fn take_residual(&self) -> Bytes {
        self.residual.lock().unwrap_or_else(PoisonError::into_inner).split().freeze()
    }
}

impl Terminal for BufferedTerminal {
    fn side(&self) -> TerminalSide {
        self.side
    }

    fn write_subnegotiation(&self, option: u8, payload: Bytes, after: Option<PostWrite>) -> Result<(), TelOptError> {
        let _gate = self.write_gate.lock().unwrap_or_else(PoisonError::into_inner);
        trace!("IAC SB {} <{} bytes> IAC SE", option, payload.len());
        let out = Bytes::from(TelnetEvent::SubNegotiate(option, payload));
        self.outbound.write_all(&out)?;

        if let Some(after) = after {
            after()?;
        }
        Ok(())
    }

    fn wrap_writer(&self, layer: StreamLayer) -> Result<(), TelOptError> {
        self.outbound.swap(layer)?;
        Ok(())
    }

    fn wrap_reader(&self, layer: StreamLayer, on_end: Option<StreamEnd>) -> Result<StreamLayer, TelOptError> {
        let mut residual = self.residual.lock().unwrap_or_else(PoisonError::into_inner);
        let inflated = self.inbound.swap(layer, &residual)?;
        residual.clear();
        residual.extend_from_slice(&inflated.data);

        let installed = self.inbound.layer();
        let mut hook = self.on_stream_end.lock().unwrap_or_else(PoisonError::into_inner);
        *hook = match installed {
            StreamLayer::Zlib => on_end,
            StreamLayer::Plain => None,
        };
        Ok(installed)
    }

    fn raise_event(&self, event: TelOptEvent) {
        if let Err(SendError(event)) = self.tx_event.send(event) {
            debug!("no listener for event: {}", event);
        }
    }
}
