use std::{
    io::{self, Write},
    sync::{Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use flate2::{write::ZlibEncoder, Compression, Decompress, FlushDecompress, Status};
use tracing::debug;

/// The wrapper currently installed over one direction of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamLayer {
    Plain,
    Zlib,
}

enum Outbound<W: Write> {
    Plain(W),
    Zlib(ZlibEncoder<W>),
}

fn broken_stream() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "outbound stream lost its writer")
}

/// The outbound byte sink. Every write and every layer swap happens under one lock,
/// so no byte goes out through a wrapper after it has been replaced.
pub struct OutboundStream<W: Write> {
    current: Mutex<Option<Outbound<W>>>,
}

impl<W: Write> OutboundStream<W> {
    pub fn new(inner: W) -> Self {
        Self {
            current: Mutex::new(Some(Outbound::Plain(inner))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Outbound<W>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn layer(&self) -> StreamLayer {
        match self.lock().as_ref() {
            Some(Outbound::Zlib(_)) => StreamLayer::Zlib,
            _ => StreamLayer::Plain,
        }
    }

    /// Writes and flushes. Under zlib this is a sync flush, so the peer can inflate
    /// everything written so far.
    pub fn write_all(&self, data: &[u8]) -> io::Result<()> {
        match self.lock().as_mut() {
            Some(Outbound::Plain(writer)) => {
                writer.write_all(data)?;
                writer.flush()
            },
            Some(Outbound::Zlib(encoder)) => {
                encoder.write_all(data)?;
                encoder.flush()
            },
            None => Err(broken_stream()),
        }
    }

    /// Exchanges the current wrapper. Leaving zlib finishes the deflate stream so the
    /// peer sees a clean end before plain bytes resume.
    pub fn swap(&self, layer: StreamLayer) -> io::Result<()> {
        let mut current = self.lock();
        let outbound = current.take().ok_or_else(broken_stream)?;

        let (next, result) = match (outbound, layer) {
            (Outbound::Plain(writer), StreamLayer::Zlib) => {
                (Outbound::Zlib(ZlibEncoder::new(writer, Compression::best())), Ok(()))
            },
            (Outbound::Zlib(mut encoder), StreamLayer::Plain) => {
                if let Err(e) = encoder.try_finish() {
                    *current = Some(Outbound::Zlib(encoder));
                    return Err(e);
                }
                (Outbound::Plain(encoder.finish()?), Ok(()))
            },
            (same, _) => (same, Ok(())),
        };

        *current = Some(next);
        result
    }

    /// Runs `f` against the innermost writer, below any compression.
    pub fn with_inner<R>(&self, f: impl FnOnce(&mut W) -> R) -> Option<R> {
        match self.lock().as_mut() {
            Some(Outbound::Plain(writer)) => Some(f(writer)),
            Some(Outbound::Zlib(encoder)) => Some(f(encoder.get_mut())),
            None => None,
        }
    }
}

enum Inbound {
    Plain,
    Zlib(Decompress),
}

/// What one inbound read produced. `ended` is set when the remote finished its
/// zlib stream during this read; the layer is plain again from that point.
#[derive(Debug, Default)]
pub struct Inflated {
    pub data: Bytes,
    pub ended: bool,
}

impl Inbound {
    fn new(layer: StreamLayer) -> Self {
        match layer {
            StreamLayer::Plain => Inbound::Plain,
            StreamLayer::Zlib => Inbound::Zlib(Decompress::new(true)),
        }
    }

    fn decode(&mut self, raw: &[u8]) -> io::Result<Inflated> {
        let decompress = match self {
            Inbound::Plain => {
                return Ok(Inflated {
                    data: Bytes::copy_from_slice(raw),
                    ended: false,
                })
            },
            Inbound::Zlib(decompress) => decompress,
        };

        let mut out = Vec::with_capacity(raw.len() * 4 + 256);
        let mut input = raw;
        let ended = loop {
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(256));
            }

            let before_in = decompress.total_in();
            let before_out = out.len();
            let status = decompress
                .decompress_vec(input, &mut out, FlushDecompress::Sync)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let consumed = (decompress.total_in() - before_in) as usize;
            input = &input[consumed..];

            if status == Status::StreamEnd {
                break true;
            }
            // Output space left over means the decoder wants more input.
            let stalled = consumed == 0 && out.len() == before_out;
            if out.len() < out.capacity() && (input.is_empty() || stalled) {
                break false;
            }
        };

        if ended {
            debug!("remote ended its zlib stream, {} trailing bytes are plain", input.len());
            out.extend_from_slice(input);
            *self = Inbound::Plain;
        }
        Ok(Inflated {
            data: Bytes::from(out),
            ended,
        })
    }
}

/// The inbound byte source. Raw socket bytes go in, telnet bytes come out.
pub struct InboundStream {
    current: Mutex<Inbound>,
}

impl Default for InboundStream {
    fn default() -> Self {
        Self::new()
    }
}

impl InboundStream {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(Inbound::Plain),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inbound> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn layer(&self) -> StreamLayer {
        match *self.lock() {
            Inbound::Plain => StreamLayer::Plain,
            Inbound::Zlib(_) => StreamLayer::Zlib,
        }
    }

    pub fn decode(&self, raw: &[u8]) -> io::Result<Inflated> {
        self.lock().decode(raw)
    }

    /// Installs a fresh `layer` and decodes `residual`, the bytes the host had already
    /// read past the subnegotiation that triggered the swap. If those bytes do not
    /// decode, the previous layer stays installed.
    pub fn swap(&self, layer: StreamLayer, residual: &[u8]) -> io::Result<Inflated> {
        let mut current = self.lock();
        let mut next = Inbound::new(layer);
        let inflated = next.decode(residual)?;
        *current = next;
        Ok(inflated)
    }
}

#[cfg(test)]
mod tests {
    use flate2::write::ZlibDecoder;

    use super::*;

    fn deflate(chunks: &[&[u8]], finish: bool) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        for chunk in chunks {
            encoder.write_all(chunk).unwrap();
            encoder.flush().unwrap();
        }
        if finish {
            encoder.finish().unwrap()
        } else {
            encoder.get_ref().clone()
        }
    }

    fn inflate(data: &[u8]) -> Vec<u8> {
        let mut decoder = ZlibDecoder::new(Vec::new());
        decoder.write_all(data).unwrap();
        decoder.flush().unwrap();
        decoder.get_ref().clone()
    }

    #[test]
    fn outbound_plain_bytes_pass_through() {
        let stream = OutboundStream::new(Vec::new());
        stream.write_all(b"hello").unwrap();
        assert_eq!(stream.with_inner(std::mem::take).unwrap(), b"hello");
        assert_eq!(stream.layer(), StreamLayer::Plain);
    }

    #[test]
    fn outbound_zlib_then_plain() {
        let stream = OutboundStream::new(Vec::new());
        stream.write_all(b"before").unwrap();
        stream.swap(StreamLayer::Zlib).unwrap();
        stream.write_all(b"abc").unwrap();
        assert_eq!(stream.layer(), StreamLayer::Zlib);

        let wire = stream.with_inner(|w| w.clone()).unwrap();
        assert_eq!(&wire[..6], b"before");
        assert_eq!(inflate(&wire[6..]), b"abc");

        stream.swap(StreamLayer::Plain).unwrap();
        stream.write_all(b"after").unwrap();
        let wire = stream.with_inner(|w| w.clone()).unwrap();
        assert!(wire.ends_with(b"after"));
        assert_eq!(stream.layer(), StreamLayer::Plain);
    }

    #[test]
    fn swapping_to_the_same_layer_is_a_no_op() {
        let stream = OutboundStream::new(Vec::new());
        stream.swap(StreamLayer::Plain).unwrap();
        stream.write_all(b"x").unwrap();
        assert_eq!(stream.with_inner(|w| w.clone()).unwrap(), b"x");
    }

    #[test]
    fn inbound_inflates_across_reads() {
        let stream = InboundStream::new();
        let wire = deflate(&[b"first ", b"second"], false);
        let (a, b) = wire.split_at(wire.len() / 2);

        assert!(stream.swap(StreamLayer::Zlib, &[]).unwrap().data.is_empty());
        let mut out = stream.decode(a).unwrap().data.to_vec();
        out.extend_from_slice(&stream.decode(b).unwrap().data);
        assert_eq!(out, b"first second");
        assert_eq!(stream.layer(), StreamLayer::Zlib);
    }

    #[test]
    fn inbound_inflates_large_payloads() {
        let text = "a room full of echoes ".repeat(2000);
        let stream = InboundStream::new();
        stream.swap(StreamLayer::Zlib, &[]).unwrap();
        let out = stream.decode(&deflate(&[text.as_bytes()], false)).unwrap();
        assert_eq!(out.data.as_ref(), text.as_bytes());
        assert!(!out.ended);
    }

    #[test]
    fn inbound_swap_decodes_residual() {
        let stream = InboundStream::new();
        let wire = deflate(&[b"look"], false);
        assert_eq!(stream.swap(StreamLayer::Zlib, &wire).unwrap().data.as_ref(), b"look");
        assert_eq!(stream.layer(), StreamLayer::Zlib);
    }

    #[test]
    fn inbound_malformed_header_keeps_plain_layer() {
        let stream = InboundStream::new();
        assert!(stream.swap(StreamLayer::Zlib, b"garbage!").is_err());
        assert_eq!(stream.layer(), StreamLayer::Plain);
        assert_eq!(stream.decode(b"plain").unwrap().data.as_ref(), b"plain");
    }

    #[test]
    fn inbound_reverts_to_plain_after_stream_end() {
        let stream = InboundStream::new();
        let mut wire = deflate(&[b"zipped"], true);
        wire.extend_from_slice(b"plain");
        stream.swap(StreamLayer::Zlib, &[]).unwrap();

        let out = stream.decode(&wire).unwrap();
        assert_eq!(out.data.as_ref(), b"zippedplain");
        assert!(out.ended);
        assert_eq!(stream.layer(), StreamLayer::Plain);
    }

    #[test]
    fn stream_end_on_a_read_boundary_is_noticed() {
        let stream = InboundStream::new();
        stream.swap(StreamLayer::Zlib, &[]).unwrap();

        let out = stream.decode(&deflate(&[b"first"], true)).unwrap();
        assert_eq!(out.data.as_ref(), b"first");
        assert!(out.ended);
        assert_eq!(stream.layer(), StreamLayer::Plain);

        let out = stream.decode(b"then plain").unwrap();
        assert_eq!(out.data.as_ref(), b"then plain");
        assert!(!out.ended);
    }

    #[test]
    fn stream_end_split_across_reads() {
        let stream = InboundStream::new();
        stream.swap(StreamLayer::Zlib, &[]).unwrap();
        let wire = deflate(&[b"split"], true);
        let (body, trailer) = wire.split_at(wire.len() - 2);

        let first = stream.decode(body).unwrap();
        assert!(!first.ended);
        let second = stream.decode(trailer).unwrap();
        assert!(second.ended);

        let mut out = first.data.to_vec();
        out.extend_from_slice(&second.data);
        assert_eq!(out, b"split");
    }
}
