//! Framed JSON-RPC transport over a duplex byte stream

use super::framing::{encode_frame, FrameDecoder, Framing, DEFAULT_MAX_FRAME_BYTES};
use super::protocol::parse_envelope;
use crate::error::TransportError;
use crate::types::Envelope;
use futures::stream::{BoxStream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

const READ_CHUNK_BYTES: usize = 64 * 1024;

/// Inbound envelopes, in arrival order. Ends when the stream closes or fails.
pub type EnvelopeStream = BoxStream<'static, Result<Envelope, TransportError>>;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub framing: Framing,
    pub max_frame_bytes: usize,
    /// Frames queued for the writer task before `send` waits
    pub outbound_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            framing: Framing::default(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            outbound_buffer: 100,
        }
    }
}

/// Transport layer for worker communication.
///
/// Splits a duplex stream into an outbound [`TransportSender`] and an inbound
/// [`EnvelopeStream`]. Writes go through a channel to a dedicated writer task,
/// so senders never contend with the reader.
pub struct Transport;

impl Transport {
    pub fn new<R, W>(reader: R, writer: W, config: &TransportConfig) -> (TransportSender, EnvelopeStream)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel::<Vec<u8>>(config.outbound_buffer.max(1));
        tokio::spawn(Self::write_task(writer, rx));

        let reader = FrameReader {
            reader,
            decoder: FrameDecoder::new(config.framing, config.max_frame_bytes),
            chunk: vec![0u8; READ_CHUNK_BYTES],
            done: false,
        };
        let stream = futures::stream::unfold(reader, |mut reader| async move {
            reader.next_envelope().await.map(|item| (item, reader))
        })
        .boxed();

        (
            TransportSender {
                tx,
                framing: config.framing,
            },
            stream,
        )
    }

    /// Background task draining the outbound queue into the writer
    async fn write_task<W>(mut writer: W, mut rx: mpsc::Receiver<Vec<u8>>)
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = writer.write_all(&frame).await {
                error!("Failed to write to worker: {}", e);
                break;
            }
            if let Err(e) = writer.flush().await {
                error!("Failed to flush worker stream: {}", e);
                break;
            }
        }
        if let Err(e) = writer.shutdown().await {
            debug!("Worker stream shutdown: {}", e);
        }
        debug!("Transport writer task ended");
    }
}

/// Outbound half of a transport. Cheap to clone.
#[derive(Debug, Clone)]
pub struct TransportSender {
    tx: mpsc::Sender<Vec<u8>>,
    framing: Framing,
}

impl TransportSender {
    fn frame(&self, envelope: &Envelope) -> Result<Vec<u8>, TransportError> {
        let payload = envelope
            .to_bytes()
            .map_err(|e| TransportError::Encode(e.to_string()))?;
        trace!(
            "Sending {}: {}",
            envelope.method().unwrap_or("response"),
            String::from_utf8_lossy(&payload)
        );
        Ok(encode_frame(self.framing, &payload))
    }

    /// Queue an envelope for the writer. Fails once the writer is gone.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let frame = self.frame(envelope)?;
        self.tx.send(frame).await.map_err(|_| TransportError::Closed)
    }

    /// Non-blocking best-effort send
    pub fn try_send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let frame = self.frame(envelope)?;
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "outbound queue full",
            )),
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
    chunk: Vec<u8>,
    done: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    async fn next_envelope(&mut self) -> Option<Result<Envelope, TransportError>> {
        if self.done {
            return None;
        }

        loop {
            match self.decoder.next_frame() {
                Ok(Some(frame)) => {
                    trace!("Received: {}", String::from_utf8_lossy(&frame));
                    return Some(parse_envelope(&frame));
                }
                Ok(None) => {}
                Err(e) => {
                    // Framing is lost; nothing after this point can be trusted
                    self.done = true;
                    return Some(Err(e));
                }
            }

            match self.reader.read(&mut self.chunk).await {
                Ok(0) => {
                    self.done = true;
                    if self.decoder.buffered() > 0 {
                        warn!(
                            "Worker stream closed with {} bytes of partial frame",
                            self.decoder.buffered()
                        );
                    } else {
                        debug!("Worker stream closed");
                    }
                    return None;
                }
                Ok(n) => self.decoder.extend(&self.chunk[..n]),
                Err(e) => {
                    self.done = true;
                    return Some(Err(TransportError::Io(e)));
                }
            }
        }
    }
}
