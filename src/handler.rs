//! wardgate/src/handler.rs
//! Connection handler traits and the raw/line packet pumps.

use crate::error::ProxyError;
use crate::types::DEFAULT_TCP_BUFFSIZE;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

pub type DirectionReader = dyn AsyncBufRead + Send + Unpin;
pub type DirectionWriter = dyn AsyncWrite + Send + Unpin;

/// Invoked once per accepted connection so every connection gets private
/// handler state.
pub type HandlerFactory = Arc<dyn Fn() -> Arc<dyn Handler> + Send + Sync>;

/// A connection handler. `handle` is called twice per connection on the
/// same instance, once per direction; `inbound` tags bytes flowing from
/// the external client toward the protected upstream.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        reader: &mut DirectionReader,
        writer: &mut DirectionWriter,
        inbound: bool,
    ) -> Result<(), ProxyError>;
}

/// Raw packet granularity: one call per socket read.
pub trait TcpHandler: Send {
    /// Read size per packet. Override to trade syscalls for latency.
    fn buffer_size(&self) -> usize {
        DEFAULT_TCP_BUFFSIZE
    }

    /// `Some(bytes)` forwards downstream, `None` drops the direction and
    /// tears the connection down.
    fn process(&mut self, packet: &[u8], inbound: bool) -> Option<Vec<u8>>;
}

/// Line granularity: bytes are buffered per direction and delivered one
/// `\n`-terminated line at a time (terminator included).
pub trait TcpLineHandler: Send {
    fn process_line(&mut self, line: &[u8], inbound: bool) -> Option<Vec<u8>>;
}

/// Pass-through handler.
pub struct NoTcpHandler;

impl TcpHandler for NoTcpHandler {
    fn process(&mut self, packet: &[u8], _inbound: bool) -> Option<Vec<u8>> {
        Some(packet.to_vec())
    }
}

/// Drives a [`TcpHandler`]: read a packet, process, forward, until EOF or
/// a drop verdict. Both direction tasks share the handler through the
/// mutex so stateful handlers see a consistent view.
pub struct TcpPump<H> {
    handler: Mutex<H>,
}

impl<H: TcpHandler + 'static> TcpPump<H> {
    pub fn new(handler: H) -> Arc<Self> {
        Arc::new(TcpPump {
            handler: Mutex::new(handler),
        })
    }
}

#[async_trait]
impl<H: TcpHandler + 'static> Handler for TcpPump<H> {
    async fn handle(
        &self,
        reader: &mut DirectionReader,
        writer: &mut DirectionWriter,
        inbound: bool,
    ) -> Result<(), ProxyError> {
        let size = self.handler.lock().await.buffer_size();
        let mut buf = vec![0u8; size];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            let verdict = self.handler.lock().await.process(&buf[..n], inbound);
            match verdict {
                Some(bytes) => {
                    if !bytes.is_empty() {
                        writer.write_all(&bytes).await?;
                    }
                }
                None => break,
            }
        }
        Ok(())
    }
}

/// Adapts a [`TcpLineHandler`] to packet granularity with one accumulation
/// buffer per direction. A packet without `\n` forwards zero bytes; a
/// packet carrying several lines processes each in order and concatenates
/// the outputs; a drop verdict discards the whole packet's output.
pub struct LineBuffered<H> {
    inner: H,
    inbound_buf: Vec<u8>,
    outbound_buf: Vec<u8>,
}

impl<H: TcpLineHandler> LineBuffered<H> {
    pub fn new(inner: H) -> Self {
        LineBuffered {
            inner,
            inbound_buf: Vec::new(),
            outbound_buf: Vec::new(),
        }
    }
}

impl<H: TcpLineHandler> TcpHandler for LineBuffered<H> {
    fn process(&mut self, packet: &[u8], inbound: bool) -> Option<Vec<u8>> {
        let LineBuffered {
            inner,
            inbound_buf,
            outbound_buf,
        } = self;
        let buf = if inbound { inbound_buf } else { outbound_buf };
        buf.extend_from_slice(packet);
        let mut out = Vec::new();
        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            match inner.process_line(&line, inbound) {
                Some(bytes) => out.extend_from_slice(&bytes),
                None => return None,
            }
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, BufReader};

    struct Uppercase;

    impl TcpLineHandler for Uppercase {
        fn process_line(&mut self, line: &[u8], _inbound: bool) -> Option<Vec<u8>> {
            if line.starts_with(b"drop") {
                return None;
            }
            Some(line.to_ascii_uppercase())
        }
    }

    #[test]
    fn line_buffering_waits_for_terminator() {
        let mut lines = LineBuffered::new(Uppercase);
        assert_eq!(lines.process(b"hel", true), Some(Vec::new()));
        assert_eq!(lines.process(b"lo\n", true), Some(b"HELLO\n".to_vec()));
    }

    #[test]
    fn multiple_lines_processed_in_order() {
        let mut lines = LineBuffered::new(Uppercase);
        assert_eq!(
            lines.process(b"one\ntwo\nthr", false),
            Some(b"ONE\nTWO\n".to_vec())
        );
        assert_eq!(lines.process(b"ee\n", false), Some(b"THREE\n".to_vec()));
    }

    #[test]
    fn direction_buffers_are_independent() {
        let mut lines = LineBuffered::new(Uppercase);
        assert_eq!(lines.process(b"in", true), Some(Vec::new()));
        assert_eq!(lines.process(b"out\n", false), Some(b"OUT\n".to_vec()));
        assert_eq!(lines.process(b"bound\n", true), Some(b"INBOUND\n".to_vec()));
    }

    #[test]
    fn line_drop_discards_pending_output() {
        let mut lines = LineBuffered::new(Uppercase);
        assert_eq!(lines.process(b"fine\ndrop it\n", true), None);
    }

    #[tokio::test]
    async fn tcp_pump_forwards_identity() {
        let pump = TcpPump::new(NoTcpHandler);
        let (mut tx, rx) = tokio::io::duplex(64);
        let (out_tx, mut out_rx) = tokio::io::duplex(64);
        tx.write_all(b"ciao").await.unwrap();
        drop(tx);

        let mut reader = BufReader::new(rx);
        let mut writer = out_tx;
        pump.handle(&mut reader, &mut writer, true).await.unwrap();
        drop(writer);

        let mut forwarded = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut out_rx, &mut forwarded)
            .await
            .unwrap();
        assert_eq!(forwarded, b"ciao");
    }

    struct DropCiao;

    impl TcpHandler for DropCiao {
        fn process(&mut self, packet: &[u8], inbound: bool) -> Option<Vec<u8>> {
            if !inbound && packet.windows(4).any(|w| w == b"ciao") {
                return None;
            }
            Some(packet.to_vec())
        }
    }

    #[tokio::test]
    async fn tcp_pump_stops_on_drop_verdict() {
        let pump = TcpPump::new(DropCiao);
        let (mut tx, rx) = tokio::io::duplex(64);
        let (out_tx, mut out_rx) = tokio::io::duplex(64);

        let pump_task = tokio::spawn(async move {
            let mut reader = BufReader::new(rx);
            let mut writer = out_tx;
            pump.handle(&mut reader, &mut writer, false).await.unwrap();
        });

        // First packet is clean and must come through before the poisoned
        // one is even written, so the two cannot share a read.
        tx.write_all(b"before\n").await.unwrap();
        let mut first = [0u8; 7];
        tokio::io::AsyncReadExt::read_exact(&mut out_rx, &mut first)
            .await
            .unwrap();
        assert_eq!(&first, b"before\n");

        tx.write_all(b"a ciao inside").await.unwrap();
        drop(tx);
        pump_task.await.unwrap();

        let mut rest = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut out_rx, &mut rest)
            .await
            .unwrap();
        assert!(rest.is_empty());
    }
}
