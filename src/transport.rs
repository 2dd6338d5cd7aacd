//! Connection capability and the per-round send/receive exchange.

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{FuzzConfig, MAX_DELAY, MIN_DELAY};
use crate::error::TransportError;
use crate::protocol::{ExchangeMode, LPD_ERROR_BYTE};
use crate::testcase::{PacketData, TestCase};

/// Outgoing payloads are written in segments of one TCP MSS.
pub const SEGMENT_SIZE: usize = 1448;
pub const READ_SIZE: usize = 4096;

pub trait Transport: Send + Sync {
    type Reader: AsyncRead + Unpin + Send + 'static;
    type Writer: AsyncWrite + Unpin + Send + 'static;

    /// Opens a fresh connection; every exchange gets its own.
    fn connect(
        &self,
    ) -> impl Future<Output = Result<(Self::Reader, Self::Writer), TransportError>> + Send;
}

#[derive(Debug, Clone)]
pub struct TcpTransport {
    addr: String,
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(ip: &str, port: u16, connect_timeout: Duration) -> Self {
        Self {
            addr: format!("{ip}:{port}"),
            connect_timeout,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl Transport for TcpTransport {
    type Reader = OwnedReadHalf;
    type Writer = OwnedWriteHalf;

    async fn connect(&self) -> Result<(OwnedReadHalf, OwnedWriteHalf), TransportError> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| TransportError::ConnectTimeout(self.addr.clone()))?
            .map_err(|source| TransportError::Connect {
                addr: self.addr.clone(),
                source,
            })?;
        if let Err(err) = stream.set_nodelay(true) {
            warn!(%err, "failed to set TCP_NODELAY");
        }
        Ok(stream.into_split())
    }
}

/// Sends `case` over a new connection and collects what came back.
///
/// Only connecting can fail; a connection that breaks mid-exchange yields
/// whatever was received before it broke. Stream exchanges return a single
/// buffer, lockstep exchanges one chunk per answered packet.
pub async fn exchange<T: Transport>(
    transport: &T,
    mode: ExchangeMode,
    case: &TestCase,
    config: &FuzzConfig,
) -> Result<Vec<Vec<u8>>, TransportError> {
    let (reader, writer) = transport.connect().await?;
    match mode {
        ExchangeMode::Stream => Ok(vec![stream(reader, writer, case, config).await?]),
        ExchangeMode::Lockstep => Ok(lockstep(reader, writer, case, config.recv_timeout).await),
    }
}

async fn stream<R, W>(
    reader: R,
    writer: W,
    case: &TestCase,
    config: &FuzzConfig,
) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let cancel = CancellationToken::new();
    let mut sender = tokio::spawn(send_all(writer, case.packets.clone(), cancel.clone()));
    let mut receiver = tokio::spawn(receive_all(reader, config.recv_timeout, cancel.clone()));

    tokio::select! {
        sent = &mut sender => {
            // The writer stays open until the receiver is done.
            let _writer = match sent? {
                Ok(writer) => Some(writer),
                Err(err) => {
                    debug!(%err, "sender stopped early");
                    None
                }
            };
            match timeout(config.recv_grace, &mut receiver).await {
                Ok(received) => Ok(received?),
                Err(_) => {
                    debug!("receiver outlived the grace period, cancelling");
                    cancel.cancel();
                    Ok(receiver.await?)
                }
            }
        }
        received = &mut receiver => {
            cancel.cancel();
            if let Err(err) = sender.await? {
                debug!(%err, "sender stopped early");
            }
            Ok(received?)
        }
    }
}

async fn send_all<W: AsyncWrite + Unpin>(
    mut writer: W,
    packets: Vec<PacketData>,
    cancel: CancellationToken,
) -> Result<W, TransportError> {
    for packet in &packets {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(writer),
            written = write_segmented(&mut writer, &packet.data) => written.map_err(TransportError::Send)?,
        }
        if packet.delay > MAX_DELAY {
            debug!("abort delay reached, dropping remaining packets");
            break;
        }
        if packet.delay > MIN_DELAY {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(writer),
                _ = sleep(Duration::from_millis(packet.delay.into())) => {}
            }
        }
    }
    Ok(writer)
}

async fn write_segmented<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> std::io::Result<()> {
    for segment in data.chunks(SEGMENT_SIZE) {
        writer.write_all(segment).await?;
    }
    writer.flush().await
}

/// Reads until the peer closes, a read fails or times out, or `cancel`
/// fires. The partial buffer is returned in every case.
async fn receive_all<R: AsyncRead + Unpin>(
    mut reader: R,
    recv_timeout: Duration,
    cancel: CancellationToken,
) -> Vec<u8> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_SIZE];
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = timeout(recv_timeout, reader.read(&mut chunk)) => read,
        };
        match read {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => buffer.extend_from_slice(&chunk[..n]),
            Ok(Err(err)) => {
                debug!(%err, "receive failed");
                break;
            }
            Err(_) => {
                debug!("receive timed out");
                break;
            }
        }
    }
    buffer
}

async fn lockstep<R, W>(mut reader: R, mut writer: W, case: &TestCase, recv_timeout: Duration) -> Vec<Vec<u8>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut chunks = Vec::with_capacity(case.len());
    let mut chunk = [0u8; READ_SIZE];
    for packet in &case.packets {
        if let Err(err) = write_segmented(&mut writer, &packet.data).await {
            debug!(%err, "send failed");
            break;
        }
        match timeout(recv_timeout, reader.read(&mut chunk)).await {
            Ok(Ok(0)) => {
                debug!("connection closed");
                break;
            }
            Ok(Ok(n)) => chunks.push(chunk[..n].to_vec()),
            Ok(Err(_)) | Err(_) => chunks.push(vec![LPD_ERROR_BYTE]),
        }
    }
    chunks
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{ABORT_DELAY, SKIP_DELAY};
    use std::sync::Mutex;
    use tokio::io::{duplex, DuplexStream, ReadHalf, WriteHalf};

    /// Hands out pre-made in-memory connections, one per `connect`.
    pub(crate) struct DuplexTransport {
        streams: Mutex<Vec<DuplexStream>>,
    }

    impl DuplexTransport {
        pub(crate) fn new(streams: Vec<DuplexStream>) -> Self {
            Self {
                streams: Mutex::new(streams),
            }
        }
    }

    impl Transport for DuplexTransport {
        type Reader = ReadHalf<DuplexStream>;
        type Writer = WriteHalf<DuplexStream>;

        async fn connect(&self) -> Result<(Self::Reader, Self::Writer), TransportError> {
            let stream = self.streams.lock().unwrap().pop();
            match stream {
                Some(stream) => Ok(tokio::io::split(stream)),
                None => Err(TransportError::ConnectTimeout("duplex".into())),
            }
        }
    }

    fn config(recv_timeout: u64, recv_grace: u64) -> FuzzConfig {
        FuzzConfig {
            recv_timeout: Duration::from_millis(recv_timeout),
            recv_grace: Duration::from_millis(recv_grace),
            ..FuzzConfig::default()
        }
    }

    fn case(packets: &[(&[u8], u32)]) -> TestCase {
        TestCase {
            packets: packets
                .iter()
                .map(|(data, delay)| PacketData::new(data.to_vec(), *delay))
                .collect(),
        }
    }

    #[tokio::test]
    async fn stream_collects_until_peer_closes() {
        let (client, mut server) = duplex(1 << 16);
        let transport = DuplexTransport::new(vec![client]);
        let peer = tokio::spawn(async move {
            let mut request = [0u8; 4];
            server.read_exact(&mut request).await.unwrap();
            server.write_all(b"HTTP/1.1 200 OK\r\n").await.unwrap();
            request
        });
        let case = case(&[(b"ab", SKIP_DELAY), (b"cd", SKIP_DELAY)]);
        let chunks = exchange(&transport, ExchangeMode::Stream, &case, &config(1000, 1000))
            .await
            .unwrap();
        assert_eq!(chunks, vec![b"HTTP/1.1 200 OK\r\n".to_vec()]);
        assert_eq!(&peer.await.unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn silent_peer_is_cut_off_after_grace() {
        let (client, mut server) = duplex(1 << 16);
        let transport = DuplexTransport::new(vec![client]);
        let peer = tokio::spawn(async move {
            server.write_all(b"partial").await.unwrap();
            // Hold the connection open without answering.
            sleep(Duration::from_secs(5)).await;
            drop(server);
        });
        let case = case(&[(b"x", SKIP_DELAY)]);
        let started = std::time::Instant::now();
        let chunks = exchange(&transport, ExchangeMode::Stream, &case, &config(10_000, 100))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(chunks, vec![b"partial".to_vec()]);
        peer.abort();
    }

    #[tokio::test]
    async fn abort_delay_drops_remaining_packets() {
        let (client, mut server) = duplex(1 << 16);
        let transport = DuplexTransport::new(vec![client]);
        let case = case(&[(b"first", ABORT_DELAY), (b"second", SKIP_DELAY)]);
        let cfg = config(200, 200);
        let run = exchange(&transport, ExchangeMode::Stream, &case, &cfg);
        let (chunks, seen) = tokio::join!(run, async move {
            let mut seen = Vec::new();
            let mut buf = [0u8; 64];
            while let Ok(Ok(n)) = timeout(Duration::from_millis(300), server.read(&mut buf)).await {
                if n == 0 {
                    break;
                }
                seen.extend_from_slice(&buf[..n]);
            }
            seen
        });
        assert_eq!(chunks.unwrap(), vec![Vec::<u8>::new()]);
        assert_eq!(seen, b"first".to_vec());
    }

    #[tokio::test]
    async fn lockstep_records_one_chunk_per_packet() {
        let (client, mut server) = duplex(1 << 16);
        let transport = DuplexTransport::new(vec![client]);
        let peer = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            server.read(&mut buf).await.unwrap();
            server.write_all(&[0x00]).await.unwrap();
            server.read(&mut buf).await.unwrap();
            // No answer to the second packet, then close.
            sleep(Duration::from_millis(300)).await;
            server.read(&mut buf).await.unwrap();
        });
        let case = case(&[(b"\x02q\n", 100), (b"\x03x\n", 100), (b"\x04y\n", 100)]);
        let chunks = exchange(&transport, ExchangeMode::Lockstep, &case, &config(100, 100))
            .await
            .unwrap();
        peer.await.unwrap();
        assert_eq!(chunks[0], vec![0x00]);
        assert_eq!(chunks[1], vec![LPD_ERROR_BYTE]);
    }

    #[tokio::test]
    async fn connect_failures_surface() {
        let transport = DuplexTransport::new(Vec::new());
        let case = case(&[(b"x", SKIP_DELAY)]);
        assert!(exchange(&transport, ExchangeMode::Stream, &case, &FuzzConfig::default())
            .await
            .is_err());
    }

    #[test]
    fn tcp_transport_formats_address() {
        let transport = TcpTransport::new("10.0.0.5", 631, Duration::from_secs(5));
        assert_eq!(transport.addr(), "10.0.0.5:631");
    }
}
