//! TCP relay between a network client and the virtual keyboard
//!
//! One client is served at a time. Each cycle of a session:
//!
//! ```text
//!  ACCEPTED ─► READING_REQUEST ──EOF──────────────────────────────► CLOSED
//!                    │ 16 bytes
//!                    ▼
//!               DISPATCHING ──inject error─────────────────────────► CLOSED
//!   clear queue, press report, release report
//!                    │
//!                    ▼
//!                 WAITING     settle delay (20 ms by default)
//!                    │
//!                    ▼
//!                RESPONDING ──write error──────────────────────────► CLOSED
//!   drained text, or a single 0x00 when nothing was captured
//!                    │
//!                    └──────────► READING_REQUEST
//! ```
//!
//! The response carries no length prefix or delimiter.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket};

use crate::queue::RelayQueue;
use crate::uhid::{HidReport, ReportSink};

/// Bytes per client request
pub const REQUEST_LEN: usize = 16;

/// Response sent when the capture worker produced no text
pub const NO_TEXT: u8 = 0x00;

/// Serial TCP server driving a [`ReportSink`].
pub struct RelayServer<S> {
    listener: TcpListener,
    sink: S,
    queue: RelayQueue,
    settle_delay: Duration,
}

impl<S: ReportSink> RelayServer<S> {
    /// Bind the listening socket.
    ///
    /// `backlog` is the number of connections the OS queues while a session
    /// is being served.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be created, bound or put into
    /// listening state.
    pub fn bind(
        addr: SocketAddr,
        backlog: u32,
        sink: S,
        queue: RelayQueue,
        settle_delay: Duration,
    ) -> Result<Self> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .context("Failed to create relay socket")?;

        socket
            .set_reuseaddr(true)
            .context("Failed to set SO_REUSEADDR on relay socket")?;
        socket
            .bind(addr)
            .with_context(|| format!("Failed to bind relay socket to {}", addr))?;
        let listener = socket
            .listen(backlog)
            .with_context(|| format!("Failed to listen on {}", addr))?;

        tracing::info!("Relay listening on {}", addr);

        Ok(Self {
            listener,
            sink,
            queue,
            settle_delay,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to query relay socket address")
    }

    /// Accept and serve clients one after another, forever.
    ///
    /// Accept failures are logged and retried immediately; session failures
    /// only end that session.
    pub async fn serve(&mut self) {
        loop {
            let (mut stream, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!("Failed to accept relay connection: {}", e);
                    continue;
                }
            };

            tracing::debug!("Accepted connection from {}", peer);

            match run_session(&mut stream, &mut self.sink, &self.queue, self.settle_delay).await {
                Ok(rounds) => {
                    tracing::debug!("Connection from {} closed after {} request(s)", peer, rounds);
                }
                Err(e) => {
                    tracing::debug!("Connection from {} dropped: {:#}", peer, e);
                }
            }
        }
    }

    /// Give the sink back, e.g. to destroy the device on shutdown
    pub fn into_sink(self) -> S {
        self.sink
    }
}

/// Serve request/response cycles on one connection until the peer closes.
///
/// Returns the number of completed cycles.
///
/// # Errors
///
/// Returns an error if reading the request, injecting a report or writing the
/// response fails. The caller drops the connection in that case.
pub async fn run_session<T, S>(
    stream: &mut T,
    sink: &mut S,
    queue: &RelayQueue,
    settle_delay: Duration,
) -> Result<usize>
where
    T: AsyncRead + AsyncWrite + Unpin,
    S: ReportSink + ?Sized,
{
    let mut rounds = 0;

    loop {
        let request = match read_request(stream).await.context("Failed to read request")? {
            Some(request) => request,
            None => return Ok(rounds),
        };

        let report = HidReport::from_request(&request);
        tracing::debug!("Received request, press report {:02x?}", report.as_bytes());

        // Anything captured before this point belongs to an earlier keystroke
        queue.clear();

        sink.inject(&report).context("Failed to inject press report")?;
        sink.release().context("Failed to inject release report")?;

        tokio::time::sleep(settle_delay).await;

        let text = queue.drain_joined();
        let response = encode_response(&text);
        tracing::debug!("Writing {:?} ({} bytes)", text, response.len());

        stream
            .write_all(&response)
            .await
            .context("Failed to write response")?;
        stream.flush().await.context("Failed to flush response")?;

        rounds += 1;
    }
}

/// Read one request byte by byte.
///
/// Returns `None` if the peer closes the connection before a full request
/// arrived.
pub async fn read_request<R>(reader: &mut R) -> std::io::Result<Option<[u8; REQUEST_LEN]>>
where
    R: AsyncRead + Unpin,
{
    let mut request = [0u8; REQUEST_LEN];
    let mut filled = 0;

    while filled < REQUEST_LEN {
        let n = reader.read(&mut request[filled..filled + 1]).await?;
        if n == 0 {
            if filled > 0 {
                tracing::debug!("Peer closed after {} of {} request bytes", filled, REQUEST_LEN);
            }
            return Ok(None);
        }
        tracing::trace!("Read byte {:02x}", request[filled]);
        filled += n;
    }

    Ok(Some(request))
}

/// Encode captured text for the client: its UTF-8 bytes, or a single `0x00`
pub fn encode_response(text: &str) -> Vec<u8> {
    if text.is_empty() {
        vec![NO_TEXT]
    } else {
        text.as_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use tokio::net::TcpStream;
    use tokio::time::timeout;

    use crate::uhid::UhidError;

    const TEST_SETTLE_DELAY: Duration = Duration::from_millis(5);

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Sent {
        Press(HidReport),
        Release,
    }

    /// Records reports and plays the capture worker's part: every press
    /// pushes the next scripted set of fragments onto the queue.
    struct RecordingSink {
        sent: Arc<Mutex<Vec<Sent>>>,
        script: VecDeque<Vec<&'static str>>,
        queue: RelayQueue,
        fail_inject: bool,
    }

    impl RecordingSink {
        fn new(queue: &RelayQueue, script: Vec<Vec<&'static str>>) -> Self {
            Self {
                sent: Arc::new(Mutex::new(Vec::new())),
                script: script.into(),
                queue: queue.clone(),
                fail_inject: false,
            }
        }
    }

    impl ReportSink for RecordingSink {
        fn inject(&mut self, report: &HidReport) -> Result<(), UhidError> {
            if self.fail_inject {
                return Err(UhidError::Write(std::io::Error::other("device gone")));
            }
            self.sent.lock().unwrap().push(Sent::Press(*report));
            for fragment in self.script.pop_front().unwrap_or_default() {
                self.queue.push(fragment.to_string());
            }
            Ok(())
        }

        fn release(&mut self) -> Result<(), UhidError> {
            self.sent.lock().unwrap().push(Sent::Release);
            Ok(())
        }
    }

    async fn start_server(sink: RecordingSink, queue: RelayQueue) -> SocketAddr {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut server = RelayServer::bind(addr, 5, sink, queue, TEST_SETTLE_DELAY).unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move { server.serve().await });
        addr
    }

    fn request_for(scancode: u8) -> [u8; REQUEST_LEN] {
        let mut request = [0u8; REQUEST_LEN];
        request[2] = scancode;
        request
    }

    async fn read_response(client: &mut TcpStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        timeout(Duration::from_secs(2), client.read_exact(&mut buf))
            .await
            .expect("response timed out")
            .unwrap();
        buf
    }

    async fn assert_nothing_more(client: &mut TcpStream) {
        let mut byte = [0u8; 1];
        let result = timeout(Duration::from_millis(50), client.read(&mut byte)).await;
        assert!(result.is_err(), "unexpected extra data: {:?}", result);
    }

    #[test]
    fn test_encode_response() {
        assert_eq!(encode_response(""), vec![0x00]);
        assert_eq!(encode_response("ab"), b"ab".to_vec());
        assert_eq!(encode_response("ä"), vec![0xc3, 0xa4]);
    }

    #[tokio::test]
    async fn test_read_request_full() {
        let bytes: Vec<u8> = (0u8..20).collect();
        let mut reader = &bytes[..];
        let request = read_request(&mut reader).await.unwrap().unwrap();
        assert_eq!(&request[..], &bytes[..16]);
        // Extra bytes are left for the next request
        assert_eq!(reader, &bytes[16..]);
    }

    #[tokio::test]
    async fn test_read_request_eof() {
        let mut empty: &[u8] = &[];
        assert!(read_request(&mut empty).await.unwrap().is_none());

        let partial = [0x04u8; 7];
        let mut reader = &partial[..];
        assert!(read_request(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_no_text_yields_single_zero_byte() {
        let queue = RelayQueue::default();
        let sink = RecordingSink::new(&queue, vec![]);
        let addr = start_server(sink, queue).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&request_for(0x04)).await.unwrap();

        assert_eq!(read_response(&mut client, 1).await, vec![0x00]);
        assert_nothing_more(&mut client).await;
    }

    #[tokio::test]
    async fn test_fragments_concatenated_without_separators() {
        let queue = RelayQueue::default();
        let sink = RecordingSink::new(&queue, vec![vec!["a", "b"]]);
        let addr = start_server(sink, queue).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&request_for(0x04)).await.unwrap();

        assert_eq!(read_response(&mut client, 2).await, b"ab".to_vec());
        assert_nothing_more(&mut client).await;
    }

    #[tokio::test]
    async fn test_zero_request_sends_zero_press_and_release() {
        let queue = RelayQueue::default();
        let sink = RecordingSink::new(&queue, vec![]);
        let sent = sink.sent.clone();
        let addr = start_server(sink, queue).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0u8; REQUEST_LEN]).await.unwrap();
        read_response(&mut client, 1).await;

        let sent = sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![Sent::Press(HidReport::from_request(&[0u8; 8])), Sent::Release]
        );
    }

    #[tokio::test]
    async fn test_press_uses_first_eight_request_bytes() {
        let queue = RelayQueue::default();
        let sink = RecordingSink::new(&queue, vec![vec!["A"]]);
        let sent = sink.sent.clone();
        let addr = start_server(sink, queue).await;

        let mut request = [0xeeu8; REQUEST_LEN];
        request[..8].copy_from_slice(&[0x02, 0x00, 0x04, 0, 0, 0, 0, 0]);

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&request).await.unwrap();
        assert_eq!(read_response(&mut client, 1).await, b"A".to_vec());

        let sent = sent.lock().unwrap().clone();
        match &sent[0] {
            Sent::Press(report) => {
                assert_eq!(report.as_bytes(), &[0x02, 0x00, 0x04, 0, 0, 0, 0, 0]);
            }
            other => panic!("Expected press, got {:?}", other),
        }
        assert_eq!(sent[1], Sent::Release);
    }

    #[tokio::test]
    async fn test_rounds_are_independent() {
        let queue = RelayQueue::default();
        let sink = RecordingSink::new(&queue, vec![vec!["x"], vec!["y"]]);
        let addr = start_server(sink, queue.clone()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&request_for(0x1b)).await.unwrap();
        assert_eq!(read_response(&mut client, 1).await, b"x".to_vec());

        // A late fragment from the first keystroke must not leak into the second response
        queue.push("stale".to_string());

        client.write_all(&request_for(0x1c)).await.unwrap();
        assert_eq!(read_response(&mut client, 1).await, b"y".to_vec());
        assert_nothing_more(&mut client).await;
    }

    #[tokio::test]
    async fn test_split_request_is_reassembled() {
        let queue = RelayQueue::default();
        let sink = RecordingSink::new(&queue, vec![vec!["q"]]);
        let addr = start_server(sink, queue).await;

        let request = request_for(0x14);
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&request[..5]).await.unwrap();
        client.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(&request[5..]).await.unwrap();

        assert_eq!(read_response(&mut client, 1).await, b"q".to_vec());
    }

    #[tokio::test]
    async fn test_partial_request_then_close_injects_nothing() {
        let queue = RelayQueue::default();
        let sink = RecordingSink::new(&queue, vec![]);
        let sent = sink.sent.clone();
        let addr = start_server(sink, queue).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x04; 10]).await.unwrap();
        drop(client);

        // The next client is served, so the first session has ended
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&request_for(0x04)).await.unwrap();
        read_response(&mut client, 1).await;

        assert_eq!(sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_inject_failure_closes_only_the_session() {
        let queue = RelayQueue::default();
        let mut sink = RecordingSink::new(&queue, vec![]);
        sink.fail_inject = true;
        let addr = start_server(sink, queue).await;

        for _ in 0..2 {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(&request_for(0x04)).await.unwrap();

            let mut buf = [0u8; 1];
            let n = timeout(Duration::from_secs(2), client.read(&mut buf))
                .await
                .expect("server did not close the connection")
                .unwrap_or(0);
            assert_eq!(n, 0);
        }
    }

    #[tokio::test]
    async fn test_clients_are_served_one_at_a_time() {
        let queue = RelayQueue::default();
        let sink = RecordingSink::new(&queue, vec![vec!["1"], vec!["2"]]);
        let addr = start_server(sink, queue).await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(&request_for(0x1e)).await.unwrap();
        assert_eq!(read_response(&mut first, 1).await, b"1".to_vec());

        // Queued by the OS but not served while the first session is open
        let mut second = TcpStream::connect(addr).await.unwrap();
        second.write_all(&request_for(0x1f)).await.unwrap();
        assert_nothing_more(&mut second).await;

        drop(first);
        assert_eq!(read_response(&mut second, 1).await, b"2".to_vec());
    }

    #[tokio::test]
    async fn test_run_session_counts_rounds() {
        let queue = RelayQueue::default();
        let mut sink = RecordingSink::new(&queue, vec![vec!["a"], vec![]]);

        let (mut client, mut server) = tokio::io::duplex(64);
        let session = tokio::spawn({
            let queue = queue.clone();
            async move { run_session(&mut server, &mut sink, &queue, TEST_SETTLE_DELAY).await }
        });

        client.write_all(&request_for(0x04)).await.unwrap();
        let mut buf = [0u8; 1];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"a");

        client.write_all(&request_for(0x05)).await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [NO_TEXT]);

        drop(client);
        assert_eq!(session.await.unwrap().unwrap(), 2);
    }
}
