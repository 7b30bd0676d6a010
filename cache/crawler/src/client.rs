//! Buffered, poll-driven writer to an attached dump client.
//!
//! The sweeper owns the client connection from attach until it either
//! completes (the connection is handed back to the server for
//! redispatch) or the peer goes away (the connection is handed back for
//! side-thread close). Output accumulates in a heap buffer and drains
//! through short readiness waits so a slow reader never wedges the
//! sweep for more than a second at a time.

use std::collections::TryReserveError;
use std::io;
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};

/// Minimum free buffer space a mode may assume before emitting a line.
pub const MIN_BUFSPACE: usize = 8192;

/// Initial sink buffer capacity.
const INITIAL_BUF: usize = MIN_BUFSPACE * 16;

/// A connection the sweeper can stream a dump to.
///
/// Implementations must be non-blocking: `read` and `write` return
/// [`io::ErrorKind::WouldBlock`] rather than stalling, and the raw fd is
/// used for readiness polling.
pub trait CrawlerClient: Send {
    /// Descriptor for readiness polling.
    fn raw_fd(&self) -> RawFd;

    /// Non-blocking read.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Non-blocking write.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
}

impl CrawlerClient for TcpStream {
    fn raw_fd(&self) -> RawFd {
        self.as_raw_fd()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(self, buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(self, buf)
    }
}

/// Where finished connections go.
///
/// The sweeper runs on a side thread; it never destroys a connection
/// itself, it hands the connection back to the server through one of
/// these paths.
pub trait ConnRouter: Send + Sync {
    /// The peer hung up or errored; the server should reclaim and close.
    fn close_sidethread(&self, conn: Box<dyn CrawlerClient>);

    /// The dump completed; the server should re-own the connection on a
    /// worker thread.
    fn redispatch(&self, conn: Box<dyn CrawlerClient>);
}

/// Router that simply drops finished connections.
///
/// Dropping a [`TcpStream`]-backed client closes the socket, which is
/// the right default for standalone use.
pub struct DropRouter;

impl ConnRouter for DropRouter {
    fn close_sidethread(&self, _conn: Box<dyn CrawlerClient>) {}
    fn redispatch(&self, _conn: Box<dyn CrawlerClient>) {}
}

/// Outcome of a flush that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// The whole buffer reached the socket.
    Drained,
    /// No readiness within the wait; unsent bytes retained, retry later.
    Retry,
}

/// The sink's connection is gone; all further operations fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("client connection closed")]
pub struct SinkClosed;

/// Why a client could not be attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AttachError {
    /// A client is already attached.
    #[error("a client is already attached")]
    Occupied,

    /// The output buffer could not be allocated.
    #[error("buffer allocation failed")]
    Alloc,
}

/// Buffered writer for one attached dump client.
pub struct ClientSink {
    conn: Option<Box<dyn CrawlerClient>>,
    buf: Vec<u8>,
}

impl ClientSink {
    /// An unattached sink.
    pub fn new() -> Self {
        Self {
            conn: None,
            buf: Vec::new(),
        }
    }

    /// Attach a connection and allocate the output buffer.
    pub fn attach(&mut self, conn: Box<dyn CrawlerClient>) -> Result<(), AttachError> {
        if self.conn.is_some() {
            return Err(AttachError::Occupied);
        }
        let mut buf = Vec::new();
        buf.try_reserve_exact(INITIAL_BUF)
            .map_err(|_| AttachError::Alloc)?;
        self.conn = Some(conn);
        self.buf = buf;
        Ok(())
    }

    /// Whether a connection is attached.
    pub fn is_attached(&self) -> bool {
        self.conn.is_some()
    }

    /// Bytes queued for the client.
    pub fn used(&self) -> usize {
        self.buf.len()
    }

    /// Free buffer space before a reallocation would be needed.
    pub fn free_space(&self) -> usize {
        self.buf.capacity() - self.buf.len()
    }

    /// The output buffer, for modes to append lines to.
    pub fn buffer_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    /// Double the buffer capacity. Failure means the crawl should abort.
    pub fn expand(&mut self) -> Result<(), TryReserveError> {
        let target = self.buf.capacity().max(MIN_BUFSPACE) * 2;
        self.buf.try_reserve_exact(target - self.buf.len())
    }

    /// Drain queued bytes to the socket.
    ///
    /// Waits up to one second per iteration for writability. A timeout
    /// is not an error: already-sent bytes are dropped from the buffer
    /// and [`FlushStatus::Retry`] asks the caller to come back later.
    /// Peer close, hangup, or a hard I/O error closes the sink: the
    /// connection goes back to the router and every later call fails
    /// with [`SinkClosed`].
    pub fn flush(&mut self, router: &dyn ConnRouter) -> Result<FlushStatus, SinkClosed> {
        if self.conn.is_none() {
            return Err(SinkClosed);
        }
        if self.buf.is_empty() {
            return Ok(FlushStatus::Drained);
        }
        let fd = self.conn.as_ref().map(|c| c.raw_fd()).unwrap_or(-1);
        let mut sent = 0usize;
        while sent < self.buf.len() {
            let mut pfd = libc::pollfd {
                fd,
                events: libc::POLLOUT | libc::POLLIN,
                revents: 0,
            };
            let ret = unsafe { libc::poll(&mut pfd, 1, 1000) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                self.close(router);
                return Err(SinkClosed);
            }
            if ret == 0 {
                self.buf.drain(..sent);
                return Ok(FlushStatus::Retry);
            }
            if pfd.revents & libc::POLLIN != 0 {
                // Readability on a dump socket means the peer closed or
                // sent junk; a zero-length read confirms the close.
                let mut probe = [0u8; 1];
                match self.conn.as_mut().map(|c| c.read(&mut probe)) {
                    Some(Ok(0)) => {
                        self.close(router);
                        return Err(SinkClosed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => {}
                    _ => {
                        self.close(router);
                        return Err(SinkClosed);
                    }
                }
            }
            if pfd.revents & (libc::POLLHUP | libc::POLLERR) != 0 {
                self.close(router);
                return Err(SinkClosed);
            }
            if pfd.revents & libc::POLLOUT != 0 {
                let res = self
                    .conn
                    .as_mut()
                    .expect("connection present")
                    .write(&self.buf[sent..]);
                match res {
                    Ok(0) => {
                        self.close(router);
                        return Err(SinkClosed);
                    }
                    Ok(n) => sent += n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(_) => {
                        self.close(router);
                        return Err(SinkClosed);
                    }
                }
            }
        }
        self.buf.clear();
        Ok(FlushStatus::Drained)
    }

    /// Successful completion: hand the connection back for redispatch
    /// and free the buffer.
    pub fn release(&mut self, router: &dyn ConnRouter) {
        if let Some(conn) = self.conn.take() {
            router.redispatch(conn);
        }
        self.buf = Vec::new();
    }

    fn close(&mut self, router: &dyn ConnRouter) {
        if let Some(conn) = self.conn.take() {
            router.close_sidethread(conn);
        }
        self.buf = Vec::new();
    }
}

impl Default for ClientSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};
    use std::sync::Mutex;

    /// Router that records which path each connection took.
    struct RecordingRouter {
        events: Mutex<Vec<&'static str>>,
    }

    impl RecordingRouter {
        fn new() -> Self {
            Self {
                events: Mutex::new(Vec::new()),
            }
        }

        fn events(&self) -> Vec<&'static str> {
            self.events.lock().unwrap().clone()
        }
    }

    impl ConnRouter for RecordingRouter {
        fn close_sidethread(&self, _conn: Box<dyn CrawlerClient>) {
            self.events.lock().unwrap().push("closed");
        }

        fn redispatch(&self, _conn: Box<dyn CrawlerClient>) {
            self.events.lock().unwrap().push("redispatched");
        }
    }

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (client, server)
    }

    #[test]
    fn test_attach_once() {
        let (_client, server) = tcp_pair();
        let (_client2, server2) = tcp_pair();
        let mut sink = ClientSink::new();
        assert!(sink.attach(Box::new(server)).is_ok());
        assert_eq!(sink.attach(Box::new(server2)), Err(AttachError::Occupied));
        assert!(sink.is_attached());
        assert!(sink.free_space() >= INITIAL_BUF);
    }

    #[test]
    fn test_flush_empty_is_drained() {
        let (_client, server) = tcp_pair();
        let router = RecordingRouter::new();
        let mut sink = ClientSink::new();
        sink.attach(Box::new(server)).unwrap();
        assert_eq!(sink.flush(&router), Ok(FlushStatus::Drained));
    }

    #[test]
    fn test_flush_delivers_bytes() {
        let (mut client, server) = tcp_pair();
        let router = RecordingRouter::new();
        let mut sink = ClientSink::new();
        sink.attach(Box::new(server)).unwrap();
        sink.buffer_mut().extend_from_slice(b"hello dump\r\n");
        assert_eq!(sink.flush(&router), Ok(FlushStatus::Drained));
        assert_eq!(sink.used(), 0);

        sink.release(&router);
        assert!(!sink.is_attached());
        assert_eq!(router.events(), vec!["redispatched"]);

        let mut out = String::new();
        client.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello dump\r\n");
    }

    #[test]
    fn test_peer_close_marks_sink_closed() {
        let (client, server) = tcp_pair();
        let router = RecordingRouter::new();
        let mut sink = ClientSink::new();
        sink.attach(Box::new(server)).unwrap();
        drop(client);
        sink.buffer_mut().extend_from_slice(b"too late");
        assert_eq!(sink.flush(&router), Err(SinkClosed));
        assert!(!sink.is_attached());
        assert_eq!(router.events(), vec!["closed"]);
        // Sticky failure.
        assert_eq!(sink.flush(&router), Err(SinkClosed));
    }

    #[test]
    fn test_unattached_flush_fails() {
        let router = RecordingRouter::new();
        let mut sink = ClientSink::new();
        assert_eq!(sink.flush(&router), Err(SinkClosed));
        assert!(router.events().is_empty());
    }

    #[test]
    fn test_expand_grows_capacity() {
        let (_client, server) = tcp_pair();
        let mut sink = ClientSink::new();
        sink.attach(Box::new(server)).unwrap();
        let before = sink.free_space();
        sink.expand().unwrap();
        assert!(sink.free_space() >= before * 2);
    }
}
