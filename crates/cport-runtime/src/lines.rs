//! Line-oriented connection task
//!
//! One [`LineConn`] per accepted client. It reads into a fixed receive
//! buffer, splits complete lines off the front (request line first, then
//! headers), logs them and keeps whatever partial line is left for the
//! next read. A blank line ends the header block; the task answers with
//! an empty `200 OK` and finishes, which closes the socket.
//!
//! ```text
//! Setup -> Read -> Process -+-> Read          (need more)
//!                           +-> Respond -> Sent -+-> Respond   (partial write)
//!                                                +-> done
//! ```
//!
//! End of stream, a failed read, a malformed request line or a full buffer
//! with no line in it all finish the task.

use crate::handler::IoHandler;
use crate::io;
use crate::worker::ClientFactory;
use cport_core::error::TaskError;
use cport_core::shared::Retainer;
use cport_core::source::Source;
use cport_core::task::{Engine, Machine, Step, StepCx, TaskEnd};

use std::sync::Arc;

/// Sent once the header block is complete.
pub const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";

// ── Parsing ──

/// `METHOD PATH VERSION`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub path: String,
    pub version: String,
}

impl RequestLine {
    /// Method and path are required; everything after the second space is
    /// the version (possibly empty).
    pub fn parse(line: &str) -> Option<Self> {
        let (method, rest) = line.split_once(' ')?;
        let (path, version) = rest.split_once(' ').unwrap_or((rest, ""));
        if method.is_empty() || path.is_empty() {
            return None;
        }
        Some(Self {
            method: method.to_string(),
            path: path.to_string(),
            version: version.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    RequestLine,
    Header,
    Body,
}

/// What one pass over the buffer found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// No complete line left; read more
    NeedMore,
    /// The blank line after the headers was seen
    HeadersDone,
    /// The buffer is full and holds no line
    Overflow,
    /// The request line could not be split
    BadRequest,
}

/// Incremental line splitter over a caller-owned buffer.
#[derive(Debug)]
pub struct LineParser {
    state: ParseState,
    request: Option<RequestLine>,
    headers: Vec<(String, String)>,
}

impl Default for LineParser {
    fn default() -> Self {
        Self::new()
    }
}

impl LineParser {
    pub fn new() -> Self {
        Self { state: ParseState::RequestLine, request: None, headers: Vec::new() }
    }

    pub fn request(&self) -> Option<&RequestLine> {
        self.request.as_ref()
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Consume every complete line in `buf[..*filled]`.
    ///
    /// Unconsumed bytes are moved to the front of `buf` and `*filled` is
    /// set to their length.
    pub fn process(&mut self, buf: &mut [u8], filled: &mut usize) -> Progress {
        let end = (*filled).min(buf.len());
        let mut offset = 0;
        let mut progress = Progress::NeedMore;

        while self.state != ParseState::Body {
            let Some(nl) = buf[offset..end].iter().position(|&b| b == b'\n') else {
                break;
            };
            let raw = &buf[offset..offset + nl];
            offset += nl + 1;
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            let line = String::from_utf8_lossy(raw);

            match self.state {
                ParseState::RequestLine => {
                    // Stray blank lines before the request are tolerated.
                    if line.is_empty() {
                        continue;
                    }
                    tracing::debug!(line = %line, "request line");
                    match RequestLine::parse(&line) {
                        Some(req) => {
                            self.request = Some(req);
                            self.state = ParseState::Header;
                        }
                        None => return Progress::BadRequest,
                    }
                }
                ParseState::Header if line.is_empty() => {
                    self.state = ParseState::Body;
                    progress = Progress::HeadersDone;
                }
                ParseState::Header => {
                    tracing::trace!(line = %line, "header line");
                    let (name, value) = line.split_once(':').unwrap_or((&line, ""));
                    self.headers.push((name.trim().to_string(), value.trim().to_string()));
                }
                ParseState::Body => break,
            }
        }

        let remaining = end - offset;
        if offset > 0 && remaining > 0 {
            buf.copy_within(offset..end, 0);
        }
        *filled = remaining;

        if progress == Progress::NeedMore && remaining == buf.len() {
            return Progress::Overflow;
        }
        progress
    }
}

// ── Connection task ──

/// Construction parameter of [`LineConn`]
pub struct LineParams {
    pub handler: Retainer<IoHandler>,
    pub source: Retainer<Source>,
    pub recv_buffer: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Setup,
    Read,
    Process,
    Respond,
    Sent,
}

pub struct LineConn {
    handler: Retainer<IoHandler>,
    source: Retainer<Source>,
    stage: Stage,
    /// `None` while a read owns it
    buf: Option<Vec<u8>>,
    filled: usize,
    parser: LineParser,
    sent: usize,
}

impl Machine for LineConn {
    type Param = LineParams;

    fn construct(p: LineParams) -> Result<Self, TaskError> {
        if p.recv_buffer == 0 {
            return Err(TaskError::Construct("receive buffer is empty".into()));
        }
        Ok(Self {
            handler: p.handler,
            source: p.source,
            stage: Stage::Setup,
            buf: Some(vec![0; p.recv_buffer]),
            filled: 0,
            parser: LineParser::new(),
            sent: 0,
        })
    }

    fn step(&mut self, cx: &mut StepCx<'_>) -> Step {
        let Some(handler) = self.handler.get() else {
            return Step::Finished;
        };

        loop {
            match self.stage {
                Stage::Setup => {
                    let Some(src) = self.source.get() else { return Step::Finished };
                    if !src.is_registered() {
                        tracing::warn!(fd = src.fd(), "connection source not registered");
                        return Step::Finished;
                    }
                    tracing::debug!(task = %cx.task().id(), fd = src.fd(), "connection setup");
                    self.stage = Stage::Read;
                }

                Stage::Read => {
                    let Some(buf) = self.buf.take() else { return Step::Finished };
                    self.stage = Stage::Process;
                    return match io::read(cx, handler, &self.source, buf, self.filled) {
                        Ok(()) => Step::YieldIo,
                        Err(failed) => {
                            tracing::debug!(task = %cx.task().id(), error = %failed, "read not issued");
                            self.buf = Some(failed.buf);
                            Step::Finished
                        }
                    };
                }

                Stage::Process => {
                    let Some(res) = cx.take_io() else { return Step::Finished };
                    self.buf = res.buf;
                    if !res.ok || res.bytes == 0 {
                        tracing::debug!(task = %cx.task().id(), os_error = ?res.os_error, "connection read ended");
                        return Step::Finished;
                    }
                    let Some(buf) = self.buf.as_mut() else { return Step::Finished };
                    self.filled += res.bytes;

                    match self.parser.process(buf, &mut self.filled) {
                        Progress::NeedMore => self.stage = Stage::Read,
                        Progress::HeadersDone => self.stage = Stage::Respond,
                        Progress::Overflow => {
                            tracing::debug!(task = %cx.task().id(), "line exceeds receive buffer");
                            return Step::Finished;
                        }
                        Progress::BadRequest => {
                            tracing::debug!(task = %cx.task().id(), "malformed request line");
                            return Step::Finished;
                        }
                    }
                }

                Stage::Respond => {
                    self.stage = Stage::Sent;
                    return match io::write(cx, handler, &self.source, RESPONSE.to_vec(), self.sent) {
                        Ok(()) => Step::YieldIo,
                        Err(failed) => {
                            tracing::debug!(task = %cx.task().id(), error = %failed, "write not issued");
                            Step::Finished
                        }
                    };
                }

                Stage::Sent => {
                    let Some(res) = cx.take_io() else { return Step::Finished };
                    if !res.ok || res.bytes == 0 {
                        return Step::Finished;
                    }
                    self.sent += res.bytes;
                    if self.sent >= RESPONSE.len() {
                        return Step::Finished;
                    }
                    self.stage = Stage::Respond;
                }
            }
        }
    }

    fn destruct(&mut self, end: TaskEnd) {
        let req = self.parser.request();
        tracing::debug!(
            ?end,
            method = req.map(|r| r.method.as_str()),
            path = req.map(|r| r.path.as_str()),
            headers = self.parser.headers().len(),
            responded = self.sent >= RESPONSE.len(),
            "connection closed"
        );
    }
}

/// Client factory serving every connection with a [`LineConn`].
pub fn line_factory(recv_buffer: usize) -> ClientFactory {
    Arc::new(move |engine: &Engine, handler: &Retainer<IoHandler>, source: Retainer<Source>| {
        let handler = handler
            .retain()
            .map_err(|e| TaskError::Construct(e.to_string()))?;
        engine.spawn::<LineConn>(LineParams { handler, source, recv_buffer })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::tests::handlers;
    use crate::worker::WorkerPool;
    use cport_core::op::Operation;
    use std::io::{Read, Write};
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;
    use std::time::{Duration, Instant};

    fn feed(p: &mut LineParser, buf: &mut [u8], filled: &mut usize, data: &[u8]) -> Progress {
        buf[*filled..*filled + data.len()].copy_from_slice(data);
        *filled += data.len();
        p.process(buf, filled)
    }

    #[test]
    fn test_request_line_parse() {
        let r = RequestLine::parse("GET /index.html HTTP/1.1").unwrap();
        assert_eq!(r.method, "GET");
        assert_eq!(r.path, "/index.html");
        assert_eq!(r.version, "HTTP/1.1");

        let r = RequestLine::parse("GET /").unwrap();
        assert_eq!(r.version, "");

        assert!(RequestLine::parse("GET").is_none());
        assert!(RequestLine::parse(" /").is_none());
    }

    #[test]
    fn test_partial_lines_are_kept() {
        let mut p = LineParser::new();
        let mut buf = vec![0u8; 64];
        let mut filled = 0;

        assert_eq!(feed(&mut p, &mut buf, &mut filled, b"GET / HT"), Progress::NeedMore);
        assert_eq!(filled, 8);
        assert!(p.request().is_none());

        assert_eq!(feed(&mut p, &mut buf, &mut filled, b"TP/1.1\r\nHost: x"), Progress::NeedMore);
        assert_eq!(p.request().unwrap().version, "HTTP/1.1");
        // Only the partial header is left, moved to the front.
        assert_eq!(&buf[..filled], b"Host: x");

        assert_eq!(feed(&mut p, &mut buf, &mut filled, b"\r\n\r\n"), Progress::HeadersDone);
        assert_eq!(p.headers(), &[("Host".to_string(), "x".to_string())]);
        assert_eq!(filled, 0);
    }

    #[test]
    fn test_bare_newlines_and_leading_blank_lines() {
        let mut p = LineParser::new();
        let mut buf = vec![0u8; 64];
        let mut filled = 0;
        let progress = feed(&mut p, &mut buf, &mut filled, b"\r\nPUT /a HTTP/1.0\nX: 1\n\nbody");
        assert_eq!(progress, Progress::HeadersDone);
        assert_eq!(p.request().unwrap().method, "PUT");
        assert_eq!(p.headers().len(), 1);
        // Bytes past the header block stay in the buffer.
        assert_eq!(&buf[..filled], b"body");
    }

    #[test]
    fn test_overflow() {
        let mut p = LineParser::new();
        let mut buf = vec![0u8; 16];
        let mut filled = 0;
        assert_eq!(feed(&mut p, &mut buf, &mut filled, b"GET /aaaaaaaaaaa"), Progress::Overflow);

        // A full buffer that still yields a line is not an overflow.
        let mut p = LineParser::new();
        let mut filled = 0;
        assert_eq!(feed(&mut p, &mut buf, &mut filled, b"GET / HTTP/1.1\nH"), Progress::NeedMore);
        assert_eq!(filled, 1);
    }

    #[test]
    #[tracing_test::traced_test]
    fn test_bad_request_line() {
        let mut p = LineParser::new();
        let mut buf = vec![0u8; 32];
        let mut filled = 0;
        assert_eq!(feed(&mut p, &mut buf, &mut filled, b"nonsense\r\n"), Progress::BadRequest);
        assert!(logs_contain("nonsense"));
    }

    fn serve(h: &Retainer<IoHandler>) -> (WorkerPool, Arc<Engine>) {
        let engine = Arc::new(Engine::default());
        let pool = WorkerPool::start(2, h, engine.clone(), line_factory(256)).unwrap();
        (pool, engine)
    }

    fn wait_finished(engine: &Engine, n: u64) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.stats().finished < n && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_serves_request() {
        for h in handlers() {
            let (pool, engine) = serve(&h);
            let (a, mut peer) = UnixStream::pair().unwrap();
            peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            h.get().unwrap().post(Operation::start_client(OwnedFd::from(a))).unwrap();

            // Split across writes so the parser sees partial lines.
            peer.write_all(b"GET /hello HTTP/1.1\r\nHo").unwrap();
            std::thread::sleep(Duration::from_millis(20));
            peer.write_all(b"st: localhost\r\n\r\n").unwrap();

            let mut reply = Vec::new();
            peer.read_to_end(&mut reply).unwrap();
            assert_eq!(reply, RESPONSE);

            wait_finished(&engine, 1);
            h.get().unwrap().close();
            pool.join();
            assert_eq!(engine.stats().finished, 1);
        }
    }

    #[test]
    fn test_peer_close_finishes_task() {
        for h in handlers() {
            let (pool, engine) = serve(&h);
            let (a, mut peer) = UnixStream::pair().unwrap();
            h.get().unwrap().post(Operation::start_client(OwnedFd::from(a))).unwrap();
            peer.write_all(b"GET / HTTP/1.1\r\n").unwrap();
            drop(peer);

            wait_finished(&engine, 1);
            h.get().unwrap().close();
            pool.join();
            assert_eq!(engine.stats().finished, 1);
        }
    }

    #[test]
    fn test_oversized_line_closes_connection() {
        for h in handlers() {
            let (pool, engine) = serve(&h);
            let (a, mut peer) = UnixStream::pair().unwrap();
            peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            h.get().unwrap().post(Operation::start_client(OwnedFd::from(a))).unwrap();
            peer.write_all(&[b'a'; 300]).unwrap();

            let mut reply = Vec::new();
            // The server closes without answering; the peer may see a reset.
            let _ = peer.read_to_end(&mut reply);
            assert!(reply.is_empty());

            wait_finished(&engine, 1);
            h.get().unwrap().close();
            pool.join();
        }
    }
}
