//! In-memory transport and helpers for driving `WsClient` in tests

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use bytes::BytesMut;
use ws_tether::frame::{Frame, FrameDecoder, OpCode, encode_frame};
use ws_tether::handshake::{Endpoint, generate_accept_key};
use ws_tether::transport::{Connector, ReadableCallback, Transport};
use ws_tether::{Callbacks, Config};

/// One simulated TCP connection
#[derive(Default)]
pub struct Wire {
    pub written: Vec<u8>,
    pub incoming: VecDeque<Vec<u8>>,
    pub readable: Option<ReadableCallback>,
    pub closed: bool,
    pub eof: bool,
}

#[derive(Default)]
pub struct NetState {
    pub wires: Vec<Rc<RefCell<Wire>>>,
    pub opens: u32,
    pub fail_opens: u32,
}

/// Connector handing out in-memory wires
#[derive(Clone, Default)]
pub struct MockNet(pub Rc<RefCell<NetState>>);

pub struct MockTransport {
    wire: Rc<RefCell<Wire>>,
}

impl Connector for MockNet {
    type Transport = MockTransport;

    fn open(&mut self, _endpoint: &Endpoint, _timeout: Duration) -> io::Result<MockTransport> {
        let mut state = self.0.borrow_mut();
        state.opens += 1;
        if state.fail_opens > 0 {
            state.fail_opens -= 1;
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        }
        let wire = Rc::new(RefCell::new(Wire::default()));
        state.wires.push(wire.clone());
        Ok(MockTransport { wire })
    }
}

impl Transport for MockTransport {
    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut wire = self.wire.borrow_mut();
        if wire.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
        }
        wire.written.extend_from_slice(data);
        Ok(data.len())
    }

    fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut wire = self.wire.borrow_mut();
        let Some(mut chunk) = wire.incoming.pop_front() else {
            return if wire.eof {
                Err(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"))
            } else {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "empty"))
            };
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            wire.incoming.push_front(chunk.split_off(n));
        }
        Ok(n)
    }

    fn set_nonblocking(&mut self, _nonblocking: bool) -> io::Result<()> {
        Ok(())
    }

    fn on_readable(&mut self, callback: ReadableCallback) {
        self.wire.borrow_mut().readable = Some(callback);
    }

    fn close(&mut self) {
        let mut wire = self.wire.borrow_mut();
        wire.closed = true;
        wire.readable = None;
    }
}

impl MockNet {
    pub fn opens(&self) -> u32 {
        self.0.borrow().opens
    }

    pub fn fail_next_opens(&self, n: u32) {
        self.0.borrow_mut().fail_opens = n;
    }

    pub fn wire(&self) -> Rc<RefCell<Wire>> {
        self.0.borrow().wires.last().cloned().expect("no wire opened")
    }

    pub fn wire_closed(&self) -> bool {
        self.wire().borrow().closed
    }

    /// Queue bytes from the server and signal readiness
    pub fn deliver(&self, bytes: &[u8]) {
        let wire = self.wire();
        wire.borrow_mut().incoming.push_back(bytes.to_vec());
        notify(&wire);
    }

    /// Server shuts the stream down
    pub fn hang_up(&self) {
        let wire = self.wire();
        wire.borrow_mut().eof = true;
        notify(&wire);
    }

    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.wire().borrow_mut().written)
    }

    /// Answer the pending upgrade request with a valid 101
    pub fn accept_handshake(&self) {
        let request = String::from_utf8(self.take_written()).expect("request is not UTF-8");
        let key = request
            .lines()
            .find_map(|line| line.strip_prefix("Sec-WebSocket-Key: "))
            .expect("no Sec-WebSocket-Key header")
            .trim();
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            generate_accept_key(key)
        );
        self.deliver(response.as_bytes());
    }

    /// Frames the client wrote since the last call
    pub fn client_frames(&self) -> Vec<Frame> {
        let written = self.take_written();
        FrameDecoder::new(usize::MAX)
            .decode_all(&written)
            .expect("client wrote an invalid frame")
    }
}

fn notify(wire: &Rc<RefCell<Wire>>) {
    let callback = wire.borrow_mut().readable.take();
    if let Some(mut callback) = callback {
        callback();
        let mut wire = wire.borrow_mut();
        if !wire.closed && wire.readable.is_none() {
            wire.readable = Some(callback);
        }
    }
}

/// Unmasked server-to-client frame
pub fn server_frame(opcode: OpCode, payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    encode_frame(&mut buf, usize::MAX, opcode, payload, None).expect("encode");
    buf.to_vec()
}

/// What the application saw
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Open,
    Message(OpCode, Vec<u8>),
    Disconnected,
    GaveUp(u32),
}

pub type Log = Rc<RefCell<Vec<Record>>>;

pub fn recorder() -> (Callbacks, Log) {
    let log: Log = Rc::default();
    let (m, d, o, g) = (log.clone(), log.clone(), log.clone(), log.clone());
    let callbacks = Callbacks::new(
        move |opcode, payload| m.borrow_mut().push(Record::Message(opcode, payload.to_vec())),
        move || d.borrow_mut().push(Record::Disconnected),
    )
    .on_open(move || o.borrow_mut().push(Record::Open))
    .on_give_up(move |attempts| g.borrow_mut().push(Record::GaveUp(attempts)));
    (callbacks, log)
}

pub fn count(log: &Log, record: &Record) -> usize {
    log.borrow().iter().filter(|r| *r == record).count()
}

/// Let deferred callbacks run
pub async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

pub fn test_config() -> Config {
    Config::builder()
        .ping_interval(Duration::from_secs(10))
        .pong_timeout(Duration::from_secs(10))
        .build()
}
