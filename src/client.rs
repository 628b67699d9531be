//! WebSocket client
//!
//! [`WsClient`] owns one logical connection: it opens transports through a
//! [`Connector`], drives the [`Connection`] state machine from readiness
//! notifications and timers on a [`Scheduler`], and reconnects on failure.
//!
//! Callbacks never run while the client's state is borrowed, so they may call
//! back into the client. Methods called by the application never invoke
//! callbacks synchronously; any notification they produce is deferred to the
//! next turn of the event loop.
//!
//! Callbacks that need the client should capture a [`WeakClient`]. A strong
//! [`WsClient`] clone inside a callback keeps the client alive until
//! [`WsClient::disconnect`] releases the callbacks.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::rc::{Rc, Weak};

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::Config;
use crate::connection::{Connection, ConnectionState, Event};
use crate::error::{CloseReason, Error, HandshakeError, Result};
use crate::frame::OpCode;
use crate::handshake::Endpoint;
use crate::reconnect::ReconnectPolicy;
use crate::scheduler::{Scheduler, TimerHandle};
use crate::transport::{Connector, Transport};

/// Reads drained per readiness notification
const MAX_READS_PER_WAKEUP: usize = 16;

type MessageFn = Box<dyn FnMut(OpCode, &[u8])>;
type NotifyFn = Box<dyn FnMut()>;
type GiveUpFn = Box<dyn FnMut(u32)>;

/// Application callbacks
pub struct Callbacks {
    on_message: MessageFn,
    on_disconnect: NotifyFn,
    on_open: Option<NotifyFn>,
    on_give_up: Option<GiveUpFn>,
}

impl Callbacks {
    /// Message and disconnect callbacks
    ///
    /// `on_disconnect` fires when an open connection is lost without the
    /// application asking for it (transport error, keepalive timeout,
    /// protocol error, server-initiated close).
    pub fn new<M, D>(on_message: M, on_disconnect: D) -> Self
    where
        M: FnMut(OpCode, &[u8]) + 'static,
        D: FnMut() + 'static,
    {
        Self {
            on_message: Box::new(on_message),
            on_disconnect: Box::new(on_disconnect),
            on_open: None,
            on_give_up: None,
        }
    }

    /// Called after every successful handshake
    pub fn on_open(mut self, f: impl FnMut() + 'static) -> Self {
        self.on_open = Some(Box::new(f));
        self
    }

    /// Called once the reconnect policy runs out of attempts, with the
    /// number of reconnect attempts made
    pub fn on_give_up(mut self, f: impl FnMut(u32) + 'static) -> Self {
        self.on_give_up = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_open", &self.on_open.is_some())
            .field("on_give_up", &self.on_give_up.is_some())
            .finish_non_exhaustive()
    }
}

/// Deferred callback invocation
#[derive(Debug)]
enum Notice {
    Open,
    Message(OpCode, Bytes),
    Disconnected,
    GaveUp(u32),
}

struct Shared<C: Connector, S: Scheduler> {
    inner: RefCell<Inner<C, S>>,
    callbacks: RefCell<Option<Callbacks>>,
    /// Bumped whenever callbacks are installed or released
    callbacks_epoch: Cell<u64>,
}

struct Inner<C: Connector, S: Scheduler> {
    connector: C,
    scheduler: S,
    config: Config,
    endpoint: Option<Endpoint>,
    connection: Connection,
    transport: Option<C::Transport>,
    policy: ReconnectPolicy,
    read_buf: Vec<u8>,
    /// Bumped per attempt and teardown; stale timers and watchers compare it
    generation: u64,
    /// The application wants to be connected
    active: bool,
    /// The current attempt reached `Open`
    opened: bool,
    keepalive_timer: Option<S::Handle>,
    pong_timer: Option<S::Handle>,
    handshake_timer: Option<S::Handle>,
    close_timer: Option<S::Handle>,
    reconnect_timer: Option<S::Handle>,
}

/// Event-driven WebSocket client with keepalive and reconnection
///
/// # Example
///
/// ```no_run
/// use ws_tether::prelude::*;
///
/// dispatch_forever(|| {
///     let client = WsClient::new(TcpConnector, TokioScheduler, Config::default());
///     let sender = client.downgrade();
///     let callbacks = Callbacks::new(
///         |opcode, payload| println!("{opcode:?} {}", String::from_utf8_lossy(payload)),
///         || println!("disconnected, reconnecting in 5 seconds"),
///     )
///     .on_open(move || {
///         if let Some(client) = sender.upgrade() {
///             let _ = client.send_text("hello world");
///         }
///     });
///     if let Err(e) = client.connect("ws://echo.websocket.org", callbacks) {
///         eprintln!("connect failed: {e}");
///     }
///     client
/// })
/// .unwrap();
/// ```
pub struct WsClient<C: Connector, S: Scheduler> {
    shared: Rc<Shared<C, S>>,
}

/// Non-owning handle to a [`WsClient`], for use inside callbacks
pub struct WeakClient<C: Connector, S: Scheduler> {
    shared: Weak<Shared<C, S>>,
}

impl<C: Connector, S: Scheduler> WeakClient<C, S> {
    /// The client, if any handle to it is still alive
    pub fn upgrade(&self) -> Option<WsClient<C, S>> {
        self.shared.upgrade().map(|shared| WsClient { shared })
    }
}

impl<C: Connector, S: Scheduler> Clone for WeakClient<C, S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C: Connector, S: Scheduler> fmt::Debug for WeakClient<C, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakClient")
            .field("alive", &(self.shared.strong_count() > 0))
            .finish()
    }
}

impl<C: Connector, S: Scheduler> Clone for WsClient<C, S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C: Connector, S: Scheduler> fmt::Debug for WsClient<C, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.shared.inner.try_borrow() {
            Ok(inner) => f
                .debug_struct("WsClient")
                .field("endpoint", &inner.endpoint)
                .field("state", &inner.connection.state())
                .field("attempts", &inner.policy.attempt_count())
                .finish(),
            Err(_) => f.debug_struct("WsClient").finish_non_exhaustive(),
        }
    }
}

impl<C: Connector, S: Scheduler> WsClient<C, S> {
    /// Create a disconnected client
    pub fn new(connector: C, scheduler: S, config: Config) -> Self {
        let now = scheduler.now();
        let inner = Inner {
            connection: Connection::new(&config, now),
            policy: ReconnectPolicy::new(config.reconnect()),
            read_buf: vec![0; config.read_buffer_size.max(1)],
            connector,
            scheduler,
            config,
            endpoint: None,
            transport: None,
            generation: 0,
            active: false,
            opened: false,
            keepalive_timer: None,
            pong_timer: None,
            handshake_timer: None,
            close_timer: None,
            reconnect_timer: None,
        };

        Self {
            shared: Rc::new(Shared {
                inner: RefCell::new(inner),
                callbacks: RefCell::new(None),
                callbacks_epoch: Cell::new(0),
            }),
        }
    }

    /// Handle that does not keep the client alive
    pub fn downgrade(&self) -> WeakClient<C, S> {
        WeakClient {
            shared: Rc::downgrade(&self.shared),
        }
    }

    /// Connect to `url` and keep the connection alive
    ///
    /// The TCP connect and upgrade request happen now; the handshake
    /// completes asynchronously (`on_open`). If the first attempt fails
    /// immediately the error is returned and a retry is still scheduled,
    /// except for an unparseable URL. A close started by
    /// [`disconnect`](Self::disconnect) that is still waiting for its echo is
    /// abandoned.
    pub fn connect(&self, url: &str, callbacks: Callbacks) -> Result<()> {
        let endpoint = Endpoint::parse(url)?;
        let weak = Rc::downgrade(&self.shared);

        let mut guard = self.shared.inner.borrow_mut();
        let inner = &mut *guard;
        match inner.connection.state() {
            ConnectionState::Disconnected => {}
            ConnectionState::Closing => {
                debug!("abandoning close handshake");
                inner.teardown();
            }
            ConnectionState::Handshaking | ConnectionState::Open => {
                return Err(Error::InvalidState("already connected"));
            }
        }

        let previous = self.shared.callbacks.borrow_mut().replace(callbacks);
        self.shared.bump_epoch();
        cancel(&mut inner.reconnect_timer);
        inner.policy.reset();
        inner.endpoint = Some(endpoint);
        inner.active = true;

        let mut notices = Vec::new();
        let result = inner.attempt(&weak);
        if let Err(err) = &result {
            inner.fail(err, &weak, &mut notices);
        }
        drop(guard);
        drop(previous);

        self.defer(notices);
        result
    }

    /// Send one message as a single masked frame
    ///
    /// Fails with `NotConnected` unless the connection is open, and with
    /// `BufferCapacity` (leaving the connection untouched) if the frame does
    /// not fit in the output buffer. A transport error tears the connection
    /// down and enters the reconnect cycle.
    pub fn send(&self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        let weak = Rc::downgrade(&self.shared);
        let mut guard = self.shared.inner.borrow_mut();
        let inner = &mut *guard;
        inner.connection.send(opcode, payload)?;

        if let Err(err) = inner.flush() {
            let mut notices = Vec::new();
            inner.fail(&err, &weak, &mut notices);
            drop(guard);
            self.defer(notices);
            return Err(err);
        }
        Ok(())
    }

    /// Send a text message
    pub fn send_text(&self, text: &str) -> Result<()> {
        self.send(OpCode::Text, text.as_bytes())
    }

    /// Send a binary message
    pub fn send_binary(&self, data: &[u8]) -> Result<()> {
        self.send(OpCode::Binary, data)
    }

    /// Stop: cancel any pending reconnect and close the connection
    ///
    /// An open connection sends a Close frame and waits for the echo (or
    /// `close_timeout`); anything else is torn down at once. The callbacks
    /// are released and none of them is called again until the next
    /// [`connect`](Self::connect).
    pub fn disconnect(&self) {
        let released = self.shared.callbacks.borrow_mut().take();
        self.shared.bump_epoch();
        self.close_connection();
        drop(released);
    }

    fn close_connection(&self) {
        let weak = Rc::downgrade(&self.shared);
        let mut guard = self.shared.inner.borrow_mut();
        let inner = &mut *guard;
        inner.active = false;
        cancel(&mut inner.reconnect_timer);

        if !inner.connection.is_open() {
            inner.teardown();
            info!("disconnected");
            return;
        }

        let closing = inner
            .connection
            .close(CloseReason::normal())
            .and_then(|()| inner.flush());
        match closing {
            Ok(()) => {
                let generation = inner.generation;
                let timeout = inner.config.close_timeout;
                inner.close_timer = Some(inner.scheduler.call_after(
                    timeout,
                    callback(&weak, move |shared| shared.on_close_timeout(generation)),
                ));
                debug!("waiting for close echo");
            }
            Err(err) => {
                debug!(error = %err, "close frame not sent");
                inner.teardown();
                info!("disconnected");
            }
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.shared.inner.borrow().connection.state()
    }

    /// Whether the connection is open
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Reconnect attempts since the last successful handshake
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.inner.borrow().policy.attempt_count()
    }

    /// Whether a reconnect attempt is scheduled
    pub fn reconnect_pending(&self) -> bool {
        self.shared.inner.borrow().reconnect_timer.is_some()
    }

    fn defer(&self, notices: Vec<Notice>) {
        if notices.is_empty() {
            return;
        }
        let weak = Rc::downgrade(&self.shared);
        let scheduler = self.shared.inner.borrow().scheduler.clone();
        scheduler.call_now(move || {
            if let Some(shared) = weak.upgrade() {
                shared.dispatch(notices);
            }
        });
    }
}

/// Wrap a handler so it only runs while the client is alive
fn callback<C, S, F>(weak: &Weak<Shared<C, S>>, mut f: F) -> impl FnMut() + 'static
where
    C: Connector,
    S: Scheduler,
    F: FnMut(&Rc<Shared<C, S>>) + 'static,
{
    let weak = weak.clone();
    move || {
        if let Some(shared) = weak.upgrade() {
            f(&shared);
        }
    }
}

fn cancel<H: TimerHandle>(timer: &mut Option<H>) {
    if let Some(handle) = timer.take() {
        handle.cancel();
    }
}

impl<C: Connector, S: Scheduler> Shared<C, S> {
    fn bump_epoch(&self) {
        self.callbacks_epoch.set(self.callbacks_epoch.get().wrapping_add(1));
    }

    /// Run `f` with the state borrowed, then deliver what it produced
    fn with_inner<F>(self: &Rc<Self>, f: F)
    where
        F: FnOnce(&mut Inner<C, S>, &Weak<Self>, &mut Vec<Notice>),
    {
        let weak = Rc::downgrade(self);
        let mut notices = Vec::new();
        {
            let mut inner = self.inner.borrow_mut();
            f(&mut inner, &weak, &mut notices);
        }
        self.dispatch(notices);
    }

    fn dispatch(&self, notices: Vec<Notice>) {
        if notices.is_empty() {
            return;
        }
        let taken = self.callbacks.borrow_mut().take();
        let Some(mut callbacks) = taken else {
            return;
        };
        let epoch = self.callbacks_epoch.get();

        for notice in notices {
            // connect() or disconnect() from inside a callback
            if self.callbacks_epoch.get() != epoch {
                break;
            }
            match notice {
                Notice::Open => {
                    if let Some(f) = callbacks.on_open.as_mut() {
                        f();
                    }
                }
                Notice::Message(opcode, payload) => (callbacks.on_message)(opcode, &payload),
                Notice::Disconnected => (callbacks.on_disconnect)(),
                Notice::GaveUp(attempts) => {
                    if let Some(f) = callbacks.on_give_up.as_mut() {
                        f(attempts);
                    }
                }
            }
        }

        if self.callbacks_epoch.get() == epoch {
            *self.callbacks.borrow_mut() = Some(callbacks);
        }
    }

    fn on_readable(self: &Rc<Self>, generation: u64) {
        self.with_inner(|inner, weak, notices| {
            if inner.generation == generation {
                inner.read_available(weak, notices);
            }
        });
    }

    fn on_keepalive(self: &Rc<Self>, generation: u64) {
        self.with_inner(|inner, weak, notices| {
            if inner.generation == generation {
                inner.keepalive(weak, notices);
            }
        });
    }

    fn on_pong_deadline(self: &Rc<Self>, generation: u64) {
        self.with_inner(|inner, weak, notices| {
            if inner.generation != generation {
                return;
            }
            inner.pong_timer = None;
            if inner.connection.awaiting_pong() {
                inner.keepalive(weak, notices);
            }
        });
    }

    fn on_handshake_timeout(self: &Rc<Self>, generation: u64) {
        self.with_inner(|inner, weak, notices| {
            if inner.generation != generation {
                return;
            }
            inner.handshake_timer = None;
            if inner.connection.state() == ConnectionState::Handshaking {
                inner.fail(&Error::Handshake(HandshakeError::Timeout), weak, notices);
            }
        });
    }

    fn on_close_timeout(self: &Rc<Self>, generation: u64) {
        self.with_inner(|inner, _, _| {
            if inner.generation != generation {
                return;
            }
            inner.close_timer = None;
            info!("close handshake timed out");
            inner.teardown();
        });
    }

    fn on_reconnect(self: &Rc<Self>) {
        self.with_inner(|inner, weak, notices| {
            inner.reconnect_timer = None;
            if !inner.active || inner.connection.state() != ConnectionState::Disconnected {
                return;
            }
            if let Err(err) = inner.attempt(weak) {
                inner.fail(&err, weak, notices);
            }
        });
    }
}

impl<C: Connector, S: Scheduler> Inner<C, S> {
    /// Open a transport and send the upgrade request
    fn attempt(&mut self, weak: &Weak<Shared<C, S>>) -> Result<()> {
        let endpoint = self
            .endpoint
            .clone()
            .ok_or(Error::InvalidState("no endpoint"))?;

        self.generation += 1;
        let generation = self.generation;
        info!(
            host = %endpoint.host,
            port = endpoint.port,
            attempt = self.policy.attempt_count(),
            "connecting"
        );

        let mut transport = self.connector.open(&endpoint, self.config.connect_timeout)?;
        transport.set_nonblocking(true)?;
        transport.on_readable(Box::new(callback(weak, move |shared| {
            shared.on_readable(generation)
        })));
        self.transport = Some(transport);

        self.connection.reset();
        self.connection.start_handshake(&endpoint)?;
        self.flush()?;

        self.handshake_timer = Some(self.scheduler.call_after(
            self.config.handshake_timeout,
            callback(weak, move |shared| shared.on_handshake_timeout(generation)),
        ));
        Ok(())
    }

    /// Write queued output until the transport stops accepting
    fn flush(&mut self) -> Result<()> {
        let Some(transport) = self.transport.as_mut() else {
            return Ok(());
        };

        while self.connection.has_pending_output() {
            match transport.send(self.connection.pending_output()) {
                Ok(0) => break,
                Ok(n) => self.connection.consume_output(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn read_available(&mut self, weak: &Weak<Shared<C, S>>, notices: &mut Vec<Notice>) {
        for _ in 0..MAX_READS_PER_WAKEUP {
            let Some(transport) = self.transport.as_mut() else {
                return;
            };

            let n = match transport.receive(&mut self.read_buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.fail(&e.into(), weak, notices);
                    return;
                }
            };

            let now = self.scheduler.now();
            let events = match self.connection.receive(&self.read_buf[..n], now) {
                Ok(events) => events,
                Err(err) => {
                    self.fail(&err, weak, notices);
                    return;
                }
            };

            let generation = self.generation;
            for event in events {
                self.handle_event(event, weak, notices);
            }
            if self.generation != generation {
                return;
            }
        }

        if let Err(err) = self.flush() {
            self.fail(&err, weak, notices);
        }
    }

    fn handle_event(&mut self, event: Event, weak: &Weak<Shared<C, S>>, notices: &mut Vec<Notice>) {
        match event {
            Event::Open { protocol } => {
                cancel(&mut self.handshake_timer);
                self.opened = true;
                self.policy.reset();
                info!(protocol = ?protocol, "websocket open");

                if self.config.auto_ping && self.config.ping_interval.is_zero() {
                    warn!("ping_interval is zero, keepalive disabled");
                } else if self.config.auto_ping {
                    let generation = self.generation;
                    self.keepalive_timer = Some(self.scheduler.call_every(
                        self.config.ping_interval,
                        callback(weak, move |shared| shared.on_keepalive(generation)),
                    ));
                }
                notices.push(Notice::Open);
            }
            Event::Message { opcode, payload } => notices.push(Notice::Message(opcode, payload)),
            Event::Closed(reason) => {
                if let Err(err) = self.flush() {
                    debug!(error = %err, "close echo not sent");
                }
                let was_open = self.opened;
                self.teardown();

                if self.active {
                    info!(code = ?reason.as_ref().map(|r| r.code), "server closed the connection");
                    if was_open {
                        notices.push(Notice::Disconnected);
                    }
                    self.schedule_reconnect(weak, notices);
                } else {
                    info!("disconnected");
                }
            }
        }
    }

    fn keepalive(&mut self, weak: &Weak<Shared<C, S>>, notices: &mut Vec<Notice>) {
        let had_ping = self.connection.awaiting_pong();
        let now = self.scheduler.now();

        if let Err(err) = self.connection.keepalive_tick(now) {
            self.fail(&err, weak, notices);
            return;
        }

        if !had_ping && self.connection.awaiting_pong() {
            let generation = self.generation;
            cancel(&mut self.pong_timer);
            self.pong_timer = Some(self.scheduler.call_after(
                self.config.pong_timeout,
                callback(weak, move |shared| shared.on_pong_deadline(generation)),
            ));
        }

        if let Err(err) = self.flush() {
            self.fail(&err, weak, notices);
        }
    }

    /// Tear down after an error and enter the reconnect cycle
    fn fail(&mut self, err: &Error, weak: &Weak<Shared<C, S>>, notices: &mut Vec<Notice>) {
        match err {
            Error::KeepaliveTimeout(_) => warn!(error = %err, "connection lost"),
            Error::Handshake(_) => warn!(error = %err, "handshake failed"),
            Error::Protocol(_) => warn!(error = %err, "protocol violation"),
            _ => warn!(error = %err, "connection failed"),
        }

        // Best effort: a queued Close frame may still make it out
        if self.connection.has_pending_output() {
            if let Err(flush_err) = self.flush() {
                debug!(error = %flush_err, "pending output dropped");
            }
        }

        let was_open = self.opened;
        self.teardown();

        if self.active {
            if was_open {
                notices.push(Notice::Disconnected);
            }
            self.schedule_reconnect(weak, notices);
        }
    }

    fn schedule_reconnect(&mut self, weak: &Weak<Shared<C, S>>, notices: &mut Vec<Notice>) {
        cancel(&mut self.reconnect_timer);
        match self.policy.next_delay() {
            Some(delay) => {
                info!(
                    delay_ms = delay.as_millis() as u64,
                    attempt = self.policy.attempt_count(),
                    "reconnect scheduled"
                );
                self.reconnect_timer = Some(
                    self.scheduler
                        .call_after(delay, callback(weak, |shared| shared.on_reconnect())),
                );
            }
            None => {
                let attempts = self.policy.attempt_count();
                warn!(attempts, "giving up reconnecting");
                self.active = false;
                notices.push(Notice::GaveUp(attempts));
            }
        }
    }

    /// Release the transport and timers and return to `Disconnected`
    fn teardown(&mut self) {
        self.generation += 1;
        self.opened = false;
        cancel(&mut self.keepalive_timer);
        cancel(&mut self.pong_timer);
        cancel(&mut self.handshake_timer);
        cancel(&mut self.close_timer);
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.connection.reset();
    }
}

impl<C: Connector, S: Scheduler> Drop for Inner<C, S> {
    fn drop(&mut self) {
        cancel(&mut self.reconnect_timer);
        self.teardown();
    }
}
