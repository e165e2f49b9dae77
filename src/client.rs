//! The client session: connection lifecycle, frame demultiplexing, serial
//! allocation, reply correlation and subscription dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::error::{ErrorKind, Result};
use crate::match_rule::MatchRule;
use crate::message::Message;
use crate::proto::{Endianness, Flags, MessageType, MAX_ARRAY_LENGTH, MAX_BODY_LENGTH};
use crate::reader::ByteReader;
use crate::value::Value;
use crate::{address, auth};

/// Timeout applied to method calls unless one is supplied by the caller.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(3);

/// The error name sent for method calls no subscription claims.
const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";

/// Capacity of the inbound fan-out. A subscriber that falls further behind
/// than this observes a lag and skips ahead.
const INBOUND_CAPACITY: usize = 256;

/// One element of a method-call subscription predicate.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// The header field equals the string exactly.
    Exact(String),
    /// The header field starts with the literal prefix.
    Prefix(String),
    /// The header field matches the regular expression.
    Regex(regex::Regex),
}

impl Pattern {
    /// An exact-string pattern.
    pub fn exact(value: impl Into<String>) -> Self {
        Pattern::Exact(value.into())
    }

    /// A literal-prefix pattern.
    pub fn prefix(value: impl Into<String>) -> Self {
        Pattern::Prefix(value.into())
    }

    /// A regular-expression pattern.
    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Pattern::Regex(regex::Regex::new(pattern)?))
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            Pattern::Exact(expected) => value == expected,
            Pattern::Prefix(prefix) => value.starts_with(prefix.as_str()),
            Pattern::Regex(regex) => regex.is_match(value),
        }
    }
}

/// The predicate of one method-call subscription. A call matches when every
/// provided element is present in the header and matches.
struct CallMatcher {
    path: Option<Pattern>,
    interface: Option<Pattern>,
    member: Option<Pattern>,
}

impl CallMatcher {
    fn matches(&self, message: &Message) -> bool {
        if message.header.message_type != MessageType::MethodCall {
            return false;
        }

        for (pattern, field) in [
            (&self.path, message.path()),
            (&self.interface, message.interface()),
            (&self.member, message.member()),
        ] {
            if let Some(pattern) = pattern {
                let Some(field) = field else {
                    return false;
                };

                if !pattern.matches(field) {
                    return false;
                }
            }
        }

        true
    }
}

struct Inner {
    /// Write half of the socket; all sends serialize through this lock.
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Next serial to hand out. Zero is reserved, so allocation skips it on
    /// wrap.
    next_serial: AtomicU32,
    closing: AtomicBool,
    /// Server GUID from the authentication handshake.
    guid: String,
    /// Unique connection name returned by `Hello`.
    bus_name: OnceLock<String>,
    /// Serial to one-shot slot awaiting the reply with that serial.
    reply_waiters: StdMutex<HashMap<u32, oneshot::Sender<Message>>>,
    /// Active method-call subscriptions, in registration order.
    method_call_matchers: StdMutex<Vec<Arc<CallMatcher>>>,
    /// Fan-out of demultiplexed inbound messages. Dropped on close so that
    /// every subscriber stream terminates.
    inbound: StdMutex<Option<broadcast::Sender<Message>>>,
    /// Signal match rules and their listener counts.
    signal_rules: StdMutex<HashMap<String, usize>>,
    /// Demultiplexer and fallback-responder tasks, in spawn order.
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

/// An asynchronous D-Bus client session.
///
/// Cloning is cheap and every clone drives the same connection.
///
/// # Examples
///
/// ```no_run
/// use busio::{Client, Message};
///
/// # #[tokio::main] async fn main() -> busio::Result<()> {
/// let client = Client::session_bus().await?;
///
/// let m = Message::method_call("/org/freedesktop/DBus", "GetId")
///     .with_interface("org.freedesktop.DBus")
///     .with_destination("org.freedesktop.DBus");
///
/// let reply = client.call_method(m).await?;
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Connect to the session bus.
    ///
    /// The address is taken from `DBUS_SESSION_BUS_ADDRESS`, falling back to
    /// `unix:path=<runtime_dir>/bus`.
    pub async fn session_bus() -> Result<Self> {
        Self::connect(&address::session_bus()).await
    }

    /// Connect to the system bus.
    ///
    /// The address is taken from `DBUS_SYSTEM_BUS_ADDRESS`, falling back to
    /// `unix:path=/run/dbus/system_bus_socket`.
    pub async fn system_bus() -> Result<Self> {
        Self::connect(&address::system_bus()).await
    }

    /// Connect to the bus at `address`. Only `unix:path=` addresses are
    /// supported.
    pub async fn connect(address: &str) -> Result<Self> {
        let path = address::unix_path(address)?;
        let stream = UnixStream::connect(path).await?;
        Self::from_stream(stream).await
    }

    /// Establish a session over an already-opened stream: authenticate,
    /// start the demultiplexer and fallback responder, and say `Hello`.
    pub async fn from_stream(mut stream: UnixStream) -> Result<Self> {
        let uid = address::current_uid();
        let guid = auth::authenticate(&mut stream, uid).await?;
        tracing::debug!(guid = guid.as_str(), "authenticated");

        let (read, write) = stream.into_split();
        let (inbound, responder_rx) = broadcast::channel(INBOUND_CAPACITY);

        let client = Self {
            inner: Arc::new(Inner {
                writer: Mutex::new(Some(write)),
                next_serial: AtomicU32::new(1),
                closing: AtomicBool::new(false),
                guid,
                bus_name: OnceLock::new(),
                reply_waiters: StdMutex::new(HashMap::new()),
                method_call_matchers: StdMutex::new(Vec::new()),
                inbound: StdMutex::new(Some(inbound)),
                signal_rules: StdMutex::new(HashMap::new()),
                tasks: StdMutex::new(Vec::new()),
            }),
        };

        let demux = tokio::spawn(demux_task(read, client.inner.clone()));
        let responder = tokio::spawn(responder_task(client.clone(), responder_rx));

        client
            .inner
            .tasks
            .lock()
            .expect("lock poisoned")
            .extend([demux, responder]);

        match client.hello().await {
            Ok(name) => {
                tracing::debug!(name = name.as_str(), "connected");
                let _ = client.inner.bus_name.set(name);
            }
            Err(error) => {
                client.close().await;
                return Err(error);
            }
        }

        Ok(client)
    }

    /// The server GUID recorded during authentication.
    pub fn guid(&self) -> &str {
        &self.inner.guid
    }

    /// The unique connection name assigned by the bus.
    pub fn unique_name(&self) -> Option<&str> {
        self.inner.bus_name.get().map(String::as_str)
    }

    /// Test if the session has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    /// Allocate the next outgoing serial.
    pub fn next_serial(&self) -> u32 {
        loop {
            let serial = self.inner.next_serial.fetch_add(1, Ordering::Relaxed);

            if serial != 0 {
                return serial;
            }
        }
    }

    /// Send a message, allocating a serial if the message has none, and
    /// return the serial it was sent under.
    pub async fn send_message(&self, mut message: Message) -> Result<u32> {
        if self.is_closed() {
            return Err(ErrorKind::Closed.into());
        }

        if message.header.serial == 0 {
            message.header.serial = self.next_serial();
        }

        let serial = message.header.serial;
        self.send_raw(&message).await?;
        Ok(serial)
    }

    /// Invoke a method call and await its reply, with the default timeout of
    /// three seconds.
    ///
    /// An error reply surfaces as an [`Error`] carrying the error name.
    ///
    /// [`Error`]: crate::Error
    pub async fn call_method(&self, message: Message) -> Result<Message> {
        self.call_method_timeout(message, DEFAULT_CALL_TIMEOUT).await
    }

    /// Invoke a method call and await its reply for up to `duration`.
    ///
    /// A call sent with [`Flags::NO_REPLY_EXPECTED`] registers no reply
    /// waiter and resolves to an empty synthetic reply right after the send.
    pub async fn call_method_timeout(
        &self,
        mut message: Message,
        duration: Duration,
    ) -> Result<Message> {
        if self.is_closed() {
            return Err(ErrorKind::Closed.into());
        }

        let serial = self.next_serial();
        message.header.serial = serial;

        if message.header.flags & Flags::NO_REPLY_EXPECTED {
            self.send_raw(&message).await?;
            return Ok(message.method_return());
        }

        let (tx, rx) = oneshot::channel();

        self.inner
            .reply_waiters
            .lock()
            .expect("lock poisoned")
            .insert(serial, tx);

        if let Err(error) = self.send_raw(&message).await {
            self.remove_waiter(serial);
            return Err(error);
        }

        match tokio::time::timeout(duration, rx).await {
            Err(..) => {
                // No residue: a reply arriving for this serial later on is
                // dropped silently.
                self.remove_waiter(serial);
                Err(ErrorKind::CallTimedOut.into())
            }
            Ok(Err(..)) => Err(ErrorKind::Closed.into()),
            Ok(Ok(reply)) => {
                if reply.header.message_type == MessageType::Error {
                    let name = reply.error_name().unwrap_or_default();
                    let text = reply.body.first().and_then(Value::as_str).unwrap_or_default();
                    return Err(ErrorKind::ResponseError(name.into(), text.into()).into());
                }

                Ok(reply)
            }
        }
    }

    /// Reply to a received method call with the given body.
    pub async fn reply(&self, call: &Message, body: Vec<Value>) -> Result<()> {
        self.send_message(call.method_return().with_body(body))
            .await?;
        Ok(())
    }

    /// Reply to a received method call with an error. A non-empty `text`
    /// becomes the string body of the error reply.
    pub async fn reply_error(&self, call: &Message, error_name: &str, text: &str) -> Result<()> {
        let mut m = call.error_reply(error_name);

        if !text.is_empty() {
            m = m.with_arg(Value::Str(text.into()));
        }

        self.send_message(m).await?;
        Ok(())
    }

    /// Subscribe to inbound method calls matching the given patterns.
    ///
    /// A call matches when every provided pattern is present in the header
    /// and matches; the subscriber is responsible for sending the reply.
    /// Matching calls are no longer answered by the fallback
    /// `UnknownMethod` responder.
    pub fn method_call_stream(
        &self,
        path: Option<Pattern>,
        interface: Option<Pattern>,
        member: Option<Pattern>,
    ) -> MethodCallStream {
        let matcher = Arc::new(CallMatcher {
            path,
            interface,
            member,
        });

        self.inner
            .method_call_matchers
            .lock()
            .expect("lock poisoned")
            .push(matcher.clone());

        MethodCallStream {
            rx: self.subscribe(),
            matcher,
            inner: self.inner.clone(),
        }
    }

    /// Subscribe to signals matching the given header fields.
    ///
    /// The first listener for a rule registers it with the bus daemon via
    /// `AddMatch`; dropping the last listener deregisters it again.
    pub async fn signal_stream(
        &self,
        path: Option<&str>,
        interface: Option<&str>,
        member: Option<&str>,
        sender: Option<&str>,
    ) -> Result<SignalStream> {
        let mut rule = MatchRule::new().with_message_type(MessageType::Signal);

        if let Some(sender) = sender {
            rule = rule.with_sender(sender);
        }

        if let Some(interface) = interface {
            rule = rule.with_interface(interface);
        }

        if let Some(member) = member {
            rule = rule.with_member(member);
        }

        if let Some(path) = path {
            rule = rule.with_path(path);
        }

        self.subscribe_signals(rule).await
    }

    /// Subscribe to signals matching an explicit match rule.
    pub async fn subscribe_signals(&self, rule: MatchRule) -> Result<SignalStream> {
        let rule_string = rule.to_string();
        let rx = self.subscribe();

        let first = {
            let mut rules = self.inner.signal_rules.lock().expect("lock poisoned");
            let count = rules.entry(rule_string.clone()).or_insert(0);
            *count += 1;
            *count == 1
        };

        if first {
            if let Err(error) = self.add_match(&rule_string).await {
                // Registration against a closing session is dropped; the
                // stream still terminates cleanly.
                if !error.is_closed() {
                    let mut rules = self.inner.signal_rules.lock().expect("lock poisoned");

                    if let Some(count) = rules.get_mut(&rule_string) {
                        *count -= 1;

                        if *count == 0 {
                            rules.remove(&rule_string);
                        }
                    }

                    return Err(error);
                }
            }
        }

        Ok(SignalStream {
            rx,
            rule,
            rule_string: Some(rule_string),
            client: self.clone(),
        })
    }

    /// Close the session.
    ///
    /// Closing is idempotent: the fallback responder and demultiplexer are
    /// cancelled, every outstanding reply waiter completes with "Connection
    /// closed", subscription streams terminate, and the socket is destroyed.
    pub async fn close(&self) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut tasks: Vec<_> = {
            let mut guard = self.inner.tasks.lock().expect("lock poisoned");
            guard.drain(..).collect()
        };

        if let Some(responder) = tasks.pop() {
            responder.abort();
        }

        *self.inner.inbound.lock().expect("lock poisoned") = None;

        for task in tasks {
            task.abort();
        }

        self.inner
            .reply_waiters
            .lock()
            .expect("lock poisoned")
            .clear();

        *self.inner.writer.lock().await = None;
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<Message>> {
        self.inner
            .inbound
            .lock()
            .expect("lock poisoned")
            .as_ref()
            .map(broadcast::Sender::subscribe)
    }

    fn remove_waiter(&self, serial: u32) {
        self.inner
            .reply_waiters
            .lock()
            .expect("lock poisoned")
            .remove(&serial);
    }

    async fn send_raw(&self, message: &Message) -> Result<()> {
        let bytes = message.marshal()?;
        let mut writer = self.inner.writer.lock().await;

        let Some(writer) = writer.as_mut() else {
            return Err(ErrorKind::Closed.into());
        };

        writer.write_all(&bytes).await?;
        Ok(())
    }
}

/// A stream of method calls claimed by a subscription.
pub struct MethodCallStream {
    rx: Option<broadcast::Receiver<Message>>,
    matcher: Arc<CallMatcher>,
    inner: Arc<Inner>,
}

impl MethodCallStream {
    /// The next matching method call, or `None` once the session is closed.
    pub async fn next(&mut self) -> Option<Message> {
        let rx = self.rx.as_mut()?;

        loop {
            match rx.recv().await {
                Ok(message) => {
                    if self.matcher.matches(&message) {
                        return Some(message);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "method-call subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for MethodCallStream {
    fn drop(&mut self) {
        self.inner
            .method_call_matchers
            .lock()
            .expect("lock poisoned")
            .retain(|matcher| !Arc::ptr_eq(matcher, &self.matcher));
    }
}

/// A stream of signals matching one match rule.
pub struct SignalStream {
    rx: Option<broadcast::Receiver<Message>>,
    rule: MatchRule,
    rule_string: Option<String>,
    client: Client,
}

impl SignalStream {
    /// The rule this stream filters on.
    pub fn rule(&self) -> &MatchRule {
        &self.rule
    }

    /// The next matching signal, or `None` once the session is closed.
    pub async fn next(&mut self) -> Option<Message> {
        let rx = self.rx.as_mut()?;

        loop {
            match rx.recv().await {
                Ok(message) => {
                    if self.rule.is_match(&message) {
                        return Some(message);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "signal subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for SignalStream {
    fn drop(&mut self) {
        let Some(rule_string) = self.rule_string.take() else {
            return;
        };

        let last = {
            let mut rules = self.client.inner.signal_rules.lock().expect("lock poisoned");

            match rules.get_mut(&rule_string) {
                Some(count) => {
                    *count -= 1;

                    if *count == 0 {
                        rules.remove(&rule_string);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if !last || self.client.is_closed() {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let client = self.client.clone();

        handle.spawn(async move {
            if let Err(error) = client.remove_match(&rule_string).await {
                if !error.is_closed() && !client.is_closed() {
                    tracing::warn!(%error, rule = rule_string.as_str(), "failed to remove match");
                }
            }
        });
    }
}

/// Read frames off the socket, parse each into a message and dispatch it.
///
/// Each frame is sized from its fixed header, so a socket read never has to
/// line up with message boundaries, and the reader is re-based at the first
/// byte of every message.
async fn demux_task(mut read: OwnedReadHalf, inner: Arc<Inner>) {
    loop {
        let mut fixed = [0u8; 16];

        if read.read_exact(&mut fixed).await.is_err() {
            break;
        }

        let Some(endianness) = Endianness::from_byte(fixed[0]) else {
            tracing::warn!(marker = fixed[0], "invalid endianness marker, closing the stream");
            break;
        };

        let body_length = frame_u32(&fixed, 4, endianness);
        let fields_length = frame_u32(&fixed, 12, endianness);

        if body_length > MAX_BODY_LENGTH || fields_length > MAX_ARRAY_LENGTH {
            tracing::warn!(body_length, fields_length, "oversized message, closing the stream");
            break;
        }

        let fields_length = fields_length as usize;
        let rest =
            fields_length + crate::utils::padding_to(8, fields_length) + body_length as usize;

        let mut frame = vec![0u8; 16 + rest];
        frame[..16].copy_from_slice(&fixed);

        if read.read_exact(&mut frame[16..]).await.is_err() {
            break;
        }

        let mut buf = ByteReader::new(&frame, Endianness::Little);

        match Message::unmarshal(&mut buf) {
            Ok(message) => dispatch(&inner, message),
            Err(error) => {
                // The frame length is already known, so a message that fails
                // to decode is dropped and reading continues.
                tracing::warn!(%error, "dropping undecodable message");
            }
        }
    }

    inner.closing.store(true, Ordering::SeqCst);
    inner.reply_waiters.lock().expect("lock poisoned").clear();
    *inner.inbound.lock().expect("lock poisoned") = None;
}

fn frame_u32(bytes: &[u8], offset: usize, endianness: Endianness) -> u32 {
    let array = [
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ];

    match endianness {
        Endianness::Little => u32::from_le_bytes(array),
        Endianness::Big => u32::from_be_bytes(array),
    }
}

/// Route one inbound message.
///
/// Replies go to the waiter registered under their serial and are observed
/// exactly once; everything else goes onto the fan-out in arrival order.
fn dispatch(inner: &Inner, message: Message) {
    if matches!(
        message.header.message_type,
        MessageType::MethodReturn | MessageType::Error
    ) {
        if let Some(serial) = message.reply_serial() {
            let waiter = inner
                .reply_waiters
                .lock()
                .expect("lock poisoned")
                .remove(&serial);

            if let Some(tx) = waiter {
                let _ = tx.send(message);
            }

            // A reply without a waiter arrived late for a call that timed
            // out; it is dropped silently.
            return;
        }
    }

    let guard = inner.inbound.lock().expect("lock poisoned");

    if let Some(inbound) = guard.as_ref() {
        // Send only fails when no subscriber is attached.
        let _ = inbound.send(message);
    }
}

/// Answer method calls no subscription claims with `UnknownMethod`.
async fn responder_task(client: Client, mut rx: broadcast::Receiver<Message>) {
    loop {
        let message = match rx.recv().await {
            Ok(message) => message,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "fallback responder lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        if message.header.message_type != MessageType::MethodCall {
            continue;
        }

        if message.header.flags & Flags::NO_REPLY_EXPECTED {
            continue;
        }

        let claimed = client
            .inner
            .method_call_matchers
            .lock()
            .expect("lock poisoned")
            .iter()
            .any(|matcher| matcher.matches(&message));

        if claimed {
            continue;
        }

        if let Err(error) = client
            .reply_error(&message, UNKNOWN_METHOD, "No such method")
            .await
        {
            if !client.is_closed() {
                tracing::warn!(%error, "failed to send UnknownMethod reply");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_line(stream: &mut UnixStream) -> Vec<u8> {
        let mut line = Vec::new();

        loop {
            let mut byte = [0u8; 1];
            stream.read_exact(&mut byte).await.unwrap();

            match byte[0] {
                b'\n' => return line,
                b'\r' => {}
                b => line.push(b),
            }
        }
    }

    async fn accept_handshake(stream: &mut UnixStream) {
        let mut nul = [0u8; 1];
        stream.read_exact(&mut nul).await.unwrap();
        assert_eq!(nul[0], 0);

        let line = read_line(stream).await;
        assert!(line.starts_with(b"AUTH EXTERNAL "));

        stream
            .write_all(b"OK 1deadbeef7deadbeef7deadbeef7dead\r\n")
            .await
            .unwrap();

        let line = read_line(stream).await;
        assert_eq!(line, b"BEGIN");
    }

    async fn read_frame(stream: &mut UnixStream) -> Message {
        let mut fixed = [0u8; 16];
        stream.read_exact(&mut fixed).await.unwrap();

        let endianness = Endianness::from_byte(fixed[0]).unwrap();
        let body_length = frame_u32(&fixed, 4, endianness) as usize;
        let fields_length = frame_u32(&fixed, 12, endianness) as usize;
        let rest = fields_length + crate::utils::padding_to(8, fields_length) + body_length;

        let mut frame = vec![0u8; 16 + rest];
        frame[..16].copy_from_slice(&fixed);
        stream.read_exact(&mut frame[16..]).await.unwrap();

        let mut buf = ByteReader::new(&frame, Endianness::Little);
        Message::unmarshal(&mut buf).unwrap()
    }

    async fn send_frame(stream: &mut UnixStream, message: &Message) {
        stream.write_all(&message.marshal().unwrap()).await.unwrap();
    }

    async fn serve_hello(stream: &mut UnixStream) {
        let hello = read_frame(stream).await;
        assert_eq!(hello.member(), Some("Hello"));
        assert_eq!(hello.destination(), Some("org.freedesktop.DBus"));

        let reply = hello
            .method_return()
            .with_serial(1)
            .with_arg(Value::Str(":1.99".into()));

        send_frame(stream, &reply).await;
    }

    #[test]
    fn pattern_cases() {
        assert!(Pattern::exact("Frobnicate").matches("Frobnicate"));
        assert!(!Pattern::exact("Frobnicate").matches("Frobnicate2"));
        assert!(Pattern::prefix("/org/example").matches("/org/example/Object"));
        assert!(!Pattern::prefix("/org/example").matches("/org/other"));
        assert!(Pattern::regex("^Do.+$").unwrap().matches("DoThing"));
        assert!(!Pattern::regex("^Do.+$").unwrap().matches("Do"));
    }

    #[tokio::test]
    async fn connect_and_hello() {
        let (local, mut remote) = UnixStream::pair().unwrap();

        let server = tokio::spawn(async move {
            accept_handshake(&mut remote).await;
            serve_hello(&mut remote).await;
            remote
        });

        let client = Client::from_stream(local).await.unwrap();

        assert_eq!(client.unique_name(), Some(":1.99"));
        assert_eq!(client.guid(), "1deadbeef7deadbeef7deadbeef7dead");

        // Hello used serial 1; allocation continues sequentially.
        assert_eq!(client.next_serial(), 2);
        assert_eq!(client.next_serial(), 3);

        let _remote = server.await.unwrap();
        client.close().await;
    }

    #[tokio::test]
    async fn call_and_reply() {
        let (local, mut remote) = UnixStream::pair().unwrap();

        let server = tokio::spawn(async move {
            accept_handshake(&mut remote).await;
            serve_hello(&mut remote).await;

            let call = read_frame(&mut remote).await;
            assert_eq!(call.member(), Some("Echo"));
            assert_eq!(call.body, vec![Value::Str("ping".into())]);

            let reply = call
                .method_return()
                .with_serial(2)
                .with_arg(Value::Str("pong".into()));
            send_frame(&mut remote, &reply).await;

            let call = read_frame(&mut remote).await;
            assert_eq!(call.member(), Some("Fail"));

            let reply = call
                .error_reply("org.example.Error.Boom")
                .with_serial(3)
                .with_arg(Value::Str("kaboom".into()));
            send_frame(&mut remote, &reply).await;

            remote
        });

        let client = Client::from_stream(local).await.unwrap();

        let m = Message::method_call("/org/example/Object", "Echo")
            .with_destination("org.example.Service")
            .with_arg(Value::Str("ping".into()));

        let reply = client.call_method(m).await.unwrap();
        assert_eq!(reply.body, vec![Value::Str("pong".into())]);

        let m = Message::method_call("/org/example/Object", "Fail")
            .with_destination("org.example.Service");

        let error = client.call_method(m).await.unwrap_err();
        assert_eq!(error.error_name(), Some("org.example.Error.Boom"));
        assert_eq!(error.to_string(), "org.example.Error.Boom: kaboom");

        let _remote = server.await.unwrap();
        client.close().await;
    }

    #[tokio::test]
    async fn call_timeout_leaves_no_waiter() {
        let (local, mut remote) = UnixStream::pair().unwrap();

        let server = tokio::spawn(async move {
            accept_handshake(&mut remote).await;
            serve_hello(&mut remote).await;

            let call = read_frame(&mut remote).await;
            assert_eq!(call.member(), Some("Never"));

            // No reply; wait for the client to go away.
            let mut byte = [0u8; 1];
            let _ = remote.read(&mut byte).await;
        });

        let client = Client::from_stream(local).await.unwrap();

        let m = Message::method_call("/org/example/Object", "Never")
            .with_destination("org.example.Service");

        let error = client
            .call_method_timeout(m, Duration::from_millis(100))
            .await
            .unwrap_err();

        assert!(error.is_timeout());
        assert_eq!(error.to_string(), "Call timed out");
        assert!(client
            .inner
            .reply_waiters
            .lock()
            .unwrap()
            .is_empty());

        client.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_method_gets_error_reply() {
        let (local, mut remote) = UnixStream::pair().unwrap();

        let server = tokio::spawn(async move {
            accept_handshake(&mut remote).await;
            serve_hello(&mut remote).await;

            let call = Message::method_call("/org/example/Object", "Nope")
                .with_interface("org.example.Iface")
                .with_sender(":1.50")
                .with_serial(5);
            send_frame(&mut remote, &call).await;

            let reply = read_frame(&mut remote).await;
            assert_eq!(reply.header.message_type, MessageType::Error);
            assert_eq!(reply.error_name(), Some(UNKNOWN_METHOD));
            assert_eq!(reply.reply_serial(), Some(5));
            assert_eq!(reply.destination(), Some(":1.50"));

            remote
        });

        let client = Client::from_stream(local).await.unwrap();
        let _remote = server.await.unwrap();
        client.close().await;
    }

    #[tokio::test]
    async fn method_call_stream_claims_calls() {
        let (local, mut remote) = UnixStream::pair().unwrap();

        let server = tokio::spawn(async move {
            accept_handshake(&mut remote).await;
            serve_hello(&mut remote).await;

            // The client cues us once its subscription is registered.
            let ready = read_frame(&mut remote).await;
            assert_eq!(ready.member(), Some("Ready"));

            let call = Message::method_call("/org/example/Object", "DoThing")
                .with_interface("org.example.Iface")
                .with_sender(":1.9")
                .with_serial(5);
            send_frame(&mut remote, &call).await;

            // The subscriber, not the fallback responder, answers.
            let reply = read_frame(&mut remote).await;
            assert_eq!(reply.header.message_type, MessageType::MethodReturn);
            assert_eq!(reply.reply_serial(), Some(5));
            assert_eq!(reply.body, vec![Value::Str("done".into())]);

            remote
        });

        let client = Client::from_stream(local).await.unwrap();

        let mut calls = client.method_call_stream(
            None,
            Some(Pattern::exact("org.example.Iface")),
            Some(Pattern::regex("^Do").unwrap()),
        );

        client
            .send_message(Message::signal("/", "org.example.Test", "Ready"))
            .await
            .unwrap();

        let call = calls.next().await.unwrap();
        assert_eq!(call.member(), Some("DoThing"));

        client
            .reply(&call, vec![Value::Str("done".into())])
            .await
            .unwrap();

        let _remote = server.await.unwrap();
        client.close().await;
    }

    #[tokio::test]
    async fn signal_stream_registers_match_rules() {
        let (local, mut remote) = UnixStream::pair().unwrap();

        const RULE: &str = "type='signal',interface='org.example.Iface',member='Changed'";

        let server = tokio::spawn(async move {
            accept_handshake(&mut remote).await;
            serve_hello(&mut remote).await;

            // First listener registers the rule.
            let add = read_frame(&mut remote).await;
            assert_eq!(add.member(), Some("AddMatch"));
            assert_eq!(add.body, vec![Value::Str(RULE.into())]);
            send_frame(&mut remote, &add.method_return().with_serial(2)).await;

            let signal = Message::signal("/obj", "org.example.Iface", "Changed")
                .with_sender(":1.7")
                .with_serial(9)
                .with_arg(Value::Str("hey".into()));
            send_frame(&mut remote, &signal).await;

            // Last listener detaching deregisters it.
            let remove = read_frame(&mut remote).await;
            assert_eq!(remove.member(), Some("RemoveMatch"));
            assert_eq!(remove.body, vec![Value::Str(RULE.into())]);
            send_frame(&mut remote, &remove.method_return().with_serial(3)).await;

            remote
        });

        let client = Client::from_stream(local).await.unwrap();

        let mut signals = client
            .signal_stream(None, Some("org.example.Iface"), Some("Changed"), None)
            .await
            .unwrap();

        let signal = signals.next().await.unwrap();
        assert_eq!(signal.member(), Some("Changed"));
        assert_eq!(signal.body, vec![Value::Str("hey".into())]);

        drop(signals);

        let _remote = server.await.unwrap();
        client.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_cancels_waiters() {
        let (local, mut remote) = UnixStream::pair().unwrap();

        let server = tokio::spawn(async move {
            accept_handshake(&mut remote).await;
            serve_hello(&mut remote).await;

            let call = read_frame(&mut remote).await;
            assert_eq!(call.member(), Some("Never"));

            let mut byte = [0u8; 1];
            let _ = remote.read(&mut byte).await;
        });

        let client = Client::from_stream(local).await.unwrap();

        let pending = {
            let client = client.clone();

            tokio::spawn(async move {
                let m = Message::method_call("/org/example/Object", "Never")
                    .with_destination("org.example.Service");
                client.call_method_timeout(m, Duration::from_secs(30)).await
            })
        };

        // Let the call register its waiter and hit the socket.
        tokio::time::sleep(Duration::from_millis(50)).await;

        client.close().await;
        client.close().await;

        let error = pending.await.unwrap().unwrap_err();
        assert!(error.is_closed());
        assert_eq!(error.to_string(), "Connection closed");

        let error = client
            .send_message(Message::signal("/", "org.example.Test", "Late"))
            .await
            .unwrap_err();
        assert!(error.is_closed());

        server.await.unwrap();
    }
}
