//! Per-connection state machine.
//!
//! A connection starts unauthenticated, becomes authenticated on a
//! successful sign-in, and may additionally become a worker by sending
//! READY. There is exactly one reader per connection: before READY every
//! line is a tagged frame, after READY every line is a raw answer for the
//! calculation currently in flight. The same loop drains the session's
//! request slot while it is an idle worker.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::codec::Decoder;
use tracing::{Instrument, Span, debug, info, info_span, warn};

use crate::broker::{Delivery, Dispatch, WorkerRole};
use crate::context::AppContext;
use crate::credentials;
use crate::error::{BackendFailure, FrameError, ProtocolError, RoutingError, SessionError};
use crate::protocol::{
    CalcRequest, Credentials, Envelope, Frame, FrameCodec, FrameSink, FunctionDecl, Outbound, Tag,
};
use crate::registry::{SessionHandle, SessionId, SessionRegistry};
use crate::relay;

const READ_BUFFER_CAPACITY: usize = 8 * 1024;

/// Serve one accepted connection until it closes, then tear it down.
pub async fn serve<S>(stream: S, peer: SocketAddr, ctx: AppContext)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let span = info_span!("conn", peer = %peer, login = tracing::field::Empty);
    async move {
        info!("Connected");
        let mut connection = Connection::new(stream, peer, ctx);
        let result = connection.run().await;
        connection.teardown().await;
        if let Err(e) = result {
            debug!(error = %e, "Connection ended with error");
        }
    }
    .instrument(span)
    .await
}

enum Event {
    Line(Bytes),
    Dispatch(Dispatch),
    Closed,
}

struct Connection<S> {
    ctx: AppContext,
    id: SessionId,
    peer: SocketAddr,
    reader: ReadHalf<S>,
    buffer: BytesMut,
    codec: FrameCodec,
    /// When the bytes currently buffered started arriving.
    partial_since: Option<Instant>,
    outbound: FrameSink,
    requests_tx: mpsc::Sender<Dispatch>,
    requests: mpsc::Receiver<Dispatch>,
    login: Option<String>,
    worker: Option<WorkerRole>,
    closed: bool,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn new(stream: S, peer: SocketAddr, ctx: AppContext) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let outbound = FrameSink::new(writer, ctx.codec(), ctx.config.write_timeout());
        let (requests_tx, requests) = mpsc::channel(1);

        Self {
            id: SessionId::next(),
            peer,
            reader,
            buffer: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            codec: ctx.codec(),
            partial_since: None,
            outbound,
            requests_tx,
            requests,
            login: None,
            worker: None,
            closed: false,
            ctx,
        }
    }

    async fn run(&mut self) -> Result<(), SessionError> {
        loop {
            let event = match self.next_event().await {
                Ok(event) => event,
                Err(e) => {
                    self.report(&e).await;
                    return Err(e);
                }
            };

            match event {
                Event::Closed => {
                    debug!("Peer closed connection");
                    return Ok(());
                }
                Event::Dispatch(dispatch) => self.forward(dispatch).await?,
                Event::Line(line) if self.worker.is_some() => self.deliver_answer(line),
                Event::Line(line) => {
                    if let Err(e) = self.handle_line(line).await {
                        self.report(&e).await;
                        if e.is_fatal() {
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Next buffered line, inbound bytes, or (as an idle worker) request.
    async fn next_event(&mut self) -> Result<Event, SessionError> {
        let frame_timeout = self.ctx.config.frame_timeout();

        loop {
            if let Some(line) = self.codec.decode(&mut self.buffer)? {
                self.partial_since = None;
                return Ok(Event::Line(line));
            }

            if self.buffer.is_empty() {
                self.partial_since = None;
            } else if self.partial_since.is_none() {
                self.partial_since = Some(Instant::now());
            }
            let deadline = self.partial_since.map(|since| since + frame_timeout);
            let wants_dispatch = self.worker.as_ref().is_some_and(WorkerRole::is_idle);

            tokio::select! {
                read = self.reader.read_buf(&mut self.buffer) => {
                    if read.map_err(FrameError::from)? == 0 {
                        return match self.codec.decode_eof(&mut self.buffer)? {
                            Some(line) => Ok(Event::Line(line)),
                            None => Ok(Event::Closed),
                        };
                    }
                }
                Some(dispatch) = self.requests.recv(), if wants_dispatch => {
                    return Ok(Event::Dispatch(dispatch));
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    return Err(FrameError::Timeout { secs: frame_timeout.as_secs() }.into());
                }
            }
        }
    }

    async fn handle_line(&mut self, line: Bytes) -> Result<(), SessionError> {
        let frame = Frame::parse(line)?;
        match frame.tag {
            Tag::Register | Tag::SignIn => debug!(tag = %frame.tag, "Frame received"),
            _ => debug!(tag = %frame.tag, payload = %frame.payload_text(), "Frame received"),
        }

        match frame.tag {
            Tag::Register => self.sign_up(&frame).await,
            Tag::SignIn => self.sign_in(&frame).await,
            Tag::Message => self.message(&frame).await,
            Tag::Stream => self.stream(&frame).await,
            Tag::Post => self.post(&frame).await,
            Tag::Ready => self.ready(),
            Tag::Calc => self.calc(&frame).await,
            Tag::Ok | Tag::Error => Err(ProtocolError::UnknownTag(frame.tag.as_byte()).into()),
        }
    }

    async fn sign_up(&mut self, frame: &Frame) -> Result<(), SessionError> {
        let request: Credentials = frame.json()?;
        if !credentials::is_storable(&request.login, &request.password) {
            return Err(ProtocolError::InvalidCredentials.into());
        }

        let registered = self
            .ctx
            .credentials
            .check_or_register(&request.login, &request.password, true)
            .await
            .map_err(ProtocolError::from)?;
        if !registered {
            return Err(ProtocolError::LoginTaken.into());
        }

        info!(login = %request.login, "Signed up");
        self.reply(Frame::ok("Successfully signed up")).await
    }

    async fn sign_in(&mut self, frame: &Frame) -> Result<(), SessionError> {
        if self.login.is_some() {
            return Err(ProtocolError::AlreadyAuthenticated.into());
        }

        let request: Credentials = frame.json()?;
        let valid = self
            .ctx
            .credentials
            .check_or_register(&request.login, &request.password, false)
            .await
            .map_err(ProtocolError::from)?;
        if !valid {
            return Err(ProtocolError::WrongCredentials.into());
        }

        let handle = Arc::new(SessionHandle {
            id: self.id,
            login: request.login.clone(),
            peer: self.peer,
            outbound: self.outbound.clone(),
            requests: self.requests_tx.clone(),
        });
        if let Some(previous) = self.ctx.registry.register(handle).await {
            info!(superseded = %previous.id, previous_peer = %previous.peer, "Login replaced an older session");
        }

        Span::current().record("login", request.login.as_str());
        self.login = Some(request.login);
        info!("Logged in");
        self.reply(Frame::ok("Successfully logged in")).await
    }

    async fn message(&mut self, frame: &Frame) -> Result<(), SessionError> {
        let sender = self.require_login(frame.tag)?;
        let envelope: Envelope = frame.json()?;

        relay::direct(&self.ctx.registry, &sender, envelope).await?;
        self.reply(Frame::ok("Message was sent")).await
    }

    async fn stream(&mut self, frame: &Frame) -> Result<(), SessionError> {
        let sender = self.require_login(frame.tag)?;

        relay::broadcast(&self.ctx.registry, &sender, frame.payload.clone()).await;
        self.reply(Frame::ok("Message was streamed")).await
    }

    async fn post(&mut self, frame: &Frame) -> Result<(), SessionError> {
        let owner = self.require_login(frame.tag)?;
        let decl: FunctionDecl = frame.json()?;

        if !self.ctx.registry.bind_function(&decl.name, &owner).await {
            return Err(RoutingError::FunctionTaken(decl.name).into());
        }

        info!(function = %decl.name, "Function registered");
        self.reply(Frame::ok("Function was registered")).await
    }

    fn ready(&mut self) -> Result<(), SessionError> {
        self.require_login(Tag::Ready)?;

        if self.worker.is_none() {
            self.worker = Some(WorkerRole::default());
            info!("Session is now a worker");
        }
        Ok(())
    }

    async fn calc(&mut self, frame: &Frame) -> Result<(), SessionError> {
        let requester = self.require_login(frame.tag)?;
        let request: CalcRequest = frame.json()?;

        let answer = self.ctx.broker.calc(&requester, &request).await?;
        self.reply(Outbound::Raw(answer)).await
    }

    /// Forward a dispatched calculation to this worker's client.
    async fn forward(&mut self, dispatch: Dispatch) -> Result<(), SessionError> {
        let Some(role) = self.worker.as_mut() else {
            return Ok(());
        };

        let Some(payload) = role.accept(dispatch) else {
            debug!("Skipping calculation abandoned by its requester");
            return Ok(());
        };

        if let Err(e) = self.outbound.send(Frame::new(Tag::Calc, payload)).await {
            role.fail(BackendFailure::WorkerGone);
            return Err(e.into());
        }
        Ok(())
    }

    /// Hand a raw line from this worker to the waiting requester.
    fn deliver_answer(&mut self, line: Bytes) {
        let Some(role) = self.worker.as_mut() else {
            return;
        };

        match role.answer(line) {
            Delivery::Delivered => debug!("Answer delivered"),
            Delivery::Abandoned => warn!("Requester stopped waiting, answer dropped"),
            Delivery::Unsolicited => warn!("Dropping answer with no calculation in flight"),
        }
    }

    fn require_login(&self, tag: Tag) -> Result<String, ProtocolError> {
        self.login
            .clone()
            .ok_or(ProtocolError::NotAuthenticated { tag })
    }

    async fn reply(&self, item: impl Into<Outbound>) -> Result<(), SessionError> {
        self.outbound.send(item).await.map_err(SessionError::from)
    }

    /// Best-effort E frame for `error`.
    async fn report(&self, error: &SessionError) {
        if error.is_fatal() {
            warn!(error = %error, "Closing connection");
        } else {
            info!(error = %error, "Request rejected");
        }

        if let Err(e) = self.outbound.send(Frame::error(&error.to_string())).await {
            debug!(error = %e, "Could not deliver error frame");
        }
    }

    async fn teardown(&mut self) {
        if let Some(teardown) = self.take_teardown() {
            teardown.run().await;
        }
    }
}

impl<S> Connection<S> {
    /// Fail any in-flight calculation and capture what is left to release.
    /// Yields `Some` exactly once per connection.
    fn take_teardown(&mut self) -> Option<Teardown> {
        if self.closed {
            return None;
        }
        self.closed = true;

        if let Some(role) = self.worker.as_mut() {
            if role.fail(BackendFailure::WorkerGone) {
                warn!("Worker left with a calculation in flight");
            }
        }

        Some(Teardown {
            registry: self.ctx.registry.clone(),
            login: self.login.clone(),
            id: self.id,
            outbound: self.outbound.clone(),
        })
    }
}

impl<S> Drop for Connection<S> {
    fn drop(&mut self) {
        // Dropped before `teardown` ran: the task was aborted or panicked.
        if let Some(teardown) = self.take_teardown() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(teardown.run().instrument(Span::current()));
            }
        }
    }
}

struct Teardown {
    registry: SessionRegistry,
    login: Option<String>,
    id: SessionId,
    outbound: FrameSink,
}

impl Teardown {
    async fn run(self) {
        if let Some(login) = self.login {
            if let Some(released) = self.registry.remove_and_release(&login, self.id).await {
                if !released.is_empty() {
                    info!(functions = ?released, "Released functions");
                }
            }
        }
        self.outbound.close().await;
        info!("Disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    struct Peer {
        reader: BufReader<tokio::io::ReadHalf<DuplexStream>>,
        writer: tokio::io::WriteHalf<DuplexStream>,
    }

    impl Peer {
        async fn send(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        async fn line(&mut self) -> String {
            let mut line = String::new();
            self.reader.read_line(&mut line).await.unwrap();
            line.trim_end_matches('\n').to_string()
        }
    }

    fn context(dir: &TempDir, frame_timeout_secs: u64) -> AppContext {
        AppContext::new(AppConfig {
            credentials_path: dir.path().join("users.txt"),
            frame_timeout_secs,
            ..AppConfig::default()
        })
    }

    fn connect(ctx: &AppContext) -> (Peer, tokio::task::JoinHandle<()>) {
        let (client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(serve(
            server,
            SocketAddr::from(([127, 0, 0, 1], 0)),
            ctx.clone(),
        ));
        let (reader, writer) = tokio::io::split(client);
        (
            Peer {
                reader: BufReader::new(reader),
                writer,
            },
            task,
        )
    }

    #[tokio::test]
    async fn unauthenticated_frames_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir, 30);
        let (mut peer, task) = connect(&ctx);

        peer.send(r#"P{"func":"double"}"#).await;
        assert_eq!(peer.line().await, "Eyou should login first");
        task.await.unwrap();
        assert_eq!(peer.line().await, "");
    }

    #[tokio::test]
    async fn unknown_tag_closes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir, 30);
        let (mut peer, task) = connect(&ctx);

        peer.send("Xwhatever").await;
        assert_eq!(peer.line().await, "Ewrong message type");
        task.await.unwrap();
    }

    #[tokio::test]
    async fn sign_up_sign_in_and_post() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir, 30);
        let (mut peer, _task) = connect(&ctx);

        peer.send(r#"U{"login":"bob","pass":"pw2"}"#).await;
        assert_eq!(peer.line().await, "OSuccessfully signed up");
        peer.send(r#"I{"login":"bob","pass":"pw2"}"#).await;
        assert_eq!(peer.line().await, "OSuccessfully logged in");
        peer.send(r#"P{"func":"double"}"#).await;
        assert_eq!(peer.line().await, "OFunction was registered");
        peer.send(r#"P{"func":"double"}"#).await;
        assert_eq!(peer.line().await, "Efunction with this name already exists");

        // Still open after the rejected post.
        peer.send(r#"C{"func":"missing"}"#).await;
        assert_eq!(peer.line().await, "EThis function wasn't registered on server!");
        assert_eq!(ctx.registry.resolve_function("double").await.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn second_sign_in_on_one_connection_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir, 30);
        ctx.credentials.check_or_register("bob", "pw2", true).await.unwrap();
        let (mut peer, task) = connect(&ctx);

        peer.send(r#"I{"login":"bob","pass":"pw2"}"#).await;
        assert_eq!(peer.line().await, "OSuccessfully logged in");
        peer.send(r#"I{"login":"bob","pass":"pw2"}"#).await;
        assert_eq!(peer.line().await, "Ealready logged in");
        task.await.unwrap();
        assert!(ctx.registry.lookup("bob").await.is_none());
    }

    #[tokio::test]
    async fn stalled_partial_frame_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir, 1);
        let (mut peer, task) = connect(&ctx);

        peer.writer.write_all(br#"I{"login":"#).await.unwrap();
        let line = tokio::time::timeout(std::time::Duration::from_secs(5), peer.line())
            .await
            .unwrap();
        assert_eq!(line, "Eframe terminator not received within 1s");
        task.await.unwrap();
    }

    #[tokio::test]
    async fn teardown_releases_functions() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir, 30);
        ctx.credentials.check_or_register("bob", "pw2", true).await.unwrap();
        let (mut peer, task) = connect(&ctx);

        peer.send(r#"I{"login":"bob","pass":"pw2"}"#).await;
        peer.line().await;
        peer.send(r#"P{"func":"double"}"#).await;
        peer.line().await;
        peer.send("R").await;

        drop(peer);
        task.await.unwrap();

        assert!(ctx.registry.lookup("bob").await.is_none());
        assert!(ctx.registry.resolve_function("double").await.is_none());
    }
}
