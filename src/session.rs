use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::buffer::SharedBuffer;
use crate::command::Command;
use crate::config::Config;
use crate::connection;
use crate::error::Error;
use crate::metrics::Metrics;
use crate::parser::Parser;
use crate::pipeline::Waiter;
use crate::upstream::Upstream;

/// Per-client slot that replies are routed to.
///
/// Slots outlive the clients they serve: they are pooled and handed to the next client with a new
/// identity. Pending requests record the identity they were sent with, so a reply that arrives
/// after its client left no longer matches and is dropped instead of reaching the slot's new
/// occupant.
#[derive(Default)]
pub struct Session {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    // 0 while the slot sits in the pool.
    id: u64,
    replies: Option<mpsc::UnboundedSender<SharedBuffer>>,
}

impl Session {
    /// Writes `data` to the client directly, bypassing the backend.
    pub fn reply(&self, data: SharedBuffer) -> bool {
        send(&self.lock(), data)
    }

    fn attach(&self, id: u64, replies: mpsc::UnboundedSender<SharedBuffer>) {
        let mut state = self.lock();
        state.id = id;
        state.replies = Some(replies);
    }

    fn detach(&self) {
        let mut state = self.lock();
        state.id = 0;
        state.replies = None;
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Waiter for Session {
    fn identity(&self) -> u64 {
        self.lock().id
    }

    fn on_reply(&self, reply: SharedBuffer) {
        send(&self.lock(), reply);
    }

    // The identity check and the hand-off happen under one lock, so a release in between cannot
    // let the reply through to the next client.
    fn deliver(&self, identity: u64, reply: SharedBuffer) -> bool {
        let state = self.lock();
        if state.id != identity {
            return false;
        }

        send(&state, reply)
    }
}

fn send(state: &State, data: SharedBuffer) -> bool {
    match &state.replies {
        Some(replies) => replies.send(data).is_ok(),
        None => false,
    }
}

/// Recycles [`Session`] slots and hands out their identities.
pub struct SessionPool {
    next_id: AtomicU64,
    idle: Mutex<Vec<Arc<Session>>>,
    max_idle: usize,
    metrics: Arc<Metrics>,
}

impl SessionPool {
    pub fn new(max_idle: usize, metrics: Arc<Metrics>) -> SessionPool {
        SessionPool {
            next_id: AtomicU64::new(1),
            idle: Mutex::new(Vec::new()),
            max_idle,
            metrics,
        }
    }

    /// Takes an idle slot, or creates one, and gives it a fresh identity. Replies for the slot are
    /// sent to `replies`.
    pub fn acquire(&self, replies: mpsc::UnboundedSender<SharedBuffer>) -> Arc<Session> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = self.lock_idle().pop().unwrap_or_default();

        session.attach(id, replies);
        self.metrics.session_opened();

        session
    }

    /// Detaches the slot from its client and keeps it for reuse while the pool has room.
    pub fn release(&self, session: Arc<Session>) {
        session.detach();
        self.metrics.session_closed();

        let mut idle = self.lock_idle();
        if idle.len() < self.max_idle {
            idle.push(session);
        }
    }

    pub fn idle(&self) -> usize {
        self.lock_idle().len()
    }

    fn lock_idle(&self) -> MutexGuard<'_, Vec<Arc<Session>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Proxies one client connection until it closes or `shutdown` fires.
///
/// Requests are parsed off `reader` and pushed to `upstream`; replies come back through the
/// session's channel and are written to `writer` by a separate task. A malformed request is
/// answered with a protocol error and ends the connection. The session slot goes back to `pool`
/// on every way out.
pub async fn serve_client<R, W>(
    mut reader: R,
    writer: W,
    pool: &SessionPool,
    upstream: &Upstream,
    config: &Config,
    shutdown: &CancellationToken,
) -> Result<(), crate::Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let session = pool.acquire(tx);
    tracing::Span::current().record("session_id", session.identity());

    let forwarder = tokio::spawn(forward_replies(rx, writer));

    let result = tokio::select! {
        result = read_requests(&mut reader, &session, upstream, config) => result,
        _ = shutdown.cancelled() => {
            debug!("Closing client connection on shutdown");
            forwarder.abort();
            Ok(())
        }
    };

    // Dropping the slot's sender lets the forwarder finish once it wrote what is queued.
    pool.release(session);
    match forwarder.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Failed to write to client: {}", e),
        Err(e) if e.is_cancelled() => {}
        Err(e) => error!("Reply forwarder panicked: {}", e),
    }

    result
}

async fn read_requests<R>(
    reader: &mut R,
    session: &Arc<Session>,
    upstream: &Upstream,
    config: &Config,
) -> Result<(), crate::Error>
where
    R: AsyncRead + Unpin,
{
    let mut parser = Parser::with_limits(config.limits());
    let mut cmd = Command::new();

    loop {
        loop {
            match parser.parse_request(&mut cmd) {
                Ok(()) => {}
                Err(e) if e.is_retryable() => break,
                Err(e) => {
                    warn!("Invalid request from client: {}", e);
                    session.reply(error_reply(e));
                    return Err(e.into());
                }
            }

            if !cmd.is_empty() {
                trace!(command = %cmd, "Forwarding request");
                forward(upstream, &cmd, session).await?;
            }

            cmd.reset();
            parser.reset();
        }

        let min_free = connection::read_size(parser.input(), config);
        if connection::fill(reader, parser.input_mut(), min_free).await? == 0 {
            debug!("Client closed the connection");
            return Ok(());
        }
    }
}

/// Pushes `cmd` upstream, waiting for the link to accept it.
async fn forward(upstream: &Upstream, cmd: &Command, session: &Arc<Session>) -> Result<(), Error> {
    loop {
        let ready = upstream.ready();

        match upstream.push_request(cmd, session.clone()) {
            Err(e) if e.is_retryable() => ready.await,
            result => return result,
        }
    }
}

async fn forward_replies<W>(
    mut replies: mpsc::UnboundedReceiver<SharedBuffer>,
    mut writer: W,
) -> Result<(), crate::Error>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = SharedBuffer::new();

    while let Some(reply) = replies.recv().await {
        batch.append(&reply, reply.len())?;
        while let Ok(reply) = replies.try_recv() {
            batch.append(&reply, reply.len())?;
        }

        connection::drain(&mut writer, &mut batch).await?;
        batch.clear();
    }

    Ok(())
}

fn error_reply(err: Error) -> SharedBuffer {
    let reason = match err {
        Error::Protocol(reason) => reason.to_string(),
        Error::Unknown(byte) => format!("expected '$', got '{}'", byte as char),
        other => other.to_string(),
    };

    SharedBuffer::from(format!("-ERR Protocol error: {}\r\n", reason))
}
