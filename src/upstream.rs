use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::buffer::SharedBuffer;
use crate::command::Command;
use crate::config::Config;
use crate::connection;
use crate::error::Error;
use crate::metrics::Metrics;
use crate::parser::Parser;
use crate::pipeline::{Pipeline, Waiter};

// Sessions never carry this identity, their counter would have to wrap first.
const AUTH_IDENTITY: u64 = u64::MAX;

/// The single backend connection every client session is multiplexed over.
///
/// Requests are serialized into one outbound buffer in the order they are pushed and the pipeline
/// remembers who asked. Replies are framed by a response parser and handed to the oldest pending
/// waiter.
pub struct Upstream {
    link: Mutex<Link>,
    // Wakes the writer when the outbound buffer gains bytes.
    writable: Notify,
    // Wakes sessions waiting for a pipeline slot or for the link to come up.
    acceptable: Notify,
    config: Config,
    metrics: Arc<Metrics>,
}

struct Link {
    pipeline: Pipeline,
    outbound: SharedBuffer,
    connected: bool,
    authenticated: bool,
}

impl Link {
    fn is_acceptable(&self) -> bool {
        self.connected && self.authenticated
    }
}

impl Upstream {
    pub fn new(config: Config, metrics: Arc<Metrics>) -> Upstream {
        Upstream {
            link: Mutex::new(Link {
                pipeline: Pipeline::with_capacity(config.pipeline_capacity),
                outbound: SharedBuffer::new(),
                connected: false,
                authenticated: false,
            }),
            writable: Notify::new(),
            acceptable: Notify::new(),
            config,
            metrics,
        }
    }

    /// Whether requests are accepted right now: the link is up and, if a password is configured,
    /// authenticated.
    pub fn is_acceptable(&self) -> bool {
        self.lock().is_acceptable()
    }

    pub fn pending(&self) -> usize {
        self.lock().pipeline.len()
    }

    /// Queues `cmd` for the backend on behalf of `waiter`.
    ///
    /// Returns [`Error::TryAgain`] while the link is down or unauthenticated and while the
    /// pipeline is full. Callers create a [`Upstream::ready`] future before pushing and await it
    /// before retrying.
    pub fn push_request(&self, cmd: &Command, waiter: Arc<dyn Waiter>) -> Result<(), Error> {
        let mut link = self.lock();
        if !link.is_acceptable() {
            return Err(Error::TryAgain);
        }

        let Link {
            pipeline, outbound, ..
        } = &mut *link;

        match pipeline.push(cmd, waiter, outbound) {
            Ok(()) => {}
            Err(err) if err.is_retryable() => {
                self.metrics.backpressure_wait();
                return Err(Error::TryAgain);
            }
            Err(err) => return Err(err),
        }
        drop(link);

        self.metrics.request_forwarded();
        self.writable.notify_one();

        Ok(())
    }

    /// Resolves the next time the link may accept a request it refused before: a reply freed a
    /// pipeline slot, or the link came up.
    pub fn ready(&self) -> Notified<'_> {
        self.acceptable.notified()
    }

    /// Keeps a backend connection up until `shutdown` fires.
    ///
    /// A lost connection is retried after the configured delay. Gives up with an error after
    /// `max_reconnects` consecutive failed attempts, unless that is zero.
    #[instrument(name = "upstream", skip_all)]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), crate::Error> {
        let address = self.config.upstream_address();
        let mut failures: u32 = 0;

        loop {
            let connected = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                connected = TcpStream::connect(&address) => connected,
            };

            match connected {
                Ok(stream) => {
                    failures = 0;
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY: {}", e);
                    }
                    info!("Connected to upstream {}", address);

                    let (reader, writer) = stream.into_split();
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            self.on_closed();
                            return Ok(());
                        }
                        result = self.serve(reader, writer) => {
                            if let Err(e) = result {
                                error!("Upstream connection failed: {}", e);
                            }
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!(failures, "Failed to connect to upstream: {}", e);

                    if self.config.max_reconnects > 0 && failures >= self.config.max_reconnects {
                        return Err(format!(
                            "giving up on upstream {} after {} failed attempts",
                            address, failures
                        )
                        .into());
                    }
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.reconnect_delay()) => {}
            }
        }
    }

    /// Drives one established backend connection until it closes or fails.
    pub async fn serve<R, W>(self: &Arc<Self>, reader: R, writer: W) -> Result<(), crate::Error>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.on_connected()?;

        let result = tokio::select! {
            result = self.read_loop(reader) => result,
            result = self.write_loop(writer) => result,
        };

        self.on_closed();
        result
    }

    async fn read_loop<R>(&self, mut reader: R) -> Result<(), crate::Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut parser = Parser::with_limits(self.config.limits());
        let mut reply = SharedBuffer::new();

        loop {
            let min_free = connection::read_size(parser.input(), &self.config);

            if connection::fill(&mut reader, parser.input_mut(), min_free).await? == 0 {
                info!("Upstream closed the connection");
                return Ok(());
            }

            self.on_server_read(&mut parser, &mut reply)?;
        }
    }

    async fn write_loop<W>(&self, mut writer: W) -> Result<(), crate::Error>
    where
        W: AsyncWrite + Unpin,
    {
        // Swapped with the shared outbound buffer so pushes never wait on a socket write.
        let mut outbound = SharedBuffer::new();

        loop {
            outbound.clear();
            std::mem::swap(&mut self.lock().outbound, &mut outbound);

            if outbound.is_empty() {
                self.writable.notified().await;
                continue;
            }

            let sent = connection::drain(&mut writer, &mut outbound).await?;
            debug!(sent, "Flushed requests to upstream");
        }
    }

    /// Frames and dispatches every complete reply buffered so far.
    fn on_server_read(&self, parser: &mut Parser, reply: &mut SharedBuffer) -> Result<(), Error> {
        loop {
            match parser.parse_response(reply) {
                Ok(()) => {}
                Err(e) if e.is_retryable() => return Ok(()),
                Err(e) => {
                    error!("Failed to parse upstream reply: {}", e);
                    return Err(e);
                }
            }

            let popped = self.lock().pipeline.pop();
            let pending = match popped {
                Ok(pending) => pending,
                Err(e) => {
                    error!(reply = ?reply, "Upstream sent a reply nobody asked for");
                    return Err(e);
                }
            };
            self.acceptable.notify_waiters();

            let identity = pending.identity();
            if pending.dispatch(std::mem::take(reply)) {
                self.metrics.reply_delivered();
            } else {
                self.metrics.reply_dropped();
                debug!(identity, "Dropped reply for a recycled session");
            }

            parser.reset();
        }
    }

    fn on_connected(self: &Arc<Self>) -> Result<(), Error> {
        let mut link = self.lock();
        link.connected = true;
        link.authenticated = false;

        let Some(password) = &self.config.password else {
            link.authenticated = true;
            drop(link);

            self.acceptable.notify_waiters();
            return Ok(());
        };

        let auth = Arc::new(Auth {
            upstream: Arc::downgrade(self),
        });
        let cmd = Command::from_iter(["AUTH", password.as_str()]);

        let Link {
            pipeline, outbound, ..
        } = &mut *link;
        pipeline.push(&cmd, auth, outbound)?;
        drop(link);

        debug!("Sent AUTH to upstream");
        self.writable.notify_one();

        Ok(())
    }

    fn on_authenticated(&self) {
        let mut link = self.lock();
        if !link.connected {
            return;
        }
        link.authenticated = true;
        drop(link);

        info!("Authenticated with upstream");
        self.acceptable.notify_waiters();
    }

    fn on_closed(&self) {
        let abandoned = {
            let mut link = self.lock();
            link.connected = false;
            link.authenticated = false;
            link.outbound.clear();
            link.pipeline.abandon()
        };

        self.metrics.requests_abandoned(abandoned);
        warn!(abandoned, "Upstream connection closed");
    }

    // Nothing panics while holding the lock, and the link state stays consistent if it did.
    fn lock(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Waits for the reply to the AUTH command sent when a connection comes up.
struct Auth {
    upstream: Weak<Upstream>,
}

impl Waiter for Auth {
    fn identity(&self) -> u64 {
        AUTH_IDENTITY
    }

    fn on_reply(&self, reply: SharedBuffer) {
        let Some(upstream) = self.upstream.upgrade() else {
            return;
        };

        if reply.as_slice().starts_with(b"+") {
            upstream.on_authenticated();
        } else {
            error!(reply = ?reply, "Upstream rejected AUTH");
        }
    }
}
