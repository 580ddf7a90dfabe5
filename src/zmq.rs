use std::{thread, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::PullConfig;

pub use safesocket::Socket;

/// How often a background consumer checks for cancellation, if the
/// configuration does not already set a receive timeout.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

mod safesocket {
    use std::{marker::PhantomData, ops::Deref, rc::Rc};

    /// Basic newtype wrapper of zmq::Socket that correctly marks the socket as !Sync and !Send
    pub struct Socket {
        inner: zmq::Socket,
        _nosend: PhantomData<Rc<()>>,
    }

    impl Deref for Socket {
        type Target = zmq::Socket;

        fn deref(&self) -> &Self::Target {
            &self.inner
        }
    }
    impl Socket {
        pub fn new(socket: zmq::Socket) -> Self {
            Self {
                inner: socket,
                _nosend: PhantomData,
            }
        }
    }
}

/// A connected PULL socket that hands out one message at a time.
///
/// The only way to get one is through [`PullConsumer::connect`] (or
/// [`PullConsumer::connect_with_context`]), so a consumer is always
/// connected. The handle is bound to the thread that created it; use
/// [`BackgroundConsumer`] to consume from async code.
pub struct PullConsumer {
    socket: Socket,
    endpoint: String,
    config: PullConfig,
}

impl PullConsumer {
    /// Connect to `endpoint` with a fresh zmq context.
    pub fn connect(endpoint: &str, config: PullConfig) -> Result<Self> {
        Self::connect_with_context(endpoint, &zmq::Context::new(), config)
    }

    /// Connect to `endpoint` using an existing context.
    ///
    /// `inproc://` endpoints are only reachable from sockets sharing the
    /// same context as the peer. Blocks for the configured settle delay
    /// before returning, so that the connection handshake has completed
    /// before the first receive.
    pub fn connect_with_context(
        endpoint: &str,
        context: &zmq::Context,
        config: PullConfig,
    ) -> Result<Self> {
        let socket = Socket::new(
            context
                .socket(zmq::PULL)
                .context("Failed to create PULL socket")?,
        );
        socket.set_linger(0)?;
        socket.set_rcvtimeo(config.rcvtimeo())?;

        info!("Connecting to {endpoint}");
        socket
            .connect(endpoint)
            .with_context(|| format!("Failed to connect PULL socket to {endpoint}"))?;
        thread::sleep(config.settle_delay);
        info!("Connected to {endpoint}");

        Ok(Self {
            socket,
            endpoint: endpoint.to_string(),
            config,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn config(&self) -> &PullConfig {
        &self.config
    }

    /// Receive one multipart message and return its first frame as text.
    ///
    /// Blocks until a message arrives (or the configured receive timeout
    /// elapses). Any trailing frames are discarded. A transport error while
    /// receiving gives `Ok(None)`, and calling again is safe. A first frame
    /// that is not valid UTF-8 is returned as an `Err`.
    pub fn consume(&self) -> Result<Option<String>> {
        match self.try_consume()? {
            Ok(message) => Ok(Some(message)),
            Err(zmq::Error::EAGAIN) => {
                trace!("Timed out waiting for message from {}", self.endpoint);
                Ok(None)
            }
            Err(e) => {
                debug!("Failed to receive from {}: {e}", self.endpoint);
                Ok(None)
            }
        }
    }

    /// Like [`consume`](Self::consume), but hands back the transport error
    /// instead of discarding it.
    fn try_consume(&self) -> Result<Result<String, zmq::Error>> {
        let mut first = zmq::Message::new();
        let discarded = match self.recv_first(&mut first) {
            Ok(discarded) => discarded,
            Err(e) => return Ok(Err(e)),
        };
        trace!(
            "Received {} byte message from {}, discarded {discarded} trailing frames",
            first.len(),
            self.endpoint
        );
        thread::sleep(self.config.recv_delay);
        decode_frame(&first).map(Ok)
    }

    /// Run [`consume`](Self::consume) in a loop, passing every result to `step`.
    ///
    /// Stops with `Ok(())` as soon as `step` returns `false`, or with the
    /// first error returned by `consume`.
    pub fn run<F>(&self, mut step: F) -> Result<()>
    where
        F: FnMut(Option<String>) -> bool,
    {
        loop {
            let message = self.consume()?;
            if !step(message) {
                return Ok(());
            }
        }
    }

    /// Receive the first frame into `first`, then drain the rest of the
    /// multipart message. Returns the number of frames thrown away.
    fn recv_first(&self, first: &mut zmq::Message) -> Result<usize, zmq::Error> {
        self.socket.recv(first, 0)?;
        let mut discarded = 0usize;
        if first.get_more() {
            let mut trailing = zmq::Message::new();
            loop {
                self.socket.recv(&mut trailing, 0)?;
                discarded += 1;
                if !trailing.get_more() {
                    break;
                }
            }
        }
        Ok(discarded)
    }
}

fn decode_frame(frame: &zmq::Message) -> Result<String> {
    frame
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Message frame ({} bytes) is not valid UTF-8", frame.len()))
}

/// Runs a [`PullConsumer`] on its own thread and makes its messages
/// available to async code.
///
/// Only successfully decoded messages are delivered; receive timeouts are
/// skipped. Any other receive error, or a decode error, stops the thread,
/// after which [`recv`](Self::recv) returns `None` once any
/// already-delivered messages have been read.
pub struct BackgroundConsumer {
    cancel: CancellationToken,
    messages: mpsc::UnboundedReceiver<String>,
    handle: Option<thread::JoinHandle<()>>,
}

impl BackgroundConsumer {
    /// Start a consumer thread and wait for it to connect.
    ///
    /// Resolves after the settle delay, or with the error if the
    /// connection could not be made.
    pub async fn start(endpoint: &str, context: zmq::Context, config: PullConfig) -> Result<Self> {
        let cancel = CancellationToken::new();
        let inner_cancel = cancel.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = oneshot::channel();
        let inner_endpoint = endpoint.to_string();
        // Without a timeout the thread would never notice cancellation
        let config = match config.recv_timeout {
            Some(_) => config,
            None => config.recv_timeout(Some(CANCEL_POLL_INTERVAL)),
        };

        let handle = thread::spawn(move || {
            consumer_thread(
                &inner_endpoint,
                &context,
                config,
                connected_tx,
                inner_cancel,
                tx,
            )
        });

        match connected_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(anyhow!(
                    "Consumer thread for {endpoint} exited before connecting"
                ));
            }
        }

        Ok(Self {
            cancel,
            messages: rx,
            handle: Some(handle),
        })
    }

    /// Receive the next message. Cancel-safe.
    ///
    /// Returns `None` when the consumer thread has stopped and every
    /// message it delivered has been received.
    pub async fn recv(&mut self) -> Option<String> {
        self.messages.recv().await
    }

    /// Stop the consumer thread and wait for it to finish.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        let Some(handle) = self.handle.take() else {
            return;
        };
        match tokio::task::spawn_blocking(move || handle.join()).await {
            Ok(Ok(())) => {}
            _ => warn!("Consumer thread did not shut down cleanly"),
        }
    }
}

impl Drop for BackgroundConsumer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Body of the background thread: connect, report back, then forward
fn consumer_thread(
    endpoint: &str,
    context: &zmq::Context,
    config: PullConfig,
    connected: oneshot::Sender<Result<()>>,
    token: CancellationToken,
    sender: mpsc::UnboundedSender<String>,
) {
    match PullConsumer::connect_with_context(endpoint, context, config) {
        Ok(consumer) => {
            if connected.send(Ok(())).is_err() {
                debug!("Nobody waiting for consumer on {endpoint}, closing");
                return;
            }
            inner_consume(consumer, token, sender);
        }
        Err(e) => {
            let _ = connected.send(Err(e));
        }
    }
}

/// Inner actor to forward messages from a consumer
fn inner_consume(
    consumer: PullConsumer,
    token: CancellationToken,
    sender: mpsc::UnboundedSender<String>,
) {
    while !token.is_cancelled() {
        match consumer.try_consume() {
            Ok(Ok(message)) => {
                if sender.send(message).is_err() {
                    break;
                }
            }
            Ok(Err(zmq::Error::EAGAIN)) => continue,
            Ok(Err(e)) => {
                error!(
                    "Unexpected return from zmq_recv on {}: {e}",
                    consumer.endpoint()
                );
                break;
            }
            Err(e) => {
                error!("Stopping consumer for {}: {e:#}", consumer.endpoint());
                break;
            }
        }
    }
    debug!("Consumer thread for {} ending", consumer.endpoint());
}
