#![expect(
    clippy::module_name_repetitions,
    reason = "Bridge types expose their domain in the name for clarity"
)]

//! Async driver: owns the real WebSocket, stdio streams and timers, and
//! feeds the session state machine.
//!
//! Every external happening (stdin line, connect outcome, inbound frame,
//! timer fire, signal) becomes one [`Event`] processed to completion on a
//! single logical flow of control; the resulting [`Action`]s are executed
//! in order before the next event is taken. Delays are never awaited
//! inline: each `Schedule` action spawns a task that feeds the timer
//! back in as an event, so shutdown stays responsive at all times.

use std::collections::HashMap;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::Result;
use crate::codec;
use crate::config::Config;
use crate::error::Error;
use crate::session::{Action, Event, Session};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type ConnectOutcome = (u64, std::result::Result<WsStream, tokio_tungstenite::tungstenite::Error>);

/// Grace period for the best-effort close on shutdown; a broken transport
/// must never hang the exit path.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Handle for injecting a termination request from outside the bridge
/// (signal handlers). Requests are idempotent.
#[derive(Debug, Clone)]
pub struct BridgeHandle {
    events_tx: mpsc::UnboundedSender<Event>,
}

impl BridgeHandle {
    pub fn terminate(&self) {
        _ = self.events_tx.send(Event::Terminate);
    }
}

pub struct Bridge<R, W> {
    config: Config,
    session: Session,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    connects_tx: mpsc::UnboundedSender<ConnectOutcome>,
    connects_rx: mpsc::UnboundedReceiver<ConnectOutcome>,
    /// Handshaken connections not yet adopted or discarded, by generation
    pending: HashMap<u64, WsStream>,
    /// Write half of the one current connection
    current: Option<(u64, WsSink)>,
    stdin: Option<R>,
    stdout: W,
}

impl<R, W> Bridge<R, W>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    #[must_use]
    pub fn new(config: Config, stdin: R, stdout: W) -> (Self, BridgeHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (connects_tx, connects_rx) = mpsc::unbounded_channel();
        let handle = BridgeHandle {
            events_tx: events_tx.clone(),
        };
        let session = Session::new(config.clone());

        (
            Self {
                config,
                session,
                events_tx,
                events_rx,
                connects_tx,
                connects_rx,
                pending: HashMap::new(),
                current: None,
                stdin: Some(stdin),
                stdout,
            },
            handle,
        )
    }

    /// Run the bridge to completion and return the process exit code.
    ///
    /// Errors only on a broken output stream; everything transport-side is
    /// absorbed into the state machine.
    pub async fn run(mut self) -> Result<u8> {
        if let Some(stdin) = self.stdin.take() {
            spawn_stdin_pump(stdin, self.events_tx.clone());
        }

        let startup = self.session.start();
        if let Some(code) = self.apply(startup).await? {
            return Ok(code);
        }

        loop {
            tokio::select! {
                Some(event) = self.events_rx.recv() => {
                    let actions = self.session.handle(event);
                    if let Some(code) = self.apply(actions).await? {
                        return Ok(code);
                    }
                }
                Some((generation, outcome)) = self.connects_rx.recv() => {
                    let event = match outcome {
                        Ok(stream) => {
                            self.pending.insert(generation, stream);
                            Event::Opened { generation }
                        }
                        Err(e) => {
                            let error = Error::from(e);
                            tracing::warn!(generation, %error, "Unable to connect");
                            Event::ConnectFailed { generation }
                        }
                    };
                    let actions = self.session.handle(event);
                    if let Some(code) = self.apply(actions).await? {
                        return Ok(code);
                    }
                }
                else => {
                    // Both channels closed; nothing can drive the session
                    // any further.
                    return Ok(0);
                }
            }
        }
    }

    /// Execute actions in order; returns the exit code once emitted.
    async fn apply(&mut self, actions: Vec<Action>) -> Result<Option<u8>> {
        for action in actions {
            match action {
                Action::Connect { generation } => self.start_connect(generation),
                Action::AdoptConnection { generation } => self.adopt_connection(generation),
                Action::DiscardConnection { generation } => {
                    drop(self.pending.remove(&generation));
                }
                Action::SendLine(line) => self.send_message(codec::line(&line)).await,
                Action::SendPing => self.send_message(codec::ping()).await,
                Action::WriteLine(line) => {
                    self.stdout.write_all(line.as_bytes()).await?;
                    self.stdout.write_all(b"\n").await?;
                    self.stdout.flush().await?;
                }
                Action::CloseConnection { generation } => self.close_connection(generation),
                Action::Schedule { timer, delay } => {
                    let events_tx = self.events_tx.clone();
                    tokio::spawn(async move {
                        sleep(delay).await;
                        _ = events_tx.send(Event::Timer(timer));
                    });
                }
                Action::Exit { code } => {
                    _ = self.stdout.flush().await;
                    return Ok(Some(code));
                }
            }
        }
        Ok(None)
    }

    fn start_connect(&self, generation: u64) {
        let endpoint = self.config.endpoint.clone();
        let connects_tx = self.connects_tx.clone();
        tokio::spawn(async move {
            let outcome = match connect_async(&endpoint).await {
                Ok((stream, _response)) => Ok(stream),
                Err(e) => Err(e),
            };
            _ = connects_tx.send((generation, outcome));
        });
    }

    fn adopt_connection(&mut self, generation: u64) {
        let Some(stream) = self.pending.remove(&generation) else {
            tracing::debug!(generation, "No pending connection to adopt");
            return;
        };
        let (sink, read) = stream.split();
        self.current = Some((generation, sink));
        spawn_read_loop(read, generation, self.events_tx.clone());
    }

    fn close_connection(&mut self, generation: u64) {
        drop(self.pending.remove(&generation));
        if let Some((current_generation, sink)) = self.current.take() {
            if current_generation == generation {
                tokio::spawn(async move {
                    let mut sink = sink;
                    _ = timeout(CLOSE_GRACE, sink.close()).await;
                });
            } else {
                self.current = Some((current_generation, sink));
            }
        }
    }

    async fn send_message(&mut self, message: Message) {
        let Some((generation, sink)) = self.current.as_mut() else {
            tracing::debug!("No current connection, dropping outbound message");
            return;
        };
        if let Err(e) = sink.send(message).await {
            tracing::debug!(error = %e, "WebSocket send failed");
            _ = self.events_tx.send(Event::ConnectionClosed {
                generation: *generation,
            });
        }
    }
}

/// Pump stdin lines into the event channel; EOF and read errors both end
/// the stream.
fn spawn_stdin_pump<R>(stdin: R, events_tx: mpsc::UnboundedSender<Event>)
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = stdin.lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.is_empty() {
                        continue;
                    }
                    if events_tx.send(Event::StdinLine(line)).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Input stream read error, treating as EOF");
                    break;
                }
            }
        }
        _ = events_tx.send(Event::StdinEof);
    });
}

/// Read frames off one connection until it closes, tagging everything with
/// its generation so stale traffic is discarded by the session.
fn spawn_read_loop(
    mut read: SplitStream<WsStream>,
    generation: u64,
    events_tx: mpsc::UnboundedSender<Event>,
) {
    tokio::spawn(async move {
        while let Some(message) = read.next().await {
            match message {
                Ok(Message::Close(_)) => break,
                Ok(message) => {
                    if let Some(inbound) = codec::decode(&message) {
                        let event = Event::Frame {
                            generation,
                            inbound,
                        };
                        if events_tx.send(event).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(generation, error = %e, "WebSocket read error");
                    break;
                }
            }
        }
        _ = events_tx.send(Event::ConnectionClosed { generation });
    });
}
