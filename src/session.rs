//! Connection supervisor state machine.
//!
//! All bridge state lives in [`Session`]: lifecycle phase and flags, the
//! outbound queue, the backoff schedule and the generation counter that
//! identifies the current connection attempt. The machine is pure: it
//! consumes [`Event`]s and returns [`Action`]s for the driver to execute,
//! so every transition is testable against synthetic events without I/O
//! or timers.
//!
//! Staleness: each connection attempt carries a generation id, and each
//! liveness probe a probe id. Events tagged with a non-current generation
//! (or a probe that is no longer pending) are discarded, which replaces
//! driver-side timer cancellation entirely.

use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;

use crate::codec::Inbound;
use crate::config::Config;
use crate::queue::OutboundQueue;

/// Lifecycle phase of the supervisor.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Attempting the first open, bounded by the connect deadline
    InitialConnecting,
    /// Handshake complete, messages may be exchanged
    Open,
    /// Lost a previously open connection, backoff schedule running
    Reconnecting,
    /// Terminal; an exit action has been emitted
    ClosedExit,
}

/// A scheduled future event. The driver sleeps for `delay` and feeds the
/// timer back in as [`Event::Timer`]; the machine decides on fire whether
/// it is still relevant.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    /// Wall-clock bound on the first successful open
    ConnectDeadline,
    /// Next connection attempt is due
    Retry { generation: u64 },
    /// Next liveness probe is due
    Heartbeat { generation: u64 },
    /// A probe went unanswered for the configured timeout
    HeartbeatTimeout { generation: u64, probe: u64 },
}

/// Everything that can happen to the bridge.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// One non-empty line read from the input stream
    StdinLine(String),
    /// Input stream reached end-of-file
    StdinEof,
    /// SIGINT/SIGTERM, handled identically to end-of-file
    Terminate,
    /// A connection attempt completed its handshake
    Opened { generation: u64 },
    /// A connection attempt failed before the handshake completed
    ConnectFailed { generation: u64 },
    /// A decoded frame arrived on a connection
    Frame { generation: u64, inbound: Inbound },
    /// A connection closed or errored after being adopted
    ConnectionClosed { generation: u64 },
    /// A previously scheduled timer fired
    Timer(Timer),
}

/// Effects for the driver to execute, in order.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Start a WebSocket connection attempt tagged with `generation`
    Connect { generation: u64 },
    /// Install the handshaken connection for `generation` as current
    AdoptConnection { generation: u64 },
    /// Drop a connection that resolved stale or after shutdown
    DiscardConnection { generation: u64 },
    /// Send one protocol line on the current connection
    SendLine(String),
    /// Send a liveness probe on the current connection
    SendPing,
    /// Write one relayed line (plus newline) to the output stream
    WriteLine(String),
    /// Best-effort close of the connection for `generation`
    CloseConnection { generation: u64 },
    /// Arrange for `timer` to fire as an event after `delay`
    Schedule { timer: Timer, delay: Duration },
    /// Terminate the process with `code`
    Exit { code: u8 },
}

pub struct Session {
    config: Config,
    phase: Phase,
    /// Ever reached `Open`
    opened: bool,
    /// Local shutdown requested
    closed: bool,
    /// Terminal; suppresses all further activity
    exiting: bool,
    /// Id of the current connection attempt
    generation: u64,
    /// Consecutive failed attempts since the last successful open
    attempt: u32,
    probe_seq: u64,
    /// Probe awaiting a pong, if any
    pending_probe: Option<u64>,
    queue: OutboundQueue,
    backoff: ExponentialBackoff,
}

impl Session {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let backoff = (&config.reconnect).into();
        let queue = OutboundQueue::new(config.queue_capacity);
        Self {
            config,
            phase: Phase::InitialConnecting,
            opened: false,
            closed: false,
            exiting: false,
            generation: 1,
            attempt: 0,
            probe_seq: 0,
            pending_probe: None,
            queue,
            backoff,
        }
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Actions to execute at startup: arm the connect deadline and begin
    /// the first attempt.
    #[must_use]
    pub fn start(&self) -> Vec<Action> {
        vec![
            Action::Schedule {
                timer: Timer::ConnectDeadline,
                delay: self.config.connect_timeout,
            },
            Action::Connect {
                generation: self.generation,
            },
        ]
    }

    /// Dispatch one event through the transition table.
    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::StdinLine(line) => self.on_stdin_line(line),
            Event::StdinEof | Event::Terminate => self.shutdown(),
            Event::Opened { generation } => self.on_opened(generation),
            Event::ConnectFailed { generation } => self.on_connect_failed(generation),
            Event::Frame {
                generation,
                inbound,
            } => self.on_frame(generation, inbound),
            Event::ConnectionClosed { generation } => self.on_connection_closed(generation),
            Event::Timer(timer) => self.on_timer(timer),
        }
    }

    fn is_stale(&self, generation: u64) -> bool {
        generation != self.generation || self.exiting || self.closed
    }

    fn on_stdin_line(&mut self, line: String) -> Vec<Action> {
        if self.exiting {
            return Vec::new();
        }
        if self.phase == Phase::Open {
            return vec![Action::SendLine(line)];
        }
        self.queue.push(line);
        Vec::new()
    }

    fn on_opened(&mut self, generation: u64) -> Vec<Action> {
        if self.is_stale(generation) {
            return vec![Action::DiscardConnection { generation }];
        }

        self.phase = Phase::Open;
        self.opened = true;
        self.attempt = 0;
        self.backoff.reset();
        tracing::info!(endpoint = %self.config.endpoint, generation, "Connected");

        let mut actions = vec![Action::AdoptConnection { generation }];
        actions.extend(self.queue.take_pending().into_iter().map(Action::SendLine));
        actions.push(Action::Schedule {
            timer: Timer::Heartbeat { generation },
            delay: self.config.heartbeat_interval,
        });
        actions
    }

    fn on_connect_failed(&mut self, generation: u64) -> Vec<Action> {
        if self.is_stale(generation) {
            return Vec::new();
        }
        match self.phase {
            // The caller is blocking on first connect, so retry on a short
            // fixed delay; the connect deadline bounds this loop.
            Phase::InitialConnecting => {
                self.generation += 1;
                tracing::debug!(
                    delay = ?self.config.preopen_retry_delay,
                    "Connect attempt failed before first open, retrying"
                );
                vec![Action::Schedule {
                    timer: Timer::Retry {
                        generation: self.generation,
                    },
                    delay: self.config.preopen_retry_delay,
                }]
            }
            Phase::Reconnecting => self.next_reconnect_attempt(),
            Phase::Open | Phase::ClosedExit => Vec::new(),
        }
    }

    fn on_frame(&mut self, generation: u64, inbound: Inbound) -> Vec<Action> {
        if self.is_stale(generation) {
            return Vec::new();
        }
        match inbound {
            Inbound::Line(line) => vec![Action::WriteLine(line)],
            Inbound::Pong => {
                self.pending_probe = None;
                Vec::new()
            }
        }
    }

    fn on_connection_closed(&mut self, generation: u64) -> Vec<Action> {
        if self.is_stale(generation) {
            return Vec::new();
        }
        match self.phase {
            Phase::Open => {
                self.pending_probe = None;
                self.phase = Phase::Reconnecting;
                self.next_reconnect_attempt()
            }
            // Closed during the handshake window; same treatment as a
            // pre-open connect failure.
            Phase::InitialConnecting => self.on_connect_failed(generation),
            Phase::Reconnecting | Phase::ClosedExit => Vec::new(),
        }
    }

    fn on_timer(&mut self, timer: Timer) -> Vec<Action> {
        match timer {
            Timer::ConnectDeadline => {
                if self.opened || self.closed || self.exiting {
                    return Vec::new();
                }
                self.fatal("connect timeout exceeded before first open")
            }
            Timer::Retry { generation } => {
                if self.is_stale(generation) || self.phase == Phase::Open {
                    return Vec::new();
                }
                vec![Action::Connect { generation }]
            }
            Timer::Heartbeat { generation } => self.on_heartbeat_due(generation),
            Timer::HeartbeatTimeout { generation, probe } => {
                self.on_heartbeat_timeout(generation, probe)
            }
        }
    }

    fn on_heartbeat_due(&mut self, generation: u64) -> Vec<Action> {
        if self.is_stale(generation) || self.phase != Phase::Open {
            return Vec::new();
        }
        let next_probe = Action::Schedule {
            timer: Timer::Heartbeat { generation },
            delay: self.config.heartbeat_interval,
        };
        // Only one probe/timeout pair in flight; if the previous probe is
        // somehow still pending, its timeout will handle the connection.
        if self.pending_probe.is_some() {
            return vec![next_probe];
        }
        self.probe_seq += 1;
        self.pending_probe = Some(self.probe_seq);
        vec![
            Action::SendPing,
            Action::Schedule {
                timer: Timer::HeartbeatTimeout {
                    generation,
                    probe: self.probe_seq,
                },
                delay: self.config.heartbeat_timeout,
            },
            next_probe,
        ]
    }

    fn on_heartbeat_timeout(&mut self, generation: u64, probe: u64) -> Vec<Action> {
        if self.is_stale(generation)
            || self.phase != Phase::Open
            || self.pending_probe != Some(probe)
        {
            return Vec::new();
        }
        tracing::warn!(
            timeout = ?self.config.heartbeat_timeout,
            "Heartbeat timeout, forcing connection closed"
        );
        // A forced close is routed exactly like a transport close.
        self.pending_probe = None;
        self.phase = Phase::Reconnecting;
        let mut actions = vec![Action::CloseConnection { generation }];
        actions.extend(self.next_reconnect_attempt());
        actions
    }

    fn next_reconnect_attempt(&mut self) -> Vec<Action> {
        self.attempt += 1;
        if self.attempt > self.config.reconnect.max_attempts {
            return self.fatal("reconnect attempts exhausted");
        }
        let delay = self
            .backoff
            .next_backoff()
            .unwrap_or(self.config.reconnect.max_backoff);
        self.generation += 1;
        tracing::warn!(
            attempt = self.attempt,
            max_attempts = self.config.reconnect.max_attempts,
            ?delay,
            "Connection lost, scheduling reconnect"
        );
        vec![Action::Schedule {
            timer: Timer::Retry {
                generation: self.generation,
            },
            delay,
        }]
    }

    /// Orderly shutdown: EOF and termination signals land here, idempotently.
    fn shutdown(&mut self) -> Vec<Action> {
        if self.exiting {
            return Vec::new();
        }
        self.closed = true;
        self.exiting = true;
        self.pending_probe = None;
        self.phase = Phase::ClosedExit;
        tracing::info!("Shutting down");
        vec![
            Action::CloseConnection {
                generation: self.generation,
            },
            Action::Exit { code: 0 },
        ]
    }

    fn fatal(&mut self, reason: &str) -> Vec<Action> {
        if self.exiting {
            return Vec::new();
        }
        self.exiting = true;
        self.pending_probe = None;
        self.phase = Phase::ClosedExit;
        tracing::error!(reason, "Fatal, giving up");
        vec![
            Action::CloseConnection {
                generation: self.generation,
            },
            Action::Exit { code: 1 },
        ]
    }
}
