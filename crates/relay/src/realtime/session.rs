use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock, PoisonError,
    },
    time::Duration,
};

use anyhow::bail;
use axum::{
    body::Bytes,
    extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket},
};
use beacon_common::types::{Notification, UserId};
use futures_util::{
    stream::{SplitSink, SplitStream},
    FutureExt, SinkExt, StreamExt,
};
use thiserror::Error;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    time::{interval_at, sleep, timeout, Instant, MissedTickBehavior},
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{metrics, realtime::registry::ConnectionRegistry};

pub const WRITE_DEADLINE: Duration = Duration::from_secs(10);
pub const READ_DEADLINE: Duration = Duration::from_secs(60);
/// Nine tenths of the read deadline, so a ping always lands before the peer times out.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(54);
pub const MAX_INBOUND_MESSAGE_BYTES: usize = 512;
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 10;

/// Timings and limits applied to every realtime session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub write_deadline: Duration,
    pub read_deadline: Duration,
    pub heartbeat_interval: Duration,
    pub max_inbound_message_bytes: usize,
    pub outbound_queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            write_deadline: WRITE_DEADLINE,
            read_deadline: READ_DEADLINE,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            max_inbound_message_bytes: MAX_INBOUND_MESSAGE_BYTES,
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
        }
    }
}

impl SessionConfig {
    pub fn with_outbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.outbound_queue_capacity = capacity;
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.heartbeat_interval >= self.read_deadline {
            bail!(
                "heartbeat interval ({:?}) must be shorter than the read deadline ({:?})",
                self.heartbeat_interval,
                self.read_deadline
            );
        }
        if self.heartbeat_interval.is_zero() || self.write_deadline.is_zero() {
            bail!("session heartbeat interval and write deadline must be non-zero");
        }
        if self.outbound_queue_capacity == 0 {
            bail!("outbound queue capacity must be at least 1");
        }
        if self.max_inbound_message_bytes == 0 {
            bail!("inbound message limit must be at least 1 byte");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    Superseded,
    WriteFailed,
    ReadFailed,
    ReadTimeout,
    PeerClosed,
    QueueClosed,
}

impl CloseReason {
    pub const ALL: [Self; 6] = [
        Self::Superseded,
        Self::WriteFailed,
        Self::ReadFailed,
        Self::ReadTimeout,
        Self::PeerClosed,
        Self::QueueClosed,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Superseded => "superseded",
            Self::WriteFailed => "write_failed",
            Self::ReadFailed => "read_failed",
            Self::ReadTimeout => "read_timeout",
            Self::PeerClosed => "peer_closed",
            Self::QueueClosed => "queue_closed",
        }
    }

    fn close_frame(self) -> CloseFrame {
        let code = match self {
            Self::QueueClosed => close_code::AWAY,
            _ => close_code::NORMAL,
        };
        let reason = match self {
            Self::QueueClosed => "going away",
            other => other.as_str(),
        };
        CloseFrame { code, reason: Utf8Bytes::from_static(reason) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
    #[error("outbound queue is full")]
    Full,
    #[error("outbound queue is closed")]
    Closed,
}

/// One live connection bound to one user.
///
/// Producers only ever reach the bounded outbound queue; the socket is
/// owned by the session's write and read loops.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    user_id: UserId,
    outbound: Mutex<Option<mpsc::Sender<Notification>>>,
    close_reason: OnceLock<CloseReason>,
    cancel: CancellationToken,
    deregistered: AtomicBool,
    released: CancellationToken,
}

impl Session {
    pub fn new(user_id: UserId, capacity: usize) -> (Arc<Self>, mpsc::Receiver<Notification>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            user_id,
            outbound: Mutex::new(Some(sender)),
            close_reason: OnceLock::new(),
            cancel: CancellationToken::new(),
            deregistered: AtomicBool::new(false),
            released: CancellationToken::new(),
        });
        (session, receiver)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn try_enqueue(&self, notification: Notification) -> Result<(), EnqueueError> {
        let guard = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = guard.as_ref() else {
            return Err(EnqueueError::Closed);
        };

        sender.try_send(notification).map_err(|error| match error {
            TrySendError::Full(_) => EnqueueError::Full,
            TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Drop the producer side of the queue. The write loop drains what is
    /// already queued, then sends a `1001 going away` close frame.
    pub fn close_queue(&self) {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    /// Record the close reason and signal both loops. Only the first call
    /// has any effect; returns whether this call closed the session.
    pub fn close(&self, reason: CloseReason) -> bool {
        if self.close_reason.set(reason).is_err() {
            return false;
        }

        self.cancel.cancel();
        self.close_queue();
        metrics::record_session_closed(reason);
        info!(
            session_id = %self.id,
            user_id = self.user_id,
            reason = reason.as_str(),
            "realtime session closed"
        );
        true
    }

    pub fn is_closed(&self) -> bool {
        self.close_reason.get().is_some()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    fn cancelled_reason(&self) -> CloseReason {
        self.close_reason().unwrap_or(CloseReason::PeerClosed)
    }

    /// Resolves once the session has been torn down and its socket dropped.
    pub fn released(&self) -> WaitForCancellationFuture<'_> {
        self.released.cancelled()
    }

    pub fn is_released(&self) -> bool {
        self.released.is_cancelled()
    }

    /// Close the session and remove it from the registry. Called once both
    /// loops have returned; safe to race, returns true only for the call
    /// that deregistered.
    pub fn teardown(self: &Arc<Self>, registry: &ConnectionRegistry, reason: CloseReason) -> bool {
        self.close(reason);

        if self.deregistered.swap(true, Ordering::AcqRel) {
            return false;
        }

        let removed = registry.remove(self);
        debug!(
            session_id = %self.id,
            user_id = self.user_id,
            removed,
            "realtime session deregistered"
        );
        self.released.cancel();
        true
    }
}

pub async fn run_write_loop(
    session: Arc<Session>,
    mut outbound: mpsc::Receiver<Notification>,
    mut sink: SplitSink<WebSocket, Message>,
    config: SessionConfig,
) {
    let mut heartbeat =
        interval_at(Instant::now() + config.heartbeat_interval, config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        let written = tokio::select! {
            biased;
            _ = session.cancelled() => break session.cancelled_reason(),
            next = outbound.recv() => {
                let Some(notification) = next else {
                    if session.is_closed() {
                        break session.cancelled_reason();
                    }
                    break CloseReason::QueueClosed;
                };

                let payload = match serde_json::to_string(&notification) {
                    Ok(payload) => payload,
                    Err(error) => {
                        warn!(
                            session_id = %session.id(),
                            notification_id = notification.id,
                            ?error,
                            "failed to encode notification frame"
                        );
                        continue;
                    }
                };

                let frame = Message::Text(payload.into());
                write_unless_cancelled(&session, &mut sink, frame, config.write_deadline)
                    .await
                    .map(|()| metrics::increment_frames_written())
            }
            _ = heartbeat.tick() => {
                let ping = Message::Ping(Bytes::new());
                write_unless_cancelled(&session, &mut sink, ping, config.write_deadline)
                    .await
                    .map(|()| metrics::increment_pings_sent())
            }
        };

        match written {
            Ok(()) => {}
            Err(WriteError::Cancelled) => break session.cancelled_reason(),
            Err(error) => {
                warn!(
                    session_id = %session.id(),
                    user_id = session.user_id(),
                    %error,
                    "realtime write failed"
                );
                break CloseReason::WriteFailed;
            }
        }
    };

    drop(heartbeat);
    if reason == CloseReason::QueueClosed {
        let goodbye = Message::Close(Some(reason.close_frame()));
        let sent = write_unless_cancelled(&session, &mut sink, goodbye, config.write_deadline).await;
        if sent.is_ok() {
            tokio::select! {
                biased;
                _ = session.cancelled() => {}
                _ = timeout(config.write_deadline, sink.close()) => {}
            }
        }
    } else {
        close_without_waiting(&mut sink, reason);
    }
    drop(sink);
    session.close(reason);
}

/// Liveness only. Ends on peer close, read error, deadline expiry or
/// cancellation; deregistration is left to the caller once both halves are
/// gone.
pub async fn run_read_loop(
    session: Arc<Session>,
    mut stream: SplitStream<WebSocket>,
    config: SessionConfig,
) {
    let deadline = sleep(config.read_deadline);
    tokio::pin!(deadline);

    let reason = loop {
        tokio::select! {
            _ = session.cancelled() => break session.cancelled_reason(),
            _ = &mut deadline => {
                debug!(session_id = %session.id(), user_id = session.user_id(), "read deadline expired");
                break CloseReason::ReadTimeout;
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Pong(_))) => {
                    deadline.as_mut().reset(Instant::now() + config.read_deadline);
                }
                Some(Ok(Message::Close(_))) | None => break CloseReason::PeerClosed,
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    debug!(session_id = %session.id(), user_id = session.user_id(), %error, "realtime read failed");
                    break CloseReason::ReadFailed;
                }
            }
        }
    };

    drop(stream);
    session.close(reason);
}

#[derive(Debug, Error)]
enum WriteError {
    #[error("write deadline of {0:?} exceeded")]
    Deadline(Duration),
    #[error(transparent)]
    Transport(#[from] axum::Error),
    #[error("session closed during write")]
    Cancelled,
}

async fn write_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    message: Message,
    deadline: Duration,
) -> Result<(), WriteError> {
    timeout(deadline, sink.send(message)).await.map_err(|_| WriteError::Deadline(deadline))??;
    Ok(())
}

/// A write in flight is abandoned as soon as the session closes.
async fn write_unless_cancelled(
    session: &Session,
    sink: &mut SplitSink<WebSocket, Message>,
    message: Message,
    deadline: Duration,
) -> Result<(), WriteError> {
    tokio::select! {
        biased;
        _ = session.cancelled() => Err(WriteError::Cancelled),
        written = write_frame(sink, message, deadline) => written,
    }
}

/// Hand the close frame to the socket only if it is writable right now.
fn close_without_waiting(sink: &mut SplitSink<WebSocket, Message>, reason: CloseReason) {
    let frame = Message::Close(Some(reason.close_frame()));
    if sink.send(frame).now_or_never().is_none() {
        debug!(reason = reason.as_str(), "socket not writable; close frame skipped");
    }
}
