use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::core::{Error, Result};
use crate::protocol::{request, LinkCodec, LinkFrame, Message, MessageClass, SendQueue};
use super::{LinkReader, LinkWriter, Transport};

/// Wait after a CAN before the interrupted message is sent again
const CAN_BACKOFF: Duration = Duration::from_millis(100);

type SharedWriter = Arc<AsyncMutex<FramedWrite<LinkWriter, LinkCodec>>>;

/// Single-slot signal that the in-flight transaction has ended
#[derive(Debug)]
pub struct TransactionGate {
    permits: Semaphore,
}

impl TransactionGate {
    pub fn new() -> Self {
        TransactionGate {
            permits: Semaphore::new(0),
        }
    }

    /// Closes the gate before a new transaction starts
    pub fn reset(&self) {
        while let Ok(permit) = self.permits.try_acquire() {
            permit.forget();
        }
    }

    /// Opens the gate. Releasing twice leaves a single permit.
    pub fn release(&self) {
        if self.permits.available_permits() == 0 {
            self.permits.add_permits(1);
        }
    }

    /// Waits until the gate opens. Returns `false` on timeout.
    pub async fn wait(&self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.permits.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                true
            }
            _ => false,
        }
    }
}

impl Default for TransactionGate {
    fn default() -> Self {
        TransactionGate::new()
    }
}

/// Link-level counters
#[derive(Debug, Default)]
pub struct LinkStats {
    sof: AtomicU64,
    ack: AtomicU64,
    nak: AtomicU64,
    can: AtomicU64,
    oof: AtomicU64,
    timeouts: AtomicU64,
    longest_response_ms: AtomicU64,
}

/// Point-in-time copy of [`LinkStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub sof: u64,
    pub ack: u64,
    pub nak: u64,
    pub can: u64,
    pub oof: u64,
    pub timeouts: u64,
    pub longest_response_ms: u64,
}

impl LinkStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_response(&self, elapsed: Duration) {
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.longest_response_ms.fetch_max(ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sof: self.sof.load(Ordering::Relaxed),
            ack: self.ack.load(Ordering::Relaxed),
            nak: self.nak.load(Ordering::Relaxed),
            can: self.can.load(Ordering::Relaxed),
            oof: self.oof.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            longest_response_ms: self.longest_response_ms.load(Ordering::Relaxed),
        }
    }
}

/// Receives what the workers observe on the link
pub trait LinkEvents: Send + Sync + 'static {
    /// A valid data frame arrived
    fn frame_received(&self, message: Message);

    /// The in-flight message got no answer in time
    fn transaction_timed_out(&self, message: Message);

    /// The stick refused the in-flight message; it should be queued again
    fn requeue(&self, message: Message);
}

/// State shared by the send and receive workers
#[derive(Debug)]
pub struct Link {
    queue: SendQueue,
    gate: TransactionGate,
    in_flight: Mutex<Option<Message>>,
    stats: LinkStats,
    response_timeout: Duration,
}

impl Link {
    pub fn new(response_timeout: Duration) -> Self {
        Link {
            queue: SendQueue::new(),
            gate: TransactionGate::new(),
            in_flight: Mutex::new(None),
            stats: LinkStats::default(),
            response_timeout,
        }
    }

    pub fn queue(&self) -> &SendQueue {
        &self.queue
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Copy of the message awaiting its answer
    pub fn in_flight(&self) -> Option<Message> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn set_in_flight(&self, message: Option<Message>) {
        *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner) = message;
    }

    /// Takes the message awaiting its answer
    pub fn take_in_flight(&self) -> Option<Message> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Takes the message awaiting its answer if it is still the one with `sequence`
    pub fn take_in_flight_if(&self, sequence: u64) -> Option<Message> {
        let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|message| message.sequence == sequence) {
            slot.take()
        } else {
            None
        }
    }

    /// Lets the send worker start the next transaction
    pub fn release_gate(&self) {
        self.gate.release();
    }

    /// Drops everything queued or in flight
    pub fn clear(&self) {
        self.queue.clear();
        self.take_in_flight();
    }
}

/// Takes messages off the queue and keeps one transaction in flight
async fn send_loop(
    link: Arc<Link>,
    events: Arc<dyn LinkEvents>,
    writer: SharedWriter,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            message = link.queue.take() => message,
        };

        link.gate.reset();
        let awaits_reply = message.expected_reply.is_some();
        if awaits_reply {
            link.set_in_flight(Some(message.clone()));
        }
        debug!(node = %message.target_node, class = %message.class, callback = message.callback_id, "sending");
        writer.lock().await.send(LinkFrame::Data(message.clone())).await?;
        if !awaits_reply {
            continue;
        }

        let started = Instant::now();
        let answered = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            answered = link.gate.wait(link.response_timeout) => answered,
        };
        if answered {
            link.stats.record_response(started.elapsed());
            continue;
        }

        LinkStats::bump(&link.stats.timeouts);
        let Some(message) = link.take_in_flight() else {
            // answered just after the deadline
            continue;
        };
        warn!(node = %message.target_node, class = %message.class, attempts = message.attempts_remaining, "timeout waiting for response");
        if message.class == MessageClass::SendData {
            writer.lock().await.send(LinkFrame::Data(request::send_data_abort())).await?;
        }
        events.transaction_timed_out(message);
    }
}

/// Reads frames, acknowledges them and hands messages to the controller
async fn receive_loop(
    link: Arc<Link>,
    events: Arc<dyn LinkEvents>,
    mut reader: FramedRead<LinkReader, LinkCodec>,
    writer: SharedWriter,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = reader.next() => frame,
        };
        let frame = match frame {
            Some(frame) => frame?,
            None => return Err(Error::transport("link closed by peer")),
        };

        match frame {
            LinkFrame::Data(message) => {
                LinkStats::bump(&link.stats.sof);
                writer.lock().await.send(LinkFrame::Ack).await?;
                trace!(message = %message, "received");
                events.frame_received(message);
            }
            LinkFrame::Corrupt { raw, reason } => {
                LinkStats::bump(&link.stats.nak);
                warn!(frame = %crate::util::hex(&raw), %reason, "discarding bad frame");
                writer.lock().await.send(LinkFrame::Nak).await?;
            }
            LinkFrame::Ack => {
                LinkStats::bump(&link.stats.ack);
                trace!("ACK");
            }
            LinkFrame::Nak => {
                LinkStats::bump(&link.stats.nak);
                if let Some(message) = link.take_in_flight() {
                    warn!(node = %message.target_node, class = %message.class, "stick NAKed the last frame, discarding");
                    link.gate.release();
                }
            }
            LinkFrame::Can => {
                LinkStats::bump(&link.stats.can);
                if let Some(mut message) = link.take_in_flight() {
                    if message.attempts_remaining > 0 {
                        message.attempts_remaining -= 1;
                        debug!(class = %message.class, attempts = message.attempts_remaining, "stick canceled the last frame, requeueing");
                        tokio::time::sleep(CAN_BACKOFF).await;
                        events.requeue(message);
                    } else {
                        warn!(node = %message.target_node, class = %message.class, "canceled too often, discarding");
                    }
                    link.gate.release();
                }
            }
            LinkFrame::OutOfFrame(byte) => {
                LinkStats::bump(&link.stats.oof);
                warn!(byte = %format!("0x{:02X}", byte), "out of frame byte");
                writer.lock().await.send(LinkFrame::Nak).await?;
            }
        }
    }
}

/// The running send and receive workers of one open link
pub struct Workers {
    send: JoinHandle<Result<()>>,
    receive: JoinHandle<Result<()>>,
    cancel: CancellationToken,
}

impl Workers {
    /// Opens the transport and starts both workers
    pub async fn spawn(
        transport: &dyn Transport,
        link: Arc<Link>,
        events: Arc<dyn LinkEvents>,
        soft_reset: bool,
    ) -> Result<Self> {
        let (reader, writer) = transport.open().await?;
        let reader = FramedRead::new(reader, LinkCodec::new());
        let mut writer = FramedWrite::new(writer, LinkCodec::new());
        // resync the stick's receiver
        writer.send(LinkFrame::Nak).await?;
        if soft_reset {
            info!("soft resetting the stick");
            writer.send(LinkFrame::Data(request::soft_reset())).await?;
        }
        let writer: SharedWriter = Arc::new(AsyncMutex::new(writer));
        let cancel = CancellationToken::new();

        let send = {
            let (link, events, writer, cancel) = (link.clone(), events.clone(), writer.clone(), cancel.clone());
            tokio::spawn(async move {
                let result = send_loop(link, events, writer, cancel.clone()).await;
                if let Err(e) = &result {
                    error!(error = %e, "send worker stopped");
                }
                cancel.cancel();
                result
            })
        };
        let receive = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let result = receive_loop(link, events, reader, writer, cancel.clone()).await;
                if let Err(e) = &result {
                    error!(error = %e, "receive worker stopped");
                }
                cancel.cancel();
                result
            })
        };
        info!(link = %transport.describe(), "workers started");
        Ok(Workers { send, receive, cancel })
    }

    /// Whether both workers are still running
    pub fn is_running(&self) -> bool {
        !self.send.is_finished() && !self.receive.is_finished()
    }

    /// Stops both workers and waits for them to exit
    pub async fn stop(mut self) {
        self.cancel.cancel();
        for (name, handle) in [("send", &mut self.send), ("receive", &mut self.receive)] {
            match handle.await {
                Ok(_) => debug!(worker = name, "worker exited"),
                Err(e) => warn!(worker = name, error = %e, "worker panicked"),
            }
        }
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
