use std::io;
use std::time::Duration;

use async_trait::async_trait;
use nfq::Queue;
use tokio::sync::watch;

use crate::error::Error;

/// Per-packet and per-queue kernel limit.
const QUEUE_MAX_LEN: u32 = 0xffff;

/// How long to sleep between non-blocking receive attempts.
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Conntrack classification of a queued packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    Established,
    Related,
    New,
    EstablishedReply,
    RelatedReply,
    Unknown,
}

impl ConnState {
    /// Whether the packet belongs to a connection the kernel has already
    /// seen both directions of.
    pub(crate) fn is_established(self) -> bool {
        matches!(
            self,
            ConnState::Established
                | ConnState::Related
                | ConnState::EstablishedReply
                | ConnState::RelatedReply
        )
    }

    /// Reply-direction states. Unusual on the request path, but they occur
    /// when a client re-uses a UDP socket for several queries.
    pub(crate) fn is_reply(self) -> bool {
        matches!(self, ConnState::EstablishedReply | ConnState::RelatedReply)
    }

    pub(crate) fn is_tracked(self) -> bool {
        self != ConnState::Unknown
    }
}

/// Per-packet verdict returned to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Accept,
    Drop,
}

impl From<Verdict> for nfq::Verdict {
    fn from(verdict: Verdict) -> nfq::Verdict {
        match verdict {
            Verdict::Accept => nfq::Verdict::Accept,
            Verdict::Drop => nfq::Verdict::Drop,
        }
    }
}

/// What a handler sees of a delivered packet.
pub(crate) struct QueuedPacket {
    /// Conntrack state, if the kernel attached one.
    pub state: Option<ConnState>,
    /// Raw L3 payload.
    pub payload: Vec<u8>,
}

/// Per-queue decision callback.
///
/// `decide` returns the verdict for a packet, or `None` to leave the packet
/// without one (the kernel re-delivers or times it out). `verdict_failed`
/// runs when a decided verdict could not be delivered to the kernel, so a
/// handler can retract state it recorded before accepting.
#[async_trait]
pub(crate) trait PacketHandler: Send + Sync + 'static {
    async fn decide(&self, packet: &QueuedPacket) -> Option<Verdict>;

    async fn verdict_failed(&self, _packet: &QueuedPacket, _verdict: Verdict) {}
}

/// Owns one kernel packet queue and feeds its packets to a handler.
pub(crate) struct QueueWorker<H> {
    queue: Queue,
    num: u16,
    handler: H,
    ready: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
}

impl<H: PacketHandler> QueueWorker<H> {
    pub(crate) fn open(
        num: u16,
        handler: H,
        ready: watch::Receiver<bool>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, Error> {
        let open_err = |source| Error::OpenQueue { queue: num, source };

        let mut queue = Queue::open().map_err(open_err)?;
        queue.bind(num).map_err(open_err)?;
        queue.set_queue_max_len(num, QUEUE_MAX_LEN).map_err(open_err)?;
        queue.set_recv_conntrack(num, true).map_err(open_err)?;
        queue.set_nonblocking(true);

        Ok(Self {
            queue,
            num,
            handler,
            ready,
            shutdown,
        })
    }

    pub(crate) async fn run(mut self) {
        // Hold off delivering packets until the owning filter is fully
        // wired; the kernel buffers what arrives in the meantime.
        let stopped_before_ready = tokio::select! {
            _ = self.shutdown.wait_for(|stop| *stop) => true,
            res = self.ready.wait_for(|ready| *ready) => res.is_err(),
        };
        if stopped_before_ready {
            self.unbind();
            return;
        }

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let message = match self.queue.recv() {
                Ok(message) => message,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    let stopped = tokio::select! {
                        _ = tokio::time::sleep(RECV_POLL_INTERVAL) => false,
                        _ = self.shutdown.wait_for(|stop| *stop) => true,
                    };
                    if stopped {
                        break;
                    }
                    continue;
                }
                Err(err) => {
                    // The socket goes away under us during teardown; that
                    // noise is expected and not worth reporting.
                    if *self.shutdown.borrow() {
                        break;
                    }
                    tracing::error!(queue = self.num, "failed to read from queue: {err}");
                    tokio::time::sleep(RECV_POLL_INTERVAL).await;
                    continue;
                }
            };

            self.deliver(message).await;
        }

        self.unbind();
    }

    async fn deliver(&mut self, mut message: nfq::Message) {
        let packet = QueuedPacket {
            state: conn_state(&message),
            payload: message.get_payload().to_vec(),
        };

        let Some(verdict) = self.handler.decide(&packet).await else {
            return;
        };

        message.set_verdict(verdict.into());
        if let Err(err) = self.queue.verdict(message) {
            tracing::error!(queue = self.num, "failed to deliver verdict: {err}");
            self.handler.verdict_failed(&packet, verdict).await;
        }
    }

    fn unbind(&mut self) {
        if let Err(err) = self.queue.unbind(self.num) {
            tracing::debug!(queue = self.num, "failed to unbind queue: {err}");
        }
    }
}

fn conn_state(message: &nfq::Message) -> Option<ConnState> {
    let ct = message.get_conntrack()?;
    use nfq::conntrack::State;
    Some(match ct.get_state() {
        State::Established => ConnState::Established,
        State::Related => ConnState::Related,
        State::New => ConnState::New,
        State::EstablishedReply => ConnState::EstablishedReply,
        State::RelatedReply => ConnState::RelatedReply,
        _ => ConnState::Unknown,
    })
}
