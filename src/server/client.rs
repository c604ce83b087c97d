use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::dedup::{CachedResponse, DedupCache};
use super::transport::Transport;
use crate::protocol::{
    Command, Envelope, ErrorCode, KvError, KvRequest, KvResponse, KvResult, RequestId, encode_response,
};

#[derive(Debug, Clone, Copy)]
pub struct ClientSettings {
    pub initial_timeout: Duration,
    pub max_retries: u32,
    pub overload_wait_ms: u32,
}

struct InFlightCall {
    bytes: Vec<u8>,
    dest: SocketAddr,
    remaining: Duration,
    retries: u32,
    origin: Option<SocketAddr>,
    notify: Option<oneshot::Sender<KvResponse>>,
}

enum Outbound {
    Resend(Vec<u8>, SocketAddr),
    GiveUp(RequestId, Option<SocketAddr>),
}

/// Timeout after `retries` doublings of `initial`, saturating instead of overflowing.
pub(crate) fn backoff(initial: Duration, retries: u32) -> Duration {
    2u32.checked_pow(retries)
        .and_then(|factor| initial.checked_mul(factor))
        .unwrap_or(Duration::MAX)
}

/// At-most-once request sender with exponential backoff.
///
/// All outstanding calls share one timer table driven by a periodic `tick`. A call is
/// resent with a doubled timeout until the retry ceiling is reached; then it is dropped
/// and, if it was made on behalf of another requester, that requester receives an
/// overload response instead.
pub struct RetryingClient {
    issuer: SocketAddr,
    transport: Arc<dyn Transport>,
    cache: Arc<DedupCache>,
    settings: ClientSettings,
    calls: Mutex<HashMap<RequestId, InFlightCall>>,
    last_tick: Mutex<Instant>,
}

impl RetryingClient {
    /// `issuer` is the node address embedded in generated request ids.
    pub fn new(
        issuer: SocketAddr,
        transport: Arc<dyn Transport>,
        cache: Arc<DedupCache>,
        settings: ClientSettings,
    ) -> Self {
        Self {
            issuer,
            transport,
            cache,
            settings,
            calls: Mutex::new(HashMap::new()),
            last_tick: Mutex::new(Instant::now()),
        }
    }

    pub fn next_request_id(&self) -> RequestId {
        RequestId::generate(self.issuer)
    }

    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }

    /// Sends `request` under a fresh id with no caller waiting on the answer.
    pub fn send(&self, request: &KvRequest, dest: SocketAddr) -> KvResult<RequestId> {
        let id = self.next_request_id();
        let bytes = Envelope::new(id, request.encode()?).encode()?;
        self.dispatch(id, bytes, dest, None, None);
        Ok(id)
    }

    /// Re-sends an envelope under its existing id on behalf of `origin`.
    pub fn forward(&self, envelope: &Envelope, dest: SocketAddr, origin: SocketAddr) -> KvResult<()> {
        let bytes = envelope.encode()?;
        self.dispatch(envelope.id, bytes, dest, Some(origin), None);
        Ok(())
    }

    /// Sends IS_ALIVE to `dest`. The receiver resolves with the reply, or is dropped
    /// if the call gives up.
    pub fn check_alive(&self, dest: SocketAddr) -> KvResult<oneshot::Receiver<KvResponse>> {
        let (tx, rx) = oneshot::channel();
        let id = self.next_request_id();
        let bytes = Envelope::new(id, KvRequest::new(Command::IsAlive).encode()?).encode()?;
        self.dispatch(id, bytes, dest, None, Some(tx));
        Ok(rx)
    }

    fn dispatch(
        &self,
        id: RequestId,
        bytes: Vec<u8>,
        dest: SocketAddr,
        origin: Option<SocketAddr>,
        notify: Option<oneshot::Sender<KvResponse>>,
    ) {
        self.calls.lock().insert(
            id,
            InFlightCall {
                bytes: bytes.clone(),
                dest,
                remaining: self.settings.initial_timeout,
                retries: 0,
                origin,
                notify,
            },
        );
        self.transport.send(&bytes, dest);
    }

    /// Handles a datagram arriving on the client socket.
    pub fn on_datagram(&self, bytes: &[u8]) {
        let envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Dropping malformed response: {}", e);
                return;
            }
        };
        let Some(call) = self.calls.lock().remove(&envelope.id) else {
            tracing::trace!(id = %envelope.id, "Response for unknown or finished call");
            return;
        };

        let response = match KvResponse::decode(&envelope.payload) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(id = %envelope.id, "Malformed response payload: {}", e);
                if call.origin.is_some() {
                    self.cache.release(&envelope.id);
                }
                return;
            }
        };

        if call.origin.is_some() {
            if response.err_code == ErrorCode::SystemOverload {
                // Overloads are transient; a retry of this id is served afresh.
                self.cache.release(&envelope.id);
            } else if let Err(e) = self.cache.complete(envelope.id, CachedResponse::Encoded(bytes.to_vec())) {
                tracing::warn!(id = %envelope.id, "Could not cache forwarded response: {}", e);
            }
        }

        if let Some(notify) = call.notify {
            let _ = notify.send(response);
        }
    }

    /// Advances every call's timer by the time since the previous tick.
    pub fn tick(&self) {
        let elapsed = {
            let mut last = self.last_tick.lock();
            let now = Instant::now();
            let elapsed = now - *last;
            *last = now;
            elapsed
        };
        self.advance(elapsed);
    }

    fn advance(&self, elapsed: Duration) {
        let mut outbound = Vec::new();
        {
            let mut calls = self.calls.lock();
            let mut expired = Vec::new();
            for (id, call) in calls.iter_mut() {
                if call.remaining > elapsed {
                    call.remaining -= elapsed;
                    continue;
                }
                if call.retries < self.settings.max_retries {
                    let overshoot = elapsed - call.remaining;
                    call.retries += 1;
                    let timeout = backoff(self.settings.initial_timeout, call.retries);
                    call.remaining = timeout.saturating_sub(overshoot);
                    outbound.push(Outbound::Resend(call.bytes.clone(), call.dest));
                } else {
                    expired.push(*id);
                }
            }
            for id in expired {
                if let Some(call) = calls.remove(&id) {
                    tracing::debug!(%id, dest = %call.dest, "Giving up on request");
                    outbound.push(Outbound::GiveUp(id, call.origin));
                }
            }
        }

        for action in outbound {
            match action {
                Outbound::Resend(bytes, dest) => self.transport.send(&bytes, dest),
                Outbound::GiveUp(id, Some(origin)) => self.reject(id, origin),
                Outbound::GiveUp(_, None) => {}
            }
        }
    }

    fn reject(&self, id: RequestId, origin: SocketAddr) {
        let failure = KvError::DeliveryFailed {
            attempts: self.settings.max_retries.saturating_add(1),
        };
        tracing::debug!(%id, %origin, "{}", failure);
        let response = KvResponse::from_error(&failure, self.settings.overload_wait_ms);
        match encode_response(id, &response) {
            Ok(bytes) => {
                self.transport.send(&bytes, origin);
                if let Err(e) = self.cache.complete(id, CachedResponse::Encoded(bytes)) {
                    tracing::warn!(%id, "Could not cache overload response: {}", e);
                }
            }
            Err(e) => tracing::error!(%id, "Failed to encode overload response: {}", e),
        }
    }

    /// Drives `tick` at the initial timeout period.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            let period = client.settings.initial_timeout.max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                client.tick();
            }
        })
    }
}
