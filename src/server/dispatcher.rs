use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;

use super::client::RetryingClient;
use super::dedup::{CacheSlot, CachedResponse, DedupCache};
use super::transport::Transport;
use crate::distribution::Migrator;
use crate::membership::GossipFailureDetector;
use crate::protocol::{
    Command, Envelope, KvError, KvRequest, KvResponse, KvResult, RequestId, encode_response,
    validate_empty_value, validate_key, validate_value,
};
use crate::ring::{HashRing, NodeDirectory, NodeId, VirtualNode};
use crate::storage::{ReplicatedStore, StoredEntry};

#[derive(Debug, Clone, Copy)]
pub struct DispatcherSettings {
    pub replication_factor: usize,
    pub overload_wait_ms: u32,
}

/// What became of one request.
enum Outcome {
    Reply {
        response: KvResponse,
        cached: Option<CachedResponse>,
    },
    /// Handed to the key's owner, which answers the requester itself.
    Forwarded,
    Shutdown,
}

impl Outcome {
    fn success() -> Self {
        Outcome::Reply {
            response: KvResponse::success(),
            cached: Some(CachedResponse::Success),
        }
    }

    fn encoded(response: KvResponse) -> Self {
        Outcome::Reply {
            response,
            cached: None,
        }
    }
}

/// Entry point for every datagram arriving on the service socket.
///
/// Dispatch never waits on the network: forwards and replica pushes are handed to
/// the retrying client and the dispatcher moves on.
pub struct RequestDispatcher {
    self_id: NodeId,
    settings: DispatcherSettings,
    transport: Arc<dyn Transport>,
    cache: Arc<DedupCache>,
    ring: Arc<HashRing>,
    directory: Arc<NodeDirectory>,
    store: Arc<ReplicatedStore>,
    client: Arc<RetryingClient>,
    migrator: Arc<Migrator>,
    detector: Arc<GossipFailureDetector>,
    shutdown: watch::Sender<bool>,
}

impl RequestDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_id: NodeId,
        settings: DispatcherSettings,
        transport: Arc<dyn Transport>,
        cache: Arc<DedupCache>,
        ring: Arc<HashRing>,
        directory: Arc<NodeDirectory>,
        store: Arc<ReplicatedStore>,
        client: Arc<RetryingClient>,
        migrator: Arc<Migrator>,
        detector: Arc<GossipFailureDetector>,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        Self {
            self_id,
            settings,
            transport,
            cache,
            ring,
            directory,
            store,
            client,
            migrator,
            detector,
            shutdown,
        }
    }

    pub fn on_datagram(&self, bytes: &[u8], from: SocketAddr) {
        let envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(%from, "Dropping malformed datagram: {}", e);
                return;
            }
        };
        let id = envelope.id;

        match self.cache.lookup(&id) {
            Some(CacheSlot::InFlight) => {
                tracing::trace!(%id, "Duplicate of in-flight request dropped");
                return;
            }
            Some(CacheSlot::Done(cached)) => {
                match cached.to_bytes(id) {
                    Ok(reply) => self.transport.send(&reply, from),
                    Err(e) => tracing::error!(%id, "Failed to rebuild cached response: {}", e),
                }
                return;
            }
            None => {}
        }

        match self.cache.claim(id) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                tracing::debug!(%id, "Request cache full: {}", e);
                self.send_uncached(id, &KvResponse::from_error(&e, self.settings.overload_wait_ms), from, None);
                return;
            }
        }

        let request = match KvRequest::decode(&envelope.payload) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(%id, %from, "Undecodable request payload: {}", e);
                self.finish(id, Outcome::encoded(KvResponse::from_error(&e, 0)), from, None);
                return;
            }
        };

        match self.execute(&envelope, &request, from) {
            Ok(outcome) => self.finish(id, outcome, from, request.reply_to),
            Err(e) if e.is_transient() => {
                tracing::debug!(%id, "Transient routing condition: {}", e);
                self.cache.release(&id);
                let response = KvResponse::from_error(&e, self.settings.overload_wait_ms);
                self.send_uncached(id, &response, from, request.reply_to);
            }
            Err(e) => {
                if matches!(e, KvError::Internal(_) | KvError::Codec(_)) {
                    tracing::error!(%id, "Request failed: {}", e);
                }
                let response = KvResponse::from_error(&e, self.settings.overload_wait_ms);
                self.finish(id, Outcome::encoded(response), from, request.reply_to);
            }
        }
    }

    fn execute(&self, envelope: &Envelope, request: &KvRequest, from: SocketAddr) -> KvResult<Outcome> {
        match request.command()? {
            Command::Put => self.handle_put(envelope, request, from),
            Command::Get => self.handle_get(envelope, request, from),
            Command::Remove => self.handle_remove(envelope, request, from),
            Command::Shutdown => self.handle_shutdown(),
            Command::Wipeout => self.handle_wipeout(),
            Command::IsAlive => Ok(Outcome::success()),
            Command::GetPid => Ok(Outcome::encoded(KvResponse::with_pid(std::process::id()))),
            Command::GetMembershipCount => Ok(Outcome::encoded(KvResponse::with_membership_count(
                self.detector.alive_members() as u32,
            ))),
        }
    }

    // ==== keyed commands ====

    fn handle_put(&self, envelope: &Envelope, request: &KvRequest, from: SocketAddr) -> KvResult<Outcome> {
        validate_key(&request.key)?;
        validate_value(&request.value)?;

        if request.is_replica {
            self.store.put(
                &request.key,
                request.value.clone(),
                request.version,
                request.vector_clock.clone(),
            )?;
            return Ok(Outcome::success());
        }

        let vnode = self.ring.owning_vnode(&request.key).ok_or(KvError::NoOwner)?;
        if vnode.owner != self.self_id {
            return self.forward(envelope, request, vnode.owner, from);
        }

        let entry = self.store.put(
            &request.key,
            request.value.clone(),
            request.version,
            request.vector_clock.clone(),
        )?;
        self.replicate(&request.key, &entry, &vnode);
        Ok(Outcome::success())
    }

    fn handle_get(&self, envelope: &Envelope, request: &KvRequest, from: SocketAddr) -> KvResult<Outcome> {
        validate_key(&request.key)?;
        validate_empty_value(&request.value)?;

        let owner = self.ring.owner(&request.key).ok_or(KvError::NoOwner)?;
        if owner != self.self_id {
            return self.forward_unless_migrating(envelope, request, owner, from);
        }

        let entry = self.store.get(&request.key).ok_or(KvError::NonExistentKey)?;
        Ok(Outcome::Reply {
            response: KvResponse::with_value(entry.value.clone(), entry.version),
            cached: Some(CachedResponse::Value {
                value: entry.value,
                version: entry.version,
            }),
        })
    }

    fn handle_remove(&self, envelope: &Envelope, request: &KvRequest, from: SocketAddr) -> KvResult<Outcome> {
        validate_key(&request.key)?;
        validate_empty_value(&request.value)?;

        let owner = self.ring.owner(&request.key).ok_or(KvError::NoOwner)?;
        if owner != self.self_id {
            return self.forward_unless_migrating(envelope, request, owner, from);
        }

        if self.store.remove(&request.key) {
            Ok(Outcome::success())
        } else {
            Err(KvError::NonExistentKey)
        }
    }

    fn forward_unless_migrating(
        &self,
        envelope: &Envelope,
        request: &KvRequest,
        owner: NodeId,
        from: SocketAddr,
    ) -> KvResult<Outcome> {
        if self.migrator.is_migrating(owner) {
            return Err(KvError::MigrationInProgress(owner));
        }
        self.forward(envelope, request, owner, from)
    }

    /// Sends the request to its owner under the same id. The owner replies to
    /// `reply_to`, which names the first requester on the path.
    fn forward(&self, envelope: &Envelope, request: &KvRequest, owner: NodeId, from: SocketAddr) -> KvResult<Outcome> {
        let route = self.directory.route(owner).ok_or(KvError::NoRoute(owner))?;
        let mut forwarded = request.clone();
        let requester = *forwarded.reply_to.get_or_insert(from);
        let outbound = Envelope::new(envelope.id, forwarded.encode()?);

        tracing::trace!(id = %envelope.id, %owner, "Forwarding to owner");
        self.client.forward(&outbound, route.service_addr(), requester)?;
        Ok(Outcome::Forwarded)
    }

    fn replicate(&self, key: &[u8], entry: &StoredEntry, vnode: &VirtualNode) {
        let hops = self.settings.replication_factor.saturating_sub(1);
        if hops == 0 {
            return;
        }
        let request = KvRequest::transfer(key, &entry.value, entry.version, entry.clock.clone(), true);
        for successor in self.ring.successors(vnode, hops) {
            let Some(route) = self.directory.route(successor) else {
                tracing::warn!(node = %successor, "No route to replica holder");
                continue;
            };
            if let Err(e) = self.client.send(&request, route.service_addr()) {
                tracing::warn!(node = %successor, "Failed to enqueue replica: {}", e);
            }
        }
    }

    // ==== node commands ====

    fn handle_shutdown(&self) -> KvResult<Outcome> {
        tracing::info!("Shutdown requested");
        let _ = self.shutdown.send(true);
        Ok(Outcome::Shutdown)
    }

    fn handle_wipeout(&self) -> KvResult<Outcome> {
        if self.migrator.is_migrating_any() {
            return Err(KvError::MigrationInProgress(self.self_id));
        }
        self.store.remove_all();
        tracing::info!("Store wiped");
        Ok(Outcome::success())
    }

    // ==== responses ====

    fn finish(&self, id: RequestId, outcome: Outcome, from: SocketAddr, reply_to: Option<SocketAddr>) {
        let (response, cached) = match outcome {
            Outcome::Reply { response, cached } => (response, cached),
            Outcome::Forwarded | Outcome::Shutdown => return,
        };
        let bytes = match encode_response(id, &response) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(%id, "Failed to encode response: {}", e);
                self.cache.release(&id);
                return;
            }
        };

        let cached = cached.unwrap_or_else(|| CachedResponse::Encoded(bytes.clone()));
        if let Err(e) = self.cache.complete(id, cached) {
            tracing::warn!(%id, "Response not cached: {}", e);
        }
        self.deliver(&bytes, from, reply_to);
    }

    fn send_uncached(&self, id: RequestId, response: &KvResponse, from: SocketAddr, reply_to: Option<SocketAddr>) {
        match encode_response(id, response) {
            Ok(bytes) => self.deliver(&bytes, from, reply_to),
            Err(e) => tracing::error!(%id, "Failed to encode response: {}", e),
        }
    }

    fn deliver(&self, bytes: &[u8], from: SocketAddr, reply_to: Option<SocketAddr>) {
        self.transport.send(bytes, from);
        if let Some(secondary) = reply_to
            && secondary != from
        {
            self.transport.send(bytes, secondary);
        }
    }
}
