use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::info;

use super::types::{
    DigestEntry, GossipMessage, MembershipEvent, MembershipListener, NodeStatus, SystemImage,
    counter_is_newer,
};
use crate::protocol::{KvError, KvResult};
use crate::ring::NodeAddress;
use crate::server::transport::Transport;

#[derive(Debug, Clone, Copy)]
pub struct GossipSettings {
    pub interval: Duration,
    /// Rounds without news after which a node counts as stale.
    pub failure_mark: u32,
    /// Confirmations a removed node needs beyond this before it rejoins.
    pub alive_round_limit: u32,
}

struct DetectorState {
    /// Indexed by node index; `None` until the node is first heard from.
    images: Vec<Option<SystemImage>>,
    alive_members: usize,
    local_clock: u64,
    self_counter: u64,
}

/// Gossip-based failure detector over a static, sorted node table.
///
/// Send, receive and sweep paths share one lock over the `SystemImage` arena.
/// Join/Leave events are collected under the lock and delivered to the listener
/// after it has been released.
pub struct GossipFailureDetector {
    self_index: usize,
    members: Vec<NodeAddress>,
    settings: GossipSettings,
    transport: Arc<dyn Transport>,
    listener: Arc<dyn MembershipListener>,
    state: Mutex<DetectorState>,
}

impl GossipFailureDetector {
    /// `members` is the full sorted node table and must contain `local`.
    pub fn new(
        local: NodeAddress,
        members: Vec<NodeAddress>,
        settings: GossipSettings,
        transport: Arc<dyn Transport>,
        listener: Arc<dyn MembershipListener>,
    ) -> KvResult<Self> {
        let self_index = members
            .iter()
            .position(|m| m.id == local.id)
            .ok_or_else(|| KvError::InvalidAddress(local.to_string()))?;

        let self_counter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        let mut images = vec![None; members.len()];
        images[self_index] = Some(SystemImage::new(0, self_counter));

        Ok(Self {
            self_index,
            members,
            settings,
            transport,
            listener,
            state: Mutex::new(DetectorState {
                images,
                alive_members: 1,
                local_clock: 0,
                self_counter,
            }),
        })
    }

    pub fn self_index(&self) -> usize {
        self.self_index
    }

    pub fn members(&self) -> &[NodeAddress] {
        &self.members
    }

    /// Nodes currently believed alive, self included.
    pub fn alive_members(&self) -> usize {
        self.state.lock().alive_members
    }

    pub fn image(&self, node_index: usize) -> Option<SystemImage> {
        self.state.lock().images.get(node_index).copied().flatten()
    }

    pub fn status(&self, node_index: usize) -> Option<NodeStatus> {
        self.image(node_index).map(|image| image.status(self.removal_round()))
    }

    fn removal_round(&self) -> u32 {
        (self.settings.failure_mark / 2).max(1)
    }

    /// One gossip period: advertise, sweep for failures, advance the local clock.
    pub fn run_round(&self) {
        let (outgoing, events) = {
            let mut state = self.state.lock();
            state.self_counter = state.self_counter.wrapping_add(1);
            let outgoing = self.pick_target(&state).map(|target| (target, self.digest(&state)));
            let events = self.sweep(&mut state);
            state.local_clock += 1;
            (outgoing, events)
        };

        if let Some((target, message)) = outgoing {
            match bincode::serialize(&message) {
                Ok(bytes) => {
                    self.transport.send(&bytes, target);
                    tracing::trace!(%target, "Sent gossip digest");
                }
                Err(e) => tracing::error!("Failed to serialize gossip digest: {}", e),
            }
        }
        self.deliver(events);
    }

    /// Random peer that is not known to have failed. Peers never heard from count.
    fn pick_target(&self, state: &DetectorState) -> Option<SocketAddr> {
        let candidates: Vec<usize> = state
            .images
            .iter()
            .enumerate()
            .filter(|(index, image)| {
                *index != self.self_index && image.is_none_or(|img| img.failed_rounds == 0)
            })
            .map(|(index, _)| index)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let pick = candidates[rand::thread_rng().gen_range(0..candidates.len())];
        Some(self.members[pick].gossip_addr())
    }

    fn digest(&self, state: &DetectorState) -> GossipMessage {
        let entries = state
            .images
            .iter()
            .enumerate()
            .filter_map(|(index, image)| {
                let image = image.as_ref()?;
                if index == self.self_index {
                    return Some(DigestEntry {
                        node_index: index as u32,
                        counter: state.self_counter,
                    });
                }
                (image.failed_rounds == 0).then_some(DigestEntry {
                    node_index: index as u32,
                    counter: image.last_peer_counter,
                })
            })
            .collect();
        GossipMessage::Digest { entries }
    }

    fn sweep(&self, state: &mut DetectorState) -> Vec<MembershipEvent> {
        let mark = self.settings.failure_mark;
        let removal = self.removal_round();
        let DetectorState {
            images,
            alive_members,
            local_clock,
            ..
        } = state;

        let mut events = Vec::new();
        for (index, slot) in images.iter_mut().enumerate() {
            if index == self.self_index {
                continue;
            }
            let Some(image) = slot.as_mut() else { continue };
            if local_clock.saturating_sub(image.local_clock) <= mark as u64 {
                continue;
            }

            if image.failed_rounds >= removal {
                image.failed_rounds = image.failed_rounds.saturating_add(1);
                // Removed: a confirmation streak that went quiet is forgotten.
                if image.alive_rounds > 0 {
                    image.flap_reset_rounds += 1;
                    if image.flap_reset_rounds > mark {
                        image.flap_reset_rounds = 0;
                        image.alive_rounds = 0;
                    }
                }
                continue;
            }

            if image.failed_rounds == 0 {
                *alive_members = alive_members.saturating_sub(1);
                info!(node = %self.members[index], "Node stopped responding");
            }
            image.failed_rounds += 1;
            if image.failed_rounds == removal {
                events.push(MembershipEvent::Leave(self.members[index]));
            }
        }
        events
    }

    /// Handles a datagram arriving on the gossip socket.
    pub fn handle_datagram(&self, bytes: &[u8], from: SocketAddr) {
        match bincode::deserialize::<GossipMessage>(bytes) {
            Ok(GossipMessage::Digest { entries }) => self.receive_digest(&entries),
            Err(e) => tracing::warn!(%from, "Ignoring malformed gossip message: {}", e),
        }
    }

    pub fn receive_digest(&self, entries: &[DigestEntry]) {
        let events = {
            let mut state = self.state.lock();
            self.merge(&mut state, entries)
        };
        self.deliver(events);
    }

    fn merge(&self, state: &mut DetectorState, entries: &[DigestEntry]) -> Vec<MembershipEvent> {
        let removal = self.removal_round();
        let limit = self.settings.alive_round_limit;
        let DetectorState {
            images,
            alive_members,
            local_clock,
            ..
        } = state;

        let mut events = Vec::new();
        for entry in entries {
            let index = entry.node_index as usize;
            if index >= self.members.len() {
                tracing::warn!(node_index = index, "Gossip entry for unknown node index");
                continue;
            }
            if index == self.self_index {
                continue;
            }
            let node = self.members[index];

            if images[index].is_none() {
                images[index] = Some(SystemImage::new(*local_clock, entry.counter));
                *alive_members += 1;
                events.push(MembershipEvent::Join(node));
                continue;
            }
            let Some(image) = images[index].as_mut() else {
                continue;
            };
            if !counter_is_newer(entry.counter, image.last_peer_counter) {
                continue;
            }
            image.last_peer_counter = entry.counter;
            image.local_clock = *local_clock;

            match image.status(removal) {
                NodeStatus::Alive => {}
                NodeStatus::Suspected => {
                    image.failed_rounds = 0;
                    *alive_members += 1;
                    info!(%node, "Suspected node is responding again");
                }
                NodeStatus::Removed => {
                    image.alive_rounds += 1;
                    if image.alive_rounds > limit {
                        image.failed_rounds = 0;
                        image.alive_rounds = 0;
                        image.flap_reset_rounds = 0;
                        *alive_members += 1;
                        events.push(MembershipEvent::Join(node));
                    }
                }
            }
        }
        events
    }

    fn deliver(&self, events: Vec<MembershipEvent>) {
        for event in events {
            match event {
                MembershipEvent::Join(node) => {
                    info!(%node, id = %node.id, "Node joined");
                    self.listener.on_join(&node);
                }
                MembershipEvent::Leave(node) => {
                    info!(%node, id = %node.id, "Node removed from ring");
                    self.listener.on_leave(&node);
                }
            }
        }
    }

    /// Runs `run_round` every gossip interval, starting one interval from now.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let detector = self.clone();
        tokio::spawn(async move {
            let period = detector.settings.interval.max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                detector.run_round();
            }
        })
    }
}
