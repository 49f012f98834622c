//! meshsubd node - main service loop
//!
//! One task per node owns the replicas, the gossip state and membership, and
//! reacts to three sources with `tokio::select!`: local commands, transport
//! events and the gossip ticker. Everything else talks to it through the
//! cloneable [`PubSub`] handle.

use crate::config::NodeSettings;
use crate::coordinator::{self, Command, Coordinator, Registry};
use crate::error::Result;
use crate::gossip::{GossipDelta, GossipManager, GossipStatus};
use crate::membership::{MembershipEvent, MembershipManager};
use crate::publisher::{deliver_local, DeliverMessage, DistributedPub, RoutingView};
use crate::pubsub::{DistributedAcks, DistributedSub};
use crate::subscriber::{self, Inbox, SubscriberRef};
use meshsub_core::{NodeId, PublisherId, SubscriberId};
use meshsub_net::{Frame, FrameType, Transport, TransportEvent};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// State shared by every handle of a node
pub(crate) struct Shared {
    pub(crate) node: NodeId,
    pub(crate) settings: NodeSettings,
    pub(crate) commands: mpsc::UnboundedSender<Command>,
    pub(crate) view: watch::Receiver<Arc<RoutingView>>,
    pub(crate) registry: Registry,
    pub(crate) transport: Arc<dyn Transport>,
    next_local: AtomicU64,
    shutdown: broadcast::Sender<()>,
}

/// Node statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStats {
    pub node: String,
    pub name: String,
    pub topics: usize,
    pub subscribers: usize,
    pub local_subscribers: usize,
    pub labels: usize,
    pub origins: usize,
    pub peers_up: usize,
    pub peers_unreachable: usize,
    /// Peers whose last send failed
    pub peers_failing: usize,
    pub members_removed: usize,
    pub gossip_rounds: u64,
    /// Hex digest of the replicated state; equal across converged nodes
    pub digest: String,
}

/// A running pub/sub node
pub struct Node {
    pubsub: PubSub,
    task: Option<JoinHandle<()>>,
}

impl Node {
    /// Start the node's event loop over `transport`
    pub fn spawn(
        settings: NodeSettings,
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        let node = transport.local_id();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(Arc::new(RoutingView::default()));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let registry: Registry = Arc::default();

        let coordinator = Coordinator::new(
            node,
            &settings,
            registry.clone(),
            commands_tx.clone(),
            shutdown_tx.clone(),
            view_tx,
        );
        let node_loop = NodeLoop {
            membership: MembershipManager::new(node, settings.removal_margin),
            gossip: GossipManager::new(),
            coordinator,
            settings: settings.clone(),
            transport: transport.clone(),
            registry: registry.clone(),
            commands: commands_rx,
            events,
            shutdown: shutdown_rx,
        };

        info!("Starting node {} ({})", settings.name, node);
        let task = tokio::spawn(node_loop.run());

        Self {
            pubsub: PubSub {
                shared: Arc::new(Shared {
                    node,
                    settings,
                    commands: commands_tx,
                    view: view_rx,
                    registry,
                    transport,
                    next_local: AtomicU64::new(1),
                    shutdown: shutdown_tx,
                }),
            },
            task: Some(task),
        }
    }

    pub fn id(&self) -> NodeId {
        self.pubsub.id()
    }

    pub fn pubsub(&self) -> PubSub {
        self.pubsub.clone()
    }

    /// Stop the event loop and wait for it to finish
    pub async fn shutdown(mut self) {
        let _ = self.pubsub.shared.shutdown.send(());
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Node task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let _ = self.pubsub.shared.shutdown.send(());
    }
}

/// Cloneable handle on a node
#[derive(Clone)]
pub struct PubSub {
    shared: Arc<Shared>,
}

impl PubSub {
    pub fn id(&self) -> NodeId {
        self.shared.node
    }

    /// Create a subscriber hosted on this node. Dropping the inbox terminates
    /// it.
    pub fn new_subscriber(&self) -> (SubscriberRef, Inbox) {
        subscriber::channel(SubscriberId::new(self.shared.node, self.next_local()))
    }

    pub fn publisher(&self) -> DistributedPub {
        let id = PublisherId {
            node: self.shared.node,
            local: self.next_local(),
        };
        DistributedPub::new(id, self.shared.clone())
    }

    pub fn sub(&self) -> DistributedSub {
        DistributedSub::new(self.shared.clone())
    }

    pub fn acks(&self) -> DistributedAcks {
        DistributedAcks::new(self.shared.clone())
    }

    /// Subscribers of `topic` known to this node, regardless of filters
    pub fn get_subscribers(&self, topic: &str) -> Vec<SubscriberId> {
        self.shared.view.borrow().subscribers(topic)
    }

    pub async fn stats(&self) -> Result<NodeStats> {
        coordinator::request(&self.shared.commands, self.shared.settings.request_timeout, Command::Stats).await
    }

    /// Declare a node removed without waiting for the removal margin
    pub fn remove_member(&self, node: NodeId) -> Result<()> {
        self.shared
            .commands
            .send(Command::RemoveMember(node))
            .map_err(|_| crate::error::PubSubError::NodeStopped)
    }

    fn next_local(&self) -> u64 {
        self.shared.next_local.fetch_add(1, Ordering::Relaxed)
    }
}

struct NodeLoop {
    settings: NodeSettings,
    transport: Arc<dyn Transport>,
    registry: Registry,
    coordinator: Coordinator,
    gossip: GossipManager,
    membership: MembershipManager,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    shutdown: broadcast::Receiver<()>,
}

impl NodeLoop {
    async fn run(mut self) {
        let mut ticker = interval(self.settings.gossip_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(command) = self.commands.recv() => self.handle_command(command),
                Some(event) = self.events.recv() => self.handle_event(event),
                _ = ticker.tick() => self.gossip_round(),
                _ = self.shutdown.recv() => {
                    info!("Shutting down node {}", self.settings.name);
                    break;
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::RemoveMember(node) => {
                if let Some(event) = self.membership.remove(node) {
                    self.handle_membership(event);
                }
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            other => self.coordinator.handle(other),
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        let membership_event = match event {
            TransportEvent::PeerConnected(info) => self.membership.peer_up(info.id, &info.name),
            TransportEvent::PeerDisconnected(id) => self.membership.peer_unreachable(id),
            TransportEvent::FrameReceived { from, frame } => {
                self.handle_frame(from, frame);
                None
            }
        };
        if let Some(event) = membership_event {
            self.handle_membership(event);
        }
    }

    fn handle_membership(&mut self, event: MembershipEvent) {
        match event {
            MembershipEvent::Up(peer) => {
                self.gossip.register_peer(peer);
                self.send_status(peer);
            }
            MembershipEvent::Unreachable(peer) => self.gossip.unregister_peer(&peer),
            MembershipEvent::Removed(peer) => {
                self.gossip.unregister_peer(&peer);
                self.coordinator.purge_origin(peer);
            }
        }
    }

    fn handle_frame(&mut self, from: NodeId, frame: Frame) {
        if !self.membership.is_up(&from) {
            debug!("Dropping {:?} frame from non-member {}", frame.frame_type, from);
            return;
        }
        match frame.frame_type {
            FrameType::GossipStatus => {
                let status: GossipStatus = match frame.decode() {
                    Ok(status) => status,
                    Err(e) => {
                        warn!("Bad gossip status from {}: {}", from, e);
                        return;
                    }
                };
                for event in self.membership.merge_removed(&status.removed) {
                    self.handle_membership(event);
                }
                let (delta, behind) = self.gossip.answer_status(
                    from,
                    &status,
                    self.coordinator.topics(),
                    self.coordinator.labels(),
                );
                if !delta.is_empty() {
                    self.send_delta(from, &delta);
                }
                if behind || self.membership.knows_more_removals(&status.removed) {
                    self.send_status(from);
                }
            }
            FrameType::GossipDelta => match frame.decode::<GossipDelta>() {
                Ok(delta) => {
                    if self.coordinator.apply_delta(from, delta) {
                        // a losing declaration settles only after every peer was asked
                        for peer in self.gossip.peers() {
                            self.send_status(peer);
                        }
                    }
                }
                Err(e) => warn!("Bad gossip delta from {}: {}", from, e),
            },
            FrameType::Deliver => match frame.decode::<DeliverMessage>() {
                Ok(msg) => {
                    let reached = deliver_local(&self.registry, &msg.recipients, Arc::new(msg.envelope));
                    if reached < msg.recipients.len() {
                        debug!(
                            "{} of {} recipients from {} are gone",
                            msg.recipients.len() - reached,
                            msg.recipients.len(),
                            from
                        );
                    }
                }
                Err(e) => warn!("Bad delivery from {}: {}", from, e),
            },
            other => debug!("Ignoring {:?} frame from {}", other, from),
        }
    }

    fn gossip_round(&mut self) {
        for event in self.membership.expire() {
            self.handle_membership(event);
        }

        if let Some(delta) = self
            .gossip
            .next_push(self.coordinator.topics(), self.coordinator.labels())
        {
            for peer in self.gossip.peers() {
                self.send_delta(peer, &delta);
            }
        }
        self.coordinator.heartbeat();

        if let Some(peer) = self.gossip.choose_peer(&mut rand::thread_rng()) {
            self.send_status(peer);
        }
    }

    fn send_status(&mut self, peer: NodeId) {
        let status = GossipStatus::of(
            self.coordinator.topics(),
            self.coordinator.labels(),
            self.membership.removed(),
        );
        match status.to_frame() {
            Ok(frame) => self.send(peer, frame),
            Err(e) => warn!("Failed to encode gossip status: {}", e),
        }
    }

    fn send_delta(&mut self, peer: NodeId, delta: &GossipDelta) {
        match delta.to_frame() {
            Ok(frame) => self.send(peer, frame),
            Err(e) => warn!("Failed to encode gossip delta: {}", e),
        }
    }

    fn send(&mut self, peer: NodeId, frame: Frame) {
        if let Err(e) = self.transport.send(peer, frame) {
            debug!("Send to {} failed: {}", peer, e);
            self.gossip.mark_failure(&peer);
        }
    }

    fn stats(&self) -> NodeStats {
        let topics = self.coordinator.topics();
        let labels = self.coordinator.labels();
        let membership = self.membership.stats();
        let gossip = self.gossip.stats();
        let mut origins = topics.replica().origins();
        origins.extend(labels.replica().origins());
        origins.sort();
        origins.dedup();
        let digest = match self.coordinator.digest() {
            Ok(digest) => hex::encode(digest),
            Err(e) => {
                warn!("Failed to digest replicas: {}", e);
                String::new()
            }
        };
        NodeStats {
            node: self.coordinator.node_id().to_string(),
            name: self.settings.name.clone(),
            topics: topics.topic_count(),
            subscribers: topics.subscriber_count(),
            local_subscribers: self.coordinator.local_subscriber_count(),
            labels: labels.label_count(),
            origins: origins.len(),
            peers_up: membership.up,
            peers_unreachable: membership.unreachable,
            peers_failing: gossip.failing_peers,
            members_removed: membership.removed,
            gossip_rounds: gossip.rounds,
            digest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshsub_net::MemoryNetwork;

    fn node(b: u8) -> NodeId {
        NodeId([b; 32])
    }

    #[tokio::test]
    async fn test_node_start_and_stats() {
        let network = MemoryNetwork::new();
        let (transport, events) = network.join(node(1), "a");
        let n = Node::spawn(NodeSettings::default(), Arc::new(transport), events);
        let pubsub = n.pubsub();

        let stats = pubsub.stats().await.unwrap();
        assert_eq!(stats.subscribers, 0);
        assert_eq!(stats.peers_up, 0);
        assert_eq!(stats.node, node(1).to_string());
        assert_eq!(stats.digest.len(), 64);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["name"], "meshsub");

        n.shutdown().await;
        assert!(matches!(
            pubsub.stats().await,
            Err(crate::error::PubSubError::NodeStopped)
        ));
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let network = MemoryNetwork::new();
        let (transport, events) = network.join(node(1), "a");
        let n = Node::spawn(NodeSettings::default(), Arc::new(transport), events);
        let pubsub = n.pubsub();
        let (a, _ia) = pubsub.new_subscriber();
        let (b, _ib) = pubsub.new_subscriber();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id().node, node(1));
        assert_ne!(pubsub.publisher().id(), pubsub.publisher().id());
    }
}
