//! Local update coordinator
//!
//! The only writer of this node's replicas. Subscription and declaration
//! requests arrive as [`Command`]s on the node's queue and are applied one at
//! a time, which serializes the label check-and-set without a lock. After
//! every change the coordinator republishes the [`RoutingView`] publishers
//! read and pushes label snapshots to registered receivers.
//!
//! A local declaration that starts losing a label is not withdrawn at once.
//! It becomes a suspect, the node asks every peer for what it lacks, and the
//! declaration is withdrawn only if it still loses after [`SETTLE_ROUNDS`]
//! gossip rounds. A smaller declaration this replica had not seen yet can
//! still reject the apparent winner in that window.

use crate::config::NodeSettings;
use crate::error::{PubSubError, Result};
use crate::gossip::GossipDelta;
use crate::label_map::{DeclaredAcks, LabelMap, LabelSet};
use crate::publisher::RoutingView;
use crate::replica::MergeOutcome;
use crate::subscriber::{Delivery, SubscriberRef};
use crate::topic_map::TopicMap;
use meshsub_core::canonical::canonical_digest;
use meshsub_core::{CategoryFilter, NodeId, SubscriberId, Topic};
use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Gossip rounds a losing local declaration waits before it is withdrawn
pub const SETTLE_ROUNDS: u64 = 2;

/// Handles of subscribers hosted on this node, shared with publishers
pub type Registry = Arc<RwLock<HashMap<SubscriberId, SubscriberRef>>>;

/// Receiver of declared-acks snapshots
pub type SnapshotSender = mpsc::UnboundedSender<Arc<DeclaredAcks>>;

/// What a [`SubAck`] acknowledges
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubRequest {
    Subscribe(BTreeSet<Topic>),
    Unsubscribe(BTreeSet<Topic>),
    Declare(LabelSet),
}

/// Acknowledgement that a request was applied to the local replica
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubAck {
    pub subscriber: SubscriberId,
    pub request: SubRequest,
    /// Local replica version after the request
    pub version: u64,
}

/// Requests handled by the node's event loop
#[derive(Debug)]
pub enum Command {
    Subscribe {
        topics: BTreeSet<Topic>,
        subscriber: SubscriberRef,
        filter: Option<CategoryFilter>,
        reply: Option<oneshot::Sender<SubAck>>,
    },
    Unsubscribe {
        topics: BTreeSet<Topic>,
        subscriber: SubscriberId,
        reply: Option<oneshot::Sender<SubAck>>,
    },
    RemoveSubscriber(SubscriberId),
    Declare {
        labels: LabelSet,
        subscriber: SubscriberRef,
        reply: oneshot::Sender<Result<SubAck>>,
    },
    RemoveDeclaration(SubscriberId),
    /// A watched subscriber's inbox was dropped
    Terminated(SubscriberId),
    ReceiveLocalDeclaredAcks(SnapshotSender),
    ReceiveDistributedDeclaredAcks(SnapshotSender),
    RemoveMember(NodeId),
    Stats(oneshot::Sender<crate::node::NodeStats>),
}

/// Send a command and wait for its reply within `timeout`
pub(crate) async fn request<T>(
    commands: &mpsc::UnboundedSender<Command>,
    timeout: Duration,
    make: impl FnOnce(oneshot::Sender<T>) -> Command,
) -> Result<T> {
    let (tx, rx) = oneshot::channel();
    commands.send(make(tx)).map_err(|_| PubSubError::NodeStopped)?;
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_)) => Err(PubSubError::NodeStopped),
        Err(_) => Err(PubSubError::Timeout(timeout)),
    }
}

pub struct Coordinator {
    node: NodeId,
    acks_enabled: bool,
    max_tombstones: usize,
    topics: TopicMap,
    labels: LabelMap,
    registry: Registry,
    /// Subscribers with a running termination watch
    watched: HashSet<SubscriberId>,
    commands: mpsc::UnboundedSender<Command>,
    shutdown: broadcast::Sender<()>,
    view: watch::Sender<Arc<RoutingView>>,
    local_receivers: Vec<SnapshotSender>,
    distributed_receivers: Vec<SnapshotSender>,
    last_distributed: Arc<DeclaredAcks>,
    /// Gossip rounds seen
    round: u64,
    /// Losing local declarations and the round they started losing
    suspects: HashMap<SubscriberId, u64>,
}

impl Coordinator {
    pub fn new(
        node: NodeId,
        settings: &NodeSettings,
        registry: Registry,
        commands: mpsc::UnboundedSender<Command>,
        shutdown: broadcast::Sender<()>,
        view: watch::Sender<Arc<RoutingView>>,
    ) -> Self {
        Self {
            node,
            acks_enabled: settings.acks_enabled,
            max_tombstones: settings.max_tombstones,
            topics: TopicMap::new(node),
            labels: LabelMap::new(node),
            registry,
            watched: HashSet::new(),
            commands,
            shutdown,
            view,
            local_receivers: Vec::new(),
            distributed_receivers: Vec::new(),
            last_distributed: Arc::new(DeclaredAcks::default()),
            round: 0,
            suspects: HashMap::new(),
        }
    }

    pub fn topics(&self) -> &TopicMap {
        &self.topics
    }

    pub fn labels(&self) -> &LabelMap {
        &self.labels
    }

    pub fn local_subscriber_count(&self) -> usize {
        self.registry.read().len()
    }

    /// Apply a local request
    pub fn handle(&mut self, command: Command) {
        match command {
            Command::Subscribe {
                topics,
                subscriber,
                filter,
                reply,
            } => {
                let id = subscriber.id();
                if id.node != self.node {
                    warn!("Ignoring subscription of {} hosted elsewhere", id);
                    return;
                }
                if !topics.is_empty() {
                    self.register(&subscriber);
                    if self.topics.subscribe(id, &topics, filter.as_ref()).is_some() {
                        self.topics_changed();
                    }
                }
                if let Some(reply) = reply {
                    let _ = reply.send(SubAck {
                        subscriber: id,
                        request: SubRequest::Subscribe(topics),
                        version: self.topics.replica().local_version(),
                    });
                }
            }
            Command::Unsubscribe {
                topics,
                subscriber,
                reply,
            } => {
                if self.topics.unsubscribe(subscriber, &topics).is_some() {
                    self.forget_if_idle(&subscriber);
                    self.topics_changed();
                }
                if let Some(reply) = reply {
                    let _ = reply.send(SubAck {
                        subscriber,
                        request: SubRequest::Unsubscribe(topics),
                        version: self.topics.replica().local_version(),
                    });
                }
            }
            Command::RemoveSubscriber(subscriber) => {
                if self.topics.remove_subscriber(&subscriber).is_some() {
                    self.forget_if_idle(&subscriber);
                    self.topics_changed();
                }
            }
            Command::Declare {
                labels,
                subscriber,
                reply,
            } => {
                let _ = reply.send(self.declare(labels, &subscriber));
            }
            Command::RemoveDeclaration(subscriber) => {
                self.suspects.remove(&subscriber);
                if self.labels.remove_declaration(&subscriber).is_some() {
                    self.forget_if_idle(&subscriber);
                    self.labels_changed();
                }
            }
            Command::Terminated(subscriber) => self.terminated(subscriber),
            Command::ReceiveLocalDeclaredAcks(receiver) => {
                if receiver.send(Arc::new(self.labels.local_snapshot())).is_ok() {
                    self.local_receivers.push(receiver);
                }
            }
            Command::ReceiveDistributedDeclaredAcks(receiver) => {
                if receiver.send(self.last_distributed.clone()).is_ok() {
                    self.distributed_receivers.push(receiver);
                }
            }
            Command::RemoveMember(_) | Command::Stats(_) => {
                debug!("Membership and stats commands belong to the node loop");
            }
        }
    }

    fn declare(&mut self, labels: LabelSet, subscriber: &SubscriberRef) -> Result<SubAck> {
        let id = subscriber.id();
        if id.node != self.node {
            return Err(PubSubError::ForeignSubscriber {
                subscriber: id,
                node: self.node,
            });
        }
        if !self.acks_enabled || labels.is_empty() {
            return Ok(SubAck {
                subscriber: id,
                request: SubRequest::Declare(labels),
                version: self.labels.replica().local_version(),
            });
        }
        if let Some((label, owner)) = self.labels.conflict(&labels, id) {
            debug!("Declaration of {} by {} rejected, owned by {}", label, id, owner);
            return Err(PubSubError::LabelNotUnique { label, owner });
        }
        self.register(subscriber);
        self.suspects.remove(&id);
        if self.labels.declare(id, labels.clone()).is_some() {
            self.labels_changed();
        }
        Ok(SubAck {
            subscriber: id,
            request: SubRequest::Declare(labels),
            version: self.labels.replica().local_version(),
        })
    }

    fn terminated(&mut self, subscriber: SubscriberId) {
        self.watched.remove(&subscriber);
        self.suspects.remove(&subscriber);
        self.registry.write().remove(&subscriber);
        let topics_removed = self.topics.remove_subscriber(&subscriber).is_some();
        let labels_removed = self.labels.remove_declaration(&subscriber).is_some();
        if topics_removed || labels_removed {
            debug!("Pruned terminated subscriber {}", subscriber);
        }
        if labels_removed {
            self.labels_changed();
        } else if topics_removed {
            self.topics_changed();
        }
    }

    /// Merge a delta received from a peer. Returns true when a local
    /// declaration started losing, in which case every peer should be asked
    /// for what this replica lacks.
    pub fn apply_delta(&mut self, from: NodeId, delta: GossipDelta) -> bool {
        let mut topics_changed = false;
        for d in delta.topics {
            let origin = d.origin;
            match self.topics.merge(d) {
                MergeOutcome::Applied => topics_changed = true,
                MergeOutcome::Gap => debug!("Topic delta of {} from {} has a gap", origin, from),
                MergeOutcome::Stale | MergeOutcome::Quarantined => {}
            }
        }
        let mut labels_changed = false;
        for d in delta.labels {
            let origin = d.origin;
            match self.labels.merge(d) {
                MergeOutcome::Applied => labels_changed = true,
                MergeOutcome::Gap => debug!("Label delta of {} from {} has a gap", origin, from),
                MergeOutcome::Stale | MergeOutcome::Quarantined => {}
            }
        }
        let mut suspected = false;
        if labels_changed {
            suspected = self.suspect_losers();
            self.labels_changed();
        } else if topics_changed {
            self.topics_changed();
        }
        suspected
    }

    /// Track local declarations that currently lose. Returns true if any
    /// started losing just now.
    fn suspect_losers(&mut self) -> bool {
        let losing: HashSet<SubscriberId> = self
            .labels
            .local_losers()
            .into_iter()
            .map(|lost| lost.subscriber)
            .collect();
        self.suspects.retain(|sub, _| losing.contains(sub));
        let mut added = false;
        for sub in losing {
            if let Entry::Vacant(entry) = self.suspects.entry(sub) {
                debug!("Declaration of {} is losing a label, settling", sub);
                entry.insert(self.round);
                added = true;
            }
        }
        added
    }

    /// Withdraw local declarations that kept losing for the settle window
    fn settle_labels(&mut self) {
        if self.suspects.is_empty() {
            return;
        }
        let losers = self.labels.local_losers();
        self.suspects
            .retain(|sub, _| losers.iter().any(|lost| lost.subscriber == *sub));

        let mut withdrawn = false;
        for lost in losers {
            match self.suspects.get(&lost.subscriber) {
                Some(since) if self.round >= since + SETTLE_ROUNDS => {}
                _ => continue,
            }
            warn!(
                "Label {} declared by {} is owned by {}; withdrawing declaration",
                lost.label, lost.subscriber, lost.owner
            );
            self.suspects.remove(&lost.subscriber);
            self.labels.remove_declaration(&lost.subscriber);
            let handle = self.registry.read().get(&lost.subscriber).cloned();
            if let Some(handle) = handle {
                handle.deliver(Delivery::LabelNotUnique {
                    label: lost.label,
                    owner: lost.owner,
                });
            }
            self.forget_if_idle(&lost.subscriber);
            withdrawn = true;
        }
        if withdrawn {
            self.labels_changed();
        }
    }

    /// Drop every entry of a removed node
    pub fn purge_origin(&mut self, origin: NodeId) {
        let topics = self.topics.purge_origin(origin);
        let labels = self.labels.purge_origin(origin);
        info!(
            "Purged {} subscribers and {} declarations of removed node {}",
            topics, labels, origin
        );
        self.labels_changed();
    }

    /// Once per gossip round: settle losing declarations and send local
    /// declared-acks receivers a snapshot
    pub fn heartbeat(&mut self) {
        self.round += 1;
        self.settle_labels();
        self.notify_local();
    }

    /// Fingerprint of the replicated state; equal on converged replicas
    pub fn digest(&self) -> Result<[u8; 32]> {
        let mut topics: Vec<_> = self.topics.replica().iter().map(|(_, k, v)| (k, v)).collect();
        topics.sort_by_key(|(k, _)| **k);
        let mut labels: Vec<_> = self.labels.replica().iter().map(|(_, k, v)| (k, v)).collect();
        labels.sort_by_key(|(k, _)| **k);
        Ok(canonical_digest(&(topics, labels))?)
    }

    fn register(&mut self, subscriber: &SubscriberRef) {
        let id = subscriber.id();
        self.registry.write().insert(id, subscriber.clone());
        if !self.watched.insert(id) {
            return;
        }
        let handle = subscriber.clone();
        let commands = self.commands.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = handle.terminated() => {
                    let _ = commands.send(Command::Terminated(handle.id()));
                }
                _ = shutdown.recv() => {}
            }
        });
    }

    fn forget_if_idle(&mut self, subscriber: &SubscriberId) {
        if !self.topics.has_local(subscriber) && !self.labels.has_local(subscriber) {
            self.registry.write().remove(subscriber);
        }
    }

    fn topics_changed(&mut self) {
        self.topics.compact(self.max_tombstones);
        self.publish_view();
    }

    fn labels_changed(&mut self) {
        self.topics.compact(self.max_tombstones);
        self.labels.compact(self.max_tombstones);
        self.publish_view();
        self.notify_local();
        self.notify_distributed();
    }

    fn publish_view(&self) {
        self.view
            .send_replace(Arc::new(RoutingView::new(&self.topics, &self.labels)));
    }

    fn notify_local(&mut self) {
        if self.local_receivers.is_empty() {
            return;
        }
        let snapshot = Arc::new(self.labels.local_snapshot());
        self.local_receivers
            .retain(|receiver| receiver.send(snapshot.clone()).is_ok());
    }

    fn notify_distributed(&mut self) {
        let snapshot = self.labels.snapshot();
        if snapshot == *self.last_distributed {
            return;
        }
        self.last_distributed = Arc::new(snapshot);
        let snapshot = self.last_distributed.clone();
        self.distributed_receivers
            .retain(|receiver| receiver.send(snapshot.clone()).is_ok());
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriber;
    use meshsub_core::AckLabel;

    fn node(b: u8) -> NodeId {
        NodeId([b; 32])
    }

    struct Fixture {
        coordinator: Coordinator,
        view: watch::Receiver<Arc<RoutingView>>,
        registry: Registry,
        _commands: mpsc::UnboundedReceiver<Command>,
    }

    fn fixture(settings: NodeSettings) -> Fixture {
        let registry: Registry = Arc::default();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(1);
        let (view_tx, view_rx) = watch::channel(Arc::new(RoutingView::default()));
        Fixture {
            coordinator: Coordinator::new(node(1), &settings, registry.clone(), commands_tx, shutdown, view_tx),
            view: view_rx,
            registry,
            _commands: commands_rx,
        }
    }

    fn topics(names: &[&str]) -> BTreeSet<Topic> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn labels(names: &[&str]) -> LabelSet {
        names.iter().map(|s| AckLabel::parse(*s).unwrap()).collect()
    }

    fn declare(f: &mut Fixture, sub: &SubscriberRef, names: &[&str]) -> Result<SubAck> {
        let (tx, mut rx) = oneshot::channel();
        f.coordinator.handle(Command::Declare {
            labels: labels(names),
            subscriber: sub.clone(),
            reply: tx,
        });
        rx.try_recv().unwrap()
    }

    #[tokio::test]
    async fn test_subscribe_updates_view_and_registry() {
        let mut f = fixture(NodeSettings::default());
        let (sub, _inbox) = subscriber::channel(SubscriberId::new(node(1), 1));
        let (tx, mut rx) = oneshot::channel();
        f.coordinator.handle(Command::Subscribe {
            topics: topics(&["hello"]),
            subscriber: sub.clone(),
            filter: None,
            reply: Some(tx),
        });
        let ack = rx.try_recv().unwrap();
        assert_eq!(ack.version, 1);
        assert_eq!(f.view.borrow().subscribers("hello"), vec![sub.id()]);
        assert!(f.registry.read().contains_key(&sub.id()));

        f.coordinator.handle(Command::Unsubscribe {
            topics: topics(&["hello"]),
            subscriber: sub.id(),
            reply: None,
        });
        assert!(f.view.borrow().subscribers("hello").is_empty());
        assert!(f.registry.read().is_empty());
    }

    #[tokio::test]
    async fn test_declare_rejects_conflicts() {
        let mut f = fixture(NodeSettings::default());
        let (first, _i1) = subscriber::channel(SubscriberId::new(node(1), 1));
        let (second, _i2) = subscriber::channel(SubscriberId::new(node(1), 2));

        declare(&mut f, &first, &["lorem", "ipsum"]).unwrap();
        match declare(&mut f, &second, &["dolor", "ipsum"]) {
            Err(PubSubError::LabelNotUnique { label, owner }) => {
                assert_eq!(label.as_str(), "ipsum");
                assert_eq!(owner, first.id());
            }
            other => panic!("unexpected {other:?}"),
        }
        // the failed declaration left nothing behind
        assert!(f.coordinator.labels().labels_of(&second.id()).is_none());

        f.coordinator.handle(Command::RemoveDeclaration(first.id()));
        declare(&mut f, &second, &["dolor", "ipsum"]).unwrap();
    }

    #[tokio::test]
    async fn test_foreign_subscriber_rejected() {
        let mut f = fixture(NodeSettings::default());
        let (foreign, _inbox) = subscriber::channel(SubscriberId::new(node(2), 1));

        let (tx, mut rx) = oneshot::channel();
        f.coordinator.handle(Command::Subscribe {
            topics: topics(&["hello"]),
            subscriber: foreign.clone(),
            filter: None,
            reply: Some(tx),
        });
        assert!(rx.try_recv().is_err());
        assert!(f.view.borrow().subscribers("hello").is_empty());
        assert_eq!(f.coordinator.topics().replica().local_version(), 0);

        assert!(matches!(
            declare(&mut f, &foreign, &["lorem"]),
            Err(PubSubError::ForeignSubscriber { subscriber, node: n }) if subscriber == foreign.id() && n == node(1)
        ));
        assert_eq!(f.coordinator.labels().label_count(), 0);
        assert!(f.registry.read().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_acks_accept_everything() {
        let mut f = fixture(NodeSettings {
            acks_enabled: false,
            ..NodeSettings::default()
        });
        let (first, _i1) = subscriber::channel(SubscriberId::new(node(1), 1));
        let (second, _i2) = subscriber::channel(SubscriberId::new(node(1), 2));
        declare(&mut f, &first, &["lorem"]).unwrap();
        declare(&mut f, &second, &["lorem"]).unwrap();
        assert_eq!(f.coordinator.labels().label_count(), 0);
    }

    #[tokio::test]
    async fn test_terminated_subscriber_pruned() {
        let mut f = fixture(NodeSettings::default());
        let (sub, _inbox) = subscriber::channel(SubscriberId::new(node(1), 1));
        f.coordinator.handle(Command::Subscribe {
            topics: topics(&["t"]),
            subscriber: sub.clone(),
            filter: None,
            reply: None,
        });
        declare(&mut f, &sub, &["lorem"]).unwrap();

        f.coordinator.handle(Command::Terminated(sub.id()));
        assert_eq!(f.coordinator.topics().subscriber_count(), 0);
        assert_eq!(f.coordinator.labels().label_count(), 0);
        assert!(f.registry.read().is_empty());

        // idempotent
        f.coordinator.handle(Command::Terminated(sub.id()));
        f.coordinator.handle(Command::RemoveSubscriber(sub.id()));
    }

    #[tokio::test]
    async fn test_local_receivers_get_snapshots() {
        let mut f = fixture(NodeSettings::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        f.coordinator.handle(Command::ReceiveLocalDeclaredAcks(tx));
        assert!(rx.try_recv().unwrap().is_empty());

        let (sub, _inbox) = subscriber::channel(SubscriberId::new(node(1), 1));
        declare(&mut f, &sub, &["lorem"]).unwrap();
        let snapshot = rx.try_recv().unwrap();
        assert_eq!(snapshot.labels_of(&sub.id()), Some(&labels(&["lorem"])));

        f.coordinator.heartbeat();
        assert_eq!(rx.try_recv().unwrap(), snapshot);

        drop(rx);
        f.coordinator.heartbeat();
        assert!(f.coordinator.local_receivers.is_empty());
    }

    #[tokio::test]
    async fn test_lost_declaration_withdrawn_and_notified() {
        let mut f = fixture(NodeSettings::default());
        // local node 1 loses to node 0's subscriber
        let (sub, mut inbox) = subscriber::channel(SubscriberId::new(node(1), 1));
        declare(&mut f, &sub, &["lorem"]).unwrap();

        let mut remote = LabelMap::new(node(0));
        let winner = SubscriberId::new(node(0), 5);
        remote.declare(winner, labels(&["lorem"]));
        assert!(f.coordinator.apply_delta(
            node(0),
            GossipDelta {
                topics: vec![],
                labels: remote.deltas_for(&[]),
            },
        ));
        // settling, not withdrawn yet
        f.coordinator.heartbeat();
        assert!(inbox.try_recv().is_none());
        assert!(f.coordinator.labels().labels_of(&sub.id()).is_some());

        f.coordinator.heartbeat();
        assert_eq!(
            inbox.try_recv(),
            Some(Delivery::LabelNotUnique {
                label: AckLabel::parse("lorem").unwrap(),
                owner: winner,
            })
        );
        assert!(f.coordinator.labels().labels_of(&sub.id()).is_none());
        assert_eq!(f.view.borrow().owner(&AckLabel::parse("lorem").unwrap()), Some(winner));
    }

    #[tokio::test]
    async fn test_suspect_cleared_by_smaller_declaration() {
        let mut f = fixture(NodeSettings::default());
        let (sub, mut inbox) = subscriber::channel(SubscriberId::new(node(1), 1));
        declare(&mut f, &sub, &["bbb"]).unwrap();

        // X {aaa, bbb} arrives first and beats the local declaration on bbb
        let mut middle = [0u8; 32];
        middle[31] = 5;
        let mut x_map = LabelMap::new(NodeId(middle));
        x_map.declare(SubscriberId::new(NodeId(middle), 1), labels(&["aaa", "bbb"]));
        assert!(f.coordinator.apply_delta(
            NodeId(middle),
            GossipDelta {
                topics: vec![],
                labels: x_map.deltas_for(&[]),
            },
        ));
        f.coordinator.heartbeat();

        // W {aaa} is smaller than X, so X is rejected and bbb is ours again
        let mut w_map = LabelMap::new(node(0));
        let w = SubscriberId::new(node(0), 1);
        w_map.declare(w, labels(&["aaa"]));
        assert!(!f.coordinator.apply_delta(
            node(0),
            GossipDelta {
                topics: vec![],
                labels: w_map.deltas_for(&[]),
            },
        ));
        for _ in 0..SETTLE_ROUNDS + 1 {
            f.coordinator.heartbeat();
        }

        assert!(inbox.try_recv().is_none());
        assert_eq!(f.coordinator.labels().labels_of(&sub.id()), Some(&labels(&["bbb"])));
        assert!(f.coordinator.suspects.is_empty());
        assert_eq!(f.view.borrow().owner(&AckLabel::parse("bbb").unwrap()), Some(sub.id()));
        assert_eq!(f.view.borrow().owner(&AckLabel::parse("aaa").unwrap()), Some(w));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let res: Result<crate::node::NodeStats> =
            request(&tx, Duration::from_secs(30), Command::Stats).await;
        assert!(matches!(res, Err(PubSubError::Timeout(d)) if d == Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_request_to_stopped_loop() {
        let (tx, rx) = mpsc::unbounded_channel::<Command>();
        drop(rx);
        let res = request(&tx, Duration::from_secs(1), Command::Stats).await;
        assert!(matches!(res, Err(PubSubError::NodeStopped)));
    }

    #[tokio::test]
    async fn test_digest_tracks_state() {
        let mut f = fixture(NodeSettings::default());
        let empty = f.coordinator.digest().unwrap();
        let (sub, _inbox) = subscriber::channel(SubscriberId::new(node(1), 1));
        f.coordinator.handle(Command::Subscribe {
            topics: topics(&["t"]),
            subscriber: sub.clone(),
            filter: None,
            reply: None,
        });
        assert_ne!(f.coordinator.digest().unwrap(), empty);
        f.coordinator.handle(Command::RemoveSubscriber(sub.id()));
        assert_eq!(f.coordinator.digest().unwrap(), empty);
    }
}
