/// Forward sync control loop.
///
/// The manager decides when to sync and which peer to sync from, and owns
/// the retry policy around single-peer sync sessions. All of its state lives
/// in one task, [`SyncManagerService`], which is driven by commands from
/// cloneable [`SyncManager`] handles, peer-connect callbacks, finished
/// sessions and expired timers.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use containers::Slot;
use libp2p_identity::PeerId;
use metrics::SharedMetrics;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use super::{
    config::{SLOT_ERROR_THRESHOLD, SyncConfig},
    error::SyncError,
    peer_manager::{PeerSet, PeerStatus, SyncPeer},
    peer_sync::{PeerSync, PeerSyncResult},
    states::SyncState,
    store::ChainStore,
};

/// Callback told whether the node is syncing.
pub type SyncSubscriber = Box<dyn Fn(bool) + Send>;

/// Snapshot of sync progress as reported to the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncingStatus {
    pub is_syncing: bool,
    /// Local head slot.
    pub current_slot: Slot,
    pub starting_slot: Option<Slot>,
    pub highest_slot: Option<Slot>,
}

impl SyncingStatus {
    fn not_syncing(current_slot: Slot) -> Self {
        Self {
            is_syncing: false,
            current_slot,
            starting_slot: None,
            highest_slot: None,
        }
    }
}

enum SyncCommand {
    StartOrScheduleSync,
    PeerConnected(SyncPeer),
    ExecuteSync,
    SessionCompleted {
        peer_id: PeerId,
        outcome: Result<PeerSyncResult, SyncError>,
    },
    ExclusionExpired(PeerId),
    Subscribe {
        id: u64,
        subscriber: SyncSubscriber,
    },
    Unsubscribe(u64),
    GetSyncStatus(oneshot::Sender<SyncingStatus>),
    FindBestSyncPeer(oneshot::Sender<Option<SyncPeer>>),
    GetState(oneshot::Sender<SyncState>),
    Stop,
}

/// Handle to a running [`SyncManagerService`].
#[derive(Clone)]
pub struct SyncManager {
    commands: mpsc::UnboundedSender<SyncCommand>,
    next_subscriber_id: Arc<AtomicU64>,
}

impl SyncManager {
    /// Request a sync run. Requests made while a run is active collapse
    /// into a single follow-up run.
    pub fn start_or_schedule_sync(&self) {
        self.send(SyncCommand::StartOrScheduleSync);
    }

    pub fn subscribe_to_sync_changes(&self, subscriber: impl Fn(bool) + Send + 'static) -> u64 {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.send(SyncCommand::Subscribe {
            id,
            subscriber: Box::new(subscriber),
        });
        id
    }

    pub fn unsubscribe_from_sync_changes(&self, subscriber_id: u64) {
        self.send(SyncCommand::Unsubscribe(subscriber_id));
    }

    pub async fn sync_status(&self) -> Result<SyncingStatus> {
        self.query(SyncCommand::GetSyncStatus).await
    }

    pub async fn find_best_sync_peer(&self) -> Result<Option<SyncPeer>> {
        self.query(SyncCommand::FindBestSyncPeer).await
    }

    pub async fn is_sync_active(&self) -> Result<bool> {
        Ok(self.query(SyncCommand::GetState).await?.is_active())
    }

    pub async fn is_sync_queued(&self) -> Result<bool> {
        Ok(self.query(SyncCommand::GetState).await?.is_queued())
    }

    pub fn stop(&self) {
        self.send(SyncCommand::Stop);
    }

    async fn query<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> SyncCommand) -> Result<T> {
        let (sender, receiver) = oneshot::channel();
        self.commands
            .send(command(sender))
            .map_err(|_| anyhow!("sync manager is not running"))?;
        receiver.await.context("sync manager dropped the query")
    }

    fn send(&self, command: SyncCommand) {
        if self.commands.send(command).is_err() {
            debug!("Sync manager is not running, command dropped");
        }
    }
}

/// Make sure a peer is not advertising a chain from the future.
pub fn peer_status_is_consistent(
    status: &PeerStatus,
    current_slot: Option<Slot>,
    slots_per_epoch: u64,
) -> bool {
    let current_slot = current_slot.unwrap_or_default();
    let current_epoch = current_slot.epoch(slots_per_epoch);

    status.finalized_epoch() <= current_epoch
        && status.head_slot <= current_slot.saturating_add(SLOT_ERROR_THRESHOLD)
}

/// Whether a peer is far enough ahead of us to be worth a sync session.
pub fn peer_is_ahead(
    status: &PeerStatus,
    store: &dyn ChainStore,
    config: &SyncConfig,
) -> bool {
    let finalized_threshold = store
        .finalized_epoch()
        .saturating_add(config.sync_threshold_in_epochs);
    let head_threshold = store
        .head_slot()
        .saturating_add(config.chain.slots_in_epochs(config.sync_threshold_in_epochs));

    status.finalized_epoch() > finalized_threshold || status.head_slot > head_threshold
}

/// Task owning the sync manager state.
pub struct SyncManagerService {
    store: Arc<dyn ChainStore>,
    peers: Arc<dyn PeerSet>,
    peer_sync: Arc<dyn PeerSync>,
    config: SyncConfig,
    metrics: Option<SharedMetrics>,
    state: SyncState,
    /// Last value delivered to subscribers. Lags `state` at the start of a
    /// run until a peer to sync from is found.
    subscribers_sync_active: bool,
    peers_with_sync_errors: HashSet<PeerId>,
    subscribers: HashMap<u64, SyncSubscriber>,
    connect_subscription: Option<u64>,
    commands_tx: mpsc::UnboundedSender<SyncCommand>,
    commands_rx: mpsc::UnboundedReceiver<SyncCommand>,
    next_subscriber_id: Arc<AtomicU64>,
}

impl SyncManagerService {
    pub fn new(
        store: Arc<dyn ChainStore>,
        peers: Arc<dyn PeerSet>,
        peer_sync: Arc<dyn PeerSync>,
        config: SyncConfig,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Self {
            store,
            peers,
            peer_sync,
            config,
            metrics,
            state: SyncState::default(),
            subscribers_sync_active: false,
            peers_with_sync_errors: HashSet::new(),
            subscribers: HashMap::new(),
            connect_subscription: None,
            commands_tx,
            commands_rx,
            next_subscriber_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn handle(&self) -> SyncManager {
        SyncManager {
            commands: self.commands_tx.clone(),
            next_subscriber_id: self.next_subscriber_id.clone(),
        }
    }

    /// Run the control loop until [`SyncManager::stop`] is called.
    pub async fn run(mut self) {
        info!("Starting sync manager");

        let commands = self.commands_tx.clone();
        let subscription = self.peers.subscribe_connect(Box::new(move |peer| {
            let _ = commands.send(SyncCommand::PeerConnected(peer.clone()));
        }));
        self.connect_subscription = Some(subscription);

        // Queued behind anything sent before the loop started.
        self.handle().start_or_schedule_sync();

        while let Some(command) = self.commands_rx.recv().await {
            if !self.handle_command(command) {
                break;
            }
        }

        info!("Sync manager stopped");
    }

    fn handle_command(&mut self, command: SyncCommand) -> bool {
        match command {
            SyncCommand::StartOrScheduleSync => self.start_or_schedule_sync(),
            SyncCommand::PeerConnected(peer) => self.on_new_peer(&peer),
            SyncCommand::ExecuteSync => {
                if self.state.is_active() {
                    self.execute_sync();
                }
            }
            SyncCommand::SessionCompleted { peer_id, outcome } => {
                self.on_session_completed(peer_id, outcome)
            }
            SyncCommand::ExclusionExpired(peer_id) => {
                self.peers_with_sync_errors.remove(&peer_id);
                self.update_excluded_gauge();
                debug!(peer = %peer_id, "Peer sync error exclusion expired");
                self.start_or_schedule_sync();
            }
            SyncCommand::Subscribe { id, subscriber } => {
                self.subscribers.insert(id, subscriber);
            }
            SyncCommand::Unsubscribe(id) => {
                self.subscribers.remove(&id);
            }
            SyncCommand::GetSyncStatus(reply) => {
                let _ = reply.send(self.sync_status());
            }
            SyncCommand::FindBestSyncPeer(reply) => {
                let _ = reply.send(self.find_best_sync_peer());
            }
            SyncCommand::GetState(reply) => {
                let _ = reply.send(self.state);
            }
            SyncCommand::Stop => {
                self.stop();
                return false;
            }
        }
        true
    }

    fn start_or_schedule_sync(&mut self) {
        if self.state.is_active() {
            if !self.state.is_queued() {
                trace!("Queue sync");
                self.transition_to(SyncState::RunningQueued);
            }
            return;
        }

        self.transition_to(SyncState::Running);
        self.execute_sync();
    }

    fn execute_sync(&mut self) {
        match self.find_best_sync_peer() {
            Some(peer) => self.sync_to_peer(peer),
            None => {
                trace!(
                    peer_count = self.peers.peer_count(),
                    "No suitable peers found for sync"
                );
                self.schedule(self.config.long_delay, SyncCommand::StartOrScheduleSync);
                self.finish_run();
            }
        }
    }

    fn sync_to_peer(&mut self, peer: SyncPeer) {
        trace!(peer = %peer.peer_id, "Sync to peer");
        if !self.subscribers_sync_active {
            self.subscribers_sync_active = true;
            self.notify_subscribers(true);
        }

        let peer_sync = self.peer_sync.clone();
        let commands = self.commands_tx.clone();
        let peer_id = peer.peer_id;

        tokio::spawn(async move {
            let session = tokio::spawn(async move { peer_sync.sync(&peer).await });
            let outcome = match session.await {
                Ok(outcome) => outcome,
                Err(err) => Err(SyncError::Other(anyhow!("sync session aborted: {err}"))),
            };
            let _ = commands.send(SyncCommand::SessionCompleted { peer_id, outcome });
        });
    }

    fn on_session_completed(&mut self, peer_id: PeerId, outcome: Result<PeerSyncResult, SyncError>) {
        match outcome {
            Ok(result) => {
                if let Some(metrics) = &self.metrics {
                    metrics.inc_sync_session(result.as_str());
                }

                if result.is_success() {
                    info!(peer = %peer_id, head_slot = self.store.head_slot().0, "Synced to peer");
                    self.finish_run();
                } else {
                    debug!(peer = %peer_id, result = result.as_str(), "Sync to peer failed");
                    self.schedule(self.config.short_delay, SyncCommand::ExecuteSync);
                }
            }
            Err(err) => {
                if let Some(metrics) = &self.metrics {
                    metrics.inc_sync_session("error");
                }

                if err.is_expected() {
                    debug!(peer = %peer_id, %err, "Peer disconnected during sync");
                } else {
                    error!(peer = %peer_id, ?err, "Error during sync to peer");
                }

                self.peers_with_sync_errors.insert(peer_id);
                self.update_excluded_gauge();
                self.schedule(self.config.long_delay, SyncCommand::ExclusionExpired(peer_id));
                self.finish_run();
            }
        }
    }

    /// End of one run: start the queued run, or go idle.
    fn finish_run(&mut self) {
        if self.state.is_queued() {
            self.transition_to(SyncState::Running);
            self.execute_sync();
            return;
        }

        self.transition_to(SyncState::Idle);
        if self.subscribers_sync_active {
            self.subscribers_sync_active = false;
            self.notify_subscribers(false);
        }
    }

    fn on_new_peer(&mut self, peer: &SyncPeer) {
        if self.is_peer_sync_suitable(peer) {
            trace!(peer = %peer.peer_id, "New peer connected, schedule sync");
            self.start_or_schedule_sync();
        }
    }

    fn find_best_sync_peer(&self) -> Option<SyncPeer> {
        let mut rng = rand::thread_rng();
        self.peers
            .connected_peers()
            .into_iter()
            .filter(|peer| self.is_peer_sync_suitable(peer))
            .filter_map(|peer| {
                let status = peer.status.as_ref()?;
                let key = (status.finalized_epoch(), status.head_slot);
                Some((key, peer))
            })
            .max_by_key(|(key, _)| (*key, rng.r#gen::<u64>()))
            .map(|(_, peer)| peer)
    }

    fn is_peer_sync_suitable(&self, peer: &SyncPeer) -> bool {
        let Some(status) = peer.status.as_ref() else {
            return false;
        };

        !self.peers_with_sync_errors.contains(&peer.peer_id)
            && peer_status_is_consistent(
                status,
                self.store.current_slot(),
                self.config.slots_per_epoch(),
            )
            && peer_is_ahead(status, self.store.as_ref(), &self.config)
    }

    fn sync_status(&self) -> SyncingStatus {
        let head_slot = self.store.head_slot();
        if self.state.is_active() {
            if let Some(status) = self.find_best_sync_peer().and_then(|peer| peer.status) {
                return SyncingStatus {
                    is_syncing: true,
                    current_slot: head_slot,
                    starting_slot: Some(self.peer_sync.starting_slot()),
                    highest_slot: Some(status.head_slot),
                };
            }
        }
        SyncingStatus::not_syncing(head_slot)
    }

    fn stop(&mut self) {
        info!("Stopping sync manager");
        if let Some(subscription) = self.connect_subscription.take() {
            self.peers.unsubscribe_connect(subscription);
        }
        if self.state.is_queued() {
            self.transition_to(SyncState::Running);
        }
        self.peer_sync.stop();
    }

    fn transition_to(&mut self, target: SyncState) {
        if !self.state.can_transition_to(target) {
            warn!(from = ?self.state, to = ?target, "Invalid sync state transition");
            return;
        }
        trace!(from = ?self.state, to = ?target, "Sync state transition");
        self.state = target;

        if let Some(metrics) = &self.metrics {
            metrics.set_sync_active(self.state.is_active());
        }
    }

    fn notify_subscribers(&self, syncing: bool) {
        debug!(syncing, "Sync state changed");
        for subscriber in self.subscribers.values() {
            subscriber(syncing);
        }
    }

    fn schedule(&self, delay: Duration, command: SyncCommand) {
        let commands = self.commands_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(command);
        });
    }

    fn update_excluded_gauge(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.set_sync_peers_excluded(self.peers_with_sync_errors.len() as i64);
        }
    }
}
