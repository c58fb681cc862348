//! Group manager.
//!
//! The manager is the registry of every group the node belongs to. Each
//! registered group has a consensus engine which, once syncing starts, runs
//! in its own task next to the group's publish-queue dispatcher. The
//! manager itself only coordinates lifecycles and routes inbound messages;
//! it never waits on a group's progress, so one stalled group cannot hold
//! back another.

use crate::error::{NodeError, Result};
use crate::observability::NodeMetrics;
use grove_consensus::{
    drop_reason, spawn_engine, ConsensusIface, EngineConfig, EngineHandle, EngineStatus,
    HealthStatus, Inbound, PSyncer, Transport,
};
use grove_pubqueue::{EntryId, PublishQueue};
use grove_storage::{BlockStore, GroupStore};
use grove_types::{CommittedBlock, GroupId, GroupItem, GroupSeed, HbMsg, Identity};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Everything a group's engine needs from its node.
#[derive(Clone)]
pub struct NodeContext {
    /// Name of the local peer.
    pub node_name: String,
    /// Local signing identity.
    pub identity: Arc<dyn Identity>,
    /// Committed block store.
    pub blocks: Arc<dyn BlockStore>,
    /// Group metadata store.
    pub groups: Arc<dyn GroupStore>,
    /// Outbound transport shared by every group.
    pub transport: Arc<dyn Transport>,
    /// The node's publish queue.
    pub queue: PublishQueue,
    /// Configuration of every engine.
    pub engine_config: EngineConfig,
    /// Node metrics.
    pub metrics: NodeMetrics,
}

impl NodeContext {
    fn iface(&self) -> ConsensusIface {
        ConsensusIface {
            blocks: self.blocks.clone(),
            groups: self.groups.clone(),
            transport: self.transport.clone(),
            identity: self.identity.clone(),
            config: self.engine_config.clone(),
            metrics: self.metrics.consensus.clone(),
        }
    }
}

/// Snapshot of one registered group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    /// Group id.
    pub group_id: GroupId,
    /// Group name.
    pub group_name: String,
    /// True while the group's engine task runs.
    pub running: bool,
    /// Engine status, if an engine could be built.
    pub status: Option<EngineStatus>,
}

struct GroupSlot {
    item: GroupItem,
    /// Engine built but not running.
    idle: Option<PSyncer>,
    engine: Option<EngineHandle>,
}

impl GroupSlot {
    fn status(&self) -> Option<EngineStatus> {
        match (&self.engine, &self.idle) {
            (Some(engine), _) => Some(engine.status()),
            (None, Some(psyncer)) => Some(psyncer.status()),
            (None, None) => None,
        }
    }
}

/// Registry and lifecycle owner of every group's engine.
pub struct GroupManager {
    ctx: NodeContext,
    registry: Mutex<BTreeMap<GroupId, GroupSlot>>,
    syncing: AtomicBool,
}

impl std::fmt::Debug for GroupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupManager")
            .field("node", &self.ctx.node_name)
            .field("groups", &self.registry.lock().len())
            .field("syncing", &self.is_syncing())
            .finish()
    }
}

impl GroupManager {
    /// Creates an empty manager.
    pub fn new(ctx: NodeContext) -> Self {
        Self {
            ctx,
            registry: Mutex::new(BTreeMap::new()),
            syncing: AtomicBool::new(false),
        }
    }

    /// The node context.
    pub fn context(&self) -> &NodeContext {
        &self.ctx
    }

    /// Returns true between `start_sync_all_groups` and `stop_sync_all_groups`.
    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// Registers every persisted group without starting it.
    ///
    /// Groups whose record is corrupt, or whose engine cannot be built, are
    /// skipped. Only a failure to list the groups is an error.
    pub fn load_all_groups(&self) -> Result<usize> {
        let ids = self.ctx.groups.group_ids()?;
        let mut loaded = 0;

        for group_id in ids {
            if self.registry.lock().contains_key(&group_id) {
                continue;
            }
            let item = match self.ctx.groups.load_group(&group_id) {
                Ok(Some(item)) => item,
                Ok(None) => continue,
                Err(e) => {
                    error!(group_id = %group_id, error = %e, "Skipping unreadable group");
                    continue;
                }
            };
            let psyncer = match self.build_engine(item.clone()) {
                Ok(psyncer) => psyncer,
                Err(e) => {
                    error!(group_id = %group_id, error = %e, "Skipping group");
                    continue;
                }
            };

            let mut registry = self.registry.lock();
            registry.insert(
                group_id,
                GroupSlot {
                    item,
                    idle: Some(psyncer),
                    engine: None,
                },
            );
            loaded += 1;
            self.refresh_gauges(&registry);
        }

        info!(loaded, total = self.registry.lock().len(), "Loaded groups");
        Ok(loaded)
    }

    /// Starts the engine and queue dispatcher of every registered group.
    /// Groups already running are left alone.
    pub fn start_sync_all_groups(&self) -> usize {
        self.syncing.store(true, Ordering::SeqCst);
        let mut registry = self.registry.lock();
        let mut started = 0;

        for (group_id, slot) in registry.iter_mut() {
            match self.start_slot(group_id, slot) {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(e) => error!(group_id = %group_id, error = %e, "Failed to start group"),
            }
        }

        self.refresh_gauges(&registry);
        info!(started, "Started group sync");
        started
    }

    /// Stops every running engine and dispatcher. In-flight rounds are
    /// abandoned; committed state is untouched.
    pub async fn stop_sync_all_groups(&self) -> usize {
        self.syncing.store(false, Ordering::SeqCst);
        let running: Vec<(GroupId, EngineHandle)> = self
            .registry
            .lock()
            .iter_mut()
            .filter_map(|(id, slot)| slot.engine.take().map(|engine| (id.clone(), engine)))
            .collect();

        let stopped = running.len();
        futures::future::join_all(running.iter().map(|(group_id, engine)| async move {
            self.ctx.queue.unbind(group_id).await;
            engine.stop().await;
        }))
        .await;

        // fresh engines for a later restart, from the persisted state
        let mut registry = self.registry.lock();
        for (group_id, _) in &running {
            if let Some(slot) = registry.get_mut(group_id) {
                if slot.engine.is_none() && slot.idle.is_none() {
                    slot.idle = self.rebuild_engine(group_id, &slot.item);
                }
            }
        }
        self.refresh_gauges(&registry);
        info!(stopped, "Stopped group sync");
        stopped
    }

    /// Stops every group and forgets it. Persisted data is untouched.
    pub async fn teardown_all_groups(&self) {
        self.stop_sync_all_groups().await;
        self.ctx.queue.shutdown().await;
        let mut registry = self.registry.lock();
        let count = registry.len();
        registry.clear();
        self.refresh_gauges(&registry);
        info!(count, "Tore down groups");
    }

    /// Hands an inbound message to its group's engine.
    ///
    /// Messages for unknown or stopped groups are dropped and counted.
    /// Returns true if the message was queued.
    pub fn route_message(&self, group_id: &GroupId, msg: HbMsg) -> bool {
        let engine = {
            let registry = self.registry.lock();
            match registry.get(group_id) {
                Some(slot) => slot.engine.clone(),
                None => {
                    self.ctx.metrics.consensus.dropped(drop_reason::UNKNOWN_GROUP);
                    debug!(group_id = %group_id, sender = %msg.sender.short(), "Dropping message for unknown group");
                    return false;
                }
            }
        };

        match engine {
            Some(engine) => engine.route(msg).is_ok(),
            None => {
                self.ctx.metrics.consensus.dropped(drop_reason::STOPPED);
                false
            }
        }
    }

    /// Demultiplexes the transport's inbound stream until it closes.
    pub async fn run_inbound(&self, mut inbound: Inbound) {
        while let Some((group_id, msg)) = inbound.recv().await {
            self.route_message(&group_id, msg);
        }
        debug!("Inbound stream closed");
    }

    /// Joins a group from its seed: persists the genesis block and group
    /// record when missing, registers the group and starts it if the node
    /// is syncing.
    pub fn join_group(&self, seed: GroupSeed) -> Result<()> {
        seed.validate()?;
        let group_id = seed.group_id().clone();
        if self.registry.lock().contains_key(&group_id) {
            return Err(NodeError::GroupExists(group_id));
        }

        if self.ctx.blocks.get_highest_block(&group_id)?.is_none() {
            self.ctx
                .blocks
                .append_block(&group_id, &CommittedBlock::genesis(seed.genesis_block.clone()))?;
        }
        let item = match self.ctx.groups.load_group(&group_id) {
            Ok(Some(item)) => item,
            Ok(None) => {
                self.ctx.groups.save_group(&seed.group_item)?;
                seed.group_item.clone()
            }
            Err(e) => {
                warn!(group_id = %group_id, error = %e, "Replacing unreadable group record with seed");
                self.ctx.groups.save_group(&seed.group_item)?;
                seed.group_item.clone()
            }
        };
        let psyncer = self.build_engine(item.clone())?;

        let mut registry = self.registry.lock();
        if registry.contains_key(&group_id) {
            return Err(NodeError::GroupExists(group_id));
        }
        let mut slot = GroupSlot {
            item,
            idle: Some(psyncer),
            engine: None,
        };
        if self.is_syncing() {
            self.start_slot(&group_id, &mut slot)?;
        }
        registry.insert(group_id.clone(), slot);
        self.refresh_gauges(&registry);

        info!(group_id = %group_id, name = %seed.group_item.group_name, "Joined group");
        Ok(())
    }

    /// Leaves a group: stops it, forgets it and deletes its blocks, record
    /// and queue entries.
    pub async fn leave_group(&self, group_id: &GroupId) -> Result<()> {
        let slot = {
            let mut registry = self.registry.lock();
            let slot = registry.remove(group_id);
            self.refresh_gauges(&registry);
            slot
        };
        let slot = slot.ok_or_else(|| NodeError::UnknownGroup(group_id.clone()))?;

        if let Some(engine) = slot.engine {
            self.ctx.queue.unbind(group_id).await;
            engine.stop().await;
        }
        let purged = self.ctx.queue.purge_group(group_id).await?;
        self.ctx.blocks.remove_group(group_id)?;
        self.ctx.groups.delete_group(group_id)?;

        info!(group_id = %group_id, purged, "Left group");
        Ok(())
    }

    /// Joins every group seed (`*.json`) found in `dir`.
    ///
    /// Known groups are skipped; malformed seeds are logged and skipped.
    pub fn import_seeds(&self, dir: &Path) -> Result<usize> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| crate::config::is_seed_file(path))
            .collect();
        paths.sort();

        let mut imported = 0;
        for path in paths {
            let seed = match GroupSeed::load_json(&path) {
                Ok(seed) => seed,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping malformed seed");
                    continue;
                }
            };
            if self.registry.lock().contains_key(seed.group_id()) {
                debug!(group_id = %seed.group_id(), "Seed already joined");
                continue;
            }
            match self.join_group(seed) {
                Ok(()) => imported += 1,
                Err(NodeError::GroupExists(_)) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to import seed"),
            }
        }

        info!(dir = %dir.display(), imported, "Imported group seeds");
        Ok(imported)
    }

    /// Registered group ids, sorted.
    pub fn group_ids(&self) -> Vec<GroupId> {
        self.registry.lock().keys().cloned().collect()
    }

    /// Snapshot of a group.
    pub fn group_info(&self, group_id: &GroupId) -> Option<GroupInfo> {
        let registry = self.registry.lock();
        let slot = registry.get(group_id)?;
        Some(GroupInfo {
            group_id: group_id.clone(),
            group_name: slot.item.group_name.clone(),
            running: slot.engine.as_ref().is_some_and(|e| e.is_running()),
            status: slot.status(),
        })
    }

    /// Health of a group's engine.
    pub fn group_health(&self, group_id: &GroupId) -> Option<HealthStatus> {
        self.registry.lock().get(group_id)?.status().map(|s| s.health)
    }

    /// The running engine of a group.
    pub fn engine(&self, group_id: &GroupId) -> Option<EngineHandle> {
        self.registry.lock().get(group_id)?.engine.clone()
    }

    /// Enqueues a payload for a group the local node produces for.
    pub fn submit(&self, group_id: &GroupId, payload: Vec<u8>) -> Result<EntryId> {
        let status = {
            let registry = self.registry.lock();
            let slot = registry
                .get(group_id)
                .ok_or_else(|| NodeError::UnknownGroup(group_id.clone()))?;
            slot.status()
        };
        if status.is_some_and(|s| !s.roles.producer) {
            return Err(NodeError::NotProducer(group_id.clone()));
        }
        Ok(self.ctx.queue.enqueue(group_id, payload)?)
    }

    fn build_engine(&self, item: GroupItem) -> Result<PSyncer> {
        Ok(PSyncer::new(item, self.ctx.node_name.clone(), self.ctx.iface())?)
    }

    /// Builds a fresh engine from the latest persisted record.
    fn rebuild_engine(&self, group_id: &GroupId, fallback: &GroupItem) -> Option<PSyncer> {
        let item = match self.ctx.groups.load_group(group_id) {
            Ok(Some(item)) => item,
            _ => fallback.clone(),
        };
        match self.build_engine(item) {
            Ok(psyncer) => Some(psyncer),
            Err(e) => {
                error!(group_id = %group_id, error = %e, "Failed to rebuild engine");
                None
            }
        }
    }

    /// Starts a slot's engine task and binds its queue dispatcher.
    fn start_slot(&self, group_id: &GroupId, slot: &mut GroupSlot) -> Result<bool> {
        if slot.engine.is_some() {
            return Ok(false);
        }
        let psyncer = match slot.idle.take() {
            Some(psyncer) => psyncer,
            None => self.build_engine(slot.item.clone())?,
        };

        let engine = spawn_engine(psyncer);
        self.ctx.queue.bind(group_id.clone(), Arc::new(engine.clone()));
        slot.engine = Some(engine);
        debug!(group_id = %group_id, "Started group");
        Ok(true)
    }

    fn refresh_gauges(&self, registry: &BTreeMap<GroupId, GroupSlot>) {
        let running = registry.values().filter(|s| s.engine.is_some()).count();
        self.ctx.metrics.groups.set(registry.len() as i64);
        self.ctx.metrics.running_groups.set(running as i64);
    }
}
