//! # Shard Node
//!
//! One participant of the cluster: owns a storage file, a transaction log
//! and a lock table, and answers protocol requests.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       ShardNode                              │
//! ├──────────────────────────────────────────────────────────────┤
//! │  dispatch(request) ── match ──┬── data    ─► locks + storage │
//! │                               ├── admin   ─► registry, modes │
//! │                               ├── ids     ─► sequences       │
//! │                               └── continue ─► commit / abort │
//! │                                                              │
//! │  stage:    lock keys ─► check preconditions ─► log ToProcess │
//! │  commit:   Processing ─► apply blocks ─► Processed ─► unlock │
//! │  abort:    Canceled ─► unlock                                │
//! │  failed apply: halt, keep locks, redo at the next open       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Collections and id sequences are stored as ordinary blocks under the
//! reserved `$` prefixes, which can never collide with a valid collection.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use cairn_core::{
    error::{Error, Result},
    protocol::{
        AdminRequest, ContinueRequest, DataRequest, DataResponse, ExceptionResponse, NodeReport,
        UniqueIdRequest,
    },
    types::{validate_collection_name, KEY_SEPARATOR},
    LockHolder, Mutation, NodeId, ObjectKey, Operation, Request, ResourceKey, Response, SessionId,
    TransactionId,
};
use cairn_storage::{CompactionReport, LogStatus, ReliableStorage, TransactionLog};
use cairn_txn::LockManager;

use crate::context::NodeContext;
use crate::housekeeping::{Housekeeper, HousekeepingTask};

const COLLECTIONS_PREFIX: &str = "$collections:";
const SEQUENCES_PREFIX: &str = "$sequences:";
/// Sequence feeding node-local ids for single-request writes.
const LOCAL_SEQUENCE: &str = "$local";
/// Node-local transaction ids live in the upper half of the id space.
const LOCAL_TRANSACTION_BIT: u64 = 1 << 63;
/// Largest block of ids one `Generate` request may reserve.
pub const MAX_IDS_PER_REQUEST: u32 = 1 << 16;
/// Decisions remembered after the log checkpoint forgets them.
const RECENT_OUTCOMES: usize = 4096;

struct StagedTransaction {
    mutations: Vec<Mutation>,
    collections: BTreeSet<String>,
}

#[derive(Default)]
struct Registry {
    declared: BTreeSet<String>,
    /// Being emptied by a drop; closed to new writes.
    dropping: BTreeSet<String>,
}

impl Registry {
    fn require_open(&self, name: &str) -> Result<()> {
        if !self.declared.contains(name) {
            return Err(Error::UnknownCollection {
                name: name.to_string(),
            });
        }
        if self.dropping.contains(name) {
            return Err(Error::Protocol {
                message: format!("collection {} is being dropped", name),
            });
        }
        Ok(())
    }
}

/// Bounded memory of how finished transactions ended, so a repeated
/// decision gets the same answer once the log entry is gone.
#[derive(Default)]
struct RecentOutcomes {
    order: VecDeque<TransactionId>,
    committed: HashMap<TransactionId, bool>,
}

impl RecentOutcomes {
    fn record(&mut self, transaction_id: TransactionId, committed: bool) {
        if self.committed.insert(transaction_id, committed).is_none() {
            self.order.push_back(transaction_id);
        }
        while self.order.len() > RECENT_OUTCOMES {
            if let Some(oldest) = self.order.pop_front() {
                self.committed.remove(&oldest);
            }
        }
    }

    fn get(&self, transaction_id: TransactionId) -> Option<bool> {
        self.committed.get(&transaction_id).copied()
    }
}

pub struct ShardNode {
    ctx: NodeContext,
    storage: ReliableStorage,
    log: TransactionLog,
    locks: LockManager,
    collections: RwLock<Registry>,
    staged: Mutex<HashMap<TransactionId, StagedTransaction>>,
    outcomes: Mutex<RecentOutcomes>,
    /// Shared by commit application, exclusive for compaction.
    apply_gate: RwLock<()>,
    sequences: Mutex<()>,
    read_only: AtomicBool,
    stopped: AtomicBool,
    /// Set when a decided commit could not be applied.
    halted: AtomicBool,
    next_session: AtomicU64,
    housekeeper: Mutex<Option<Housekeeper>>,
}

impl ShardNode {
    /// Open the node's files, finish what the last run left in the log and
    /// start the housekeeping worker.
    pub async fn open(ctx: NodeContext) -> Result<Arc<Self>> {
        let config = Arc::clone(&ctx.config);
        config.validate()?;
        let (storage, scan) = ReliableStorage::open(config.storage.clone(), ctx.metrics.clone())?;
        if !scan.is_clean() {
            warn!(
                "{}: storage scan found {} invalid blocks",
                ctx.node_id, scan.invalid_blocks
            );
        }

        let (log, plan) = TransactionLog::open(
            &config.storage.data_dir,
            config.log.clone(),
            ctx.metrics.clone(),
        )?;
        let replayed = log.replay(&plan, |record| storage.apply(&record.mutations))?;
        if replayed > 0 || !plan.discarded.is_empty() {
            info!(
                "{}: recovery replayed {} committed transactions, canceled {}",
                ctx.node_id,
                replayed,
                plan.discarded.len()
            );
        }

        let mut outcomes = RecentOutcomes::default();
        for record in &plan.redo {
            outcomes.record(record.transaction_id, true);
        }
        for transaction_id in &plan.discarded {
            outcomes.record(*transaction_id, false);
        }

        let declared: BTreeSet<String> = storage
            .keys(Some(COLLECTIONS_PREFIX))
            .into_iter()
            .filter_map(|k| k.strip_prefix(COLLECTIONS_PREFIX).map(str::to_string))
            .collect();

        let locks = LockManager::new(config.locks.acquire_timeout, ctx.metrics.clone());
        let node = Arc::new(Self {
            ctx,
            storage,
            log,
            locks,
            collections: RwLock::new(Registry {
                declared,
                dropping: BTreeSet::new(),
            }),
            staged: Mutex::new(HashMap::new()),
            outcomes: Mutex::new(outcomes),
            apply_gate: RwLock::new(()),
            sequences: Mutex::new(()),
            read_only: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            next_session: AtomicU64::new(1),
            housekeeper: Mutex::new(None),
        });

        let housekeeper = Housekeeper::spawn(Arc::downgrade(&node), &config.housekeeping);
        *node.housekeeper.lock() = Some(housekeeper);

        info!(
            "{} ready: {} objects, {} collections",
            node.ctx.node_id,
            node.storage.len(),
            node.collections.read().declared.len()
        );
        Ok(node)
    }

    pub fn id(&self) -> NodeId {
        self.ctx.node_id
    }

    pub fn context(&self) -> &NodeContext {
        &self.ctx
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn log(&self) -> &TransactionLog {
        &self.log
    }

    pub fn storage(&self) -> &ReliableStorage {
        &self.storage
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// True once a decided commit failed to apply. The node refuses
    /// writes and keeps that transaction's locks until it is reopened.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn collections(&self) -> Vec<String> {
        self.collections.read().declared.iter().cloned().collect()
    }

    pub fn next_session_id(&self) -> SessionId {
        SessionId(self.next_session.fetch_add(1, Ordering::Relaxed))
    }

    /// Transactions staged here and still waiting for a decision.
    pub fn pending_transactions(&self) -> Vec<TransactionId> {
        let mut ids: Vec<_> = self.staged.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    // ========== Dispatch ==========

    /// Answer one request. The last response is always terminal.
    pub async fn dispatch(&self, session: SessionId, request: Request) -> Vec<Response> {
        let label = request_label(&request);
        let result = if self.is_stopped() {
            Err(Error::Protocol {
                message: format!("{} is stopped", self.ctx.node_id),
            })
        } else {
            match request {
                Request::DataAccess(data) => self.handle_data(session, data).await,
                Request::Admin(admin) => self.handle_admin(session, admin).await,
                Request::UniqueId(ids) => self.handle_unique_id(ids),
                Request::Continue(ContinueRequest {
                    transaction_id,
                    should_commit,
                }) => self
                    .continue_transaction(transaction_id, should_commit)
                    .map(|_| vec![Response::Null]),
            }
        };

        match result {
            Ok(responses) => responses,
            Err(e) => {
                debug!("{} {} failed: {}", self.ctx.node_id, label, e);
                let context = vec![format!("{} {} in {}", self.ctx.node_id, label, session)];
                vec![Response::Exception(ExceptionResponse::from_error(&e, context))]
            }
        }
    }

    async fn handle_data(&self, session: SessionId, request: DataRequest) -> Result<Vec<Response>> {
        match request {
            DataRequest::Get { collection, keys } => {
                self.require_collection(&collection)?;
                let objects = self.read_objects(&collection, &keys)?;
                Ok(self.chunked(objects))
            }
            DataRequest::Put { collection, items } => {
                let operations = items
                    .into_iter()
                    .map(|(key, payload)| Operation::Put {
                        key: ObjectKey::new(collection.as_str(), key),
                        payload,
                    })
                    .collect();
                self.write_now(session, operations).await?;
                Ok(vec![Response::Null])
            }
            DataRequest::Delete { collection, keys } => {
                let operations = keys
                    .into_iter()
                    .map(|key| Operation::Delete {
                        key: ObjectKey::new(collection.as_str(), key),
                    })
                    .collect();
                self.write_now(session, operations).await?;
                Ok(vec![Response::Null])
            }
            DataRequest::UpdateIf {
                key,
                expected,
                payload,
            } => {
                self.write_now(session, vec![Operation::UpdateIf { key, expected, payload }])
                    .await?;
                Ok(vec![Response::Null])
            }
            DataRequest::Transaction {
                transaction_id,
                operations,
            } => {
                self.stage(transaction_id, &operations).await?;
                Ok(vec![Response::Ready { transaction_id }])
            }
            DataRequest::Lock {
                resources,
                timeout_ms,
            } => {
                let timeout = (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms));
                self.locks
                    .acquire(&resources, LockHolder::Session(session), timeout)
                    .await?;
                Ok(vec![Response::Null])
            }
            DataRequest::Unlock => {
                self.require_healthy()?;
                self.locks.release(LockHolder::Session(session));
                Ok(vec![Response::Null])
            }
        }
    }

    async fn handle_admin(&self, session: SessionId, request: AdminRequest) -> Result<Vec<Response>> {
        match request {
            AdminRequest::DeclareCollection { name } => {
                self.declare_collection(session, &name).await?;
                Ok(vec![Response::Null])
            }
            AdminRequest::Dump => {
                let mut objects = Vec::new();
                for collection in self.collections() {
                    objects.extend(self.read_objects(&collection, &[])?);
                }
                Ok(self.chunked(objects))
            }
            AdminRequest::Import { collection, items } => {
                let operations = items
                    .into_iter()
                    .map(|(key, payload)| Operation::Put {
                        key: ObjectKey::new(collection.as_str(), key),
                        payload,
                    })
                    .collect();
                self.write_now(session, operations).await?;
                Ok(vec![Response::Null])
            }
            AdminRequest::SwitchMode { read_only } => {
                self.read_only.store(read_only, Ordering::SeqCst);
                info!("{} switched to {}", self.ctx.node_id, if read_only { "read-only" } else { "read-write" });
                Ok(vec![Response::Null])
            }
            AdminRequest::Stop => {
                self.stop().await?;
                Ok(vec![Response::Null])
            }
            AdminRequest::Drop { collection } => {
                self.drop_collections(session, collection).await?;
                Ok(vec![Response::Null])
            }
            AdminRequest::Compact => {
                self.compact_now()?;
                Ok(vec![Response::Data(DataResponse::Report(self.report()?)), Response::Null])
            }
            AdminRequest::Analyze => {
                Ok(vec![Response::Data(DataResponse::Report(self.report()?)), Response::Null])
            }
        }
    }

    fn handle_unique_id(&self, request: UniqueIdRequest) -> Result<Vec<Response>> {
        match request {
            UniqueIdRequest::Generate { name, count } => {
                self.require_writable()?;
                let ids = self.generate_ids(&name, count)?;
                Ok(vec![Response::Data(DataResponse::Ids(ids)), Response::Null])
            }
            UniqueIdRequest::Resync { name, floor } => {
                self.require_writable()?;
                self.resync_sequence(&name, floor)?;
                Ok(vec![Response::Null])
            }
        }
    }

    fn chunked(&self, objects: Vec<(ObjectKey, Bytes)>) -> Vec<Response> {
        let chunk = self.ctx.config.session.max_chunk_items.max(1);
        let mut responses: Vec<Response> = objects
            .chunks(chunk)
            .map(|c| Response::Data(DataResponse::Objects(c.to_vec())))
            .collect();
        responses.push(Response::Null);
        responses
    }

    // ========== Two-stage transactions ==========

    /// Lock, validate and log a transaction piece without touching storage.
    pub async fn stage(&self, transaction_id: TransactionId, operations: &[Operation]) -> Result<()> {
        self.require_writable()?;
        for op in operations {
            self.require_collection(&op.key().collection)?;
        }
        if self.staged.lock().contains_key(&transaction_id) {
            return Err(Error::Protocol {
                message: format!("{} is already staged", transaction_id),
            });
        }

        let holder = LockHolder::Transaction(transaction_id);
        let resources: Vec<ResourceKey> = operations.iter().map(Operation::resource).collect();
        self.locks.acquire(&resources, holder, None).await?;

        let staged = (|| -> Result<()> {
            // a drop marks its collections under the write lock, so a piece
            // either registers before the drop looks or sees the mark
            let registry = self.collections.read();
            let mut collections = BTreeSet::new();
            for op in operations {
                let name = &op.key().collection;
                registry.require_open(name)?;
                collections.insert(name.clone());
            }
            self.check_preconditions(operations)?;
            let mutations: Vec<Mutation> = operations.iter().map(Mutation::from).collect();
            self.log.append(transaction_id, &mutations)?;
            self.staged.lock().insert(
                transaction_id,
                StagedTransaction {
                    mutations,
                    collections,
                },
            );
            Ok(())
        })();

        match staged {
            Ok(()) => {
                debug!("{} staged {} ({} operations)", self.ctx.node_id, transaction_id, operations.len());
                Ok(())
            }
            Err(e) => {
                self.locks.release(holder);
                Err(e)
            }
        }
    }

    fn check_preconditions(&self, operations: &[Operation]) -> Result<()> {
        for op in operations {
            if let Operation::UpdateIf { key, expected, .. } = op {
                let current = self.storage.get(&key.storage_key())?;
                if current.as_ref() != Some(expected) {
                    return Err(Error::PreconditionFailed {
                        key: key.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Commit or abort a staged transaction.
    ///
    /// Repeating a decision gives the same answer as the first time.
    /// Aborting an unknown transaction is a no-op, so aborts can always be
    /// retried. A commit that fails to apply halts the node and leaves the
    /// transaction's locks held; the next open redoes it.
    pub fn continue_transaction(&self, transaction_id: TransactionId, should_commit: bool) -> Result<()> {
        if should_commit {
            self.require_healthy()?;
        }
        let staged = self.staged.lock().remove(&transaction_id);
        let holder = LockHolder::Transaction(transaction_id);

        let Some(staged) = staged else {
            return self.repeated_decision(transaction_id, should_commit);
        };

        let result = if should_commit {
            self.commit(transaction_id, &staged.mutations)
        } else {
            self.log.set_status(transaction_id, LogStatus::Canceled).map(|_| {
                self.ctx.metrics.record_rollback();
                debug!("{} canceled {}", self.ctx.node_id, transaction_id);
            })
        };

        if let Err(e) = result {
            if should_commit {
                self.halt(transaction_id, &e);
            } else {
                self.locks.release(holder);
            }
            return Err(e);
        }
        self.outcomes.lock().record(transaction_id, should_commit);
        self.locks.release(holder);
        self.housekeeping(HousekeepingTask::CheckLog);
        Ok(())
    }

    /// Answer a decision for a transaction that is no longer staged.
    fn repeated_decision(&self, transaction_id: TransactionId, should_commit: bool) -> Result<()> {
        let outcome = self.outcomes.lock().get(transaction_id);
        let outcome = outcome.or_else(|| match self.log.status_of(transaction_id) {
            Some(LogStatus::Processed) => Some(true),
            Some(LogStatus::Canceled) => Some(false),
            _ => None,
        });
        match (should_commit, outcome) {
            (true, Some(true)) | (false, Some(false)) | (false, None) => Ok(()),
            (true, Some(false)) => Err(Error::TransactionAborted {
                transaction_id: transaction_id.0,
                reason: "aborted before the commit arrived".to_string(),
            }),
            (true, None) => Err(Error::TransactionAborted {
                transaction_id: transaction_id.0,
                reason: "no staged transaction to commit".to_string(),
            }),
            (false, Some(true)) => Err(Error::InvalidTransition {
                transaction_id: transaction_id.0,
                from: "Processed".to_string(),
                to: "Canceled".to_string(),
            }),
        }
    }

    fn commit(&self, transaction_id: TransactionId, mutations: &[Mutation]) -> Result<()> {
        let _gate = self.apply_gate.read();
        self.log.set_status(transaction_id, LogStatus::Processing)?;
        self.storage.apply(mutations)?;
        self.log.set_status(transaction_id, LogStatus::Processed)?;
        self.ctx.metrics.record_commit();
        debug!("{} committed {}", self.ctx.node_id, transaction_id);
        Ok(())
    }

    /// Stop taking writes after a decided commit failed. Newer writes to
    /// its keys would be overwritten when the next open redoes it.
    fn halt(&self, transaction_id: TransactionId, err: &Error) {
        self.halted.store(true, Ordering::SeqCst);
        error!(
            "{} halted: committed {} could not be applied and stays Processing until the next open: {}",
            self.ctx.node_id, transaction_id, err
        );
    }

    /// Run a single-request write as a local transaction on this node.
    ///
    /// Locks are taken as the session, so keys the session already locked
    /// explicitly stay held after the write.
    async fn write_now(&self, session: SessionId, operations: Vec<Operation>) -> Result<()> {
        if operations.is_empty() {
            return Ok(());
        }
        self.require_writable()?;
        for op in &operations {
            self.require_collection(&op.key().collection)?;
        }
        self.write_logged(session, operations, true).await
    }

    /// Log and commit `operations` under session locks. With
    /// `check_registry` the collections must still be open once the locks
    /// are held.
    async fn write_logged(&self, session: SessionId, operations: Vec<Operation>, check_registry: bool) -> Result<()> {
        let holder = LockHolder::Session(session);
        let resources: Vec<ResourceKey> = operations.iter().map(Operation::resource).collect();
        let taken = self.locks.acquire(&resources, holder, None).await?;

        let result = (|| -> Result<()> {
            let registry = check_registry.then(|| self.collections.read());
            if let Some(registry) = &registry {
                for op in &operations {
                    registry.require_open(&op.key().collection)?;
                }
            }
            self.check_preconditions(&operations)?;
            let transaction_id = self.next_local_transaction_id()?;
            let mutations: Vec<Mutation> = operations.iter().map(Mutation::from).collect();
            self.log.append(transaction_id, &mutations)?;
            self.commit(transaction_id, &mutations).map_err(|e| {
                self.halt(transaction_id, &e);
                e
            })
        })();

        if self.is_halted() {
            return result;
        }
        self.locks.release_keys(holder, &taken);
        self.housekeeping(HousekeepingTask::CheckLog);
        result
    }

    fn next_local_transaction_id(&self) -> Result<TransactionId> {
        let ids = self.generate_ids(LOCAL_SEQUENCE, 1)?;
        let id = ids.first().copied().ok_or_else(|| Error::Internal {
            message: "local sequence returned no id".to_string(),
        })?;
        Ok(TransactionId(id | LOCAL_TRANSACTION_BIT))
    }

    // ========== Schema ==========

    fn require_collection(&self, name: &str) -> Result<()> {
        self.collections.read().require_open(name)
    }

    fn require_writable(&self) -> Result<()> {
        self.require_healthy()?;
        if self.is_read_only() {
            Err(Error::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn require_healthy(&self) -> Result<()> {
        if self.is_halted() {
            Err(Error::Storage {
                message: format!("{} halted after a failed commit, reopen to recover", self.ctx.node_id),
            })
        } else {
            Ok(())
        }
    }

    async fn declare_collection(&self, session: SessionId, name: &str) -> Result<()> {
        validate_collection_name(name)?;
        self.require_writable()?;
        if self.collections.read().declared.contains(name) {
            return Ok(());
        }

        let holder = LockHolder::Session(session);
        let resource = [ResourceKey::collection(name)];
        let taken = self.locks.acquire(&resource, holder, None).await?;
        let result = self
            .storage
            .upsert(vec![(format!("{}{}", COLLECTIONS_PREFIX, name), Bytes::new())]);
        self.locks.release_keys(holder, &taken);
        result?;

        self.collections.write().declared.insert(name.to_string());
        info!("{} declared collection {}", self.ctx.node_id, name);
        Ok(())
    }

    /// Delete a collection's objects and its registration. Refused while a
    /// staged transaction writes to it.
    async fn drop_collections(&self, session: SessionId, collection: Option<String>) -> Result<()> {
        self.require_writable()?;
        let targets = match collection {
            Some(name) => {
                self.require_collection(&name)?;
                vec![name]
            }
            None => self.collections(),
        };

        let holder = LockHolder::Session(session);
        let resources: Vec<ResourceKey> = targets.iter().map(ResourceKey::collection).collect();
        let taken = self.locks.acquire(&resources, holder, None).await?;
        let result = self.empty_collections(session, &targets).await;
        self.locks.release_keys(holder, &taken);
        result?;

        info!("{} dropped {} collections", self.ctx.node_id, targets.len());
        Ok(())
    }

    async fn empty_collections(&self, session: SessionId, targets: &[String]) -> Result<()> {
        {
            let mut registry = self.collections.write();
            let staged = self.staged.lock();
            let busy = staged
                .iter()
                .find(|(_, piece)| targets.iter().any(|t| piece.collections.contains(t)));
            if let Some((transaction_id, _)) = busy {
                return Err(Error::Protocol {
                    message: format!("cannot drop while {} is staged against it", transaction_id),
                });
            }
            registry.dropping.extend(targets.iter().cloned());
        }

        let result = self.delete_collection_objects(session, targets).await;

        let mut registry = self.collections.write();
        for name in targets {
            registry.dropping.remove(name);
            if result.is_ok() {
                registry.declared.remove(name);
            }
        }
        result
    }

    async fn delete_collection_objects(&self, session: SessionId, targets: &[String]) -> Result<()> {
        let mut operations = Vec::new();
        for name in targets {
            let prefix = format!("{}{}", name, KEY_SEPARATOR);
            for raw in self.storage.keys(Some(&prefix)) {
                operations.push(Operation::Delete {
                    key: ObjectKey::from_storage_key(&raw)?,
                });
            }
        }
        if !operations.is_empty() {
            self.write_logged(session, operations, false).await?;
        }
        let registry: Vec<String> = targets
            .iter()
            .map(|name| format!("{}{}", COLLECTIONS_PREFIX, name))
            .collect();
        self.storage.delete(&registry)?;
        Ok(())
    }

    fn read_objects(&self, collection: &str, keys: &[String]) -> Result<Vec<(ObjectKey, Bytes)>> {
        let raw_keys = if keys.is_empty() {
            self.storage
                .keys(Some(&format!("{}{}", collection, KEY_SEPARATOR)))
        } else {
            keys.iter()
                .map(|k| ObjectKey::new(collection, k.as_str()).storage_key())
                .collect()
        };

        let mut objects = Vec::with_capacity(raw_keys.len());
        for (raw, payload) in self.storage.get_many(&raw_keys)? {
            objects.push((ObjectKey::from_storage_key(&raw)?, payload));
        }
        Ok(objects)
    }

    // ========== Unique ids ==========

    fn sequence_value(&self, name: &str) -> Result<(String, u64)> {
        let key = format!("{}{}", SEQUENCES_PREFIX, name);
        let current = match self.storage.get(&key)? {
            Some(raw) => {
                let bytes: [u8; 8] = raw[..].try_into().map_err(|_| Error::Corruption {
                    offset: 0,
                    details: format!("sequence {} has a malformed value", name),
                })?;
                u64::from_le_bytes(bytes)
            }
            None => 0,
        };
        Ok((key, current))
    }

    /// Reserve `count` consecutive ids. Persisted before they are returned.
    pub fn generate_ids(&self, name: &str, count: u32) -> Result<Vec<u64>> {
        if name.is_empty() {
            return Err(Error::Protocol {
                message: "sequence name must not be empty".to_string(),
            });
        }
        if count > MAX_IDS_PER_REQUEST {
            return Err(Error::Protocol {
                message: format!("cannot reserve {} ids at once, the limit is {}", count, MAX_IDS_PER_REQUEST),
            });
        }
        let _guard = self.sequences.lock();
        let (key, current) = self.sequence_value(name)?;
        let last = current.checked_add(u64::from(count)).ok_or_else(|| Error::Protocol {
            message: format!("sequence {} is exhausted at {}", name, current),
        })?;
        if count > 0 {
            self.storage
                .upsert(vec![(key, Bytes::copy_from_slice(&last.to_le_bytes()))])?;
        }
        Ok((current + 1..=last).collect())
    }

    pub fn resync_sequence(&self, name: &str, floor: u64) -> Result<()> {
        let _guard = self.sequences.lock();
        let (key, current) = self.sequence_value(name)?;
        if floor > current {
            self.storage
                .upsert(vec![(key, Bytes::copy_from_slice(&floor.to_le_bytes()))])?;
            debug!("{} resynced sequence {} to {}", self.ctx.node_id, name, floor);
        }
        Ok(())
    }

    // ========== Housekeeping ==========

    fn housekeeping(&self, task: HousekeepingTask) {
        if let Some(housekeeper) = self.housekeeper.lock().as_ref() {
            housekeeper.request(task);
        }
    }

    /// Checkpoint and rotate the log, then compact storage if it is dirty enough.
    pub fn run_housekeeping(&self, force_compaction: bool) -> Result<Option<CompactionReport>> {
        self.log.checkpoint()?;
        self.log.rotate()?;

        let storage_config = &self.ctx.config.storage;
        let due = self.storage.file_size() >= storage_config.min_compaction_bytes
            && self.storage.dirty_ratio() >= storage_config.compaction_dirty_ratio;
        if force_compaction || due {
            self.try_compact()
        } else {
            Ok(None)
        }
    }

    fn try_compact(&self) -> Result<Option<CompactionReport>> {
        let _gate = self.apply_gate.write();
        if self.log.has_processing() {
            debug!("{} skipping compaction, a commit is being applied", self.ctx.node_id);
            return Ok(None);
        }
        self.storage.compact().map(Some)
    }

    fn compact_now(&self) -> Result<CompactionReport> {
        self.try_compact()?.ok_or_else(|| Error::Compaction {
            reason: "a committed transaction is still being applied".to_string(),
        })
    }

    pub fn report(&self) -> Result<NodeReport> {
        let scan = self.storage.scan(false)?;
        let live_objects = self
            .storage
            .keys(None)
            .iter()
            .filter(|k| !k.starts_with('$'))
            .count() as u64;
        Ok(NodeReport {
            live_objects,
            valid_blocks: scan.valid_blocks,
            invalid_blocks: scan.invalid_blocks,
            dirty_blocks: scan.dirty_blocks,
            deleted_blocks: scan.deleted_blocks,
            storage_bytes: scan.file_bytes,
            pending_transactions: self.staged.lock().len() as u64,
        })
    }

    // ========== Sessions & lifecycle ==========

    /// Release everything a closing session still holds.
    pub fn end_session(&self, session: SessionId) {
        if self.is_halted() {
            debug!("{} keeps the locks of {} while halted", self.ctx.node_id, session);
            return;
        }
        let released = self.locks.release(LockHolder::Session(session));
        if released > 0 {
            debug!("{} closed {} with {} locks", self.ctx.node_id, session, released);
        }
    }

    /// Abort staged work, flush files and stop the worker.
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("{} stopping", self.ctx.node_id);

        for transaction_id in self.pending_transactions() {
            if let Err(e) = self.continue_transaction(transaction_id, false) {
                warn!("{} failed to abort {} on stop: {}", self.ctx.node_id, transaction_id, e);
            }
        }

        let housekeeper = self.housekeeper.lock().take();
        if let Some(housekeeper) = housekeeper {
            housekeeper.shutdown().await;
        }
        self.storage.sync()
    }
}

fn request_label(request: &Request) -> &'static str {
    match request {
        Request::DataAccess(DataRequest::Get { .. }) => "get",
        Request::DataAccess(DataRequest::Put { .. }) => "put",
        Request::DataAccess(DataRequest::Delete { .. }) => "delete",
        Request::DataAccess(DataRequest::UpdateIf { .. }) => "update-if",
        Request::DataAccess(DataRequest::Transaction { .. }) => "begin-transaction",
        Request::DataAccess(DataRequest::Lock { .. }) => "lock",
        Request::DataAccess(DataRequest::Unlock) => "unlock",
        Request::Admin(AdminRequest::DeclareCollection { .. }) => "declare-collection",
        Request::Admin(AdminRequest::Dump) => "dump",
        Request::Admin(AdminRequest::Import { .. }) => "import",
        Request::Admin(AdminRequest::SwitchMode { .. }) => "switch-mode",
        Request::Admin(AdminRequest::Stop) => "stop",
        Request::Admin(AdminRequest::Drop { .. }) => "drop",
        Request::Admin(AdminRequest::Compact) => "compact",
        Request::Admin(AdminRequest::Analyze) => "analyze",
        Request::UniqueId(UniqueIdRequest::Generate { .. }) => "generate-ids",
        Request::UniqueId(UniqueIdRequest::Resync { .. }) => "resync-ids",
        Request::Continue(_) => "continue-transaction",
    }
}
