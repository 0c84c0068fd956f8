use super::{BufferHistory, BufferId, Encoding, HistoryEntry, Indentation, Replay, SyncError};
use crate::agent::{Agent, AgentId, BufferContent, HighlightEvent, PatchEvent, ServerEvent};
use crate::config::SyncSettings;
use crate::fingerprint::Fingerprint;
use crate::patch::Patch;
use crate::storage::{BufferRecord, WorkspaceStore};
use crate::WorkspaceId;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// What `apply_patch` did with a patch it accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    /// The patch was empty.
    Ignored,
    /// The sender's edit was already reflected in the current state.
    Unchanged,
    /// The sender rebuilt an older state; it was sent an undo patch.
    Rewound,
    /// The buffer changed and the applied patch went out to every peer.
    Applied {
        patch: String,
        fingerprint: Fingerprint,
        bytes_changed: usize,
        /// The sender's claimed result differed; it is being resynced.
        desync: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetOutcome {
    Unchanged,
    Replaced { patch: String, fingerprint: Fingerprint },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadState {
    Unloaded,
    Loaded,
}

struct BufferCore {
    path: String,
    encoding: Encoding,
    load_state: LoadState,
    /// Known even before load, from the stored record.
    fingerprint: Fingerprint,
    saved_fingerprint: Option<Fingerprint>,
    history: BufferHistory,
    highlights: HashMap<AgentId, Vec<(usize, usize)>>,
    indent_warned: HashMap<AgentId, Instant>,
    deleted: bool,
    last_saved: Instant,
}

impl BufferCore {
    fn state(&self) -> Arc<[u8]> {
        self.history
            .current()
            .map(|e| e.state.clone())
            .unwrap_or_else(|| Arc::from(&[][..]))
    }

    fn record(&self, id: BufferId) -> BufferRecord {
        BufferRecord {
            id,
            path: self.path.clone(),
            deleted: self.deleted,
            md5: self.fingerprint.clone(),
            encoding: self.encoding,
        }
    }
}

struct PendingResync {
    deadline: Instant,
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Timers {
    resync: HashMap<AgentId, PendingResync>,
    last_resync: HashMap<AgentId, Instant>,
    save: Option<(u64, JoinHandle<()>)>,
    generation: u64,
}

impl Timers {
    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    fn abort_all(&mut self) {
        for (_, pending) in self.resync.drain() {
            pending.handle.abort();
        }
        if let Some((_, handle)) = self.save.take() {
            handle.abort();
        }
    }
}

/// One buffer's authoritative state.
///
/// All mutations go through an async mutex, so patches for the same buffer
/// are reconciled one at a time. Timers (resync, save) run as tasks holding a
/// weak reference and are aborted on delete or drop.
pub struct SyncBuffer {
    id: BufferId,
    workspace: WorkspaceId,
    settings: Arc<SyncSettings>,
    store: Arc<dyn WorkspaceStore>,
    core: Mutex<BufferCore>,
    save_lock: Mutex<()>,
    timers: std::sync::Mutex<Timers>,
    this: Weak<SyncBuffer>,
}

impl std::fmt::Debug for SyncBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncBuffer")
            .field("id", &self.id)
            .field("workspace", &self.workspace)
            .finish()
    }
}

impl SyncBuffer {
    fn build(
        workspace: WorkspaceId,
        id: BufferId,
        core: BufferCore,
        store: Arc<dyn WorkspaceStore>,
        settings: Arc<SyncSettings>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id,
            workspace,
            settings,
            store,
            core: Mutex::new(core),
            save_lock: Mutex::new(()),
            timers: std::sync::Mutex::new(Timers::default()),
            this: this.clone(),
        })
    }

    /// A buffer known from storage. Content is loaded on first access.
    pub fn from_record(
        workspace: WorkspaceId,
        record: BufferRecord,
        store: Arc<dyn WorkspaceStore>,
        settings: Arc<SyncSettings>,
    ) -> Arc<Self> {
        let history = BufferHistory::new(settings.max_buf_history);
        let core = BufferCore {
            path: record.path,
            encoding: record.encoding,
            load_state: LoadState::Unloaded,
            saved_fingerprint: Some(record.md5.clone()),
            fingerprint: record.md5,
            history,
            highlights: HashMap::new(),
            indent_warned: HashMap::new(),
            deleted: false,
            last_saved: Instant::now(),
        };
        Self::build(workspace, record.id, core, store, settings)
    }

    /// A new buffer, saved before it is returned.
    pub async fn create(
        workspace: WorkspaceId,
        id: BufferId,
        path: &str,
        encoding: Encoding,
        content: Vec<u8>,
        store: Arc<dyn WorkspaceStore>,
        settings: Arc<SyncSettings>,
    ) -> Result<Arc<Self>, SyncError> {
        let content = encoding.normalize(content);
        if content.len() > settings.max_buf_len {
            return Err(SyncError::TooLarge {
                len: content.len(),
                max: settings.max_buf_len,
            });
        }
        let state: Arc<[u8]> = Arc::from(content);
        let mut history = BufferHistory::new(settings.max_buf_history);
        history.seed(state.clone());
        let core = BufferCore {
            path: path.to_string(),
            encoding,
            load_state: LoadState::Loaded,
            fingerprint: Fingerprint::of(&state),
            saved_fingerprint: None,
            history,
            highlights: HashMap::new(),
            indent_warned: HashMap::new(),
            deleted: false,
            last_saved: Instant::now(),
        };
        let buffer = Self::build(workspace, id, core, store, settings);
        buffer.save(true).await?;
        debug!("Created buffer {} {} in workspace {}", id, path, workspace);
        Ok(buffer)
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn workspace(&self) -> WorkspaceId {
        self.workspace
    }

    pub async fn path(&self) -> String {
        self.core.lock().await.path.clone()
    }

    pub async fn encoding(&self) -> Encoding {
        self.core.lock().await.encoding
    }

    pub async fn fingerprint(&self) -> Fingerprint {
        self.core.lock().await.fingerprint.clone()
    }

    /// Persisted form of this buffer's metadata.
    pub async fn record(&self) -> BufferRecord {
        self.core.lock().await.record(self.id)
    }

    pub async fn is_loaded(&self) -> bool {
        self.core.lock().await.load_state == LoadState::Loaded
    }

    /// Content length if loaded.
    pub async fn loaded_len(&self) -> Option<usize> {
        let core = self.core.lock().await;
        (core.load_state == LoadState::Loaded).then(|| core.state().len())
    }

    pub async fn history_len(&self) -> usize {
        self.core.lock().await.history.len()
    }

    /// Whether the in-memory state differs from what was last saved.
    pub async fn is_dirty(&self) -> bool {
        let core = self.core.lock().await;
        core.saved_fingerprint.as_ref() != Some(&core.fingerprint)
    }

    pub async fn highlights(&self) -> HashMap<AgentId, Vec<(usize, usize)>> {
        self.core.lock().await.highlights.clone()
    }

    /// Load content now if it isn't loaded yet.
    pub async fn ensure_loaded(&self) -> Result<(), SyncError> {
        self.loaded().await.map(|_| ())
    }

    /// Current bytes, loading if needed.
    pub async fn state(&self) -> Result<Vec<u8>, SyncError> {
        Ok(self.loaded().await?.state().to_vec())
    }

    /// Full content message for this buffer, loading if needed.
    pub async fn content(&self) -> Result<BufferContent, SyncError> {
        let core = self.loaded().await?;
        Ok(BufferContent::new(self.id, &core.path, core.encoding, &core.state()))
    }

    pub fn has_pending_resync(&self, agent_id: &str) -> bool {
        self.timers().resync.contains_key(agent_id)
    }

    fn timers(&self) -> std::sync::MutexGuard<'_, Timers> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn describe(&self, core: &BufferCore) -> String {
        format!(
            "buffer {} {}/{} md5 {}",
            self.id, self.workspace, core.path, core.fingerprint
        )
    }

    /// Lock the core, loading content from storage first if needed.
    ///
    /// Concurrent callers queue on the lock while a load is in progress. A
    /// failed load leaves the buffer unloaded so a later access retries.
    async fn loaded(&self) -> Result<MutexGuard<'_, BufferCore>, SyncError> {
        let mut core = self.core.lock().await;
        if core.deleted {
            return Err(SyncError::Deleted(self.id));
        }
        if core.load_state == LoadState::Loaded {
            return Ok(core);
        }

        let bytes = match self.store.load(self.id).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => {
                debug!("{} content not found, starting empty", self.describe(&core));
                Vec::new()
            }
            Err(e) => {
                error!("Error loading {}: {}", self.describe(&core), e);
                return Err(e.into());
            }
        };
        let state: Arc<[u8]> = Arc::from(core.encoding.normalize(bytes));
        let actual = Fingerprint::of(&state);
        if actual != core.fingerprint {
            warn!(
                "MD5 mismatch loading {}: stored {}, content is {}",
                self.describe(&core),
                core.fingerprint,
                actual
            );
            core.fingerprint = actual;
        }
        core.history.seed(state);
        core.load_state = LoadState::Loaded;
        if core.saved_fingerprint.as_ref() != Some(&core.fingerprint) {
            self.dirtify(&core);
        }
        Ok(core)
    }

    /// Reconcile a patch from `sender` and relay the result to `peers`.
    ///
    /// `md5_before` is the fingerprint the sender edited from, `md5_after`
    /// the one it ended at. Errors have already been handled by scheduling a
    /// resync for the sender; the buffer is never left half-patched.
    pub async fn apply_patch(
        &self,
        sender: &Arc<dyn Agent>,
        peers: &[Arc<dyn Agent>],
        patch_text: &str,
        md5_before: &Fingerprint,
        md5_after: &Fingerprint,
    ) -> Result<PatchOutcome, SyncError> {
        if patch_text.is_empty() {
            debug!("Empty patch from {:?} for buffer {}", sender, self.id);
            return Ok(PatchOutcome::Ignored);
        }

        let mut core = self.loaded().await?;
        let patch_text = core.encoding.normalize_patch(patch_text);
        let patch = match Patch::parse(&patch_text) {
            Ok(patch) => patch,
            Err(e) => {
                warn!("Malformed patch from {:?} for {}: {}", sender, self.describe(&core), e);
                self.request_resync(sender, Duration::ZERO);
                return Err(e.into());
            }
        };
        if patch.is_empty() {
            return Ok(PatchOutcome::Ignored);
        }
        self.warn_indentation(&mut core, sender, &patch);

        let current_fp = core.fingerprint.clone();
        let state = core.state();
        let fresh = md5_before == &current_fp && md5_after != &current_fp;

        let (to_apply, relay_text) = if fresh {
            (patch, patch_text)
        } else {
            debug!(
                "Stale patch from {:?} for {}: sender had {}",
                sender,
                self.describe(&core),
                md5_before
            );
            match core.history.replay(md5_before, &patch) {
                Err(e) => {
                    warn!("Could not reconcile patch from {:?} for {}: {}", sender, self.describe(&core), e);
                    self.request_resync(sender, Duration::ZERO);
                    return Err(e);
                }
                Ok(Replay::Rewind { agent_state }) => {
                    let undo = Patch::diff(&agent_state, &state);
                    if undo.is_empty() {
                        return Ok(PatchOutcome::Unchanged);
                    }
                    info!("Sending undo patch to {:?} for {}", sender, self.describe(&core));
                    sender.write(ServerEvent::Patch(PatchEvent {
                        id: self.id,
                        path: core.path.clone(),
                        user_id: sender.id().to_string(),
                        username: sender.username().to_string(),
                        md5_before: Fingerprint::of(&agent_state),
                        md5_after: current_fp,
                        patch: undo.to_text(),
                    }));
                    self.cancel_resync(sender.id());
                    return Ok(PatchOutcome::Rewound);
                }
                Ok(Replay::Forward { agent_state }) => {
                    let forward = Patch::diff(&state, &agent_state);
                    if forward.is_empty() {
                        debug!("Rolled forward to current state, nothing to apply");
                        return Ok(PatchOutcome::Unchanged);
                    }
                    let text = forward.to_text();
                    (forward, text)
                }
            }
        };

        let applied = to_apply.apply(&state);
        if !applied.is_clean() {
            warn!(
                "Patch from {:?} did not apply cleanly to {}: {:?}",
                sender,
                self.describe(&core),
                applied.hunks
            );
            self.request_resync(sender, Duration::ZERO);
            return Err(SyncError::ApplyFailed);
        }
        let new_state = applied.content;
        if new_state.len() > self.settings.max_buf_len {
            self.request_resync(sender, Duration::ZERO);
            return Err(SyncError::TooLarge {
                len: new_state.len(),
                max: self.settings.max_buf_len,
            });
        }

        let new_fp = Fingerprint::of(&new_state);
        let mut desync = false;
        if &new_fp != md5_after {
            if fresh {
                error!(
                    "Patch from {:?} applied cleanly to {} but gave {}, client expected {}",
                    sender,
                    self.describe(&core),
                    new_fp,
                    md5_after
                );
                self.cancel_resync(sender.id());
                self.request_resync(sender, self.settings.desync_resync_delay());
                return Err(SyncError::Desync {
                    expected: md5_after.clone(),
                    actual: new_fp,
                });
            }
            warn!(
                "{:?} will be out of sync on {}: client {} -> {}, server {} -> {}",
                sender,
                self.describe(&core),
                md5_before,
                md5_after,
                current_fp,
                new_fp
            );
            desync = true;
        }

        // Cancel first so a desync resync scheduled below is not lost.
        self.cancel_resync(sender.id());
        if desync {
            self.request_resync(sender, Duration::ZERO);
        }

        let bytes_changed = new_state.len().abs_diff(state.len());
        core.history.push(HistoryEntry {
            fingerprint: new_fp.clone(),
            state: Arc::from(new_state),
            patch: Some(to_apply),
            author: Some(sender.id().to_string()),
        });
        core.fingerprint = new_fp.clone();
        debug!("{} updated from {}", self.describe(&core), current_fp);

        let event = ServerEvent::Patch(PatchEvent {
            id: self.id,
            path: core.path.clone(),
            user_id: sender.id().to_string(),
            username: sender.username().to_string(),
            md5_before: current_fp,
            md5_after: new_fp.clone(),
            patch: relay_text.clone(),
        });
        for peer in peers {
            peer.write(event.clone());
        }

        self.dirtify(&core);
        Ok(PatchOutcome::Applied {
            patch: relay_text,
            fingerprint: new_fp,
            bytes_changed,
            desync,
        })
    }

    /// Replace the whole content. The change is relayed to `peers` as a
    /// patch and recorded in history as a single edit.
    ///
    /// Encoding changes are not handled here; the room deletes and
    /// recreates the buffer instead.
    pub async fn set(
        &self,
        agent: Option<&Arc<dyn Agent>>,
        peers: &[Arc<dyn Agent>],
        content: Vec<u8>,
        claimed: Option<&Fingerprint>,
    ) -> Result<SetOutcome, SyncError> {
        let mut core = self.loaded().await?;
        if claimed == Some(&core.fingerprint) {
            return Ok(SetOutcome::Unchanged);
        }
        let content = core.encoding.normalize(content);
        if content.len() > self.settings.max_buf_len {
            return Err(SyncError::TooLarge {
                len: content.len(),
                max: self.settings.max_buf_len,
            });
        }
        let new_fp = Fingerprint::of(&content);
        if let Some(claimed) = claimed {
            if claimed != &new_fp {
                warn!("{} client md5 {} doesn't match content {}", self.describe(&core), claimed, new_fp);
            }
        }
        if new_fp == core.fingerprint {
            return Ok(SetOutcome::Unchanged);
        }

        let state = core.state();
        let patch = Patch::diff(&state, &content);
        let text = patch.to_text();
        if let Some(agent) = agent {
            self.cancel_resync(agent.id());
        }

        let before = core.fingerprint.clone();
        core.history.push(HistoryEntry {
            fingerprint: new_fp.clone(),
            state: Arc::from(content),
            patch: Some(patch),
            author: agent.map(|a| a.id().to_string()),
        });
        core.fingerprint = new_fp.clone();
        debug!("Set {}", self.describe(&core));

        let event = ServerEvent::Patch(PatchEvent {
            id: self.id,
            path: core.path.clone(),
            user_id: agent.map(|a| a.id().to_string()).unwrap_or_default(),
            username: agent.map(|a| a.username().to_string()).unwrap_or_default(),
            md5_before: before,
            md5_after: new_fp.clone(),
            patch: text.clone(),
        });
        for peer in peers {
            peer.write(event.clone());
        }

        self.dirtify(&core);
        Ok(SetOutcome::Replaced {
            patch: text,
            fingerprint: new_fp,
        })
    }

    /// Record an agent's highlight, normalizing reversed ranges.
    pub async fn highlight(
        &self,
        agent: &Arc<dyn Agent>,
        ranges: Vec<(usize, usize)>,
        summon: bool,
        following: bool,
    ) -> HighlightEvent {
        let ranges: Vec<(usize, usize)> = ranges
            .into_iter()
            .map(|(a, b)| if a > b { (b, a) } else { (a, b) })
            .collect();
        self.core
            .lock()
            .await
            .highlights
            .insert(agent.id().to_string(), ranges.clone());
        HighlightEvent {
            id: self.id,
            user_id: agent.id().to_string(),
            username: agent.username().to_string(),
            ranges,
            summon,
            following,
        }
    }

    /// Send the full content to an agent now, replacing any pending resync.
    pub async fn send_content(&self, agent: &Arc<dyn Agent>) -> Result<(), SyncError> {
        let content = self.content().await?;
        self.cancel_resync(agent.id());
        agent.send_full_buffer(content);
        Ok(())
    }

    /// Schedule a full-content resend to `agent` after `delay`.
    ///
    /// Requests coalesce: while one is pending, a later request only
    /// replaces it if it would fire sooner. An agent resynced within the
    /// resync window waits at least that long again.
    pub fn request_resync(&self, agent: &Arc<dyn Agent>, delay: Duration) {
        let now = Instant::now();
        let window = self.settings.resync_delay();
        let mut timers = self.timers();

        let recent = timers
            .last_resync
            .get(agent.id())
            .is_some_and(|at| now.saturating_duration_since(*at) < window);
        let delay = if recent { delay.max(window) } else { delay };
        let deadline = now + delay;

        if let Some(pending) = timers.resync.get(agent.id()) {
            if pending.deadline <= deadline {
                debug!("Resync for {:?} on buffer {} already pending", agent, self.id);
                return;
            }
            pending.handle.abort();
        }

        let generation = timers.next_generation();
        let weak = self.this.clone();
        let target = agent.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(buffer) = weak.upgrade() {
                buffer.fire_resync(&target, generation).await;
            }
        });
        timers.resync.insert(
            agent.id().to_string(),
            PendingResync {
                deadline,
                generation,
                handle,
            },
        );
    }

    async fn fire_resync(&self, agent: &Arc<dyn Agent>, generation: u64) {
        let content = match self.content().await {
            Ok(content) => content,
            Err(e) => {
                warn!("Can't resync {:?} on buffer {}: {}", agent, self.id, e);
                return;
            }
        };
        {
            let mut timers = self.timers();
            let ours = timers.resync.get(agent.id()).map(|p| p.generation) == Some(generation);
            if !ours {
                return;
            }
            timers.resync.remove(agent.id());
            timers
                .last_resync
                .insert(agent.id().to_string(), Instant::now());
        }
        if agent.is_connected() && agent.send_full_buffer(content) {
            info!("Sent get_buf for buffer {} to {:?}", self.id, agent);
        }
    }

    pub fn cancel_resync(&self, agent_id: &str) {
        if let Some(pending) = self.timers().resync.remove(agent_id) {
            pending.handle.abort();
        }
    }

    /// Drop all per-agent state: pending resyncs, highlights, warnings.
    pub async fn forget_agent(&self, agent_id: &str) {
        {
            let mut timers = self.timers();
            if let Some(pending) = timers.resync.remove(agent_id) {
                pending.handle.abort();
            }
            timers.last_resync.remove(agent_id);
        }
        let mut core = self.core.lock().await;
        core.highlights.remove(agent_id);
        core.indent_warned.remove(agent_id);
    }

    /// Schedule a debounced save. A buffer that has not been saved for
    /// longer than the save delay is saved on the next tick.
    fn dirtify(&self, core: &BufferCore) {
        let save_delay = self.settings.save_delay();
        let delay = if core.last_saved.elapsed() > save_delay {
            Duration::from_millis(1)
        } else {
            save_delay
        };
        self.schedule_save(delay);
    }

    fn schedule_save(&self, delay: Duration) {
        let mut timers = self.timers();
        if timers.save.is_some() {
            return;
        }
        let generation = timers.next_generation();
        let weak = self.this.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(buffer) = weak.upgrade() {
                buffer.run_scheduled_save(generation).await;
            }
        });
        timers.save = Some((generation, handle));
    }

    async fn run_scheduled_save(&self, generation: u64) {
        {
            let mut timers = self.timers();
            if timers.save.as_ref().map(|(g, _)| *g) != Some(generation) {
                return;
            }
            timers.save = None;
        }
        if let Err(e) = self.save(false).await {
            error!("Error saving buffer {} in workspace {}: {}", self.id, self.workspace, e);
            self.schedule_save(self.settings.save_delay());
        }
    }

    /// Write the record and content to storage. Skipped when nothing changed
    /// since the last save unless `force`. Returns whether a write happened.
    pub async fn save(&self, force: bool) -> Result<bool, SyncError> {
        let _serialized = self.save_lock.lock().await;
        let (record, content) = {
            let core = self.core.lock().await;
            if core.deleted {
                return Ok(false);
            }
            if !force && core.saved_fingerprint.as_ref() == Some(&core.fingerprint) {
                return Ok(false);
            }
            let content = (core.load_state == LoadState::Loaded).then(|| core.state());
            (core.record(self.id), content)
        };
        debug!("Saving buffer {} {} in workspace {}", self.id, record.path, self.workspace);
        self.store.save(&record, content.as_deref()).await?;

        let mut core = self.core.lock().await;
        core.saved_fingerprint = Some(record.md5);
        core.last_saved = Instant::now();
        Ok(true)
    }

    /// Cancel the save timer and save now if dirty.
    pub async fn flush(&self) -> Result<bool, SyncError> {
        if let Some((_, handle)) = self.timers().save.take() {
            handle.abort();
        }
        self.save(false).await
    }

    /// Move the buffer to a new path and persist the record.
    pub async fn rename(&self, path: &str) -> Result<(), SyncError> {
        let old = std::mem::replace(&mut self.core.lock().await.path, path.to_string());
        if let Err(e) = self.save(true).await {
            self.core.lock().await.path = old;
            return Err(e);
        }
        Ok(())
    }

    /// Tombstone the buffer in storage and cancel every timer. Nothing
    /// changes in memory if the tombstone cannot be written.
    pub async fn destroy(&self) -> Result<(), SyncError> {
        self.store.delete(self.id).await?;
        self.core.lock().await.deleted = true;
        self.timers().abort_all();
        Ok(())
    }

    /// Cancel every timer without touching storage.
    pub fn cancel_timers(&self) {
        self.timers().abort_all();
    }

    fn warn_indentation(&self, core: &mut BufferCore, sender: &Arc<dyn Agent>, patch: &Patch) {
        if core.encoding != Encoding::Utf8 {
            return;
        }
        let suspicious = patch
            .inserted()
            .any(|b| b.contains(&b'\t') || b.windows(4).any(|w| w == b"    "));
        if !suspicious {
            return;
        }
        let Some(indent) = Indentation::detect(&core.state()) else {
            return;
        };
        if !patch.inserted().any(|b| indent.mismatches(b)) {
            return;
        }
        warn!("{:?} probably has incorrect indentation rules for {}", sender, core.path);

        let now = Instant::now();
        let interval = self.settings.indent_warning_interval();
        if let Some(at) = core.indent_warned.get(sender.id()) {
            if now.saturating_duration_since(*at) < interval {
                return;
            }
        }
        core.indent_warned.insert(sender.id().to_string(), now);
        let (has, sent) = match indent {
            Indentation::Spaces => ("spaces", "a tab"),
            Indentation::Tabs => ("tabs", "spaces"),
        };
        sender.write(ServerEvent::Error {
            msg: format!(
                "Possible indentation mismatch! {} is indented with {}, but you sent {}. Check your indentation rules!",
                core.path, has, sent
            ),
            flash: false,
        });
    }
}

impl Drop for SyncBuffer {
    fn drop(&mut self) {
        self.timers().abort_all();
    }
}
