use crate::context::ExecutionContext;
use crate::events::RuntimeEvent;
use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Durable persistence for run state. The executor operates
/// exclusively through this trait, enabling pluggable backends
/// (MemoryStore for tests and the POC path, a database elsewhere).
///
/// Everything stored here must be fully serializable — contexts and
/// locations carry no live references.
#[async_trait]
pub trait ContextStore: Send + Sync {
    // ── Context ──

    async fn save_context(&self, run_id: Uuid, context: &ExecutionContext) -> Result<()>;
    async fn load_context(&self, run_id: Uuid) -> Result<Option<ExecutionContext>>;

    // ── Active locations ──

    async fn save_locations(&self, run_id: Uuid, locations: &[Location]) -> Result<()>;
    async fn load_locations(&self, run_id: Uuid) -> Result<Vec<Location>>;

    // ── Run records ──

    async fn save_run(&self, run: &RunRecord) -> Result<()>;
    async fn load_run(&self, run_id: Uuid) -> Result<Option<RunRecord>>;

    // ── Event log (append-only) ──

    /// Append an event and return its sequence number.
    async fn append_event(&self, run_id: Uuid, event: &RuntimeEvent) -> Result<u64>;
    async fn read_events(&self, run_id: Uuid, from_seq: u64) -> Result<Vec<(u64, RuntimeEvent)>>;
}

// ─── In-memory backend ────────────────────────────────────────

#[derive(Default)]
struct MemoryState {
    contexts: HashMap<Uuid, ExecutionContext>,
    locations: HashMap<Uuid, Vec<Location>>,
    runs: HashMap<Uuid, RunRecord>,
    events: HashMap<Uuid, Vec<RuntimeEvent>>,
}

/// In-memory ContextStore.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContextStore for MemoryStore {
    async fn save_context(&self, run_id: Uuid, context: &ExecutionContext) -> Result<()> {
        self.state.lock().await.contexts.insert(run_id, context.clone());
        Ok(())
    }

    async fn load_context(&self, run_id: Uuid) -> Result<Option<ExecutionContext>> {
        Ok(self.state.lock().await.contexts.get(&run_id).cloned())
    }

    async fn save_locations(&self, run_id: Uuid, locations: &[Location]) -> Result<()> {
        self.state.lock().await.locations.insert(run_id, locations.to_vec());
        Ok(())
    }

    async fn load_locations(&self, run_id: Uuid) -> Result<Vec<Location>> {
        Ok(self
            .state
            .lock()
            .await
            .locations
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_run(&self, run: &RunRecord) -> Result<()> {
        self.state.lock().await.runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<RunRecord>> {
        Ok(self.state.lock().await.runs.get(&run_id).cloned())
    }

    async fn append_event(&self, run_id: Uuid, event: &RuntimeEvent) -> Result<u64> {
        let mut state = self.state.lock().await;
        let log = state.events.entry(run_id).or_default();
        log.push(event.clone());
        Ok(log.len() as u64)
    }

    async fn read_events(&self, run_id: Uuid, from_seq: u64) -> Result<Vec<(u64, RuntimeEvent)>> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .get(&run_id)
            .map(|log| {
                log.iter()
                    .enumerate()
                    .map(|(i, e)| (i as u64 + 1, e.clone()))
                    .filter(|(seq, _)| *seq >= from_seq)
                    .collect()
            })
            .unwrap_or_default())
    }
}
