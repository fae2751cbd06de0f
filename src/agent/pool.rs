//! Keyed pool of assistant processes, one per session.
//!
//! Callers borrow an agent with [`AgentPool::get_or_create`] and give it back
//! with [`AgentPool::release`]; the pool tracks the reference count and a
//! background reaper closes agents that have been unreferenced and idle
//! beyond the configured timeout. Insertion is single-winner: the whole map
//! is guarded by one async mutex, so concurrent `get_or_create` calls for the
//! same session observe exactly one live agent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{info, warn};

use super::claude::ClaudeAgent;

/// Reaper tick period.
const REAP_INTERVAL: Duration = Duration::from_secs(60);

struct EntryState {
    ref_count: u64,
    last_used: Instant,
}

struct PoolEntry {
    agent: Arc<ClaudeAgent>,
    state: Mutex<EntryState>,
}

struct PoolInner {
    work_dir: String,
    idle_timeout: Duration,
    entries: Mutex<HashMap<String, Arc<PoolEntry>>>,
}

/// Shared pool handle. Cheap to clone.
#[derive(Clone)]
pub struct AgentPool {
    inner: Arc<PoolInner>,
}

impl AgentPool {
    pub fn new(work_dir: &str, idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                work_dir: work_dir.to_string(),
                idle_timeout,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Borrow the agent for `session_id`, creating it if absent.
    /// Every call must be paired with a [`release`](Self::release).
    pub async fn get_or_create(&self, session_id: &str) -> Arc<ClaudeAgent> {
        let mut entries = self.inner.entries.lock().await;
        if let Some(entry) = entries.get(session_id) {
            let mut state = entry.state.lock().await;
            state.ref_count += 1;
            state.last_used = Instant::now();
            return entry.agent.clone();
        }

        let agent = Arc::new(ClaudeAgent::new(session_id, &self.inner.work_dir));
        let entry = Arc::new(PoolEntry {
            agent: agent.clone(),
            state: Mutex::new(EntryState {
                ref_count: 1,
                last_used: Instant::now(),
            }),
        });
        entries.insert(session_id.to_string(), entry);
        info!(session_id = %session_id, "Created assistant process entry");
        agent
    }

    /// Return a borrowed agent. The count never goes below zero; an
    /// over-release is logged instead.
    pub async fn release(&self, session_id: &str) {
        let entry = self.inner.entries.lock().await.get(session_id).cloned();
        if let Some(entry) = entry {
            let mut state = entry.state.lock().await;
            if state.ref_count == 0 {
                warn!(session_id = %session_id, "Release without matching borrow");
            } else {
                state.ref_count -= 1;
            }
            state.last_used = Instant::now();
        }
    }

    /// Evict and terminate one session's agent regardless of refcount.
    pub async fn close(&self, session_id: &str) {
        let entry = self.inner.entries.lock().await.remove(session_id);
        if let Some(entry) = entry {
            entry.agent.close().await;
            info!(session_id = %session_id, "Closed assistant process entry");
        }
    }

    /// Terminate everything (shutdown path).
    pub async fn close_all(&self) {
        let entries: Vec<(String, Arc<PoolEntry>)> =
            self.inner.entries.lock().await.drain().collect();
        for (session_id, entry) in entries {
            entry.agent.close().await;
            info!(session_id = %session_id, "Closed assistant process entry");
        }
    }

    /// One reaper pass: close entries with no borrowers that have been idle
    /// at least the configured timeout. Returns the evicted session ids.
    pub async fn sweep_idle(&self) -> Vec<String> {
        let snapshot: Vec<(String, Arc<PoolEntry>)> = self
            .inner
            .entries
            .lock()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut evicted = Vec::new();
        for (session_id, entry) in snapshot {
            let idle = {
                let state = entry.state.lock().await;
                state.ref_count == 0 && state.last_used.elapsed() >= self.inner.idle_timeout
            };
            if idle {
                self.close(&session_id).await;
                evicted.push(session_id);
            }
        }
        evicted
    }

    /// Spawn the background reaper. Aborted on shutdown via the handle.
    pub fn spawn_reaper(&self) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAP_INTERVAL);
            loop {
                interval.tick().await;
                let evicted = pool.sweep_idle().await;
                for session_id in evicted {
                    info!(session_id = %session_id, "Reaped idle assistant process");
                }
            }
        })
    }

    #[cfg(test)]
    async fn ref_count(&self, session_id: &str) -> Option<u64> {
        let entry = self.inner.entries.lock().await.get(session_id).cloned()?;
        let state = entry.state.lock().await;
        Some(state.ref_count)
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.inner.entries.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn borrow_and_release_track_refcount() {
        let pool = AgentPool::new(".", Duration::from_secs(600));
        let a = pool.get_or_create("s1").await;
        let b = pool.get_or_create("s1").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.ref_count("s1").await, Some(2));

        pool.release("s1").await;
        pool.release("s1").await;
        assert_eq!(pool.ref_count("s1").await, Some(0));

        // Over-release must not underflow.
        pool.release("s1").await;
        assert_eq!(pool.ref_count("s1").await, Some(0));
    }

    #[tokio::test]
    async fn concurrent_get_or_create_yields_one_entry() {
        let pool = AgentPool::new(".", Duration::from_secs(600));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.get_or_create("shared").await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(pool.len().await, 1);
        assert_eq!(pool.ref_count("shared").await, Some(8));
    }

    #[tokio::test]
    async fn sweep_evicts_only_idle_unreferenced_entries() {
        let pool = AgentPool::new(".", Duration::from_millis(10));
        pool.get_or_create("busy").await;
        pool.get_or_create("idle").await;
        pool.release("idle").await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        let evicted = pool.sweep_idle().await;
        assert_eq!(evicted, vec!["idle".to_string()]);
        assert_eq!(pool.len().await, 1);
        assert_eq!(pool.ref_count("busy").await, Some(1));
    }

    #[tokio::test]
    async fn sweep_respects_recent_activity() {
        let pool = AgentPool::new(".", Duration::from_secs(600));
        pool.get_or_create("fresh").await;
        pool.release("fresh").await;
        assert!(pool.sweep_idle().await.is_empty());
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn close_evicts_regardless_of_refcount() {
        let pool = AgentPool::new(".", Duration::from_secs(600));
        pool.get_or_create("s1").await;
        pool.close("s1").await;
        assert_eq!(pool.len().await, 0);

        // A new borrow creates a fresh entry.
        pool.get_or_create("s1").await;
        assert_eq!(pool.ref_count("s1").await, Some(1));
    }
}
