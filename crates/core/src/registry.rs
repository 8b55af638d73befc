//! Concurrency-safe registry of live interview sessions.
//!
//! One slot per user key. The outer map lock is only held long enough to
//! reserve or look up a slot; the slow, network-bound plan build runs inside
//! the slot's `OnceCell` initializer, so two near-simultaneous starts for the
//! same user produce exactly one session and one initializer invocation while
//! distinct users never block each other.

use crate::session::InterviewSession;
use anyhow::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};

pub type SharedSession = Arc<Mutex<InterviewSession>>;

type Slot = Arc<OnceCell<SharedSession>>;

#[derive(Default)]
pub struct SessionRegistry {
    slots: Mutex<HashMap<String, Slot>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the session for `user_key`, creating it with `init` if absent.
    /// The boolean is true when this call created the session; a false return
    /// means the caller is resuming an existing one and should reattach
    /// instead of greeting again.
    ///
    /// If `init` fails, the reserved slot is released so a later join can
    /// retry.
    pub async fn get_or_create<F, Fut>(
        &self,
        user_key: &str,
        init: F,
    ) -> Result<(SharedSession, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<InterviewSession>>,
    {
        let slot = {
            let mut slots = self.slots.lock().await;
            slots
                .entry(user_key.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        // AtomicBool keeps the future Send; the initializer closure runs at
        // most once.
        let created = std::sync::atomic::AtomicBool::new(false);
        let result = slot
            .get_or_try_init(|| {
                created.store(true, std::sync::atomic::Ordering::SeqCst);
                async { init().await.map(|session| Arc::new(Mutex::new(session))) }
            })
            .await;

        match result {
            Ok(session) => Ok((
                session.clone(),
                created.load(std::sync::atomic::Ordering::SeqCst),
            )),
            Err(e) => {
                // Release the empty slot unless someone else initialized it
                // meanwhile.
                let mut slots = self.slots.lock().await;
                if let Some(existing) = slots.get(user_key) {
                    if Arc::ptr_eq(existing, &slot) && existing.get().is_none() {
                        slots.remove(user_key);
                    }
                }
                Err(e)
            }
        }
    }

    pub async fn get(&self, user_key: &str) -> Option<SharedSession> {
        let slots = self.slots.lock().await;
        slots.get(user_key).and_then(|slot| slot.get().cloned())
    }

    pub async fn remove(&self, user_key: &str) {
        let mut slots = self.slots.lock().await;
        slots.remove(user_key);
    }

    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.lock().await.is_empty()
    }

    /// Evicts sessions with no turn activity for longer than `max_idle`.
    /// Returns the evicted user keys. Sessions mid-turn hold their own lock,
    /// not the map lock, so a sweep never stalls live traffic.
    pub async fn evict_idle(&self, max_idle: Duration) -> Vec<String> {
        let candidates: Vec<(String, SharedSession)> = {
            let slots = self.slots.lock().await;
            slots
                .iter()
                .filter_map(|(k, slot)| slot.get().map(|s| (k.clone(), s.clone())))
                .collect()
        };

        let mut evicted = Vec::new();
        for (key, session) in candidates {
            let idle = session.lock().await.idle_for();
            if idle > max_idle {
                tracing::info!(user = %key, idle_secs = idle.as_secs(), "Evicting idle session");
                self.remove(&key).await;
                evicted.push(key);
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Difficulty, QuestionSpec};
    use crate::session::SessionSettings;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;

    fn blank_session(user_key: &str) -> InterviewSession {
        let (tx, _rx) = mpsc::channel(8);
        let plan = vec![QuestionSpec::plain("Q0", "general", Difficulty::Medium)];
        InterviewSession::new(user_key, plan, SessionSettings::default(), tx)
    }

    #[tokio::test]
    async fn concurrent_creates_run_the_initializer_once() {
        let registry = Arc::new(SessionRegistry::new());
        let init_calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let registry = registry.clone();
            let init_calls = init_calls.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .get_or_create("u1", || async {
                        init_calls.fetch_add(1, Ordering::SeqCst);
                        // Simulate the slow, network-bound plan build.
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(blank_session("u1"))
                    })
                    .await
                    .unwrap()
            }));
        }

        let results: Vec<(SharedSession, bool)> =
            futures_ordered(handles).await;
        assert_eq!(init_calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&results[0].0, &results[1].0));
        assert_eq!(
            results.iter().filter(|(_, created)| *created).count(),
            1,
            "exactly one caller must observe creation"
        );
        assert_eq!(registry.len().await, 1);
    }

    async fn futures_ordered(
        handles: Vec<tokio::task::JoinHandle<(SharedSession, bool)>>,
    ) -> Vec<(SharedSession, bool)> {
        let mut out = Vec::new();
        for h in handles {
            out.push(h.await.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn get_or_create_future_is_send() {
        // The future crosses task boundaries (spawned connection handlers),
        // so it must stay Send.
        fn assert_send<T: Send>(value: T) -> T {
            value
        }
        let registry = SessionRegistry::new();
        let (session, created) =
            assert_send(registry.get_or_create("u1", || async { Ok(blank_session("u1")) }))
                .await
                .unwrap();
        assert!(created);
        assert!(Arc::ptr_eq(&session, &registry.get("u1").await.unwrap()));
    }

    #[tokio::test]
    async fn failed_init_releases_the_slot() {
        let registry = SessionRegistry::new();
        let result = registry
            .get_or_create("u1", || async { anyhow::bail!("plan build failed") })
            .await;
        assert!(result.is_err());
        assert!(registry.get("u1").await.is_none());

        // A later join can create the session normally.
        let (_, created) = registry
            .get_or_create("u1", || async { Ok(blank_session("u1")) })
            .await
            .unwrap();
        assert!(created);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_are_evicted_and_active_ones_kept() {
        let registry = SessionRegistry::new();
        registry
            .get_or_create("idle", || async { Ok(blank_session("idle")) })
            .await
            .unwrap();
        registry
            .get_or_create("active", || async { Ok(blank_session("active")) })
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(25 * 60)).await;
        registry
            .get("active")
            .await
            .unwrap()
            .lock()
            .await
            .touch();
        tokio::time::advance(Duration::from_secs(10 * 60)).await;

        let evicted = registry.evict_idle(Duration::from_secs(30 * 60)).await;
        assert_eq!(evicted, vec!["idle".to_string()]);
        assert!(registry.get("idle").await.is_none());
        assert!(registry.get("active").await.is_some());
    }
}
