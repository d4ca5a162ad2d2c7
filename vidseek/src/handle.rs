//! Owned service around the single transcription model instance.
//!
//! The model is loaded on first [`ModelHandleManager::acquire`] and unloaded
//! by [`ModelHandleManager::release_if_idle`] once no lease is outstanding and
//! the idle timeout has passed. Concurrent first callers share one load.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::transcribe::{ModelLoader, SpeechModel};
use crate::types::Segment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleState {
    Unloaded,
    Loading,
    Ready,
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HandleState::Unloaded => "unloaded",
            HandleState::Loading => "loading",
            HandleState::Ready => "ready",
        })
    }
}

#[derive(Default)]
struct Slot {
    model: Option<Arc<dyn SpeechModel>>,
    last_failure: Option<String>,
}

struct Shared {
    slot: AsyncMutex<Slot>,
    active: AtomicUsize,
    loading: AtomicBool,
    ready: AtomicBool,
    failed_loads: AtomicU64,
    last_used: Mutex<Instant>,
}

impl Shared {
    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .elapsed()
    }
}

/// Clears the loading flag even if the acquiring future is dropped mid-load.
struct LoadingFlag<'a>(&'a AtomicBool);

impl<'a> LoadingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for LoadingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct ModelHandleManager {
    loader: Arc<dyn ModelLoader>,
    idle_timeout: Duration,
    shared: Arc<Shared>,
}

impl ModelHandleManager {
    pub fn new(loader: Arc<dyn ModelLoader>, idle_timeout: Duration) -> Self {
        Self {
            loader,
            idle_timeout,
            shared: Arc::new(Shared {
                slot: AsyncMutex::new(Slot::default()),
                active: AtomicUsize::new(0),
                loading: AtomicBool::new(false),
                ready: AtomicBool::new(false),
                failed_loads: AtomicU64::new(0),
                last_used: Mutex::new(Instant::now()),
            }),
        }
    }

    /// Return a lease on the loaded model, loading it first if necessary.
    ///
    /// Callers that queue behind a load which then fails receive the same
    /// `ModelUnavailable` error instead of starting another load.
    pub async fn acquire(&self) -> Result<ModelLease> {
        let failures_seen = self.shared.failed_loads.load(Ordering::SeqCst);
        let mut slot = self.shared.slot.lock().await;

        if let Some(model) = &slot.model {
            return Ok(self.lease(model.clone()));
        }

        if self.shared.failed_loads.load(Ordering::SeqCst) > failures_seen {
            let reason = slot
                .last_failure
                .clone()
                .unwrap_or_else(|| "model load failed".into());
            return Err(Error::ModelUnavailable(reason));
        }

        let loaded = {
            let _flag = LoadingFlag::raise(&self.shared.loading);
            info!("loading transcription model");
            self.loader.load().await
        };

        match loaded {
            Ok(model) => {
                info!(model = model.name(), "transcription model ready");
                slot.model = Some(model.clone());
                slot.last_failure = None;
                self.shared.ready.store(true, Ordering::SeqCst);
                Ok(self.lease(model))
            }
            Err(e) => {
                warn!(error = %e, "transcription model failed to load");
                let reason = e.to_string();
                slot.last_failure = Some(reason.clone());
                self.shared.failed_loads.fetch_add(1, Ordering::SeqCst);
                Err(Error::ModelUnavailable(reason))
            }
        }
    }

    fn lease(&self, model: Arc<dyn SpeechModel>) -> ModelLease {
        self.shared.active.fetch_add(1, Ordering::SeqCst);
        self.shared.touch();
        ModelLease {
            model,
            shared: self.shared.clone(),
        }
    }

    /// Unload the model if it is loaded, unleased, and idle for at least the
    /// configured timeout. Returns true when an unload happened.
    ///
    /// Never waits: if a load or acquire holds the slot, this is a no-op.
    pub fn release_if_idle(&self) -> bool {
        let Ok(mut slot) = self.shared.slot.try_lock() else {
            return false;
        };
        if slot.model.is_none() {
            return false;
        }
        let active = self.shared.active.load(Ordering::SeqCst);
        if active > 0 {
            debug!(active, "model in use, not unloading");
            return false;
        }
        let idle = self.shared.idle_for();
        if idle < self.idle_timeout {
            return false;
        }

        slot.model = None;
        self.shared.ready.store(false, Ordering::SeqCst);
        info!(idle_secs = idle.as_secs(), "transcription model unloaded after idle timeout");
        true
    }

    pub fn state(&self) -> HandleState {
        if self.shared.loading.load(Ordering::SeqCst) {
            HandleState::Loading
        } else if self.shared.ready.load(Ordering::SeqCst) {
            HandleState::Ready
        } else {
            HandleState::Unloaded
        }
    }

    pub fn active_leases(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}

/// A counted reference to the loaded model. The model cannot be unloaded
/// while any lease is alive; dropping the lease marks the model as used.
pub struct ModelLease {
    model: Arc<dyn SpeechModel>,
    shared: Arc<Shared>,
}

impl ModelLease {
    pub fn model(&self) -> &dyn SpeechModel {
        self.model.as_ref()
    }

    /// Blocking; call from `spawn_blocking`.
    pub fn transcribe(&self, samples: &[f32]) -> Result<Vec<Segment>> {
        self.model.transcribe(samples)
    }
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        self.shared.touch();
        self.shared.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FakeModel;

    impl SpeechModel for FakeModel {
        fn name(&self) -> &str {
            "fake"
        }

        fn transcribe(&self, _samples: &[f32]) -> Result<Vec<Segment>> {
            Ok(vec![Segment {
                start: 0.0,
                end: 1.0,
                text: "hello".into(),
            }])
        }
    }

    struct CountingLoader {
        loads: AtomicUsize,
        fail: bool,
    }

    impl CountingLoader {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                loads: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl ModelLoader for CountingLoader {
        async fn load(&self) -> Result<Arc<dyn SpeechModel>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail {
                Err(Error::ModelNotFound {
                    path: "/nonexistent/ggml-base.bin".into(),
                })
            } else {
                Ok(Arc::new(FakeModel))
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_callers_load_once() {
        let loader = CountingLoader::new(false);
        let manager = ModelHandleManager::new(loader.clone(), Duration::from_secs(300));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                let lease = manager.acquire().await.unwrap();
                lease.transcribe(&[]).unwrap().len()
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), 1);
        }

        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), HandleState::Ready);
        assert_eq!(manager.active_leases(), 0);
    }

    #[tokio::test]
    async fn test_idle_unload_after_timeout() {
        let loader = CountingLoader::new(false);
        let manager = ModelHandleManager::new(loader.clone(), Duration::from_millis(20));

        drop(manager.acquire().await.unwrap());
        assert!(!manager.release_if_idle(), "not idle long enough yet");

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(manager.release_if_idle());
        assert_eq!(manager.state(), HandleState::Unloaded);

        // Next acquire loads again.
        drop(manager.acquire().await.unwrap());
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_active_lease_blocks_unload() {
        let loader = CountingLoader::new(false);
        let manager = ModelHandleManager::new(loader.clone(), Duration::ZERO);

        let lease = manager.acquire().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!manager.release_if_idle());
        assert_eq!(manager.state(), HandleState::Ready);

        // The in-flight call still works after the timeout boundary.
        assert_eq!(lease.transcribe(&[0.0; 16]).unwrap()[0].text, "hello");
        drop(lease);

        assert!(manager.release_if_idle());
        assert_eq!(manager.state(), HandleState::Unloaded);
    }

    #[tokio::test]
    async fn test_release_if_idle_when_unloaded_is_noop() {
        let manager = ModelHandleManager::new(CountingLoader::new(false), Duration::ZERO);
        assert!(!manager.release_if_idle());
        assert_eq!(manager.state(), HandleState::Unloaded);
    }

    #[tokio::test]
    async fn test_load_failure_surfaces_model_unavailable() {
        let loader = CountingLoader::new(true);
        let manager = ModelHandleManager::new(loader.clone(), Duration::from_secs(300));

        let err = manager.acquire().await.err().unwrap();
        assert!(matches!(err, Error::ModelUnavailable(_)));
        assert_eq!(manager.state(), HandleState::Unloaded);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_waiters_share_failed_load() {
        let loader = CountingLoader::new(true);
        let manager = ModelHandleManager::new(loader.clone(), Duration::from_secs(300));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move { manager.acquire().await.is_err() }));
        }
        for h in handles {
            assert!(h.await.unwrap());
        }

        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);

        // A later, independent call is free to try again.
        assert!(manager.acquire().await.is_err());
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(HandleState::Loading.to_string(), "loading");
        assert_eq!(
            serde_json::to_string(&HandleState::Ready).unwrap(),
            "\"ready\""
        );
    }
}
