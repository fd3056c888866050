//! Periodic data refresh shared by the entities of one config entry.
//!
//! A coordinator owns a single update method and calls it on a fixed
//! interval. Only one refresh runs at a time; the result is published through a
//! `watch` channel so any number of entities can follow it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::error;
use tracing::info;

/// Raised by an update method when no usable data could be fetched
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct UpdateFailed(pub String);

impl UpdateFailed {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Fetches fresh data for a coordinator
#[async_trait]
pub trait UpdateMethod<T>: Send + Sync + 'static {
    async fn update(&self) -> Result<T, UpdateFailed>;
}

/// What subscribers see after each refresh
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<T> {
    /// Data of the last successful refresh, cleared when a refresh fails
    pub data: Option<T>,
    pub last_update_success: bool,
}

struct Inner<T> {
    name: String,
    interval: Duration,
    method: Arc<dyn UpdateMethod<T>>,
    tx: watch::Sender<Snapshot<T>>,
    /// Serializes refreshes so only one fetch is in flight
    refresh_lock: Mutex<()>,
}

impl<T: Clone + Send + Sync + 'static> Inner<T> {
    async fn refresh(&self) -> Result<T, UpdateFailed> {
        let _guard = self.refresh_lock.lock().await;

        match self.method.update().await {
            Ok(data) => {
                let previous = self.tx.send_replace(Snapshot {
                    data: Some(data.clone()),
                    last_update_success: true,
                });
                if !previous.last_update_success {
                    info!("Fetching {} data recovered", self.name);
                }
                Ok(data)
            }
            Err(e) => {
                let previous = self.tx.send_replace(Snapshot {
                    data: None,
                    last_update_success: false,
                });
                if previous.last_update_success {
                    error!("Error fetching {} data: {}", self.name, e);
                } else {
                    debug!("Error fetching {} data: {}", self.name, e);
                }
                Err(e)
            }
        }
    }
}

/// Periodic refresh primitive
pub struct Coordinator<T> {
    inner: Arc<Inner<T>>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<T: Clone + Send + Sync + 'static> Coordinator<T> {
    /// Create a coordinator; polling does not begin until [`Coordinator::start`]
    pub fn new(
        name: impl Into<String>,
        interval: Duration,
        method: Arc<dyn UpdateMethod<T>>,
    ) -> Self {
        let (tx, _rx) = watch::channel(Snapshot {
            data: None,
            last_update_success: true,
        });

        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                interval,
                method,
                tx,
                refresh_lock: Mutex::new(()),
            }),
            task: std::sync::Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// Run the update method once and publish the outcome
    pub async fn refresh(&self) -> Result<T, UpdateFailed> {
        self.inner.refresh().await
    }

    /// Initial refresh performed during entry setup
    ///
    /// Failure here means the entry cannot be set up; it is the caller's job to
    /// surface that, the coordinator does not retry.
    pub async fn first_refresh(&self) -> Result<T, UpdateFailed> {
        self.refresh().await
    }

    /// Latest successful data, if the last refresh succeeded
    pub fn data(&self) -> Option<T> {
        self.inner.tx.borrow().data.clone()
    }

    pub fn last_update_success(&self) -> bool {
        self.inner.tx.borrow().last_update_success
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot<T>> {
        self.inner.tx.subscribe()
    }

    /// Start polling every `interval`, first poll one interval from now
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return;
        }

        let inner = self.inner.clone();
        *task = Some(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(Instant::now() + inner.interval, inner.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                // Failures are logged and published by refresh()
                let _ = inner.refresh().await;
            }
        }));
        debug!("Started {} polling every {:?}", self.inner.name, self.inner.interval);
    }

    /// Stop polling; an in-flight refresh is abandoned
    pub fn shutdown(&self) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = task.take() {
            task.abort();
            debug!("Stopped {} polling", self.inner.name);
        }
    }
}

impl<T> Drop for Coordinator<T> {
    fn drop(&mut self) {
        let task = self.task.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use super::*;

    /// Returns queued results in order, then repeats the last one
    struct Scripted {
        results: std::sync::Mutex<VecDeque<Result<u32, UpdateFailed>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(results: Vec<Result<u32, UpdateFailed>>) -> Arc<Self> {
            Arc::new(Self {
                results: std::sync::Mutex::new(results.into()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl UpdateMethod<u32> for Scripted {
        async fn update(&self) -> Result<u32, UpdateFailed> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut results = self.results.lock().unwrap();
            if results.len() > 1 {
                results.pop_front().unwrap()
            } else {
                results.front().cloned().unwrap()
            }
        }
    }

    #[tokio::test]
    async fn test_refresh_publishes_data() {
        let method = Scripted::new(vec![Ok(7)]);
        let coordinator = Coordinator::new("test", Duration::from_secs(60), method);
        let rx = coordinator.subscribe();

        assert_eq!(coordinator.data(), None);
        assert_eq!(coordinator.first_refresh().await, Ok(7));
        assert_eq!(coordinator.data(), Some(7));
        assert!(coordinator.last_update_success());
        assert_eq!(rx.borrow().data, Some(7));
    }

    #[tokio::test]
    async fn test_failure_clears_data_and_recovers() {
        let method = Scripted::new(vec![Ok(1), Err(UpdateFailed::new("boom")), Ok(2)]);
        let coordinator = Coordinator::new("test", Duration::from_secs(60), method);

        coordinator.refresh().await.unwrap();
        assert_eq!(
            coordinator.refresh().await,
            Err(UpdateFailed::new("boom"))
        );
        assert_eq!(coordinator.data(), None);
        assert!(!coordinator.last_update_success());

        assert_eq!(coordinator.refresh().await, Ok(2));
        assert_eq!(coordinator.data(), Some(2));
        assert!(coordinator.last_update_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_polls_on_interval() {
        let method = Scripted::new(vec![Ok(1), Ok(2), Ok(3)]);
        let coordinator = Coordinator::new("test", Duration::from_secs(30), method.clone());
        let mut rx = coordinator.subscribe();

        let started = Instant::now();
        coordinator.start();

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().data, Some(1));
        assert!(started.elapsed() >= Duration::from_secs(30));

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().data, Some(2));
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert_eq!(method.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_polling() {
        let method = Scripted::new(vec![Ok(1)]);
        let coordinator = Coordinator::new("test", Duration::from_secs(10), method.clone());

        coordinator.start();
        coordinator.shutdown();
        tokio::time::sleep(Duration::from_secs(35)).await;

        assert_eq!(method.calls.load(Ordering::SeqCst), 0);
    }
}
