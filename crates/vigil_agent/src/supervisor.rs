//! Task supervisor: one tokio task per component, restartable by name.

use crate::watchdog::{Heartbeat, Liveness, RestartError, RestartHook};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub type ComponentFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Builds a fresh instance of a component's loop.
pub type ComponentFactory = Arc<dyn Fn(Heartbeat, CancellationToken) -> ComponentFuture + Send + Sync>;

/// How long a replaced instance may take to wind down before it is aborted.
const REPLACE_GRACE: Duration = Duration::from_secs(5);

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Component {
    factory: ComponentFactory,
    running: Option<Running>,
}

pub struct Supervisor {
    liveness: Arc<Liveness>,
    runtime: Handle,
    components: Mutex<BTreeMap<String, Component>>,
}

impl Supervisor {
    /// Must be called from within a tokio runtime.
    pub fn new(liveness: Arc<Liveness>) -> Self {
        Self {
            liveness,
            runtime: Handle::current(),
            components: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn liveness(&self) -> &Arc<Liveness> {
        &self.liveness
    }

    /// Register a component and start its first instance.
    pub fn spawn(&self, name: &str, factory: ComponentFactory) {
        let running = self.start(name, &factory);
        let mut components = lock(&self.components);
        if let Some(previous) = components.insert(
            name.to_string(),
            Component {
                factory,
                running: Some(running),
            },
        ) {
            if let Some(old) = previous.running {
                old.cancel.cancel();
                old.handle.abort();
            }
        }
        info!(component = name, "Component started");
    }

    fn start(&self, name: &str, factory: &ComponentFactory) -> Running {
        let beat = self.liveness.register(name);
        let cancel = CancellationToken::new();
        let handle = self.runtime.spawn(factory(beat, cancel.clone()));
        Running { cancel, handle }
    }

    pub fn component_names(&self) -> Vec<String> {
        lock(&self.components).keys().cloned().collect()
    }

    /// True if the named component's current instance has not exited.
    pub fn is_running(&self, name: &str) -> bool {
        lock(&self.components)
            .get(name)
            .and_then(|c| c.running.as_ref())
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Cancel every component and wait up to `timeout` for them to exit.
    pub async fn shutdown(&self, timeout: Duration) {
        let running: Vec<(String, Running)> = {
            let mut components = lock(&self.components);
            components
                .iter_mut()
                .filter_map(|(name, c)| c.running.take().map(|r| (name.clone(), r)))
                .collect()
        };
        for (_, r) in &running {
            r.cancel.cancel();
        }

        let deadline = tokio::time::Instant::now() + timeout;
        for (name, r) in running {
            let mut handle = r.handle;
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(_) => info!(component = %name, "Component stopped"),
                Err(_) => {
                    warn!(component = %name, "Component did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
    }
}

impl RestartHook for Supervisor {
    fn restart(&self, component: &str) -> Result<(), RestartError> {
        let factory = lock(&self.components)
            .get(component)
            .map(|c| c.factory.clone())
            .ok_or_else(|| RestartError::UnknownComponent(component.to_string()))?;

        let fresh = self.start(component, &factory);
        let old = {
            let mut components = lock(&self.components);
            match components.get_mut(component) {
                Some(c) => c.running.replace(fresh),
                None => {
                    fresh.cancel.cancel();
                    fresh.handle.abort();
                    return Err(RestartError::UnknownComponent(component.to_string()));
                }
            }
        };

        // Ask the stalled instance to stop; abort it if it will not.
        if let Some(old) = old {
            old.cancel.cancel();
            let name = component.to_string();
            self.runtime.spawn(async move {
                let mut handle = old.handle;
                if tokio::time::timeout(REPLACE_GRACE, &mut handle).await.is_err() {
                    warn!(component = %name, "Replaced instance ignored cancellation, aborting");
                    handle.abort();
                }
            });
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Wrap an async component constructor as a [`ComponentFactory`].
pub fn factory<F, Fut>(build: F) -> ComponentFactory
where
    F: Fn(Heartbeat, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |beat, cancel| Box::pin(build(beat, cancel)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_restart_replaces_instance_and_reregisters() {
        let liveness = Arc::new(Liveness::new());
        let supervisor = Supervisor::new(liveness.clone());
        let starts = Arc::new(AtomicUsize::new(0));

        let counter = starts.clone();
        supervisor.spawn(
            "worker",
            factory(move |beat, cancel| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    beat.beat();
                    cancel.cancelled().await;
                }
            }),
        );
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert!(supervisor.is_running("worker"));

        supervisor.restart("worker").unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 2);
        assert!(supervisor.is_running("worker"));

        assert!(matches!(
            supervisor.restart("missing"),
            Err(RestartError::UnknownComponent(_))
        ));

        supervisor.shutdown(Duration::from_secs(1)).await;
        assert!(!supervisor.is_running("worker"));
    }

    #[tokio::test]
    async fn test_shutdown_aborts_components_ignoring_cancel() {
        let supervisor = Supervisor::new(Arc::new(Liveness::new()));
        supervisor.spawn(
            "stuck",
            factory(|_beat, _cancel| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }),
        );
        tokio::time::timeout(
            Duration::from_secs(2),
            supervisor.shutdown(Duration::from_millis(50)),
        )
        .await
        .unwrap();
    }
}
