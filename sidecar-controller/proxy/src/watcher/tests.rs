use super::*;
use parking_lot::Mutex;
use sidecar_controller_core::Protocol;
use sidecar_controller_registry::MemoryRegistry;
use std::sync::atomic::{AtomicBool, Ordering};

/// Records every configuration it is asked to apply.
#[derive(Default)]
struct MockAgent {
    reloads: Mutex<Vec<Config>>,
    fail: AtomicBool,
}

impl Agent for MockAgent {
    fn reload(&self, config: &Config) -> Result<Epoch, ReloadError> {
        if self.fail.load(Ordering::Acquire) {
            return Err(ReloadError::Spawn {
                binary: "envoy".into(),
                source: std::io::ErrorKind::NotFound.into(),
            });
        }
        let mut reloads = self.reloads.lock();
        reloads.push(config.clone());
        Ok(reloads.len() as Epoch - 1)
    }
}

impl MockAgent {
    fn count(&self) -> usize {
        self.reloads.lock().len()
    }
}

fn reviews() -> Service {
    Service::new("reviews")
        .with_namespace("default")
        .with_port("http", 9080, Protocol::Http)
}

fn ratings() -> Service {
    Service::new("ratings")
        .with_namespace("default")
        .with_port("http", 9080, Protocol::Http)
}

fn mk_watcher(registry: &Arc<MemoryRegistry>) -> (Arc<MockAgent>, Watcher<Arc<MockAgent>>) {
    let agent = Arc::new(MockAgent::default());
    let watcher = Watcher::new(
        agent.clone(),
        registry.clone(),
        Arc::new(MeshConfig::default()),
    );
    (agent, watcher)
}

async fn reloads_reach(agent: &MockAgent, n: usize) {
    time::timeout(time::Duration::from_secs(60), async {
        while agent.count() < n {
            time::sleep(time::Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("expected {n} reloads"));
}

#[test]
fn duplicate_notifications_reload_once() {
    let registry = Arc::new(MemoryRegistry::default());
    registry.add_service(reviews());
    let (agent, mut watcher) = mk_watcher(&registry);

    assert_eq!(watcher.reconcile().unwrap(), Reconciled::Reloaded(0));
    assert_eq!(watcher.reconcile().unwrap(), Reconciled::Unchanged);
    assert_eq!(agent.count(), 1);
    assert_eq!(watcher.current(), agent.reloads.lock().first());
}

#[test]
fn genuine_change_reloads() {
    let registry = Arc::new(MemoryRegistry::default());
    registry.add_service(reviews());
    let (agent, mut watcher) = mk_watcher(&registry);
    assert_eq!(watcher.reconcile().unwrap(), Reconciled::Reloaded(0));

    registry.add_service(ratings());
    assert_eq!(watcher.reconcile().unwrap(), Reconciled::Reloaded(1));

    let reloads = agent.reloads.lock();
    assert_ne!(reloads[0], reloads[1]);
    assert_eq!(watcher.current(), Some(&reloads[1]));
}

#[test]
fn generation_failure_does_not_reload() {
    let registry = Arc::new(MemoryRegistry::default());
    registry.add_service(Service::new("Reviews").with_port("http", 9080, Protocol::Http));
    let (agent, mut watcher) = mk_watcher(&registry);

    let err = watcher.reconcile().unwrap_err();
    assert!(matches!(err, ReconcileError::Generate(_)), "{err}");
    assert_eq!(agent.count(), 0);
    assert!(watcher.current().is_none());
}

#[test]
fn reload_failure_is_retried() {
    let registry = Arc::new(MemoryRegistry::default());
    registry.add_service(reviews());
    let (agent, mut watcher) = mk_watcher(&registry);

    agent.fail.store(true, Ordering::Release);
    let err = watcher.reconcile().unwrap_err();
    assert!(matches!(err, ReconcileError::Reload(_)), "{err}");
    assert!(watcher.current().is_none());

    // The same topology is applied once the agent recovers.
    agent.fail.store(false, Ordering::Release);
    assert_eq!(watcher.reconcile().unwrap(), Reconciled::Reloaded(0));
}

#[tokio::test(start_paused = true)]
async fn run_reloads_on_changes() {
    let _tracing = tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::TRACE)
            .finish(),
    );

    let registry = Arc::new(MemoryRegistry::default());
    registry.add_service(reviews());
    let (agent, watcher) = mk_watcher(&registry);
    let notifications = subscribe(&*registry).expect("memory registry accepts handlers");

    let (signal, shutdown) = drain::channel();
    let task = tokio::spawn(watcher.run(notifications, shutdown));

    // The proxy is started without waiting for a change.
    reloads_reach(&agent, 1).await;

    // A tag-only change does not affect routing.
    registry.add_service(reviews().with_tags(["v1"]));
    time::sleep(time::Duration::from_secs(1)).await;
    assert_eq!(agent.count(), 1);

    // A burst of changes is applied together.
    registry.add_service(ratings());
    registry.add_service(Service::new("details").with_port("http", 9080, Protocol::Http));
    reloads_reach(&agent, 2).await;
    time::sleep(time::Duration::from_secs(1)).await;
    assert_eq!(agent.count(), 2);
    assert_eq!(
        agent.reloads.lock()[1].clusters().count(),
        3,
        "the reload must include every service"
    );

    signal.drain().await;
    task.await.expect("watcher must not panic");
}

#[tokio::test(start_paused = true)]
async fn run_waits_out_the_grace_period() {
    let registry = Arc::new(MemoryRegistry::default());
    registry.add_service(reviews());
    let (agent, watcher) = mk_watcher(&registry);
    let watcher = watcher.with_grace(time::Duration::from_secs(10));
    let notifications = subscribe(&*registry).unwrap();

    let (signal, shutdown) = drain::channel();
    let task = tokio::spawn(watcher.run(notifications, shutdown));
    reloads_reach(&agent, 1).await;

    // A change during the grace period is applied once it has elapsed.
    registry.add_service(ratings());
    time::sleep(time::Duration::from_secs(5)).await;
    assert_eq!(agent.count(), 1);
    time::sleep(time::Duration::from_secs(6)).await;
    assert_eq!(agent.count(), 2);

    signal.drain().await;
    task.await.expect("watcher must not panic");
}

#[tokio::test(start_paused = true)]
async fn run_stops_when_notifications_close() {
    let discovery = Arc::new(MemoryRegistry::default());
    let (agent, watcher) = mk_watcher(&discovery);

    let controller = MemoryRegistry::default();
    let notifications = subscribe(&controller).unwrap();
    let (_signal, shutdown) = drain::channel();
    let task = tokio::spawn(watcher.run(notifications, shutdown));

    drop(controller);
    time::timeout(time::Duration::from_secs(60), task)
        .await
        .expect("watcher must stop")
        .expect("watcher must not panic");
    assert_eq!(agent.count(), 1);
}
