use super::*;
use crate::MeshConfig;
use std::{os::unix::fs::PermissionsExt, path::Path};
use tokio::time;

/// Records its arguments next to the configuration file and runs until an `.exit` marker appears.
const WAITING_PROXY: &str = r#"#!/bin/sh
echo "$@" > "$2.args.tmp" && mv "$2.args.tmp" "$2.args"
while [ ! -e "$2.exit" ]; do sleep 0.05; done
"#;

const EXITING_PROXY: &str = "#!/bin/sh\nexit 0\n";

/// Ignores SIGTERM once its arguments are recorded.
const STUBBORN_PROXY: &str = r#"#!/bin/sh
trap '' TERM
echo "$@" > "$2.args.tmp" && mv "$2.args.tmp" "$2.args"
while true; do sleep 0.05; done
"#;

const TIMEOUT: time::Duration = time::Duration::from_secs(5);

fn trace_init() -> tracing::subscriber::DefaultGuard {
    tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::TRACE)
            .finish(),
    )
}

fn install(dir: &Path, script: &str) -> PathBuf {
    let path = dir.join("proxy.sh");
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn mk_proxy(binary: PathBuf, config_dir: &Path) -> Proxy {
    Proxy::new(ProxyOptions {
        binary,
        config_dir: config_dir.to_path_buf(),
        drain_duration: Duration::from_secs(2),
        parent_shutdown_duration: Duration::from_secs(3),
        service_cluster: "reviews".to_string(),
    })
}

fn mk_config() -> Config {
    crate::generate(&[], &MeshConfig::default()).unwrap()
}

async fn wait_for_file(path: &Path) {
    time::timeout(TIMEOUT, async {
        while !path.exists() {
            time::sleep(time::Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{} must be created", path.display()));
}

async fn wait_for_live(proxy: &Proxy, expected: impl IntoIterator<Item = Epoch>) {
    let expected = expected.into_iter().collect::<BTreeSet<_>>();
    let mut live = proxy.watch_live();
    time::timeout(TIMEOUT, live.wait_for(|epochs| *epochs == expected))
        .await
        .unwrap_or_else(|_| panic!("live epochs must become {expected:?}"))
        .expect("sender must not be dropped");
}

fn config_files(dir: &Path) -> BTreeSet<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.unwrap().file_name().into_string().ok())
        .filter(|name| name.starts_with("envoy-rev") && name.ends_with(".json"))
        .collect()
}

#[tokio::test]
async fn reload_launches_successive_epochs() {
    let _tracing = trace_init();
    let bin = tempfile::tempdir().unwrap();
    let configs = tempfile::tempdir().unwrap();
    let proxy = mk_proxy(install(bin.path(), WAITING_PROXY), configs.path());
    let config = mk_config();

    assert_eq!(proxy.reload(&config).unwrap(), 0);
    let rev0 = configs.path().join("envoy-rev0.json");
    wait_for_file(&rev0.with_extension("json.args")).await;
    assert_eq!(
        std::fs::read_to_string(rev0.with_extension("json.args"))
            .unwrap()
            .trim(),
        format!(
            "-c {} --restart-epoch 0 --drain-time-s 2 --parent-shutdown-time-s 3 --service-cluster reviews",
            rev0.display()
        )
    );
    let written: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&rev0).unwrap()).unwrap();
    assert_eq!(written["admin"]["address"], "tcp://127.0.0.1:15000");

    assert_eq!(proxy.reload(&config).unwrap(), 1);
    assert_eq!(proxy.epoch(), 2);
    assert_eq!(proxy.live().keys().copied().collect::<Vec<_>>(), [0, 1]);
    assert!(proxy.live().values().all(Option::is_some));
    assert_eq!(
        config_files(configs.path()),
        ["envoy-rev0.json", "envoy-rev1.json"]
            .into_iter()
            .map(String::from)
            .collect::<BTreeSet<_>>()
    );

    // The old generation exits on its own; only its configuration is removed.
    std::fs::write(rev0.with_extension("json.exit"), "").unwrap();
    wait_for_live(&proxy, [1]).await;
    assert!(!rev0.exists());
    assert!(configs.path().join("envoy-rev1.json").exists());

    std::fs::write(configs.path().join("envoy-rev1.json.exit"), "").unwrap();
    wait_for_live(&proxy, []).await;
    assert!(config_files(configs.path()).is_empty());

    // Epochs are never reused.
    assert_eq!(proxy.epoch(), 2);
}

#[tokio::test]
async fn removed_config_does_not_block_reaping() {
    let _tracing = trace_init();
    let bin = tempfile::tempdir().unwrap();
    let configs = tempfile::tempdir().unwrap();
    let proxy = mk_proxy(install(bin.path(), WAITING_PROXY), configs.path());

    assert_eq!(proxy.reload(&mk_config()).unwrap(), 0);
    let rev0 = configs.path().join("envoy-rev0.json");
    wait_for_file(&rev0.with_extension("json.args")).await;

    std::fs::remove_file(&rev0).unwrap();
    std::fs::write(rev0.with_extension("json.exit"), "").unwrap();
    wait_for_live(&proxy, []).await;
    assert!(proxy.live().is_empty());
    assert_eq!(proxy.epoch(), 1);
}

#[tokio::test]
async fn shutdown_terminates_every_generation() {
    let _tracing = trace_init();
    let bin = tempfile::tempdir().unwrap();
    let configs = tempfile::tempdir().unwrap();
    let proxy = mk_proxy(install(bin.path(), WAITING_PROXY), configs.path());

    for epoch in 0..2 {
        assert_eq!(proxy.reload(&mk_config()).unwrap(), epoch);
        let path = proxy.options().config_path(epoch);
        wait_for_file(&path.with_extension("json.args")).await;
    }
    assert_eq!(proxy.live().len(), 2);

    time::timeout(TIMEOUT, proxy.shutdown(TIMEOUT))
        .await
        .expect("shutdown must complete");
    assert!(proxy.live().is_empty());
    assert!(config_files(configs.path()).is_empty());

    // Nothing is left to stop.
    proxy.shutdown(TIMEOUT).await;
}

#[tokio::test]
async fn shutdown_kills_processes_that_ignore_sigterm() {
    let _tracing = trace_init();
    let bin = tempfile::tempdir().unwrap();
    let configs = tempfile::tempdir().unwrap();
    let proxy = mk_proxy(install(bin.path(), STUBBORN_PROXY), configs.path());

    assert_eq!(proxy.reload(&mk_config()).unwrap(), 0);
    wait_for_file(&configs.path().join("envoy-rev0.json.args")).await;

    time::timeout(TIMEOUT, proxy.shutdown(Duration::from_millis(200)))
        .await
        .expect("shutdown must complete");
    assert!(proxy.live().is_empty());
    assert!(config_files(configs.path()).is_empty());
}

#[tokio::test]
async fn spawn_failure_leaves_state_unchanged() {
    let _tracing = trace_init();
    let configs = tempfile::tempdir().unwrap();
    let proxy = mk_proxy(configs.path().join("missing-proxy"), configs.path());

    let err = proxy.reload(&mk_config()).unwrap_err();
    assert!(matches!(err, ReloadError::Spawn { .. }), "{err}");
    assert_eq!(proxy.epoch(), 0);
    assert!(proxy.live().is_empty());
    assert!(config_files(configs.path()).is_empty());
}

#[tokio::test]
async fn write_failure_leaves_state_unchanged() {
    let _tracing = trace_init();
    let bin = tempfile::tempdir().unwrap();
    let configs = tempfile::tempdir().unwrap();
    let proxy = mk_proxy(
        install(bin.path(), EXITING_PROXY),
        &configs.path().join("missing"),
    );

    let err = proxy.reload(&mk_config()).unwrap_err();
    match err {
        ReloadError::WriteConfig { path, .. } => {
            assert_eq!(path, configs.path().join("missing").join("envoy-rev0.json"))
        }
        err => panic!("unexpected error: {err}"),
    }
    assert_eq!(proxy.epoch(), 0);
    assert!(proxy.live().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reloads_allocate_distinct_epochs() {
    let _tracing = trace_init();
    let bin = tempfile::tempdir().unwrap();
    let configs = tempfile::tempdir().unwrap();
    let proxy = mk_proxy(install(bin.path(), EXITING_PROXY), configs.path());
    let config = mk_config();

    let reloads = (0..8)
        .map(|_| {
            let proxy = proxy.clone();
            let config = config.clone();
            tokio::task::spawn_blocking(move || proxy.reload(&config))
        })
        .collect::<Vec<_>>();
    let mut epochs = Vec::new();
    for reload in reloads {
        epochs.push(reload.await.unwrap().expect("reload must succeed"));
    }
    epochs.sort_unstable();
    assert_eq!(epochs, (0..8).collect::<Vec<Epoch>>());
    assert_eq!(proxy.epoch(), 8);

    // Every process exits immediately and is reaped.
    wait_for_live(&proxy, []).await;
    assert!(config_files(configs.path()).is_empty());
}
