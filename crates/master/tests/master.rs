use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use master::{AtomInput, PipelineMaster, PipelineRecord, Transform, PIPELINES_PREFIX};
use orchestrator::{LocalOrchestrator, Orchestrator};
use store::{lease, Collection, Store};
use tokio::sync::watch;

const ROOT: &str = "basin";
const LEASE_TTL_SECS: u64 = 5;

fn pipelines(store: &Store) -> Collection<PipelineRecord> {
    Collection::new(store, format!("{ROOT}/{PIPELINES_PREFIX}"))
}

fn record(name: &str, version: u64) -> PipelineRecord {
    PipelineRecord {
        name: name.to_string(),
        version,
        parallelism: 2,
        transform: Transform {
            image: "worker:1".to_string(),
            cmd: vec!["/worker".to_string()],
        },
        inputs: vec![AtomInput {
            name: "in".to_string(),
            repo: "in".to_string(),
            glob: "/*".to_string(),
        }],
        ..Default::default()
    }
}

async fn wait_until<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..1000 {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

async fn controller_names(orch: &LocalOrchestrator) -> Vec<String> {
    orch.list_worker_controllers()
        .await
        .unwrap()
        .into_iter()
        .map(|spec| spec.pipeline)
        .collect()
}

fn spawn_master(
    store: &Store,
    orch: &Arc<LocalOrchestrator>,
) -> (watch::Sender<bool>, tokio::task::JoinHandle<()>) {
    let master = PipelineMaster::new(store.clone(), ROOT, orch.clone(), LEASE_TTL_SECS);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move { master.run(shutdown_rx).await });
    (shutdown_tx, task)
}

#[tokio::test]
async fn puts_upsert_and_deletes_remove_controllers() {
    let store = Store::new();
    let orch = Arc::new(LocalOrchestrator::new());
    let (shutdown_tx, master_task) = spawn_master(&store, &orch);

    let pipelines = pipelines(&store);
    pipelines.put("edges", &record("edges", 1)).await.unwrap();
    wait_until(|| async { controller_names(&orch).await.contains(&"edges".to_string()) }).await;

    // Re-upserting the same record is indistinguishable from the first.
    pipelines.put("edges", &record("edges", 1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(controller_names(&orch).await, vec!["edges".to_string()]);

    // A version bump flows through to the controller spec.
    pipelines.put("edges", &record("edges", 2)).await.unwrap();
    wait_until(|| async {
        orch.list_worker_controllers()
            .await
            .unwrap()
            .iter()
            .any(|spec| spec.pipeline == "edges" && spec.version == 2)
    })
    .await;

    pipelines.delete("edges").await.unwrap();
    wait_until(|| async { controller_names(&orch).await.is_empty() }).await;

    shutdown_tx.send(true).unwrap();
    master_task.await.unwrap();
}

#[tokio::test]
async fn stopped_pipelines_are_ignored() {
    let store = Store::new();
    let orch = Arc::new(LocalOrchestrator::new());
    let (shutdown_tx, master_task) = spawn_master(&store, &orch);

    let pipelines = pipelines(&store);
    let mut stopped = record("paused", 1);
    stopped.stopped = true;
    pipelines.put("paused", &stopped).await.unwrap();
    pipelines.put("live", &record("live", 1)).await.unwrap();

    wait_until(|| async { controller_names(&orch).await.contains(&"live".to_string()) }).await;
    assert_eq!(controller_names(&orch).await, vec!["live".to_string()]);

    shutdown_tx.send(true).unwrap();
    master_task.await.unwrap();
}

#[tokio::test]
async fn the_lease_keeps_a_second_master_idle() {
    let store = Store::new();
    let orch = Arc::new(LocalOrchestrator::new());

    // Somebody else already holds the master lease.
    let held = lease::acquire(&store, "pipeline-master", LEASE_TTL_SECS)
        .await
        .unwrap();

    let (shutdown_tx, master_task) = spawn_master(&store, &orch);

    let pipelines = pipelines(&store);
    pipelines.put("edges", &record("edges", 1)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        controller_names(&orch).await.is_empty(),
        "a master without the lease must not reconcile"
    );

    held.release().await;
    wait_until(|| async { controller_names(&orch).await.contains(&"edges".to_string()) }).await;

    shutdown_tx.send(true).unwrap();
    master_task.await.unwrap();

    // Shutdown released the lease: it can be taken again immediately.
    let retaken = tokio::time::timeout(
        Duration::from_secs(2),
        lease::acquire(&store, "pipeline-master", LEASE_TTL_SECS),
    )
    .await
    .expect("lease should be free after shutdown")
    .unwrap();
    retaken.release().await;
}
