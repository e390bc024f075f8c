use std::{collections::BTreeMap, io::Write, net::SocketAddr, sync::Arc, time::Duration};

use map_reduce_rs::mr::{
    assembler::partition_of,
    config::CoordinatorConfig,
    coordinator::{Coordinator, Phase},
    function::FunctionRegistry,
    job::{collect_splits, Job},
    transport::{TarpcTransport, WorkerTransport},
    worker::{self, Worker},
};
use tempfile::TempDir;

fn config() -> CoordinatorConfig {
    CoordinatorConfig {
        dispatch_timeout: Duration::from_secs(2),
        probe_interval: Duration::from_millis(50),
        probe_timeout: Duration::from_millis(500),
        schedule_interval: Duration::from_millis(20),
        retry_warning_threshold: 3,
    }
}

async fn spawn_workers(n: usize) -> Vec<SocketAddr> {
    let mut addrs = Vec::new();
    for _ in 0..n {
        let (addr, _) = worker::serve(
            "127.0.0.1:0".parse().unwrap(),
            Worker::new(FunctionRegistry::with_builtins()),
        )
        .await
        .unwrap();
        addrs.push(addr);
    }
    addrs
}

/// An address nothing listens on
fn dead_endpoint() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

fn write_splits(dir: &TempDir, contents: &[&str]) -> Vec<String> {
    contents
        .iter()
        .enumerate()
        .map(|(i, text)| {
            let path = dir.path().join(format!("pg-{}.txt", i));
            let mut file = std::fs::File::create(&path).unwrap();
            write!(file, "{}", text).unwrap();
            path.to_string_lossy().into_owned()
        })
        .collect()
}

fn counts(results: &BTreeMap<usize, String>, reduce_n: usize) -> BTreeMap<String, String> {
    let mut counts = BTreeMap::new();
    for (partition, output) in results {
        for entry in output.split(',').filter(|e| !e.is_empty()) {
            let (key, value) = entry.split_once('=').unwrap();
            assert_eq!(partition_of(key, reduce_n), *partition);
            counts.insert(key.to_string(), value.to_string());
        }
    }
    counts
}

async fn run_job(job: Job, workers: Vec<SocketAddr>) -> (Arc<Coordinator<TarpcTransport>>, BTreeMap<usize, String>) {
    let transport = Arc::new(TarpcTransport::new(Duration::from_secs(5)));
    let coordinator = Coordinator::new(job, workers, transport, config()).unwrap();
    let results = tokio::time::timeout(Duration::from_secs(20), coordinator.run())
        .await
        .expect("job should finish")
        .expect("job should succeed");
    (coordinator, results)
}

#[tokio::test]
async fn word_count_over_real_workers() {
    let dir = tempfile::tempdir().unwrap();
    let splits = write_splits(&dir, &["a b", "b c", "C d a"]);
    let workers = spawn_workers(3).await;

    let job = Job::new(splits, "word_count", "sum", 2).unwrap();
    let (coordinator, results) = run_job(job, workers).await;

    assert_eq!(results.len(), 2);
    let expected = [("a", "2"), ("b", "2"), ("c", "2"), ("d", "1")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect::<BTreeMap<_, _>>();
    assert_eq!(counts(&results, 2), expected);
    assert_eq!(coordinator.phase().await, Phase::Done);
}

#[tokio::test]
async fn job_completes_with_a_dead_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let splits = write_splits(&dir, &["the quick fox", "the lazy dog", "the end"]);
    let mut workers = spawn_workers(1).await;
    workers.insert(0, dead_endpoint());

    let job = Job::new(splits, "word_count", "count", 3).unwrap();
    let (coordinator, results) = run_job(job, workers.clone()).await;

    assert_eq!(counts(&results, 3).get("the").map(String::as_str), Some("3"));
    assert_eq!(coordinator.liveness().alive_endpoints(), vec![workers[1]]);
}

#[tokio::test]
async fn directory_inputs_expand_to_text_files() {
    let dir = tempfile::tempdir().unwrap();
    write_splits(&dir, &["aa b", "b"]);
    std::fs::write(dir.path().join("notes.md"), "ignored ignored").unwrap();
    let workers = spawn_workers(2).await;

    let splits = collect_splits(&[dir.path().to_path_buf()]).await.unwrap();
    assert_eq!(splits.len(), 2);

    let job = Job::new(splits, "char_freq", "sum", 1).unwrap();
    let (_, results) = run_job(job, workers).await;

    assert_eq!(results, BTreeMap::from([(0, "a=2,b=2".to_string())]));
}

#[tokio::test]
async fn unknown_function_is_reported_by_the_worker() {
    let workers = spawn_workers(1).await;
    let transport = TarpcTransport::new(Duration::from_secs(5));

    assert_eq!(transport.ping(workers[0]).await.unwrap(), "OK");
    let err = transport
        .map(workers[0], "/nonexistent.txt".to_string(), "grep".to_string())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("grep"), "{}", err);
}
