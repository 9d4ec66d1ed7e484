//! Pool integration tests over the scripted executor
//!
//! No network: every transfer is replayed from a `Script`.

use bytes::Bytes;
use fetchpool::dispatch::QueueDispatcher;
use fetchpool::executor::{Script, ScriptedFactory, TransferError};
use fetchpool::humanize::ByteSize;
use fetchpool::job::Job;
use fetchpool::pool::{Pool, PoolError, finalize_channel};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const POLL: Duration = Duration::from_millis(10);
const DEADLINE: Duration = Duration::from_secs(5);

fn build_pool(size: usize, factory: ScriptedFactory) -> (Pool, UnboundedReceiver<Job>) {
    let (on_finalize, finished) = finalize_channel();
    let pool = Pool::builder()
        .size(size)
        .on_finalize(on_finalize)
        .executor(Arc::new(factory))
        .idle_poll_interval(POLL)
        .build()
        .unwrap();
    (pool, finished)
}

fn drain(finished: &mut UnboundedReceiver<Job>) -> Vec<Job> {
    let mut jobs = Vec::new();
    while let Ok(job) = finished.try_recv() {
        jobs.push(job);
    }
    jobs
}

async fn wait_for_busy_workers(pool: &Pool, busy: usize) {
    timeout(DEADLINE, async {
        while pool.size() - pool.count_idle() < busy {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("workers never picked up their jobs");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_five_jobs_three_workers() {
    let (mut pool, mut finished) = build_pool(3, ScriptedFactory::always(Script::ok(["body"])));

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    pool.work(move || {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        (n < 5).then(|| Job::get(format!("scripted://job/{n}")))
    })
    .unwrap();

    timeout(DEADLINE, pool.wait_until_idle()).await.unwrap();
    assert!(pool.all_idle());
    assert_eq!(pool.count_idle(), 3);

    // Stays idle while the dispatcher keeps returning nothing
    tokio::time::sleep(POLL * 5).await;
    assert!(pool.all_idle());

    pool.close().await.unwrap();

    let jobs = drain(&mut finished);
    assert_eq!(jobs.len(), 5);
    assert!(jobs.iter().all(Job::is_finalized));
    assert_eq!(pool.metrics().snapshot().jobs_finished(), 5);
    assert!(calls.load(Ordering::SeqCst) > 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_job_finalized_exactly_once() {
    let factory = ScriptedFactory::always(Script::ok(["a", "b"]));
    let (mut pool, mut finished) = build_pool(8, factory.clone());

    let jobs: Vec<Job> = (0..200)
        .map(|n| Job::get(format!("scripted://bulk/{n}")))
        .collect();
    let ids: HashSet<_> = jobs.iter().map(Job::id).collect();

    pool.work(QueueDispatcher::from_iter(jobs)).unwrap();
    timeout(DEADLINE, pool.wait_until_idle()).await.unwrap();
    pool.close().await.unwrap();

    let done = drain(&mut finished);
    assert_eq!(done.len(), 200);
    assert_eq!(factory.performed(), 200);

    let finalized: HashSet<_> = done.iter().map(Job::id).collect();
    assert_eq!(finalized, ids);
    for job in &done {
        assert_eq!(job.result().unwrap().body, Bytes::from_static(b"ab"));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_truncation_through_pool() {
    let factory = ScriptedFactory::always(Script::ok(["hello", "world!!!"]));
    let (mut pool, mut finished) = build_pool(2, factory);

    let dispatcher = QueueDispatcher::from_iter([
        Job::get("scripted://capped").with_max_body_size(ByteSize::bytes(10)),
        Job::get("scripted://whole"),
    ]);
    pool.work(dispatcher).unwrap();
    timeout(DEADLINE, pool.wait_until_idle()).await.unwrap();
    pool.close().await.unwrap();

    let done = drain(&mut finished);
    assert_eq!(done.len(), 2);

    for job in done {
        let result = job.result().unwrap();
        match job.label() {
            Some("scripted://capped") => {
                assert_eq!(result.body, Bytes::from_static(b"helloworld"));
                assert!(result.truncated());
            }
            Some("scripted://whole") => {
                assert_eq!(result.body, Bytes::from_static(b"helloworld!!!"));
                assert!(!result.truncated());
            }
            other => panic!("unexpected job {other:?}"),
        }
        assert_eq!(result.properties.bytes_downloaded, 13);
    }
    assert_eq!(pool.metrics().snapshot().jobs_truncated, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transfer_errors_are_finalized() {
    let factory = ScriptedFactory::new(|spec| {
        if spec.url.ends_with("/flaky") {
            Script::ok(["partial"]).fail_after(TransferError::Timeout)
        } else if spec.url.ends_with("/refused") {
            Script::ok(Vec::<&str>::new())
                .fail_before(TransferError::Connect("connection refused".into()))
        } else {
            Script::ok(["fine"]).status(404)
        }
    });
    let (mut pool, mut finished) = build_pool(3, factory);

    pool.work(QueueDispatcher::from_iter([
        Job::get("scripted://flaky"),
        Job::get("scripted://refused"),
        Job::get("scripted://missing"),
    ]))
    .unwrap();
    timeout(DEADLINE, pool.wait_until_idle()).await.unwrap();
    pool.close().await.unwrap();

    let done = drain(&mut finished);
    assert_eq!(done.len(), 3);

    for job in &done {
        let result = job.result().unwrap();
        match job.label() {
            Some("scripted://flaky") => {
                assert_eq!(result.error, Some(TransferError::Timeout));
                // Whatever arrived before the failure is kept
                assert_eq!(result.body, Bytes::from_static(b"partial"));
            }
            Some("scripted://refused") => {
                assert!(matches!(result.error, Some(TransferError::Connect(_))));
                assert!(result.body.is_empty());
                assert_eq!(result.status(), None);
            }
            Some("scripted://missing") => {
                // Non-2xx is a completed transfer
                assert!(result.is_success());
                assert_eq!(result.status(), Some(404));
            }
            other => panic!("unexpected job {other:?}"),
        }
    }

    let snapshot = pool.metrics().snapshot();
    assert_eq!(snapshot.jobs_completed, 1);
    assert_eq!(snapshot.jobs_failed, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_lets_jobs_in_flight_finish() {
    let factory = ScriptedFactory::always(Script::ok(["slow"]).delay(Duration::from_millis(200)));
    let (mut pool, mut finished) = build_pool(3, factory.clone());

    let jobs: Vec<Job> = (0..6)
        .map(|n| Job::get(format!("scripted://slow/{n}")))
        .collect();
    pool.work(QueueDispatcher::from_iter(jobs)).unwrap();

    wait_for_busy_workers(&pool, 3).await;
    pool.close_non_blocking();
    timeout(DEADLINE, pool.wait_until_closed())
        .await
        .unwrap()
        .unwrap();

    // Each worker finishes the job it holds, then stops before taking another
    let done = drain(&mut finished);
    assert_eq!(done.len(), 3);
    assert!(done.iter().all(Job::is_finalized));
    assert_eq!(factory.performed(), 3);
    assert!(pool.all_idle());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_kill_workers_drops_jobs_in_flight() {
    let factory = ScriptedFactory::always(Script::ok(["never"]).delay(Duration::from_secs(30)));
    let (mut pool, mut finished) = build_pool(2, factory);

    pool.work(QueueDispatcher::from_iter([
        Job::get("scripted://stuck/0"),
        Job::get("scripted://stuck/1"),
    ]))
    .unwrap();

    wait_for_busy_workers(&pool, 2).await;
    pool.kill_workers();
    assert!(pool.all_idle());

    timeout(DEADLINE, pool.wait_until_closed())
        .await
        .unwrap()
        .unwrap();
    assert!(drain(&mut finished).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interrupt_takes_down_every_worker() {
    let factory = ScriptedFactory::new(|spec| {
        if spec.url.ends_with("/interrupt") {
            Script::ok(["x"])
                .delay(Duration::from_millis(50))
                .fail_before(TransferError::Interrupted)
        } else {
            Script::ok(["x"]).delay(Duration::from_secs(30))
        }
    });
    let (mut pool, mut finished) = build_pool(4, factory);

    let interrupted = Job::get("scripted://interrupt");
    let interrupted_id = interrupted.id();
    pool.work(QueueDispatcher::from_iter([
        Job::get("scripted://slow/0"),
        Job::get("scripted://slow/1"),
        Job::get("scripted://slow/2"),
        interrupted,
    ]))
    .unwrap();

    let err = timeout(DEADLINE, pool.wait_until_closed())
        .await
        .expect("interrupt did not stop the other workers")
        .unwrap_err();

    assert!(matches!(err, PoolError::Interrupted { job, .. } if job == interrupted_id));
    assert!(drain(&mut finished).is_empty());
    assert!(pool.all_idle());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_can_be_restarted() {
    let factory = ScriptedFactory::always(Script::ok(["x"]));
    let (mut pool, mut finished) = build_pool(2, factory.clone());

    pool.work(QueueDispatcher::from_iter([
        Job::get("scripted://first/0"),
        Job::get("scripted://first/1"),
    ]))
    .unwrap();
    timeout(DEADLINE, pool.wait_until_idle()).await.unwrap();
    pool.close().await.unwrap();
    assert_eq!(drain(&mut finished).len(), 2);

    pool.work(QueueDispatcher::from_iter(
        (0..3).map(|n| Job::get(format!("scripted://second/{n}"))),
    ))
    .unwrap();
    timeout(DEADLINE, pool.wait_until_idle()).await.unwrap();
    pool.close().await.unwrap();

    assert_eq!(drain(&mut finished).len(), 3);
    assert_eq!(factory.performed(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_callback_sees_jobs_from_many_workers() {
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let mut pool = Pool::builder()
        .size(4)
        .on_finalize(Arc::new(move |job: Job| {
            assert!(job.is_finalized());
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .executor(Arc::new(ScriptedFactory::always(
            Script::ok(["x"]).delay(Duration::from_millis(5)),
        )))
        .idle_poll_interval(POLL)
        .build()
        .unwrap();

    pool.work(QueueDispatcher::from_iter(
        (0..40).map(|n| Job::get(format!("scripted://cb/{n}"))),
    ))
    .unwrap();
    timeout(DEADLINE, pool.wait_until_idle()).await.unwrap();
    pool.close().await.unwrap();

    assert_eq!(seen.load(Ordering::SeqCst), 40);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queue_refilled_while_running() {
    use fetchpool::dispatch::Dispatcher;

    let (mut pool, mut finished) = build_pool(2, ScriptedFactory::always(Script::ok(["x"])));
    let queue = Arc::new(QueueDispatcher::new());
    let source = queue.clone();
    pool.work(move || source.dispatch().ok().flatten()).unwrap();

    timeout(DEADLINE, pool.wait_until_idle()).await.unwrap();
    assert!(drain(&mut finished).is_empty());

    // Idle workers pick up new jobs on their next poll
    queue.extend((0..4).map(|n| Job::get(format!("scripted://late/{n}"))));
    timeout(DEADLINE, async {
        let mut seen = 0;
        while seen < 4 {
            if finished.recv().await.is_some() {
                seen += 1;
            }
        }
    })
    .await
    .unwrap();

    pool.close().await.unwrap();
    assert!(queue.is_empty());
}
