use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::sleep;
use vgrab_core::{JobQueue, QueueStatus};

async fn wait_until(mut predicate: impl FnMut() -> bool) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

#[tokio::test]
async fn caps_concurrency_and_reports_backlog() {
    let queue = JobQueue::new(2);
    let gate = Arc::new(Semaphore::new(0));
    let started = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for n in 0..5usize {
        let gate = Arc::clone(&gate);
        let started = Arc::clone(&started);
        handles.push(queue.submit(async move {
            started.fetch_add(1, Ordering::SeqCst);
            gate.acquire().await.unwrap().forget();
            n
        }));
    }

    let started_probe = Arc::clone(&started);
    wait_until(move || started_probe.load(Ordering::SeqCst) == 2).await;
    assert_eq!(queue.status(), QueueStatus { active: 2, queued: 3 });

    // No third job starts while both slots are held.
    sleep(Duration::from_millis(50)).await;
    assert_eq!(started.load(Ordering::SeqCst), 2);

    // Releasing a single slot starts exactly one queued job.
    gate.add_permits(1);
    let started_probe = Arc::clone(&started);
    wait_until(move || started_probe.load(Ordering::SeqCst) == 3).await;
    let queue_probe = queue.clone();
    wait_until(move || queue_probe.status() == QueueStatus { active: 2, queued: 2 }).await;

    gate.add_permits(4);
    let mut total = 0;
    for handle in handles {
        total += handle.join().await.unwrap();
    }
    assert_eq!(total, 10);

    let queue_probe = queue.clone();
    wait_until(move || queue_probe.status() == QueueStatus::default()).await;
}

#[tokio::test]
async fn each_handle_gets_its_own_result() {
    let queue = JobQueue::new(1);
    let first = queue.submit(async { "one" });
    let second = queue.submit(async { "two" });

    assert_eq!(first.join().await.unwrap(), "one");
    assert_eq!(second.join().await.unwrap(), "two");
}

#[tokio::test]
async fn panicking_job_does_not_poison_the_queue() {
    let queue = JobQueue::new(1);
    let doomed = queue.submit(async {
        panic!("job blew up");
    });
    let survivor = queue.submit(async { 7usize });

    assert!(doomed.join().await.is_err());
    assert_eq!(survivor.join().await.unwrap(), 7);

    let queue_probe = queue.clone();
    wait_until(move || queue_probe.status() == QueueStatus::default()).await;
}

#[tokio::test]
async fn queued_jobs_start_in_submission_order() {
    let queue = JobQueue::new(1);
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for n in 0..4usize {
        let order = Arc::clone(&order);
        handles.push(queue.submit(async move {
            order.lock().unwrap().push(n);
        }));
    }
    for handle in handles {
        handle.join().await.unwrap();
    }

    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
}
