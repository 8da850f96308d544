//! Worker thread scenarios: exception capture, FIFO, cancellation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use fibersched::{RunError, Scheduler, Stopped, TaskError};

#[test]
fn job_panic_is_returned_not_raised() {
    // The panicking job resolves to an error value; the worker and the
    // run both survive, and accounting drains back to zero.
    let (err, follow_up, pending) = Scheduler::run(async {
        let scheduler = Scheduler::current();
        let worker = scheduler.create_worker();
        let bad = worker.submit(|| panic!("user code raised")).unwrap();
        let err = bad.wait().await.unwrap_err();
        let follow_up = worker.submit(|| "still alive").unwrap().wait().await.unwrap();
        (err, follow_up, scheduler.events_pending())
    });
    match err {
        TaskError::Panicked(payload) => assert_eq!(payload.message(), "user code raised"),
        TaskError::Cancelled => panic!("expected a captured panic"),
    }
    assert_eq!(follow_up, "still alive");
    assert_eq!(pending, 0);
}

#[test]
fn one_worker_executes_in_submission_order() {
    let order = Scheduler::run(async {
        let worker = Scheduler::current().create_worker();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for n in 0..16 {
            let log = Arc::clone(&log);
            handles.push(
                worker
                    .submit(move || {
                        log.lock().unwrap().push(n);
                        // Stagger execution so queue order, not timing,
                        // decides.
                        thread::sleep(Duration::from_millis(1));
                    })
                    .unwrap(),
            );
        }
        for handle in handles {
            handle.wait().await.unwrap();
        }
        Arc::try_unwrap(log).unwrap().into_inner().unwrap()
    });
    assert_eq!(order, (0..16).collect::<Vec<_>>());
}

#[test]
fn cancel_is_idempotent_and_only_pre_execution() {
    let (cancelled_result, ran) = Scheduler::run(async {
        let worker = Scheduler::current().create_worker();
        let ran = Arc::new(AtomicUsize::new(0));

        let blocker = worker
            .submit(|| thread::sleep(Duration::from_millis(50)))
            .unwrap();
        let victim = {
            let ran = Arc::clone(&ran);
            worker
                .submit(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
        };

        victim.cancel();
        victim.cancel();
        let cancelled_result = victim.wait().await;
        blocker.wait().await.unwrap();
        (cancelled_result, ran.load(Ordering::SeqCst))
    });
    assert_eq!(cancelled_result, Err(TaskError::Cancelled));
    assert_eq!(ran, 0);
}

#[test]
fn stopped_worker_refuses_submissions() {
    let refused = Scheduler::run(async {
        let worker = Scheduler::current().create_worker();
        worker.stop();
        worker.submit(|| 1).err()
    });
    assert_eq!(refused, Some(Stopped));
}

#[test]
fn wait_no_cancel_on_a_cancelled_task_is_a_code_error() {
    let result = Scheduler::run_result(async {
        let worker = Scheduler::current().create_worker();
        let blocker = worker
            .submit(|| thread::sleep(Duration::from_millis(50)))
            .unwrap();
        let victim = worker.submit(|| ()).unwrap();
        victim.cancel();
        let _ = victim.wait_no_cancel().await;
        blocker.wait().await.unwrap();
    });
    match result {
        Err(RunError::Panicked(payload)) => {
            assert!(payload.message().contains("wait_no_cancel"));
        }
        other => panic!("expected the code-error panic, got {other:?}"),
    }
}

#[test]
fn many_short_jobs_account_exactly() {
    let pending = Scheduler::run(async {
        let scheduler = Scheduler::current();
        let worker = scheduler.create_worker();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..64 {
            let counter = Arc::clone(&counter);
            handles.push(
                worker
                    .submit(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap(),
            );
        }
        for handle in handles {
            handle.wait().await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 64);
        scheduler.events_pending()
    });
    assert_eq!(pending, 0);
}
