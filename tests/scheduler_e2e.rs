//! End-to-end scheduler scenarios: sleep ordering, abort, starvation.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use fibersched::{RunError, Scheduler, SchedulerOptions};

fn fast() -> SchedulerOptions {
    SchedulerOptions::new().timer_resolution(Duration::from_millis(25))
}

#[test]
fn interleaved_sleeps_complete_in_scheduled_order() {
    // Fibers A and B each sleep twice; fills must land A-first, B-first,
    // A-second, B-second.
    let order = Scheduler::run_result_with(fast(), async {
        let scheduler = Scheduler::current();
        let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

        for (first, second, name) in [(50_u64, 100_u64, ["a1", "a2"]), (50, 100, ["b1", "b2"])] {
            let scheduler = scheduler.clone();
            let log = Rc::clone(&log);
            Scheduler::current().detach(async move {
                scheduler.sleep(Duration::from_millis(first)).await;
                log.borrow_mut().push(name[0]);
                scheduler.sleep(Duration::from_millis(second)).await;
                log.borrow_mut().push(name[1]);
            });
        }

        scheduler.sleep(Duration::from_millis(400)).await;
        let result = log.borrow().clone();
        result
    })
    .unwrap();
    assert_eq!(order, vec!["a1", "b1", "a2", "b2"]);
}

#[test]
fn abort_interrupts_a_long_sleep_promptly() {
    let started = Instant::now();
    let result = Scheduler::run_result_with(fast(), async {
        let scheduler = Scheduler::current();
        {
            let scheduler = scheduler.clone();
            Scheduler::current().detach(async move {
                scheduler.sleep(Duration::from_millis(50)).await;
                fibersched::abort();
            });
        }
        scheduler.sleep(Duration::from_secs(10)).await;
    });
    assert_eq!(result, Err(RunError::AbortRequested));
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "abort was not prompt: {:?}",
        started.elapsed()
    );
}

#[test]
fn blocked_run_with_no_event_source_is_starvation() {
    let started = Instant::now();
    let result = Scheduler::run_result_with(fast(), async {
        let _worker = Scheduler::current().create_worker();
        std::future::pending::<()>().await;
    });
    assert_eq!(result, Err(RunError::Never));
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "starvation diagnosis was not prompt: {:?}",
        started.elapsed()
    );
}

#[test]
fn clean_run_leaves_no_pending_events() {
    let probe: Rc<RefCell<Option<Scheduler>>> = Rc::new(RefCell::new(None));
    {
        let probe = Rc::clone(&probe);
        Scheduler::run_result_with(fast(), async move {
            let scheduler = Scheduler::current();
            let worker = scheduler.create_worker();
            for n in 0..5 {
                let task = worker.submit(move || n * n).unwrap();
                assert_eq!(task.wait().await, Ok(n * n));
            }
            scheduler.sleep(Duration::from_millis(30)).await;
            *probe.borrow_mut() = Some(scheduler);
        })
        .unwrap();
    }
    let scheduler = probe.borrow().clone().unwrap();
    assert_eq!(scheduler.events_pending(), 0);
}

#[test]
fn detached_fibers_keep_the_run_alive_until_they_matter() {
    // The detached fiber holds a pending event, so main awaiting its
    // side effect must not be diagnosed as starvation.
    let value = Scheduler::run_result_with(fast(), async {
        let scheduler = Scheduler::current();
        let cell: Rc<fibersched::Ivar<u32>> = Rc::new(fibersched::Ivar::new());
        {
            let scheduler = scheduler.clone();
            let cell = Rc::clone(&cell);
            fibersched::detach(async move {
                scheduler.sleep(Duration::from_millis(40)).await;
                cell.fill(99);
            });
        }
        cell.read().await
    })
    .unwrap();
    assert_eq!(value, 99);
}
