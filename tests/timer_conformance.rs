//! Debounce and timer lifecycle scenarios.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use fibersched::{Cancelled, Ivar, Scheduler, SchedulerOptions, Timer};

fn fast() -> SchedulerOptions {
    SchedulerOptions::new().timer_resolution(Duration::from_millis(20))
}

/// Schedules the timer after `offset` and records the outcome.
fn schedule_after(
    timer: &Rc<Timer>,
    offset: Duration,
    tag: u32,
    outcomes: &Rc<RefCell<Vec<(u32, Result<u32, Cancelled>)>>>,
) {
    let scheduler = Scheduler::current();
    let timer = Rc::clone(timer);
    let outcomes = Rc::clone(outcomes);
    fibersched::detach(async move {
        scheduler.sleep(offset).await;
        let outcome = timer.schedule(|| async { tag }).await;
        outcomes.borrow_mut().push((tag, outcome));
    });
}

#[test]
fn rapid_reschedules_collapse_to_the_latest() {
    // Three overlapping schedules of one 200 ms timer: the first two
    // are displaced with Cancelled, only the last fires.
    let (outcomes, fired_at) = Scheduler::run_result_with(fast(), async {
        let scheduler = Scheduler::current();
        let timer = Rc::new(scheduler.create_timer(Duration::from_millis(200)));
        let outcomes = Rc::new(RefCell::new(Vec::new()));
        let fired_at: Rc<RefCell<Option<Duration>>> = Rc::new(RefCell::new(None));
        let started = Instant::now();

        schedule_after(&timer, Duration::ZERO, 1, &outcomes);
        schedule_after(&timer, Duration::from_millis(60), 2, &outcomes);
        {
            let timer = Rc::clone(&timer);
            let outcomes = Rc::clone(&outcomes);
            let fired_at = Rc::clone(&fired_at);
            fibersched::detach(async move {
                Scheduler::current().sleep(Duration::from_millis(120)).await;
                let outcome = timer
                    .schedule(|| async {
                        fired_at.borrow_mut().replace(started.elapsed());
                        3
                    })
                    .await;
                outcomes.borrow_mut().push((3, outcome));
            });
        }

        scheduler.sleep(Duration::from_millis(600)).await;
        let result = (outcomes.borrow().clone(), *fired_at.borrow());
        result
    })
    .unwrap();

    let of = |tag| {
        outcomes
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, outcome)| *outcome)
            .unwrap_or_else(|| panic!("schedule {tag} never resolved"))
    };
    assert_eq!(of(1), Err(Cancelled));
    assert_eq!(of(2), Err(Cancelled));
    assert_eq!(of(3), Ok(3));
    // The survivor fired a full delay after the last re-arm, not after
    // the first one.
    let fired_at = fired_at.expect("surviving schedule never fired");
    assert!(fired_at >= Duration::from_millis(300), "fired early: {fired_at:?}");
}

#[test]
fn displaced_schedule_resolves_before_the_survivor_fires() {
    let order = Scheduler::run_result_with(fast(), async {
        let scheduler = Scheduler::current();
        let timer = Rc::new(scheduler.create_timer(Duration::from_millis(150)));
        let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
        {
            let timer = Rc::clone(&timer);
            let log = Rc::clone(&log);
            fibersched::detach(async move {
                match timer.schedule(|| async {}).await {
                    Err(Cancelled) => log.borrow_mut().push("displaced"),
                    Ok(()) => log.borrow_mut().push("first fired"),
                }
            });
        }
        scheduler.sleep(Duration::from_millis(40)).await;
        let survivor = timer.schedule(|| async { "survivor" }).await.unwrap();
        log.borrow_mut().push(survivor);
        let result = log.borrow().clone();
        result
    })
    .unwrap();
    assert_eq!(order, vec!["displaced", "survivor"]);
}

#[test]
fn cancelled_timer_resolves_without_firing() {
    let outcome = Scheduler::run_result_with(fast(), async {
        let scheduler = Scheduler::current();
        let timer = Rc::new(scheduler.create_timer(Duration::from_secs(30)));
        let outcome: Rc<Ivar<Result<(), Cancelled>>> = Rc::new(Ivar::new());
        {
            let timer = Rc::clone(&timer);
            let outcome = Rc::clone(&outcome);
            fibersched::detach(async move {
                outcome.fill(timer.schedule(|| async {}).await);
            });
        }
        scheduler.sleep(Duration::from_millis(50)).await;
        timer.cancel();
        outcome.read().await
    })
    .unwrap();
    assert_eq!(outcome, Err(Cancelled));
}

#[test]
fn new_delay_applies_from_the_next_schedule() {
    let elapsed = Scheduler::run_result_with(fast(), async {
        let scheduler = Scheduler::current();
        let timer = scheduler.create_timer(Duration::from_millis(300));
        timer.set_delay(Duration::from_millis(40));
        let started = Instant::now();
        timer.schedule(|| async {}).await.unwrap();
        started.elapsed()
    })
    .unwrap();
    // The shortened delay, not the construction-time one, governed the
    // arming.
    assert!(elapsed < Duration::from_millis(250), "old delay used: {elapsed:?}");
}

#[test]
fn unarmed_cancel_is_a_noop() {
    Scheduler::run_result_with(fast(), async {
        let timer = Scheduler::current().create_timer(Duration::from_millis(10));
        timer.cancel();
        timer.schedule(|| async {}).await.unwrap();
        timer.cancel();
    })
    .unwrap();
}
