//! 按键串行执行器的并发契约：同键互斥且按提交顺序执行，异键并行，panic 不泄漏键。

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use fai_core::{actor::ActorSerializer, codes, future::Completion};
use parking_lot::Mutex;

#[test]
fn same_key_runs_one_at_a_time_in_submission_order() {
    let actor = ActorSerializer::<&'static str>::start(4).unwrap();
    let active = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let order = Arc::new(Mutex::new(Vec::new()));

    let completions: Vec<_> = (0..64)
        .map(|n| {
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            let order = Arc::clone(&order);
            actor.lock("hot-key", move || {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_micros(200));
                order.lock().push(n);
                active.fetch_sub(1, Ordering::SeqCst);
            })
        })
        .collect();

    for done in completions {
        done.wait_timeout(Duration::from_secs(10))
            .expect("task finished")
            .unwrap();
    }
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    assert_eq!(*order.lock(), (0..64).collect::<Vec<_>>());
    assert_eq!(actor.active_keys(), 0);
    actor.shutdown();
}

#[test]
fn submissions_from_many_threads_never_overlap_per_key() {
    let actor = ActorSerializer::<u8>::start(4).unwrap();
    let active = Arc::new(AtomicUsize::new(0));
    let overlap = Arc::new(AtomicUsize::new(0));

    let submitters: Vec<_> = (0..4)
        .map(|_| {
            let actor = actor.clone();
            let active = Arc::clone(&active);
            let overlap = Arc::clone(&overlap);
            thread::spawn(move || {
                (0..25)
                    .map(|_| {
                        let active = Arc::clone(&active);
                        let overlap = Arc::clone(&overlap);
                        actor.lock(1, move || {
                            if active.fetch_add(1, Ordering::SeqCst) != 0 {
                                overlap.fetch_add(1, Ordering::SeqCst);
                            }
                            active.fetch_sub(1, Ordering::SeqCst);
                        })
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    for submitter in submitters {
        for done in submitter.join().unwrap() {
            done.wait_timeout(Duration::from_secs(10)).unwrap().unwrap();
        }
    }
    assert_eq!(overlap.load(Ordering::SeqCst), 0);
    actor.shutdown();
}

#[test]
fn distinct_keys_run_in_parallel() {
    let actor = ActorSerializer::<&'static str>::start(2).unwrap();
    let gate = Completion::<()>::new();

    let waiter_gate = gate.clone();
    let blocked = actor.lock("left", move || {
        assert!(waiter_gate.wait_timeout(Duration::from_secs(5)).is_some());
    });
    let opener = actor.lock("right", move || {
        gate.fire_done(());
    });

    opener.wait_timeout(Duration::from_secs(5)).unwrap().unwrap();
    blocked.wait_timeout(Duration::from_secs(5)).unwrap().unwrap();
    actor.shutdown();
}

#[test]
fn panicking_task_reports_and_releases_the_key() {
    let actor = ActorSerializer::<u32>::start(1).unwrap();
    let failed = actor.lock(9, || panic!("task exploded"));
    let after = actor.lock(9, || {});

    let err = failed
        .wait_timeout(Duration::from_secs(5))
        .unwrap()
        .unwrap_err();
    assert_eq!(err.code(), codes::INTERNAL_TASK_PANICKED);
    assert!(err.message().contains("task exploded"));
    after.wait_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert_eq!(actor.active_keys(), 0);
    actor.shutdown();
}

#[test]
fn shutdown_drains_queued_work() {
    let actor = ActorSerializer::<u32>::start(1).unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    let completions: Vec<_> = (0..10)
        .map(|n| {
            let ran = Arc::clone(&ran);
            actor.lock(n % 3, move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();
    actor.shutdown();
    assert_eq!(ran.load(Ordering::SeqCst), 10);
    assert!(completions.iter().all(Completion::is_done));
}

#[test]
fn key_is_released_before_the_completion_fires() {
    let actor = ActorSerializer::<u32>::start(4).unwrap();
    for round in 0..200 {
        actor
            .lock(round % 2, || {})
            .wait_timeout(Duration::from_secs(5))
            .expect("task finished")
            .unwrap();
        assert_eq!(actor.active_keys(), 0, "key still held after round {round}");
    }
    actor.shutdown();
}

#[test]
fn submissions_racing_shutdown_always_complete() {
    for _ in 0..20 {
        let actor = ActorSerializer::<u8>::start(2).unwrap();
        let submitters: Vec<_> = (0..4)
            .map(|key| {
                let actor = actor.clone();
                thread::spawn(move || (0..50).map(|_| actor.lock(key, || {})).collect::<Vec<_>>())
            })
            .collect();
        actor.shutdown();
        for submitter in submitters {
            for done in submitter.join().unwrap() {
                let outcome = done
                    .wait_timeout(Duration::from_secs(5))
                    .expect("every accepted or rejected task completes");
                if let Err(err) = outcome {
                    assert_eq!(err.code(), codes::INTERNAL_SHUTDOWN);
                }
            }
        }
    }
}
