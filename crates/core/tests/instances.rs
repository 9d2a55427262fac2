use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tapfarm_core::action::Action;
use tapfarm_core::controller::Tick;
use tapfarm_core::game::ScoreTable;
use tapfarm_core::graph::StateDefinition;
use tapfarm_core::recovery::{self, Recovery};
use tapfarm_core::settings::RunConfig;
use tapfarm_core::sink::Notification;
use tapfarm_core::testing::{fast_config, FixedGame, Harness};
use tapfarm_core::types::InstanceStatus;

fn session_end(name: &str, next: &[&str]) -> StateDefinition {
    let mut s = StateDefinition::new(name).with_next(next);
    s.completes_session = true;
    s
}

#[test]
fn cursor_holds_on_failure_and_resets_on_transition() {
    let game = FixedGame::new(
        "A",
        vec![
            StateDefinition::new("A").with_actions(vec![Action::tap("t1"), Action::tap("t2")]).with_next(&["B"]),
            StateDefinition::new("B").with_actions(vec![Action::counter()]).with_next(&["A"]),
        ],
    );
    let h = Harness::new(game);
    h.detector.script("t2", [false, false, false]);
    let (c, _probe) = h.running(1, "emulator-5554");

    let mut trace = vec![(c.snapshot().cursor, c.snapshot().state)];
    for _ in 0..6 {
        c.tick();
        let s = c.snapshot();
        trace.push((s.cursor, s.state));
    }
    let expected: Vec<(usize, String)> = [(0, "A"), (1, "A"), (1, "A"), (1, "A"), (1, "A"), (2, "A"), (0, "B")]
        .into_iter()
        .map(|(i, s)| (i, s.to_string()))
        .collect();
    assert_eq!(trace, expected);
}

#[test]
fn repeated_failures_never_advance_the_cursor() {
    let game = FixedGame::new(
        "a",
        vec![StateDefinition::new("a").with_actions(vec![Action::tap("ok"), Action::counter()]).with_next(&["a"])],
    );
    let h = Harness::new(game);
    let (c, probe) = h.running(1, "emulator-5554");
    probe.set_fail_taps(true);

    for _ in 0..5 {
        assert_eq!(c.tick(), Tick::Failed);
    }
    let s = c.snapshot();
    assert_eq!(s.cursor, 0);
    assert_eq!(s.consecutive_failures, 5);
    assert!(s.last_error.is_some());

    probe.set_fail_taps(false);
    assert_eq!(c.tick(), Tick::Advanced);
    let s = c.snapshot();
    assert_eq!(s.cursor, 1);
    assert_eq!(s.consecutive_failures, 0);
}

#[test]
fn required_templates_must_all_be_present() {
    let game = FixedGame::new(
        "a",
        vec![StateDefinition::new("a")
            .with_templates(&["header", "button"])
            .with_actions(vec![Action::tap("button")])
            .with_next(&["a"])],
    );
    let h = Harness::new(game);
    h.detector.script("button", [false]);
    let (c, probe) = h.running(1, "emulator-5554");

    assert_eq!(c.tick(), Tick::NotReady);
    assert_eq!(probe.taps(), 0);
    assert!(!c.snapshot().ready);

    assert_eq!(c.tick(), Tick::Advanced);
    assert_eq!(probe.taps(), 1);
    assert!(c.snapshot().ready);
}

#[test]
fn timeout_scales_with_speed_and_restarts_once() {
    let game = FixedGame::new(
        "a",
        vec![StateDefinition::new("a")
            .with_timeout(10.0)
            .with_actions(vec![Action::counter(), Action::counter()])
            .with_next(&["a"])],
    );
    let config = RunConfig { speed: 2.0, ..fast_config() };
    let h = Harness::with_config(game, config);
    let (c, probe) = h.running(1, "emulator-5554");
    assert_eq!(c.tick(), Tick::Advanced);

    h.clock.advance_secs(19.0);
    assert_eq!(recovery::check(&c), None);

    h.clock.advance_secs(2.0);
    assert_eq!(recovery::check(&c), Some(Recovery::Restarted));
    assert_eq!(recovery::check(&c), None);

    let s = c.snapshot();
    assert_eq!(probe.restarts(), 1);
    assert_eq!(s.restarts, 1);
    assert_eq!(s.state, "a");
    assert_eq!(s.cursor, 0);
    assert_eq!(s.status, InstanceStatus::Running);
    // accounting survives a recovery
    assert_eq!(s.counter, 1);
}

#[test]
fn paused_time_does_not_count_toward_timeout() {
    let game = FixedGame::new(
        "a",
        vec![StateDefinition::new("a").with_timeout(10.0).with_actions(vec![Action::counter()]).with_next(&["a"])],
    );
    let h = Harness::new(game);
    let (c, _probe) = h.running(1, "emulator-5554");

    h.clock.advance_secs(5.0);
    c.pause();
    h.clock.advance_secs(30.0);
    assert_eq!(c.tick(), Tick::Idle);
    assert_eq!(recovery::check(&c), None);
    assert_eq!(c.snapshot().status, InstanceStatus::Paused);

    c.resume();
    let s = c.snapshot();
    assert_eq!(s.elapsed_in_state, 5.0);
    assert_eq!(recovery::check(&c), None);
}

#[test]
fn failed_restart_is_retried_on_next_pass() {
    let game = FixedGame::new("a", vec![StateDefinition::new("a").with_actions(vec![Action::counter()]).with_next(&["a"])]);
    let h = Harness::new(game);
    let (c, probe) = h.running(1, "emulator-5554");
    probe.fail_next_restarts(1);

    c.request_restart();
    assert_eq!(c.tick(), Tick::Idle);
    assert_eq!(recovery::check(&c), Some(Recovery::Failed));
    let s = c.snapshot();
    assert_eq!(s.status, InstanceStatus::Restarting);
    assert_eq!(s.restart_failures, 1);
    assert!(matches!(
        h.notifier.events().as_slice(),
        [Notification::RestartFailed { attempts: 1, .. }]
    ));

    assert_eq!(recovery::check(&c), Some(Recovery::Restarted));
    let s = c.snapshot();
    assert_eq!(s.status, InstanceStatus::Running);
    assert_eq!(s.restarts, 1);
    assert_eq!(probe.restarts(), 1);
}

#[test]
fn counter_only_resets_when_a_session_completes() {
    let mut play = StateDefinition::new("play")
        .with_actions(vec![Action::counter(), Action::counter()])
        .with_next(&["result"]);
    play.processes_items = true;
    let scores = ScoreTable::new(HashMap::from([("SSR".to_string(), 10)]), 1);
    let game = FixedGame::new("play", vec![play, session_end("result", &["play"])])
        .with_items(&["ssr"])
        .with_scores(scores)
        .with_notify_threshold(15);
    let h = Harness::new(game);
    let (c, _probe) = h.running(1, "emulator-5554");

    let mut counters = Vec::new();
    for _ in 0..3 {
        c.tick();
        counters.push(c.snapshot().counter);
    }
    assert_eq!(counters, vec![1, 2, 2]);
    let s = c.snapshot();
    assert_eq!(s.state, "result");
    assert_eq!((s.cycle_index, s.score), (2, 20));

    // the empty end state closes the session and moves on in one tick
    assert_eq!(c.tick(), Tick::Transitioned("play".into()));
    let s = c.snapshot();
    assert_eq!((s.counter, s.score, s.cycle_index, s.session_count), (0, 0, 0, 1));

    let events = h.notifier.events();
    assert_eq!(events.len(), 2);
    assert_eq!(
        events[0],
        Notification::SessionCompleted {
            device: "emulator-5554".into(),
            session: 1,
            score: 20,
            counter: 2,
            cycles: 2,
            items: vec!["ssr".into(), "ssr".into()],
        }
    );
    assert!(matches!(events[1], Notification::HighScore { score: 20, threshold: 15, .. }));
}

#[test]
fn branch_sees_accounting_from_before_the_reset() {
    let seen = Arc::new(Mutex::new(None));
    let seen_in_branch = Arc::clone(&seen);
    let game = FixedGame::new(
        "play",
        vec![
            StateDefinition::new("play").with_actions(vec![Action::counter()]).with_next(&["result"]),
            session_end("result", &["play", "done"]),
            StateDefinition::new("done").with_next(&["done"]),
        ],
    )
    .with_branch(move |ctx| {
        *seen_in_branch.lock().unwrap() = Some((ctx.counter, ctx.session_count));
        Ok("done".into())
    });
    let h = Harness::new(game);
    let (c, _probe) = h.running(1, "emulator-5554");

    c.tick();
    c.tick();
    assert_eq!(c.tick(), Tick::Transitioned("done".into()));
    assert_eq!(*seen.lock().unwrap(), Some((1, 0)));
    assert_eq!(c.snapshot().session_count, 1);
}

#[test]
fn contract_violation_halts_only_that_instance() {
    let game = FixedGame::new(
        "a",
        vec![
            StateDefinition::new("a").with_next(&["b", "c"]),
            StateDefinition::new("b").with_next(&["a"]),
            StateDefinition::new("c").with_next(&["a"]),
        ],
    )
    .with_branch(|ctx| Ok(if ctx.device == "bad" { "nowhere".into() } else { ctx.candidates[1].clone() }));
    let h = Harness::new(game);
    let (bad, _) = h.running(1, "bad");
    let (good, _) = h.running(2, "good");

    assert_eq!(bad.tick(), Tick::Halted);
    assert_eq!(good.tick(), Tick::Transitioned("c".into()));

    let s = bad.snapshot();
    assert_eq!(s.status, InstanceStatus::Stopped);
    assert!(s.halt_reason.as_deref().is_some_and(|r| r.contains("nowhere")));
    assert_eq!(good.snapshot().status, InstanceStatus::Running);
    assert!(matches!(
        h.notifier.events().as_slice(),
        [Notification::InstanceHalted { device, .. }] if device == "bad"
    ));
}

#[test]
fn concurrent_instances_fail_independently() {
    let game = FixedGame::new(
        "a",
        vec![StateDefinition::new("a").with_actions(vec![Action::tap("x"), Action::wait(0.01)]).with_next(&["a"])],
    );
    let config = RunConfig { tick_interval: 0.01, ..fast_config() };
    let h = Harness::with_config(game, config);
    let (broken, broken_probe) = h.running(1, "emulator-5554");
    let (healthy, healthy_probe) = h.running(2, "emulator-5556");
    broken.stop();
    healthy.stop();
    broken_probe.set_fail_taps(true);

    broken.start();
    healthy.start();
    thread::sleep(Duration::from_millis(300));
    broken.stop();
    healthy.stop();
    broken.join();
    healthy.join();

    let b = broken.snapshot();
    assert_eq!(broken_probe.taps(), 0);
    assert_eq!(b.cursor, 0);
    assert!(b.consecutive_failures > 0);

    assert!(healthy_probe.taps() > 0);
    assert_eq!(healthy.snapshot().consecutive_failures, 0);
    assert!(h.notifier.events().is_empty());
}

fn eventually(mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn a_panicking_instance_is_stopped_and_the_rest_keep_going() {
    let game = FixedGame::new(
        "a",
        vec![
            StateDefinition::new("a").with_next(&["b", "c"]),
            StateDefinition::new("b").with_actions(vec![Action::counter()]).with_next(&["a"]),
            StateDefinition::new("c").with_next(&["a"]),
        ],
    )
    .with_branch(|ctx| {
        if ctx.device == "emulator-5554" {
            panic!("branch exploded");
        }
        Ok("b".into())
    });
    let config = RunConfig { tick_interval: 0.01, ..fast_config() };
    let h = Harness::with_config(game, config);
    let (crashing, _) = h.running(1, "emulator-5554");
    let (healthy, _) = h.running(2, "emulator-5556");
    crashing.stop();
    healthy.stop();

    crashing.start();
    healthy.start();
    assert!(eventually(|| crashing.status() == InstanceStatus::Stopped));
    crashing.join();

    let s = crashing.snapshot();
    assert!(s.halt_reason.as_deref().is_some_and(|r| r.starts_with("crashed:") && r.contains("branch exploded")));
    assert!(matches!(
        h.notifier.events().as_slice(),
        [Notification::InstanceHalted { device, .. }] if device == "emulator-5554"
    ));

    let before = healthy.snapshot().counter;
    assert!(eventually(|| healthy.snapshot().counter > before));
    assert_eq!(healthy.status(), InstanceStatus::Running);
    healthy.stop();
    healthy.join();
}

#[test]
fn stop_interrupts_an_in_flight_wait_without_moving_the_cursor() {
    let game = FixedGame::new(
        "a",
        vec![StateDefinition::new("a")
            .with_actions(vec![Action::counter(), Action::wait(30.0), Action::counter()])
            .with_next(&["a"])],
    );
    let config = RunConfig { tick_interval: 0.01, ..fast_config() };
    let h = Harness::with_config(game, config);
    let (c, _device) = h.running(1, "emulator-5554");
    c.stop();
    c.start();

    assert!(eventually(|| c.snapshot().cursor == 1));
    // let the next tick enter the wait
    thread::sleep(Duration::from_millis(100));

    let started = std::time::Instant::now();
    c.stop();
    c.join();
    assert!(started.elapsed() < Duration::from_secs(5));

    let s = c.snapshot();
    assert_eq!(s.status, InstanceStatus::Stopped);
    assert_eq!(s.cursor, 1);
    assert_eq!(s.counter, 1);
    assert_eq!(s.consecutive_failures, 0);
    assert!(s.halt_reason.is_none());
}

#[test]
fn items_only_count_when_the_game_sees_a_new_cycle() {
    let mut play = StateDefinition::new("play").with_actions(vec![Action::counter()]).with_next(&["play"]);
    play.processes_items = true;
    let h = Harness::new(FixedGame::new("play", vec![play]).with_items(&["ssr"]).with_new_cycle(false));
    let (c, _device) = h.running(1, "emulator-5554");

    assert_eq!(c.tick(), Tick::Advanced);
    let s = c.snapshot();
    assert_eq!((s.counter, s.cycle_index, s.score), (1, 0, 0));
}
