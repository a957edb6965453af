//! Scenario and property-test battery for the detector core.
//!
//! Each scenario function is a plain, public entry point rather than a bare
//! `#[test]`, so both this crate's own test module and the CLI's
//! `selftest` subcommand can run the same battery and compare against the
//! same expected race counts.

use std::sync::{Arc, Mutex};

use racewatch_core::config::Config;
use racewatch_core::engine::Engine;
use racewatch_core::error::DetectorError;
use racewatch_core::race::Race;
use racewatch_core::sink::Sink;

#[derive(Clone, Default)]
struct SharedSink(Arc<Mutex<Vec<Race>>>);

impl Sink for SharedSink {
    fn write_race(&mut self, race: &Race) -> Result<(), DetectorError> {
        self.0.lock().unwrap().push(race.clone());
        Ok(())
    }
    fn flush(&mut self) -> Result<(), DetectorError> {
        Ok(())
    }
    fn close(&mut self) -> Result<(), DetectorError> {
        Ok(())
    }
}

fn unsampled_config() -> Config {
    let mut cfg = Config::default();
    cfg.sampling.period = 1;
    cfg
}

fn race_count(f: impl FnOnce(&Engine)) -> usize {
    let engine = Engine::init(unsampled_config());
    f(&engine);
    let shared = SharedSink::default();
    let mut sinks: Vec<Box<dyn Sink>> = vec![Box::new(shared.clone())];
    engine.finalize(&mut sinks);
    let count = shared.0.lock().unwrap().len();
    count
}

/// Result of running one named scenario against the detector core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioResult {
    pub name: &'static str,
    pub expected_races: usize,
    pub actual_races: usize,
}

impl ScenarioResult {
    pub fn passed(&self) -> bool {
        self.expected_races == self.actual_races
    }
}

pub fn scenario_wr_race() -> ScenarioResult {
    let actual = race_count(|engine| {
        let master = engine.register_thread(1);
        let t10 = engine.fork(&master, 10);
        let t11 = engine.fork(&master, 11);
        engine.write(&t10, 0xAAAA, 0x100000, 8);
        engine.read(&t11, 0xBBBB, 0x100000, 8);
    });
    ScenarioResult { name: "WR_Race", expected_races: 1, actual_races: actual }
}

pub fn scenario_locked() -> ScenarioResult {
    let actual = race_count(|engine| {
        let master = engine.register_thread(1);
        let t20 = engine.fork(&master, 20);
        let t21 = engine.fork(&master, 21);

        engine.acquire(&t20, 0xF00D);
        engine.write(&t20, 0x1, 0x200000, 8);
        engine.read(&t20, 0x2, 0x200000, 8);
        engine.release(&t20, 0xF00D);

        engine.acquire(&t21, 0xF00D);
        engine.write(&t21, 0x3, 0x200000, 8);
        engine.read(&t21, 0x4, 0x200000, 8);
        engine.release(&t21, 0xF00D);
    });
    ScenarioResult { name: "Locked", expected_races: 0, actual_races: actual }
}

pub fn scenario_thread_exit_ordering() -> ScenarioResult {
    let actual = race_count(|engine| {
        let master = engine.register_thread(1);
        let t30 = engine.fork(&master, 30);
        engine.write(&t30, 0x10, 0x320000, 8);
        let t31 = engine.fork(&t30, 31);
        engine.write(&t31, 0x11, 0x320000, 8);
        engine.join(&t30, 31);
        engine.read(&t30, 0x12, 0x320000, 8);
    });
    ScenarioResult { name: "ThreadExitOrdering", expected_races: 0, actual_races: actual }
}

pub fn scenario_happens_before_annotation() -> ScenarioResult {
    let actual = race_count(|engine| {
        let master = engine.register_thread(1);
        let t50 = engine.fork(&master, 50);
        let t51 = engine.fork(&master, 51);

        engine.write(&t50, 0x20, 0x500000, 8);
        engine.happens_before(&t50, 0x50510000);
        engine.happens_after(&t51, 0x50510000);
        engine.write(&t51, 0x21, 0x500000, 8);
    });
    ScenarioResult { name: "HappensBeforeAnnotation", expected_races: 0, actual_races: actual }
}

pub fn scenario_barrier() -> ScenarioResult {
    let actual = race_count(|engine| {
        let master = engine.register_thread(1);
        let t70 = engine.fork(&master, 70);
        let t71 = engine.fork(&master, 71);
        let t72 = engine.fork(&master, 72);

        engine.write(&t70, 0x30, 0x700000, 8);
        engine.write(&t71, 0x31, 0x700001, 8);
        engine.write(&t72, 0x32, 0x700002, 8);

        engine.happens_before(&t70, 0x0700);
        engine.happens_after(&t71, 0x0700);

        engine.write(&t72, 0x33, 0x700000, 8);
    });
    ScenarioResult { name: "Barrier", expected_races: 1, actual_races: actual }
}

pub fn scenario_reset_on_free() -> ScenarioResult {
    let actual = race_count(|engine| {
        let master = engine.register_thread(1);
        let t80 = engine.fork(&master, 80);
        let t81 = engine.fork(&master, 81);

        engine.allocate(&t80, 0x800000, 0x10);
        engine.write(&t80, 0x40, 0x800000, 8);
        engine.deallocate(&t80, 0x800000);
        engine.happens_before(&t80, 0x800000);
        engine.happens_after(&t81, 0x800000);

        engine.allocate(&t81, 0x800000, 0x2);
        engine.write(&t81, 0x41, 0x800000, 2);
    });
    ScenarioResult { name: "ResetOnFree", expected_races: 0, actual_races: actual }
}

pub fn scenario_inspection() -> ScenarioResult {
    let engine = Engine::init(unsampled_config());
    let master = engine.register_thread(1);
    let t90 = engine.fork(&master, 90);
    let t91 = engine.fork(&master, 91);

    engine.func_enter(&t90, 0x01);
    engine.func_enter(&t90, 0x02);
    engine.func_enter(&t90, 0x0090);
    engine.write(&t90, 0x0090, 0x900000, 8);
    engine.func_exit(&t90);
    engine.func_exit(&t90);
    engine.func_exit(&t90);

    engine.func_enter(&t91, 0x03);
    engine.func_enter(&t91, 0x0091);
    engine.read(&t91, 0x0091, 0x900000, 8);
    engine.func_exit(&t91);
    engine.func_exit(&t91);

    let shared = SharedSink::default();
    let mut sinks: Vec<Box<dyn Sink>> = vec![Box::new(shared.clone())];
    engine.finalize(&mut sinks);
    let races = shared.0.lock().unwrap();

    let stacks_match = races.len() == 1
        && races[0].first.captured_stack.len().max(races[0].second.captured_stack.len()) == 3
        && races[0].first.captured_stack.len().min(races[0].second.captured_stack.len()) == 2;

    ScenarioResult {
        name: "Inspection",
        expected_races: 1,
        actual_races: if stacks_match { races.len() } else { usize::MAX },
    }
}

pub fn run_all_scenarios() -> Vec<ScenarioResult> {
    vec![
        scenario_wr_race(),
        scenario_locked(),
        scenario_thread_exit_ordering(),
        scenario_happens_before_annotation(),
        scenario_barrier(),
        scenario_reset_on_free(),
        scenario_inspection(),
    ]
}
