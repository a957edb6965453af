//! Runs the same scenario battery `racewatch-tests` exercises as unit tests,
//! reported as a pass/fail table instead of a test-harness summary.

use racewatch_tests::run_all_scenarios;

pub fn run() -> bool {
    let results = run_all_scenarios();
    let mut all_passed = true;
    for result in &results {
        if result.passed() {
            log::info!("ok   {}", result.name);
        } else {
            all_passed = false;
            log::error!(
                "FAIL {} (expected {} races, got {})",
                result.name,
                result.expected_races,
                result.actual_races
            );
        }
    }
    log::info!(
        "{}/{} scenarios passed",
        results.iter().filter(|r| r.passed()).count(),
        results.len()
    );
    all_passed
}
