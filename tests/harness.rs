#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use pretty_assertions::assert_eq;
use tapharness::{Error, Harness, HarnessConfig, SilentFormatter};
use tempfile::TempDir;

const PASSING: &str = "printf '1..2\\nok 1 - alpha\\nok 2 - beta\\n'";
const FAILING: &str = "printf '1..2\\nok 1\\nnot ok 2 - broken\\n'; exit 1";
const NOISY: &str = "printf '1..1\\n'; echo 'ok 1 - from stderr' >&2; printf 'ok 1 - from stdout\\n'";

fn write_script(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    path.to_str().unwrap().to_owned()
}

fn quiet_config() -> HarnessConfig {
    HarnessConfig {
        exec: Some(vec!["sh".to_owned()]),
        formatter: Some(Box::new(SilentFormatter)),
        ..HarnessConfig::default()
    }
}

#[test]
fn sequential_run_aggregates() {
    let dir = TempDir::new().unwrap();
    let good = write_script(dir.path(), "good.t", PASSING);
    let bad = write_script(dir.path(), "bad.t", FAILING);

    let mut harness = Harness::new(quiet_config()).unwrap();
    let aggregator = harness.runtests(&[good.clone(), bad.clone()]).unwrap();

    assert_eq!(aggregator.files(), 2);
    assert_eq!(aggregator.total(), 4);
    assert_eq!(aggregator.passed(), 3);
    assert_eq!(aggregator.failed(), 1);
    assert_eq!(aggregator.good(), 1);
    assert_eq!(aggregator.bad(), 1);
    assert!(aggregator.has_errors());
    assert_eq!(aggregator.status(), "FAIL");

    let good_summary = aggregator.get(&good).unwrap();
    assert_eq!(good_summary.exit, Some(0));
    assert!(!good_summary.has_problems());

    let bad_summary = aggregator.get(&bad).unwrap();
    assert_eq!(bad_summary.exit, Some(1));
    assert!(bad_summary.has_problems());
}

#[test]
fn multiplexed_run_matches_sequential() {
    let dir = TempDir::new().unwrap();
    let tests: Vec<String> = (0..4)
        .map(|i| write_script(dir.path(), &format!("t{i}.t"), PASSING))
        .collect();

    let mut sequential = Harness::new(quiet_config()).unwrap();
    let baseline = sequential.runtests(&tests).unwrap();

    let mut config = quiet_config();
    config.jobs = 3;
    let mut parallel = Harness::new(config).unwrap();
    let aggregator = parallel.runtests(&tests).unwrap();

    assert_eq!(aggregator.total(), baseline.total());
    assert_eq!(aggregator.passed(), baseline.passed());
    assert_eq!(aggregator.files(), baseline.files());
    assert_eq!(aggregator.status(), baseline.status());
    for test in &tests {
        let a = aggregator.get(test).unwrap();
        let b = baseline.get(test).unwrap();
        assert_eq!(a.tests_run, b.tests_run);
        assert_eq!(a.passed, b.passed);
        assert_eq!(a.exit, b.exit);
    }
}

#[test]
fn forked_run_matches_sequential() {
    let dir = TempDir::new().unwrap();
    let tests: Vec<String> = (0..4)
        .map(|i| {
            let body = if i == 2 { FAILING } else { PASSING };
            write_script(dir.path(), &format!("t{i}.t"), body)
        })
        .collect();

    let mut config = quiet_config();
    config.jobs = 2;
    config.fork = true;
    let mut harness = Harness::new(config).unwrap();
    let aggregator = harness.runtests(&tests).unwrap();

    assert_eq!(aggregator.files(), 4);
    assert_eq!(aggregator.total(), 8);
    assert_eq!(aggregator.failed(), 1);
    assert!(aggregator.has_errors());
}

#[test]
fn merge_keeps_stdout_results_identical() {
    let dir = TempDir::new().unwrap();
    let noisy = write_script(dir.path(), "noisy.t", NOISY);

    let mut plain = Harness::new(quiet_config()).unwrap();
    let split = plain.runtests(&[noisy.clone()]).unwrap();
    let split_summary = split.get(&noisy).unwrap();
    assert_eq!(split_summary.tests_run, 1);
    assert_eq!(split_summary.passed, 1);

    let mut config = quiet_config();
    config.merge = true;
    let mut merged = Harness::new(config).unwrap();
    let combined = merged.runtests(&[noisy.clone()]).unwrap();
    let merged_summary = combined.get(&noisy).unwrap();
    // The stderr test line now also lands in the stream; stdout-sourced
    // results are still all there.
    assert!(merged_summary.tests_run >= split_summary.tests_run);
    assert_eq!(merged_summary.exit, Some(0));
}

#[test]
fn bailout_aborts_the_run() {
    let dir = TempDir::new().unwrap();
    let bail = write_script(
        dir.path(),
        "bail.t",
        "printf '1..3\\nok 1\\nBail out! database down\\nok 2\\n'",
    );
    let after = write_script(dir.path(), "after.t", PASSING);

    let mut harness = Harness::new(quiet_config()).unwrap();
    let err = harness.runtests(&[bail, after]).unwrap_err();
    match err {
        Error::Bailout(reason) => assert_eq!(reason, "database down"),
        other => panic!("expected bailout, got {other}"),
    }
}

#[test]
fn spool_copies_tap_verbatim() {
    let dir = TempDir::new().unwrap();
    let spool_root = TempDir::new().unwrap();
    let good = write_script(dir.path(), "good.t", PASSING);

    let mut config = quiet_config();
    config.dump_tap = Some(spool_root.path().to_path_buf());
    let mut harness = Harness::new(config).unwrap();
    harness.runtests(&[good.clone()]).unwrap();

    let copied = spool_root.path().join(good.trim_start_matches('/'));
    let content = fs::read_to_string(copied).unwrap();
    assert_eq!(content, "1..2\nok 1 - alpha\nok 2 - beta\n");
}

#[test]
fn executable_scripts_run_directly() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("direct.t");
    fs::write(&path, format!("#!/bin/sh\n{PASSING}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

    let mut config = quiet_config();
    config.exec = None;
    let mut harness = Harness::new(config).unwrap();
    let aggregator = harness
        .runtests(&[path.to_str().unwrap().to_owned()])
        .unwrap();
    assert_eq!(aggregator.status(), "PASS");
    assert_eq!(aggregator.total(), 2);
}

#[test]
fn spawn_failure_fails_that_test_only() {
    let dir = TempDir::new().unwrap();
    let first = dir.path().join("first.t").to_str().unwrap().to_owned();
    let second = dir.path().join("second.t").to_str().unwrap().to_owned();

    let mut config = quiet_config();
    config.exec = Some(vec!["tap-harness-no-such-interpreter".to_owned()]);
    let mut harness = Harness::new(config).unwrap();
    let aggregator = harness.runtests(&[first.clone(), second]).unwrap();

    // Both tests are recorded as failed runs; the first spawn failure does
    // not abort the rest of the run.
    assert_eq!(aggregator.files(), 2);
    assert!(aggregator.has_errors());
    let summary = aggregator.get(&first).unwrap();
    assert!(summary.has_problems());
    assert_eq!(summary.wait, Some(-1));
    assert_eq!(summary.parse_errors.len(), 1);
}

#[test]
fn run_callbacks_fire() {
    let dir = TempDir::new().unwrap();
    let good = write_script(dir.path(), "good.t", PASSING);

    let befores = Arc::new(AtomicUsize::new(0));
    let parsers = Arc::new(AtomicUsize::new(0));
    let tests_seen = Arc::new(AtomicUsize::new(0));
    let afters = Arc::new(AtomicUsize::new(0));

    let mut config = quiet_config();
    {
        let befores = Arc::clone(&befores);
        config
            .callbacks
            .before_runtests(move |_| {
                befores.fetch_add(1, Ordering::SeqCst);
            });
    }
    {
        let parsers = Arc::clone(&parsers);
        config.callbacks.made_parser(move |_| {
            parsers.fetch_add(1, Ordering::SeqCst);
        });
    }
    {
        let tests_seen = Arc::clone(&tests_seen);
        config
            .callbacks
            .on("test", move |_| {
                tests_seen.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    {
        let afters = Arc::clone(&afters);
        config.callbacks.after_runtests(move |aggregator| {
            if aggregator.status() == "PASS" {
                afters.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    let second = write_script(dir.path(), "good2.t", PASSING);
    let mut harness = Harness::new(config).unwrap();
    harness.runtests(&[good, second]).unwrap();

    assert_eq!(befores.load(Ordering::SeqCst), 1);
    assert_eq!(parsers.load(Ordering::SeqCst), 2);
    assert_eq!(tests_seen.load(Ordering::SeqCst), 4);
    assert_eq!(afters.load(Ordering::SeqCst), 1);
}
