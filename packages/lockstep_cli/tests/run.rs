//! Runs the tool on the processors of the test machine.

use std::fs;

use lockstep::BindingMode;
use lockstep_cli::{Policy, RunError, RunInput, RunOutcome, run};
use lockstep_pmu::CounterAccess;
use testing::with_watchdog;

#[test]
fn lists_benchmarks_without_measuring() {
    let input = RunInput {
        list_benchmarks: true,
        ..RunInput::default()
    };

    let RunOutcome::Listed { benchmarks } = run(&input).unwrap() else {
        panic!("listing must not measure");
    };

    assert!(benchmarks.iter().any(|name| name == "fwq"));
}

#[test]
fn measures_null_on_every_processor() {
    with_watchdog(|| {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("null.txt");

        let input = RunInput {
            policy: Policy::Parallel,
            benchmarks: vec!["null".to_string()],
            iterations: 2,
            output: path.to_str().unwrap().to_string(),
            counter_access: CounterAccess::None,
            binding: BindingMode::Disabled,
            ..RunInput::default()
        };

        let outcome = run(&input).unwrap();

        assert_eq!(
            outcome,
            RunOutcome::Measured {
                sections: vec!["null".to_string()]
            }
        );

        let written = fs::read_to_string(&path).unwrap();
        let mut lines = written.lines();

        assert_eq!(lines.next(), Some("# null"));
        // The default layout heads every processor's columns with its id.
        assert!(lines.next().unwrap().contains("timestamp-c"));
        assert_eq!(lines.count(), 2);
    });
}

#[test]
fn refuses_to_overwrite_results() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("earlier.txt");
    fs::write(&path, "keep me").unwrap();

    let input = RunInput {
        output: path.to_str().unwrap().to_string(),
        counter_access: CounterAccess::None,
        ..RunInput::default()
    };

    assert!(matches!(run(&input), Err(RunError::OutputExists { .. })));
    assert_eq!(fs::read_to_string(&path).unwrap(), "keep me");
}
