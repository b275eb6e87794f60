use super::constants::{END_TEST_OUTPUT, START_TEST_OUTPUT};
use super::log_parsers::normalize_test_name;
use crate::models::{ResolvedStatus, TestResult, TestStatus, TestsStatus, TransitionOutcome};
use std::collections::HashSet;

/// Test section of raw output: after the start marker, up to the end marker when
/// present. `None` when the tests never started.
pub fn slice_test_output(output: &str) -> Option<&str> {
    let start = output.find(START_TEST_OUTPUT)? + START_TEST_OUTPUT.len();
    let rest = &output[start..];
    Some(match rest.find(END_TEST_OUTPUT) {
        Some(end) => &rest[..end],
        None => rest,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GradeReport {
    pub resolution: ResolvedStatus,
    pub resolved: bool,
    pub tests_not_found: bool,
    pub tests_status: TestsStatus,
}

fn partition(expected: &[String], passed: &HashSet<String>) -> TransitionOutcome {
    let (success, failure): (Vec<String>, Vec<String>) = expected
        .iter()
        .cloned()
        .partition(|name| passed.contains(&normalize_test_name(name)));
    TransitionOutcome { success, failure }
}

/// Verdict for one run.
///
/// `FULL` when every fail-to-pass test passes and no pass-to-pass test regressed.
/// Otherwise `NONE` when no fail-to-pass test passes, else `PARTIAL`. Output with
/// no test marker grades as `NONE` with `tests_not_found` set.
pub fn grade(
    fail_to_pass: &[String],
    pass_to_pass: &[String],
    results: &[TestResult],
    tests_found: bool,
) -> GradeReport {
    if !tests_found {
        return GradeReport {
            resolution: ResolvedStatus::None,
            resolved: false,
            tests_not_found: true,
            tests_status: TestsStatus {
                fail_to_pass: TransitionOutcome {
                    success: Vec::new(),
                    failure: fail_to_pass.to_vec(),
                },
                pass_to_pass: TransitionOutcome {
                    success: Vec::new(),
                    failure: pass_to_pass.to_vec(),
                },
            },
        };
    }

    let passed: HashSet<String> = results
        .iter()
        .filter(|r| r.status == TestStatus::Passed)
        .map(|r| normalize_test_name(&r.name))
        .collect();
    let f2p = partition(fail_to_pass, &passed);
    let p2p = partition(pass_to_pass, &passed);

    let resolution = if f2p.failure.is_empty() && p2p.failure.is_empty() {
        ResolvedStatus::Full
    } else if f2p.success.is_empty() {
        ResolvedStatus::None
    } else {
        ResolvedStatus::Partial
    };
    GradeReport {
        resolution,
        resolved: resolution == ResolvedStatus::Full,
        tests_not_found: false,
        tests_status: TestsStatus {
            fail_to_pass: f2p,
            pass_to_pass: p2p,
        },
    }
}
