use super::{TestOutputParser, strip_ansi};
use crate::models::{TestResult, TestStatus};

/// seaborn runs `pytest --no-header -rA`; besides the summary form it prints
/// `name PASSED ...` progress lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct SeabornParser;

impl TestOutputParser for SeabornParser {
    fn name(&self) -> &'static str {
        "seaborn"
    }

    fn parse(&self, log: &str) -> Vec<TestResult> {
        let passed = TestStatus::Passed.as_str();
        let failed = TestStatus::Failed.as_str();
        let mut results = Vec::new();
        for raw in log.lines() {
            let line = strip_ansi(raw);
            let parts: Vec<&str> = line.split_whitespace().collect();
            let result = match parts.as_slice() {
                [first, name, ..] if *first == failed => {
                    Some(TestResult::new(TestStatus::Failed, *name))
                }
                [first, name, ..] if *first == passed => {
                    Some(TestResult::new(TestStatus::Passed, *name))
                }
                [name, second, ..] if *second == passed => {
                    Some(TestResult::new(TestStatus::Passed, *name))
                }
                _ => None,
            };
            results.extend(result);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_both_line_forms() {
        let log = "\
tests/test_core.py::TestSemanticMapping::test_call PASSED [ 10%]
PASSED tests/test_core.py::test_other
FAILED tests/test_core.py::test_bad - AssertionError
collected 3 items
";
        let results = SeabornParser.parse(log);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].name, "tests/test_core.py::TestSemanticMapping::test_call");
        assert_eq!(results[0].status, TestStatus::Passed);
        assert_eq!(results[1].name, "tests/test_core.py::test_other");
        assert_eq!(results[2].status, TestStatus::Failed);
        assert_eq!(results[2].name, "tests/test_core.py::test_bad");
    }
}
