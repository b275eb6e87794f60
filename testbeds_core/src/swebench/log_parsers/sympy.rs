use super::{TestOutputParser, strip_ansi};
use crate::models::{TestResult, TestStatus};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// `____ sympy/core/tests/test_basic.py:test_name ____`
static FAILURE_HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(_*) (.*)\.py:(.*) (_*)$").expect("static regex"));

/// SymPy's `bin/test --verbose` output: `test_name ok|F|E` per line, then one
/// underscored block per failure naming the file and test.
#[derive(Debug, Default, Clone, Copy)]
pub struct SympyParser;

impl TestOutputParser for SympyParser {
    fn name(&self) -> &'static str {
        "sympy"
    }

    fn parse(&self, log: &str) -> Vec<TestResult> {
        let lines: Vec<String> = log.lines().map(strip_ansi).collect();
        let mut results: Vec<TestResult> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for line in &lines {
            let line = line.trim();
            if !line.starts_with("test_") {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(test), Some(mark)) = (parts.next(), parts.next()) else {
                continue;
            };
            let status = match mark {
                "ok" => TestStatus::Passed,
                "F" => TestStatus::Failed,
                "E" => TestStatus::Error,
                _ => continue,
            };
            let mut result = TestResult::new(status, test);
            result.method = Some(test.to_string());
            match index.get(test) {
                Some(&i) => results[i] = result,
                None => {
                    index.insert(test.to_string(), results.len());
                    results.push(result);
                }
            }
        }

        let mut current: Option<(String, String)> = None;
        let mut block: Vec<&str> = Vec::new();
        let mut flush = |current: &mut Option<(String, String)>, block: &mut Vec<&str>| {
            if let Some((file, method)) = current.take() {
                if let Some(&i) = index.get(&method) {
                    results[i].failure_output = Some(block.join("\n"));
                    results[i].file_path = Some(file);
                }
            }
            block.clear();
        };
        for line in &lines {
            if let Some(caps) = FAILURE_HEADER_RE.captures(line) {
                flush(&mut current, &mut block);
                current = Some((format!("{}.py", &caps[2]), caps[3].to_string()));
            } else if line.starts_with("=====") {
                flush(&mut current, &mut block);
            } else if current.is_some() && !line.trim_matches('_').is_empty() {
                block.push(line);
            }
        }
        flush(&mut current, &mut block);

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = "\
============================= test process starts ==============================
sympy/core/tests/test_basic.py[3]
test_structure ok
test_equality F
test_matches_basic E
________________________________________________________________________________
_____________ sympy/core/tests/test_basic.py:test_equality _____________________
Traceback (most recent call last):
AssertionError
________________________________________________________________________________
__________ sympy/core/tests/test_basic.py:test_matches_basic ___________________
Traceback (most recent call last):
NameError: name 'x' is not defined
============ tests finished: 1 passed, 1 failed, 1 exceptions in 0.10 seconds ==
";

    #[test]
    fn parses_marks_and_failure_blocks() {
        let results = SympyParser.parse(LOG);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].status, TestStatus::Passed);
        assert!(results[0].failure_output.is_none());

        assert_eq!(results[1].status, TestStatus::Failed);
        assert_eq!(results[1].file_path.as_deref(), Some("sympy/core/tests/test_basic.py"));
        let out = results[1].failure_output.as_deref().expect("output");
        assert!(out.contains("AssertionError"));
        assert!(!out.contains("NameError"));

        assert_eq!(results[2].status, TestStatus::Error);
        let out = results[2].failure_output.as_deref().expect("output");
        assert!(out.contains("NameError"));
        assert!(!out.contains("tests finished"));
    }
}
