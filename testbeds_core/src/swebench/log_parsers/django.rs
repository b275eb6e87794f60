use super::{TestOutputParser, strip_ansi};
use crate::models::{TestResult, TestStatus};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static TEST_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\w+) \(([\w.]+)\)").expect("static regex"));

/// Django's `runtests.py --verbosity 2` output.
///
/// A test line is `test_x (app.tests.Class)` followed, possibly on a later line
/// after a docstring, by `... ok|FAIL|ERROR|skipped`. Tracebacks come afterwards
/// in `FAIL:` / `ERROR:` blocks separated by `=====` and `-----` rules.
#[derive(Debug, Default, Clone, Copy)]
pub struct DjangoParser;

struct Pending {
    name: String,
    method: String,
    file_path: String,
}

/// `(method, file_path)` for `test_x` in `forms_tests.tests.test_formsets.Class`.
fn locate(test: &str, dotted: &str) -> (String, String) {
    let parts: Vec<&str> = dotted.split('.').collect();
    let (module, last) = parts.split_at(parts.len().saturating_sub(1));
    let class = last
        .first()
        .filter(|c| c.chars().next().is_some_and(char::is_uppercase));
    let module_parts: Vec<&str> = module
        .iter()
        .copied()
        .filter(|p| p.chars().next().is_some_and(char::is_lowercase))
        .collect();
    let file_path = format!("tests/{}.py", module_parts.join("/"));
    let method = match class {
        Some(c) => format!("{c}.{test}"),
        None => test.to_string(),
    };
    (method, file_path)
}

fn status_of(line: &str) -> Option<TestStatus> {
    let tail = match line.split_once("...") {
        Some((_, tail)) => tail.trim(),
        None => line,
    };
    if tail.starts_with("ok") {
        Some(TestStatus::Passed)
    } else if tail.starts_with("FAIL") {
        Some(TestStatus::Failed)
    } else if tail.starts_with("ERROR") {
        Some(TestStatus::Error)
    } else if tail.starts_with("skipped") {
        Some(TestStatus::Skipped)
    } else {
        None
    }
}

/// Results keyed by method, in first-seen order.
#[derive(Default)]
struct ResultTable {
    results: Vec<TestResult>,
    index: HashMap<String, usize>,
}

impl ResultTable {
    fn upsert(&mut self, result: TestResult) {
        let key = result.method.clone().unwrap_or_default();
        match self.index.get(&key) {
            Some(&i) => self.results[i] = result,
            None => {
                self.index.insert(key, self.results.len());
                self.results.push(result);
            }
        }
    }

    fn attach(&mut self, method: &str, output: &[String], traceback_file: Option<&str>) {
        let Some(&i) = self.index.get(method) else {
            return;
        };
        if output.is_empty() {
            return;
        }
        let result = &mut self.results[i];
        result.failure_output = Some(output.join("\n"));
        if let Some(path) = traceback_file {
            let matches = result
                .file_path
                .as_deref()
                .is_some_and(|known| path.ends_with(known));
            if !matches {
                tracing::warn!(
                    method,
                    parsed = ?result.file_path,
                    traceback = path,
                    "file path mismatch, using traceback path"
                );
                result.file_path = Some(path.to_string());
            }
        }
    }
}

fn traceback_path(line: &str) -> Option<&str> {
    line.strip_prefix("File ")?.split('"').nth(1)
}

impl TestOutputParser for DjangoParser {
    fn name(&self) -> &'static str {
        "django"
    }

    fn parse(&self, log: &str) -> Vec<TestResult> {
        let lines: Vec<String> = log.lines().map(|l| strip_ansi(l).trim().to_string()).collect();
        let mut table = ResultTable::default();

        let mut pending: Option<Pending> = None;
        for line in &lines {
            if let Some(caps) = TEST_LINE_RE.captures(line) {
                let (method, file_path) = locate(&caps[1], &caps[2]);
                pending = Some(Pending {
                    name: caps[0].to_string(),
                    method,
                    file_path,
                });
            }
            let Some(p) = pending.as_ref() else {
                continue;
            };
            let Some(status) = status_of(line) else {
                continue;
            };
            // A docstring description replaces the id as the reported name.
            let name = line
                .split_once("...")
                .map(|(desc, _)| desc.trim())
                .filter(|d| !d.is_empty())
                .unwrap_or(p.name.as_str())
                .to_string();
            let mut result = TestResult::new(status, name);
            result.method = Some(p.method.clone());
            result.file_path = Some(p.file_path.clone());
            table.upsert(result);
            pending = None;
        }

        let mut method: Option<String> = None;
        let mut output: Vec<String> = Vec::new();
        let mut traceback_file: Option<String> = None;
        for line in &lines {
            if line.starts_with("====================") {
                if let Some(m) = method.take() {
                    table.attach(&m, &output, traceback_file.as_deref());
                }
                output = vec![line.clone()];
                traceback_file = None;
            } else if line.starts_with("--------------------------") && traceback_file.is_some() {
                if let Some(m) = method.take() {
                    table.attach(&m, &output, traceback_file.as_deref());
                }
                output.clear();
                traceback_file = None;
            } else if let Some(test) = line
                .strip_prefix("ERROR: ")
                .or_else(|| line.strip_prefix("FAIL: "))
            {
                let test = test.trim();
                method = Some(match TEST_LINE_RE.captures(test) {
                    Some(caps) => locate(&caps[1], &caps[2]).0,
                    None => {
                        tracing::warn!(test, "unrecognised failing test id");
                        test.to_string()
                    }
                });
                output.push(line.clone());
            } else if method.is_some() {
                output.push(line.clone());
                if traceback_file.is_none() {
                    traceback_file = traceback_path(line).map(str::to_string);
                }
            }
        }
        if let Some(m) = method {
            table.attach(&m, &output, traceback_file.as_deref());
        }

        table.results
    }
}
