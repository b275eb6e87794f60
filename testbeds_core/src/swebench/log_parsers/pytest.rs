use super::{TestOutputParser, normalize_test_name, strip_ansi};
use crate::models::{TestResult, TestStatus};
use std::collections::HashMap;

/// `pytest -rA` output: status lines from the short summary, tracebacks from the
/// FAILURES and ERRORS sections.
#[derive(Debug, Default, Clone, Copy)]
pub struct PytestParser;

impl TestOutputParser for PytestParser {
    fn name(&self) -> &'static str {
        "pytest"
    }

    fn parse(&self, log: &str) -> Vec<TestResult> {
        let mut results = Vec::new();
        let mut sections: HashMap<String, Vec<String>> = HashMap::new();
        let mut current: Option<String> = None;
        let mut in_details = false;

        for raw in log.lines() {
            if raw.contains("short test summary info") {
                in_details = false;
                current = None;
                continue;
            }
            if raw.contains("= FAILURES =") || raw.contains("= ERRORS =") {
                in_details = true;
                current = None;
                continue;
            }

            let line = strip_ansi(raw);
            if let Some(result) = parse_status_line(&line) {
                results.push(result);
            }

            if !in_details {
                continue;
            }
            if line.starts_with("_____") {
                let header = line.trim_matches(|c| c == '_' || c == ' ');
                let header = header
                    .strip_prefix("ERROR at setup of ")
                    .or_else(|| header.strip_prefix("ERROR at teardown of "))
                    .unwrap_or(header)
                    .to_string();
                sections.entry(header.clone()).or_default();
                current = Some(header);
            } else if line.starts_with("=====") {
                current = None;
            } else if let Some(lines) = current.as_ref().and_then(|c| sections.get_mut(c)) {
                lines.push(line);
            }
        }

        for result in &mut results {
            if !matches!(result.status, TestStatus::Failed | TestStatus::Error) {
                continue;
            }
            if let Some(lines) = result.method.as_ref().and_then(|m| sections.get(m)) {
                if !lines.is_empty() {
                    result.failure_output = Some(lines.join("\n"));
                }
            }
        }
        results
    }
}

/// The pytest parser after rewriting `MouseButton` enum parameters to the
/// integers the expected test ids use.
#[derive(Debug, Default, Clone, Copy)]
pub struct MatplotlibParser;

impl TestOutputParser for MatplotlibParser {
    fn name(&self) -> &'static str {
        "matplotlib"
    }

    fn parse(&self, log: &str) -> Vec<TestResult> {
        let rewritten = log
            .replace("MouseButton.LEFT", "1")
            .replace("MouseButton.RIGHT", "3");
        PytestParser.parse(&rewritten)
    }
}

/// Cut a ` - message` suffix that is not inside a parameter bracket.
fn strip_message(rest: &str) -> &str {
    let mut depth = 0i32;
    for (i, c) in rest.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth -= 1,
            ' ' if depth <= 0 && rest[i..].starts_with(" - ") => return &rest[..i],
            _ => {}
        }
    }
    rest
}

fn parse_status_line(line: &str) -> Option<TestResult> {
    let prefixed = TestStatus::ALL
        .iter()
        .any(|s| line.starts_with(s.as_str()));
    let suffixed = TestStatus::ALL.iter().any(|s| line.ends_with(s.as_str()));
    if !prefixed && !suffixed {
        return None;
    }

    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() <= 1 {
        return None;
    }
    let status_token = if prefixed { tokens[0] } else { tokens[tokens.len() - 1] };
    let status_str = status_token.trim_end_matches(':');
    if status_str != TestStatus::Skipped.as_str() && !line.contains("::") {
        return None;
    }
    let status = TestStatus::parse(status_str).unwrap_or_else(|| {
        tracing::warn!(status = status_str, line, "unknown test status, recording as error");
        TestStatus::Error
    });

    if status == TestStatus::Skipped && tokens[1].starts_with('[') && tokens[1].ends_with(']') {
        let location = tokens.get(2)?;
        let file_path = location.split(':').next().map(str::to_string);
        let mut result = TestResult::new(status, tokens[2..].join(" "));
        result.file_path = file_path;
        return Some(result);
    }

    let raw_name = if prefixed {
        strip_message(line[status_token.len()..].trim())
            .trim()
            .to_string()
    } else {
        tokens[..tokens.len() - 1].join(" ")
    };
    let name = normalize_test_name(&raw_name);

    let mut result = TestResult::new(status, name);
    let parts: Vec<&str> = result.name.split("::").collect();
    if parts.len() > 1 {
        result.file_path = Some(parts[0].to_string());
        result.method = parts[1..]
            .join(".")
            .split_whitespace()
            .next()
            .map(str::to_string);
    }
    Some(result)
}
