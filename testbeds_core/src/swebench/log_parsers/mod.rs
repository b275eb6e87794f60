//! Framework-specific classifiers that turn raw console output into test results.
//!
//! Parsers never fail: unrecognised lines are skipped, and a status-shaped line
//! with an unknown status becomes `ERROR` with a warning.

pub mod django;
pub mod pytest;
pub mod seaborn;
pub mod sympy;

pub use django::DjangoParser;
pub use pytest::{MatplotlibParser, PytestParser};
pub use seaborn::SeabornParser;
pub use sympy::SympyParser;

use crate::models::TestResult;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

static ANSI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b?\[(\d+;)*\d*m").expect("static regex"));

pub trait TestOutputParser: Send + Sync {
    fn name(&self) -> &'static str;
    fn parse(&self, log: &str) -> Vec<TestResult>;
}

/// Remove color codes and other control characters, keeping tabs.
pub fn strip_ansi(line: &str) -> String {
    ANSI_RE
        .replace_all(line, "")
        .chars()
        .filter(|c| !c.is_control() || *c == '\t')
        .collect()
}

/// Reduce a filesystem-path parameter in `name[param]` to its basename, so
/// `test_x[/tmp/abc/file.txt]` and `test_x[/file.txt]` compare equal.
pub fn normalize_test_name(name: &str) -> String {
    let (Some(open), Some(close)) = (name.find('['), name.rfind(']')) else {
        return name.to_string();
    };
    if close < open {
        return name.to_string();
    }
    let main = &name[..open];
    let option = &name[open + 1..close];
    if option.starts_with('/') && !option.starts_with("//") && !option.contains('*') {
        let base = option.rsplit('/').next().unwrap_or(option);
        format!("{main}[/{base}]")
    } else {
        format!("{main}[{option}]")
    }
}

/// Dispatch from repository (`owner/name`) to a parser.
#[derive(Clone)]
pub struct ParserRegistry {
    by_repo: HashMap<String, Arc<dyn TestOutputParser>>,
    fallback: Arc<dyn TestOutputParser>,
}

impl ParserRegistry {
    pub fn new(fallback: Arc<dyn TestOutputParser>) -> Self {
        Self {
            by_repo: HashMap::new(),
            fallback,
        }
    }

    /// The SWE-bench repositories mapped onto their test frameworks.
    pub fn swebench() -> Self {
        let pytest: Arc<dyn TestOutputParser> = Arc::new(PytestParser);
        let mut registry = Self::new(pytest.clone());
        for repo in [
            "astropy/astropy",
            "marshmallow-code/marshmallow",
            "pallets/flask",
            "psf/requests",
            "pvlib/pvlib-python",
            "pydata/xarray",
            "pydicom/pydicom",
            "pylint-dev/astroid",
            "pylint-dev/pylint",
            "pytest-dev/pytest",
            "pyvista/pyvista",
            "scikit-learn/scikit-learn",
            "sqlfluff/sqlfluff",
            "sphinx-doc/sphinx",
        ] {
            registry.register(repo, pytest.clone());
        }
        registry.register("django/django", Arc::new(DjangoParser));
        registry.register("matplotlib/matplotlib", Arc::new(MatplotlibParser));
        registry.register("mwaskom/seaborn", Arc::new(SeabornParser));
        registry.register("sympy/sympy", Arc::new(SympyParser));
        registry
    }

    pub fn register(&mut self, repo: &str, parser: Arc<dyn TestOutputParser>) {
        self.by_repo.insert(repo.to_string(), parser);
    }

    pub fn for_repo(&self, repo: &str) -> Arc<dyn TestOutputParser> {
        match self.by_repo.get(repo) {
            Some(p) => p.clone(),
            None => {
                tracing::warn!(repo, parser = self.fallback.name(), "no parser registered for repository");
                self.fallback.clone()
            }
        }
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::swebench()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_color_codes() {
        assert_eq!(strip_ansi("\x1b[32mPASSED\x1b[0m tests/a.py::t"), "PASSED tests/a.py::t");
        assert_eq!(strip_ansi("[1mFAILED[0m x"), "FAILED x");
        assert_eq!(strip_ansi("a\tb\x07"), "a\tb");
    }

    #[test]
    fn path_parameters_reduce_to_basename() {
        assert_eq!(
            normalize_test_name("tests/t.py::test_read[/tmp/pytest-0/data.csv]"),
            "tests/t.py::test_read[/data.csv]"
        );
        assert_eq!(normalize_test_name("t.py::test[//net/x]"), "t.py::test[//net/x]");
        assert_eq!(normalize_test_name("t.py::test[a-b]"), "t.py::test[a-b]");
        assert_eq!(normalize_test_name("plain"), "plain");
    }

    #[test]
    fn registry_dispatches_by_repo() {
        let reg = ParserRegistry::swebench();
        assert_eq!(reg.for_repo("django/django").name(), "django");
        assert_eq!(reg.for_repo("sympy/sympy").name(), "sympy");
        assert_eq!(reg.for_repo("psf/requests").name(), "pytest");
        assert_eq!(reg.for_repo("nobody/nothing").name(), "pytest");
    }
}
