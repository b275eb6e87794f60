//! Markers embedded in execution output and the per-repository command table.

pub const APPLY_PATCH_PASS: &str = ">>>>> Applied Patch";
pub const APPLY_PATCH_FAIL: &str = ">>>>> Patch Apply Failed";
pub const START_TEST_OUTPUT: &str = ">>>>> Start Test Output";
pub const END_TEST_OUTPUT: &str = ">>>>> End Test Output";

/// Delimiter for inlining the test patch as a shell heredoc.
pub const HEREDOC_DELIMITER: &str = "EOF_114329324912";

pub const ENV_NAME: &str = "testbed";
pub const REPO_DIRECTORY: &str = "/testbed";

/// Extensions in a test patch that never name a runnable test.
pub const NON_TEST_EXTS: &[&str] = &[
    ".json", ".png", "csv", ".txt", ".md", ".jpg", ".jpeg", ".pkl", ".yml", ".yaml", ".toml",
];

pub const TEST_PYTEST: &str = "pytest -rA";

const DJANGO_LOCALE: &[&str] = &[
    "sed -i '/en_US.UTF-8/s/^# //g' /etc/locale.gen && locale-gen",
    "export LANG=en_US.UTF-8",
    "export LANGUAGE=en_US:en",
    "export LC_ALL=en_US.UTF-8",
];

const PIP_EDITABLE: Option<&str> = Some("python -m pip install -e .");

const TEST_DJANGO: &str = "./tests/runtests.py --verbosity 2 --settings=test_sqlite --parallel 1";
const DJANGO_LEGACY: &[&str] = &["1.9", "1.10", "1.11", "2.0", "2.1", "2.2"];

const MATPLOTLIB_APT: &str = "apt-get -y update && apt-get -y upgrade && DEBIAN_FRONTEND=noninteractive apt-get install -y imagemagick ffmpeg libfreetype6-dev pkg-config";
const MATPLOTLIB_LEGACY: &[&str] = &["3.0", "3.1", "3.2", "3.3", "3.4"];

/// Commands for one repository, optionally narrowed to some of its versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepoSpec {
    pub repo: &'static str,
    /// Versions this entry applies to; empty means every version without its own entry.
    pub versions: &'static [&'static str],
    pub test_cmd: &'static str,
    /// Run before `install` when the repository is first set up.
    pub pre_install: &'static [&'static str],
    pub install: Option<&'static str>,
    /// Run before anything else in the evaluation script.
    pub eval_commands: &'static [&'static str],
}

impl RepoSpec {
    const fn pytest(repo: &'static str, install: Option<&'static str>) -> Self {
        Self {
            repo,
            versions: &[],
            test_cmd: TEST_PYTEST,
            pre_install: &[],
            install,
            eval_commands: &[],
        }
    }
}

pub const REPO_SPECS: &[RepoSpec] = &[
    RepoSpec::pytest(
        "astropy/astropy",
        Some("python -m pip install -e .[test] --verbose"),
    ),
    RepoSpec {
        repo: "django/django",
        versions: DJANGO_LEGACY,
        test_cmd: TEST_DJANGO,
        pre_install: &[],
        install: Some("python setup.py install"),
        eval_commands: &[],
    },
    RepoSpec {
        repo: "django/django",
        versions: &[],
        test_cmd: TEST_DJANGO,
        pre_install: &[],
        install: PIP_EDITABLE,
        eval_commands: DJANGO_LOCALE,
    },
    RepoSpec::pytest("marshmallow-code/marshmallow", Some("python -m pip install -e '.[dev]'")),
    RepoSpec {
        repo: "matplotlib/matplotlib",
        versions: MATPLOTLIB_LEGACY,
        test_cmd: TEST_PYTEST,
        pre_install: &[MATPLOTLIB_APT],
        install: Some("python -m pip install -e ."),
        eval_commands: &[],
    },
    RepoSpec {
        repo: "matplotlib/matplotlib",
        versions: &[],
        test_cmd: TEST_PYTEST,
        pre_install: &[
            "apt-get -y update && apt-get -y upgrade && DEBIAN_FRONTEND=noninteractive apt-get install -y imagemagick ffmpeg texlive texlive-latex-extra texlive-fonts-recommended texlive-xetex texlive-luatex cm-super dvipng",
        ],
        install: PIP_EDITABLE,
        eval_commands: &[],
    },
    RepoSpec {
        repo: "mwaskom/seaborn",
        versions: &[],
        test_cmd: "pytest --no-header -rA",
        pre_install: &[],
        install: PIP_EDITABLE,
        eval_commands: &[],
    },
    RepoSpec::pytest("pallets/flask", PIP_EDITABLE),
    RepoSpec::pytest("psf/requests", Some("python -m pip install .")),
    RepoSpec::pytest("pvlib/pvlib-python", PIP_EDITABLE),
    RepoSpec::pytest("pydata/xarray", None),
    RepoSpec::pytest("pydicom/pydicom", PIP_EDITABLE),
    RepoSpec::pytest("pylint-dev/astroid", PIP_EDITABLE),
    RepoSpec::pytest("pylint-dev/pylint", PIP_EDITABLE),
    RepoSpec::pytest("pytest-dev/pytest", PIP_EDITABLE),
    RepoSpec::pytest("pyvista/pyvista", PIP_EDITABLE),
    RepoSpec::pytest(
        "scikit-learn/scikit-learn",
        Some("python -m pip install -v --no-use-pep517 --no-build-isolation -e ."),
    ),
    RepoSpec {
        repo: "sphinx-doc/sphinx",
        versions: &[],
        test_cmd: "tox --current-env -epy39 -v --",
        pre_install: &["sed -i 's/pytest/pytest -rA/' tox.ini"],
        install: Some("python -m pip install -e .[test]"),
        eval_commands: &[],
    },
    RepoSpec::pytest("sqlfluff/sqlfluff", PIP_EDITABLE),
    RepoSpec {
        repo: "sympy/sympy",
        versions: &[],
        test_cmd: "PYTHONWARNINGS='ignore::UserWarning,ignore::SyntaxWarning' bin/test -C --verbose",
        pre_install: &[],
        install: PIP_EDITABLE,
        eval_commands: &[],
    },
];

static FALLBACK_SPEC: RepoSpec = RepoSpec::pytest("", None);

/// Entry listing `version`, else the repository's catch-all entry.
pub fn repo_spec(repo: &str, version: &str) -> Option<&'static RepoSpec> {
    let mut fallback = None;
    for spec in REPO_SPECS.iter().filter(|s| s.repo == repo) {
        if spec.versions.iter().any(|v| *v == version) {
            return Some(spec);
        }
        if spec.versions.is_empty() && fallback.is_none() {
            fallback = Some(spec);
        }
    }
    fallback
}

/// Known spec, or plain `pytest -rA` with no install step.
pub fn repo_spec_or_default(repo: &str, version: &str) -> &'static RepoSpec {
    repo_spec(repo, version).unwrap_or_else(|| {
        tracing::warn!(repo, version, "no command spec for repository, falling back to pytest");
        &FALLBACK_SPEC
    })
}
