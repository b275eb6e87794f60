//! Projection of a task instance into the shell commands that check out, reset,
//! patch and test its repository. Everything is computed once in [`TestSpec::new`].

use super::constants::{
    APPLY_PATCH_FAIL, APPLY_PATCH_PASS, END_TEST_OUTPUT, ENV_NAME, HEREDOC_DELIMITER,
    NON_TEST_EXTS, REPO_DIRECTORY, RepoSpec, START_TEST_OUTPUT, repo_spec_or_default,
};
use crate::models::TaskInstance;
use regex::Regex;
use std::sync::LazyLock;

static DIFF_TARGET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"diff --git a/.* b/(.*)").expect("static regex"));
static DIFF_MODIFIED_FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"--- a/(.*)").expect("static regex"));

const DJANGO_REPO: &str = "django/django";

/// Files a patch touches on its `--- a/` side, in order of appearance.
pub fn modified_files(patch: &str) -> Vec<String> {
    DIFF_MODIFIED_FILE_RE
        .captures_iter(patch)
        .map(|c| c[1].trim().to_string())
        .collect()
}

/// Test targets named by a test patch, in the form the repository's runner expects.
pub fn test_directives(repo: &str, test_patch: &str) -> Vec<String> {
    let files: Vec<String> = DIFF_TARGET_RE
        .captures_iter(test_patch)
        .map(|c| c[1].trim().to_string())
        .collect();
    directives_for(repo, &files)
}

/// Drop non-test files; Django wants dotted module labels rather than paths.
pub fn directives_for(repo: &str, files: &[String]) -> Vec<String> {
    files
        .iter()
        .filter(|f| !NON_TEST_EXTS.iter().any(|ext| f.ends_with(ext)))
        .map(|f| {
            if repo == DJANGO_REPO {
                let label = f.strip_prefix("tests/").unwrap_or(f);
                let label = label.strip_suffix(".py").unwrap_or(label);
                label.replace('/', ".")
            } else {
                f.clone()
            }
        })
        .collect()
}

/// Try `git apply`, fall back to a fuzzy `patch`; exactly one marker is echoed.
pub fn patch_commands(patch_path: &str) -> Vec<String> {
    vec![
        format!("cd {REPO_DIRECTORY}"),
        format!(
            "git apply -v {patch_path} && echo '{APPLY_PATCH_PASS}' || \
             (patch --batch --fuzz=5 -p1 -i {patch_path} && echo '{APPLY_PATCH_PASS}' || echo '{APPLY_PATCH_FAIL}')"
        ),
    ]
}

fn activate() -> [String; 2] {
    [
        "source /opt/miniconda3/bin/activate".to_string(),
        format!("conda activate {ENV_NAME}"),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestSpec {
    pub instance_id: String,
    pub repo: String,
    pub version: String,
    pub base_commit: String,
    pub fail_to_pass: Vec<String>,
    pub pass_to_pass: Vec<String>,
    /// Files the test patch modifies; reset to the base commit around each run.
    pub test_files: Vec<String>,
    pub test_directives: Vec<String>,
    pub test_command: String,
    /// Repository checkout at the base commit plus install, as run when the
    /// testbed image is built.
    pub repo_script_list: Vec<String>,
    /// Environment activation, repo-specific preamble and install.
    pub env_setup_commands: Vec<String>,
    pub reset_commands: Vec<String>,
    /// Full evaluation: setup, reset, apply test patch, run tests, reset again.
    pub eval_script_list: Vec<String>,
}

impl TestSpec {
    pub fn new(instance: &TaskInstance) -> Self {
        let spec = repo_spec_or_default(&instance.repo, &instance.version);
        let base_commit = instance.base_commit.as_str();

        let test_files = modified_files(&instance.test_patch);
        let test_directives = test_directives(&instance.repo, &instance.test_patch);
        let test_command = join_command(spec.test_cmd, &test_directives);

        let mut env_setup_commands: Vec<String> = activate().into();
        env_setup_commands.push(format!("cd {REPO_DIRECTORY}"));
        env_setup_commands.extend(spec.eval_commands.iter().map(|c| c.to_string()));
        env_setup_commands.extend([
            format!("git config --global --add safe.directory {REPO_DIRECTORY}"),
            format!("cd {REPO_DIRECTORY}"),
            "git status".to_string(),
            "git show".to_string(),
            format!("git diff {base_commit}"),
        ]);
        env_setup_commands.extend(activate());
        if let Some(install) = spec.install {
            env_setup_commands.push(install.to_string());
        }

        let repo_script_list = repo_script(spec, &instance.repo, base_commit);

        let reset_tests = reset_command(base_commit, &test_files);
        let mut reset_commands = vec![format!("cd {REPO_DIRECTORY}")];
        reset_commands.extend(reset_tests.clone());

        let mut eval_script_list = env_setup_commands.clone();
        eval_script_list.extend(reset_tests.clone());
        if !instance.test_patch.trim().is_empty() {
            eval_script_list.push(format!(
                "git apply -v - <<'{HEREDOC_DELIMITER}'\n{}\n{HEREDOC_DELIMITER}",
                instance.test_patch.trim_end_matches('\n')
            ));
        }
        eval_script_list.push(format!("echo '{START_TEST_OUTPUT}'"));
        eval_script_list.push(test_command.clone());
        eval_script_list.push(format!("echo '{END_TEST_OUTPUT}'"));
        eval_script_list.extend(reset_tests);

        Self {
            instance_id: instance.instance_id.clone(),
            repo: instance.repo.clone(),
            version: instance.version.clone(),
            base_commit: instance.base_commit.clone(),
            fail_to_pass: instance.fail_to_pass.clone(),
            pass_to_pass: instance.pass_to_pass.clone(),
            test_files,
            test_directives,
            test_command,
            repo_script_list,
            env_setup_commands,
            reset_commands,
            eval_script_list,
        }
    }

    pub fn patch_commands(&self, patch_path: &str) -> Vec<String> {
        patch_commands(patch_path)
    }

    /// Run selected test files, or the test patch's directives when none are given.
    pub fn run_tests_commands(&self, test_files: &[String]) -> Vec<String> {
        let spec = repo_spec_or_default(&self.repo, &self.version);
        let command = if test_files.is_empty() {
            self.test_command.clone()
        } else {
            join_command(spec.test_cmd, &directives_for(&self.repo, test_files))
        };
        let mut commands = self.env_setup_commands.clone();
        commands.push(format!("echo '{START_TEST_OUTPUT}'"));
        commands.push(command);
        commands.push(format!("echo '{END_TEST_OUTPUT}'"));
        commands
    }

    pub fn eval_script(&self) -> String {
        script_text("set -uxo pipefail", &self.eval_script_list)
    }

    pub fn repo_script(&self) -> String {
        script_text("set -euxo pipefail", &self.repo_script_list)
    }
}

fn script_text(options: &str, commands: &[String]) -> String {
    let mut lines = vec!["#!/bin/bash".to_string(), options.to_string()];
    lines.extend(commands.iter().cloned());
    lines.join("\n") + "\n"
}

/// Clone, pin to the base commit and drop the remote so newer commits stay
/// invisible, then install into the task environment.
fn repo_script(spec: &RepoSpec, repo: &str, base_commit: &str) -> Vec<String> {
    let mut commands = vec![
        format!("git clone -o origin https://github.com/{repo} {REPO_DIRECTORY}"),
        format!("chmod -R 777 {REPO_DIRECTORY}"),
        format!("cd {REPO_DIRECTORY}"),
        format!("git reset --hard {base_commit}"),
        "git remote remove origin".to_string(),
    ];
    commands.extend(activate());
    commands.push("echo \"Current environment: $CONDA_DEFAULT_ENV\"".to_string());
    commands.extend(spec.pre_install.iter().map(|c| c.to_string()));
    if let Some(install) = spec.install {
        commands.push(install.to_string());
    }
    commands
}

fn join_command(test_cmd: &str, directives: &[String]) -> String {
    std::iter::once(test_cmd.to_string())
        .chain(directives.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn reset_command(base_commit: &str, test_files: &[String]) -> Option<String> {
    (!test_files.is_empty()).then(|| format!("git checkout {base_commit} {}", test_files.join(" ")))
}
