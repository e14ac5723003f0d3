//! External validity predicates, realized as script invocations.
//!
//! The single-script predicate treats exit code 0 as "the property holds".
//! The two-step predicate runs a prepare (decompile) script whose stdout
//! names the prepared source, then a compile script whose captured output is
//! compared against an expected text. Script-level failures (non-zero exits)
//! are oracle results; process spawn and I/O failures propagate as errors,
//! since they indicate environment misconfiguration.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};

/// Boolean predicate over the materialized artifact directory.
pub(crate) trait Predicate {
    fn holds(&mut self) -> Result<bool>;
}

impl<'a> Predicate for Box<dyn Predicate + 'a> {
    fn holds(&mut self) -> Result<bool> {
        (**self).holds()
    }
}

/// One script, run with `bash` in a working directory; exit 0 = holds.
pub(crate) struct ScriptPredicate {
    script: PathBuf,
    work_dir: PathBuf,
}

impl ScriptPredicate {
    pub(crate) fn new(script: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self { script: script.into(), work_dir: work_dir.into() }
    }
}

impl Predicate for ScriptPredicate {
    fn holds(&mut self) -> Result<bool> {
        let output = run_captured(&self.script, &[], &self.work_dir)?;
        Ok(output.exit_code == Some(0))
    }
}

/// Prepare/compile pair with an expected compile transcript.
pub(crate) struct PreparedPredicate {
    prepare: PathBuf,
    compile: PathBuf,
    source_dir: PathBuf,
    lib_dir: PathBuf,
    work_dir: PathBuf,
    expected: String,
}

impl PreparedPredicate {
    pub(crate) fn new(
        prepare: impl Into<PathBuf>,
        compile: impl Into<PathBuf>,
        source_dir: impl Into<PathBuf>,
        lib_dir: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
        expected: String,
    ) -> Self {
        Self {
            prepare: prepare.into(),
            compile: compile.into(),
            source_dir: source_dir.into(),
            lib_dir: lib_dir.into(),
            work_dir: work_dir.into(),
            expected,
        }
    }
}

impl Predicate for PreparedPredicate {
    fn holds(&mut self) -> Result<bool> {
        let prepare = run_captured(
            &self.prepare,
            &[self.source_dir.as_os_str(), self.lib_dir.as_os_str()],
            &self.work_dir,
        )?;
        if prepare.exit_code != Some(0) {
            return Ok(false);
        }
        let prepared = prepare.text.trim().to_string();

        let compile = run_captured(
            &self.compile,
            &[prepared.as_ref(), self.lib_dir.as_os_str()],
            &self.work_dir,
        )?;
        Ok(compile.exit_code == Some(0) && compile.text == self.expected)
    }
}

struct CapturedRun {
    exit_code: Option<i32>,
    text: String,
}

fn run_captured(
    script: &Path,
    args: &[&std::ffi::OsStr],
    work_dir: &Path,
) -> Result<CapturedRun> {
    let output = Command::new("bash")
        .arg(script)
        .args(args)
        .current_dir(work_dir)
        .output()
        .with_context(|| format!("failed to run predicate script {}", script.display()))?;

    // Streams are merged for diagnostics, stdout first.
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(CapturedRun { exit_code: output.status.code(), text })
}
