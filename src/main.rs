mod classfile;
mod codec;
mod depgraph;
mod descriptor;
#[cfg(test)]
mod fixtures;
mod grouping;
mod hierarchy;
mod ir;
mod opcodes;
mod options;
mod oracle;
mod pool;
mod registry;
mod resolver;
mod search;

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;

use crate::hierarchy::Hierarchy;
use crate::options::AnalyzeOptions;
use crate::oracle::{Predicate, PreparedPredicate, ScriptPredicate};
use crate::pool::{ClassPool, ReductionOracle};
use crate::registry::{PointKind, Registry};
use crate::resolver::CallResolver;
use crate::search::DeltaDebugSearch;

/// CLI arguments for jcarve execution.
#[derive(Parser, Debug)]
#[command(
    name = "jcarve",
    about = "Hierarchy-aware delta-debugging reducer for JVM class files.",
    version
)]
struct Cli {
    /// Input class tree: a directory of .class files or a JAR.
    #[arg(long, value_name = "PATH", required = true)]
    input: Vec<PathBuf>,
    /// Library tree read for hierarchy metadata only (bodies skipped).
    #[arg(long, value_name = "PATH")]
    lib: Vec<PathBuf>,
    /// Output tree mirroring the input's relative paths.
    #[arg(long, value_name = "PATH")]
    output: PathBuf,
    /// Predicate script; exit code 0 means the property still holds. With
    /// --prepare it becomes the compile step of the two-step predicate.
    #[arg(long, value_name = "PATH")]
    predicate: PathBuf,
    /// Optional prepare (decompile) script run before the predicate.
    #[arg(long, value_name = "PATH")]
    prepare: Option<PathBuf>,
    /// Expected compile transcript, required with --prepare.
    #[arg(long, value_name = "PATH")]
    expected: Option<PathBuf>,
    /// Working directory for predicate invocations.
    #[arg(long, value_name = "PATH")]
    work_dir: Option<PathBuf>,
    /// Where to write the JSON report ("-" or omitted for stdout).
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,
    /// Stub every call site instead of only provably safe ones.
    #[arg(long)]
    replace_all: bool,
    /// Register parameter-subtyping reduction points.
    #[arg(long)]
    param_subtyping: bool,
    /// Register supertype-widening reduction points.
    #[arg(long)]
    parent_collapsing: bool,
    /// Also consider constructor call sites.
    #[arg(long)]
    init_removal: bool,
    /// Degrade methods with try/catch to stubbing without deletion.
    #[arg(long)]
    skip_try_catch: bool,
    /// Disable hierarchy-dependent decisions (conservative fallbacks).
    #[arg(long)]
    no_hierarchy: bool,
    /// Skip structural re-validation of encoded classes.
    #[arg(long)]
    no_output_check: bool,
    /// Oracle-probe retry budget.
    #[arg(long, value_name = "N")]
    retry_budget: Option<usize>,
    #[arg(long)]
    quiet: bool,
    #[arg(long)]
    timing: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    run(cli)
}

fn run(cli: Cli) -> Result<()> {
    for entry in cli.input.iter().chain(&cli.lib) {
        if !entry.exists() {
            anyhow::bail!("input not found: {}", entry.display());
        }
    }
    if !cli.predicate.exists() {
        anyhow::bail!("predicate not found: {}", cli.predicate.display());
    }
    if cli.prepare.is_some() && cli.expected.is_none() {
        anyhow::bail!("--prepare requires --expected");
    }

    let options = AnalyzeOptions {
        replace_all: cli.replace_all,
        param_subtyping: cli.param_subtyping,
        parent_collapsing: cli.parent_collapsing,
        init_method_removal: cli.init_removal,
        method_with_try_catch: !cli.skip_try_catch,
        hierarchy: !cli.no_hierarchy,
        check_output: !cli.no_output_check,
        ..AnalyzeOptions::default()
    };

    let started_at = Instant::now();

    let mut hierarchy = Hierarchy::new();
    let mut class_pool = ClassPool::new(&cli.output);
    let library_classes = class_pool.read_libs(&cli.lib, &mut hierarchy)?;
    let input_classes = class_pool.read_inputs(&cli.input, &mut hierarchy)?;
    if input_classes == 0 {
        anyhow::bail!("no class files found under the input paths");
    }
    hierarchy.add_edges();

    let mut resolver = CallResolver::new(options.hierarchy);
    let mut registry = Registry::new();
    class_pool.analyze(&hierarchy, &mut resolver, &mut registry, &options);

    let work_dir = cli
        .work_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    let mut predicate = build_predicate(&cli, &work_dir)?;

    // The property must survive plain re-encoding before any reduction is
    // meaningful; otherwise every probe would chase codec artifacts.
    if !class_pool.write_identity(&registry, &options)? {
        anyhow::bail!("identity re-encoding failed structural validation");
    }
    if !predicate.holds()? {
        anyhow::bail!("property does not survive identity re-encoding");
    }

    let mut search = DeltaDebugSearch::new((0..registry.len()).collect());
    if let Some(budget) = cli.retry_budget {
        search.retry_budget = budget;
    }
    let final_valid;
    {
        let mut probe_oracle = ReductionOracle {
            pool: &class_pool,
            registry: &registry,
            options: &options,
            predicate,
        };
        search.run(&mut probe_oracle)?;
        final_valid = search.run_final(&mut probe_oracle)?;
    }
    // Leave the output tree holding the final progressions, not the last
    // probed candidate.
    class_pool.write_closure(search.progressions(), &registry, &options)?;

    let param_decisions = if options.param_subtyping {
        class_pool
            .param_decisions(search.progressions(), &registry)
            .into_iter()
            .map(|(class, method, param, ancestor)| {
                format!(
                    "{class}.{method}#{param} -> {}",
                    ancestor.as_deref().unwrap_or("java/lang/Object")
                )
            })
            .collect()
    } else {
        Vec::new()
    };

    let mut report = build_report(
        input_classes,
        library_classes,
        &registry,
        &search,
        final_valid,
        started_at.elapsed().as_millis(),
    );
    report.param_decisions = param_decisions;
    let mut writer = output_writer(cli.report.as_deref())?;
    serde_json::to_writer_pretty(&mut writer, &report).context("failed to serialize report")?;
    writer.write_all(b"\n").context("failed to write report")?;

    if cli.timing && !cli.quiet {
        eprintln!(
            "timing: total_ms={} probes={} retries={} kept={}/{}",
            report.elapsed_ms,
            report.probes,
            report.retries,
            report.progressions.len(),
            report.points_total
        );
    }

    Ok(())
}

fn build_predicate(cli: &Cli, work_dir: &Path) -> Result<Box<dyn Predicate>> {
    match &cli.prepare {
        Some(prepare) => {
            let expected_path = cli
                .expected
                .as_ref()
                .context("--prepare requires --expected")?;
            let expected = fs::read_to_string(expected_path).with_context(|| {
                format!("failed to read expected output {}", expected_path.display())
            })?;
            let lib_dir = cli.lib.first().cloned().unwrap_or_else(|| PathBuf::from("."));
            Ok(Box::new(PreparedPredicate::new(
                prepare.clone(),
                cli.predicate.clone(),
                cli.output.clone(),
                lib_dir,
                work_dir.to_path_buf(),
                expected,
            )))
        }
        None => Ok(Box::new(ScriptPredicate::new(
            cli.predicate.clone(),
            work_dir.to_path_buf(),
        ))),
    }
}

fn output_writer(output: Option<&Path>) -> Result<Box<dyn Write>> {
    match output {
        Some(path) if path == Path::new("-") => Ok(Box::new(io::stdout())),
        Some(path) => Ok(Box::new(
            File::create(path).with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Ok(Box::new(io::stdout())),
    }
}

/// Machine-readable outcome of one reduction run.
#[derive(Debug, Serialize)]
struct Report {
    classes: usize,
    library_classes: usize,
    points_total: usize,
    call_stub_points: usize,
    class_widen_points: usize,
    param_subtype_points: usize,
    progressions: Vec<usize>,
    param_decisions: Vec<String>,
    kept_ratio: f64,
    probes: usize,
    retries: usize,
    budget_exhausted: bool,
    final_valid: bool,
    elapsed_ms: u128,
}

fn build_report(
    classes: usize,
    library_classes: usize,
    registry: &Registry,
    search: &DeltaDebugSearch,
    final_valid: bool,
    elapsed_ms: u128,
) -> Report {
    let mut call_stub_points = 0;
    let mut class_widen_points = 0;
    let mut param_subtype_points = 0;
    for point in registry.iter() {
        match point.kind {
            PointKind::CallStub { .. } => call_stub_points += 1,
            PointKind::ClassWiden { .. } => class_widen_points += 1,
            PointKind::ParamSubtype { .. } => param_subtype_points += 1,
        }
    }
    let kept_ratio = if registry.is_empty() {
        0.0
    } else {
        search.progressions().len() as f64 / registry.len() as f64
    };
    Report {
        classes,
        library_classes,
        points_total: registry.len(),
        call_stub_points,
        class_widen_points,
        param_subtype_points,
        progressions: search.progressions().iter().copied().collect(),
        param_decisions: Vec::new(),
        kept_ratio,
        probes: search.probes(),
        retries: search.retries(),
        budget_exhausted: search.budget_exhausted(),
        final_valid,
        elapsed_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_counts_points_by_kind() {
        let mut registry = Registry::new();
        registry.add(PointKind::CallStub { class: 0, method: 0, insn: 3 });
        registry.add(PointKind::ClassWiden { class: 0, ancestor: "Base".to_string() });
        registry.add(PointKind::CallStub { class: 1, method: 2, insn: 7 });
        let search = DeltaDebugSearch::new((0..registry.len()).collect());

        let report = build_report(4, 10, &registry, &search, true, 12);

        assert_eq!(report.points_total, 3);
        assert_eq!(report.call_stub_points, 2);
        assert_eq!(report.class_widen_points, 1);
        assert_eq!(report.param_subtype_points, 0);
        assert_eq!(report.kept_ratio, 0.0);
        assert!(report.final_valid);

        let value = serde_json::to_value(&report).expect("serialize report");
        assert_eq!(value["classes"], 4);
        assert_eq!(value["library_classes"], 10);
        assert_eq!(value["elapsed_ms"], 12);
    }
}
