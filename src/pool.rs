//! Class pool: reads the input and library trees, owns the decoded classes,
//! populates the reduction point registry, and materializes candidate
//! closures into the output tree.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use jclassfile::class_file;
use zip::ZipArchive;

use crate::classfile::{self, ClassFile};
use crate::codec::{self, EncodedBody};
use crate::depgraph::{self, CallSlot, DependencyGraph};
use crate::grouping::{InsnGroup, ReductionGrouping};
use crate::hierarchy::{ClassEntity, Hierarchy, ROOT_OBJECT};
use crate::ir::{MethodBody, Op};
use crate::options::AnalyzeOptions;
use crate::oracle::Predicate;
use crate::registry::{PointKind, PointRange, Registry};
use crate::resolver::{self, CallDecision, CallResolver};
use crate::search::Oracle;

/// Per-method analysis artifacts, built once and snapshotted per probe.
#[derive(Debug, Default)]
pub(crate) struct MethodAnalysis {
    pub(crate) section: PointRange,
    /// Reduction point index → call instruction index.
    pub(crate) call_points: BTreeMap<usize, usize>,
    /// Dependency graph plus the canonical collapsed grouping; `None` when
    /// the method degraded to stubbing without deletion.
    pub(crate) graph: Option<(DependencyGraph, ReductionGrouping)>,
    /// Parameter index → subtype decision range.
    pub(crate) param_ranges: Vec<(usize, PointRange)>,
}

/// One input class with its decoded bodies and analysis state.
#[derive(Debug)]
pub(crate) struct PoolClass {
    pub(crate) rel_path: PathBuf,
    pub(crate) file: ClassFile,
    pub(crate) bodies: Vec<MethodBody>,
    pub(crate) analyses: Vec<MethodAnalysis>,
    pub(crate) section: PointRange,
    pub(crate) widen: Option<PointRange>,
}

/// The pool of input classes plus the output tree they materialize into.
#[derive(Debug)]
pub(crate) struct ClassPool {
    output_dir: PathBuf,
    classes: Vec<PoolClass>,
}

impl ClassPool {
    pub(crate) fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self { output_dir: output_dir.into(), classes: Vec::new() }
    }

    pub(crate) fn classes(&self) -> &[PoolClass] {
        &self.classes
    }

    /// Library classes contribute hierarchy metadata only; bodies are
    /// skipped and unparsable entries ignored.
    pub(crate) fn read_libs(&self, roots: &[PathBuf], hierarchy: &mut Hierarchy) -> Result<usize> {
        let mut count = 0;
        for root in roots {
            for (_, data) in collect_class_files(root, false)? {
                let Ok(file) = classfile::parse(&data) else { continue };
                hierarchy.add_class(ClassEntity::from_class_file(&file, None), false);
                count += 1;
            }
        }
        Ok(count)
    }

    /// Input classes are validated, fully decoded, and registered with stub
    /// classification.
    pub(crate) fn read_inputs(
        &mut self,
        roots: &[PathBuf],
        hierarchy: &mut Hierarchy,
    ) -> Result<usize> {
        for root in roots {
            for (rel_path, data) in collect_class_files(root, true)? {
                class_file::parse(&data)
                    .with_context(|| format!("failed to parse {}", rel_path.display()))?;
                let file = classfile::parse(&data)
                    .with_context(|| format!("failed to model {}", rel_path.display()))?;
                let bodies: Vec<MethodBody> = (0..file.methods.len())
                    .map(|index| codec::decode_body(&file, index))
                    .collect();
                hierarchy.add_class(ClassEntity::from_class_file(&file, Some(&bodies)), true);
                self.classes.push(PoolClass {
                    rel_path,
                    file,
                    bodies,
                    analyses: Vec::new(),
                    section: PointRange::default(),
                    widen: None,
                });
            }
        }
        Ok(self.classes.len())
    }

    /// Populates the registry: per-method parameter-subtyping ranges and
    /// call-stub points, per-class widening ranges.
    pub(crate) fn analyze(
        &mut self,
        hierarchy: &Hierarchy,
        resolver: &mut CallResolver,
        registry: &mut Registry,
        options: &AnalyzeOptions,
    ) {
        for (class_index, class) in self.classes.iter_mut().enumerate() {
            let class_low = registry.current_index();
            let mut analyses = Vec::with_capacity(class.bodies.len());
            for (method_index, body) in class.bodies.iter().enumerate() {
                let low = registry.current_index();
                let mut analysis = MethodAnalysis::default();
                if options.reduce {
                    if options.param_subtyping && options.hierarchy {
                        analyze_params(class_index, method_index, body, hierarchy, registry, &mut analysis);
                    }
                    if options.method_removal {
                        analyze_calls(
                            class_index,
                            method_index,
                            body,
                            hierarchy,
                            resolver,
                            registry,
                            options,
                            &mut analysis,
                        );
                    }
                }
                analysis.section = PointRange::new(low, registry.current_index());
                analyses.push(analysis);
            }
            class.analyses = analyses;
            if options.reduce && options.parent_collapsing && options.hierarchy {
                class.widen = analyze_widening(class_index, &class.file, &class.bodies, hierarchy, registry);
            }
            class.section = PointRange::new(class_low, registry.current_index());
        }
    }

    /// Materializes one candidate closure into the output tree.
    ///
    /// `Ok(false)` is a legalization failure (encode or re-validation); I/O
    /// errors propagate, since they indicate a broken environment rather
    /// than a property of the closure.
    pub(crate) fn write_closure(
        &self,
        closure: &BTreeSet<usize>,
        registry: &Registry,
        options: &AnalyzeOptions,
    ) -> Result<bool> {
        for class in &self.classes {
            let mut replacements: Vec<Option<EncodedBody>> = vec![None; class.bodies.len()];
            for (method_index, body) in class.bodies.iter().enumerate() {
                let Some(ops) = &body.instructions else { continue };
                let analysis = &class.analyses[method_index];
                let method_closure = analysis.section.in_range(closure);
                let removed: BTreeSet<usize> = analysis
                    .call_points
                    .iter()
                    .filter(|(point, _)| !method_closure.contains(point))
                    .map(|(_, insn)| *insn)
                    .collect();

                let rebuilt = if removed.is_empty() {
                    Ok(EncodedBody { ops: ops.clone(), handlers: body.handlers.clone() })
                } else if let Some((graph, grouping)) = &analysis.graph {
                    let mut probe = grouping.clone();
                    let groups = probe.removal_groups(graph, &removed);
                    apply_group_removal(ops, &body.handlers, &groups)
                } else {
                    apply_plain_stubs(ops, &body.handlers, &removed)
                };
                match rebuilt {
                    Ok(encoded) => replacements[method_index] = Some(encoded),
                    Err(_) => return Ok(false),
                }
            }

            let new_super = self.widened_super(class, closure, registry, options);
            let bytes = match codec::encode_class(&class.file, &replacements, new_super.as_deref())
            {
                Ok(bytes) => bytes,
                Err(_) => return Ok(false),
            };
            if options.check_output && class_file::parse(&bytes).is_err() {
                return Ok(false);
            }

            let output = self.output_dir.join(&class.rel_path);
            if let Some(parent) = output.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            fs::write(&output, bytes)
                .with_context(|| format!("failed to write {}", output.display()))?;
        }
        Ok(true)
    }

    /// Resolved parameter-subtype decisions under a closure, for reporting:
    /// `(class, method, parameter index, selected ancestor)` where `None`
    /// means the parameter collapses to `java/lang/Object`.
    pub(crate) fn param_decisions(
        &self,
        closure: &BTreeSet<usize>,
        registry: &Registry,
    ) -> Vec<(String, String, usize, Option<String>)> {
        let mut decisions = Vec::new();
        for class in &self.classes {
            for (method_index, analysis) in class.analyses.iter().enumerate() {
                for (param_index, range) in &analysis.param_ranges {
                    let ancestor = range.max_in_range(closure).and_then(|index| {
                        match registry.get(index).map(|point| &point.kind) {
                            Some(PointKind::ParamSubtype { ancestor, .. }) => {
                                Some(ancestor.clone())
                            }
                            _ => None,
                        }
                    });
                    decisions.push((
                        class.file.name.clone(),
                        class.bodies[method_index].name.clone(),
                        *param_index,
                        ancestor,
                    ));
                }
            }
        }
        decisions
    }

    /// Re-encodes everything with the full closure: no reductions applied.
    pub(crate) fn write_identity(
        &self,
        registry: &Registry,
        options: &AnalyzeOptions,
    ) -> Result<bool> {
        let full: BTreeSet<usize> = (0..registry.len()).collect();
        self.write_closure(&full, registry, options)
    }

    fn widened_super(
        &self,
        class: &PoolClass,
        closure: &BTreeSet<usize>,
        registry: &Registry,
        options: &AnalyzeOptions,
    ) -> Option<String> {
        if !options.parent_collapsing {
            return None;
        }
        let range = class.widen?;
        let section_closure = class.section.in_range(closure);
        let ancestor = match range.max_in_range(&section_closure) {
            Some(index) => match registry.get(index).map(|point| &point.kind) {
                Some(PointKind::ClassWiden { ancestor, .. }) => ancestor.clone(),
                _ => return None,
            },
            None => ROOT_OBJECT.to_string(),
        };
        if class.file.super_name.as_deref() == Some(ancestor.as_str()) {
            None
        } else {
            Some(ancestor)
        }
    }
}

/// Oracle adapter: materialize the closure, then ask the external predicate.
pub(crate) struct ReductionOracle<'a, P: Predicate> {
    pub(crate) pool: &'a ClassPool,
    pub(crate) registry: &'a Registry,
    pub(crate) options: &'a AnalyzeOptions,
    pub(crate) predicate: P,
}

impl<P: Predicate> Oracle for ReductionOracle<'_, P> {
    fn probe(&mut self, closure: &BTreeSet<usize>) -> Result<bool> {
        if !self.pool.write_closure(closure, self.registry, self.options)? {
            return Ok(false);
        }
        self.predicate.holds()
    }
}

fn analyze_params(
    class_index: usize,
    method_index: usize,
    body: &MethodBody,
    hierarchy: &Hierarchy,
    registry: &mut Registry,
    analysis: &mut MethodAnalysis,
) {
    // Generic signatures are not modeled; skip the whole method.
    if body.signature.is_some() {
        return;
    }
    let Ok(sig) = crate::descriptor::parse_method_descriptor(&body.descriptor) else {
        return;
    };
    for (param_index, param) in sig.params.iter().enumerate() {
        let Some(param_type) = &param.class_name else { continue };
        if param_type == ROOT_OBJECT {
            continue;
        }
        let low = registry.current_index();
        for ancestor in hierarchy.ancestor_chain(param_type) {
            if ancestor == ROOT_OBJECT {
                continue;
            }
            registry.add(PointKind::ParamSubtype {
                class: class_index,
                method: method_index,
                param: param_index,
                ancestor,
            });
        }
        // The original type is the most specific alternative.
        registry.add(PointKind::ParamSubtype {
            class: class_index,
            method: method_index,
            param: param_index,
            ancestor: param_type.clone(),
        });
        analysis
            .param_ranges
            .push((param_index, PointRange::new(low, registry.current_index())));
    }
}

#[allow(clippy::too_many_arguments)]
fn analyze_calls(
    class_index: usize,
    method_index: usize,
    body: &MethodBody,
    hierarchy: &Hierarchy,
    resolver: &mut CallResolver,
    registry: &mut Registry,
    options: &AnalyzeOptions,
    analysis: &mut MethodAnalysis,
) {
    let Some(ops) = &body.instructions else { return };

    if body.handlers.is_empty() || options.method_with_try_catch {
        // Dependency analysis failure degrades to stubbing without deletion.
        if let Ok(graph) = depgraph::build(
            ops,
            &body.handlers,
            body.is_static(),
            &body.descriptor,
            body.max_locals,
        ) {
            let mut grouping = ReductionGrouping::new(&graph);
            grouping.collapse_single_use(&graph);
            analysis.graph = Some((graph, grouping));
        }
    }

    for (insn, instruction) in ops.iter().enumerate() {
        let Op::Invoke(call) = instruction else { continue };
        if !options.init_method_removal && (call.name == "<init>" || call.name == "<clinit>") {
            continue;
        }
        let eligible = options.replace_all
            || matches!(resolver.decide(hierarchy, call), CallDecision::Stub(_));
        if !eligible {
            continue;
        }
        let point = registry.add(PointKind::CallStub {
            class: class_index,
            method: method_index,
            insn,
        });
        analysis.call_points.insert(point, insn);
    }
}

/// Type names a class's code references; widening may not cross them.
fn class_constraints(bodies: &[MethodBody], hierarchy: &Hierarchy) -> BTreeSet<String> {
    let mut constraints = BTreeSet::new();
    for body in bodies {
        let Some(ops) = &body.instructions else { continue };
        for instruction in ops {
            match instruction {
                Op::Field { owner, name, .. } => {
                    constraints.insert(hierarchy.field_owner_name(owner, name));
                }
                Op::Invoke(call) => {
                    constraints.insert(hierarchy.method_owner_name(
                        &call.owner,
                        &call.name,
                        &call.descriptor,
                        call.kind == crate::ir::CallKind::Interface,
                    ));
                }
                Op::TypeRef { class_name, .. } => {
                    constraints.insert(class_name.clone());
                }
                _ => {}
            }
        }
    }
    constraints
}

fn analyze_widening(
    class_index: usize,
    file: &ClassFile,
    bodies: &[MethodBody],
    hierarchy: &Hierarchy,
    registry: &mut Registry,
) -> Option<PointRange> {
    let super_name = file.super_name.as_deref()?;
    if super_name == ROOT_OBJECT || file.signature.is_some() {
        return None;
    }
    let constraints = class_constraints(bodies, hierarchy);
    if constraints.contains(super_name) {
        return None;
    }
    let mut ancestors = hierarchy.ancestor_chain(super_name);
    // Cannot widen past a referenced ancestor; keep it and everything more
    // derived as the candidate set.
    for index in (0..ancestors.len()).rev() {
        if constraints.contains(&ancestors[index]) {
            ancestors.drain(..index);
            break;
        }
    }

    let low = registry.current_index();
    for ancestor in ancestors {
        if ancestor == ROOT_OBJECT {
            continue;
        }
        registry.add(PointKind::ClassWiden { class: class_index, ancestor });
    }
    registry.add(PointKind::ClassWiden {
        class: class_index,
        ancestor: super_name.to_string(),
    });
    Some(PointRange::new(low, registry.current_index()))
}

#[derive(Clone, Debug)]
enum Edit {
    Keep,
    Delete,
    Replace(Vec<Op>),
}

/// Applies removal groups: delete every member instruction except the call
/// itself, then replace each affected call with its residual stub.
fn apply_group_removal(
    ops: &[Op],
    handlers: &[crate::ir::ExceptionHandler],
    groups: &[InsnGroup],
) -> Result<EncodedBody> {
    let mut edits = vec![Edit::Keep; ops.len()];
    let mut removed_args: BTreeMap<usize, BTreeSet<u16>> = BTreeMap::new();

    for group in groups {
        let call_insn = group.root.insn;
        let entry = removed_args.entry(call_insn).or_default();
        if let CallSlot::Arg(position) = group.root.slot {
            entry.insert(position);
        }
        for member in &group.members {
            if member.insn != call_insn {
                edits[member.insn] = Edit::Delete;
            }
        }
    }

    for (call_insn, args) in &removed_args {
        let Op::Invoke(call) = &ops[*call_insn] else {
            anyhow::bail!("removal group rooted at a non-call instruction");
        };
        edits[*call_insn] = Edit::Replace(resolver::inline_pop(call, args)?);
    }

    rebuild(ops, handlers, edits)
}

/// No dependency graph available: every removed call becomes a full stub,
/// nothing is deleted.
fn apply_plain_stubs(
    ops: &[Op],
    handlers: &[crate::ir::ExceptionHandler],
    removed: &BTreeSet<usize>,
) -> Result<EncodedBody> {
    let mut edits = vec![Edit::Keep; ops.len()];
    for insn in removed {
        let Op::Invoke(call) = &ops[*insn] else {
            anyhow::bail!("removed point does not address a call instruction");
        };
        edits[*insn] = Edit::Replace(resolver::inline_pop(call, &BTreeSet::new())?);
    }
    rebuild(ops, handlers, edits)
}

/// Rebuilds the instruction list under the edit plan, remapping branch
/// targets and exception ranges to the first surviving instruction at or
/// after the old target.
fn rebuild(
    ops: &[Op],
    handlers: &[crate::ir::ExceptionHandler],
    edits: Vec<Edit>,
) -> Result<EncodedBody> {
    let mut new_ops: Vec<Op> = Vec::with_capacity(ops.len());
    let mut new_start = vec![0usize; ops.len() + 1];
    for (index, edit) in edits.iter().enumerate() {
        new_start[index] = new_ops.len();
        match edit {
            Edit::Keep => new_ops.push(ops[index].clone()),
            Edit::Delete => {}
            Edit::Replace(replacement) => new_ops.extend(replacement.iter().cloned()),
        }
    }
    new_start[ops.len()] = new_ops.len();

    let new_len = new_ops.len();
    let remap = |target: usize| -> Result<usize> {
        let mapped = new_start[target];
        if mapped >= new_len {
            anyhow::bail!("branch target fell off the end of the rebuilt method");
        }
        Ok(mapped)
    };
    for instruction in &mut new_ops {
        match instruction {
            Op::Branch { target, .. } => *target = remap(*target)?,
            Op::TableSwitch { default, targets, .. } => {
                *default = remap(*default)?;
                for target in targets {
                    *target = remap(*target)?;
                }
            }
            Op::LookupSwitch { default, pairs } => {
                *default = remap(*default)?;
                for (_, target) in pairs {
                    *target = remap(*target)?;
                }
            }
            _ => {}
        }
    }

    let mut new_handlers = Vec::with_capacity(handlers.len());
    for handler in handlers {
        let start = new_start[handler.start];
        let end = new_start[handler.end];
        let entry = new_start[handler.handler];
        if start >= end || entry >= new_ops.len() {
            continue;
        }
        new_handlers.push(crate::ir::ExceptionHandler {
            start,
            end,
            handler: entry,
            catch_type: handler.catch_type,
        });
    }

    Ok(EncodedBody { ops: new_ops, handlers: new_handlers })
}

/// Collects `.class` payloads under a directory or inside a JAR, with
/// deterministic ordering. `strict` rejects unsupported root paths.
fn collect_class_files(root: &Path, strict: bool) -> Result<Vec<(PathBuf, Vec<u8>)>> {
    if root.is_dir() {
        let mut result = Vec::new();
        collect_dir(root, root, &mut result)?;
        return Ok(result);
    }
    let extension = root.extension().and_then(|ext| ext.to_str()).unwrap_or("");
    match extension {
        "jar" => collect_jar(root),
        "class" => {
            let data = fs::read(root)
                .with_context(|| format!("failed to read {}", root.display()))?;
            let name = root
                .file_name()
                .map(PathBuf::from)
                .context("class file path has no file name")?;
            Ok(vec![(name, data)])
        }
        _ if strict => anyhow::bail!("unsupported input path: {}", root.display()),
        _ => Ok(Vec::new()),
    }
}

fn collect_dir(root: &Path, dir: &Path, result: &mut Vec<(PathBuf, Vec<u8>)>) -> Result<()> {
    let mut entries = Vec::new();
    for entry in
        fs::read_dir(dir).with_context(|| format!("failed to read directory {}", dir.display()))?
    {
        let entry =
            entry.with_context(|| format!("failed to read entry under {}", dir.display()))?;
        entries.push(entry.path());
    }
    entries.sort_by(|a, b| path_key(a).cmp(&path_key(b)));

    for entry in entries {
        if entry.is_dir() {
            collect_dir(root, &entry, result)?;
        } else if entry.extension().and_then(|ext| ext.to_str()) == Some("class") {
            let data = fs::read(&entry)
                .with_context(|| format!("failed to read {}", entry.display()))?;
            let rel_path = entry
                .strip_prefix(root)
                .context("directory entry escapes its root")?
                .to_path_buf();
            result.push((rel_path, data));
        }
    }
    Ok(())
}

fn collect_jar(path: &Path) -> Result<Vec<(PathBuf, Vec<u8>)>> {
    let file =
        fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("failed to read {}", path.display()))?;

    let mut entry_names = Vec::new();
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        if name.ends_with(".class") && !name.ends_with("module-info.class") {
            entry_names.push(name);
        }
    }
    entry_names.sort();

    let mut result = Vec::with_capacity(entry_names.len());
    for name in entry_names {
        let mut entry = archive
            .by_name(&name)
            .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
        result.push((PathBuf::from(name), data));
    }
    Ok(result)
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}
