//! Data-flow dependency graph over one method body.
//!
//! A worklist abstract interpretation tracks, at every program point, the set
//! of instructions that may have produced each live stack or local value
//! (reaching definitions over the operand stack, not a concrete interpreter).
//! Every value-consuming instruction becomes a consumer node; call
//! instructions decompose into one consumer per argument so independent
//! arguments stay independently removable. Producer sets merge across
//! conditional joins, which only costs precision, never soundness.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use anyhow::{Context, Result};

use crate::descriptor::{self, ReturnCategory};
use crate::ir::{ExceptionHandler, Op};
use crate::opcodes as op;

/// Which value slot of an instruction a consumer stands for.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) enum CallSlot {
    /// Ordinary instruction: one consumer for all of its operands.
    Plain,
    /// One argument of a call; the receiver is argument 0 when present.
    Arg(u16),
    /// A call consuming no values at all still owns one consumer.
    NoArgs,
}

/// Identity of one consumer node.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct Consumer {
    pub(crate) insn: usize,
    pub(crate) slot: CallSlot,
}

impl Consumer {
    pub(crate) fn plain(insn: usize) -> Self {
        Self { insn, slot: CallSlot::Plain }
    }

    pub(crate) fn arg(insn: usize, index: u16) -> Self {
        Self { insn, slot: CallSlot::Arg(index) }
    }

    pub(crate) fn no_args(insn: usize) -> Self {
        Self { insn, slot: CallSlot::NoArgs }
    }

    pub(crate) fn is_call(&self) -> bool {
        !matches!(self.slot, CallSlot::Plain)
    }
}

/// The per-method dependency graph; immutable once built.
#[derive(Debug, Default)]
pub(crate) struct DependencyGraph {
    consumers: BTreeMap<usize, BTreeSet<Consumer>>,
    outgoing: BTreeMap<Consumer, BTreeSet<Consumer>>,
    vertices: BTreeSet<Consumer>,
}

impl DependencyGraph {
    pub(crate) fn vertices(&self) -> impl Iterator<Item = Consumer> + '_ {
        self.vertices.iter().copied()
    }

    pub(crate) fn edges(&self) -> impl Iterator<Item = (Consumer, Consumer)> + '_ {
        self.outgoing
            .iter()
            .flat_map(|(source, targets)| targets.iter().map(|target| (*source, *target)))
    }

    pub(crate) fn out_edges(&self, consumer: Consumer) -> Option<&BTreeSet<Consumer>> {
        self.outgoing.get(&consumer)
    }

    pub(crate) fn out_degree(&self, consumer: Consumer) -> usize {
        self.outgoing.get(&consumer).map_or(0, BTreeSet::len)
    }

    /// All consumer nodes of one instruction; calls own one per argument.
    pub(crate) fn consumers_of(&self, insn: usize) -> impl Iterator<Item = Consumer> + '_ {
        self.consumers
            .get(&insn)
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }
}

/// One abstract value: its slot width and the instructions that may have
/// produced it. Empty producers model parameters and handler exceptions.
#[derive(Clone, Debug, PartialEq, Eq)]
struct AbsValue {
    size: u8,
    producers: BTreeSet<usize>,
}

impl AbsValue {
    fn fresh(size: u8, producer: usize) -> Self {
        Self { size, producers: BTreeSet::from([producer]) }
    }

    fn unknown(size: u8) -> Self {
        Self { size, producers: BTreeSet::new() }
    }
}

#[derive(Clone, Debug, PartialEq)]
struct Frame {
    locals: Vec<Option<AbsValue>>,
    stack: Vec<AbsValue>,
}

impl Frame {
    fn merge_from(&mut self, other: &Frame) -> Result<bool> {
        if self.stack.len() != other.stack.len() {
            anyhow::bail!(
                "stack depth mismatch at join: {} vs {}",
                self.stack.len(),
                other.stack.len()
            );
        }
        let mut changed = false;
        for (mine, theirs) in self.stack.iter_mut().zip(&other.stack) {
            if mine.size != theirs.size {
                anyhow::bail!("stack slot width mismatch at join");
            }
            for producer in &theirs.producers {
                changed |= mine.producers.insert(*producer);
            }
        }
        for (mine, theirs) in self.locals.iter_mut().zip(&other.locals) {
            match (mine.as_mut(), theirs) {
                (Some(a), Some(b)) if a.size == b.size => {
                    for producer in &b.producers {
                        changed |= a.producers.insert(*producer);
                    }
                }
                (Some(_), _) => {
                    // Incompatible definitions meet: the slot is unusable.
                    *mine = None;
                    changed = true;
                }
                (None, _) => {}
            }
        }
        Ok(changed)
    }
}

struct Analysis<'a> {
    ops: &'a [Op],
    sources: BTreeMap<Consumer, BTreeSet<usize>>,
    consumers: BTreeMap<usize, BTreeSet<Consumer>>,
}

impl<'a> Analysis<'a> {
    fn record(&mut self, consumer: Consumer, value: &AbsValue) {
        self.consumers.entry(consumer.insn).or_default().insert(consumer);
        self.sources
            .entry(consumer)
            .or_default()
            .extend(value.producers.iter().copied());
    }

    fn touch(&mut self, consumer: Consumer) {
        self.consumers.entry(consumer.insn).or_default().insert(consumer);
        self.sources.entry(consumer).or_default();
    }
}

/// Builds the dependency graph for one decoded body.
///
/// An error means the body cannot be modeled; callers degrade to the safe
/// default (stub without deletion) for the whole method.
pub(crate) fn build(
    ops: &[Op],
    handlers: &[ExceptionHandler],
    is_static: bool,
    descriptor_str: &str,
    max_locals: u16,
) -> Result<DependencyGraph> {
    if ops.is_empty() {
        anyhow::bail!("empty method body");
    }
    let sig = descriptor::parse_method_descriptor(descriptor_str)?;

    let mut locals: Vec<Option<AbsValue>> = vec![None; max_locals as usize];
    let mut slot = 0usize;
    if !is_static {
        *locals.get_mut(slot).context("max_locals too small for receiver")? =
            Some(AbsValue::unknown(1));
        slot += 1;
    }
    for param in &sig.params {
        *locals
            .get_mut(slot)
            .context("max_locals too small for parameters")? = Some(AbsValue::unknown(param.size));
        slot += param.size as usize;
    }

    let mut analysis = Analysis { ops, sources: BTreeMap::new(), consumers: BTreeMap::new() };
    let mut frames: Vec<Option<Frame>> = vec![None; ops.len()];
    frames[0] = Some(Frame { locals, stack: Vec::new() });
    let mut worklist = VecDeque::from([0usize]);

    while let Some(index) = worklist.pop_front() {
        let frame = frames[index].clone().context("worklist entry without frame")?;

        // Exception edges use the frame before the instruction executes.
        for handler in handlers {
            if handler.start <= index && index < handler.end {
                let entry = Frame {
                    locals: frame.locals.clone(),
                    stack: vec![AbsValue::unknown(1)],
                };
                merge_into(&mut frames, handler.handler, entry, &mut worklist)?;
            }
        }

        let successors = execute(index, &frame, &mut analysis)?;
        for (successor, next) in successors {
            if successor >= ops.len() {
                anyhow::bail!("control flow runs past the end of the method");
            }
            merge_into(&mut frames, successor, next, &mut worklist)?;
        }
    }

    // Every real instruction owns at least one consumer node.
    for index in 0..ops.len() {
        if !analysis.consumers.contains_key(&index) {
            analysis.touch(Consumer::plain(index));
        }
    }

    let mut graph = DependencyGraph::default();
    for set in analysis.consumers.values() {
        graph.vertices.extend(set.iter().copied());
    }
    for (consumer, producers) in &analysis.sources {
        for producer in producers {
            if *producer == consumer.insn {
                continue;
            }
            let Some(producer_consumers) = analysis.consumers.get(producer) else {
                continue;
            };
            for source in producer_consumers {
                graph.outgoing.entry(*source).or_default().insert(*consumer);
            }
        }
    }
    graph.consumers = analysis.consumers;
    Ok(graph)
}

fn merge_into(
    frames: &mut [Option<Frame>],
    index: usize,
    incoming: Frame,
    worklist: &mut VecDeque<usize>,
) -> Result<()> {
    match &mut frames[index] {
        Some(existing) => {
            if existing.merge_from(&incoming)? {
                worklist.push_back(index);
            }
        }
        None => {
            frames[index] = Some(incoming);
            worklist.push_back(index);
        }
    }
    Ok(())
}

/// Executes one instruction over a copy of its frame, records consumer
/// sources, and returns the successor frames.
fn execute(index: usize, frame: &Frame, analysis: &mut Analysis) -> Result<Vec<(usize, Frame)>> {
    let mut frame = frame.clone();
    let insn = &analysis.ops[index];
    let plain = Consumer::plain(index);
    let mut fall_through = true;
    let mut extra_successors: Vec<usize> = Vec::new();

    match insn {
        Op::Simple(opcode) => {
            let opcode = *opcode;
            match opcode {
                op::NOP => {}
                op::DUP..=op::SWAP => {
                    stack_shuffle(index, opcode, &mut frame, analysis)?;
                }
                op::IRETURN | op::FRETURN | op::ARETURN => {
                    let value = pop(&mut frame)?;
                    analysis.record(plain, &value);
                    fall_through = false;
                }
                op::LRETURN | op::DRETURN => {
                    let value = pop_sized(&mut frame, 2)?;
                    analysis.record(plain, &value);
                    fall_through = false;
                }
                op::RETURN => {
                    fall_through = false;
                }
                op::ATHROW => {
                    let value = pop(&mut frame)?;
                    analysis.record(plain, &value);
                    fall_through = false;
                }
                op::POP => {
                    let value = pop_sized(&mut frame, 1)?;
                    analysis.record(plain, &value);
                }
                op::POP2 => {
                    let value = pop(&mut frame)?;
                    analysis.record(plain, &value);
                    if value.size == 1 {
                        let second = pop_sized(&mut frame, 1)?;
                        analysis.record(plain, &second);
                    }
                }
                _ => {
                    let (pops, push) = simple_io(opcode)?;
                    for expected in pops {
                        let value = pop_sized(&mut frame, *expected)?;
                        analysis.record(plain, &value);
                    }
                    if let Some(size) = push {
                        frame.stack.push(AbsValue::fresh(size, index));
                    }
                }
            }
        }
        Op::Push { .. } => frame.stack.push(AbsValue::fresh(1, index)),
        Op::LoadConst { opcode, .. } => {
            let size = if *opcode == op::LDC2_W { 2 } else { 1 };
            frame.stack.push(AbsValue::fresh(size, index));
        }
        Op::Local { opcode, var } => {
            let var = *var as usize;
            match *opcode {
                op::ILOAD..=op::ALOAD => {
                    let size = match *opcode {
                        op::LLOAD | op::DLOAD => 2,
                        _ => 1,
                    };
                    if let Some(Some(value)) = frame.locals.get(var) {
                        analysis.record(plain, &value.clone());
                    } else {
                        analysis.touch(plain);
                    }
                    frame.stack.push(AbsValue::fresh(size, index));
                }
                _ => {
                    let size = match *opcode {
                        op::LSTORE | op::DSTORE => 2,
                        _ => 1,
                    };
                    let value = pop_sized(&mut frame, size)?;
                    analysis.record(plain, &value);
                    let slot = frame
                        .locals
                        .get_mut(var)
                        .context("store beyond max_locals")?;
                    *slot = Some(AbsValue::fresh(size, index));
                    if size == 2
                        && let Some(next) = frame.locals.get_mut(var + 1)
                    {
                        *next = None;
                    }
                }
            }
        }
        Op::Iinc { var, .. } => {
            let var = *var as usize;
            if let Some(Some(value)) = frame.locals.get(var) {
                analysis.record(plain, &value.clone());
            } else {
                analysis.touch(plain);
            }
            let slot = frame.locals.get_mut(var).context("iinc beyond max_locals")?;
            *slot = Some(AbsValue::fresh(1, index));
        }
        Op::TypeRef { opcode, .. } => {
            if *opcode != op::NEW {
                let value = pop_sized(&mut frame, 1)?;
                analysis.record(plain, &value);
            }
            frame.stack.push(AbsValue::fresh(1, index));
        }
        Op::NewArray { .. } => {
            let value = pop_sized(&mut frame, 1)?;
            analysis.record(plain, &value);
            frame.stack.push(AbsValue::fresh(1, index));
        }
        Op::MultiNewArray { dims, .. } => {
            for _ in 0..*dims {
                let value = pop_sized(&mut frame, 1)?;
                analysis.record(plain, &value);
            }
            frame.stack.push(AbsValue::fresh(1, index));
        }
        Op::Field { opcode, descriptor: field_descriptor, .. } => {
            let size = descriptor::field_size(field_descriptor);
            match *opcode {
                op::GETSTATIC => frame.stack.push(AbsValue::fresh(size, index)),
                op::PUTSTATIC => {
                    let value = pop_sized(&mut frame, size)?;
                    analysis.record(plain, &value);
                }
                op::GETFIELD => {
                    let object = pop_sized(&mut frame, 1)?;
                    analysis.record(plain, &object);
                    frame.stack.push(AbsValue::fresh(size, index));
                }
                _ => {
                    let value = pop_sized(&mut frame, size)?;
                    analysis.record(plain, &value);
                    let object = pop_sized(&mut frame, 1)?;
                    analysis.record(plain, &object);
                }
            }
        }
        Op::Invoke(call) => {
            let sig = descriptor::parse_method_descriptor(&call.descriptor)?;
            let mut values = Vec::with_capacity(sig.params.len() + 1);
            for param in sig.params.iter().rev() {
                values.push(pop_sized(&mut frame, param.size)?);
            }
            if call.kind.has_receiver() {
                values.push(pop_sized(&mut frame, 1)?);
            }
            values.reverse();
            if values.is_empty() {
                analysis.touch(Consumer::no_args(index));
            } else {
                for (position, value) in values.iter().enumerate() {
                    analysis.record(Consumer::arg(index, position as u16), value);
                }
            }
            if let Some(size) = return_size(sig.ret) {
                frame.stack.push(AbsValue::fresh(size, index));
            }
        }
        Op::InvokeDynamic { descriptor: call_descriptor, .. } => {
            let sig = descriptor::parse_method_descriptor(call_descriptor)?;
            for param in sig.params.iter().rev() {
                let value = pop_sized(&mut frame, param.size)?;
                analysis.record(plain, &value);
            }
            if let Some(size) = return_size(sig.ret) {
                frame.stack.push(AbsValue::fresh(size, index));
            }
        }
        Op::Branch { opcode, target } => {
            match *opcode {
                op::GOTO | op::GOTO_W => fall_through = false,
                op::IF_ICMPEQ..=op::IF_ACMPNE => {
                    for _ in 0..2 {
                        let value = pop_sized(&mut frame, 1)?;
                        analysis.record(plain, &value);
                    }
                }
                _ => {
                    let value = pop_sized(&mut frame, 1)?;
                    analysis.record(plain, &value);
                }
            }
            extra_successors.push(*target);
        }
        Op::TableSwitch { default, targets, .. } => {
            let value = pop_sized(&mut frame, 1)?;
            analysis.record(plain, &value);
            fall_through = false;
            extra_successors.push(*default);
            extra_successors.extend(targets.iter().copied());
        }
        Op::LookupSwitch { default, pairs } => {
            let value = pop_sized(&mut frame, 1)?;
            analysis.record(plain, &value);
            fall_through = false;
            extra_successors.push(*default);
            extra_successors.extend(pairs.iter().map(|(_, target)| *target));
        }
    }

    let mut successors = Vec::with_capacity(1 + extra_successors.len());
    if fall_through {
        successors.push((index + 1, frame.clone()));
    }
    for successor in extra_successors {
        successors.push((successor, frame.clone()));
    }
    Ok(successors)
}

fn return_size(ret: ReturnCategory) -> Option<u8> {
    match ret {
        ReturnCategory::Void => None,
        ReturnCategory::Long | ReturnCategory::Double => Some(2),
        _ => Some(1),
    }
}

fn pop(frame: &mut Frame) -> Result<AbsValue> {
    frame.stack.pop().context("operand stack underflow")
}

fn pop_sized(frame: &mut Frame, size: u8) -> Result<AbsValue> {
    let value = pop(frame)?;
    if value.size != size {
        anyhow::bail!("operand width mismatch: wanted {size}, found {}", value.size);
    }
    Ok(value)
}

/// The dup/swap family, with explicit category analysis. Duplicated values
/// become fresh values produced by the shuffle; pass-through values keep
/// their identity.
fn stack_shuffle(index: usize, opcode: u8, frame: &mut Frame, analysis: &mut Analysis) -> Result<()> {
    let plain = Consumer::plain(index);
    let mut copy = |value: &AbsValue, analysis: &mut Analysis| -> AbsValue {
        analysis.record(plain, value);
        AbsValue::fresh(value.size, index)
    };
    match opcode {
        op::DUP => {
            let v1 = pop_sized(frame, 1)?;
            let c1 = copy(&v1, analysis);
            frame.stack.push(v1);
            frame.stack.push(c1);
        }
        op::DUP_X1 => {
            let v1 = pop_sized(frame, 1)?;
            let v2 = pop_sized(frame, 1)?;
            let c1 = copy(&v1, analysis);
            frame.stack.push(c1);
            frame.stack.push(v2);
            frame.stack.push(v1);
        }
        op::DUP_X2 => {
            let v1 = pop_sized(frame, 1)?;
            let v2 = pop(frame)?;
            let c1 = copy(&v1, analysis);
            if v2.size == 2 {
                frame.stack.push(c1);
                frame.stack.push(v2);
            } else {
                let v3 = pop_sized(frame, 1)?;
                frame.stack.push(c1);
                frame.stack.push(v3);
                frame.stack.push(v2);
            }
            frame.stack.push(v1);
        }
        op::DUP2 => {
            let v1 = pop(frame)?;
            if v1.size == 2 {
                let c1 = copy(&v1, analysis);
                frame.stack.push(v1);
                frame.stack.push(c1);
            } else {
                let v2 = pop_sized(frame, 1)?;
                let c1 = copy(&v1, analysis);
                let c2 = copy(&v2, analysis);
                frame.stack.push(v2);
                frame.stack.push(v1);
                frame.stack.push(c2);
                frame.stack.push(c1);
            }
        }
        op::DUP2_X1 => {
            let v1 = pop(frame)?;
            if v1.size == 2 {
                let v2 = pop_sized(frame, 1)?;
                let c1 = copy(&v1, analysis);
                frame.stack.push(c1);
                frame.stack.push(v2);
                frame.stack.push(v1);
            } else {
                let v2 = pop_sized(frame, 1)?;
                let v3 = pop_sized(frame, 1)?;
                let c1 = copy(&v1, analysis);
                let c2 = copy(&v2, analysis);
                frame.stack.push(c2);
                frame.stack.push(c1);
                frame.stack.push(v3);
                frame.stack.push(v2);
                frame.stack.push(v1);
            }
        }
        op::DUP2_X2 => {
            let v1 = pop(frame)?;
            if v1.size == 2 {
                let v2 = pop(frame)?;
                let c1 = copy(&v1, analysis);
                if v2.size == 2 {
                    frame.stack.push(c1);
                    frame.stack.push(v2);
                } else {
                    let v3 = pop_sized(frame, 1)?;
                    frame.stack.push(c1);
                    frame.stack.push(v3);
                    frame.stack.push(v2);
                }
                frame.stack.push(v1);
            } else {
                let v2 = pop_sized(frame, 1)?;
                let v3 = pop(frame)?;
                let c1 = copy(&v1, analysis);
                let c2 = copy(&v2, analysis);
                if v3.size == 2 {
                    frame.stack.push(c2);
                    frame.stack.push(c1);
                    frame.stack.push(v3);
                } else {
                    let v4 = pop_sized(frame, 1)?;
                    frame.stack.push(c2);
                    frame.stack.push(c1);
                    frame.stack.push(v4);
                    frame.stack.push(v3);
                }
                frame.stack.push(v2);
                frame.stack.push(v1);
            }
        }
        op::SWAP => {
            // Treated as consuming both operands; conservative but sound.
            let v1 = pop_sized(frame, 1)?;
            let v2 = pop_sized(frame, 1)?;
            let c1 = copy(&v1, analysis);
            let c2 = copy(&v2, analysis);
            frame.stack.push(c1);
            frame.stack.push(c2);
        }
        other => anyhow::bail!("not a stack shuffle opcode: {other:#04x}"),
    }
    Ok(())
}

/// Pops (entry sizes, top first) and optional push for fixed-shape opcodes.
fn simple_io(opcode: u8) -> Result<(&'static [u8], Option<u8>)> {
    Ok(match opcode {
        op::ACONST_NULL..=0x08 => (&[], Some(1)),
        op::LCONST_0 | op::LCONST_1 => (&[], Some(2)),
        op::FCONST_0..=op::FCONST_2 => (&[], Some(1)),
        op::DCONST_0 | op::DCONST_1 => (&[], Some(2)),
        // Array element loads: index, then array reference.
        0x2e | 0x30 | 0x32..=0x35 => (&[1, 1], Some(1)),
        0x2f | 0x31 => (&[1, 1], Some(2)),
        // Array element stores: value, index, array reference.
        0x4f | 0x51 | 0x53..=0x56 => (&[1, 1, 1], None),
        0x50 | 0x52 => (&[2, 1, 1], None),
        // Integer and float arithmetic.
        0x60 | 0x64 | 0x68 | 0x6c | 0x70 | 0x78 | 0x7a | 0x7c | 0x7e | 0x80 | 0x82 => {
            (&[1, 1], Some(1))
        }
        0x62 | 0x66 | 0x6a | 0x6e | 0x72 => (&[1, 1], Some(1)),
        // Long and double arithmetic.
        0x61 | 0x65 | 0x69 | 0x6d | 0x71 | 0x7f | 0x81 | 0x83 => (&[2, 2], Some(2)),
        0x63 | 0x67 | 0x6b | 0x6f | 0x73 => (&[2, 2], Some(2)),
        // Long shifts take an int shift amount on top.
        0x79 | 0x7b | 0x7d => (&[1, 2], Some(2)),
        0x74 | 0x76 => (&[1], Some(1)),
        0x75 | 0x77 => (&[2], Some(2)),
        // Conversions.
        0x85 => (&[1], Some(2)),
        0x86 => (&[1], Some(1)),
        0x87 => (&[1], Some(2)),
        0x88 | 0x89 => (&[2], Some(1)),
        0x8a => (&[2], Some(2)),
        0x8b => (&[1], Some(1)),
        0x8c | 0x8d => (&[1], Some(2)),
        0x8e | 0x90 => (&[2], Some(1)),
        0x8f => (&[2], Some(2)),
        0x91..=0x93 => (&[1], Some(1)),
        // Comparisons.
        op::LCMP => (&[2, 2], Some(1)),
        op::FCMPL | op::FCMPG => (&[1, 1], Some(1)),
        op::DCMPL | op::DCMPG => (&[2, 2], Some(1)),
        op::ARRAYLENGTH => (&[1], Some(1)),
        op::MONITORENTER | op::MONITOREXIT => (&[1], None),
        other => anyhow::bail!("unmodeled opcode {other:#04x}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CallKind, CallSite};

    fn invoke_static(owner: &str, name: &str, descriptor: &str) -> Op {
        Op::Invoke(CallSite {
            owner: owner.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            kind: CallKind::Static,
            index: 1,
        })
    }

    #[test]
    fn linear_chain_links_producers_to_call_arguments() {
        // iload_0; iload_1; iadd; invokestatic sink(I)V; return
        let ops = vec![
            Op::Local { opcode: op::ILOAD, var: 0 },
            Op::Local { opcode: op::ILOAD, var: 1 },
            Op::Simple(0x60),
            invoke_static("Sink", "take", "(I)V"),
            Op::Simple(op::RETURN),
        ];
        let graph = build(&ops, &[], true, "(II)V", 2).expect("analysis");

        let add = Consumer::plain(2);
        let arg = Consumer::arg(3, 0);
        assert_eq!(graph.out_degree(Consumer::plain(0)), 1);
        assert!(graph.out_edges(Consumer::plain(0)).expect("edges").contains(&add));
        assert!(graph.out_edges(add).expect("edges").contains(&arg));
        // The call decomposed into exactly one argument consumer.
        let consumers: Vec<Consumer> = graph.consumers_of(3).collect();
        assert_eq!(consumers, vec![arg]);
    }

    #[test]
    fn conditional_join_unions_producers() {
        // iload_0; ifeq -> 4; iconst_1; goto -> 5; iconst_0; ireturn
        let ops = vec![
            Op::Local { opcode: op::ILOAD, var: 0 },
            Op::Branch { opcode: op::IFEQ, target: 4 },
            Op::Simple(0x04),
            Op::Branch { opcode: op::GOTO, target: 5 },
            Op::Simple(op::ICONST_0),
            Op::Simple(op::IRETURN),
        ];
        let graph = build(&ops, &[], true, "(I)I", 1).expect("analysis");

        let ret = Consumer::plain(5);
        let from_then = graph.out_edges(Consumer::plain(2)).expect("then edge");
        let from_else = graph.out_edges(Consumer::plain(4)).expect("else edge");
        assert!(from_then.contains(&ret));
        assert!(from_else.contains(&ret));
    }

    #[test]
    fn receiver_becomes_argument_zero() {
        // aload_0; iconst_0; invokevirtual take(I)V; return
        let ops = vec![
            Op::Local { opcode: op::ALOAD, var: 0 },
            Op::Simple(op::ICONST_0),
            Op::Invoke(CallSite {
                owner: "App".to_string(),
                name: "take".to_string(),
                descriptor: "(I)V".to_string(),
                kind: CallKind::Virtual,
                index: 1,
            }),
            Op::Simple(op::RETURN),
        ];
        let graph = build(&ops, &[], false, "()V", 1).expect("analysis");

        let consumers: Vec<Consumer> = graph.consumers_of(2).collect();
        assert_eq!(consumers, vec![Consumer::arg(2, 0), Consumer::arg(2, 1)]);
        assert!(
            graph
                .out_edges(Consumer::plain(0))
                .expect("receiver edge")
                .contains(&Consumer::arg(2, 0))
        );
    }

    #[test]
    fn zero_operand_call_still_owns_a_consumer() {
        let ops = vec![invoke_static("Sink", "tick", "()V"), Op::Simple(op::RETURN)];
        let graph = build(&ops, &[], true, "()V", 0).expect("analysis");
        let consumers: Vec<Consumer> = graph.consumers_of(0).collect();
        assert_eq!(consumers, vec![Consumer::no_args(0)]);
    }

    #[test]
    fn stack_underflow_degrades_to_error() {
        let ops = vec![Op::Simple(0x60), Op::Simple(op::RETURN)];
        assert!(build(&ops, &[], true, "()V", 0).is_err());
    }

    #[test]
    fn handler_entry_gets_single_value_stack() {
        // Protected region stores into local 1; handler loads it and returns.
        let ops = vec![
            Op::Simple(op::ICONST_0),                    // 0
            Op::Local { opcode: op::ISTORE, var: 1 },    // 1
            Op::Simple(op::RETURN),                      // 2
            Op::Local { opcode: op::ALOAD, var: 0 },     // 3 handler: athrow again
            Op::Simple(op::ATHROW),                      // 4
        ];
        let handlers = vec![ExceptionHandler { start: 0, end: 2, handler: 3, catch_type: 0 }];
        let graph = build(&ops, &handlers, false, "()V", 2).expect("analysis");
        // The handler body was reached and modeled.
        assert!(graph.consumers_of(4).next().is_some());
    }
}
