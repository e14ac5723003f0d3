//! Call-stubbing resolver: decides, per call site, whether the call can be
//! replaced by a pop/push-default stub without changing observable behavior.
//!
//! Virtual and interface dispatch is only stubbable when every overriding
//! declaration in the modeled hierarchy is itself stub-shaped; one concrete
//! override with a real body forces the native call for every site sharing
//! the (kind, owner, name, descriptor) tuple.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;

use crate::descriptor::{self, ReturnCategory};
use crate::hierarchy::Hierarchy;
use crate::ir::{CallKind, CallSite, Op, StubShape};
use crate::opcodes as op;

/// Resolution outcome for one call tuple.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CallDecision {
    /// Keep the real call.
    Native,
    /// Replace with a pop/push-default stub of the given shape.
    Stub(StubShape),
}

/// Memoized per-tuple resolver.
#[derive(Debug, Default)]
pub(crate) struct CallResolver {
    hierarchy_enabled: bool,
    memo: BTreeMap<(CallKind, String, String, String), CallDecision>,
}

impl CallResolver {
    pub(crate) fn new(hierarchy_enabled: bool) -> Self {
        Self { hierarchy_enabled, memo: BTreeMap::new() }
    }

    pub(crate) fn decide(&mut self, hierarchy: &Hierarchy, call: &CallSite) -> CallDecision {
        if call.name == "<init>" || call.name == "<clinit>" {
            return CallDecision::Native;
        }
        if !self.hierarchy_enabled {
            return CallDecision::Native;
        }
        let key = (
            call.kind,
            call.owner.clone(),
            call.name.clone(),
            call.descriptor.clone(),
        );
        if let Some(decision) = self.memo.get(&key) {
            return *decision;
        }
        let decision = resolve(hierarchy, call);
        self.memo.insert(key, decision);
        decision
    }
}

fn resolve(hierarchy: &Hierarchy, call: &CallSite) -> CallDecision {
    let Some((_, root_method)) =
        hierarchy.resolve_method_owner(&call.owner, &call.name, &call.descriptor)
    else {
        // Resolution miss, including unmodeled owners: never safe to stub.
        return CallDecision::Native;
    };

    match call.kind {
        CallKind::Static | CallKind::Special => match root_method.stub {
            Some(shape) => CallDecision::Stub(shape),
            None => CallDecision::Native,
        },
        CallKind::Virtual | CallKind::Interface => {
            let mut shape = if root_method.is_abstract {
                None
            } else {
                match root_method.stub {
                    Some(shape) => Some(shape),
                    // Concrete root with a real body: nothing to decide.
                    None => return CallDecision::Native,
                }
            };
            for descendant in hierarchy.descendants(&call.owner) {
                let Some(entity) = hierarchy.get(&descendant) else { continue };
                let Some(method) = entity.method(&call.name, &call.descriptor) else {
                    continue;
                };
                if method.is_abstract {
                    continue;
                }
                match method.stub {
                    // Overriding shapes agree by construction (JVM overrides
                    // share the return category); keep the first.
                    Some(override_shape) => {
                        shape.get_or_insert(override_shape);
                    }
                    None => return CallDecision::Native,
                }
            }
            match shape {
                Some(shape) => CallDecision::Stub(shape),
                // Abstract contract with no concrete implementation reachable.
                None => CallDecision::Native,
            }
        }
    }
}

/// Builds the mechanical stub replacement for one call: pop each surviving
/// argument in reverse declaration order honoring slot widths, pop the
/// receiver when present and surviving, then push the canonical default for
/// the return category. Void calls keep a `nop` so the replacement is never
/// empty. No branches are ever introduced.
pub(crate) fn inline_pop(call: &CallSite, removed_args: &BTreeSet<u16>) -> Result<Vec<Op>> {
    let sig = descriptor::parse_method_descriptor(&call.descriptor)?;
    let is_static = !call.kind.has_receiver();
    let mut ops = Vec::new();

    let mut position = sig.params.len() as i64 - 1;
    if !is_static {
        position += 1;
    }
    for param in sig.params.iter().rev() {
        if position >= 0 && !removed_args.contains(&(position as u16)) {
            ops.push(Op::Simple(if param.size == 2 { op::POP2 } else { op::POP }));
        }
        position -= 1;
    }
    if !is_static && !removed_args.contains(&0) {
        ops.push(Op::Simple(op::POP));
    }

    ops.push(match sig.ret {
        ReturnCategory::Void => Op::Simple(op::NOP),
        ReturnCategory::Int => Op::Simple(op::ICONST_0),
        ReturnCategory::Long => Op::Simple(op::LCONST_0),
        ReturnCategory::Float => Op::Simple(op::FCONST_0),
        ReturnCategory::Double => Op::Simple(op::DCONST_0),
        ReturnCategory::Ref => Op::Simple(op::ACONST_NULL),
    });
    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::{ClassEntity, MethodEntity};
    use std::collections::BTreeMap as Map;

    fn entity(name: &str, super_name: &str) -> ClassEntity {
        ClassEntity {
            name: name.to_string(),
            super_name: Some(super_name.to_string()),
            interfaces: Vec::new(),
            is_interface: false,
            is_abstract: false,
            methods: Map::new(),
            fields: Map::new(),
        }
    }

    fn add_method(entity: &mut ClassEntity, name: &str, descriptor: &str, stub: Option<StubShape>) {
        entity.methods.insert(
            (name.to_string(), descriptor.to_string()),
            MethodEntity {
                name: name.to_string(),
                descriptor: descriptor.to_string(),
                is_static: false,
                is_abstract: false,
                stub,
            },
        );
    }

    fn call(kind: CallKind, owner: &str, name: &str, descriptor: &str) -> CallSite {
        CallSite {
            owner: owner.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            kind,
            index: 1,
        }
    }

    /// {A, B extends A, C extends A}; A and C have trivial foo bodies, B does
    /// not. No call statically typed A may be stubbed.
    #[test]
    fn non_trivial_override_forces_native_for_the_whole_tuple() {
        let mut hierarchy = Hierarchy::new();
        let mut a = entity("A", "java/lang/Object");
        add_method(&mut a, "foo", "()I", Some(StubShape::Int));
        let mut b = entity("B", "A");
        add_method(&mut b, "foo", "()I", None);
        let mut c = entity("C", "A");
        add_method(&mut c, "foo", "()I", Some(StubShape::Int));
        hierarchy.add_class(a, true);
        hierarchy.add_class(b, true);
        hierarchy.add_class(c, true);
        hierarchy.add_edges();

        let mut resolver = CallResolver::new(true);
        let decision = resolver.decide(&hierarchy, &call(CallKind::Virtual, "A", "foo", "()I"));
        assert_eq!(decision, CallDecision::Native);
    }

    #[test]
    fn all_trivial_overrides_allow_the_stub() {
        let mut hierarchy = Hierarchy::new();
        let mut a = entity("A", "java/lang/Object");
        add_method(&mut a, "foo", "()I", Some(StubShape::Int));
        let mut b = entity("B", "A");
        add_method(&mut b, "foo", "()I", Some(StubShape::Int));
        hierarchy.add_class(a, true);
        hierarchy.add_class(b, true);
        hierarchy.add_edges();

        let mut resolver = CallResolver::new(true);
        let decision = resolver.decide(&hierarchy, &call(CallKind::Virtual, "A", "foo", "()I"));
        assert_eq!(decision, CallDecision::Stub(StubShape::Int));
    }

    #[test]
    fn static_calls_resolve_through_the_superclass_chain() {
        let mut hierarchy = Hierarchy::new();
        let mut base = entity("Base", "java/lang/Object");
        add_method(&mut base, "util", "()V", Some(StubShape::Void));
        let leaf = entity("Leaf", "Base");
        hierarchy.add_class(base, true);
        hierarchy.add_class(leaf, true);
        hierarchy.add_edges();

        let mut resolver = CallResolver::new(true);
        let decision = resolver.decide(&hierarchy, &call(CallKind::Static, "Leaf", "util", "()V"));
        assert_eq!(decision, CallDecision::Stub(StubShape::Void));
    }

    #[test]
    fn unmodeled_owner_and_constructors_stay_native() {
        let hierarchy = Hierarchy::new();
        let mut resolver = CallResolver::new(true);
        assert_eq!(
            resolver.decide(&hierarchy, &call(CallKind::Static, "lib/Gone", "foo", "()V")),
            CallDecision::Native
        );
        assert_eq!(
            resolver.decide(&hierarchy, &call(CallKind::Special, "lib/Gone", "<init>", "()V")),
            CallDecision::Native
        );
    }

    #[test]
    fn disabled_hierarchy_means_everything_is_native() {
        let mut hierarchy = Hierarchy::new();
        let mut a = entity("A", "java/lang/Object");
        add_method(&mut a, "foo", "()I", Some(StubShape::Int));
        hierarchy.add_class(a, true);
        hierarchy.add_edges();

        let mut resolver = CallResolver::new(false);
        assert_eq!(
            resolver.decide(&hierarchy, &call(CallKind::Virtual, "A", "foo", "()I")),
            CallDecision::Native
        );
    }

    #[test]
    fn inline_pop_honors_widths_receiver_and_removed_args() {
        let site = call(CallKind::Virtual, "A", "foo", "(IJ)V");
        let ops = inline_pop(&site, &BTreeSet::new()).expect("stub");
        // Pops J (two slots), then I, then the receiver; void leaves a nop.
        assert_eq!(
            ops,
            vec![
                Op::Simple(op::POP2),
                Op::Simple(op::POP),
                Op::Simple(op::POP),
                Op::Simple(op::NOP),
            ]
        );

        // Receiver (argument 0) and the long (argument 2) already deleted.
        let ops = inline_pop(&site, &BTreeSet::from([0, 2])).expect("stub");
        assert_eq!(ops, vec![Op::Simple(op::POP), Op::Simple(op::NOP)]);
    }

    #[test]
    fn inline_pop_pushes_the_return_default() {
        let site = call(CallKind::Static, "A", "zero", "()D");
        let ops = inline_pop(&site, &BTreeSet::new()).expect("stub");
        assert_eq!(ops, vec![Op::Simple(op::DCONST_0)]);
    }
}
