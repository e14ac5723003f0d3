//! Union-find grouping of consumer nodes into atomically removable sets.
//!
//! The union-find itself stays pure (path-compressed parent map); reverse
//! edges that survive collapsing live in a side table keyed by canonical
//! roots and rebuilt by an explicit flatten step after every batch of unions.
//! Probes clone the grouping so the canonical state per method is never
//! mutated.

use std::collections::{BTreeMap, BTreeSet};

use crate::depgraph::{Consumer, DependencyGraph};

/// One maximal merged set of consumers, addressed by its root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct InsnGroup {
    pub(crate) root: Consumer,
    pub(crate) members: BTreeSet<Consumer>,
}

/// Union-find over the consumers of one dependency graph.
#[derive(Clone, Debug)]
pub(crate) struct ReductionGrouping {
    parent: BTreeMap<Consumer, Consumer>,
    /// Non-collapsed incoming edges, keyed by group root after `flatten`.
    reverse: BTreeMap<Consumer, BTreeSet<Consumer>>,
    groups: usize,
}

impl ReductionGrouping {
    pub(crate) fn new(graph: &DependencyGraph) -> Self {
        let parent: BTreeMap<Consumer, Consumer> =
            graph.vertices().map(|vertex| (vertex, vertex)).collect();
        let groups = parent.len();
        Self { parent, reverse: BTreeMap::new(), groups }
    }

    #[allow(dead_code)]
    pub(crate) fn group_count(&self) -> usize {
        self.groups
    }

    /// Collapses every single-use, non-call-argument producer into its sole
    /// consumer's group; all other edges are recorded as reverse edges.
    pub(crate) fn collapse_single_use(&mut self, graph: &DependencyGraph) {
        for (source, target) in graph.edges() {
            if graph.out_degree(source) == 1 && !source.is_call() {
                self.union(source, target);
            } else {
                self.reverse.entry(target).or_default().insert(source);
            }
        }
        self.flatten();
    }

    /// Chains consecutively removed calls: a removed argument whose sole
    /// consumer is another removed call merges into that call's group, and
    /// the corresponding reverse edge disappears.
    fn union_removal_dependency(&mut self, graph: &DependencyGraph, removed: &BTreeSet<Consumer>) {
        for source in removed {
            let Some(out) = graph.out_edges(*source) else { continue };
            if out.len() != 1 {
                continue;
            }
            let target = *out.iter().next().expect("single out edge");
            if target.is_call() && removed.contains(&target) {
                self.union(*source, target);
                if let Some(sources) = self.reverse.get_mut(&target) {
                    sources.remove(source);
                }
            }
        }
        self.flatten();
    }

    /// Computes the groups that are safe to physically delete when the given
    /// call instructions are being removed: exactly those rooted at a removed
    /// argument with no remaining reverse edge from outside the removal set.
    pub(crate) fn removal_groups(
        &mut self,
        graph: &DependencyGraph,
        removed_calls: &BTreeSet<usize>,
    ) -> Vec<InsnGroup> {
        let removed_args: BTreeSet<Consumer> = removed_calls
            .iter()
            .flat_map(|insn| graph.consumers_of(*insn))
            .collect();

        self.union_removal_dependency(graph, &removed_args);
        let group_map = self.group_map();

        let mut removal = Vec::new();
        for source in &removed_args {
            // An argument merged into another group is handled by that group.
            let Some(group) = group_map.get(source) else { continue };
            if self.reverse.get(source).is_none_or(BTreeSet::is_empty) {
                removal.push(group.clone());
            }
        }
        removal
    }

    /// Groups keyed by root; the parent map must be flattened first.
    pub(crate) fn group_map(&mut self) -> BTreeMap<Consumer, InsnGroup> {
        let members: Vec<Consumer> = self.parent.keys().copied().collect();
        let mut reverse_parent: BTreeMap<Consumer, BTreeSet<Consumer>> = BTreeMap::new();
        for member in members {
            let root = self.find(member);
            reverse_parent.entry(root).or_default().insert(member);
        }
        reverse_parent
            .into_iter()
            .map(|(root, members)| (root, InsnGroup { root, members }))
            .collect()
    }

    pub(crate) fn find(&mut self, consumer: Consumer) -> Consumer {
        debug_assert!(self.parent.contains_key(&consumer));
        let mut root = consumer;
        while let Some(&parent) = self.parent.get(&root) {
            if parent == root {
                break;
            }
            root = parent;
        }
        // Path compression.
        let mut current = consumer;
        while current != root {
            let parent = self.parent[&current];
            self.parent.insert(current, root);
            current = parent;
        }
        root
    }

    pub(crate) fn union(&mut self, source: Consumer, dest: Consumer) {
        let dest_root = self.find(dest);
        let source_root = self.find(source);
        if source_root == dest_root {
            return;
        }
        self.parent.insert(source_root, dest_root);
        self.groups -= 1;
    }

    /// Compresses every path and re-keys the reverse-edge table by roots.
    pub(crate) fn flatten(&mut self) {
        let members: Vec<Consumer> = self.parent.keys().copied().collect();
        for member in members {
            let root = self.find(member);
            self.parent.insert(member, root);
        }
        let old = std::mem::take(&mut self.reverse);
        for (target, sources) in old {
            let target_root = self.find(target);
            let source_roots: Vec<Consumer> =
                sources.into_iter().map(|source| self.find(source)).collect();
            let entry = self.reverse.entry(target_root).or_default();
            for source_root in source_roots {
                entry.insert(source_root);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depgraph::{self, Consumer};
    use crate::ir::{CallKind, CallSite, Op};
    use crate::opcodes as op;

    fn invoke_static(descriptor: &str) -> Op {
        Op::Invoke(CallSite {
            owner: "Sink".to_string(),
            name: "take".to_string(),
            descriptor: descriptor.to_string(),
            kind: CallKind::Static,
            index: 1,
        })
    }

    /// load a; load b; add; invoke(x) — every producer used exactly once.
    fn chain_ops() -> Vec<Op> {
        vec![
            Op::Local { opcode: op::ILOAD, var: 0 },
            Op::Local { opcode: op::ILOAD, var: 1 },
            Op::Simple(0x60),
            invoke_static("(I)V"),
            Op::Simple(op::RETURN),
        ]
    }

    #[test]
    fn single_use_chain_collapses_into_one_removable_group() {
        let ops = chain_ops();
        let graph = depgraph::build(&ops, &[], true, "(II)V", 2).expect("analysis");
        let mut grouping = ReductionGrouping::new(&graph);
        grouping.collapse_single_use(&graph);

        let mut probe = grouping.clone();
        let groups = probe.removal_groups(&graph, &BTreeSet::from([3usize]));

        assert_eq!(groups.len(), 1);
        let insns: BTreeSet<usize> = groups[0].members.iter().map(|c| c.insn).collect();
        assert_eq!(insns, BTreeSet::from([0, 1, 2, 3]));
        assert_eq!(groups[0].root, Consumer::arg(3, 0));
    }

    #[test]
    fn external_consumer_blocks_removal_of_shared_producer() {
        // Same chain, but the add result is duplicated and also returned, so
        // the producers must stay.
        let ops = vec![
            Op::Local { opcode: op::ILOAD, var: 0 },
            Op::Local { opcode: op::ILOAD, var: 1 },
            Op::Simple(0x60),
            Op::Simple(op::DUP),
            invoke_static("(I)V"),
            Op::Simple(op::IRETURN),
        ];
        let graph = depgraph::build(&ops, &[], true, "(II)I", 2).expect("analysis");
        let mut grouping = ReductionGrouping::new(&graph);
        grouping.collapse_single_use(&graph);

        let mut probe = grouping.clone();
        let groups = probe.removal_groups(&graph, &BTreeSet::from([4usize]));

        let removable: BTreeSet<usize> = groups
            .iter()
            .flat_map(|group| group.members.iter().map(|c| c.insn))
            .collect();
        assert!(!removable.contains(&2), "shared add must survive: {removable:?}");
        assert!(!removable.contains(&0));
        assert!(!removable.contains(&1));
    }

    #[test]
    fn chained_removed_calls_merge_into_one_group() {
        // invoke inner()I feeds invoke outer(I)V; removing both merges them.
        let ops = vec![
            Op::Invoke(CallSite {
                owner: "Sink".to_string(),
                name: "inner".to_string(),
                descriptor: "()I".to_string(),
                kind: CallKind::Static,
                index: 1,
            }),
            invoke_static("(I)V"),
            Op::Simple(op::RETURN),
        ];
        let graph = depgraph::build(&ops, &[], true, "()V", 0).expect("analysis");
        let mut grouping = ReductionGrouping::new(&graph);
        grouping.collapse_single_use(&graph);

        let mut probe = grouping.clone();
        let groups = probe.removal_groups(&graph, &BTreeSet::from([0usize, 1usize]));

        assert_eq!(groups.len(), 1);
        let insns: BTreeSet<usize> = groups[0].members.iter().map(|c| c.insn).collect();
        assert_eq!(insns, BTreeSet::from([0, 1]));
        assert_eq!(groups[0].root.insn, 1);
    }

    #[test]
    fn snapshot_probes_leave_canonical_state_untouched() {
        let ops = chain_ops();
        let graph = depgraph::build(&ops, &[], true, "(II)V", 2).expect("analysis");
        let mut grouping = ReductionGrouping::new(&graph);
        grouping.collapse_single_use(&graph);
        let groups_before = grouping.group_count();

        let mut probe = grouping.clone();
        let _ = probe.removal_groups(&graph, &BTreeSet::from([3usize]));

        assert_eq!(grouping.group_count(), groups_before);
        let mut probe2 = grouping.clone();
        let again = probe2.removal_groups(&graph, &BTreeSet::from([3usize]));
        assert_eq!(again.len(), 1);
    }
}
