//! Class hierarchy model: ancestor walks, owner resolution, stub shapes.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::classfile::ClassFile;
use crate::ir::{MethodBody, Op, StubShape};
use crate::opcodes as op;

pub(crate) const ROOT_OBJECT: &str = "java/lang/Object";

/// One method of a modeled class, immutable once classified.
#[derive(Clone, Debug)]
pub(crate) struct MethodEntity {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) is_static: bool,
    pub(crate) is_abstract: bool,
    pub(crate) stub: Option<StubShape>,
}

/// One modeled class or interface.
#[derive(Clone, Debug)]
pub(crate) struct ClassEntity {
    pub(crate) name: String,
    pub(crate) super_name: Option<String>,
    pub(crate) interfaces: Vec<String>,
    pub(crate) is_interface: bool,
    pub(crate) is_abstract: bool,
    pub(crate) methods: BTreeMap<(String, String), MethodEntity>,
    pub(crate) fields: BTreeMap<String, String>,
}

impl ClassEntity {
    /// Builds an entity from a parsed class. With bodies present, methods are
    /// additionally classified for stub eligibility; library classes are read
    /// without bodies and never carry stub shapes.
    pub(crate) fn from_class_file(file: &ClassFile, bodies: Option<&[MethodBody]>) -> Self {
        let mut methods = BTreeMap::new();
        for (index, info) in file.methods.iter().enumerate() {
            let body = bodies.and_then(|bodies| bodies.get(index));
            let stub = body.and_then(|body| {
                if body.is_constructor() {
                    None
                } else {
                    classify_stub(body)
                }
            });
            methods.insert(
                (info.name.clone(), info.descriptor.clone()),
                MethodEntity {
                    name: info.name.clone(),
                    descriptor: info.descriptor.clone(),
                    is_static: info.access & op::ACC_STATIC != 0,
                    is_abstract: info.access & op::ACC_ABSTRACT != 0,
                    stub,
                },
            );
        }
        let fields = file
            .fields
            .iter()
            .map(|field| (field.name.clone(), field.descriptor.clone()))
            .collect();
        ClassEntity {
            name: file.name.clone(),
            super_name: file.super_name.clone(),
            interfaces: file.interfaces.clone(),
            is_interface: file.access & op::ACC_INTERFACE != 0,
            is_abstract: file.access & op::ACC_ABSTRACT != 0,
            methods,
            fields,
        }
    }

    pub(crate) fn method(&self, name: &str, descriptor: &str) -> Option<&MethodEntity> {
        self.methods
            .get(&(name.to_string(), descriptor.to_string()))
    }
}

/// Classifies a decoded body as a trivial stub: exactly `return`, or one
/// default-value push followed by the matching return.
pub(crate) fn classify_stub(body: &MethodBody) -> Option<StubShape> {
    let ops = body.instructions.as_deref()?;
    match ops {
        [Op::Simple(op::RETURN)] => Some(StubShape::Void),
        [Op::Simple(op::ACONST_NULL), Op::Simple(op::ARETURN)] => Some(StubShape::Ref),
        [Op::Simple(op::ICONST_0), Op::Simple(op::IRETURN)] => Some(StubShape::Int),
        [Op::Simple(op::LCONST_0), Op::Simple(op::LRETURN)] => Some(StubShape::Long),
        [Op::Simple(op::FCONST_0), Op::Simple(op::FRETURN)] => Some(StubShape::Float),
        [Op::Simple(op::DCONST_0), Op::Simple(op::DRETURN)] => Some(StubShape::Double),
        // Non-zero byte/short pushes still qualify: the call site only needs
        // a value of the right category, not the same value.
        [Op::Push { opcode: op::BIPUSH, .. }, Op::Simple(op::IRETURN)] => Some(StubShape::Byte),
        [Op::Push { opcode: op::SIPUSH, .. }, Op::Simple(op::IRETURN)] => Some(StubShape::Short),
        _ => None,
    }
}

/// A global view of every modeled class, input and library alike.
#[derive(Debug, Default)]
pub(crate) struct Hierarchy {
    classes: BTreeMap<String, ClassEntity>,
    input_classes: BTreeSet<String>,
    children: BTreeMap<String, Vec<String>>,
    ancestor_cache: RefCell<BTreeMap<String, Vec<String>>>,
}

impl Hierarchy {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_class(&mut self, entity: ClassEntity, in_input: bool) {
        if in_input {
            self.input_classes.insert(entity.name.clone());
        }
        self.classes.insert(entity.name.clone(), entity);
    }

    /// Second construction phase: superclass and declared-implements edges,
    /// added once every class is known.
    pub(crate) fn add_edges(&mut self) {
        self.children.clear();
        self.ancestor_cache.borrow_mut().clear();
        let names: Vec<String> = self.classes.keys().cloned().collect();
        for name in names {
            let entity = &self.classes[&name];
            let super_name = entity.super_name.clone();
            let interfaces = entity.interfaces.clone();
            if let Some(super_name) = super_name
                && self.classes.contains_key(&super_name)
            {
                self.children.entry(super_name).or_default().push(name.clone());
            }
            for interface in interfaces {
                if self
                    .classes
                    .get(&interface)
                    .is_some_and(|entity| entity.is_interface)
                {
                    self.children.entry(interface).or_default().push(name.clone());
                }
            }
        }
    }

    pub(crate) fn get(&self, name: &str) -> Option<&ClassEntity> {
        self.classes.get(name)
    }

    pub(crate) fn is_input_class(&self, name: &str) -> bool {
        self.input_classes.contains(name)
    }

    /// Ancestors of `name` ordered base-to-derived, excluding `name` itself.
    ///
    /// When the walk leaves the modeled set, the declared (unmodeled, non
    /// Object) superclass of the last reached class is kept as a synthetic
    /// base element, so partially modeled libraries degrade gracefully.
    pub(crate) fn ancestor_chain(&self, name: &str) -> Vec<String> {
        if let Some(cached) = self.ancestor_cache.borrow().get(name) {
            return cached.clone();
        }
        let mut chain = Vec::new();
        if self.classes.contains_key(name) {
            let mut queue = VecDeque::from([name.to_string()]);
            let mut seen = BTreeSet::from([name.to_string()]);
            let mut last = name.to_string();
            while let Some(current) = queue.pop_front() {
                last = current.clone();
                let Some(entity) = self.classes.get(&current) else {
                    continue;
                };
                let mut parents = Vec::new();
                if let Some(super_name) = &entity.super_name
                    && self.classes.contains_key(super_name)
                {
                    parents.push(super_name.clone());
                }
                for interface in &entity.interfaces {
                    if self
                        .classes
                        .get(interface)
                        .is_some_and(|entity| entity.is_interface)
                    {
                        parents.push(interface.clone());
                    }
                }
                for parent in parents {
                    if seen.insert(parent.clone()) {
                        chain.push(parent.clone());
                        queue.push_back(parent);
                    }
                }
            }
            // The base-most modeled class may still extend something we never
            // read; keep its name so widening can stop there.
            if let Some(entity) = self.classes.get(&last)
                && let Some(super_name) = &entity.super_name
                && super_name != ROOT_OBJECT
                && !self.classes.contains_key(super_name)
            {
                chain.push(super_name.clone());
            }
            chain.reverse();
        }
        self.ancestor_cache
            .borrow_mut()
            .insert(name.to_string(), chain.clone());
        chain
    }

    /// Walks the superclass chain (never interfaces) for the class declaring
    /// `(name, descriptor)`. `None` means no concrete declaration is
    /// reachable; callers must treat that conservatively.
    pub(crate) fn resolve_method_owner(
        &self,
        class_name: &str,
        name: &str,
        descriptor: &str,
    ) -> Option<(&ClassEntity, &MethodEntity)> {
        let mut current = self.classes.get(class_name)?;
        loop {
            if let Some(method) = current.method(name, descriptor) {
                return Some((current, method));
            }
            current = self.classes.get(current.super_name.as_deref()?)?;
        }
    }

    /// Declaring-class name for a call, falling back to the static owner for
    /// interface dispatch and unmodeled owners.
    pub(crate) fn method_owner_name(
        &self,
        owner: &str,
        name: &str,
        descriptor: &str,
        interface: bool,
    ) -> String {
        if interface || !self.input_classes.contains(owner) {
            return owner.to_string();
        }
        self.resolve_method_owner(owner, name, descriptor)
            .map_or_else(|| owner.to_string(), |(entity, _)| entity.name.clone())
    }

    /// Declaring-class name for a field access, used only for widening
    /// constraints.
    pub(crate) fn field_owner_name(&self, owner: &str, field: &str) -> String {
        if !self.input_classes.contains(owner) {
            return owner.to_string();
        }
        let mut current = self.classes.get(owner);
        while let Some(entity) = current {
            if entity.fields.contains_key(field) {
                return entity.name.clone();
            }
            current = entity
                .super_name
                .as_deref()
                .and_then(|super_name| self.classes.get(super_name));
        }
        owner.to_string()
    }

    /// Least common ancestor, `java/lang/Object` when either side is
    /// unmodeled or no ancestor is found. Error-recovery fallback for codec
    /// collaborators that need a supertype they cannot otherwise determine.
    #[allow(dead_code)]
    pub(crate) fn common_ancestor(&self, a: &str, b: &str) -> String {
        if a == b && self.classes.contains_key(a) {
            return a.to_string();
        }
        if !self.classes.contains_key(a) || !self.classes.contains_key(b) {
            return ROOT_OBJECT.to_string();
        }
        let mut of_a: BTreeSet<String> = BTreeSet::from([a.to_string()]);
        of_a.extend(self.ancestor_chain(a));
        if of_a.contains(b) {
            return b.to_string();
        }
        // ancestor_chain is base-to-derived; scan derived-first for the most
        // specific shared ancestor.
        for candidate in self.ancestor_chain(b).iter().rev() {
            if of_a.contains(candidate) {
                return candidate.clone();
            }
        }
        ROOT_OBJECT.to_string()
    }

    /// All modeled classes below `name`, breadth-first, excluding `name`.
    pub(crate) fn descendants(&self, name: &str) -> Vec<String> {
        let mut result = Vec::new();
        let mut queue = VecDeque::from([name.to_string()]);
        let mut seen = BTreeSet::from([name.to_string()]);
        while let Some(current) = queue.pop_front() {
            if let Some(children) = self.children.get(&current) {
                for child in children {
                    if seen.insert(child.clone()) {
                        result.push(child.clone());
                        queue.push_back(child.clone());
                    }
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(name: &str, super_name: Option<&str>) -> ClassEntity {
        ClassEntity {
            name: name.to_string(),
            super_name: super_name.map(str::to_string),
            interfaces: Vec::new(),
            is_interface: false,
            is_abstract: false,
            methods: BTreeMap::new(),
            fields: BTreeMap::new(),
        }
    }

    fn with_method(mut entity: ClassEntity, name: &str, descriptor: &str) -> ClassEntity {
        entity.methods.insert(
            (name.to_string(), descriptor.to_string()),
            MethodEntity {
                name: name.to_string(),
                descriptor: descriptor.to_string(),
                is_static: false,
                is_abstract: false,
                stub: None,
            },
        );
        entity
    }

    fn linear_hierarchy() -> Hierarchy {
        let mut hierarchy = Hierarchy::new();
        hierarchy.add_class(entity("Base", Some(ROOT_OBJECT)), true);
        hierarchy.add_class(entity("Mid", Some("Base")), true);
        hierarchy.add_class(entity("Leaf", Some("Mid")), true);
        hierarchy.add_edges();
        hierarchy
    }

    #[test]
    fn ancestor_chain_is_base_to_derived_without_self() {
        let hierarchy = linear_hierarchy();
        assert_eq!(hierarchy.ancestor_chain("Leaf"), vec!["Base", "Mid"]);
        assert_eq!(hierarchy.ancestor_chain("Base"), Vec::<String>::new());
        assert_eq!(hierarchy.ancestor_chain("Missing"), Vec::<String>::new());
    }

    #[test]
    fn partially_modeled_chain_keeps_declared_super() {
        let mut hierarchy = Hierarchy::new();
        hierarchy.add_class(entity("App", Some("lib/Unread")), true);
        hierarchy.add_edges();
        assert_eq!(hierarchy.ancestor_chain("App"), vec!["lib/Unread"]);
    }

    #[test]
    fn method_owner_walks_superclasses_only() {
        let mut hierarchy = Hierarchy::new();
        hierarchy.add_class(
            with_method(entity("Base", Some(ROOT_OBJECT)), "foo", "()V"),
            true,
        );
        hierarchy.add_class(entity("Leaf", Some("Base")), true);
        hierarchy.add_edges();

        let (owner, _) = hierarchy
            .resolve_method_owner("Leaf", "foo", "()V")
            .expect("resolve through super");
        assert_eq!(owner.name, "Base");
        assert!(hierarchy.resolve_method_owner("Leaf", "bar", "()V").is_none());
    }

    #[test]
    fn common_ancestor_falls_back_to_object() {
        let mut hierarchy = Hierarchy::new();
        hierarchy.add_class(entity("Base", Some(ROOT_OBJECT)), true);
        hierarchy.add_class(entity("A", Some("Base")), true);
        hierarchy.add_class(entity("B", Some("Base")), true);
        hierarchy.add_edges();

        assert_eq!(hierarchy.common_ancestor("A", "B"), "Base");
        assert_eq!(hierarchy.common_ancestor("A", "Unknown"), ROOT_OBJECT);
        assert_eq!(hierarchy.common_ancestor("A", "A"), "A");
    }

    #[test]
    fn descendants_cover_the_whole_subtree() {
        let hierarchy = linear_hierarchy();
        assert_eq!(hierarchy.descendants("Base"), vec!["Mid", "Leaf"]);
        assert!(hierarchy.descendants("Leaf").is_empty());
    }
}
