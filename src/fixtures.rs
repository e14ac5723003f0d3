//! Synthetic class-file assembly for tests.
//!
//! Builds just enough of the class file format to exercise the parser, the
//! codec, and the pool without shipping binary fixtures.

use std::collections::BTreeMap;

/// Assembles a minimal, structurally valid class file.
pub(crate) struct ClassBuilder {
    entries: Vec<Vec<u8>>,
    utf8_cache: BTreeMap<String, u16>,
    class_cache: BTreeMap<String, u16>,
    nat_cache: BTreeMap<(String, String), u16>,
    member_cache: BTreeMap<(u8, String, String, String), u16>,
    access: u16,
    this_class: u16,
    super_class: u16,
    interfaces: Vec<u16>,
    methods: Vec<BuiltMethod>,
}

struct BuiltMethod {
    access: u16,
    name_index: u16,
    descriptor_index: u16,
    code: Option<MethodCode>,
}

struct MethodCode {
    name_index: u16,
    max_stack: u16,
    max_locals: u16,
    code: Vec<u8>,
    handlers: Vec<(u16, u16, u16, u16)>,
}

impl ClassBuilder {
    pub(crate) fn new(name: &str, super_name: Option<&str>) -> Self {
        let mut builder = Self {
            entries: Vec::new(),
            utf8_cache: BTreeMap::new(),
            class_cache: BTreeMap::new(),
            nat_cache: BTreeMap::new(),
            member_cache: BTreeMap::new(),
            access: 0x0021,
            this_class: 0,
            super_class: 0,
            interfaces: Vec::new(),
            methods: Vec::new(),
        };
        builder.this_class = builder.class_const(name);
        if let Some(super_name) = super_name {
            let index = builder.class_const(super_name);
            builder.super_class = index;
        }
        builder
    }

    pub(crate) fn add_interface(&mut self, name: &str) {
        let index = self.class_const(name);
        self.interfaces.push(index);
    }

    pub(crate) fn utf8(&mut self, text: &str) -> u16 {
        if let Some(&index) = self.utf8_cache.get(text) {
            return index;
        }
        let mut entry = vec![1u8];
        entry.extend_from_slice(&(text.len() as u16).to_be_bytes());
        entry.extend_from_slice(text.as_bytes());
        let index = self.push_entry(entry);
        self.utf8_cache.insert(text.to_string(), index);
        index
    }

    pub(crate) fn class_const(&mut self, name: &str) -> u16 {
        if let Some(&index) = self.class_cache.get(name) {
            return index;
        }
        let name_index = self.utf8(name);
        let mut entry = vec![7u8];
        entry.extend_from_slice(&name_index.to_be_bytes());
        let index = self.push_entry(entry);
        self.class_cache.insert(name.to_string(), index);
        index
    }

    fn name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
        let key = (name.to_string(), descriptor.to_string());
        if let Some(&index) = self.nat_cache.get(&key) {
            return index;
        }
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        let mut entry = vec![12u8];
        entry.extend_from_slice(&name_index.to_be_bytes());
        entry.extend_from_slice(&descriptor_index.to_be_bytes());
        let index = self.push_entry(entry);
        self.nat_cache.insert(key, index);
        index
    }

    pub(crate) fn method_ref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
        interface: bool,
    ) -> u16 {
        let tag = if interface { 11 } else { 10 };
        self.member(tag, owner, name, descriptor)
    }

    fn member(&mut self, tag: u8, owner: &str, name: &str, descriptor: &str) -> u16 {
        let key = (tag, owner.to_string(), name.to_string(), descriptor.to_string());
        if let Some(&index) = self.member_cache.get(&key) {
            return index;
        }
        let class_index = self.class_const(owner);
        let nat_index = self.name_and_type(name, descriptor);
        let mut entry = vec![tag];
        entry.extend_from_slice(&class_index.to_be_bytes());
        entry.extend_from_slice(&nat_index.to_be_bytes());
        let index = self.push_entry(entry);
        self.member_cache.insert(key, index);
        index
    }

    pub(crate) fn add_method(
        &mut self,
        access: u16,
        name: &str,
        descriptor: &str,
        code: Option<Vec<u8>>,
    ) {
        self.add_method_with_handlers(access, name, descriptor, code, Vec::new());
    }

    pub(crate) fn add_method_with_handlers(
        &mut self,
        access: u16,
        name: &str,
        descriptor: &str,
        code: Option<Vec<u8>>,
        handlers: Vec<(u16, u16, u16, u16)>,
    ) {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        let code = code.map(|code| MethodCode {
            name_index: self.utf8("Code"),
            max_stack: 8,
            max_locals: 8,
            code,
            handlers,
        });
        self.methods.push(BuiltMethod {
            access,
            name_index,
            descriptor_index,
            code,
        });
    }

    fn push_entry(&mut self, entry: Vec<u8>) -> u16 {
        self.entries.push(entry);
        self.entries.len() as u16
    }

    pub(crate) fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&0xCAFE_BABEu32.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&52u16.to_be_bytes());
        out.extend_from_slice(&(self.entries.len() as u16 + 1).to_be_bytes());
        for entry in &self.entries {
            out.extend_from_slice(entry);
        }
        out.extend_from_slice(&self.access.to_be_bytes());
        out.extend_from_slice(&self.this_class.to_be_bytes());
        out.extend_from_slice(&self.super_class.to_be_bytes());
        out.extend_from_slice(&(self.interfaces.len() as u16).to_be_bytes());
        for interface in &self.interfaces {
            out.extend_from_slice(&interface.to_be_bytes());
        }
        // No fields.
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&(self.methods.len() as u16).to_be_bytes());
        for method in &self.methods {
            out.extend_from_slice(&method.access.to_be_bytes());
            out.extend_from_slice(&method.name_index.to_be_bytes());
            out.extend_from_slice(&method.descriptor_index.to_be_bytes());
            match &method.code {
                None => out.extend_from_slice(&0u16.to_be_bytes()),
                Some(code) => {
                    out.extend_from_slice(&1u16.to_be_bytes());
                    out.extend_from_slice(&code.name_index.to_be_bytes());
                    let length = 2 + 2 + 4 + code.code.len() + 2 + code.handlers.len() * 8 + 2;
                    out.extend_from_slice(&(length as u32).to_be_bytes());
                    out.extend_from_slice(&code.max_stack.to_be_bytes());
                    out.extend_from_slice(&code.max_locals.to_be_bytes());
                    out.extend_from_slice(&(code.code.len() as u32).to_be_bytes());
                    out.extend_from_slice(&code.code);
                    out.extend_from_slice(&(code.handlers.len() as u16).to_be_bytes());
                    for (start, end, handler, catch_type) in &code.handlers {
                        out.extend_from_slice(&start.to_be_bytes());
                        out.extend_from_slice(&end.to_be_bytes());
                        out.extend_from_slice(&handler.to_be_bytes());
                        out.extend_from_slice(&catch_type.to_be_bytes());
                    }
                    out.extend_from_slice(&0u16.to_be_bytes());
                }
            }
        }
        // No class attributes.
        out.extend_from_slice(&0u16.to_be_bytes());
        out
    }
}
