//! Structural parser for class files.
//!
//! Parses the constant pool, member tables, and `Code` attributes, recording
//! the byte spans the encoder later splices over. Every class is additionally
//! validated with `jclassfile` before this parser runs (see the pool), so
//! failures here indicate a genuinely unsupported construct rather than a
//! corrupt input.

use std::ops::Range;

use anyhow::{Context, Result};

/// One constant pool entry; payloads we never consult are collapsed.
#[derive(Clone, Debug)]
pub(crate) enum CpEntry {
    Utf8(String),
    Class(u16),
    NameAndType { name: u16, descriptor: u16 },
    FieldRef { class: u16, name_and_type: u16 },
    MethodRef { class: u16, name_and_type: u16 },
    InvokeDynamic { name_and_type: u16 },
    Wide,
    Other,
    /// Phantom slot following a long/double entry.
    Unusable,
}

/// 1-indexed constant pool with typed accessors.
#[derive(Clone, Debug, Default)]
pub(crate) struct ConstantPool {
    entries: Vec<CpEntry>,
}

/// Owner/name/descriptor triple behind a field or method reference.
#[derive(Clone, Debug)]
pub(crate) struct MemberRef {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
}

impl ConstantPool {
    pub(crate) fn from_entries(entries: Vec<CpEntry>) -> Self {
        Self { entries }
    }

    /// Number of slots including the reserved zero slot.
    pub(crate) fn count(&self) -> u16 {
        self.entries.len() as u16
    }

    fn entry(&self, index: u16) -> Result<&CpEntry> {
        self.entries
            .get(index as usize)
            .filter(|entry| !matches!(entry, CpEntry::Unusable))
            .with_context(|| format!("invalid constant pool index {index}"))
    }

    pub(crate) fn utf8(&self, index: u16) -> Result<&str> {
        match self.entry(index)? {
            CpEntry::Utf8(text) => Ok(text),
            other => anyhow::bail!("constant {index} is not Utf8: {other:?}"),
        }
    }

    pub(crate) fn class_name(&self, index: u16) -> Result<&str> {
        match self.entry(index)? {
            CpEntry::Class(name) => self.utf8(*name),
            other => anyhow::bail!("constant {index} is not a class: {other:?}"),
        }
    }

    pub(crate) fn name_and_type(&self, index: u16) -> Result<(&str, &str)> {
        match self.entry(index)? {
            CpEntry::NameAndType { name, descriptor } => {
                Ok((self.utf8(*name)?, self.utf8(*descriptor)?))
            }
            other => anyhow::bail!("constant {index} is not NameAndType: {other:?}"),
        }
    }

    pub(crate) fn member(&self, index: u16) -> Result<MemberRef> {
        let (class, name_and_type) = match self.entry(index)? {
            CpEntry::FieldRef { class, name_and_type }
            | CpEntry::MethodRef { class, name_and_type } => (*class, *name_and_type),
            other => anyhow::bail!("constant {index} is not a member ref: {other:?}"),
        };
        let (name, descriptor) = self.name_and_type(name_and_type)?;
        Ok(MemberRef {
            owner: self.class_name(class)?.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        })
    }

    pub(crate) fn invoke_dynamic_descriptor(&self, index: u16) -> Result<&str> {
        match self.entry(index)? {
            CpEntry::InvokeDynamic { name_and_type } => {
                Ok(self.name_and_type(*name_and_type)?.1)
            }
            other => anyhow::bail!("constant {index} is not InvokeDynamic: {other:?}"),
        }
    }

    /// Index of an existing Class entry naming `class_name`, if any.
    pub(crate) fn find_class(&self, class_name: &str) -> Option<u16> {
        self.entries.iter().enumerate().find_map(|(i, entry)| {
            if let CpEntry::Class(name) = entry
                && self.utf8(*name).is_ok_and(|text| text == class_name)
            {
                Some(i as u16)
            } else {
                None
            }
        })
    }
}

/// Raw exception table entry in byte-offset form.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RawHandler {
    pub(crate) start_pc: u16,
    pub(crate) end_pc: u16,
    pub(crate) handler_pc: u16,
    pub(crate) catch_type: u16,
}

/// Parsed `Code` attribute with the spans needed to splice a rebuilt one.
#[derive(Clone, Debug)]
pub(crate) struct CodeAttr {
    /// Entire attribute, `attribute_name_index` through the last sub-attribute.
    pub(crate) attr_span: Range<usize>,
    pub(crate) name_index: u16,
    pub(crate) max_stack: u16,
    pub(crate) max_locals: u16,
    pub(crate) code_span: Range<usize>,
    pub(crate) exception_table: Vec<RawHandler>,
}

#[derive(Clone, Debug)]
pub(crate) struct MethodInfo {
    pub(crate) access: u16,
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) signature: Option<String>,
    pub(crate) code: Option<CodeAttr>,
}

#[derive(Clone, Debug)]
pub(crate) struct FieldInfo {
    pub(crate) name: String,
    pub(crate) descriptor: String,
}

/// One parsed class file, original bytes retained for re-encoding.
#[derive(Clone, Debug)]
pub(crate) struct ClassFile {
    pub(crate) bytes: Vec<u8>,
    pub(crate) constant_pool: ConstantPool,
    pub(crate) access: u16,
    pub(crate) name: String,
    pub(crate) super_name: Option<String>,
    pub(crate) interfaces: Vec<String>,
    pub(crate) signature: Option<String>,
    pub(crate) fields: Vec<FieldInfo>,
    pub(crate) methods: Vec<MethodInfo>,
    /// Byte offset of the `super_class` index, patched on supertype widening.
    pub(crate) super_index_offset: usize,
    /// Offset just past the last constant pool entry, where appends land.
    pub(crate) cp_end_offset: usize,
}

pub(crate) fn parse(bytes: &[u8]) -> Result<ClassFile> {
    let mut reader = Reader::new(bytes);
    let magic = reader.u32().context("missing class file magic")?;
    if magic != 0xCAFE_BABE {
        anyhow::bail!("not a class file: bad magic {magic:#010x}");
    }
    reader.skip(4).context("missing class file version")?;

    let cp_count = reader.u16().context("missing constant pool count")?;
    let mut entries = vec![CpEntry::Unusable];
    while entries.len() < cp_count as usize {
        let tag = reader.u8().context("truncated constant pool")?;
        let entry = reader
            .cp_entry(tag)
            .with_context(|| format!("constant {} (tag {tag})", entries.len()))?;
        let two_slots = matches!(entry, CpEntry::Wide);
        entries.push(entry);
        if two_slots {
            entries.push(CpEntry::Unusable);
        }
    }
    let cp_end_offset = reader.position;
    let constant_pool = ConstantPool::from_entries(entries);

    let access = reader.u16().context("missing access flags")?;
    let this_class = reader.u16().context("missing this_class")?;
    let super_index_offset = reader.position;
    let super_class = reader.u16().context("missing super_class")?;
    let name = constant_pool.class_name(this_class)?.to_string();
    let super_name = if super_class == 0 {
        None
    } else {
        Some(constant_pool.class_name(super_class)?.to_string())
    };

    let interface_count = reader.u16().context("missing interfaces count")?;
    let mut interfaces = Vec::with_capacity(interface_count as usize);
    for _ in 0..interface_count {
        let index = reader.u16().context("truncated interface table")?;
        interfaces.push(constant_pool.class_name(index)?.to_string());
    }

    let field_count = reader.u16().context("missing fields count")?;
    let mut fields = Vec::with_capacity(field_count as usize);
    for _ in 0..field_count {
        reader.u16().context("truncated field_info")?;
        let name_index = reader.u16().context("truncated field_info")?;
        let descriptor_index = reader.u16().context("truncated field_info")?;
        reader.skip_attributes()?;
        fields.push(FieldInfo {
            name: constant_pool.utf8(name_index)?.to_string(),
            descriptor: constant_pool.utf8(descriptor_index)?.to_string(),
        });
    }

    let method_count = reader.u16().context("missing methods count")?;
    let mut methods = Vec::with_capacity(method_count as usize);
    for _ in 0..method_count {
        let method = reader.method_info(&constant_pool)?;
        methods.push(method);
    }

    let signature = reader.class_signature(&constant_pool)?;

    Ok(ClassFile {
        bytes: bytes.to_vec(),
        constant_pool,
        access,
        name,
        super_name,
        interfaces,
        signature,
        fields,
        methods,
        super_index_offset,
        cp_end_offset,
    })
}

struct Reader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    fn u8(&mut self) -> Result<u8> {
        let value = *self
            .bytes
            .get(self.position)
            .context("unexpected end of class file")?;
        self.position += 1;
        Ok(value)
    }

    fn u16(&mut self) -> Result<u16> {
        let hi = self.u8()? as u16;
        let lo = self.u8()? as u16;
        Ok(hi << 8 | lo)
    }

    fn u32(&mut self) -> Result<u32> {
        let hi = self.u16()? as u32;
        let lo = self.u16()? as u32;
        Ok(hi << 16 | lo)
    }

    fn skip(&mut self, count: usize) -> Result<()> {
        let end = self
            .position
            .checked_add(count)
            .filter(|end| *end <= self.bytes.len())
            .context("unexpected end of class file")?;
        self.position = end;
        Ok(())
    }

    fn bytes_at(&mut self, count: usize) -> Result<&'a [u8]> {
        let start = self.position;
        self.skip(count)?;
        Ok(&self.bytes[start..start + count])
    }

    fn cp_entry(&mut self, tag: u8) -> Result<CpEntry> {
        Ok(match tag {
            1 => {
                let length = self.u16()? as usize;
                let text = self.bytes_at(length)?;
                CpEntry::Utf8(String::from_utf8_lossy(text).into_owned())
            }
            3 | 4 => {
                self.skip(4)?;
                CpEntry::Other
            }
            5 | 6 => {
                self.skip(8)?;
                CpEntry::Wide
            }
            7 => CpEntry::Class(self.u16()?),
            8 | 16 | 19 | 20 => {
                self.skip(2)?;
                CpEntry::Other
            }
            9 => CpEntry::FieldRef {
                class: self.u16()?,
                name_and_type: self.u16()?,
            },
            10 | 11 => CpEntry::MethodRef {
                class: self.u16()?,
                name_and_type: self.u16()?,
            },
            12 => CpEntry::NameAndType {
                name: self.u16()?,
                descriptor: self.u16()?,
            },
            15 => {
                self.skip(3)?;
                CpEntry::Other
            }
            17 => {
                self.skip(4)?;
                CpEntry::Other
            }
            18 => {
                self.skip(2)?;
                CpEntry::InvokeDynamic {
                    name_and_type: self.u16()?,
                }
            }
            _ => anyhow::bail!("unknown constant pool tag {tag}"),
        })
    }

    fn skip_attributes(&mut self) -> Result<()> {
        let count = self.u16().context("truncated attribute table")?;
        for _ in 0..count {
            self.u16()?;
            let length = self.u32()? as usize;
            self.skip(length)?;
        }
        Ok(())
    }

    fn method_info(&mut self, pool: &ConstantPool) -> Result<MethodInfo> {
        let access = self.u16().context("truncated method_info")?;
        let name_index = self.u16().context("truncated method_info")?;
        let descriptor_index = self.u16().context("truncated method_info")?;
        let name = pool.utf8(name_index)?.to_string();
        let descriptor = pool.utf8(descriptor_index)?.to_string();

        let mut signature = None;
        let mut code = None;
        let attr_count = self.u16().context("truncated method attributes")?;
        for _ in 0..attr_count {
            let attr_start = self.position;
            let name_index = self.u16()?;
            let length = self.u32()? as usize;
            let attr_end = self.position + length;
            match pool.utf8(name_index)? {
                "Code" => {
                    code = Some(self.code_attr(attr_start, attr_end, name_index)?);
                }
                "Signature" => {
                    let index = self.u16()?;
                    signature = Some(pool.utf8(index)?.to_string());
                    self.position = attr_end;
                }
                _ => self.skip(length)?,
            }
        }

        Ok(MethodInfo {
            access,
            name,
            descriptor,
            signature,
            code,
        })
    }

    fn code_attr(&mut self, attr_start: usize, attr_end: usize, name_index: u16) -> Result<CodeAttr> {
        let max_stack = self.u16().context("truncated Code attribute")?;
        let max_locals = self.u16().context("truncated Code attribute")?;
        let code_length = self.u32().context("truncated Code attribute")? as usize;
        let code_start = self.position;
        self.skip(code_length).context("truncated Code array")?;
        let code_span = code_start..self.position;

        let handler_count = self.u16().context("truncated exception table")?;
        let mut exception_table = Vec::with_capacity(handler_count as usize);
        for _ in 0..handler_count {
            exception_table.push(RawHandler {
                start_pc: self.u16()?,
                end_pc: self.u16()?,
                handler_pc: self.u16()?,
                catch_type: self.u16()?,
            });
        }

        // Sub-attributes (StackMapTable, LineNumberTable, ...) are dropped on
        // re-encode; skip to the recorded end.
        if attr_end < self.position || attr_end > self.bytes.len() {
            anyhow::bail!("Code attribute length is inconsistent");
        }
        self.position = attr_end;

        Ok(CodeAttr {
            attr_span: attr_start..attr_end,
            name_index,
            max_stack,
            max_locals,
            code_span,
            exception_table,
        })
    }

    fn class_signature(&mut self, pool: &ConstantPool) -> Result<Option<String>> {
        let count = self.u16().context("truncated class attributes")?;
        let mut signature = None;
        for _ in 0..count {
            let name_index = self.u16()?;
            let length = self.u32()? as usize;
            if pool.utf8(name_index)? == "Signature" && length == 2 {
                let index = self.u16()?;
                signature = Some(pool.utf8(index)?.to_string());
            } else {
                self.skip(length)?;
            }
        }
        Ok(signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::ClassBuilder;

    #[test]
    fn parses_synthetic_class_metadata() {
        let mut builder = ClassBuilder::new("com/example/App", Some("com/example/Base"));
        builder.add_interface("java/lang/Runnable");
        builder.add_method(0x0001, "run", "()V", Some(vec![crate::opcodes::RETURN]));
        let bytes = builder.build();

        let parsed = parse(&bytes).expect("parse synthetic class");

        assert_eq!(parsed.name, "com/example/App");
        assert_eq!(parsed.super_name.as_deref(), Some("com/example/Base"));
        assert_eq!(parsed.interfaces, vec!["java/lang/Runnable".to_string()]);
        assert_eq!(parsed.methods.len(), 1);
        let method = &parsed.methods[0];
        assert_eq!(method.name, "run");
        assert_eq!(method.descriptor, "()V");
        let code = method.code.as_ref().expect("code attribute");
        assert_eq!(
            &bytes[code.code_span.clone()],
            &[crate::opcodes::RETURN]
        );
    }

    #[test]
    fn rejects_non_class_bytes() {
        assert!(parse(b"nope").is_err());
    }

    #[test]
    fn member_refs_resolve_through_name_and_type() {
        let mut builder = ClassBuilder::new("com/example/App", Some("java/lang/Object"));
        let method_ref = builder.method_ref("com/example/Util", "helper", "(I)I", false);
        let code = vec![
            crate::opcodes::ICONST_0,
            crate::opcodes::INVOKESTATIC,
            (method_ref >> 8) as u8,
            method_ref as u8,
            crate::opcodes::IRETURN,
        ];
        builder.add_method(0x0009, "call", "()I", Some(code));
        let bytes = builder.build();

        let parsed = parse(&bytes).expect("parse synthetic class");
        let member = parsed
            .constant_pool
            .member(method_ref)
            .expect("resolve member ref");
        assert_eq!(member.owner, "com/example/Util");
        assert_eq!(member.name, "helper");
        assert_eq!(member.descriptor, "(I)I");
    }
}
