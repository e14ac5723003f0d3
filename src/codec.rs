//! Bytecode decode and class re-encode.
//!
//! Decoding lifts a `Code` array into the instruction model with branch
//! targets resolved to instruction indices. Encoding re-lays out offsets
//! (switch padding to a fixpoint), rebuilds the `Code` attribute with debug
//! sub-attributes dropped, and splices the result into the original class
//! bytes, appending constant pool entries only for a widened supertype.

use std::collections::BTreeMap;

use anyhow::{Context, Result};

use crate::classfile::{ClassFile, ConstantPool, RawHandler};
use crate::descriptor;
use crate::ir::{CallKind, CallSite, ExceptionHandler, MethodBody, Op};
use crate::opcodes as op;

/// A transformed body handed back for encoding.
#[derive(Clone, Debug)]
pub(crate) struct EncodedBody {
    pub(crate) ops: Vec<Op>,
    pub(crate) handlers: Vec<ExceptionHandler>,
}

/// Decode one method of a parsed class into the instruction model.
///
/// Bodies the decoder cannot model (`jsr`/`ret`, malformed targets) come back
/// with `instructions: None` and are kept verbatim downstream.
pub(crate) fn decode_body(file: &ClassFile, method_index: usize) -> MethodBody {
    let info = &file.methods[method_index];
    let mut body = MethodBody {
        access: info.access,
        name: info.name.clone(),
        descriptor: info.descriptor.clone(),
        signature: info.signature.clone(),
        max_locals: 0,
        instructions: None,
        handlers: Vec::new(),
    };
    let Some(code) = &info.code else {
        return body;
    };
    body.max_locals = code.max_locals;

    let code_bytes = &file.bytes[code.code_span.clone()];
    if let Ok((ops, index_of)) = decode_code(code_bytes, &file.constant_pool)
        && let Ok(handlers) = convert_handlers(&code.exception_table, &index_of, ops.len(), code_bytes.len())
    {
        body.instructions = Some(ops);
        body.handlers = handlers;
    }
    body
}

fn convert_handlers(
    table: &[RawHandler],
    index_of: &BTreeMap<usize, usize>,
    op_count: usize,
    code_len: usize,
) -> Result<Vec<ExceptionHandler>> {
    let lookup = |pc: u16| -> Result<usize> {
        let pc = pc as usize;
        if pc == code_len {
            return Ok(op_count);
        }
        index_of
            .get(&pc)
            .copied()
            .with_context(|| format!("exception table pc {pc} is not an instruction boundary"))
    };
    table
        .iter()
        .map(|raw| {
            Ok(ExceptionHandler {
                start: lookup(raw.start_pc)?,
                end: lookup(raw.end_pc)?,
                handler: lookup(raw.handler_pc)?,
                catch_type: raw.catch_type,
            })
        })
        .collect()
}

/// Decode a raw code array. Returns the ops plus the offset → index map.
pub(crate) fn decode_code(
    code: &[u8],
    pool: &ConstantPool,
) -> Result<(Vec<Op>, BTreeMap<usize, usize>)> {
    let mut offsets = Vec::new();
    let mut offset = 0usize;
    while offset < code.len() {
        offsets.push(offset);
        let length = insn_length(code, offset)?;
        offset += length;
    }
    if offset != code.len() {
        anyhow::bail!("instruction runs past the end of the code array");
    }
    let index_of: BTreeMap<usize, usize> = offsets
        .iter()
        .enumerate()
        .map(|(index, &offset)| (offset, index))
        .collect();

    let target = |branch_offset: i64| -> Result<usize> {
        let at = usize::try_from(branch_offset).ok().and_then(|o| index_of.get(&o)).copied();
        at.with_context(|| format!("branch target {branch_offset} is not an instruction boundary"))
    };

    let mut ops = Vec::with_capacity(offsets.len());
    for &offset in &offsets {
        let opcode = code[offset];
        let decoded = match opcode {
            op::BIPUSH => Op::Push {
                opcode,
                value: read_u8(code, offset + 1)? as i8 as i16,
            },
            op::SIPUSH => Op::Push {
                opcode,
                value: read_i16(code, offset + 1)?,
            },
            op::LDC => Op::LoadConst {
                opcode,
                index: read_u8(code, offset + 1)? as u16,
            },
            op::LDC_W | op::LDC2_W => Op::LoadConst {
                opcode,
                index: read_u16(code, offset + 1)?,
            },
            op::ILOAD..=op::ALOAD | op::ISTORE..=op::ASTORE => Op::Local {
                opcode,
                var: read_u8(code, offset + 1)? as u16,
            },
            op::ILOAD_0..=op::ALOAD_3 => Op::Local {
                opcode: op::ILOAD + (opcode - op::ILOAD_0) / 4,
                var: ((opcode - op::ILOAD_0) % 4) as u16,
            },
            op::ISTORE_0..=op::ASTORE_3 => Op::Local {
                opcode: op::ISTORE + (opcode - op::ISTORE_0) / 4,
                var: ((opcode - op::ISTORE_0) % 4) as u16,
            },
            op::IINC => Op::Iinc {
                var: read_u8(code, offset + 1)? as u16,
                delta: read_u8(code, offset + 2)? as i8 as i16,
            },
            op::WIDE => {
                let wide_opcode = read_u8(code, offset + 1)?;
                match wide_opcode {
                    op::ILOAD..=op::ALOAD | op::ISTORE..=op::ASTORE => Op::Local {
                        opcode: wide_opcode,
                        var: read_u16(code, offset + 2)?,
                    },
                    op::IINC => Op::Iinc {
                        var: read_u16(code, offset + 2)?,
                        delta: read_i16(code, offset + 4)?,
                    },
                    other => anyhow::bail!("unsupported wide opcode {other:#04x}"),
                }
            }
            0x99..=op::GOTO | op::IFNULL | op::IFNONNULL => Op::Branch {
                opcode,
                target: target(offset as i64 + read_i16(code, offset + 1)? as i64)?,
            },
            op::GOTO_W => Op::Branch {
                opcode,
                target: target(offset as i64 + read_i32(code, offset + 1)? as i64)?,
            },
            op::JSR | op::RET | op::JSR_W => {
                anyhow::bail!("jsr/ret subroutines are not modeled")
            }
            op::TABLESWITCH => {
                let base = offset + 1 + padding(offset);
                let default = target(offset as i64 + read_i32(code, base)? as i64)?;
                let low = read_i32(code, base + 4)?;
                let high = read_i32(code, base + 8)?;
                let count = switch_count(low, high)?;
                let mut targets = Vec::with_capacity(count);
                for slot in 0..count {
                    let branch = read_i32(code, base + 12 + slot * 4)?;
                    targets.push(target(offset as i64 + branch as i64)?);
                }
                Op::TableSwitch { default, low, targets }
            }
            op::LOOKUPSWITCH => {
                let base = offset + 1 + padding(offset);
                let default = target(offset as i64 + read_i32(code, base)? as i64)?;
                let npairs = read_i32(code, base + 4)?;
                let mut pairs = Vec::with_capacity(npairs.max(0) as usize);
                for slot in 0..npairs.max(0) as usize {
                    let key = read_i32(code, base + 8 + slot * 8)?;
                    let branch = read_i32(code, base + 12 + slot * 8)?;
                    pairs.push((key, target(offset as i64 + branch as i64)?));
                }
                Op::LookupSwitch { default, pairs }
            }
            op::GETSTATIC..=op::PUTFIELD => {
                let index = read_u16(code, offset + 1)?;
                let member = pool.member(index)?;
                Op::Field {
                    opcode,
                    index,
                    owner: member.owner,
                    name: member.name,
                    descriptor: member.descriptor,
                }
            }
            op::INVOKEVIRTUAL..=op::INVOKEINTERFACE => {
                let index = read_u16(code, offset + 1)?;
                let member = pool.member(index)?;
                let kind = match opcode {
                    op::INVOKEVIRTUAL => CallKind::Virtual,
                    op::INVOKESPECIAL => CallKind::Special,
                    op::INVOKESTATIC => CallKind::Static,
                    _ => CallKind::Interface,
                };
                Op::Invoke(CallSite {
                    owner: member.owner,
                    name: member.name,
                    descriptor: member.descriptor,
                    kind,
                    index,
                })
            }
            op::INVOKEDYNAMIC => {
                let index = read_u16(code, offset + 1)?;
                Op::InvokeDynamic {
                    index,
                    descriptor: pool.invoke_dynamic_descriptor(index)?.to_string(),
                }
            }
            op::NEW | op::ANEWARRAY | op::CHECKCAST | op::INSTANCEOF => {
                let index = read_u16(code, offset + 1)?;
                Op::TypeRef {
                    opcode,
                    index,
                    class_name: pool.class_name(index)?.to_string(),
                }
            }
            op::NEWARRAY => Op::NewArray {
                atype: read_u8(code, offset + 1)?,
            },
            op::MULTIANEWARRAY => Op::MultiNewArray {
                index: read_u16(code, offset + 1)?,
                dims: read_u8(code, offset + 3)?,
            },
            _ => Op::Simple(opcode),
        };
        ops.push(decoded);
    }

    Ok((ops, index_of))
}

fn switch_count(low: i32, high: i32) -> Result<usize> {
    let count = high
        .checked_sub(low)
        .and_then(|v| v.checked_add(1))
        .filter(|v| *v >= 0)
        .context("invalid tableswitch range")?;
    Ok(count as usize)
}

fn insn_length(code: &[u8], offset: usize) -> Result<usize> {
    let opcode = *code.get(offset).context("offset out of code array")?;
    Ok(match opcode {
        0x00..=0x0f => 1,
        op::BIPUSH | op::LDC | op::NEWARRAY | op::RET => 2,
        op::SIPUSH | op::LDC_W | op::LDC2_W | op::IINC => 3,
        op::ILOAD..=op::ALOAD | op::ISTORE..=op::ASTORE => 2,
        0x1a..=0x35 | 0x3b..=0x83 | 0x85..=0x98 | op::IRETURN..=op::RETURN => 1,
        0x99..=op::JSR | op::IFNULL | op::IFNONNULL => 3,
        op::TABLESWITCH => {
            let base = offset + 1 + padding(offset);
            let low = read_i32(code, base + 4)?;
            let high = read_i32(code, base + 8)?;
            1 + padding(offset) + 12 + 4 * switch_count(low, high)?
        }
        op::LOOKUPSWITCH => {
            let base = offset + 1 + padding(offset);
            let npairs = read_i32(code, base + 4)?;
            1 + padding(offset) + 8 + 8 * npairs.max(0) as usize
        }
        op::GETSTATIC..=op::INVOKESTATIC | op::NEW | op::ANEWARRAY => 3,
        op::CHECKCAST | op::INSTANCEOF => 3,
        op::INVOKEINTERFACE | op::INVOKEDYNAMIC | op::GOTO_W | op::JSR_W => 5,
        op::ARRAYLENGTH | op::ATHROW | op::MONITORENTER | op::MONITOREXIT => 1,
        op::WIDE => {
            if read_u8(code, offset + 1)? == op::IINC {
                6
            } else {
                4
            }
        }
        op::MULTIANEWARRAY => 4,
        other => anyhow::bail!("unknown opcode {other:#04x}"),
    })
}

pub(crate) fn padding(offset: usize) -> usize {
    (4 - (offset + 1) % 4) % 4
}

pub(crate) fn read_u8(code: &[u8], offset: usize) -> Result<u8> {
    code.get(offset)
        .copied()
        .context("unexpected end of code array")
}

pub(crate) fn read_u16(code: &[u8], offset: usize) -> Result<u16> {
    let hi = read_u8(code, offset)? as u16;
    let lo = read_u8(code, offset + 1)? as u16;
    Ok(hi << 8 | lo)
}

pub(crate) fn read_i16(code: &[u8], offset: usize) -> Result<i16> {
    Ok(read_u16(code, offset)? as i16)
}

pub(crate) fn read_i32(code: &[u8], offset: usize) -> Result<i32> {
    let hi = read_u16(code, offset)? as u32;
    let lo = read_u16(code, offset + 2)? as u32;
    Ok((hi << 16 | lo) as i32)
}

/// Re-encode a transformed body into a raw code array plus exception table.
pub(crate) fn encode_code(body: &EncodedBody) -> Result<(Vec<u8>, Vec<RawHandler>)> {
    let ops = &body.ops;
    if ops.is_empty() {
        anyhow::bail!("cannot encode an empty code array");
    }

    // Offsets and switch padding are mutually dependent; iterate to a fixpoint.
    let mut offsets = vec![0usize; ops.len()];
    let mut stable = false;
    for _ in 0..8 {
        let mut changed = false;
        let mut offset = 0usize;
        for (index, insn) in ops.iter().enumerate() {
            if offsets[index] != offset {
                offsets[index] = offset;
                changed = true;
            }
            offset += encoded_length(insn, offset)?;
        }
        if !changed {
            stable = true;
            break;
        }
    }
    if !stable {
        anyhow::bail!("instruction layout failed to stabilize");
    }

    let end_offset = {
        let last = ops.len() - 1;
        offsets[last] + encoded_length(&ops[last], offsets[last])?
    };
    let offset_of = |index: usize| -> Result<usize> {
        if index == ops.len() {
            Ok(end_offset)
        } else {
            offsets.get(index).copied().context("instruction index out of range")
        }
    };

    let mut out = Vec::with_capacity(end_offset);
    for (index, insn) in ops.iter().enumerate() {
        let at = offsets[index];
        debug_assert_eq!(at, out.len());
        emit(insn, at, &offset_of, &mut out)?;
    }

    let mut table = Vec::with_capacity(body.handlers.len());
    for handler in &body.handlers {
        let entry = RawHandler {
            start_pc: narrow_pc(offset_of(handler.start)?)?,
            end_pc: narrow_pc(offset_of(handler.end)?)?,
            handler_pc: narrow_pc(offset_of(handler.handler)?)?,
            catch_type: handler.catch_type,
        };
        if entry.start_pc >= entry.end_pc {
            // The protected range collapsed to nothing; drop the handler.
            continue;
        }
        table.push(entry);
    }

    Ok((out, table))
}

fn narrow_pc(offset: usize) -> Result<u16> {
    u16::try_from(offset).context("code offset exceeds the exception table range")
}

fn encoded_length(insn: &Op, offset: usize) -> Result<usize> {
    Ok(match insn {
        Op::Simple(_) => 1,
        Op::Push { opcode, .. } => {
            if *opcode == op::BIPUSH {
                2
            } else {
                3
            }
        }
        Op::LoadConst { opcode, index } => {
            if *opcode == op::LDC2_W {
                3
            } else if *index <= 0xff {
                2
            } else {
                3
            }
        }
        Op::Local { opcode, var } => {
            if *var < 4 && matches!(*opcode, op::ILOAD..=op::ALOAD | op::ISTORE..=op::ASTORE) {
                1
            } else if *var <= 0xff {
                2
            } else {
                4
            }
        }
        Op::Iinc { var, delta } => {
            if *var <= 0xff && (-128..=127).contains(delta) {
                3
            } else {
                6
            }
        }
        Op::TypeRef { .. } | Op::Field { .. } => 3,
        Op::NewArray { .. } => 2,
        Op::MultiNewArray { .. } => 4,
        Op::Invoke(call) => {
            if call.kind == CallKind::Interface {
                5
            } else {
                3
            }
        }
        Op::InvokeDynamic { .. } => 5,
        Op::Branch { opcode, .. } => {
            if *opcode == op::GOTO_W {
                5
            } else {
                3
            }
        }
        Op::TableSwitch { targets, .. } => 1 + padding(offset) + 12 + 4 * targets.len(),
        Op::LookupSwitch { pairs, .. } => 1 + padding(offset) + 8 + 8 * pairs.len(),
    })
}

fn emit(
    insn: &Op,
    at: usize,
    offset_of: &dyn Fn(usize) -> Result<usize>,
    out: &mut Vec<u8>,
) -> Result<()> {
    let branch16 = |target: usize| -> Result<[u8; 2]> {
        let displacement = offset_of(target)? as i64 - at as i64;
        let narrow = i16::try_from(displacement)
            .context("branch displacement exceeds the 16-bit range")?;
        Ok(narrow.to_be_bytes())
    };
    let branch32 = |target: usize| -> Result<[u8; 4]> {
        let displacement = offset_of(target)? as i64 - at as i64;
        let wide = i32::try_from(displacement).context("branch displacement overflow")?;
        Ok(wide.to_be_bytes())
    };

    match insn {
        Op::Simple(opcode) => out.push(*opcode),
        Op::Push { opcode, value } => {
            out.push(*opcode);
            if *opcode == op::BIPUSH {
                out.push(*value as i8 as u8);
            } else {
                out.extend_from_slice(&value.to_be_bytes());
            }
        }
        Op::LoadConst { opcode, index } => {
            if *opcode == op::LDC2_W {
                out.push(op::LDC2_W);
                out.extend_from_slice(&index.to_be_bytes());
            } else if *index <= 0xff {
                out.push(op::LDC);
                out.push(*index as u8);
            } else {
                out.push(op::LDC_W);
                out.extend_from_slice(&index.to_be_bytes());
            }
        }
        Op::Local { opcode, var } => {
            let is_load = matches!(*opcode, op::ILOAD..=op::ALOAD);
            if *var < 4 && matches!(*opcode, op::ILOAD..=op::ALOAD | op::ISTORE..=op::ASTORE) {
                let base = if is_load { op::ILOAD_0 } else { op::ISTORE_0 };
                let kind = if is_load {
                    opcode - op::ILOAD
                } else {
                    opcode - op::ISTORE
                };
                out.push(base + kind * 4 + *var as u8);
            } else if *var <= 0xff {
                out.push(*opcode);
                out.push(*var as u8);
            } else {
                out.push(op::WIDE);
                out.push(*opcode);
                out.extend_from_slice(&var.to_be_bytes());
            }
        }
        Op::Iinc { var, delta } => {
            if *var <= 0xff && (-128..=127).contains(delta) {
                out.push(op::IINC);
                out.push(*var as u8);
                out.push(*delta as i8 as u8);
            } else {
                out.push(op::WIDE);
                out.push(op::IINC);
                out.extend_from_slice(&var.to_be_bytes());
                out.extend_from_slice(&delta.to_be_bytes());
            }
        }
        Op::TypeRef { opcode, index, .. } => {
            out.push(*opcode);
            out.extend_from_slice(&index.to_be_bytes());
        }
        Op::NewArray { atype } => {
            out.push(op::NEWARRAY);
            out.push(*atype);
        }
        Op::MultiNewArray { index, dims } => {
            out.push(op::MULTIANEWARRAY);
            out.extend_from_slice(&index.to_be_bytes());
            out.push(*dims);
        }
        Op::Field { opcode, index, .. } => {
            out.push(*opcode);
            out.extend_from_slice(&index.to_be_bytes());
        }
        Op::Invoke(call) => {
            out.push(call.kind.opcode());
            out.extend_from_slice(&call.index.to_be_bytes());
            if call.kind == CallKind::Interface {
                let sig = descriptor::parse_method_descriptor(&call.descriptor)?;
                let slots: usize = sig.params.iter().map(|p| p.size as usize).sum();
                out.push(1 + slots as u8);
                out.push(0);
            }
        }
        Op::InvokeDynamic { index, .. } => {
            out.push(op::INVOKEDYNAMIC);
            out.extend_from_slice(&index.to_be_bytes());
            out.extend_from_slice(&[0, 0]);
        }
        Op::Branch { opcode, target } => {
            if *opcode == op::GOTO_W {
                out.push(op::GOTO_W);
                out.extend_from_slice(&branch32(*target)?);
            } else {
                out.push(*opcode);
                out.extend_from_slice(&branch16(*target)?);
            }
        }
        Op::TableSwitch { default, low, targets } => {
            out.push(op::TABLESWITCH);
            out.extend_from_slice(&vec![0u8; padding(at)]);
            out.extend_from_slice(&branch32(*default)?);
            out.extend_from_slice(&low.to_be_bytes());
            let high = *low + targets.len() as i32 - 1;
            out.extend_from_slice(&high.to_be_bytes());
            for target in targets {
                out.extend_from_slice(&branch32(*target)?);
            }
        }
        Op::LookupSwitch { default, pairs } => {
            out.push(op::LOOKUPSWITCH);
            out.extend_from_slice(&vec![0u8; padding(at)]);
            out.extend_from_slice(&branch32(*default)?);
            out.extend_from_slice(&(pairs.len() as i32).to_be_bytes());
            for (key, target) in pairs {
                out.extend_from_slice(&key.to_be_bytes());
                out.extend_from_slice(&branch32(*target)?);
            }
        }
    }
    Ok(())
}

/// Re-encode a whole class: rebuilt bodies spliced over their original
/// `Code` attributes, plus an optional widened super class.
pub(crate) fn encode_class(
    file: &ClassFile,
    bodies: &[Option<EncodedBody>],
    new_super: Option<&str>,
) -> Result<Vec<u8>> {
    // (span start, span end, replacement) patches over the original bytes.
    let mut patches: Vec<(usize, usize, Vec<u8>)> = Vec::new();

    if let Some(super_name) = new_super {
        let index = match file.constant_pool.find_class(super_name) {
            Some(index) => index,
            None => {
                let old_count = file.constant_pool.count();
                if old_count > u16::MAX - 2 {
                    anyhow::bail!("constant pool exhausted while widening supertype");
                }
                let mut extra = vec![1u8];
                extra.extend_from_slice(&(super_name.len() as u16).to_be_bytes());
                extra.extend_from_slice(super_name.as_bytes());
                extra.push(7u8);
                extra.extend_from_slice(&old_count.to_be_bytes());
                patches.push((8, 10, (old_count + 2).to_be_bytes().to_vec()));
                patches.push((file.cp_end_offset, file.cp_end_offset, extra));
                old_count + 1
            }
        };
        patches.push((
            file.super_index_offset,
            file.super_index_offset + 2,
            index.to_be_bytes().to_vec(),
        ));
    }

    for (method_index, replacement) in bodies.iter().enumerate() {
        let Some(body) = replacement else { continue };
        let info = &file.methods[method_index];
        let code = info
            .code
            .as_ref()
            .with_context(|| format!("method {} has no Code attribute to rebuild", info.name))?;
        let (code_bytes, table) = encode_code(body)
            .with_context(|| format!("failed to encode body of {}{}", info.name, info.descriptor))?;

        let info_len = 2 + 2 + 4 + code_bytes.len() + 2 + table.len() * 8 + 2;
        let mut attr = Vec::with_capacity(6 + info_len);
        attr.extend_from_slice(&code.name_index.to_be_bytes());
        attr.extend_from_slice(&(info_len as u32).to_be_bytes());
        attr.extend_from_slice(&code.max_stack.to_be_bytes());
        attr.extend_from_slice(&code.max_locals.to_be_bytes());
        attr.extend_from_slice(&(code_bytes.len() as u32).to_be_bytes());
        attr.extend_from_slice(&code_bytes);
        attr.extend_from_slice(&(table.len() as u16).to_be_bytes());
        for entry in &table {
            attr.extend_from_slice(&entry.start_pc.to_be_bytes());
            attr.extend_from_slice(&entry.end_pc.to_be_bytes());
            attr.extend_from_slice(&entry.handler_pc.to_be_bytes());
            attr.extend_from_slice(&entry.catch_type.to_be_bytes());
        }
        patches.push((code.attr_span.start, code.attr_span.end, attr));
    }

    patches.sort_by_key(|(start, _, _)| *start);
    for window in patches.windows(2) {
        if window[0].1 > window[1].0 {
            anyhow::bail!("overlapping encode patches");
        }
    }

    let mut out = Vec::with_capacity(file.bytes.len());
    let mut cursor = 0usize;
    for (start, end, replacement) in &patches {
        out.extend_from_slice(&file.bytes[cursor..*start]);
        out.extend_from_slice(replacement);
        cursor = *end;
    }
    out.extend_from_slice(&file.bytes[cursor..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::{self, CpEntry};

    fn empty_pool() -> ConstantPool {
        ConstantPool::from_entries(vec![CpEntry::Unusable])
    }

    #[test]
    fn decodes_branches_to_instruction_indices() {
        // iconst_0; ifeq +4; iconst_1; ireturn
        let code = [0x03, 0x99, 0x00, 0x04, 0x04, 0xac];
        let (ops, index_of) = decode_code(&code, &empty_pool()).expect("decode");

        assert_eq!(ops.len(), 4);
        assert_eq!(ops[1], Op::Branch { opcode: 0x99, target: 3 });
        assert_eq!(index_of[&5], 3);
    }

    #[test]
    fn encode_relays_branch_offsets_after_deletion() {
        let body = EncodedBody {
            ops: vec![
                Op::Simple(0x03),
                Op::Branch { opcode: 0x99, target: 2 },
                Op::Simple(0xac),
            ],
            handlers: Vec::new(),
        };
        let (bytes, table) = encode_code(&body).expect("encode");
        assert_eq!(bytes, vec![0x03, 0x99, 0x00, 0x03, 0xac]);
        assert!(table.is_empty());
    }

    #[test]
    fn decode_rejects_jsr_subroutines() {
        let code = [0xa8, 0x00, 0x03, 0xb1];
        assert!(decode_code(&code, &empty_pool()).is_err());
    }

    #[test]
    fn folded_locals_round_trip_through_short_forms() {
        // iload_1; iload 200 (needs the two-byte form); ireturn
        let code = [0x1b, 0x15, 0xc8, 0xac];
        let (ops, _) = decode_code(&code, &empty_pool()).expect("decode");
        assert_eq!(ops[0], Op::Local { opcode: 0x15, var: 1 });
        assert_eq!(ops[1], Op::Local { opcode: 0x15, var: 200 });

        let body = EncodedBody { ops, handlers: Vec::new() };
        let (bytes, _) = encode_code(&body).expect("encode");
        assert_eq!(bytes, code);
    }

    #[test]
    fn tableswitch_padding_reaches_a_fixpoint() {
        // Offsets: 0 iconst_0, 1 tableswitch (pad 2, 19 bytes), 20 iconst_0,
        // 21 ireturn. Branches are relative to the switch opcode at 1.
        let mut code = vec![0x03, 0xaa, 0, 0];
        code.extend_from_slice(&20i32.to_be_bytes()); // default -> offset 21
        code.extend_from_slice(&0i32.to_be_bytes()); // low
        code.extend_from_slice(&0i32.to_be_bytes()); // high
        code.extend_from_slice(&19i32.to_be_bytes()); // case 0 -> offset 20
        code.push(0x03); // offset 20
        code.push(0xac); // offset 21
        let (ops, _) = decode_code(&code, &empty_pool()).expect("decode");
        let Op::TableSwitch { default, targets, .. } = &ops[1] else {
            panic!("expected tableswitch, got {:?}", ops[1]);
        };
        assert_eq!(*default, 3);
        assert_eq!(targets, &vec![2]);

        let body = EncodedBody { ops: ops.clone(), handlers: Vec::new() };
        let (bytes, _) = encode_code(&body).expect("encode");
        assert_eq!(bytes, code);
    }

    #[test]
    fn widened_supertype_appends_constants_when_missing() {
        let mut builder = crate::fixtures::ClassBuilder::new("com/example/App", Some("com/example/Base"));
        builder.add_method(0x0001, "run", "()V", Some(vec![crate::opcodes::RETURN]));
        let bytes = builder.build();
        let file = classfile::parse(&bytes).expect("parse");

        let encoded =
            encode_class(&file, &[None], Some("com/example/Root")).expect("encode with widening");
        let reparsed = classfile::parse(&encoded).expect("reparse");
        assert_eq!(reparsed.super_name.as_deref(), Some("com/example/Root"));
    }
}
