use anyhow::{Context, Result};

/// One parameter of a method descriptor: its stack width in slots and, for
/// plain object types, the internal class name used by subtyping analysis.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ParamType {
    pub(crate) size: u8,
    pub(crate) class_name: Option<String>,
}

/// Return category of a method descriptor, reduced to the stub default it
/// maps to on the operand stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReturnCategory {
    Void,
    Int,
    Long,
    Float,
    Double,
    Ref,
}

/// Parsed method descriptor shape.
#[derive(Clone, Debug)]
pub(crate) struct MethodSig {
    pub(crate) params: Vec<ParamType>,
    pub(crate) ret: ReturnCategory,
}

pub(crate) fn parse_method_descriptor(descriptor: &str) -> Result<MethodSig> {
    let rest = descriptor
        .strip_prefix('(')
        .with_context(|| format!("malformed method descriptor: {descriptor}"))?;
    let mut chars = rest.char_indices();
    let mut params = Vec::new();
    let close = loop {
        let (at, c) = chars
            .next()
            .with_context(|| format!("unterminated method descriptor: {descriptor}"))?;
        if c == ')' {
            break at;
        }
        let param = parse_field_type(&rest[at..])
            .with_context(|| format!("malformed parameter in descriptor: {descriptor}"))?;
        // Skip the characters the field type consumed beyond the first.
        for _ in 1..param.consumed {
            chars.next();
        }
        params.push(ParamType {
            size: param.size,
            class_name: param.class_name,
        });
    };
    let ret = parse_return_type(&rest[close + 1..])
        .with_context(|| format!("malformed return type in descriptor: {descriptor}"))?;
    Ok(MethodSig { params, ret })
}

/// Stack width in slots of a field descriptor ("J" and "D" take two).
pub(crate) fn field_size(descriptor: &str) -> u8 {
    match descriptor.as_bytes().first() {
        Some(b'J') | Some(b'D') => 2,
        _ => 1,
    }
}

struct ParsedField {
    size: u8,
    class_name: Option<String>,
    consumed: usize,
}

fn parse_field_type(text: &str) -> Result<ParsedField> {
    let bytes = text.as_bytes();
    match bytes.first() {
        Some(b'B' | b'C' | b'F' | b'I' | b'S' | b'Z') => Ok(ParsedField {
            size: 1,
            class_name: None,
            consumed: 1,
        }),
        Some(b'J' | b'D') => Ok(ParsedField {
            size: 2,
            class_name: None,
            consumed: 1,
        }),
        Some(b'L') => {
            let end = text
                .find(';')
                .context("object type missing terminating ';'")?;
            Ok(ParsedField {
                size: 1,
                class_name: Some(text[1..end].to_string()),
                consumed: end + 1,
            })
        }
        Some(b'[') => {
            let mut dims = 0;
            while bytes.get(dims) == Some(&b'[') {
                dims += 1;
            }
            let element = parse_field_type(&text[dims..])?;
            // Arrays are reference values regardless of the element type, and
            // are never candidates for parameter subtyping.
            Ok(ParsedField {
                size: 1,
                class_name: None,
                consumed: dims + element.consumed,
            })
        }
        _ => anyhow::bail!("unrecognized field type: {text}"),
    }
}

fn parse_return_type(text: &str) -> Result<ReturnCategory> {
    match text.as_bytes().first() {
        Some(b'V') => Ok(ReturnCategory::Void),
        Some(b'B' | b'C' | b'I' | b'S' | b'Z') => Ok(ReturnCategory::Int),
        Some(b'J') => Ok(ReturnCategory::Long),
        Some(b'F') => Ok(ReturnCategory::Float),
        Some(b'D') => Ok(ReturnCategory::Double),
        Some(b'L' | b'[') => Ok(ReturnCategory::Ref),
        _ => anyhow::bail!("unrecognized return type: {text}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_parameters() {
        let sig = parse_method_descriptor("(IDLjava/lang/Thread;[I)V").expect("parse");
        assert_eq!(sig.params.len(), 4);
        assert_eq!(sig.params[0].size, 1);
        assert_eq!(sig.params[1].size, 2);
        assert_eq!(
            sig.params[2].class_name.as_deref(),
            Some("java/lang/Thread")
        );
        assert_eq!(sig.params[3].class_name, None);
        assert_eq!(sig.ret, ReturnCategory::Void);
    }

    #[test]
    fn return_categories_cover_primitives_and_refs() {
        assert_eq!(
            parse_method_descriptor("()J").expect("parse").ret,
            ReturnCategory::Long
        );
        assert_eq!(
            parse_method_descriptor("()[B").expect("parse").ret,
            ReturnCategory::Ref
        );
        assert_eq!(
            parse_method_descriptor("()Z").expect("parse").ret,
            ReturnCategory::Int
        );
    }

    #[test]
    fn rejects_malformed_descriptors() {
        assert!(parse_method_descriptor("I)V").is_err());
        assert!(parse_method_descriptor("(Ljava/lang/Thread)V").is_err());
        assert!(parse_method_descriptor("(I").is_err());
    }

    #[test]
    fn field_sizes_track_two_slot_types() {
        assert_eq!(field_size("J"), 2);
        assert_eq!(field_size("D"), 2);
        assert_eq!(field_size("Ljava/lang/Object;"), 1);
        assert_eq!(field_size("[D"), 1);
    }
}
