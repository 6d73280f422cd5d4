//! Protocol compiler.
//!
//! Turns a raw, externally-supplied protocol descriptor into an executable
//! [`ChunkPlan`]. Compilation is the trust boundary for configuration: every
//! decode method name is resolved against the registry, every `${name}`
//! reference is checked against the set of exported names, and any failure
//! aborts process startup. Nothing about wire data is checked here;
//! resolution of forward references stays lazy because the producing section
//! may execute later in the same frame.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{GatewayError, Result};
use crate::registry::DecodeRegistry;

use super::context::ContextSchema;
use super::descriptor::{
    CHUNK_CONDITIONAL, CHUNK_FIXED_LENGTH, ProtocolFile, RawChunk, RawIntExpr, RawSection,
};
use super::plan::{
    ChunkNode, ChunkPlan, ConditionalChunk, FixedLengthChunk, IntExpr, SectionDecode, SectionPlan,
    SectionTarget, Template,
};

/// Compile a protocol file from YAML text.
pub fn compile_str(input: &str, registry: &DecodeRegistry) -> Result<ChunkPlan> {
    let doc: serde_yaml_ng::Value = serde_yaml_ng::from_str(input)
        .map_err(|err| GatewayError::protocol("protocol parse", err.to_string()))?;
    compile_value(doc, registry)
}

/// Compile a protocol file from an already-parsed YAML document.
pub fn compile_value(doc: serde_yaml_ng::Value, registry: &DecodeRegistry) -> Result<ChunkPlan> {
    // Check discriminators on the untyped document first, so an unknown
    // chunk type surfaces as its own error rather than a serde mismatch.
    if let Some(chunks) = doc.get("chunks").and_then(|chunks| chunks.as_sequence()) {
        for chunk in chunks {
            validate_chunk_type(chunk)?;
        }
    }
    let file: ProtocolFile = serde_yaml_ng::from_value(doc)
        .map_err(|err| GatewayError::protocol("protocol structure", err.to_string()))?;
    compile(file, registry)
}

/// Compile a typed protocol descriptor.
pub fn compile(file: ProtocolFile, registry: &DecodeRegistry) -> Result<ChunkPlan> {
    let mut schema = ContextSchema::with_ambient();

    // Pass 1: collect every exported name in the whole tree. References are
    // checked afterwards so a section may legally reference a name exported
    // by a later chunk (resolution happens at execution time).
    for chunk in &file.chunks {
        declare_exports(chunk, &mut schema);
    }

    // Pass 2: build the executable tree, resolving decode methods eagerly.
    let mut chunks = Vec::with_capacity(file.chunks.len());
    for raw in &file.chunks {
        chunks.push(compile_chunk(raw, registry, &schema)?);
    }

    debug!(
        name = file.name.as_deref().unwrap_or("<unnamed>"),
        chunks = chunks.len(),
        exports = schema.len(),
        "protocol compiled"
    );
    Ok(ChunkPlan { chunks, schema })
}

fn validate_chunk_type(chunk: &serde_yaml_ng::Value) -> Result<()> {
    match chunk.get("type").and_then(|tag| tag.as_str()) {
        Some(CHUNK_FIXED_LENGTH) => Ok(()),
        Some(CHUNK_CONDITIONAL) => {
            if let Some(choices) = chunk.get("choices").and_then(|choices| choices.as_mapping()) {
                for child in choices.values() {
                    validate_chunk_type(child)?;
                }
            }
            Ok(())
        }
        Some(other) => Err(GatewayError::UnknownChunkType { name: other.to_string() }),
        None => Err(GatewayError::protocol("chunk entry", "missing 'type' discriminator")),
    }
}

fn declare_exports(chunk: &RawChunk, schema: &mut ContextSchema) {
    match chunk {
        RawChunk::FixedLength { sections, .. } => {
            for section in sections {
                if let Some(exports) = &section.exports {
                    for name in &exports.var_name {
                        schema.declare(name);
                    }
                }
            }
        }
        RawChunk::Conditional { choices, .. } => {
            for child in choices.values() {
                declare_exports(child, schema);
            }
        }
    }
}

fn compile_chunk(
    raw: &RawChunk,
    registry: &DecodeRegistry,
    schema: &ContextSchema,
) -> Result<ChunkNode> {
    match raw {
        RawChunk::FixedLength { length, sections } => {
            let length = compile_int_expr(length, "chunk length", schema)?;
            let sections = sections
                .iter()
                .map(|section| compile_section(section, registry, schema))
                .collect::<Result<Vec<_>>>()?;
            Ok(ChunkNode::FixedLength(FixedLengthChunk { length, sections }))
        }
        RawChunk::Conditional { condition_field, choices } => {
            // The condition field is read from the context like any other
            // reference, so it must be producible somewhere in the plan.
            if !schema.is_declared(condition_field) {
                return Err(GatewayError::UnresolvedExport { name: condition_field.clone() });
            }
            let mut compiled = HashMap::with_capacity(choices.len());
            for (key, child) in choices {
                compiled.insert(key.0.clone(), compile_chunk(child, registry, schema)?);
            }
            Ok(ChunkNode::Conditional(ConditionalChunk {
                condition_field: condition_field.clone(),
                choices: compiled,
            }))
        }
    }
}

fn compile_section(
    raw: &RawSection,
    registry: &DecodeRegistry,
    schema: &ContextSchema,
) -> Result<SectionPlan> {
    let desc = if raw.desc.is_empty() { "<unnamed section>".to_string() } else { raw.desc.clone() };

    let repeat = match &raw.from.repeat {
        Some(expr) => compile_int_expr(expr, "section repeat", schema)?,
        None => IntExpr::Literal(1),
    };

    let decode = raw
        .decoding
        .as_ref()
        .map(|decoding| {
            let func = registry.get(&decoding.method).cloned().ok_or_else(|| {
                GatewayError::UnknownDecodeMethod {
                    method: decoding.method.clone(),
                    section: desc.clone(),
                }
            })?;
            Ok(SectionDecode { method: decoding.method.clone(), func })
        })
        .transpose()?;

    let exports = raw
        .exports
        .as_ref()
        .map(|exports| exports.var_name.clone())
        .unwrap_or_default();

    let target = raw
        .to
        .as_ref()
        .map(|to| {
            let device = Template::parse(&to.device);
            for name in device.var_names() {
                if !schema.is_declared(name) {
                    return Err(GatewayError::UnresolvedExport { name: name.to_string() });
                }
            }
            Ok(SectionTarget { device, kind: to.kind.clone(), fields: to.fields.clone() })
        })
        .transpose()?;

    Ok(SectionPlan { byte_length: raw.from.byte, repeat, decode, exports, target, desc })
}

fn compile_int_expr(raw: &RawIntExpr, what: &str, schema: &ContextSchema) -> Result<IntExpr> {
    match raw {
        RawIntExpr::Literal(n) => Ok(IntExpr::Literal(*n as usize)),
        RawIntExpr::Reference(text) => {
            let name = parse_reference(text).ok_or_else(|| {
                GatewayError::protocol(
                    what,
                    format!("expected an integer or '${{name}}' reference, got '{text}'"),
                )
            })?;
            if !schema.is_declared(name) {
                return Err(GatewayError::UnresolvedExport { name: name.to_string() });
            }
            Ok(IntExpr::Var(name.to_string()))
        }
    }
}

fn parse_reference(text: &str) -> Option<&str> {
    text.strip_prefix("${")?.strip_suffix('}').filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> DecodeRegistry {
        DecodeRegistry::with_builtins()
    }

    #[test]
    fn unknown_chunk_type_fails_startup() {
        let yaml = r#"
chunks:
  - type: MysteryChunk
    length: 4
"#;
        let err = compile_str(yaml, &registry()).unwrap_err();
        assert!(
            matches!(&err, GatewayError::UnknownChunkType { name } if name == "MysteryChunk"),
            "{err}"
        );
        assert!(err.is_startup_fatal());
    }

    #[test]
    fn unknown_chunk_type_inside_choices_fails_startup() {
        let yaml = r#"
chunks:
  - type: ConditionalChunk
    conditionField: msg_type
    choices:
      1:
        type: BogusChunk
        length: 1
"#;
        let err = compile_str(yaml, &registry()).unwrap_err();
        assert!(matches!(err, GatewayError::UnknownChunkType { .. }), "{err}");
    }

    #[test]
    fn missing_type_discriminator_fails_startup() {
        let yaml = r#"
chunks:
  - length: 4
"#;
        let err = compile_str(yaml, &registry()).unwrap_err();
        assert!(matches!(err, GatewayError::Protocol { .. }), "{err}");
    }

    #[test]
    fn unknown_decode_method_fails_startup() {
        let yaml = r#"
chunks:
  - type: FixedLengthChunk
    length: 2
    sections:
      - from: { byte: 2 }
        decoding: { method: quantum_entangle }
        desc: speed register
"#;
        let err = compile_str(yaml, &registry()).unwrap_err();
        match err {
            GatewayError::UnknownDecodeMethod { method, section } => {
                assert_eq!(method, "quantum_entangle");
                assert_eq!(section, "speed register");
            }
            other => panic!("expected UnknownDecodeMethod, got {other}"),
        }
    }

    #[test]
    fn reference_without_exporter_fails_startup() {
        let yaml = r#"
chunks:
  - type: FixedLengthChunk
    length: "${frame_len}"
"#;
        let err = compile_str(yaml, &registry()).unwrap_err();
        assert!(
            matches!(&err, GatewayError::UnresolvedExport { name } if name == "frame_len"),
            "{err}"
        );
    }

    #[test]
    fn forward_reference_to_later_chunk_compiles() {
        // The exporter lives in a *later* chunk: legal, resolution is lazy.
        let yaml = r#"
chunks:
  - type: FixedLengthChunk
    length: "${frame_len}"
  - type: FixedLengthChunk
    length: 1
    sections:
      - from: { byte: 1 }
        decoding: { method: u8 }
        for: { varName: [frame_len] }
        desc: length prefix
"#;
        assert!(compile_str(yaml, &registry()).is_ok());
    }

    #[test]
    fn device_template_references_are_validated() {
        let yaml = r#"
chunks:
  - type: FixedLengthChunk
    length: 1
    sections:
      - from: { byte: 1 }
        decoding: { method: u8 }
        to: { device: "vobc_${ghost}", type: train, fields: [v] }
        desc: bad template
"#;
        let err = compile_str(yaml, &registry()).unwrap_err();
        assert!(matches!(&err, GatewayError::UnresolvedExport { name } if name == "ghost"), "{err}");
    }

    #[test]
    fn ambient_device_id_is_always_referencable() {
        let yaml = r#"
chunks:
  - type: FixedLengthChunk
    length: 1
    sections:
      - from: { byte: 1 }
        decoding: { method: u8 }
        to: { device: "vobc_${device_id}", type: train, fields: [v] }
        desc: seeded template
"#;
        assert!(compile_str(yaml, &registry()).is_ok());
    }

    #[test]
    fn condition_field_must_be_exported_somewhere() {
        let yaml = r#"
chunks:
  - type: ConditionalChunk
    conditionField: never_produced
    choices:
      1:
        type: FixedLengthChunk
        length: 1
"#;
        let err = compile_str(yaml, &registry()).unwrap_err();
        assert!(
            matches!(&err, GatewayError::UnresolvedExport { name } if name == "never_produced"),
            "{err}"
        );
    }

    #[test]
    fn repeat_defaults_to_one() {
        let yaml = r#"
chunks:
  - type: FixedLengthChunk
    length: 2
    sections:
      - from: { byte: 2 }
        decoding: { method: u16_be }
        desc: single register
"#;
        let plan = compile_str(yaml, &registry()).expect("compiles");
        let ChunkNode::FixedLength(chunk) = &plan.chunks[0] else { panic!("fixed expected") };
        assert_eq!(chunk.sections[0].repeat, IntExpr::Literal(1));
    }

    #[test]
    fn malformed_reference_string_is_a_protocol_error() {
        let yaml = r#"
chunks:
  - type: FixedLengthChunk
    length: "twelve"
"#;
        let err = compile_str(yaml, &registry()).unwrap_err();
        assert!(matches!(err, GatewayError::Protocol { .. }), "{err}");
    }

    #[test]
    fn invalid_yaml_is_a_protocol_error() {
        let err = compile_str(": not yaml: [", &registry()).unwrap_err();
        assert!(matches!(err, GatewayError::Protocol { .. }), "{err}");
        assert!(err.is_startup_fatal());
    }
}
