//! Raw protocol descriptor model.
//!
//! These types mirror the operator-facing protocol file one-to-one and are
//! deserialized straight from YAML. They stay deliberately dumb: no
//! resolution, no validation beyond shape. The compiler turns them into an
//! executable [`ChunkPlan`](super::ChunkPlan).
//!
//! File schema, per chunk entry:
//!
//! ```yaml
//! type: FixedLengthChunk          # or ConditionalChunk
//! length: 16                      # or "${name}"
//! sections:
//!   - from: { byte: 2, repeat: 1 }          # repeat may be "${name}"
//!     decoding: { method: u16_be }          # optional
//!     for: { varName: [speed_raw] }         # exports to the frame context
//!     to: { device: "vobc_${device_id}", type: train, fields: [speed] }
//!     desc: cab speed register
//! ```

use serde::Deserialize;
use serde::de::{self, Deserializer, Visitor};
use std::collections::HashMap;
use std::fmt;

/// Chunk type discriminator for fixed-length chunks.
pub const CHUNK_FIXED_LENGTH: &str = "FixedLengthChunk";
/// Chunk type discriminator for conditionally-selected chunks.
pub const CHUNK_CONDITIONAL: &str = "ConditionalChunk";

/// One protocol file: an ordered chunk list, parsed once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolFile {
    /// Optional deployment-facing name, documentation only.
    #[serde(default)]
    pub name: Option<String>,
    pub chunks: Vec<RawChunk>,
}

/// One chunk entry, tagged by its `type` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum RawChunk {
    #[serde(rename = "FixedLengthChunk")]
    FixedLength {
        length: RawIntExpr,
        #[serde(default)]
        sections: Vec<RawSection>,
    },
    #[serde(rename = "ConditionalChunk")]
    Conditional {
        #[serde(rename = "conditionField")]
        condition_field: String,
        choices: HashMap<ChoiceKey, RawChunk>,
    },
}

/// An integer position in the descriptor: a literal or a `"${name}"`
/// forward reference resolved against the frame context at execution time.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawIntExpr {
    Literal(u64),
    Reference(String),
}

/// One decodable field (or repeated group) within a fixed-length chunk.
#[derive(Debug, Clone, Deserialize)]
pub struct RawSection {
    pub from: RawFrom,
    #[serde(default)]
    pub decoding: Option<RawDecoding>,
    #[serde(default, rename = "for")]
    pub exports: Option<RawExports>,
    #[serde(default)]
    pub to: Option<RawTarget>,
    /// Documentation only, surfaced verbatim in decode diagnostics.
    #[serde(default)]
    pub desc: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawFrom {
    pub byte: usize,
    #[serde(default)]
    pub repeat: Option<RawIntExpr>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawDecoding {
    pub method: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawExports {
    #[serde(default, rename = "varName")]
    pub var_name: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawTarget {
    /// Device name template; may embed `${var}` references.
    pub device: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub fields: Vec<String>,
}

/// A conditional-choice key in canonical string form.
///
/// Operators write choice keys as whatever YAML scalar is natural
/// (`3:`, `"0x10":`, `ack:`); matching happens against the canonical
/// rendering of the condition value, so all scalar shapes normalize to a
/// string here.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChoiceKey(pub String);

impl<'de> Deserialize<'de> for ChoiceKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct KeyVisitor;

        impl Visitor<'_> for KeyVisitor {
            type Value = ChoiceKey;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a scalar choice key")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<ChoiceKey, E> {
                Ok(ChoiceKey(v.to_string()))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<ChoiceKey, E> {
                Ok(ChoiceKey(v.to_string()))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<ChoiceKey, E> {
                Ok(ChoiceKey(v.to_string()))
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<ChoiceKey, E> {
                Ok(ChoiceKey(v.to_string()))
            }
        }

        deserializer.deserialize_any(KeyVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_round_trips_from_yaml() {
        let yaml = r#"
name: vobc-v2
chunks:
  - type: FixedLengthChunk
    length: 4
    sections:
      - from: { byte: 2 }
        decoding: { method: u16_be }
        for: { varName: [speed_raw] }
        to: { device: "vobc_${device_id}", type: train, fields: [speed] }
        desc: cab speed register
      - from: { byte: 2, repeat: "${axle_count}" }
        desc: per-axle load
  - type: ConditionalChunk
    conditionField: msg_type
    choices:
      1:
        type: FixedLengthChunk
        length: "${frame_len}"
"#;
        let file: ProtocolFile = serde_yaml_ng::from_str(yaml).expect("parses");
        assert_eq!(file.name.as_deref(), Some("vobc-v2"));
        assert_eq!(file.chunks.len(), 2);

        let RawChunk::FixedLength { length, sections } = &file.chunks[0] else {
            panic!("expected fixed-length chunk");
        };
        assert!(matches!(length, RawIntExpr::Literal(4)));
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].decoding.as_ref().unwrap().method, "u16_be");
        assert_eq!(sections[0].exports.as_ref().unwrap().var_name, ["speed_raw"]);
        assert!(sections[1].decoding.is_none());
        assert!(matches!(sections[1].from.repeat, Some(RawIntExpr::Reference(_))));

        let RawChunk::Conditional { condition_field, choices } = &file.chunks[1] else {
            panic!("expected conditional chunk");
        };
        assert_eq!(condition_field, "msg_type");
        // Numeric keys normalize to their decimal rendering.
        assert!(choices.contains_key(&ChoiceKey("1".into())));
    }
}
