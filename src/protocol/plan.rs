//! Executable chunk plan.
//!
//! A [`ChunkPlan`] is the compiled, immutable decode tree for one protocol.
//! It is built once at startup and shared read-only across every connection;
//! all mutable decode state lives in the per-connection
//! [`FrameContext`](super::FrameContext) and the per-frame
//! [`FrameAssembler`](crate::types::FrameAssembler) the caller passes in.
//!
//! Execution walks the chunk list in order against the connection's byte
//! stream. Chunk kinds form a closed set: a [`FixedLengthChunk`] consumes an
//! exact byte count and decodes its sections against that buffer, a
//! [`ConditionalChunk`] selects a child chunk by a previously decoded value.
//! Every failure mode surfaces as a typed [`GatewayError`], never a panic:
//! malformed wire data costs one connection, not the process.

use std::collections::HashMap;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

use crate::error::{GatewayError, Result};
use crate::registry::DecodeFn;
use crate::types::{FrameAssembler, Point, Value};

use super::context::{ContextSchema, FrameContext};

/// Explicit fallback key in a conditional chunk's choice map.
///
/// An unmatched condition value is a hard error unless the protocol author
/// spelled out a `"*"` entry; there is no implicit default.
pub const FALLBACK_CHOICE: &str = "*";

/// A compiled integer position: literal, or a name resolved against the
/// frame context when the chunk executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntExpr {
    Literal(usize),
    Var(String),
}

impl IntExpr {
    /// Resolve to a concrete count. A referenced name that no section has
    /// produced yet fails with `UnresolvedVariable`; a produced value that
    /// is not a whole non-negative integer fails with `TypeConversion`.
    pub fn resolve(&self, ctx: &FrameContext) -> Result<usize> {
        match self {
            IntExpr::Literal(n) => Ok(*n),
            IntExpr::Var(name) => {
                let value =
                    ctx.get(name).ok_or_else(|| GatewayError::unresolved_variable(name.clone()))?;
                value.as_usize().ok_or_else(|| GatewayError::TypeConversion {
                    details: format!(
                        "variable '{name}' is {} '{}', expected a non-negative integer",
                        value.kind(),
                        value
                    ),
                })
            }
        }
    }

    /// The referenced variable name, if this is a reference.
    pub fn var_name(&self) -> Option<&str> {
        match self {
            IntExpr::Literal(_) => None,
            IntExpr::Var(name) => Some(name),
        }
    }
}

/// A device-name template: literal text with embedded `${var}` references,
/// expanded against the frame context for every emitted point.
#[derive(Debug, Clone)]
pub struct Template {
    segments: Vec<Segment>,
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Var(String),
}

impl Template {
    pub fn parse(input: &str) -> Self {
        let mut segments = Vec::new();
        let mut rest = input;
        while let Some(start) = rest.find("${") {
            let Some(close) = rest[start..].find('}') else { break };
            let end = start + close;
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            segments.push(Segment::Var(rest[start + 2..end].to_string()));
            rest = &rest[end + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        Self { segments }
    }

    pub fn expand(&self, ctx: &FrameContext) -> Result<String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Var(name) => {
                    let value = ctx
                        .get(name)
                        .ok_or_else(|| GatewayError::unresolved_variable(name.clone()))?;
                    out.push_str(&value.render());
                }
            }
        }
        Ok(out)
    }

    /// Names this template references, for compile-time validation.
    pub fn var_names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Var(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }
}

/// Resolved decode method attached to a section.
pub struct SectionDecode {
    pub method: String,
    pub func: DecodeFn,
}

impl std::fmt::Debug for SectionDecode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SectionDecode").field("method", &self.method).finish_non_exhaustive()
    }
}

/// Emission target of a section: which device the decoded values belong to
/// and which field names they map onto, positionally.
#[derive(Debug)]
pub struct SectionTarget {
    pub device: Template,
    pub kind: String,
    pub fields: Vec<String>,
}

/// One compiled section of a fixed-length chunk.
#[derive(Debug)]
pub struct SectionPlan {
    pub byte_length: usize,
    pub repeat: IntExpr,
    pub decode: Option<SectionDecode>,
    pub exports: Vec<String>,
    pub target: Option<SectionTarget>,
    pub desc: String,
}

impl SectionPlan {
    fn decode_values(&self, slice: &[u8]) -> Result<Vec<Value>> {
        match &self.decode {
            Some(decode) => (decode.func)(slice).map_err(|source| GatewayError::DecodeFailed {
                method: decode.method.clone(),
                section: self.desc.clone(),
                source: Box::new(source),
            }),
            // No decode method: pass the raw slice through as one value.
            None => Ok(vec![Value::Bytes(slice.to_vec())]),
        }
    }

    /// Bind decoded values to exported names, positionally: the i-th export
    /// name receives the i-th value.
    fn bind_exports(&self, values: &[Value], ctx: &mut FrameContext) -> Result<()> {
        if self.exports.is_empty() {
            return Ok(());
        }
        if values.len() < self.exports.len() {
            return Err(GatewayError::ValueCount {
                section: self.desc.clone(),
                wanted: self.exports.len(),
                got: values.len(),
            });
        }
        for (name, value) in self.exports.iter().zip(values) {
            ctx.set(name, value.clone());
        }
        Ok(())
    }

    /// Build one point for this repeat iteration, if the section emits one.
    fn build_point(&self, values: &[Value], ctx: &FrameContext) -> Result<Option<Point>> {
        let Some(target) = &self.target else { return Ok(None) };
        if target.fields.is_empty() {
            return Ok(None);
        }
        if values.len() < target.fields.len() {
            return Err(GatewayError::ValueCount {
                section: self.desc.clone(),
                wanted: target.fields.len(),
                got: values.len(),
            });
        }
        let device = target.device.expand(ctx)?;
        let mut point = Point::new(device, target.kind.clone());
        for (field, value) in target.fields.iter().zip(values) {
            point.fields.insert(field.clone(), value.clone());
        }
        Ok(Some(point))
    }
}

/// A chunk that consumes an exact byte count and decodes sections against
/// that buffer with a forward-moving cursor.
#[derive(Debug)]
pub struct FixedLengthChunk {
    pub length: IntExpr,
    pub sections: Vec<SectionPlan>,
}

impl FixedLengthChunk {
    async fn process<R>(
        &self,
        reader: &mut R,
        ctx: &mut FrameContext,
        frame: &mut FrameAssembler,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let length = self.length.resolve(ctx)?;
        let mut buf = vec![0u8; length];
        if length > 0 {
            read_chunk_bytes(reader, &mut buf, frame.raw_len() == 0).await?;
        }
        frame.extend_raw(&buf);
        trace!(length, sections = self.sections.len(), "fixed-length chunk read");

        let mut cursor = 0usize;
        for section in &self.sections {
            let repeat = section.repeat.resolve(ctx)?;
            for _ in 0..repeat {
                let end = cursor + section.byte_length;
                if end > buf.len() {
                    return Err(GatewayError::CursorOverrun {
                        section: section.desc.clone(),
                        cursor,
                        requested: section.byte_length,
                        available: buf.len(),
                    });
                }
                let slice = &buf[cursor..end];
                cursor = end;

                let values = section.decode_values(slice)?;
                section.bind_exports(&values, ctx)?;
                if let Some(point) = section.build_point(&values, ctx)? {
                    frame.push_point(point);
                }
            }
        }
        if cursor < buf.len() {
            // Padding after the last section is common in field-device frames.
            trace!(leftover = buf.len() - cursor, "undecoded trailing bytes in chunk");
        }
        Ok(())
    }
}

/// A chunk that selects one of several child chunks by the value of a
/// previously decoded condition field.
#[derive(Debug)]
pub struct ConditionalChunk {
    pub condition_field: String,
    pub choices: HashMap<String, ChunkNode>,
}

impl ConditionalChunk {
    async fn process<R>(
        &self,
        reader: &mut R,
        ctx: &mut FrameContext,
        frame: &mut FrameAssembler,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let value = ctx.get(&self.condition_field).ok_or_else(|| {
            GatewayError::ConditionNotSet { field: self.condition_field.clone() }
        })?;
        let key = value.render();
        let child = match self.choices.get(&key) {
            Some(child) => child,
            None => self.choices.get(FALLBACK_CHOICE).ok_or_else(|| {
                GatewayError::UnknownChoice {
                    field: self.condition_field.clone(),
                    value: key.clone(),
                }
            })?,
        };
        debug!(field = %self.condition_field, choice = %key, "conditional chunk selected");
        child.process(reader, ctx, frame).await
    }
}

/// One node of the decode tree. The set of chunk kinds is closed; adding a
/// kind means extending this enum, not registering a handler at runtime.
#[derive(Debug)]
pub enum ChunkNode {
    FixedLength(FixedLengthChunk),
    Conditional(ConditionalChunk),
}

impl ChunkNode {
    /// Process one chunk against the stream. Boxed because conditional
    /// chunks recurse into their selected child.
    pub fn process<'a, R>(
        &'a self,
        reader: &'a mut R,
        ctx: &'a mut FrameContext,
        frame: &'a mut FrameAssembler,
    ) -> BoxFuture<'a, Result<()>>
    where
        R: AsyncRead + Unpin + Send,
    {
        match self {
            ChunkNode::FixedLength(chunk) => Box::pin(chunk.process(reader, ctx, frame)),
            ChunkNode::Conditional(chunk) => Box::pin(chunk.process(reader, ctx, frame)),
        }
    }
}

/// The compiled decode tree for one protocol.
#[derive(Debug)]
pub struct ChunkPlan {
    pub(crate) chunks: Vec<ChunkNode>,
    pub(crate) schema: ContextSchema,
}

impl ChunkPlan {
    /// The declaration table the compiler validated references against.
    pub fn schema(&self) -> &ContextSchema {
        &self.schema
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Consume exactly one frame from the stream, mutating the context and
    /// filling the assembler. On error the assembler holds whatever bytes
    /// were consumed, for audit logging by the caller; no partial batch is
    /// ever produced from it.
    pub async fn run_frame<R>(
        &self,
        reader: &mut R,
        ctx: &mut FrameContext,
        frame: &mut FrameAssembler,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        for chunk in &self.chunks {
            chunk.process(reader, ctx, frame).await?;
        }
        Ok(())
    }
}

/// Read an exact chunk into `buf`, classifying end-of-stream: EOF before the
/// first byte of a frame is a clean peer disconnect, EOF anywhere later is a
/// torn frame.
async fn read_chunk_bytes<R>(reader: &mut R, buf: &mut [u8], at_frame_start: bool) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    if at_frame_start {
        let probed = reader
            .read(&mut buf[..1])
            .await
            .map_err(|source| GatewayError::io("frame read", source))?;
        if probed == 0 {
            return Err(GatewayError::PeerDisconnected);
        }
        reader.read_exact(&mut buf[1..]).await.map_err(|err| map_read_error(err, buf.len()))?;
    } else {
        reader.read_exact(buf).await.map_err(|err| map_read_error(err, buf.len()))?;
    }
    Ok(())
}

fn map_read_error(err: std::io::Error, wanted: usize) -> GatewayError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        GatewayError::UnexpectedEof { wanted }
    } else {
        GatewayError::io("chunk read", err)
    }
}
