//! Declarative protocol engine: descriptor model, compiler, frame context
//! and the executable chunk plan.

mod compiler;
mod context;
pub mod descriptor;
mod plan;

pub use compiler::{compile, compile_str, compile_value};
pub use context::{ContextSchema, DEVICE_ID_VAR, FrameContext};
pub use descriptor::ProtocolFile;
pub use plan::{
    ChunkNode, ChunkPlan, ConditionalChunk, FALLBACK_CHOICE, FixedLengthChunk, IntExpr,
    SectionDecode, SectionPlan, SectionTarget, Template,
};
