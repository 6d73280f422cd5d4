//! Configuration-driven binary telemetry gateway for rail field devices.
//!
//! Trackside accepts binary frames from field devices (train/rail control
//! units) over TCP and UDP, decodes them according to a declarative,
//! per-deployment protocol description, and emits structured point batches
//! downstream. Supporting a new device wire format is a configuration
//! change, not a code change.
//!
//! # Architecture
//!
//! - A [`DecodeRegistry`] maps method names to `bytes -> values` transforms.
//! - The protocol compiler ([`compile_str`]) turns a YAML protocol
//!   description into an immutable [`ChunkPlan`], failing startup on any
//!   unknown chunk type, unknown decode method or unresolvable `${name}`
//!   reference.
//! - A [`Gateway`] accepts connections; each one gets its own task, its own
//!   [`FrameContext`], and repeatedly runs the shared plan to consume one
//!   frame at a time.
//! - Decoded [`PointBatch`]es flow into a bounded channel
//!   ([`batch_channel`]); a slow consumer backpressures the producing
//!   connections instead of dropping data.
//!
//! Malformed wire data closes one connection and never touches its
//! siblings; malformed configuration never makes it past startup.
//!
//! # Example
//!
//! ```rust,no_run
//! use trackside::{DecodeRegistry, Gateway, GatewayConfig, batch_channel, compile_str};
//!
//! #[tokio::main]
//! async fn main() -> trackside::Result<()> {
//!     let registry = DecodeRegistry::with_builtins();
//!     let plan = compile_str(
//!         r#"
//! chunks:
//!   - type: FixedLengthChunk
//!     length: 2
//!     sections:
//!       - from: { byte: 2 }
//!         decoding: { method: u16_be }
//!         to: { device: "vobc_${device_id}", type: train, fields: [speed] }
//!         desc: cab speed register
//! "#,
//!         &registry,
//!     )?;
//!
//!     let config = GatewayConfig::default();
//!     let (tx, mut rx) = batch_channel(config.queue_capacity);
//!     let gateway = Gateway::new(config, plan);
//!
//!     tokio::spawn(async move {
//!         while let Some(batch) = rx.recv().await {
//!             println!("frame {}: {} points", batch.frame_id, batch.points.len());
//!         }
//!     });
//!
//!     gateway.run(tx).await
//! }
//! ```

pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod sink;
pub mod types;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use protocol::{ChunkPlan, FrameContext, ProtocolFile, compile, compile_str, compile_value};
pub use registry::{DecodeFn, DecodeRegistry};
pub use server::{ConnectionFramer, Gateway, IdentityTable, UdpIngest};
pub use sink::{ChannelSink, EmissionSink, NdjsonSink, batch_channel, batch_stream};
pub use types::{DeviceRef, FrameAssembler, Point, PointBatch, Value};
