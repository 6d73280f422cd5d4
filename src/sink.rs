//! Downstream emission boundary.
//!
//! The gateway hands one [`PointBatch`] per decoded frame into a bounded
//! channel; whatever consumes the other end is outside the core. The channel
//! being bounded is the backpressure contract: a stalled consumer stalls the
//! producing connections rather than growing a queue without limit.
//!
//! [`EmissionSink`] is the seam for pluggable consumers. Delivery and retry
//! semantics for concrete downstream stores are deliberately not defined
//! here.

use std::io::Write;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{GatewayError, Result};
use crate::types::PointBatch;

/// Consumer seam for decoded point batches.
#[async_trait::async_trait]
pub trait EmissionSink: Send {
    async fn emit(&mut self, batch: PointBatch) -> Result<()>;
}

/// Create the bounded emission channel the gateway feeds.
pub fn batch_channel(capacity: usize) -> (mpsc::Sender<PointBatch>, mpsc::Receiver<PointBatch>) {
    mpsc::channel(capacity)
}

/// Stream view over the receiving half, for `StreamExt`-style consumers.
pub fn batch_stream(receiver: mpsc::Receiver<PointBatch>) -> ReceiverStream<PointBatch> {
    ReceiverStream::new(receiver)
}

/// Sink that forwards into another bounded channel, for fan-in topologies.
pub struct ChannelSink {
    sender: mpsc::Sender<PointBatch>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::Sender<PointBatch>) -> Self {
        Self { sender }
    }
}

#[async_trait::async_trait]
impl EmissionSink for ChannelSink {
    async fn emit(&mut self, batch: PointBatch) -> Result<()> {
        self.sender.send(batch).await.map_err(|_| {
            GatewayError::io(
                "emission channel",
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "emission channel closed"),
            )
        })
    }
}

/// Sink writing one JSON object per batch per line, used by the bundled
/// binary to put decoded telemetry on stdout.
pub struct NdjsonSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> NdjsonSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait::async_trait]
impl<W: Write + Send> EmissionSink for NdjsonSink<W> {
    async fn emit(&mut self, batch: PointBatch) -> Result<()> {
        let line = serde_json::to_string(&batch)
            .map_err(|err| GatewayError::io("batch serialization", std::io::Error::other(err)))?;
        writeln!(self.writer, "{line}")
            .map_err(|err| GatewayError::io("ndjson write", err))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Point, PointBatch, Value};

    fn sample_batch() -> PointBatch {
        let mut point = Point::new("vobc1", "train");
        point.fields.insert("speed".into(), Value::UInt(80));
        PointBatch { frame_id: 7, timestamp_ms: 1_700_000_000_000, points: vec![point] }
    }

    #[tokio::test]
    async fn ndjson_sink_writes_one_line_per_batch() {
        let mut out = Vec::new();
        {
            let mut sink = NdjsonSink::new(&mut out);
            sink.emit(sample_batch()).await.unwrap();
            sink.emit(sample_batch()).await.unwrap();
        }
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.lines().all(|line| line.contains("\"frame_id\":7")));
    }

    #[tokio::test]
    async fn channel_sink_forwards_and_reports_closure() {
        let (tx, mut rx) = batch_channel(4);
        let mut sink = ChannelSink::new(tx);
        sink.emit(sample_batch()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().frame_id, 7);

        drop(rx);
        let err = sink.emit(sample_batch()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Io { .. }), "{err}");
    }
}
