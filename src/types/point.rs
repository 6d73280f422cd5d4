//! Decoded point types and the per-frame assembler.
//!
//! A [`PointBatch`] is the fundamental unit handed downstream: everything one
//! frame decoded to, stamped once, never retained by the gateway after the
//! hand-off.

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use super::Value;

/// Identity of the device a point belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceRef {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// One device's decoded field set for one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Point {
    pub device: DeviceRef,
    pub fields: BTreeMap<String, Value>,
    pub timestamp_ms: u64,
}

impl Point {
    /// Create an empty point for a device; the timestamp is stamped when the
    /// owning frame is finished.
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            device: DeviceRef { name: name.into(), kind: kind.into() },
            fields: BTreeMap::new(),
            timestamp_ms: 0,
        }
    }
}

/// All points produced by one frame, handed downstream as a unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointBatch {
    pub frame_id: u64,
    pub timestamp_ms: u64,
    pub points: Vec<Point>,
}

/// Per-frame working state: the in-progress point list plus the raw-byte
/// accumulator kept for audit logging.
///
/// Created fresh for every frame iteration; the frame context is *not* part
/// of this state and persists across frames on the same connection.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_id: u64,
    raw: Vec<u8>,
    points: Vec<Point>,
}

impl FrameAssembler {
    pub fn new(frame_id: u64) -> Self {
        Self { frame_id, raw: Vec::new(), points: Vec::new() }
    }

    /// Bytes consumed so far in this frame.
    pub fn raw_len(&self) -> usize {
        self.raw.len()
    }

    /// Append chunk bytes to the audit accumulator.
    pub fn extend_raw(&mut self, bytes: &[u8]) {
        self.raw.extend_from_slice(bytes);
    }

    /// Hex dump of everything read for this frame, for audit logging.
    pub fn raw_hex(&self) -> String {
        self.raw.iter().map(|byte| format!("{byte:02x}")).collect()
    }

    pub fn push_point(&mut self, point: Point) {
        self.points.push(point);
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    /// Finish the frame: stamp the wall clock on the batch and every point.
    pub fn into_batch(self) -> PointBatch {
        let timestamp_ms = unix_millis();
        let mut points = self.points;
        for point in &mut points {
            point.timestamp_ms = timestamp_ms;
        }
        PointBatch { frame_id: self.frame_id, timestamp_ms, points }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembler_accumulates_raw_and_points() {
        let mut frame = FrameAssembler::new(3);
        frame.extend_raw(&[0xAB, 0x01]);
        frame.extend_raw(&[0xFF]);
        assert_eq!(frame.raw_len(), 3);
        assert_eq!(frame.raw_hex(), "ab01ff");

        let mut point = Point::new("vobc1", "train");
        point.fields.insert("speed".into(), Value::UInt(42));
        frame.push_point(point);

        let batch = frame.into_batch();
        assert_eq!(batch.frame_id, 3);
        assert_eq!(batch.points.len(), 1);
        assert_eq!(batch.points[0].timestamp_ms, batch.timestamp_ms);
        assert!(batch.timestamp_ms > 0);
    }

    #[test]
    fn batch_serializes_to_json() {
        let mut point = Point::new("vobc1", "train");
        point.fields.insert("door_open".into(), Value::UInt(1));
        let batch = PointBatch { frame_id: 0, timestamp_ms: 1_700_000_000_000, points: vec![point] };

        let json = serde_json::to_string(&batch).expect("serializes");
        assert!(json.contains("\"vobc1\""));
        assert!(json.contains("\"door_open\":1"));
        assert!(json.contains("\"type\":\"train\""));
    }
}
