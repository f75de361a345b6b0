//! Record shapes carried by drop files and the filename routing rule.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// One object detection reported by a vehicle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub vehicle_id: String,
    /// ISO-8601 timestamp, stored verbatim
    pub detection_time: String,
    pub object_type: String,
    pub object_value: i32,
}

/// One status report from a vehicle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub vehicle_id: String,
    /// ISO-8601 timestamp, stored verbatim
    pub report_time: String,
    pub status: String,
}

/// The two record schemas a drop file may hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shape {
    Detection,
    Status,
}

impl Shape {
    pub const ALL: [Shape; 2] = [Shape::Detection, Shape::Status];

    /// Substring a filename must contain to carry this shape
    pub fn file_tag(&self) -> &'static str {
        match self {
            Shape::Detection => "objects_detection",
            Shape::Status => "vehicles_status",
        }
    }

    /// Top-level key holding the record array
    pub fn array_key(&self) -> &'static str {
        match self {
            Shape::Detection => "objects_detection_events",
            Shape::Status => "vehicle_status",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Shape::Detection => "detection",
            Shape::Status => "status",
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Route a drop file by its name. `None` means the file is not ours.
///
/// Only the final path component is inspected, so a directory that happens to
/// be named after a tag does not route unrelated files.
pub fn classify(path: impl AsRef<Path>) -> Option<Shape> {
    let name = path.as_ref().file_name()?.to_str()?;
    Shape::ALL
        .into_iter()
        .find(|shape| name.contains(shape.file_tag()))
}

/// A record type decodable from a drop file
pub trait Record: DeserializeOwned + Send + Sync + 'static {
    const SHAPE: Shape;
}

impl Record for DetectionRecord {
    const SHAPE: Shape = Shape::Detection;
}

impl Record for StatusRecord {
    const SHAPE: Shape = Shape::Status;
}
