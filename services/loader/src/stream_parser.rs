//! Incremental decoding of drop files.
//!
//! A drop file is a single JSON object whose record array lives under a known
//! key. The array is walked element by element with a serde visitor on a
//! blocking thread; each decoded record is handed to the async side through a
//! bounded channel, so at most `buffer` records plus one partially read element
//! are ever held in memory.

use crate::error::IngestError;
use crate::records::Record;
use serde::de::{self, DeserializeSeed, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::debug;

/// Read buffer for the underlying file (64KB)
const READ_BUFFER_BYTES: usize = 64 * 1024;

/// Error message used to unwind the visitor when the consumer went away
const CONSUMER_GONE: &str = "record consumer dropped";

type Item<T> = Result<T, IngestError>;

/// Lazy, finite sequence of records decoded from one drop file.
///
/// After the first error no further records are yielded.
pub struct RecordStream<T> {
    rx: mpsc::Receiver<Item<T>>,
    finished: bool,
}

impl<T: Record> RecordStream<T> {
    /// Stream records from the file at `path`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(path: impl Into<PathBuf>, buffer: usize) -> Self {
        let path = path.into();
        Self::spawn(buffer, move || {
            File::open(&path).map_err(IngestError::from)
        })
    }

    /// Stream records from an arbitrary reader.
    pub fn from_reader<R>(reader: R, buffer: usize) -> Self
    where
        R: Read + Send + 'static,
    {
        Self::spawn(buffer, move || Ok(reader))
    }

    fn spawn<R, F>(buffer: usize, open: F) -> Self
    where
        R: Read,
        F: FnOnce() -> Result<R, IngestError> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(buffer.max(1));

        tokio::task::spawn_blocking(move || {
            let result = open().and_then(|reader| decode::<T, _>(reader, &tx));
            if let Err(e) = result {
                if tx.is_closed() {
                    debug!(shape = %T::SHAPE, "Decoder stopped, consumer dropped the stream");
                } else {
                    let _ = tx.blocking_send(Err(e));
                }
            }
        });

        Self { rx, finished: false }
    }

    /// Next record, `None` at the end of the array or after an error.
    pub async fn next(&mut self) -> Option<Item<T>> {
        if self.finished {
            return None;
        }

        match self.rx.recv().await {
            Some(Ok(record)) => Some(Ok(record)),
            Some(Err(e)) => {
                self.finished = true;
                self.rx.close();
                Some(Err(e))
            }
            None => {
                self.finished = true;
                None
            }
        }
    }
}

/// Walk the whole document, sending every element of the shape's array.
fn decode<T: Record, R: Read>(reader: R, tx: &mpsc::Sender<Item<T>>) -> Result<(), IngestError> {
    let reader = BufReader::with_capacity(READ_BUFFER_BYTES, reader);
    let mut de = serde_json::Deserializer::from_reader(reader);

    DocumentSeed {
        key: T::SHAPE.array_key(),
        tx,
    }
    .deserialize(&mut de)?;

    // Reject trailing garbage after the top-level object
    de.end()?;
    Ok(())
}

/// Top-level object; every key but the array key is skipped unparsed.
struct DocumentSeed<'a, T> {
    key: &'static str,
    tx: &'a mpsc::Sender<Item<T>>,
}

impl<'de, T: Record> DeserializeSeed<'de> for DocumentSeed<'_, T> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de, T: Record> Visitor<'de> for DocumentSeed<'_, T> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "an object holding a `{}` array", self.key)
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        while let Some(field) = map.next_key::<String>()? {
            if field == self.key {
                map.next_value_seed(ArraySeed { tx: self.tx })?;
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        Ok(())
    }
}

/// The record array itself.
struct ArraySeed<'a, T> {
    tx: &'a mpsc::Sender<Item<T>>,
}

impl<'de, T: Record> DeserializeSeed<'de> for ArraySeed<'_, T> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de, T: Record> Visitor<'de> for ArraySeed<'_, T> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "an array of {} records", T::SHAPE)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        while let Some(record) = seq.next_element::<T>()? {
            if self.tx.blocking_send(Ok(record)).is_err() {
                return Err(de::Error::custom(CONSUMER_GONE));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::records::{DetectionRecord, StatusRecord};
    use std::io::Cursor;

    fn stream<T: Record>(json: &str) -> RecordStream<T> {
        RecordStream::from_reader(Cursor::new(json.as_bytes().to_vec()), 4)
    }

    async fn collect<T: Record>(mut stream: RecordStream<T>) -> (Vec<T>, Option<IngestError>) {
        let mut records = Vec::new();
        let mut error = None;
        while let Some(item) = stream.next().await {
            match item {
                Ok(record) => records.push(record),
                Err(e) => error = Some(e),
            }
        }
        (records, error)
    }

    #[tokio::test]
    async fn test_decodes_detection_records_in_order() {
        let json = r#"{"objects_detection_events":[
            {"vehicle_id":"vid1","detection_time":"2022-06-05T21:02:34.546Z","object_type":"car","object_value":1},
            {"vehicle_id":"vid2","detection_time":"2022-06-05T21:02:35.546Z","object_type":"pedestrian","object_value":3}
        ]}"#;

        let (records, error) = collect(stream::<DetectionRecord>(json)).await;
        assert!(error.is_none());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].vehicle_id, "vid1");
        assert_eq!(records[1].object_type, "pedestrian");
    }

    #[tokio::test]
    async fn test_skips_unrelated_keys() {
        let json = r#"{"meta":{"source":"fleet","ids":[1,2,3]},
            "vehicle_status":[{"vehicle_id":"vid1","report_time":"2022-05-05T22:02:34.546Z","status":"driving"}],
            "trailer":null}"#;

        let (records, error) = collect(stream::<StatusRecord>(json)).await;
        assert!(error.is_none());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, "driving");
    }

    #[tokio::test]
    async fn test_missing_array_key_yields_nothing() {
        let (records, error) = collect(stream::<StatusRecord>(r#"{"other":[]}"#)).await;
        assert!(records.is_empty());
        assert!(error.is_none());
    }

    #[tokio::test]
    async fn test_empty_array() {
        let (records, error) = collect(stream::<StatusRecord>(r#"{"vehicle_status":[]}"#)).await;
        assert!(records.is_empty());
        assert!(error.is_none());
    }

    #[tokio::test]
    async fn test_truncated_document_stops_with_malformed_input() {
        let json = r#"{"vehicle_status":[
            {"vehicle_id":"vid1","report_time":"t1","status":"driving"},
            {"vehicle_id":"vid2","report_ti"#;

        let (records, error) = collect(stream::<StatusRecord>(json)).await;
        assert_eq!(records.len(), 1);
        assert_eq!(error.unwrap().kind(), ErrorKind::MalformedInput);
    }

    #[tokio::test]
    async fn test_missing_field_is_malformed() {
        let json = r#"{"objects_detection_events":[
            {"vehicle_id":"vid1","detection_time":"t1","object_type":"car"},
            {"vehicle_id":"vid2","detection_time":"t2","object_type":"car","object_value":2}
        ]}"#;

        let (records, error) = collect(stream::<DetectionRecord>(json)).await;
        assert!(records.is_empty());
        let error = error.unwrap();
        assert_eq!(error.kind(), ErrorKind::MalformedInput);
        assert!(error.to_string().contains("object_value"));
    }

    #[tokio::test]
    async fn test_top_level_array_is_malformed() {
        let (records, error) = collect(stream::<StatusRecord>("[]")).await;
        assert!(records.is_empty());
        assert_eq!(error.unwrap().kind(), ErrorKind::MalformedInput);
    }

    #[tokio::test]
    async fn test_non_array_value_is_malformed() {
        let (_, error) = collect(stream::<StatusRecord>(r#"{"vehicle_status":{"a":1}}"#)).await;
        assert_eq!(error.unwrap().kind(), ErrorKind::MalformedInput);
    }

    #[tokio::test]
    async fn test_trailing_garbage_is_malformed() {
        let (records, error) =
            collect(stream::<StatusRecord>(r#"{"vehicle_status":[]} {"#)).await;
        assert!(records.is_empty());
        assert_eq!(error.unwrap().kind(), ErrorKind::MalformedInput);
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let stream = RecordStream::<StatusRecord>::open(dir.path().join("absent.json"), 4);
        let (records, error) = collect(stream).await;
        assert!(records.is_empty());
        assert_eq!(error.unwrap().kind(), ErrorKind::Io);
    }

    #[tokio::test]
    async fn test_streams_more_records_than_buffer() {
        let body: Vec<String> = (0..5000)
            .map(|i| format!(r#"{{"vehicle_id":"v{i}","report_time":"t","status":"idle"}}"#))
            .collect();
        let json = format!(r#"{{"vehicle_status":[{}]}}"#, body.join(","));

        let stream = RecordStream::<StatusRecord>::from_reader(Cursor::new(json.into_bytes()), 1);
        let (records, error) = collect(stream).await;
        assert!(error.is_none());
        assert_eq!(records.len(), 5000);
        assert_eq!(records[4999].vehicle_id, "v4999");
    }

    #[tokio::test]
    async fn test_dropping_stream_early_releases_decoder() {
        let body: Vec<String> = (0..100)
            .map(|i| format!(r#"{{"vehicle_id":"v{i}","report_time":"t","status":"idle"}}"#))
            .collect();
        let json = format!(r#"{{"vehicle_status":[{}]}}"#, body.join(","));

        let mut stream =
            RecordStream::<StatusRecord>::from_reader(Cursor::new(json.into_bytes()), 1);
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.vehicle_id, "v0");
        drop(stream);
    }
}
