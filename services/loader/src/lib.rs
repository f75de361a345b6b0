//! Nier Loader Service
//!
//! Streams vehicle telemetry drop files from a watched directory into
//! PostgreSQL. Files are decoded incrementally, grouped into fixed-size
//! batches and committed one transaction per batch, with fixed-delay retries
//! around each write.
//!
//! ## Drop files
//!
//! - `*objects_detection*` files hold `{"objects_detection_events": [...]}`
//!   and land in the `objects_detection` table
//! - `*vehicles_status*` files hold `{"vehicle_status": [...]}` and land in
//!   the `vehicles_status` table
//! - anything else is ignored
//!
//! ## Architecture
//!
//! ```text
//! Watched dir        Queue            Dispatcher                  PostgreSQL
//! ┌──────────┐      ┌───────┐      ┌──────────────────┐        ┌──────────────────┐
//! │ notify   │─────▶│ mpsc  │─────▶│ classify         │        │ objects_detection│
//! │ watcher  │      └───────┘      │   │              │        │ vehicles_status  │
//! └──────────┘                     │   ▼              │        └──────────────────┘
//!                                  │ RecordStream     │                 ▲
//!                                  │   │              │                 │
//!                                  │   ▼              │                 │
//!                                  │ BatchAccumulator │                 │
//!                                  │   │              │                 │
//!                                  │   ▼              │                 │
//!                                  │ RetryingWriter ──┼──────▶ PgStore ─┘
//!                                  └──────────────────┘
//! ```

pub mod batch;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod records;
pub mod retry;
pub mod store;
pub mod stream_parser;
pub mod watcher;

pub use batch::{Batch, BatchAccumulator};
pub use config::Config;
pub use dispatcher::{DispatcherSettings, FileEvent, FileOutcome, FileReport, IngestDispatcher};
pub use error::{ErrorKind, IngestError};
pub use records::{classify, DetectionRecord, Shape, StatusRecord};
pub use retry::{RetryPolicy, RetryingWriter};
pub use store::{PgStore, RecordSink, StoreError};
pub use stream_parser::RecordStream;
pub use watcher::DirectoryWatcher;
