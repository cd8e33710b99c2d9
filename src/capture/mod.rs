//! Device-resident components: durable capture queue, connectivity
//! signal, capture watcher, and the upload synchronizer that drains the
//! queue against the ingestion endpoint.

pub mod connectivity;
pub mod queue;
pub mod sync;
pub mod watcher;

pub use connectivity::Connectivity;
pub use queue::{CaptureQueue, Enqueued, QueueEntry, QueueError, StateChange, UploadState};
pub use sync::{DrainReport, UploadSynchronizer};
pub use watcher::{CaptureWatcher, DeviceIdentity, WatcherConfig};
