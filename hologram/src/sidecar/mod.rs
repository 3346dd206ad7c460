//! In-process sidecar peer: the server half of the NDJSON protocol.

pub mod scan;
pub mod server;

pub use scan::{ProjectScanner, MAX_CACHED_PROJECTS, PROJECT_KEY_PREFIX};
pub use server::{QueryContext, QueryHandler, ShutdownHandle, SidecarServer};
