// ml worker: resolves model and dataset artifacts, runs predictions, tests,
// explanations and pushes, and serves them over the worker transport.

pub mod artifacts;
pub mod builtins;
pub mod catalog;
pub mod config;
pub mod error;
pub mod explain;
pub mod interceptor;
pub mod loaders;
pub mod push;
pub mod registry;
pub mod router;
pub mod transport;

pub use artifacts::{ArtifactFetcher, ArtifactKind, ArtifactResolver, MirrorFetcher};
pub use catalog::{FunctionCatalog, Plugin};
pub use config::WorkerSettings;
pub use error::{RequestError, TransportError, WorkerError};
pub use registry::ArtifactRegistry;
pub use router::RequestRouter;
pub use transport::{StopHandle, Worker, WorkerMode};
