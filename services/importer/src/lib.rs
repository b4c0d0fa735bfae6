// importer: Library entry point.
// Exposes modules for integration testing.

pub mod config;
pub mod db;
pub mod engine;
pub mod purge;
pub mod shutdown;
pub mod stream;
pub mod supervisor;

pub use k8see_event as event;

use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by the component seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
