//! Template Operator - ObjectTemplate controller for Kubernetes
//!
//! An `ObjectTemplate` declares a matrix of input values, taken from
//! inline lists or from fields of other cluster objects, and a set of
//! templates. Every pass renders the templates once per matrix
//! combination, applies the results with server-side apply, prunes what
//! a previous pass created but is no longer rendered, and records the
//! outcome in the template's status.

pub mod apply;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod health;
pub mod matrix;
pub mod path;
pub mod reconciler;
pub mod store;
pub mod template;
pub mod watcher;

pub use config::ControllerConfig;
pub use crd::ObjectTemplate;
pub use error::{Error, Result};
pub use reconciler::{PassReport, Reconciler};
pub use store::{KubeStore, MemoryStore};
pub use watcher::WatchRegistrar;
