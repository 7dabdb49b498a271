#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! apcore: a module execution runtime.
//!
//! Hosts named, schema-validated computation units ("modules") and
//! dispatches typed calls through a pipeline enforcing access control,
//! approval gates, safety limits, schema validation, a composable
//! middleware chain, and structured observability.
//!
//! The [`Executor`] is the entry point: build a [`Registry`], populate it
//! (directly via [`Registry::register`], via [`Registry::discover`] against
//! a scanned directory of compiled modules, or by loading binding files with
//! [`BindingLoader::load_file`]/[`BindingLoader::load_dir`]), then build an
//! [`Executor`] over it with [`Executor::builder`] and call
//! [`Executor::call`].

pub mod acl;
pub mod approval;
pub mod binding;
pub mod config;
pub mod context;
pub mod discovery;
pub mod executor;
pub mod middleware;
pub mod module;
pub mod observability;
pub mod registry;
pub mod schema;
pub mod telemetry;

pub use apcore_errors::{ApcoreError, ErrorInfo};

pub use acl::{Acl, AclRequest, AclRule, Conditions, Effect};
pub use approval::{ApprovalHandler, ApprovalRequest, ApprovalStatus};
pub use binding::{Binding, BindingLoader};
pub use config::{ConfigError, ConfigProvider, RuntimeConfig};
pub use context::{Context, Identity, SharedData};
pub use discovery::{ModuleEntry, ScanOptions};
pub use executor::{Executor, ExecutorBuilder, SafetyLimits};
pub use middleware::{Middleware, MiddlewareManager};
pub use module::{Annotations, Module, ModuleDescriptor, ModuleExample, ModuleId};
pub use registry::{DiscoveryReport, DiscoverySource, ListFilter, ModuleValidator, Registry, RegistryEvent};
pub use schema::{ResolvedSchema, RuntimeSchema, ValidationMode, Validator};
