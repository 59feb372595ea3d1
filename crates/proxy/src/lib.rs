//! Node-addressed remote procedure calls
//!
//! A service interface is declared once as a trait. Nodes serve local
//! implementations of it and call other nodes through proxies that implement
//! the same trait, so callers do not care whether a service is local.
//!
//! Calls travel over the cluster communicator on the subject
//! `proxy-service-<interface name>`.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod config;
pub mod dispatch;
pub mod error;
pub mod factory;
pub mod interface;
pub mod invoker;
pub mod manager;
pub mod service;

pub use config::ProxyConfig;
pub use dispatch::{DispatchTable, ProxyRequest};
pub use error::{ProxyError, ProxyResult};
pub use factory::ProxyFactory;
pub use interface::{MethodDescriptor, MethodKind, ProxyInterface};
pub use invoker::RemoteInvoker;
pub use manager::ProxyManager;
pub use service::ProxyService;
