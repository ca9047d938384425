//! Cloud-backed virtual filesystem core.
//!
//! Exposes cloud directories as local mounts: inode identity and caching,
//! staged file content, driver sessions and the mount lifecycle.

pub mod client;
pub mod config;
pub mod database;
pub mod fuse;
pub mod service;
#[cfg(feature = "testkit")]
pub mod testkit;

pub use client::{Client, ClientError, NodeInfo, Permissions};
pub use config::ServiceConfig;
pub use database::models::{MountFlags, MountInfo};
pub use fuse::{MountEvent, MountEventKind, MountResult, NodeEvent};
pub use service::{Service, ServiceContext, ServiceError};
