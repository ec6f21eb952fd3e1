//! Meridian - per-tenant configuration source and resource resolution
//!
//! Apps are stored as flat resource bags on local disk, in Kubernetes
//! ConfigMaps/Secrets, or in a control-plane database, and resolved per
//! request into immutable `AppContext` snapshots.

pub mod bag;
pub mod check;
pub mod entities;
pub mod errors;
pub mod model;
pub mod pathcodec;
pub mod resource;
pub mod settings;
pub mod source;
pub mod store;
pub mod web;
