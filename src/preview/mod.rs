//! Lifecycle of per-branch preview environments: naming, namespaces, ports,
//! certificates, DNS, readiness, provisioning and the stale-environment sweep.

pub mod certificate;
pub mod cluster;
pub mod dns;
pub mod error;
pub mod gc;
pub mod namespace;
pub mod naming;
pub mod poll;
pub mod ports;
pub mod provisioner;
pub mod readiness;
pub mod settings;
pub mod shell;
pub mod vm;
