//! kube-external-sync controller: configuration, liveness endpoint and the
//! task runner behind the `kube-external-sync` binary.

#![deny(missing_docs)]

pub mod config;
pub mod liveness;
pub mod runner;
