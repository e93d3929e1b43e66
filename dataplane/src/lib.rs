//! Single-host control plane for QEMU/KVM virtual machines.
//!
//! The [`service::Dataplane`] ties together the [`compute`], [`network`] and
//! [`storage`] managers and exposes them through the
//! [`ControlPlane`](igs_rs::control_socket::ControlPlane) interface.

pub mod compute;
pub mod error;
pub mod exec;
pub mod network;
pub mod service;
pub mod storage;
