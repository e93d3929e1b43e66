pub mod cloud_init;
pub mod distro;
pub mod hypervisor;
pub mod monitor;
pub mod vm;
pub mod vm_manager;

pub use distro::{BaseImage, DistroManager};
pub use vm_manager::VmManager;
