pub mod config;

// the helper and its descriptors only exist on linux
#[cfg(target_os = "linux")]
pub mod broker;
#[cfg(target_os = "linux")]
pub mod session;
#[cfg(target_os = "linux")]
pub mod supervisor;
