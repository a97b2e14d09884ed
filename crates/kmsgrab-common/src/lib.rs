pub mod protocol_common;

// descriptor passing and the drm devices it carries are linux only
#[cfg(target_os = "linux")]
pub mod handle_table;
#[cfg(target_os = "linux")]
pub mod transport;
