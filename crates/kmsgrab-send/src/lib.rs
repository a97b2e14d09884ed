pub mod enumerate;
pub mod helper;

#[cfg(target_os = "linux")]
pub mod drm_card;

pub use helper::run;
