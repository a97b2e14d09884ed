use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr, eyre};
use kmsgrab::{
    broker::Broker,
    config::{BrokerConfig, default_runtime_dir},
    session::CaptureSession,
};
use kmsgrab_common::protocol_common::fourcc_name;
use tracing::info;

use crate::{cli::Args, tracing_init::init_tracing};

pub mod cli;
pub mod tracing_init;

fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    init_tracing(&args);

    let Args::List {
        device,
        runtime_dir,
        helper_dir,
        elevate,
        accept_timeout_secs,
        select,
        log_path,
    } = args;

    let config = BrokerConfig {
        runtime_dir: runtime_dir.unwrap_or_else(default_runtime_dir),
        helper_dir,
        elevate_with: elevate.map(Into::into),
        helper_log_path: log_path,
        accept_timeout: Duration::from_secs(accept_timeout_secs),
        ..BrokerConfig::default()
    };
    let broker = Broker::new(config).wrap_err("cannot set up the broker")?;
    let mut session = CaptureSession::open(broker, &device).wrap_err_with(
        || format!("cannot list framebuffers of {}", device.display()),
    )?;

    if session.framebuffer_labels().is_empty() {
        println!("no framebuffers on {}", device.display());
    }
    if let Some(list) = session.framebuffers() {
        for fb in list.framebuffers() {
            println!(
                "{}  {} modifier={:#x} planes={}",
                fb.label(),
                fourcc_name(fb.fourcc),
                fb.modifier,
                fb.planes.len()
            );
        }
    }

    if let Some(fb_id) = select {
        session
            .select(fb_id)
            .ok_or_else(|| eyre!("no framebuffer with id {fb_id:#x}"))?;
        let (width, height) = session.dimensions();
        println!("selected {fb_id:#x}: {width}x{height}");
        if let Some(import) = session.import_descriptor() {
            for (i, plane) in import.planes.iter().enumerate() {
                println!(
                    "  plane {i}: fd={:?} pitch={} offset={} modifier={:#x}",
                    plane.fd, plane.pitch, plane.offset, plane.modifier
                );
            }
        }
    }

    let closed = session.close();
    info!(closed, "done");
    Ok(())
}
