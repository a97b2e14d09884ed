use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use kmsgrab_common::protocol_common::HelperExitCode;
use kmsgrab_send::{drm_card::DrmCard, helper::notify_failure, run};
use tracing::{error, info};

use crate::tracing_init::init_tracing;

pub mod tracing_init;

#[derive(clap::Parser)]
#[command(
    name = "kmsgrab-send",
    version,
    about = "kmsgrab-send",
    long_about = "Exports the framebuffers currently scanned out by a DRM \
                  device as dma-buf descriptors and passes them to the \
                  process listening on SOCKET_PATH. Needs cap_sys_admin, \
                  either through setcap or an elevation wrapper. Normally \
                  started by kmsgrab, not by hand"
)]
struct Args {
    #[arg(value_name = "DEVICE", help = "DRM card node, e.g. /dev/dri/card0")]
    device: PathBuf,

    #[arg(
        value_name = "SOCKET_PATH",
        help = "UNIX socket the consumer is listening on"
    )]
    socket_path: PathBuf,

    #[arg(
        long,
        short = 'l',
        value_name = "LOG_PATH",
        help = "Optional log file to append to. If not provided, logs go to \
                stderr"
    )]
    log_path: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.log_path.as_deref());

    info!(device = %args.device.display(), "opening card");
    let card = match DrmCard::open(&args.device) {
        Ok(card) => card,
        Err(e) => {
            error!(device = %args.device.display(), error = %e, "cannot open card");
            notify_failure(&args.socket_path);
            return HelperExitCode::DeviceOpen.into();
        }
    };

    run(&card, &args.socket_path).into()
}
