use std::path::Path;

use kmsgrab_common::{
    protocol_common::HelperExitCode,
    transport::{hang_up, send_message},
};
use tracing::{error, info, warn};

use crate::enumerate::{ScanoutDevice, enumerate};

/// Enumerates `device` and hands the result to whoever listens on
/// `socket_path`. On enumeration failure the listener is woken with an empty
/// connection and the failure is reported through the exit code.
pub fn run<D: ScanoutDevice + ?Sized>(
    device: &D,
    socket_path: &Path,
) -> HelperExitCode {
    let list = match enumerate(device) {
        Ok(list) => list,
        Err(e) => {
            error!(error = %e, "enumeration failed");
            notify_failure(socket_path);
            return e.exit_code();
        }
    };

    info!(
        framebuffers = list.framebuffers().len(),
        fds = list.num_fds(),
        socket = %socket_path.display(),
        "sending"
    );
    // our copies of the descriptors close when the message drops
    match send_message(socket_path, &list.into_message()) {
        Ok(sent) => {
            info!(bytes = sent, "sent");
            HelperExitCode::Success
        }
        Err(e) => {
            error!(error = %e, "cannot send framebuffers");
            HelperExitCode::Transport
        }
    }
}

/// Wakes the listener without sending anything.
pub fn notify_failure(socket_path: &Path) {
    if let Err(e) = hang_up(socket_path) {
        warn!(error = %e, "cannot reach the consumer to report failure");
    }
}
