//! Walks the scanout planes of a device and exports the buffers behind the
//! framebuffers they show.

use std::{collections::HashMap, io, os::fd::OwnedFd};

use kmsgrab_common::{
    handle_table::{FramebufferList, HandleTable},
    protocol_common::{
        Framebuffer, HelperExitCode, MAX_FRAMEBUFFERS, MAX_PLANES, Plane,
        ProtocolError, Response, fourcc_name,
    },
};
use snafu::{ResultExt, Snafu, ensure};
use tracing::{debug, info, warn};

/// What the display subsystem reports about one framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FramebufferInfo {
    pub id: u32,
    pub width: u32,
    pub height: u32,
    pub fourcc: u32,
    pub modifier: u64,
    /// buffer object handle per plane, 0 where the plane is absent
    pub handles: [u32; MAX_PLANES],
    pub pitches: [u32; MAX_PLANES],
    pub offsets: [u32; MAX_PLANES],
}

/// The parts of a KMS device the helper needs.
pub trait ScanoutDevice {
    fn plane_ids(&self) -> io::Result<Vec<u32>>;
    /// Framebuffer currently attached to the plane, if any.
    fn plane_framebuffer(&self, plane_id: u32) -> io::Result<Option<u32>>;
    fn framebuffer(&self, fb_id: u32) -> io::Result<FramebufferInfo>;
    /// Exports a buffer object as a read-only, close-on-exec descriptor.
    fn export_buffer(&self, handle: u32) -> io::Result<OwnedFd>;
}

#[derive(Debug, Snafu)]
pub enum EnumerationError {
    #[snafu(display("cannot list planes: {source}"))]
    ListPlanes { source: io::Error },
    #[snafu(display(
        "framebuffer {fb_id:#x} has no valid buffer handles; the helper \
         likely lacks privileges. Do `sudo setcap cap_sys_admin+ep` on it"
    ))]
    NoUsablePlanes { fb_id: u32 },
    #[snafu(display(
        "cannot export buffer {handle:#x} of framebuffer {fb_id:#x}: {source}"
    ))]
    Export {
        fb_id: u32,
        handle: u32,
        source: io::Error,
    },
    #[snafu(display("more than {MAX_FRAMEBUFFERS} framebuffers to send"))]
    Capacity {},
    #[snafu(display("enumerated framebuffers are inconsistent: {source}"))]
    Inconsistent { source: ProtocolError },
}

impl EnumerationError {
    pub fn exit_code(&self) -> HelperExitCode {
        match self {
            EnumerationError::NoUsablePlanes { .. } => {
                HelperExitCode::NoUsablePlanes
            }
            EnumerationError::Export { .. } => HelperExitCode::Export,
            EnumerationError::Capacity { .. } => HelperExitCode::CapacityExceeded,
            EnumerationError::ListPlanes { .. }
            | EnumerationError::Inconsistent { .. } => HelperExitCode::Failure,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appended {
    Added,
    /// framebuffer id was already in the response
    Duplicate,
}

/// Accumulates framebuffer records and their exported descriptors. A buffer
/// object is exported once no matter how many planes or framebuffers use it.
#[derive(Debug, Default)]
pub struct ResponseBuilder {
    framebuffers: Vec<Framebuffer>,
    descriptors: Vec<OwnedFd>,
    slots: HashMap<u32, usize>,
}

impl ResponseBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.framebuffers.is_empty()
    }

    pub fn num_fds(&self) -> usize {
        self.descriptors.len()
    }

    pub fn contains(&self, fb_id: u32) -> bool {
        self.framebuffers.iter().any(|fb| fb.id == fb_id)
    }

    /// Adds `info`, exporting any buffer not seen before. On error the
    /// builder is left as it was.
    pub fn append(
        &mut self,
        info: &FramebufferInfo,
        mut export: impl FnMut(u32) -> io::Result<OwnedFd>,
    ) -> Result<Appended, EnumerationError> {
        if self.contains(info.id) {
            return Ok(Appended::Duplicate);
        }
        ensure!(self.framebuffers.len() < MAX_FRAMEBUFFERS, CapacitySnafu);

        // exports of this framebuffer only land once every plane succeeded
        let mut staged: Vec<(u32, OwnedFd)> = Vec::new();
        let mut planes = Vec::with_capacity(MAX_PLANES);
        for (i, &handle) in info.handles.iter().enumerate() {
            if handle == 0 {
                break;
            }
            let fd_index = if let Some(&slot) = self.slots.get(&handle) {
                slot
            } else if let Some(pos) = staged.iter().position(|(h, _)| *h == handle)
            {
                self.descriptors.len() + pos
            } else {
                let fd = export(handle).context(ExportSnafu {
                    fb_id: info.id,
                    handle,
                })?;
                staged.push((handle, fd));
                self.descriptors.len() + staged.len() - 1
            };
            debug!(
                fb = info.id,
                plane = i,
                handle,
                pitch = info.pitches[i],
                offset = info.offsets[i],
                fd_index,
                "plane"
            );
            planes.push(Plane {
                fd_index,
                pitch: info.pitches[i],
                offset: info.offsets[i],
            });
        }
        ensure!(!planes.is_empty(), NoUsablePlanesSnafu { fb_id: info.id });

        for (handle, fd) in staged {
            self.slots.insert(handle, self.descriptors.len());
            self.descriptors.push(fd);
        }
        self.framebuffers.push(Framebuffer {
            id: info.id,
            width: info.width,
            height: info.height,
            fourcc: info.fourcc,
            modifier: info.modifier,
            planes,
        });
        Ok(Appended::Added)
    }

    pub fn finish(self) -> Result<FramebufferList, EnumerationError> {
        let response = Response::new(self.framebuffers, self.descriptors.len())
            .context(InconsistentSnafu)?;
        FramebufferList::new(response, HandleTable::from(self.descriptors))
            .context(InconsistentSnafu)
    }
}

/// Collects every framebuffer currently shown on `device`. Planes that
/// can't be queried are skipped; export failures abort.
pub fn enumerate<D: ScanoutDevice + ?Sized>(
    device: &D,
) -> Result<FramebufferList, EnumerationError> {
    let planes = device.plane_ids().context(ListPlanesSnafu)?;
    info!(count = planes.len(), "found planes");
    if planes.is_empty() {
        warn!(
            "device reports no planes; without cap_sys_admin nothing will \
             be visible. Do `sudo setcap cap_sys_admin+ep` on the helper"
        );
    }

    let mut builder = ResponseBuilder::new();
    for (i, plane_id) in planes.into_iter().enumerate() {
        let fb_id = match device.plane_framebuffer(plane_id) {
            Ok(Some(fb_id)) => fb_id,
            Ok(None) => {
                debug!(plane = i, plane_id, "no framebuffer attached");
                continue;
            }
            Err(e) => {
                warn!(plane = i, plane_id, error = %e, "cannot get plane");
                continue;
            }
        };
        if builder.contains(fb_id) {
            info!(plane = i, fb_id, "framebuffer already listed, skipping");
            continue;
        }
        let fb = match device.framebuffer(fb_id) {
            Ok(fb) => fb,
            Err(e) => {
                warn!(plane = i, fb_id, error = %e, "cannot get framebuffer");
                continue;
            }
        };
        info!(
            plane = i,
            fb_id,
            width = fb.width,
            height = fb.height,
            fourcc = %fourcc_name(fb.fourcc),
            modifier = format_args!("{:#x}", fb.modifier),
            "framebuffer"
        );
        builder.append(&fb, |handle| device.export_buffer(handle))?;
    }

    info!(
        framebuffers = builder.len(),
        fds = builder.num_fds(),
        "enumeration done"
    );
    builder.finish()
}
