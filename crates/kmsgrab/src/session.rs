use std::{
    os::fd::BorrowedFd,
    path::{Path, PathBuf},
};

use kmsgrab_common::{
    handle_table::FramebufferList, protocol_common::Framebuffer,
};
use tracing::{debug, error, info};

use crate::{
    broker::{Broker, BrokerError},
    supervisor::{Launcher, ProcessLauncher},
};

/// One plane as an EGL dma-buf import wants it.
#[derive(Debug, Clone, Copy)]
pub struct DmabufPlane<'a> {
    pub fd: BorrowedFd<'a>,
    pub pitch: u32,
    pub offset: u32,
    pub modifier: u64,
}

/// Everything needed to import the selected framebuffer as an image.
#[derive(Debug, Clone)]
pub struct DmabufImport<'a> {
    pub width: u32,
    pub height: u32,
    pub fourcc: u32,
    pub planes: Vec<DmabufPlane<'a>>,
}

/// Holds the descriptors of the latest fetch and which framebuffer is
/// being captured.
#[derive(Debug)]
pub struct CaptureSession<L: Launcher = ProcessLauncher> {
    broker: Broker<L>,
    device: PathBuf,
    framebuffers: Option<FramebufferList>,
    active: Option<usize>,
}

impl<L: Launcher> CaptureSession<L> {
    /// Fetches the framebuffers of `device`; fails if the first fetch
    /// fails.
    pub fn open(
        broker: Broker<L>,
        device: impl Into<PathBuf>,
    ) -> Result<Self, BrokerError> {
        let mut session = Self {
            broker,
            device: device.into(),
            framebuffers: None,
            active: None,
        };
        session.refresh()?;
        Ok(session)
    }

    /// Switches to `device`. The previous descriptors are closed before the
    /// new fetch starts, and stay closed if it fails.
    pub fn reconfigure(
        &mut self,
        device: impl Into<PathBuf>,
    ) -> Result<&FramebufferList, BrokerError> {
        self.device = device.into();
        self.refresh()
    }

    pub fn refresh(&mut self) -> Result<&FramebufferList, BrokerError> {
        self.release();
        let list = self.broker.fetch(&self.device)?;
        Ok(self.framebuffers.insert(list))
    }

    /// Closes every held descriptor. Returns how many were closed.
    pub fn release(&mut self) -> usize {
        self.active = None;
        let closed = self.framebuffers.take().map_or(0, FramebufferList::close);
        if closed > 0 {
            debug!(closed, "released framebuffer descriptors");
        }
        closed
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    pub fn broker(&self) -> &Broker<L> {
        &self.broker
    }

    pub fn framebuffers(&self) -> Option<&FramebufferList> {
        self.framebuffers.as_ref()
    }

    /// `(id, label)` for every framebuffer, in the order the helper listed
    /// them.
    pub fn framebuffer_labels(&self) -> Vec<(u32, String)> {
        self.framebuffers
            .iter()
            .flat_map(FramebufferList::framebuffers)
            .map(|fb| (fb.id, fb.label()))
            .collect()
    }

    /// Makes `fb_id` the captured framebuffer. With an unknown id nothing is
    /// selected afterwards.
    pub fn select(&mut self, fb_id: u32) -> Option<&Framebuffer> {
        self.active = None;
        let index = self
            .framebuffers
            .as_ref()?
            .framebuffers()
            .iter()
            .position(|fb| fb.id == fb_id);
        let Some(index) = index else {
            error!(fb_id = format_args!("{fb_id:#x}"), "framebuffer not found");
            return None;
        };
        self.active = Some(index);
        let fb = self.active_framebuffer()?;
        info!(
            fb_id = format_args!("{fb_id:#x}"),
            width = fb.width,
            height = fb.height,
            "selected framebuffer"
        );
        Some(fb)
    }

    pub fn active_framebuffer(&self) -> Option<&Framebuffer> {
        let list = self.framebuffers.as_ref()?;
        list.framebuffers().get(self.active?)
    }

    /// Size of the selected framebuffer, `(0, 0)` with nothing selected.
    pub fn dimensions(&self) -> (u32, u32) {
        self.active_framebuffer()
            .map_or((0, 0), |fb| (fb.width, fb.height))
    }

    /// Import parameters for the selected framebuffer. The framebuffer
    /// modifier is repeated for every plane.
    pub fn import_descriptor(&self) -> Option<DmabufImport<'_>> {
        let list = self.framebuffers.as_ref()?;
        let fb = list.framebuffers().get(self.active?)?;
        let planes = fb
            .planes
            .iter()
            .zip(list.plane_fds(fb))
            .map(|(plane, fd)| DmabufPlane {
                fd,
                pitch: plane.pitch,
                offset: plane.offset,
                modifier: fb.modifier,
            })
            .collect();
        Some(DmabufImport {
            width: fb.width,
            height: fb.height,
            fourcc: fb.fourcc,
            planes,
        })
    }

    /// Ends the session, returning how many descriptors were closed.
    pub fn close(mut self) -> usize {
        self.release()
    }
}
