use std::{
    fs::{File, OpenOptions},
    io,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    path::Path,
};

use drm::{
    ClientCapability, Device, buffer,
    control::{self, Device as ControlDevice, framebuffer, plane},
};
use rustix::fs::OFlags;
use tracing::warn;

use crate::enumerate::{FramebufferInfo, ScanoutDevice};

/// An opened DRM card node.
#[derive(Debug)]
pub struct DrmCard(File);

impl AsFd for DrmCard {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl Device for DrmCard {}
impl ControlDevice for DrmCard {}

impl DrmCard {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        let card = Self(file);
        // without this only primary planes are listed
        if let Err(e) =
            card.set_client_capability(ClientCapability::UniversalPlanes, true)
        {
            warn!(
                error = %e,
                "cannot enable universal planes, the rest will very likely fail"
            );
        }
        Ok(card)
    }
}

fn handle<T: From<control::RawResourceHandle>>(raw: u32) -> io::Result<T> {
    control::from_u32(raw).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "null resource handle")
    })
}

impl ScanoutDevice for DrmCard {
    fn plane_ids(&self) -> io::Result<Vec<u32>> {
        Ok(self
            .plane_handles()?
            .into_iter()
            .map(u32::from)
            .collect())
    }

    fn plane_framebuffer(&self, plane_id: u32) -> io::Result<Option<u32>> {
        let info = self.get_plane(handle::<plane::Handle>(plane_id)?)?;
        Ok(info.framebuffer().map(u32::from))
    }

    fn framebuffer(&self, fb_id: u32) -> io::Result<FramebufferInfo> {
        let info = self
            .get_planar_framebuffer(handle::<framebuffer::Handle>(fb_id)?)
            .map_err(|e| io::Error::other(format!("{e:?}")))?;
        let (width, height) = info.size();
        Ok(FramebufferInfo {
            id: fb_id,
            width,
            height,
            fourcc: info.pixel_format() as u32,
            modifier: info.modifier().map_or(0, u64::from),
            handles: info.buffers().map(|b| b.map_or(0, u32::from)),
            pitches: info.pitches(),
            offsets: info.offsets(),
        })
    }

    fn export_buffer(&self, raw: u32) -> io::Result<OwnedFd> {
        // read only, the consumer never writes into scanout buffers
        self.buffer_to_prime_fd(
            handle::<buffer::Handle>(raw)?,
            (OFlags::RDONLY | OFlags::CLOEXEC).bits(),
        )
    }
}
