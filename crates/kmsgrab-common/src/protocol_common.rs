use std::collections::HashSet;

use bytemuck::{Pod, Zeroable};
use drm_fourcc::DrmFourcc;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use snafu::{Snafu, ensure};

/// Most framebuffers a single response can carry.
pub const MAX_FRAMEBUFFERS: usize = 16;
/// Most memory planes per framebuffer.
pub const MAX_PLANES: usize = 4;
/// Most descriptors a single response can carry.
pub const MAX_FDS: usize = MAX_FRAMEBUFFERS * MAX_PLANES;

// layout is shared with the helper binary, which may be built separately.
// explicit reserved fields so there's no implicit padding for Pod to reject

#[repr(C)]
#[derive(Clone, Copy, Debug, Zeroable, Pod)]
pub struct WireFramebuffer {
    pub id: u32,
    pub width: i32,
    pub height: i32,
    pub fourcc: u32,
    pub modifier: u64,
    pub plane_count: i32,
    /// slot in the descriptor table, -1 for unused planes
    pub fd_indexes: [i32; MAX_PLANES],
    pub pitches: [u32; MAX_PLANES],
    pub offsets: [u32; MAX_PLANES],
    pub reserved: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Zeroable, Pod)]
pub struct WireResponse {
    pub tag: u32,
    pub num_framebuffers: i32,
    pub num_fds: i32,
    pub reserved: u32,
    pub framebuffers: [WireFramebuffer; MAX_FRAMEBUFFERS],
}

impl WireResponse {
    pub const TAG: u32 = 0x0b50_0002;
    pub const SIZE: usize = std::mem::size_of::<WireResponse>();
}

#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum ProtocolError {
    #[snafu(display(
        "metadata is {received} bytes, expected {expected}; helper and \
         consumer were likely built from different versions"
    ))]
    SizeMismatch { received: usize, expected: usize },
    #[snafu(display(
        "metadata tag is {received:#x}, expected {expected:#x}"
    ))]
    TagMismatch { received: u32, expected: u32 },
    #[snafu(display(
        "got {received} descriptors but metadata declares {declared}"
    ))]
    FdCountMismatch { received: usize, declared: i64 },
    #[snafu(display(
        "{count} framebuffers declared, at most {MAX_FRAMEBUFFERS} fit"
    ))]
    FramebufferCount { count: i64 },
    #[snafu(display("descriptor slot {slot} is not used by any plane"))]
    UnreferencedFd { slot: usize },
    #[snafu(display("framebuffer record {index} is invalid: {reason}"))]
    InvalidRecord { index: usize, reason: &'static str },
}

/// One memory plane of a framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plane {
    pub fd_index: usize,
    pub pitch: u32,
    pub offset: u32,
}

/// A scanout framebuffer as seen by the consumer. `modifier` applies to every
/// plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Framebuffer {
    pub id: u32,
    pub width: u32,
    pub height: u32,
    pub fourcc: u32,
    pub modifier: u64,
    pub planes: Vec<Plane>,
}

impl Framebuffer {
    /// Label used when offering the framebuffer for selection.
    pub fn label(&self) -> String {
        format!("{}x{} ({:#x})", self.width, self.height, self.id)
    }

    fn check(&self, num_fds: usize) -> Result<(), &'static str> {
        if self.width == 0 || self.height == 0 {
            return Err("zero-sized framebuffer");
        }
        if i32::try_from(self.width).is_err()
            || i32::try_from(self.height).is_err()
        {
            return Err("dimensions do not fit the wire format");
        }
        if self.planes.is_empty() || self.planes.len() > MAX_PLANES {
            return Err("plane count outside 1..=4");
        }
        if self.planes.iter().any(|p| p.fd_index >= num_fds) {
            return Err("plane refers to a missing descriptor");
        }
        Ok(())
    }

    fn to_wire(&self) -> WireFramebuffer {
        let mut wire = WireFramebuffer {
            id: self.id,
            width: self.width as i32,
            height: self.height as i32,
            fourcc: self.fourcc,
            modifier: self.modifier,
            plane_count: self.planes.len() as i32,
            fd_indexes: [-1; MAX_PLANES],
            pitches: [0; MAX_PLANES],
            offsets: [0; MAX_PLANES],
            reserved: 0,
        };
        for (i, plane) in self.planes.iter().enumerate() {
            wire.fd_indexes[i] = plane.fd_index as i32;
            wire.pitches[i] = plane.pitch;
            wire.offsets[i] = plane.offset;
        }
        wire
    }

    fn from_wire(wire: &WireFramebuffer) -> Result<Self, &'static str> {
        let width = u32::try_from(wire.width).map_err(|_| "negative width")?;
        let height =
            u32::try_from(wire.height).map_err(|_| "negative height")?;
        let plane_count = usize::try_from(wire.plane_count)
            .ok()
            .filter(|n| (1..=MAX_PLANES).contains(n))
            .ok_or("plane count outside 1..=4")?;
        let planes = (0..plane_count)
            .map(|i| {
                let fd_index = usize::try_from(wire.fd_indexes[i])
                    .map_err(|_| "negative descriptor index")?;
                Ok(Plane {
                    fd_index,
                    pitch: wire.pitches[i],
                    offset: wire.offsets[i],
                })
            })
            .collect::<Result<Vec<_>, &'static str>>()?;
        Ok(Self {
            id: wire.id,
            width,
            height,
            fourcc: wire.fourcc,
            modifier: wire.modifier,
            planes,
        })
    }
}

/// Validated framebuffer metadata. Says nothing about the descriptors
/// themselves beyond how many there are.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    framebuffers: Vec<Framebuffer>,
    num_fds: usize,
}

impl Response {
    pub fn new(
        framebuffers: Vec<Framebuffer>,
        num_fds: usize,
    ) -> Result<Self, ProtocolError> {
        ensure!(
            framebuffers.len() <= MAX_FRAMEBUFFERS,
            FramebufferCountSnafu {
                count: framebuffers.len() as i64,
            }
        );
        ensure!(
            num_fds <= MAX_FDS,
            FdCountMismatchSnafu {
                received: num_fds,
                declared: MAX_FDS as i64,
            }
        );

        let mut ids = HashSet::with_capacity(framebuffers.len());
        let mut referenced = vec![false; num_fds];
        for (index, fb) in framebuffers.iter().enumerate() {
            fb.check(num_fds)
                .map_err(|reason| ProtocolError::InvalidRecord { index, reason })?;
            ensure!(
                ids.insert(fb.id),
                InvalidRecordSnafu {
                    index,
                    reason: "duplicate framebuffer id",
                }
            );
            for plane in &fb.planes {
                referenced[plane.fd_index] = true;
            }
        }
        if let Some(slot) = referenced.iter().position(|used| !used) {
            return UnreferencedFdSnafu { slot }.fail();
        }

        Ok(Self {
            framebuffers,
            num_fds,
        })
    }

    pub fn framebuffers(&self) -> &[Framebuffer] {
        &self.framebuffers
    }

    pub fn num_fds(&self) -> usize {
        self.num_fds
    }

    pub fn is_empty(&self) -> bool {
        self.framebuffers.is_empty()
    }

    /// Serializes into the fixed-size metadata message.
    pub fn encode(&self) -> Vec<u8> {
        let mut wire = WireResponse::zeroed();
        wire.tag = WireResponse::TAG;
        wire.num_framebuffers = self.framebuffers.len() as i32;
        wire.num_fds = self.num_fds as i32;
        for (slot, fb) in wire.framebuffers.iter_mut().zip(&self.framebuffers)
        {
            *slot = fb.to_wire();
        }
        bytemuck::bytes_of(&wire).to_vec()
    }
}

/// Parses a metadata message received alongside `received_fds` descriptors.
///
/// Checks run in order: size, tag, descriptor count, then each record.
pub fn decode(
    payload: &[u8],
    received_fds: usize,
) -> Result<Response, ProtocolError> {
    ensure!(
        payload.len() == WireResponse::SIZE,
        SizeMismatchSnafu {
            received: payload.len(),
            expected: WireResponse::SIZE,
        }
    );
    let wire: WireResponse = bytemuck::pod_read_unaligned(payload);
    ensure!(
        wire.tag == WireResponse::TAG,
        TagMismatchSnafu {
            received: wire.tag,
            expected: WireResponse::TAG,
        }
    );
    ensure!(
        usize::try_from(wire.num_fds).is_ok_and(|n| n == received_fds),
        FdCountMismatchSnafu {
            received: received_fds,
            declared: i64::from(wire.num_fds),
        }
    );
    let count = usize::try_from(wire.num_framebuffers)
        .ok()
        .filter(|n| *n <= MAX_FRAMEBUFFERS);
    let Some(count) = count else {
        return FramebufferCountSnafu {
            count: i64::from(wire.num_framebuffers),
        }
        .fail();
    };

    let framebuffers = wire.framebuffers[..count]
        .iter()
        .enumerate()
        .map(|(index, fb)| {
            Framebuffer::from_wire(fb)
                .map_err(|reason| ProtocolError::InvalidRecord { index, reason })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Response::new(framebuffers, received_fds)
}

/// Exit status of the helper binary. The consumer uses it to tell
/// enumeration failures apart when the helper hangs up without a message.
#[repr(u8)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive,
)]
pub enum HelperExitCode {
    Success = 0,
    Failure = 1,
    /// clap exits with 2 on bad arguments
    Usage = 2,
    DeviceOpen = 3,
    NoUsablePlanes = 4,
    CapacityExceeded = 5,
    Export = 6,
    Transport = 7,
}

impl HelperExitCode {
    pub fn from_exit_code(code: i32) -> Option<Self> {
        u8::try_from(code)
            .ok()
            .and_then(|c| Self::try_from(c).ok())
    }
}

impl From<HelperExitCode> for std::process::ExitCode {
    fn from(code: HelperExitCode) -> Self {
        std::process::ExitCode::from(u8::from(code))
    }
}

/// Human readable name of a fourcc code, for logs.
pub fn fourcc_name(fourcc: u32) -> String {
    match DrmFourcc::try_from(fourcc) {
        Ok(known) => format!("{known:?}"),
        Err(_) => {
            let bytes = fourcc.to_le_bytes();
            if bytes.iter().all(u8::is_ascii_graphic) {
                String::from_utf8_lossy(&bytes).into_owned()
            } else {
                format!("{fourcc:#010x}")
            }
        }
    }
}
