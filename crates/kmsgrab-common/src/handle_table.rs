use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use snafu::ensure;

use crate::{
    protocol_common::{
        FdCountMismatchSnafu, Framebuffer, ProtocolError, Response, decode,
    },
    transport::TransportMessage,
};

/// Owned descriptors received from (or about to be sent to) the peer,
/// indexed by slot. Dropping the table closes every descriptor exactly once.
#[derive(Debug, Default)]
pub struct HandleTable {
    fds: Vec<OwnedFd>,
}

impl HandleTable {
    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    pub fn get(&self, slot: usize) -> Option<BorrowedFd<'_>> {
        self.fds.get(slot).map(AsFd::as_fd)
    }

    pub fn iter(&self) -> impl Iterator<Item = BorrowedFd<'_>> {
        self.fds.iter().map(AsFd::as_fd)
    }

    /// Closes everything, returning how many descriptors were closed.
    pub fn close(self) -> usize {
        let closed = self.fds.len();
        drop(self.fds);
        closed
    }

    pub fn into_inner(self) -> Vec<OwnedFd> {
        self.fds
    }
}

impl From<Vec<OwnedFd>> for HandleTable {
    fn from(fds: Vec<OwnedFd>) -> Self {
        Self { fds }
    }
}

/// Validated metadata paired with the descriptors it refers to.
#[derive(Debug, Default)]
pub struct FramebufferList {
    response: Response,
    handles: HandleTable,
}

impl FramebufferList {
    pub fn new(
        response: Response,
        handles: HandleTable,
    ) -> Result<Self, ProtocolError> {
        ensure!(
            response.num_fds() == handles.len(),
            FdCountMismatchSnafu {
                received: handles.len(),
                declared: response.num_fds() as i64,
            }
        );
        Ok(Self { response, handles })
    }

    /// Decodes a received message. On error every received descriptor is
    /// closed before returning.
    pub fn from_message(
        message: TransportMessage,
    ) -> Result<Self, ProtocolError> {
        let TransportMessage {
            payload,
            descriptors,
        } = message;
        let response = decode(&payload, descriptors.len())?;
        Self::new(response, descriptors.into())
    }

    pub fn into_message(self) -> TransportMessage {
        TransportMessage {
            payload: self.response.encode(),
            descriptors: self.handles.into_inner(),
        }
    }

    pub fn framebuffers(&self) -> &[Framebuffer] {
        self.response.framebuffers()
    }

    pub fn find(&self, id: u32) -> Option<&Framebuffer> {
        self.framebuffers().iter().find(|fb| fb.id == id)
    }

    /// Descriptor of each plane of `fb`, in plane order.
    pub fn plane_fds<'a>(&'a self, fb: &Framebuffer) -> Vec<BorrowedFd<'a>> {
        fb.planes
            .iter()
            .filter_map(|plane| self.handles.get(plane.fd_index))
            .collect()
    }

    pub fn num_fds(&self) -> usize {
        self.handles.len()
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn close(self) -> usize {
        self.handles.close()
    }
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io::Read, os::fd::OwnedFd};

    use rustix::pipe::{PipeFlags, pipe_with};

    use super::*;
    use crate::protocol_common::{Plane, WireResponse};

    fn pipe() -> (OwnedFd, OwnedFd) {
        pipe_with(PipeFlags::CLOEXEC | PipeFlags::NONBLOCK)
            .expect("pipe2 failed")
    }

    fn is_closed(read_end: &OwnedFd) -> bool {
        let mut file = File::from(read_end.try_clone().expect("dup failed"));
        let mut buf = [0u8; 1];
        matches!(file.read(&mut buf), Ok(0))
    }

    fn one_framebuffer() -> Response {
        Response::new(
            vec![Framebuffer {
                id: 0x42,
                width: 640,
                height: 480,
                fourcc: 0x3432_5258,
                modifier: 0,
                planes: vec![Plane {
                    fd_index: 0,
                    pitch: 2560,
                    offset: 0,
                }],
            }],
            1,
        )
        .expect("valid response")
    }

    #[test]
    fn test_from_message_maps_planes_to_descriptors() {
        let (read_end, write_end) = pipe();
        let message = TransportMessage {
            payload: one_framebuffer().encode(),
            descriptors: vec![write_end],
        };

        let list = FramebufferList::from_message(message).expect("decodes");
        let fb = list.find(0x42).expect("framebuffer present").clone();
        assert_eq!(list.plane_fds(&fb).len(), 1);
        assert_eq!(list.num_fds(), 1);
        assert!(list.find(0x43).is_none());

        assert!(!is_closed(&read_end));
        assert_eq!(list.close(), 1);
        assert!(is_closed(&read_end));
    }

    #[test]
    fn test_rejected_message_closes_descriptors() {
        let (read_end, write_end) = pipe();
        let mut payload = one_framebuffer().encode();
        payload[..4].copy_from_slice(&0xdead_beef_u32.to_ne_bytes());
        let message = TransportMessage {
            payload,
            descriptors: vec![write_end],
        };

        let err = FramebufferList::from_message(message).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::TagMismatch {
                received: 0xdead_beef,
                expected: WireResponse::TAG,
            }
        );
        assert!(is_closed(&read_end));
    }

    #[test]
    fn test_new_rejects_table_size_mismatch() {
        let err = FramebufferList::new(one_framebuffer(), HandleTable::default())
            .unwrap_err();
        assert!(matches!(err, ProtocolError::FdCountMismatch { .. }));
    }
}
