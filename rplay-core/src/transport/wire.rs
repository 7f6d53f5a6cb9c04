//! Wire formats for the network transport.
//!
//! ## Control stream (TCP)
//!
//! Each message is a big-endian `u32` length followed by a bincode-encoded
//! [`ControlMessage`].
//!
//! ## Video datagrams (UDP)
//!
//! **Fragment packet** (8 byte header + payload):
//! ```text
//! frame_index:     u32  (4)
//! fragment_index:  u16  (2)
//! fragment_count:  u16  (2)
//! data:            [u8] (variable)
//! ```
//! All header fields are little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::controller::ControllerState;
use crate::error::TransportError;
use crate::event::QuitReason;
use crate::profile::VideoProfile;
use crate::transport::{HostMessage, LoginRequest, RecoveryRequest, VideoFragment};

/// Control protocol revision sent in `Hello`.
pub const PROTOCOL_VERSION: u16 = 1;

/// Largest control message accepted.
pub const MAX_CONTROL_FRAME: usize = 64 * 1024;

/// Largest video datagram accepted.
pub const MAX_DATAGRAM: usize = 1500;

// ── ControlMessage ───────────────────────────────────────────────

/// Messages exchanged on the control stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlMessage {
    // client → host
    Hello {
        version: u16,
        login: LoginRequest,
        /// Local UDP port the client receives video on.
        video_port: u16,
    },
    Controller(ControllerState),
    Recovery(RecoveryRequest),
    Goodbye,

    // host → client
    LoginAccepted { profile: VideoProfile },
    LoginRejected { reason: QuitReason },
    Host(HostMessage),
}

/// Length-delimited bincode framing for [`ControlMessage`].
#[derive(Debug)]
pub struct ControlCodec {
    frames: LengthDelimitedCodec,
}

impl Default for ControlCodec {
    fn default() -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_CONTROL_FRAME)
                .new_codec(),
        }
    }
}

impl Decoder for ControlCodec {
    type Item = ControlMessage;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.frames.decode(src)? {
            Some(frame) => Ok(Some(bincode::deserialize(&frame)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<ControlMessage> for ControlCodec {
    type Error = TransportError;

    fn encode(&mut self, item: ControlMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = bincode::serialize(&item)?;
        self.frames.encode(Bytes::from(payload), dst)?;
        Ok(())
    }
}

// ── FragmentHeader ───────────────────────────────────────────────

/// Per-fragment metadata prepended to each video datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub frame_index: u32,
    pub fragment_index: u16,
    pub fragment_count: u16,
}

impl FragmentHeader {
    /// Encoded size on the wire.
    pub const SIZE: usize = 8;

    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u32_le(self.frame_index);
        dst.put_u16_le(self.fragment_index);
        dst.put_u16_le(self.fragment_count);
    }

    pub fn decode(mut src: &[u8]) -> Result<Self, TransportError> {
        if src.len() < Self::SIZE {
            return Err(TransportError::Protocol(format!(
                "fragment header too short: {} < {}",
                src.len(),
                Self::SIZE
            )));
        }
        Ok(Self {
            frame_index: src.get_u32_le(),
            fragment_index: src.get_u16_le(),
            fragment_count: src.get_u16_le(),
        })
    }
}

impl VideoFragment {
    /// Header plus payload, ready to send.
    pub fn to_datagram(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FragmentHeader::SIZE + self.payload.len());
        FragmentHeader {
            frame_index: self.frame_index,
            fragment_index: self.fragment_index,
            fragment_count: self.fragment_count,
        }
        .encode(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a datagram; the payload shares `datagram`'s storage.
    pub fn from_datagram(mut datagram: Bytes) -> Result<Self, TransportError> {
        let header = FragmentHeader::decode(&datagram)?;
        let payload = datagram.split_off(FragmentHeader::SIZE);
        Ok(Self {
            frame_index: header.frame_index,
            fragment_index: header.fragment_index,
            fragment_count: header.fragment_count,
            payload,
        })
    }

    /// Split `data` into fragments whose datagrams fit in `mtu` bytes.
    ///
    /// Fails if the frame would need more fragments than the header can
    /// count.
    pub fn split(frame_index: u32, data: &[u8], mtu: usize) -> Result<Vec<VideoFragment>, TransportError> {
        let max_payload = mtu.saturating_sub(FragmentHeader::SIZE).max(1);
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![data]
        } else {
            data.chunks(max_payload).collect()
        };
        let count = u16::try_from(chunks.len()).map_err(|_| {
            TransportError::Protocol(format!(
                "frame {frame_index} needs {} fragments, at most {} allowed",
                chunks.len(),
                u16::MAX
            ))
        })?;
        Ok((0..count)
            .zip(chunks)
            .map(|(idx, chunk)| VideoFragment {
                frame_index,
                fragment_index: idx,
                fragment_count: count,
                payload: Bytes::copy_from_slice(chunk),
            })
            .collect())
    }
}
