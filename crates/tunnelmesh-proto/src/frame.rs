//! Session frame codec

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::payload::{ClientAdvert, ConnectRequest};

/// Virtual connection identifier, unique within one session
pub type ConnId = u64;

/// Frame kinds carried over a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Open a connection to the address in the payload
    Connect = 0,
    /// The dialed side reached its target
    Connected = 1,
    /// Connection bytes
    Data = 2,
    /// The sender will write no more bytes on this connection
    Fin = 3,
    /// Connection torn down; payload is an error message or empty
    Close = 4,
    /// A client key became reachable through the sender
    AddClient = 5,
    /// A client key is no longer reachable through the sender
    RemoveClient = 6,
    /// The receiver consumed bytes; payload is the credit returned (u32, BE)
    Window = 7,
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameKind::Connect),
            1 => Ok(FrameKind::Connected),
            2 => Ok(FrameKind::Data),
            3 => Ok(FrameKind::Fin),
            4 => Ok(FrameKind::Close),
            5 => Ok(FrameKind::AddClient),
            6 => Ok(FrameKind::RemoveClient),
            7 => Ok(FrameKind::Window),
            _ => Err(FrameError::InvalidKind(value)),
        }
    }
}

/// Frame codec errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Invalid frame kind: {0}")]
    InvalidKind(u8),

    #[error("Incomplete frame ({0} bytes)")]
    Incomplete(usize),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

/// A single session frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub conn_id: ConnId,
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    /// Header size: conn id (8) + kind (1)
    pub const HEADER_SIZE: usize = 9;

    pub fn new(conn_id: ConnId, kind: FrameKind, payload: Bytes) -> Self {
        Self {
            conn_id,
            kind,
            payload,
        }
    }

    pub fn connect(conn_id: ConnId, request: &ConnectRequest) -> Result<Self, FrameError> {
        let payload = bincode::serialize(request)
            .map_err(|e| FrameError::InvalidPayload(e.to_string()))?;
        Ok(Self::new(conn_id, FrameKind::Connect, Bytes::from(payload)))
    }

    pub fn connected(conn_id: ConnId) -> Self {
        Self::new(conn_id, FrameKind::Connected, Bytes::new())
    }

    pub fn data(conn_id: ConnId, payload: Bytes) -> Self {
        Self::new(conn_id, FrameKind::Data, payload)
    }

    pub fn fin(conn_id: ConnId) -> Self {
        Self::new(conn_id, FrameKind::Fin, Bytes::new())
    }

    /// Close a connection. `None` is a graceful close.
    pub fn close(conn_id: ConnId, error: Option<&str>) -> Self {
        let payload = error
            .map(|e| Bytes::copy_from_slice(e.as_bytes()))
            .unwrap_or_default();
        Self::new(conn_id, FrameKind::Close, payload)
    }

    /// Return `credit` bytes of send window to the far side
    pub fn window(conn_id: ConnId, credit: u32) -> Self {
        Self::new(
            conn_id,
            FrameKind::Window,
            Bytes::copy_from_slice(&credit.to_be_bytes()),
        )
    }

    pub fn add_client(advert: &ClientAdvert) -> Result<Self, FrameError> {
        Self::advert(FrameKind::AddClient, advert)
    }

    pub fn remove_client(advert: &ClientAdvert) -> Result<Self, FrameError> {
        Self::advert(FrameKind::RemoveClient, advert)
    }

    fn advert(kind: FrameKind, advert: &ClientAdvert) -> Result<Self, FrameError> {
        let payload =
            bincode::serialize(advert).map_err(|e| FrameError::InvalidPayload(e.to_string()))?;
        // Adverts are session-wide, conn id 0 is never allocated
        Ok(Self::new(0, kind, Bytes::from(payload)))
    }

    /// Encode to the bytes of one binary WebSocket message
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + self.payload.len());
        buf.put_u64(self.conn_id);
        buf.put_u8(self.kind as u8);
        buf.put_slice(&self.payload);
        buf.to_vec()
    }

    /// Decode one binary WebSocket message
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < Self::HEADER_SIZE {
            return Err(FrameError::Incomplete(data.len()));
        }

        let mut buf = data;
        let conn_id = buf.get_u64();
        let kind = FrameKind::try_from(buf.get_u8())?;

        Ok(Self {
            conn_id,
            kind,
            payload: Bytes::copy_from_slice(buf),
        })
    }

    /// Parse the payload of a `Connect` frame
    pub fn connect_request(&self) -> Result<ConnectRequest, FrameError> {
        bincode::deserialize(&self.payload).map_err(|e| FrameError::InvalidPayload(e.to_string()))
    }

    /// Parse the payload of an `AddClient` / `RemoveClient` frame
    pub fn client_advert(&self) -> Result<ClientAdvert, FrameError> {
        bincode::deserialize(&self.payload).map_err(|e| FrameError::InvalidPayload(e.to_string()))
    }

    /// Credit carried by a `Window` frame
    pub fn window_credit(&self) -> Result<u32, FrameError> {
        let bytes: [u8; 4] = self.payload.as_ref().try_into().map_err(|_| {
            FrameError::InvalidPayload(format!("window frame of {} bytes", self.payload.len()))
        })?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Error text of a `Close` frame, `None` when the close was graceful
    pub fn close_reason(&self) -> Option<String> {
        if self.payload.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.payload).into_owned())
        }
    }
}
