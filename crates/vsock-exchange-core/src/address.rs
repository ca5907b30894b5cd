//! Virtual-socket address descriptor.
//!
//! The descriptor mirrors the transport's `sockaddr_vm` layout:
//!
//! ```text
//! [u16 family][u16 reserved=0][u32 port][u32 cid][u8 flags][u8; 3 zero]
//! ```
//!
//! Encoded little-endian, the struct occupies [`ENCODED_LEN`] bytes. The
//! declared address length carried alongside it is [`DESCRIPTOR_LEN`].
//!
//! One value type serves every role; the role is fixed by the constructor
//! ([`AddressDescriptor::bind`], [`AddressDescriptor::peer`],
//! [`AddressDescriptor::remote`]) and descriptors are never mutated afterwards.

use crate::error::{ExchangeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Address family tag for virtual sockets (`AF_VSOCK` on Linux).
pub const AF_VSOCK: u16 = 40;

/// Declared address length handed to the transport alongside a descriptor.
pub const DESCRIPTOR_LEN: u32 = 11;

/// Size of the encoded descriptor struct.
pub const ENCODED_LEN: usize = 16;

/// Wildcard context identifier (bind to any local context).
pub const CID_ANY: u32 = u32::MAX;
/// Context identifier of the hypervisor.
pub const CID_HYPERVISOR: u32 = 0;
/// Local loopback context identifier.
pub const CID_LOCAL: u32 = 1;
/// Context identifier of the host.
pub const CID_HOST: u32 = 2;

/// Wildcard port (let the transport pick one).
pub const PORT_ANY: u32 = u32::MAX;

/// The role a descriptor was created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressRole {
    /// Local address a listening socket binds to.
    Bind,
    /// Address of a peer returned by accept.
    Peer,
    /// Address a connecting socket targets.
    Remote,
    /// Address a socket ended up with locally (reported by the transport).
    Local,
}

/// Fixed-layout virtual-socket endpoint address.
///
/// Deserialized values go through the same checks as [`AddressDescriptor::from_bytes`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "DescriptorFields")]
pub struct AddressDescriptor {
    family: u16,
    reserved: u16,
    port: u32,
    cid: u32,
    flags: u8,
    len: u32,
    role: AddressRole,
}

impl AddressDescriptor {
    fn with_role(cid: u32, port: u32, role: AddressRole) -> Self {
        Self {
            family: AF_VSOCK,
            reserved: 0,
            port,
            cid,
            flags: 0,
            len: DESCRIPTOR_LEN,
            role,
        }
    }

    /// Address a server binds its listening socket to.
    pub fn bind(cid: u32, port: u32) -> Self {
        Self::with_role(cid, port, AddressRole::Bind)
    }

    /// Address of a peer, as reported when a connection is accepted.
    pub fn peer(cid: u32, port: u32) -> Self {
        Self::with_role(cid, port, AddressRole::Peer)
    }

    /// Address a client connects to.
    pub fn remote(cid: u32, port: u32) -> Self {
        Self::with_role(cid, port, AddressRole::Remote)
    }

    /// Address a socket is locally bound to, as reported by the transport.
    pub fn local(cid: u32, port: u32) -> Self {
        Self::with_role(cid, port, AddressRole::Local)
    }

    pub fn family(&self) -> u16 {
        self.family
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    pub fn cid(&self) -> u32 {
        self.cid
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// Declared address length (always [`DESCRIPTOR_LEN`]).
    pub fn declared_len(&self) -> u32 {
        self.len
    }

    pub fn role(&self) -> AddressRole {
        self.role
    }

    /// Returns `true` if both descriptors name the same `(cid, port)` endpoint,
    /// regardless of the role they were created for.
    pub fn same_endpoint(&self, other: &AddressDescriptor) -> bool {
        self.cid == other.cid && self.port == other.port
    }

    /// Encode into the little-endian `sockaddr_vm` layout.
    pub fn to_bytes(&self) -> [u8; ENCODED_LEN] {
        let mut out = [0u8; ENCODED_LEN];
        out[0..2].copy_from_slice(&self.family.to_le_bytes());
        out[2..4].copy_from_slice(&self.reserved.to_le_bytes());
        out[4..8].copy_from_slice(&self.port.to_le_bytes());
        out[8..12].copy_from_slice(&self.cid.to_le_bytes());
        out[12] = self.flags;
        // out[13..16] stays zero
        out
    }

    /// Decode a descriptor from its encoded layout.
    ///
    /// Rejects buffers of the wrong size, a foreign family tag, a non-zero
    /// reserved field and non-zero padding.
    pub fn from_bytes(bytes: &[u8], role: AddressRole) -> Result<Self> {
        if bytes.len() != ENCODED_LEN {
            return Err(ExchangeError::InvalidDescriptor {
                reason: format!("expected {} bytes, got {}", ENCODED_LEN, bytes.len()),
            });
        }

        check_header(
            u16::from_le_bytes([bytes[0], bytes[1]]),
            u16::from_le_bytes([bytes[2], bytes[3]]),
        )?;

        if bytes[13..16].iter().any(|b| *b != 0) {
            return Err(ExchangeError::InvalidDescriptor {
                reason: "padding bytes must be zero".to_string(),
            });
        }

        let port = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let cid = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);

        Ok(Self {
            flags: bytes[12],
            ..Self::with_role(cid, port, role)
        })
    }
}

fn check_header(family: u16, reserved: u16) -> Result<()> {
    if family != AF_VSOCK {
        return Err(ExchangeError::InvalidDescriptor {
            reason: format!("unexpected address family {}", family),
        });
    }
    if reserved != 0 {
        return Err(ExchangeError::InvalidDescriptor {
            reason: format!("reserved field must be zero, got {:#06x}", reserved),
        });
    }
    Ok(())
}

/// Serialized form of a descriptor before validation.
#[derive(Deserialize)]
struct DescriptorFields {
    family: u16,
    reserved: u16,
    port: u32,
    cid: u32,
    flags: u8,
    len: u32,
    role: AddressRole,
}

impl TryFrom<DescriptorFields> for AddressDescriptor {
    type Error = ExchangeError;

    fn try_from(fields: DescriptorFields) -> Result<Self> {
        check_header(fields.family, fields.reserved)?;
        if fields.len != DESCRIPTOR_LEN {
            return Err(ExchangeError::InvalidDescriptor {
                reason: format!(
                    "declared length must be {}, got {}",
                    DESCRIPTOR_LEN, fields.len
                ),
            });
        }

        Ok(Self {
            flags: fields.flags,
            ..Self::with_role(fields.cid, fields.port, fields.role)
        })
    }
}

impl fmt::Display for AddressDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cid: {} port: {}", self.cid, self.port)
    }
}

impl fmt::Debug for AddressDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self.role, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_constructors_set_role() {
        assert_eq!(AddressDescriptor::bind(33, 1234).role(), AddressRole::Bind);
        assert_eq!(AddressDescriptor::peer(3, 40000).role(), AddressRole::Peer);
        assert_eq!(AddressDescriptor::remote(2, 1234).role(), AddressRole::Remote);
    }

    #[test]
    fn test_descriptor_defaults() {
        let addr = AddressDescriptor::bind(33, 1234);
        assert_eq!(addr.family(), AF_VSOCK);
        assert_eq!(addr.flags(), 0);
        assert_eq!(addr.declared_len(), DESCRIPTOR_LEN);
        assert_eq!(addr.declared_len(), 11);
    }

    #[test]
    fn test_encoded_layout() {
        let bytes = AddressDescriptor::remote(2, 1234).to_bytes();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[0..2], &40u16.to_le_bytes());
        assert_eq!(&bytes[2..4], &[0, 0]);
        assert_eq!(&bytes[4..8], &1234u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &2u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_decode_keeps_endpoint() {
        let original = AddressDescriptor::bind(33, 1234);
        let decoded = AddressDescriptor::from_bytes(&original.to_bytes(), AddressRole::Peer).unwrap();
        assert!(decoded.same_endpoint(&original));
        assert_eq!(decoded.role(), AddressRole::Peer);
        assert_ne!(decoded, original);
    }

    #[test]
    fn test_decode_rejects_bad_family() {
        let mut bytes = AddressDescriptor::bind(33, 1234).to_bytes();
        bytes[0] = 2; // AF_INET
        let err = AddressDescriptor::from_bytes(&bytes, AddressRole::Peer).unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidDescriptor { .. }));
    }

    #[test]
    fn test_decode_rejects_reserved_and_padding() {
        let mut bytes = AddressDescriptor::bind(33, 1234).to_bytes();
        bytes[3] = 1;
        assert!(AddressDescriptor::from_bytes(&bytes, AddressRole::Peer).is_err());

        let mut bytes = AddressDescriptor::bind(33, 1234).to_bytes();
        bytes[15] = 0xff;
        assert!(AddressDescriptor::from_bytes(&bytes, AddressRole::Peer).is_err());
    }

    #[test]
    fn test_decode_rejects_short_buffer() {
        let bytes = AddressDescriptor::bind(33, 1234).to_bytes();
        let err = AddressDescriptor::from_bytes(&bytes[..11], AddressRole::Peer).unwrap_err();
        assert!(err.to_string().contains("expected 16 bytes"));
    }

    #[test]
    fn test_deserialize_accepts_serialized_descriptor() {
        let addr = AddressDescriptor::remote(2, 1234);
        let json = serde_json::to_string(&addr).unwrap();
        let back: AddressDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn test_deserialize_rejects_foreign_fields() {
        let foreign = r#"{"family":2,"reserved":7,"port":1234,"cid":33,"flags":9,"len":99,"role":"bind"}"#;
        let err = serde_json::from_str::<AddressDescriptor>(foreign).unwrap_err();
        assert!(err.to_string().contains("unexpected address family 2"));

        let reserved = r#"{"family":40,"reserved":7,"port":1234,"cid":33,"flags":0,"len":11,"role":"bind"}"#;
        assert!(serde_json::from_str::<AddressDescriptor>(reserved).is_err());

        let bad_len = r#"{"family":40,"reserved":0,"port":1234,"cid":33,"flags":0,"len":99,"role":"bind"}"#;
        let err = serde_json::from_str::<AddressDescriptor>(bad_len).unwrap_err();
        assert!(err.to_string().contains("declared length must be 11"));
    }

    #[test]
    fn test_deserialized_descriptor_encodes_decodable_bytes() {
        let json = r#"{"family":40,"reserved":0,"port":1234,"cid":33,"flags":0,"len":11,"role":"bind"}"#;
        let addr: AddressDescriptor = serde_json::from_str(json).unwrap();
        let decoded = AddressDescriptor::from_bytes(&addr.to_bytes(), AddressRole::Bind).unwrap();
        assert_eq!(decoded, addr);
    }

    #[test]
    fn test_display() {
        assert_eq!(AddressDescriptor::bind(33, 1234).to_string(), "cid: 33 port: 1234");
    }
}
