//! In-flight packet envelope.
//!
//! ```text
//! ┌──────────────┬───────────────┬──────────────────────────┬──────────────┐
//! │ address (4)  │ nonce (12)    │ IP packet / ciphertext   │ tag (16)     │
//! └──────────────┴───────────────┴──────────────────────────┴──────────────┘
//! ```
//!
//! A `Payload` owns one buffer per queue and is reused for every packet on
//! that queue. Device reads land directly after the header so the packet can
//! be sealed in place; socket reads fill the buffer from offset zero.

use crate::crypto::{self, Cipher, NONCE_LENGTH, TAG_LENGTH};
use crate::error::{MeshError, MeshResult};
use std::net::{Ipv4Addr, SocketAddr};

/// Largest datagram handled by a queue.
pub const MAX_PACKET_LENGTH: usize = 65535;

/// Width of the virtual address field.
pub const IP_LENGTH: usize = 4;

/// Address field plus nonce.
pub const HEADER_SIZE: usize = IP_LENGTH + NONCE_LENGTH;

/// Trailing authentication tag.
pub const FOOTER_SIZE: usize = TAG_LENGTH;

/// Offset of the destination address inside an IPv4 header.
const IPV4_DESTINATION: std::ops::Range<usize> = 16..20;

/// Packet buffer plus the views the pipelines operate on.
pub struct Payload {
    raw: Box<[u8]>,
    length: usize,
    packet_length: usize,
    sockaddr: Option<SocketAddr>,
}

impl Payload {
    /// Allocate a payload able to hold any datagram up to [`MAX_PACKET_LENGTH`].
    pub fn new() -> Self {
        Self::with_capacity(MAX_PACKET_LENGTH)
    }

    /// Allocate a payload with a custom buffer size.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(HEADER_SIZE + FOOTER_SIZE);
        Self {
            raw: vec![0u8; capacity].into_boxed_slice(),
            length: 0,
            packet_length: 0,
            sockaddr: None,
        }
    }

    /// Bytes as exchanged with the socket.
    pub fn raw(&self) -> &[u8] {
        &self.raw[..self.length]
    }

    /// Valid byte count on the wire.
    pub fn length(&self) -> usize {
        self.length
    }

    /// The 4-byte address field (lookup key and AAD).
    pub fn ip_address(&self) -> &[u8] {
        &self.raw[..IP_LENGTH]
    }

    /// The address field interpreted as an IPv4 address.
    pub fn ip_address_v4(&self) -> Ipv4Addr {
        let field = self.ip_address();
        Ipv4Addr::new(field[0], field[1], field[2], field[3])
    }

    /// Overwrite the address field.
    pub fn set_ip_address(&mut self, ip: Ipv4Addr) {
        self.raw[..IP_LENGTH].copy_from_slice(&ip.octets());
    }

    /// The nonce region.
    pub fn nonce(&self) -> &[u8] {
        &self.raw[IP_LENGTH..HEADER_SIZE]
    }

    /// The packet region: plaintext IP packet or ciphertext including the tag.
    pub fn packet(&self) -> &[u8] {
        &self.raw[HEADER_SIZE..HEADER_SIZE + self.packet_length]
    }

    /// Destination or source transport address.
    pub fn sockaddr(&self) -> Option<SocketAddr> {
        self.sockaddr
    }

    /// Set the destination transport address.
    pub fn set_sockaddr(&mut self, addr: SocketAddr) {
        self.sockaddr = Some(addr);
    }

    /// Destination of the plaintext IPv4 packet, if the packet is IPv4 and
    /// long enough to carry a header.
    pub fn destination(&self) -> Option<Ipv4Addr> {
        let packet = self.packet();
        if packet.len() < IPV4_DESTINATION.end || packet[0] >> 4 != 4 {
            return None;
        }
        let d = &packet[IPV4_DESTINATION];
        Some(Ipv4Addr::new(d[0], d[1], d[2], d[3]))
    }

    /// Region a device read should fill: after the header, leaving room for
    /// the tag.
    pub fn device_buffer(&mut self) -> &mut [u8] {
        let end = self.raw.len() - FOOTER_SIZE;
        &mut self.raw[HEADER_SIZE..end]
    }

    /// Record a device read of `n` plaintext bytes.
    pub fn load_device(&mut self, n: usize) {
        self.packet_length = n;
        self.length = HEADER_SIZE + n + FOOTER_SIZE;
        self.sockaddr = None;
    }

    /// Region a socket read should fill: the whole buffer.
    pub fn socket_buffer(&mut self) -> &mut [u8] {
        &mut self.raw[..]
    }

    /// Record a socket read of `n` bytes from `from`.
    ///
    /// Datagrams too short to hold the header and a tag are rejected.
    pub fn load_socket(&mut self, n: usize, from: SocketAddr) -> MeshResult<()> {
        if n < HEADER_SIZE + FOOTER_SIZE {
            self.length = 0;
            self.packet_length = 0;
            return Err(MeshError::Socket(format!(
                "datagram of {} bytes from {} is shorter than the {}-byte envelope",
                n,
                from,
                HEADER_SIZE + FOOTER_SIZE
            )));
        }
        self.length = n;
        self.packet_length = n - HEADER_SIZE;
        self.sockaddr = Some(from);
        Ok(())
    }

    /// Draw a fresh nonce and encrypt the packet in place, appending the tag.
    pub fn seal(&mut self, cipher: &Cipher) -> MeshResult<()> {
        let (header, body) = self.raw.split_at_mut(HEADER_SIZE);
        let (aad, nonce) = header.split_at_mut(IP_LENGTH);
        crypto::fill_nonce(nonce)?;

        let plain_len = self.packet_length;
        let tag = cipher.seal(nonce, aad, &mut body[..plain_len])?;
        body[plain_len..plain_len + FOOTER_SIZE].copy_from_slice(&tag);

        self.packet_length = plain_len + FOOTER_SIZE;
        self.length = HEADER_SIZE + self.packet_length;
        Ok(())
    }

    /// Authenticate and decrypt the packet in place. On success the packet
    /// view shrinks to the plaintext; the wire length is unchanged.
    pub fn open(&mut self, cipher: &Cipher) -> MeshResult<()> {
        let (header, body) = self.raw.split_at_mut(HEADER_SIZE);
        let (aad, nonce) = header.split_at(IP_LENGTH);
        let plain_len = cipher.open(nonce, aad, &mut body[..self.packet_length])?;
        self.packet_length = plain_len;
        Ok(())
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::new()
    }
}
