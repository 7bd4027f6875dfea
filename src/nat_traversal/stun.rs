/**
 * nat_traversal/stun.rs
 *
 * STUN client for learning the external address of the shared socket
 */

use super::error::ResolutionError;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};

/// STUN message types
const STUN_BINDING_REQUEST: u16 = 0x0001;
const STUN_BINDING_RESPONSE: u16 = 0x0101;
const STUN_BINDING_ERROR_RESPONSE: u16 = 0x0111;

/// STUN magic cookie
const STUN_MAGIC_COOKIE: u32 = 0x2112A442;

/// STUN header size
const STUN_HEADER_LEN: usize = 20;

/// STUN attribute types
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// Address families
const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

pub type TransactionId = [u8; 12];

/// STUN client bound to one reflection server
#[derive(Debug, Clone)]
pub struct StunClient {
    server: String,
    timeout: Duration,
}

impl StunClient {
    /// Create a new STUN client for `server` (host:port)
    pub fn new(server: impl Into<String>, timeout: Duration) -> Self {
        Self {
            server: server.into(),
            timeout,
        }
    }

    /// Learn the external address of `socket`.
    ///
    /// The request goes out over `socket` itself so the NAT mapping we learn
    /// is the one later used for hole punching. Exactly one datagram is read
    /// back and treated as the response; nothing else may be reading from the
    /// socket meanwhile. There is no retry.
    pub async fn query(&self, socket: &UdpSocket) -> Result<SocketAddr, ResolutionError> {
        let server_addr = self.resolve_server(socket).await?;

        let transaction_id: TransactionId = rand::random();
        let request = build_binding_request(&transaction_id);
        log::debug!(
            "Sending STUN binding request {} to {}",
            hex::encode(transaction_id),
            server_addr
        );

        socket
            .send_to(&request, server_addr)
            .await
            .map_err(ResolutionError::Send)?;

        let mut buffer = vec![0u8; 1024];
        let (len, from) = tokio::time::timeout(self.timeout, socket.recv_from(&mut buffer))
            .await
            .map_err(|_| ResolutionError::Timeout(self.timeout))?
            .map_err(ResolutionError::Receive)?;

        if from != server_addr {
            log::warn!("STUN response came from {} instead of {}", from, server_addr);
        }

        parse_binding_response(&buffer[..len], &transaction_id)
    }

    /// Resolve the server to an address of the same family as `socket`
    async fn resolve_server(&self, socket: &UdpSocket) -> Result<SocketAddr, ResolutionError> {
        let want_v4 = socket
            .local_addr()
            .map(|addr| addr.is_ipv4())
            .unwrap_or(true);

        let mut addrs = lookup_host(self.server.as_str())
            .await
            .map_err(|source| ResolutionError::Lookup {
                server: self.server.clone(),
                source,
            })?;

        addrs
            .find(|addr| addr.is_ipv4() == want_v4)
            .ok_or_else(|| ResolutionError::NoAddress(self.server.clone()))
    }
}

/// Build a STUN binding request
pub fn build_binding_request(transaction_id: &TransactionId) -> Vec<u8> {
    let mut request = Vec::with_capacity(STUN_HEADER_LEN);

    // Message type (16 bits)
    request.extend_from_slice(&STUN_BINDING_REQUEST.to_be_bytes());

    // Message length (16 bits) - no attributes
    request.extend_from_slice(&0u16.to_be_bytes());

    // Magic cookie (32 bits)
    request.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());

    // Transaction ID (96 bits)
    request.extend_from_slice(transaction_id);

    request
}

/// Cheap check that `data` looks like a STUN message at all
pub fn is_stun_message(data: &[u8]) -> bool {
    data.len() >= STUN_HEADER_LEN
        && data[0] & 0xC0 == 0
        && u32::from_be_bytes([data[4], data[5], data[6], data[7]]) == STUN_MAGIC_COOKIE
}

/// Parse a STUN binding response and pull out the mapped address
pub fn parse_binding_response(
    data: &[u8],
    expected_transaction_id: &TransactionId,
) -> Result<SocketAddr, ResolutionError> {
    if !is_stun_message(data) {
        return Err(ResolutionError::NotStun);
    }

    // Check message type
    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    match msg_type {
        STUN_BINDING_RESPONSE => {}
        STUN_BINDING_ERROR_RESPONSE => return Err(ResolutionError::ErrorResponse),
        other => return Err(ResolutionError::UnexpectedType(other)),
    }

    // Check transaction ID
    if &data[8..20] != expected_transaction_id {
        return Err(ResolutionError::TransactionMismatch);
    }

    // Parse message length
    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    if data.len() < STUN_HEADER_LEN + msg_len {
        return Err(ResolutionError::Malformed("response truncated"));
    }

    // Prefer XOR-MAPPED-ADDRESS, fall back to MAPPED-ADDRESS
    let mut mapped = None;
    let mut offset = STUN_HEADER_LEN;
    while offset + 4 <= STUN_HEADER_LEN + msg_len {
        let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let attr_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        offset += 4;

        if offset + attr_len > data.len() {
            return Err(ResolutionError::Malformed("attribute overruns message"));
        }

        let attr_data = &data[offset..offset + attr_len];

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                return parse_xor_mapped_address(attr_data, expected_transaction_id);
            }
            ATTR_MAPPED_ADDRESS if mapped.is_none() => {
                mapped = Some(parse_mapped_address(attr_data)?);
            }
            _ => {}
        }

        // Attributes are padded to 4-byte boundaries
        offset += (attr_len + 3) & !3;
    }

    mapped.ok_or(ResolutionError::MissingAddress)
}

/// Parse XOR-MAPPED-ADDRESS attribute
fn parse_xor_mapped_address(
    data: &[u8],
    transaction_id: &TransactionId,
) -> Result<SocketAddr, ResolutionError> {
    if data.len() < 8 {
        return Err(ResolutionError::Malformed("XOR-MAPPED-ADDRESS too short"));
    }

    let family = data[1];
    let xor_port = u16::from_be_bytes([data[2], data[3]]);
    let port = xor_port ^ (STUN_MAGIC_COOKIE >> 16) as u16;

    let ip = match family {
        FAMILY_IPV4 => {
            let xor_addr = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
            IpAddr::from((xor_addr ^ STUN_MAGIC_COOKIE).to_be_bytes())
        }
        FAMILY_IPV6 => {
            if data.len() < 20 {
                return Err(ResolutionError::Malformed("XOR-MAPPED-ADDRESS IPv6 too short"));
            }
            let mut addr_bytes = [0u8; 16];
            addr_bytes.copy_from_slice(&data[4..20]);

            // XOR with magic cookie + transaction ID
            let mut xor_key = [0u8; 16];
            xor_key[0..4].copy_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
            xor_key[4..16].copy_from_slice(transaction_id);

            for (byte, key) in addr_bytes.iter_mut().zip(xor_key) {
                *byte ^= key;
            }

            IpAddr::from(addr_bytes)
        }
        _ => return Err(ResolutionError::Malformed("unknown address family")),
    };

    Ok(SocketAddr::new(ip, port))
}

/// Parse MAPPED-ADDRESS attribute (fallback)
fn parse_mapped_address(data: &[u8]) -> Result<SocketAddr, ResolutionError> {
    if data.len() < 8 {
        return Err(ResolutionError::Malformed("MAPPED-ADDRESS too short"));
    }

    let family = data[1];
    let port = u16::from_be_bytes([data[2], data[3]]);

    let ip = match family {
        FAMILY_IPV4 => IpAddr::from([data[4], data[5], data[6], data[7]]),
        FAMILY_IPV6 => {
            if data.len() < 20 {
                return Err(ResolutionError::Malformed("MAPPED-ADDRESS IPv6 too short"));
            }
            let mut addr_bytes = [0u8; 16];
            addr_bytes.copy_from_slice(&data[4..20]);
            IpAddr::from(addr_bytes)
        }
        _ => return Err(ResolutionError::Malformed("unknown address family")),
    };

    Ok(SocketAddr::new(ip, port))
}

/// Build a binding success response carrying `addr` as XOR-MAPPED-ADDRESS.
/// Only used by tests and the loopback reflection server in `tests/`.
#[doc(hidden)]
pub fn build_binding_response(transaction_id: &TransactionId, addr: SocketAddr) -> Vec<u8> {
    let mut value = vec![0u8, 0];
    let xor_port = addr.port() ^ (STUN_MAGIC_COOKIE >> 16) as u16;
    match addr.ip() {
        IpAddr::V4(ip) => {
            value[1] = FAMILY_IPV4;
            value.extend_from_slice(&xor_port.to_be_bytes());
            let xor_ip = u32::from(ip) ^ STUN_MAGIC_COOKIE;
            value.extend_from_slice(&xor_ip.to_be_bytes());
        }
        IpAddr::V6(ip) => {
            value[1] = FAMILY_IPV6;
            value.extend_from_slice(&xor_port.to_be_bytes());
            let mut xor_key = [0u8; 16];
            xor_key[0..4].copy_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
            xor_key[4..16].copy_from_slice(transaction_id);
            value.extend(ip.octets().iter().zip(xor_key).map(|(b, k)| b ^ k));
        }
    }

    let mut response = Vec::with_capacity(STUN_HEADER_LEN + 4 + value.len());
    response.extend_from_slice(&STUN_BINDING_RESPONSE.to_be_bytes());
    response.extend_from_slice(&((4 + value.len()) as u16).to_be_bytes());
    response.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
    response.extend_from_slice(transaction_id);
    response.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
    response.extend_from_slice(&(value.len() as u16).to_be_bytes());
    response.extend_from_slice(&value);
    response
}
