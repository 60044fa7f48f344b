//! One-shot UDP exchanges with the upstream nameserver.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;

use dns_types::protocol::types::{HEADER_MASK_QR, HEADER_MASK_TC, WIRE_HEADER_LEN};

/// Port the upstream nameserver is contacted on.
pub const UPSTREAM_PORT: u16 = 53;

/// How long each attempt waits for a reply.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// How many times the query is sent before the exchange is given up.
pub const SEND_ATTEMPTS: usize = 3;

/// Maximum size of a DNS UDP datagram.
const MAX_DATAGRAM_SIZE: usize = 512;

/// Resolve the upstream address and exchange one query for one
/// reply.  The reply bytes are opaque here: whatever the upstream
/// says goes back to the client unchanged.
///
/// The address is re-resolved on every exchange.
///
/// # Errors
///
/// See `Error`.
pub async fn exchange(address: &str, port: u16, query: &[u8]) -> Result<Vec<u8>, Error> {
    let target = resolve_address(address, port).await?;
    exchange_with(target, query).await
}

/// Turn the configured upstream address into a socket address: a
/// dotted-quad IPv4 literal is used as-is, anything else gets a
/// single host lookup of which the first IPv4 result wins.
///
/// # Errors
///
/// If the lookup fails or yields no IPv4 addresses.
pub async fn resolve_address(address: &str, port: u16) -> Result<SocketAddr, Error> {
    if let Ok(ip) = address.parse::<Ipv4Addr>() {
        return Ok(SocketAddr::from((ip, port)));
    }

    match lookup_host((address, port)).await {
        Ok(mut addresses) => addresses.find(SocketAddr::is_ipv4).ok_or_else(|| {
            tracing::debug!(%address, "upstream host has no IPv4 addresses");
            Error::Resolve {
                address: address.to_owned(),
            }
        }),
        Err(error) => {
            tracing::debug!(%address, ?error, "upstream host lookup failed");
            Err(Error::Resolve {
                address: address.to_owned(),
            })
        }
    }
}

/// Exchange against an already-resolved address.
///
/// Up to `SEND_ATTEMPTS` sends, each waiting `RECV_TIMEOUT` for a
/// reply; a failed or short send and a failed or timed-out receive
/// all burn an attempt.  The first datagram received is validated
/// (length, ID, QR) and returned; an invalid reply fails the whole
/// exchange rather than burning an attempt.
///
/// The socket is fresh for each exchange and closed before this
/// returns, on every path.
///
/// # Errors
///
/// See `Error`.
pub async fn exchange_with(target: SocketAddr, query: &[u8]) -> Result<Vec<u8>, Error> {
    if query.len() < WIRE_HEADER_LEN {
        return Err(Error::QueryTooShort { length: query.len() });
    }
    let query_id = u16::from_be_bytes([query[0], query[1]]);

    let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(Error::Socket)?;
    socket.connect(target).await.map_err(Error::Socket)?;

    for attempt in 1..=SEND_ATTEMPTS {
        match socket.send(query).await {
            Ok(sent) if sent == query.len() => (),
            Ok(sent) => {
                tracing::debug!(%attempt, %sent, length = %query.len(), "short send to upstream");
                continue;
            }
            Err(error) => {
                tracing::debug!(%attempt, ?error, "could not send to upstream");
                continue;
            }
        }

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        match timeout(RECV_TIMEOUT, socket.recv(&mut buf)).await {
            Ok(Ok(received)) => {
                buf.truncate(received);
                return validate_reply(query_id, buf);
            }
            Ok(Err(error)) => tracing::debug!(%attempt, ?error, "could not receive from upstream"),
            Err(_elapsed) => tracing::debug!(%attempt, "upstream receive timed out"),
        }
    }

    Err(Error::NoReply {
        attempts: SEND_ATTEMPTS,
    })
}

/// Check that a reply is plausibly an answer to the query that was
/// sent: long enough to carry a header, the same transaction ID, and
/// the QR bit set.  A set TC bit is logged but the truncated answer
/// is still forwarded.
fn validate_reply(query_id: u16, reply: Vec<u8>) -> Result<Vec<u8>, Error> {
    if reply.len() < WIRE_HEADER_LEN {
        return Err(Error::ReplyTooShort {
            length: reply.len(),
        });
    }

    let reply_id = u16::from_be_bytes([reply[0], reply[1]]);
    if reply_id != query_id {
        return Err(Error::IdMismatch {
            expected: query_id,
            actual: reply_id,
        });
    }

    if reply[2] & HEADER_MASK_QR == 0 {
        return Err(Error::NotAResponse);
    }

    if reply[2] & HEADER_MASK_TC != 0 {
        tracing::debug!("upstream reply truncated, forwarding anyway");
    }

    Ok(reply)
}

/// Ways an exchange can fail.  They all turn into the same `SERVFAIL`
/// at the pipeline; the distinctions exist for the logs.
#[derive(Debug)]
pub enum Error {
    /// The address neither parsed as an IPv4 literal nor resolved to
    /// an IPv4 address.
    Resolve { address: String },

    /// The local socket could not be created or connected.
    Socket(io::Error),

    /// The query to forward is shorter than a header.
    QueryTooShort { length: usize },

    /// Every attempt went unanswered.
    NoReply { attempts: usize },

    /// The reply is shorter than a header.
    ReplyTooShort { length: usize },

    /// The reply's transaction ID is not the query's.
    IdMismatch { expected: u16, actual: u16 },

    /// The reply does not have the QR bit set.
    NotAResponse,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Resolve { address } => write!(f, "could not resolve '{address}' to IPv4"),
            Error::Socket(error) => write!(f, "could not open upstream socket: {error}"),
            Error::QueryTooShort { length } => {
                write!(f, "query of {length} octets is shorter than a header")
            }
            Error::NoReply { attempts } => write!(f, "no reply after {attempts} attempts"),
            Error::ReplyTooShort { length } => {
                write!(f, "reply of {length} octets is shorter than a header")
            }
            Error::IdMismatch { expected, actual } => {
                write!(f, "reply ID {actual:#06x} does not match query ID {expected:#06x}")
            }
            Error::NotAResponse => write!(f, "reply does not have the QR bit set"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Socket(error) => Some(error),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // id 0x1234, RD, one question: "example.com" IN A
    const QUERY: [u8; 29] = [
        0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 7, b'e', b'x',
        b'a', b'm', b'p', b'l', b'e', 3, b'c', b'o', b'm', 0, 0x00, 0x01, 0x00, 0x01,
    ];

    /// Bind a fake upstream on an ephemeral port which answers one
    /// datagram with `respond` of it.
    async fn fake_upstream<F>(respond: F) -> SocketAddr
    where
        F: FnOnce(&[u8]) -> Vec<u8> + Send + 'static,
    {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = socket.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (size, peer) = socket.recv_from(&mut buf).await.unwrap();
            let reply = respond(&buf[..size]);
            socket.send_to(&reply, peer).await.unwrap();
        });

        address
    }

    #[tokio::test]
    async fn exchange_returns_reply_verbatim() {
        let upstream = fake_upstream(|query| {
            let mut reply = vec![0u8; 45];
            reply[0..2].copy_from_slice(&query[0..2]);
            reply[2] = HEADER_MASK_QR;
            reply[44] = 0xEE;
            reply
        })
        .await;

        let reply = exchange_with(upstream, &QUERY).await.unwrap();

        assert_eq!(45, reply.len());
        assert_eq!([0x12, 0x34], reply[0..2]);
        assert_eq!(0xEE, reply[44]);
    }

    #[tokio::test]
    async fn exchange_forwards_truncated_replies() {
        let upstream = fake_upstream(|query| {
            let mut reply = vec![0u8; 20];
            reply[0..2].copy_from_slice(&query[0..2]);
            reply[2] = HEADER_MASK_QR | HEADER_MASK_TC;
            reply
        })
        .await;

        let reply = exchange_with(upstream, &QUERY).await.unwrap();

        assert_ne!(0, reply[2] & HEADER_MASK_TC);
    }

    #[tokio::test]
    async fn exchange_rejects_mismatched_id() {
        let upstream = fake_upstream(|_| {
            let mut reply = vec![0u8; 16];
            reply[0..2].copy_from_slice(&[0xBE, 0xEF]);
            reply[2] = HEADER_MASK_QR;
            reply
        })
        .await;

        let error = exchange_with(upstream, &QUERY).await.unwrap_err();

        assert!(matches!(
            error,
            Error::IdMismatch {
                expected: 0x1234,
                actual: 0xBEEF
            }
        ));
    }

    #[tokio::test]
    async fn exchange_rejects_non_response() {
        let upstream = fake_upstream(|query| {
            let mut reply = vec![0u8; 16];
            reply[0..2].copy_from_slice(&query[0..2]);
            reply
        })
        .await;

        let error = exchange_with(upstream, &QUERY).await.unwrap_err();

        assert!(matches!(error, Error::NotAResponse));
    }

    #[tokio::test]
    async fn exchange_rejects_short_reply() {
        let upstream = fake_upstream(|query| query[0..2].to_vec()).await;

        let error = exchange_with(upstream, &QUERY).await.unwrap_err();

        assert!(matches!(error, Error::ReplyTooShort { length: 2 }));
    }

    #[tokio::test]
    async fn exchange_rejects_runt_query() {
        let target = SocketAddr::from((Ipv4Addr::LOCALHOST, 1));

        let error = exchange_with(target, &QUERY[..4]).await.unwrap_err();

        assert!(matches!(error, Error::QueryTooShort { length: 4 }));
    }

    #[tokio::test]
    async fn resolve_address_ipv4_literal() {
        let resolved = resolve_address("8.8.8.8", 53).await.unwrap();

        assert_eq!(SocketAddr::from((Ipv4Addr::new(8, 8, 8, 8), 53)), resolved);
    }

    #[test]
    fn validate_reply_accepts_minimal_response() {
        let mut reply = vec![0u8; WIRE_HEADER_LEN];
        reply[0] = 0xAB;
        reply[1] = 0xCD;
        reply[2] = HEADER_MASK_QR;

        assert!(validate_reply(0xABCD, reply).is_ok());
    }
}
