//! Wire codec for the tagged address field shared by SOCKS4 replies and
//! SOCKS5 requests/replies.
//!
//! <https://www.ietf.org/rfc/rfc1928.txt>
//!
//! ```text
//! o  ATYP (1 byte)  address type of following address:
//!     o  IP V4 address: X'01'
//!     o  DOMAINNAME:    X'03'  (1-byte length prefix, then the name)
//!     o  IP V6 address: X'04'
//! ```

use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{BufMut as _, BytesMut};
use gangway_types::{DecodeError, DomainName, HostAddr};

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Tag byte used when encoding `HostAddr::Unknown` (zero-length payload).
pub const ATYP_UNKNOWN: u8 = 0xFF;

pub fn host_atyp(host: &HostAddr) -> u8 {
    match host {
        HostAddr::Ipv4(_) => ATYP_IPV4,
        HostAddr::Domain(_) => ATYP_DOMAIN,
        HostAddr::Ipv6(_) => ATYP_IPV6,
        HostAddr::Unknown => ATYP_UNKNOWN,
    }
}

/// Reads an address payload of type `atyp` from the front of `buf`.
///
/// Returns `Ok(None)` while the payload is incomplete, and the number of
/// bytes it spans on success. `buf` is never consumed; the caller advances
/// its cursor once the enclosing frame is complete.
pub fn read_host(atyp: u8, buf: &[u8]) -> Result<Option<(HostAddr, usize)>, DecodeError> {
    match atyp {
        ATYP_IPV4 => {
            let Some(octets) = buf.first_chunk::<4>() else {
                return Ok(None);
            };
            Ok(Some((HostAddr::Ipv4(Ipv4Addr::from(*octets)), 4)))
        }
        ATYP_DOMAIN => {
            let Some((&len, rest)) = buf.split_first() else {
                return Ok(None);
            };
            let len = usize::from(len);
            if rest.len() < len {
                return Ok(None);
            }
            let name = core::str::from_utf8(&rest[..len])
                .ok()
                .filter(|name| name.is_ascii())
                .ok_or(DecodeError::NotAscii { field: "addr" })?;
            let domain = DomainName::new(name).map_err(|_| DecodeError::Malformed {
                field: "addr",
                reason: "empty domain name",
            })?;
            Ok(Some((HostAddr::Domain(domain), 1 + len)))
        }
        ATYP_IPV6 => {
            let Some(octets) = buf.first_chunk::<16>() else {
                return Ok(None);
            };
            Ok(Some((HostAddr::Ipv6(Ipv6Addr::from(*octets)), 16)))
        }
        actual => Err(DecodeError::UnsupportedAddressType { actual }),
    }
}

/// Writes the address payload (without the type tag) into `dst`.
pub fn write_host(host: &HostAddr, dst: &mut BytesMut) {
    match host {
        HostAddr::Ipv4(ip) => dst.put_slice(&ip.octets()),
        HostAddr::Ipv6(ip) => dst.put_slice(&ip.octets()),
        HostAddr::Domain(domain) => {
            let len = u8::try_from(domain.as_bytes().len()).expect("domain length is validated at construction");
            dst.put_u8(len);
            dst.put_slice(domain.as_bytes());
        }
        // Unknown is a zero-length payload.
        HostAddr::Unknown => {}
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;

    fn assert_round_trip(host: HostAddr, payload: &[u8]) {
        let mut encoded = BytesMut::new();
        write_host(&host, &mut encoded);
        assert_eq!(&encoded[..], payload);

        let (decoded, consumed) = read_host(host_atyp(&host), payload).unwrap().unwrap();
        assert_eq!(decoded, host);
        assert_eq!(consumed, payload.len());
    }

    #[test]
    fn ipv4() {
        assert_round_trip(HostAddr::Ipv4(Ipv4Addr::new(192, 168, 0, 39)), &[192, 168, 0, 39]);
    }

    #[test]
    fn ipv6() {
        assert_round_trip(
            HostAddr::Ipv6("2001:db8:85a3:8d3:1319:8a2e:370:7348".parse().unwrap()),
            &[32, 1, 13, 184, 133, 163, 8, 211, 19, 25, 138, 46, 3, 112, 115, 72],
        );
    }

    #[test]
    fn domain() {
        assert_round_trip(
            HostAddr::Domain(DomainName::new("example.com").unwrap()),
            &[11, 101, 120, 97, 109, 112, 108, 101, 46, 99, 111, 109],
        );
    }

    #[test]
    fn unknown_is_empty() {
        let mut encoded = BytesMut::new();
        write_host(&HostAddr::Unknown, &mut encoded);
        assert!(encoded.is_empty());
    }

    #[test]
    fn incomplete_payload_is_not_an_error() {
        assert_eq!(read_host(ATYP_IPV4, &[127, 0, 0]).unwrap(), None);
        assert_eq!(read_host(ATYP_IPV6, &[0; 15]).unwrap(), None);
        // Length prefix not yet arrived.
        assert_eq!(read_host(ATYP_DOMAIN, &[]).unwrap(), None);
        // Prefix says 11 bytes, only 3 arrived.
        assert_eq!(read_host(ATYP_DOMAIN, &[11, b'e', b'x', b'a']).unwrap(), None);
    }

    #[test]
    fn unsupported_tag() {
        let err = read_host(0x05, &[1, 2, 3, 4]).unwrap_err();
        assert_eq!(err, DecodeError::UnsupportedAddressType { actual: 0x05 });
    }

    #[test]
    fn non_ascii_domain_is_rejected() {
        let mut payload = vec![6u8];
        payload.extend_from_slice("bü.de".as_bytes());
        let err = read_host(ATYP_DOMAIN, &payload).unwrap_err();
        assert_eq!(err, DecodeError::NotAscii { field: "addr" });
    }

    #[test]
    fn round_trip_any_host() {
        use proptest::prelude::*;

        proptest!(|(host in gangway_generators::host_addr())| {
            let mut encoded = BytesMut::new();
            write_host(&host, &mut encoded);
            let (decoded, consumed) = read_host(host_atyp(&host), &encoded).unwrap().unwrap();
            prop_assert_eq!(decoded, host);
            prop_assert_eq!(consumed, encoded.len());
        })
    }
}
