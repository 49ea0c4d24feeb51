//! Per-peer payload transforms.
//!
//! Some peers expect integers and addresses in their own convention: the
//! SNMP side speaks TruthValue booleans, one-based object identifiers, and
//! packed IPv4 octets, while the mux manager speaks the internal forms.
//! Each convention is a [`Dialect`] registered on the bus under the peer's
//! path, applied while appending to or extracting from a message addressed
//! to that peer.

use std::collections::BTreeMap;

use crate::registry::ResourceType;

/// One peer's encode/decode conventions.
pub trait Dialect: Send {
    /// Transforms an integer payload for this peer.
    fn represent_integer(&self, value: i64, ty: ResourceType) -> i64;

    /// Writes the transformed form of `src` into `dst` and returns the
    /// number of bytes the transformed value occupies.
    fn represent_value(&self, dst: &mut [u8], src: &[u8], ty: ResourceType) -> usize;
}

/// Conventions of the `/snmp` peer.
pub struct SnmpDialect;

impl Dialect for SnmpDialect {
    fn represent_integer(&self, value: i64, ty: ResourceType) -> i64 {
        match ty {
            // TruthValue: 1 = true, 2 = false
            ResourceType::Boolean => {
                if value != 0 {
                    1
                } else {
                    2
                }
            }
            ResourceType::ObjectId => value + 1,
            _ => value,
        }
    }

    fn represent_value(&self, dst: &mut [u8], src: &[u8], ty: ResourceType) -> usize {
        match ty {
            ResourceType::IpAddress => pack_dotted_quad(dst, src),
            _ => copy_verbatim(dst, src),
        }
    }
}

/// Conventions of the `/mux_manager` peer, the inverse of the SNMP side.
pub struct MuxManagerDialect;

impl Dialect for MuxManagerDialect {
    fn represent_integer(&self, value: i64, ty: ResourceType) -> i64 {
        match ty {
            ResourceType::Boolean => i64::from(value == 1),
            ResourceType::ObjectId => value - 1,
            _ => value,
        }
    }

    fn represent_value(&self, dst: &mut [u8], src: &[u8], ty: ResourceType) -> usize {
        match ty {
            ResourceType::IpAddress => expand_packed_quad(dst, src),
            _ => copy_verbatim(dst, src),
        }
    }
}

/// The dialects every bus starts with.
pub(crate) fn stock_dialects() -> BTreeMap<String, Box<dyn Dialect>> {
    let mut dialects: BTreeMap<String, Box<dyn Dialect>> = BTreeMap::new();
    dialects.insert("/snmp".to_string(), Box::new(SnmpDialect));
    dialects.insert("/mux_manager".to_string(), Box::new(MuxManagerDialect));
    dialects
}

/// Copies as much of `src` as fits and returns the copied length.
pub fn copy_verbatim(dst: &mut [u8], src: &[u8]) -> usize {
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
    n
}

/// Parses dotted-quad ASCII (`"1.2.3.4"`) into packed octets plus a
/// trailing NUL, returning octets written + 1.
pub fn pack_dotted_quad(dst: &mut [u8], src: &[u8]) -> usize {
    let text = String::from_utf8_lossy(src);
    let mut written = 0;
    for part in text.trim_end_matches('\0').split('.').take(4) {
        if written >= dst.len() {
            break;
        }
        dst[written] = part.trim().parse::<i64>().unwrap_or(0) as u8;
        written += 1;
    }
    if written < dst.len() {
        dst[written] = 0;
    }
    written + 1
}

/// Expands packed IPv4 octets into dotted-quad ASCII with a trailing NUL,
/// returning the length including the NUL.
pub fn expand_packed_quad(dst: &mut [u8], src: &[u8]) -> usize {
    let octets = &src[..src.len().min(4)];
    let text = octets
        .iter()
        .map(|octet| octet.to_string())
        .collect::<Vec<_>>()
        .join(".");
    let written = copy_verbatim(dst, text.as_bytes());
    if written < dst.len() {
        dst[written] = 0;
        written + 1
    } else {
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snmp_booleans_become_truthvalues() {
        let snmp = SnmpDialect;
        assert_eq!(snmp.represent_integer(1, ResourceType::Boolean), 1);
        assert_eq!(snmp.represent_integer(7, ResourceType::Boolean), 1);
        assert_eq!(snmp.represent_integer(0, ResourceType::Boolean), 2);
    }

    #[test]
    fn mux_manager_inverts_snmp_integers() {
        let snmp = SnmpDialect;
        let mux = MuxManagerDialect;
        for value in [0i64, 1, 41] {
            let outgoing = snmp.represent_integer(value, ResourceType::ObjectId);
            assert_eq!(outgoing, value + 1);
            assert_eq!(mux.represent_integer(outgoing, ResourceType::ObjectId), value);
        }
        assert_eq!(mux.represent_integer(1, ResourceType::Boolean), 1);
        assert_eq!(mux.represent_integer(2, ResourceType::Boolean), 0);
    }

    #[test]
    fn untouched_types_pass_through() {
        let snmp = SnmpDialect;
        assert_eq!(snmp.represent_integer(99, ResourceType::Counter), 99);
        let mut dst = [0u8; 8];
        let n = snmp.represent_value(&mut dst, b"abc", ResourceType::OctetStr);
        assert_eq!(&dst[..n], b"abc");
    }

    #[test]
    fn dotted_quad_packs_to_octets_and_nul() {
        let mut dst = [0xffu8; 8];
        let n = pack_dotted_quad(&mut dst, b"1.2.3.4");
        assert_eq!(n, 5);
        assert_eq!(&dst[..5], &[1, 2, 3, 4, 0]);
    }

    #[test]
    fn packed_octets_expand_to_dotted_quad() {
        let mut dst = [0xffu8; 16];
        let n = expand_packed_quad(&mut dst, &[1, 2, 3, 4]);
        assert_eq!(n, 8);
        assert_eq!(&dst[..8], b"1.2.3.4\0");
    }

    #[test]
    fn short_and_hostile_addresses_stay_in_bounds() {
        let mut dst = [0u8; 4];
        let n = pack_dotted_quad(&mut dst, b"10.0");
        assert_eq!(n, 3);
        assert_eq!(&dst[..2], &[10, 0]);

        let n = expand_packed_quad(&mut dst, &[192, 168, 0, 1]);
        // dst too small for the text; no NUL fits, length is what was copied
        assert_eq!(n, 4);

        let mut dst = [0u8; 8];
        let n = pack_dotted_quad(&mut dst, b"not-an-address");
        assert_eq!(n, 2);
        assert_eq!(dst[0], 0);
    }
}
