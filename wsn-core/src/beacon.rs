//! C4: Beacon Codec.
//!
//! Packs/unpacks the fixed-layout manufacturer-data advertisement. The
//! wire struct is laid out with `#[repr(C, packed)]` and read/written via
//! raw pointers, the same way the reference protocol moves bytes on and
//! off the air — no serde, no dynamic allocation.
//!
//! This implementation uses a 21-byte layout with the HMAC as its own
//! trailing byte, following the HMAC-follows-all-signed-fields
//! convention and matching `0xSCHEDMAG`-style framing used elsewhere in
//! the protocol.

use crate::auth::{hmac_tag, BEACON_TAG_LEN};

/// BLE manufacturer-data company identifier this protocol advertises
/// under.
pub const COMPANY_ID: u16 = 0x02E5;

/// On-air beacon layout: 21 bytes, little-endian.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
struct BeaconWire {
    company_id: u16,
    node_id: u32,
    score: f32,
    battery_u16: u16,
    trust_u16: u16,
    link_quality_u16: u16,
    mac_tail: [u8; 2],
    is_ch: u8,
    seq_num: u8,
    hmac_byte: u8,
}

impl BeaconWire {
    const SIZE: usize = core::mem::size_of::<Self>();

    /// Byte offset where the HMAC-signed region begins: `node_id`,
    /// at offset 2.
    const SIGNED_START: usize = 2;

    /// Byte offset one past the signed region's end, i.e. up to and
    /// including `seq_num`.
    const SIGNED_END: usize = Self::SIZE - 1;

    fn as_bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts((self as *const Self) as *const u8, Self::SIZE) }
    }

    fn signed_region(&self) -> &[u8] {
        &self.as_bytes()[Self::SIGNED_START..Self::SIGNED_END]
    }
}

/// A decoded, already-authenticated beacon.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Beacon {
    pub node_id: u32,
    pub score: f32,
    pub battery: f64,
    pub trust: f64,
    pub link_quality: f64,
    pub mac_tail: [u8; 2],
    pub is_ch: bool,
    pub seq_num: u8,
}

fn scale_u16(fraction: f64) -> u16 {
    (fraction.clamp(0.0, 1.0) * 10000.0).round() as u16
}

fn unscale_u16(raw: u16) -> f64 {
    raw as f64 / 10000.0
}

/// Encode a beacon frame, appending the truncated HMAC byte.
#[allow(clippy::too_many_arguments)]
pub fn encode(
    node_id: u32,
    score: f32,
    battery: f64,
    trust: f64,
    link_quality: f64,
    mac_tail: [u8; 2],
    is_ch: bool,
    seq_num: u8,
    cluster_key: &[u8],
) -> [u8; BeaconWire::SIZE] {
    let mut wire = BeaconWire {
        company_id: COMPANY_ID,
        node_id,
        score,
        battery_u16: scale_u16(battery),
        trust_u16: scale_u16(trust),
        link_quality_u16: scale_u16(link_quality),
        mac_tail,
        is_ch: is_ch as u8,
        seq_num,
        hmac_byte: 0,
    };
    let tag = hmac_tag(wire.signed_region(), cluster_key);
    wire.hmac_byte = tag[0];

    let mut out = [0u8; BeaconWire::SIZE];
    out.copy_from_slice(wire.as_bytes());
    out
}

/// Decode and authenticate a received beacon.
///
/// Rejects on wrong length, `company_id` mismatch, a sentinel or
/// self `node_id`, or an HMAC byte that does not match the recomputed
/// tag.
pub fn decode_and_validate(bytes: &[u8], own_node_id: u32, cluster_key: &[u8]) -> Option<Beacon> {
    if bytes.len() != BeaconWire::SIZE {
        return None;
    }

    let wire: BeaconWire = unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const BeaconWire) };

    if { wire.company_id } != COMPANY_ID {
        return None;
    }
    let node_id = { wire.node_id };
    if node_id == 0 || node_id == 0xFFFF_FFFF || node_id == own_node_id {
        return None;
    }

    let received_tag = [wire.hmac_byte];
    if !crate::auth::verify(wire.signed_region(), cluster_key, &received_tag, BEACON_TAG_LEN) {
        return None;
    }

    Some(Beacon {
        node_id,
        score: { wire.score },
        battery: unscale_u16({ wire.battery_u16 }),
        trust: unscale_u16({ wire.trust_u16 }),
        link_quality: unscale_u16({ wire.link_quality_u16 }),
        mac_tail: wire.mac_tail,
        is_ch: wire.is_ch != 0,
        seq_num: wire.seq_num,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"cluster-key";

    #[test]
    fn round_trip_within_quantization() {
        let bytes = encode(42, 0.734, 0.91, 0.55, 0.81, [0xAB, 0xCD], true, 7, KEY);
        let beacon = decode_and_validate(&bytes, 1, KEY).expect("valid beacon");
        assert_eq!(beacon.node_id, 42);
        assert!((beacon.score - 0.734).abs() < 1e-6);
        assert!((beacon.battery - 0.91).abs() < 1.0 / 10000.0);
        assert!((beacon.trust - 0.55).abs() < 1.0 / 10000.0);
        assert!((beacon.link_quality - 0.81).abs() < 1.0 / 10000.0);
        assert_eq!(beacon.mac_tail, [0xAB, 0xCD]);
        assert!(beacon.is_ch);
        assert_eq!(beacon.seq_num, 7);
    }

    #[test]
    fn rejects_sentinel_and_self_ids() {
        let bytes = encode(0, 0.5, 0.5, 0.5, 0.5, [0, 0], false, 0, KEY);
        assert!(decode_and_validate(&bytes, 1, KEY).is_none());

        let bytes = encode(0xFFFF_FFFF, 0.5, 0.5, 0.5, 0.5, [0, 0], false, 0, KEY);
        assert!(decode_and_validate(&bytes, 1, KEY).is_none());

        let bytes = encode(1, 0.5, 0.5, 0.5, 0.5, [0, 0], false, 0, KEY);
        assert!(decode_and_validate(&bytes, 1, KEY).is_none());
    }

    #[test]
    fn rejects_wrong_length_and_company_id() {
        let bytes = encode(2, 0.5, 0.5, 0.5, 0.5, [0, 0], false, 0, KEY);
        assert!(decode_and_validate(&bytes[..bytes.len() - 1], 1, KEY).is_none());

        let mut mangled = bytes;
        mangled[0] ^= 0xFF;
        assert!(decode_and_validate(&mangled, 1, KEY).is_none());
    }

    #[test]
    fn hmac_bit_flip_is_rejected() {
        let mut bytes = encode(2, 0.5, 0.5, 0.5, 0.5, [0, 0], false, 0, KEY);
        assert!(decode_and_validate(&bytes, 1, KEY).is_some());
        let last = bytes.len() - 1;
        bytes[2] ^= 0x01; // flip a signed byte, not the tag itself
        assert!(decode_and_validate(&bytes, 1, KEY).is_none());
        // also confirm the tag byte itself matters
        let mut bytes2 = encode(2, 0.5, 0.5, 0.5, 0.5, [0, 0], false, 0, KEY);
        bytes2[last] ^= 0x01;
        assert!(decode_and_validate(&bytes2, 1, KEY).is_none());
    }

    #[test]
    fn wrong_key_is_rejected() {
        let bytes = encode(2, 0.5, 0.5, 0.5, 0.5, [0, 0], false, 0, KEY);
        assert!(decode_and_validate(&bytes, 1, b"different-key").is_none());
    }
}
