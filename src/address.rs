use std::net::Ipv4Addr;

/// Packs a dotted-decimal address into its big-endian `u32` form.
///
/// Input is trusted: octets are not range checked and non-digit bytes other
/// than `.` still feed the accumulator, so malformed text yields an
/// arbitrary but stable value.
pub(crate) fn encode(line: &[u8]) -> u32 {
    let mut result: u32 = 0;
    let mut octet: u32 = 0;
    for &b in line {
        if b == b'.' {
            result = (result << 8) | octet;
            octet = 0;
        } else {
            octet = octet
                .wrapping_mul(10)
                .wrapping_add(u32::from(b.wrapping_sub(b'0')));
        }
    }
    (result << 8) | octet
}

pub(crate) fn decode(addr: u32) -> Ipv4Addr {
    Ipv4Addr::from(addr)
}
