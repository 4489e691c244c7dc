use crate::error::{Error, Result};

/// ISO/IEC 14496-10 table 7-1 unit types, as far as this decoder cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitType {
    NonIdrSlice,
    IdrSlice,
    Sei,
    Sps,
    Pps,
    AccessUnitDelimiter,
    EndOfSequence,
    EndOfStream,
    Filler,
    Other(u8),
}

impl From<u8> for NalUnitType {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::NonIdrSlice,
            5 => Self::IdrSlice,
            6 => Self::Sei,
            7 => Self::Sps,
            8 => Self::Pps,
            9 => Self::AccessUnitDelimiter,
            10 => Self::EndOfSequence,
            11 => Self::EndOfStream,
            12 => Self::Filler,
            v => Self::Other(v),
        }
    }
}

/// A NAL unit as found in the elementary stream: one header byte plus the
/// still-escaped payload (EBSP).
#[derive(Debug, Clone)]
pub struct Nal<'a> {
    pub ref_idc: u8,
    pub unit_type: NalUnitType,
    pub ebsp: &'a [u8],
}

impl<'a> Nal<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let Some(&header) = data.first() else {
            return Err(Error::Bitstream("empty NAL unit".into()));
        };

        if header & 0x80 != 0 {
            return Err(Error::Bitstream("forbidden_zero_bit set".into()));
        }

        Ok(Nal {
            ref_idc: (header >> 5) & 0b11,
            unit_type: NalUnitType::from(header & 0b1_1111),
            ebsp: &data[1..],
        })
    }

    /// Unescape the payload into a fresh RBSP buffer.
    ///
    /// The input bytes are left untouched so the same access unit can be
    /// reparsed.
    pub fn to_rbsp(&self) -> Vec<u8> {
        ebsp_to_rbsp(self.ebsp)
    }
}

/// Strip emulation-prevention bytes: `00 00 03` becomes `00 00`.
pub fn ebsp_to_rbsp(ebsp: &[u8]) -> Vec<u8> {
    let mut rbsp = Vec::with_capacity(ebsp.len());
    let mut i = 0;

    while i < ebsp.len() {
        if i + 2 < ebsp.len() && ebsp[i] == 0x00 && ebsp[i + 1] == 0x00 && ebsp[i + 2] == 0x03 {
            rbsp.push(0x00);
            rbsp.push(0x00);
            i += 3;
        } else {
            rbsp.push(ebsp[i]);
            i += 1;
        }
    }

    rbsp
}

/// Re-escape an RBSP for embedding in a byte stream (tests and fixtures).
pub fn rbsp_to_ebsp(rbsp: &[u8]) -> Vec<u8> {
    let mut ebsp = Vec::with_capacity(rbsp.len() + rbsp.len() / 3);
    let mut zero_count = 0;

    for &byte in rbsp {
        if zero_count == 2 && byte <= 0x03 {
            ebsp.push(0x03);
            zero_count = 0;
        }

        ebsp.push(byte);

        if byte == 0x00 {
            zero_count += 1;
        } else {
            zero_count = 0;
        }
    }

    ebsp
}

/// Iterator over Annex B byte-stream NAL units (`00 00 01` / `00 00 00 01`
/// delimited). Yields the raw unit bytes, header included.
pub struct AnnexBUnits<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> AnnexBUnits<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn find_start_code(&self, from: usize) -> Option<(usize, usize)> {
        let mut i = from;
        while i + 3 <= self.data.len() {
            if self.data[i] == 0 && self.data[i + 1] == 0 {
                if self.data[i + 2] == 1 {
                    return Some((i, 3));
                }
                if i + 4 <= self.data.len() && self.data[i + 2] == 0 && self.data[i + 3] == 1 {
                    return Some((i, 4));
                }
            }
            i += 1;
        }
        None
    }
}

impl<'a> Iterator for AnnexBUnits<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        let (start, code_len) = self.find_start_code(self.pos)?;
        let unit_start = start + code_len;
        let unit_end = self
            .find_start_code(unit_start)
            .map(|(next, _)| next)
            .unwrap_or(self.data.len());
        self.pos = unit_end;

        // Trailing zeros before the next start code belong to it, not to us.
        let mut end = unit_end;
        while end > unit_start && self.data[end - 1] == 0 {
            end -= 1;
        }
        if end == unit_start {
            return self.next();
        }
        Some(&self.data[unit_start..end])
    }
}

/// Walk AVCC length-prefixed NAL units (`length_size` big-endian bytes per
/// prefix, from `avcC`).
pub fn split_length_prefixed(sample: &[u8], length_size: usize) -> Result<Vec<&[u8]>> {
    if !matches!(length_size, 1 | 2 | 4) {
        return Err(Error::Unsupported(format!(
            "NAL length prefix of {length_size} bytes"
        )));
    }

    let mut out = Vec::new();
    let mut i = 0usize;
    while i + length_size <= sample.len() {
        let len = match length_size {
            1 => sample[i] as usize,
            2 => u16::from_be_bytes([sample[i], sample[i + 1]]) as usize,
            4 => u32::from_be_bytes([sample[i], sample[i + 1], sample[i + 2], sample[i + 3]])
                as usize,
            _ => unreachable!(),
        };
        i += length_size;
        if len == 0 || i + len > sample.len() {
            return Err(Error::Bitstream(format!(
                "NAL length {len} overruns sample of {} bytes at {i}",
                sample.len()
            )));
        }
        out.push(&sample[i..i + len]);
        i += len;
    }
    Ok(out)
}

/// Rewrite an AVCC length-prefixed sample into Annex B framing with 4-byte
/// start codes, appending to `out`.
pub fn rewrite_avcc_to_annex_b(sample: &[u8], length_size: usize, out: &mut Vec<u8>) -> Result<()> {
    for unit in split_length_prefixed(sample, length_size)? {
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(unit);
    }
    Ok(())
}

/// SEI payload walk: ff-escaped type and size pairs until the stop bit.
///
/// Returns `(payload_type, payload_bytes)` tuples; the caller decides which
/// payloads it understands.
pub fn parse_sei_messages(rbsp: &[u8]) -> Vec<(u32, Vec<u8>)> {
    let mut out = Vec::new();
    let mut i = 0usize;

    while i < rbsp.len() {
        let mut payload_type: u32 = 0;
        while i < rbsp.len() && rbsp[i] == 0xff {
            payload_type += 255;
            i += 1;
        }
        if i >= rbsp.len() {
            break;
        }
        payload_type += rbsp[i] as u32;
        i += 1;

        let mut payload_size: usize = 0;
        while i < rbsp.len() && rbsp[i] == 0xff {
            payload_size += 255;
            i += 1;
        }
        if i >= rbsp.len() {
            break;
        }
        payload_size += rbsp[i] as usize;
        i += 1;

        if i + payload_size > rbsp.len() {
            break;
        }
        out.push((payload_type, rbsp[i..i + payload_size].to_vec()));
        i += payload_size;

        // rbsp_trailing_bits follow; stop once only the stop bit remains.
        if rbsp.len().saturating_sub(i) <= 1 {
            break;
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nal_header_parse() {
        let data = [0x67, 0x42, 0x00, 0x1f];
        let nal = Nal::parse(&data).unwrap();
        assert_eq!(nal.ref_idc, 3);
        assert_eq!(nal.unit_type, NalUnitType::Sps);
        assert_eq!(nal.ebsp, &[0x42, 0x00, 0x1f]);

        assert!(Nal::parse(&[0x80]).is_err());
        assert!(Nal::parse(&[]).is_err());
    }

    #[test]
    fn ebsp_rbsp_roundtrip() {
        let ebsp = vec![0x00, 0x00, 0x03, 0x00, 0x00, 0x03, 0x01, 0x00, 0x00, 0x03, 0x02];
        let rbsp = ebsp_to_rbsp(&ebsp);
        assert_eq!(rbsp, vec![0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x02]);
        assert_eq!(rbsp_to_ebsp(&rbsp), ebsp);
    }

    #[test]
    fn annex_b_scan_finds_both_start_code_lengths() {
        let stream = [
            0x00, 0x00, 0x00, 0x01, 0x67, 0xaa, // 4-byte code
            0x00, 0x00, 0x01, 0x68, 0xbb, // 3-byte code
            0x00, 0x00, 0x00, 0x01, 0x65, 0xcc, 0xdd,
        ];
        let units: Vec<&[u8]> = AnnexBUnits::new(&stream).collect();
        assert_eq!(units.len(), 3);
        assert_eq!(units[0], &[0x67, 0xaa]);
        assert_eq!(units[1], &[0x68, 0xbb]);
        assert_eq!(units[2], &[0x65, 0xcc, 0xdd]);
    }

    #[test]
    fn annex_b_scan_strips_trailing_zeros() {
        let stream = [0x00, 0x00, 0x01, 0x67, 0xaa, 0x00, 0x00, 0x00, 0x00, 0x01, 0x68];
        let units: Vec<&[u8]> = AnnexBUnits::new(&stream).collect();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0], &[0x67, 0xaa]);
        assert_eq!(units[1], &[0x68]);
    }

    #[test]
    fn length_prefixed_walk() {
        let sample = [0x00, 0x02, 0x65, 0xaa, 0x00, 0x01, 0x06];
        let units = split_length_prefixed(&sample, 2).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0], &[0x65, 0xaa]);
        assert_eq!(units[1], &[0x06]);

        let truncated = [0x00, 0x05, 0x65];
        assert!(split_length_prefixed(&truncated, 2).is_err());
    }

    #[test]
    fn avcc_rewrite_emits_start_codes() {
        let sample = [
            0x00, 0x00, 0x00, 0x02, 0x65, 0xaa, // 4-byte length prefix
            0x00, 0x00, 0x00, 0x01, 0x06,
        ];
        let mut out = Vec::new();
        rewrite_avcc_to_annex_b(&sample, 4, &mut out).unwrap();
        assert_eq!(
            out,
            vec![0x00, 0x00, 0x00, 0x01, 0x65, 0xaa, 0x00, 0x00, 0x00, 0x01, 0x06]
        );

        let units: Vec<&[u8]> = AnnexBUnits::new(&out).collect();
        assert_eq!(units.len(), 2);
    }

    #[test]
    fn sei_payload_walk() {
        // payload type 6 (recovery point), size 2, then stop bit byte.
        let rbsp = [0x06, 0x02, 0x11, 0x22, 0x80];
        let messages = parse_sei_messages(&rbsp);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, 6);
        assert_eq!(messages[0].1, vec![0x11, 0x22]);
    }

    #[test]
    fn sei_ff_escaped_type() {
        let rbsp = [0xff, 0x02, 0x01, 0xab, 0x80];
        let messages = parse_sei_messages(&rbsp);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, 257);
        assert_eq!(messages[0].1, vec![0xab]);
    }
}
