//! CAVLC residual decoding (9.2): coeff_token, trailing-one signs, level
//! prefix/suffix with adaptation, total_zeros and run_before.
//!
//! Tables carry `(code_len, code_bits, total_coeff, trailing_ones)` rows from
//! table 9-5 of the standard, one slice per nC band. Decoding peeks a fixed
//! window and consumes the matched length, so codes can be listed in any
//! order; they are kept sorted by length for readability.

use crate::bitreader::BitReader;
use crate::error::{Error, Result};

type TokenRow = (u8, u16, u8, u8);

/// coeff_token VLC, 0 <= nC < 2.
const COEFF_TOKEN_NC_0: &[TokenRow] = &[
    (1, 0b1, 0, 0),
    (2, 0b01, 1, 1),
    (3, 0b001, 2, 2),
    (5, 0b00011, 3, 3),
    (6, 0b000101, 1, 0),
    (6, 0b000100, 2, 1),
    (6, 0b000011, 4, 3),
    (7, 0b0000101, 3, 2),
    (7, 0b0000100, 5, 3),
    (8, 0b00000111, 2, 0),
    (8, 0b00000110, 3, 1),
    (8, 0b00000101, 4, 2),
    (8, 0b00000100, 6, 3),
    (9, 0b000000111, 3, 0),
    (9, 0b000000110, 4, 1),
    (9, 0b000000101, 5, 2),
    (9, 0b000000100, 7, 3),
    (10, 0b0000000111, 4, 0),
    (10, 0b0000000110, 5, 1),
    (10, 0b0000000101, 6, 2),
    (10, 0b0000000100, 8, 3),
    (11, 0b00000000111, 5, 0),
    (11, 0b00000000110, 6, 1),
    (11, 0b00000000101, 7, 2),
    (11, 0b00000000100, 9, 3),
    (13, 0b0000000001111, 6, 0),
    (13, 0b0000000001110, 7, 1),
    (13, 0b0000000001101, 8, 2),
    (13, 0b0000000001100, 10, 3),
    (13, 0b0000000001011, 7, 0),
    (13, 0b0000000001010, 8, 1),
    (13, 0b0000000001001, 9, 2),
    (13, 0b0000000001000, 8, 0),
    (14, 0b00000000001111, 9, 0),
    (14, 0b00000000001110, 9, 1),
    (14, 0b00000000001101, 10, 2),
    (14, 0b00000000001100, 11, 3),
    (14, 0b00000000001011, 10, 0),
    (14, 0b00000000001010, 10, 1),
    (14, 0b00000000001001, 11, 2),
    (14, 0b00000000001000, 12, 3),
    (15, 0b000000000001111, 11, 0),
    (15, 0b000000000001110, 11, 1),
    (15, 0b000000000001101, 12, 2),
    (15, 0b000000000001100, 13, 3),
    (15, 0b000000000001011, 12, 0),
    (15, 0b000000000001010, 12, 1),
    (15, 0b000000000001001, 13, 2),
    (15, 0b000000000001000, 14, 3),
    (15, 0b000000000000001, 13, 1),
    (16, 0b0000000000001111, 13, 0),
    (16, 0b0000000000001110, 14, 1),
    (16, 0b0000000000001101, 14, 2),
    (16, 0b0000000000001100, 15, 3),
    (16, 0b0000000000001011, 14, 0),
    (16, 0b0000000000001010, 15, 1),
    (16, 0b0000000000001001, 15, 2),
    (16, 0b0000000000001000, 16, 3),
    (16, 0b0000000000000111, 15, 0),
    (16, 0b0000000000000110, 16, 1),
    (16, 0b0000000000000101, 16, 2),
    (16, 0b0000000000000100, 16, 0),
];

/// coeff_token VLC, 2 <= nC < 4.
const COEFF_TOKEN_NC_2: &[TokenRow] = &[
    (2, 0b11, 0, 0),
    (2, 0b10, 1, 1),
    (3, 0b011, 2, 2),
    (4, 0b0101, 3, 3),
    (4, 0b0100, 4, 3),
    (5, 0b00111, 2, 1),
    (5, 0b00110, 5, 3),
    (6, 0b001011, 1, 0),
    (6, 0b001010, 3, 1),
    (6, 0b001001, 3, 2),
    (6, 0b001000, 6, 3),
    (6, 0b000111, 2, 0),
    (6, 0b000110, 4, 1),
    (6, 0b000101, 4, 2),
    (6, 0b000100, 7, 3),
    (7, 0b0000111, 3, 0),
    (7, 0b0000110, 5, 1),
    (7, 0b0000101, 5, 2),
    (7, 0b0000100, 8, 3),
    (8, 0b00000111, 4, 0),
    (8, 0b00000110, 6, 1),
    (8, 0b00000101, 6, 2),
    (8, 0b00000100, 5, 0),
    (9, 0b000000111, 6, 0),
    (9, 0b000000110, 7, 1),
    (9, 0b000000101, 7, 2),
    (9, 0b000000100, 9, 3),
    (11, 0b00000001111, 7, 0),
    (11, 0b00000001110, 8, 1),
    (11, 0b00000001101, 8, 2),
    (11, 0b00000001100, 10, 3),
    (11, 0b00000001011, 8, 0),
    (11, 0b00000001010, 9, 1),
    (11, 0b00000001001, 9, 2),
    (11, 0b00000001000, 11, 3),
    (12, 0b000000001111, 9, 0),
    (12, 0b000000001110, 10, 1),
    (12, 0b000000001101, 10, 2),
    (12, 0b000000001100, 12, 3),
    (12, 0b000000001011, 10, 0),
    (12, 0b000000001010, 11, 1),
    (12, 0b000000001001, 11, 2),
    (12, 0b000000001000, 11, 0),
    (13, 0b0000000001111, 12, 0),
    (13, 0b0000000001110, 12, 1),
    (13, 0b0000000001101, 12, 2),
    (13, 0b0000000001100, 13, 3),
    (13, 0b0000000001011, 13, 0),
    (13, 0b0000000001010, 13, 1),
    (13, 0b0000000001001, 13, 2),
    (13, 0b0000000001000, 14, 3),
    (13, 0b0000000000111, 14, 0),
    (13, 0b0000000000110, 15, 3),
    (14, 0b00000000001011, 14, 1),
    (14, 0b00000000001010, 14, 2),
    (14, 0b00000000001001, 15, 0),
    (14, 0b00000000001000, 15, 1),
    (14, 0b00000000000111, 15, 2),
    (14, 0b00000000000110, 16, 0),
    (14, 0b00000000000101, 16, 1),
    (14, 0b00000000000100, 16, 2),
    (14, 0b00000000000011, 16, 3),
];

/// coeff_token VLC, 4 <= nC < 8.
const COEFF_TOKEN_NC_4: &[TokenRow] = &[
    (4, 0b1111, 0, 0),
    (4, 0b1110, 1, 1),
    (4, 0b1101, 2, 2),
    (4, 0b1100, 3, 3),
    (4, 0b1011, 4, 3),
    (4, 0b1010, 5, 3),
    (4, 0b1001, 6, 3),
    (4, 0b1000, 7, 3),
    (5, 0b01111, 2, 1),
    (5, 0b01110, 3, 2),
    (5, 0b01101, 8, 3),
    (5, 0b01100, 3, 1),
    (5, 0b01011, 4, 2),
    (5, 0b01010, 4, 1),
    (5, 0b01001, 5, 2),
    (5, 0b01000, 5, 1),
    (6, 0b001111, 1, 0),
    (6, 0b001110, 6, 1),
    (6, 0b001101, 6, 2),
    (6, 0b001100, 9, 3),
    (6, 0b001011, 2, 0),
    (6, 0b001010, 7, 1),
    (6, 0b001001, 7, 2),
    (6, 0b001000, 3, 0),
    (7, 0b0001111, 4, 0),
    (7, 0b0001110, 8, 1),
    (7, 0b0001101, 8, 2),
    (7, 0b0001100, 10, 3),
    (7, 0b0001011, 5, 0),
    (7, 0b0001010, 9, 2),
    (7, 0b0001001, 6, 0),
    (7, 0b0001000, 7, 0),
    (8, 0b00001111, 8, 0),
    (8, 0b00001110, 9, 1),
    (8, 0b00001101, 10, 2),
    (8, 0b00001100, 11, 3),
    (8, 0b00001011, 9, 0),
    (8, 0b00001010, 10, 1),
    (8, 0b00001001, 11, 2),
    (8, 0b00001000, 12, 3),
    (9, 0b000001111, 10, 0),
    (9, 0b000001110, 11, 1),
    (9, 0b000001101, 12, 2),
    (9, 0b000001100, 13, 3),
    (9, 0b000001011, 11, 0),
    (9, 0b000001010, 12, 1),
    (9, 0b000001001, 13, 2),
    (9, 0b000001000, 12, 0),
    (9, 0b000000111, 13, 1),
    (10, 0b0000001101, 13, 0),
    (10, 0b0000001100, 14, 1),
    (10, 0b0000001011, 14, 2),
    (10, 0b0000001010, 14, 3),
    (10, 0b0000001001, 14, 0),
    (10, 0b0000001000, 15, 1),
    (10, 0b0000000111, 15, 2),
    (10, 0b0000000110, 15, 3),
    (10, 0b0000000101, 15, 0),
    (10, 0b0000000100, 16, 1),
    (10, 0b0000000011, 16, 2),
    (10, 0b0000000010, 16, 3),
    (10, 0b0000000001, 16, 0),
];

/// coeff_token VLC for chroma DC blocks (nC == -1, 4:2:0).
const COEFF_TOKEN_CHROMA_DC: &[TokenRow] = &[
    (1, 0b1, 1, 1),
    (2, 0b01, 0, 0),
    (3, 0b001, 2, 2),
    (6, 0b000111, 1, 0),
    (6, 0b000110, 2, 1),
    (6, 0b000101, 3, 3),
    (6, 0b000100, 2, 0),
    (6, 0b000011, 3, 0),
    (6, 0b000010, 4, 0),
    (7, 0b0000011, 3, 1),
    (7, 0b0000010, 3, 2),
    (7, 0b0000000, 4, 3),
    (8, 0b00000011, 4, 1),
    (8, 0b00000010, 4, 2),
];

type VlcRow = (u8, u16, u8);

/// total_zeros for 4x4 blocks, tables 9-7 and 9-8, indexed by TotalCoeff-1.
/// Rows are `(len, code, total_zeros)`.
const TOTAL_ZEROS_4X4: [&[VlcRow]; 15] = [
    // TotalCoeff == 1
    &[
        (1, 0b1, 0),
        (3, 0b011, 1),
        (3, 0b010, 2),
        (4, 0b0011, 3),
        (4, 0b0010, 4),
        (5, 0b00011, 5),
        (5, 0b00010, 6),
        (6, 0b000011, 7),
        (6, 0b000010, 8),
        (7, 0b0000011, 9),
        (7, 0b0000010, 10),
        (8, 0b00000011, 11),
        (8, 0b00000010, 12),
        (9, 0b000000011, 13),
        (9, 0b000000010, 14),
        (9, 0b000000001, 15),
    ],
    // 2
    &[
        (3, 0b111, 0),
        (3, 0b110, 1),
        (3, 0b101, 2),
        (3, 0b100, 3),
        (3, 0b011, 4),
        (4, 0b0101, 5),
        (4, 0b0100, 6),
        (4, 0b0011, 7),
        (4, 0b0010, 8),
        (5, 0b00011, 9),
        (5, 0b00010, 10),
        (6, 0b000011, 11),
        (6, 0b000010, 12),
        (6, 0b000001, 13),
        (6, 0b000000, 14),
    ],
    // 3
    &[
        (4, 0b0101, 0),
        (3, 0b111, 1),
        (3, 0b110, 2),
        (3, 0b101, 3),
        (4, 0b0100, 4),
        (4, 0b0011, 5),
        (3, 0b100, 6),
        (3, 0b011, 7),
        (4, 0b0010, 8),
        (5, 0b00011, 9),
        (5, 0b00010, 10),
        (6, 0b000001, 11),
        (5, 0b00001, 12),
        (6, 0b000000, 13),
    ],
    // 4
    &[
        (5, 0b00011, 0),
        (3, 0b111, 1),
        (4, 0b0101, 2),
        (4, 0b0100, 3),
        (3, 0b110, 4),
        (3, 0b101, 5),
        (3, 0b100, 6),
        (4, 0b0011, 7),
        (3, 0b011, 8),
        (4, 0b0010, 9),
        (5, 0b00010, 10),
        (5, 0b00001, 11),
        (5, 0b00000, 12),
    ],
    // 5
    &[
        (4, 0b0101, 0),
        (4, 0b0100, 1),
        (4, 0b0011, 2),
        (3, 0b111, 3),
        (3, 0b110, 4),
        (3, 0b101, 5),
        (3, 0b100, 6),
        (3, 0b011, 7),
        (4, 0b0010, 8),
        (5, 0b00001, 9),
        (4, 0b0001, 10),
        (5, 0b00000, 11),
    ],
    // 6
    &[
        (6, 0b000001, 0),
        (5, 0b00001, 1),
        (3, 0b111, 2),
        (3, 0b110, 3),
        (3, 0b101, 4),
        (3, 0b100, 5),
        (3, 0b011, 6),
        (3, 0b010, 7),
        (4, 0b0001, 8),
        (3, 0b001, 9),
        (6, 0b000000, 10),
    ],
    // 7
    &[
        (6, 0b000001, 0),
        (5, 0b00001, 1),
        (3, 0b101, 2),
        (3, 0b100, 3),
        (3, 0b011, 4),
        (2, 0b11, 5),
        (3, 0b010, 6),
        (4, 0b0001, 7),
        (3, 0b001, 8),
        (6, 0b000000, 9),
    ],
    // 8
    &[
        (6, 0b000001, 0),
        (4, 0b0001, 1),
        (5, 0b00001, 2),
        (3, 0b011, 3),
        (2, 0b11, 4),
        (2, 0b10, 5),
        (3, 0b010, 6),
        (3, 0b001, 7),
        (6, 0b000000, 8),
    ],
    // 9
    &[
        (6, 0b000001, 0),
        (6, 0b000000, 1),
        (4, 0b0001, 2),
        (2, 0b11, 3),
        (2, 0b10, 4),
        (3, 0b001, 5),
        (2, 0b01, 6),
        (5, 0b00001, 7),
    ],
    // 10
    &[
        (5, 0b00001, 0),
        (5, 0b00000, 1),
        (3, 0b001, 2),
        (2, 0b11, 3),
        (2, 0b10, 4),
        (2, 0b01, 5),
        (4, 0b0001, 6),
    ],
    // 11
    &[
        (4, 0b0000, 0),
        (4, 0b0001, 1),
        (3, 0b001, 2),
        (3, 0b010, 3),
        (1, 0b1, 4),
        (3, 0b011, 5),
    ],
    // 12
    &[
        (4, 0b0000, 0),
        (4, 0b0001, 1),
        (2, 0b01, 2),
        (1, 0b1, 3),
        (3, 0b001, 4),
    ],
    // 13
    &[(3, 0b000, 0), (3, 0b001, 1), (1, 0b1, 2), (2, 0b01, 3)],
    // 14
    &[(2, 0b00, 0), (2, 0b01, 1), (1, 0b1, 2)],
    // 15
    &[(1, 0b0, 0), (1, 0b1, 1)],
];

/// total_zeros for chroma DC blocks, table 9-9(a), indexed by TotalCoeff-1.
const TOTAL_ZEROS_CHROMA_DC: [&[VlcRow]; 3] = [
    &[(1, 0b1, 0), (2, 0b01, 1), (3, 0b001, 2), (3, 0b000, 3)],
    &[(1, 0b1, 0), (2, 0b01, 1), (2, 0b00, 2)],
    &[(1, 0b1, 0), (1, 0b0, 1)],
];

/// run_before, table 9-10, indexed by min(zerosLeft, 7) - 1. Runs of 7..14
/// under the last row are handled arithmetically.
const RUN_BEFORE: [&[VlcRow]; 7] = [
    &[(1, 0b1, 0), (1, 0b0, 1)],
    &[(1, 0b1, 0), (2, 0b01, 1), (2, 0b00, 2)],
    &[(2, 0b11, 0), (2, 0b10, 1), (2, 0b01, 2), (2, 0b00, 3)],
    &[
        (2, 0b11, 0),
        (2, 0b10, 1),
        (2, 0b01, 2),
        (3, 0b001, 3),
        (3, 0b000, 4),
    ],
    &[
        (2, 0b11, 0),
        (2, 0b10, 1),
        (3, 0b011, 2),
        (3, 0b010, 3),
        (3, 0b001, 4),
        (3, 0b000, 5),
    ],
    &[
        (2, 0b11, 0),
        (3, 0b000, 1),
        (3, 0b001, 2),
        (3, 0b011, 3),
        (3, 0b010, 4),
        (3, 0b101, 5),
        (3, 0b100, 6),
    ],
    &[
        (3, 0b111, 0),
        (3, 0b110, 1),
        (3, 0b101, 2),
        (3, 0b100, 3),
        (3, 0b011, 4),
        (3, 0b010, 5),
        (3, 0b001, 6),
    ],
];

fn match_vlc(reader: &mut BitReader<'_>, table: &[VlcRow], what: &'static str) -> Result<u8> {
    let peek = reader.peek_bits_padded(16);
    for &(len, code, value) in table {
        if peek >> (16 - len as u32) == code as u32 {
            reader.skip_bits(len as u32)?;
            return Ok(value);
        }
    }
    Err(Error::Bitstream(format!("no {what} code matched")))
}

/// Decode coeff_token: returns `(total_coeff, trailing_ones)`.
///
/// `nc` is the neighbour-derived predictor, or -1 for chroma DC blocks.
pub fn decode_coeff_token(reader: &mut BitReader<'_>, nc: i32) -> Result<(u8, u8)> {
    if nc >= 8 {
        // Fixed 6-bit codes: 4*(TotalCoeff-1) + TrailingOnes, with 000011
        // reserved for the empty block.
        let code = reader.read_bits(6)?;
        if code == 0b000011 {
            return Ok((0, 0));
        }
        let total_coeff = (code >> 2) as u8 + 1;
        let trailing_ones = (code & 0b11) as u8;
        if trailing_ones > total_coeff {
            return Err(Error::Bitstream("invalid fixed-length coeff_token".into()));
        }
        return Ok((total_coeff, trailing_ones));
    }

    let table = match nc {
        -1 => COEFF_TOKEN_CHROMA_DC,
        0 | 1 => COEFF_TOKEN_NC_0,
        2 | 3 => COEFF_TOKEN_NC_2,
        _ => COEFF_TOKEN_NC_4,
    };

    let peek = reader.peek_bits_padded(16);
    for &(len, code, total_coeff, trailing_ones) in table {
        if peek >> (16 - len as u32) == code as u32 {
            reader.skip_bits(len as u32)?;
            return Ok((total_coeff, trailing_ones));
        }
    }
    Err(Error::Bitstream(format!("no coeff_token matched for nC {nc}")))
}

fn decode_level(reader: &mut BitReader<'_>, suffix_length: u32) -> Result<i32> {
    let mut level_prefix = 0u32;
    while !reader.read_bit()? {
        level_prefix += 1;
        if level_prefix > 31 {
            return Err(Error::Bitstream("level_prefix too long".into()));
        }
    }

    // Escape suffixes grow with the prefix: level_prefix - 3 bits once the
    // prefix reaches 15.
    let mut level_code: i32;
    if suffix_length == 0 {
        if level_prefix < 14 {
            level_code = level_prefix as i32;
        } else if level_prefix == 14 {
            level_code = 14 + reader.read_bits(4)? as i32;
        } else {
            level_code = 30 + reader.read_bits(level_prefix - 3)? as i32;
        }
    } else if level_prefix < 15 {
        level_code =
            ((level_prefix << suffix_length) + reader.read_bits(suffix_length)?) as i32;
    } else {
        level_code = ((15 << suffix_length) + reader.read_bits(level_prefix - 3)?) as i32;
    }

    // High-QP extension for very long prefixes.
    if level_prefix >= 16 {
        level_code += (1 << (level_prefix - 3)) - 4096;
    }

    Ok(level_code)
}

fn decode_run_before(reader: &mut BitReader<'_>, zeros_left: u32) -> Result<u32> {
    let row = RUN_BEFORE[(zeros_left.min(7) - 1) as usize];
    if zeros_left <= 6 {
        return Ok(match_vlc(reader, row, "run_before")? as u32);
    }

    let peek = reader.peek_bits_padded(16);
    for &(len, code, value) in row {
        if peek >> (16 - len as u32) == code as u32 {
            reader.skip_bits(len as u32)?;
            return Ok(value as u32);
        }
    }

    // Runs 7..14: `run - 4` zeros followed by a one.
    let mut zeros = 3u32;
    reader.skip_bits(3)?;
    while !reader.read_bit()? {
        zeros += 1;
        if zeros > 10 {
            return Err(Error::Bitstream("run_before code overlong".into()));
        }
    }
    Ok(zeros + 4)
}

/// One decoded residual block in scan order, plus the coefficient count the
/// neighbour nC derivation needs.
#[derive(Debug, Clone, Copy)]
pub struct ResidualBlock {
    pub coeffs: [i32; 16],
    pub total_coeff: u8,
}

/// Decode one residual block of up to `max_coeff` coefficients (16 for full
/// 4x4, 15 for AC-only, 4 for chroma DC).
pub fn residual_block(
    reader: &mut BitReader<'_>,
    nc: i32,
    max_coeff: usize,
) -> Result<ResidualBlock> {
    let (total_coeff, trailing_ones) = decode_coeff_token(reader, nc)?;
    let mut out = ResidualBlock {
        coeffs: [0; 16],
        total_coeff,
    };

    if total_coeff == 0 {
        return Ok(out);
    }
    if total_coeff as usize > max_coeff {
        return Err(Error::Bitstream(format!(
            "coeff_token yields {total_coeff} coefficients in a {max_coeff}-coefficient block"
        )));
    }

    // Levels, highest frequency first.
    let mut levels = [0i32; 16];
    let mut suffix_length = if total_coeff > 10 && trailing_ones < 3 {
        1u32
    } else {
        0
    };

    for i in 0..total_coeff as usize {
        if i < trailing_ones as usize {
            levels[i] = if reader.read_bit()? { -1 } else { 1 };
            continue;
        }

        let mut level_code = decode_level(reader, suffix_length)?;
        if i == trailing_ones as usize && trailing_ones < 3 {
            level_code += 2;
        }
        levels[i] = if level_code % 2 == 0 {
            (level_code + 2) >> 1
        } else {
            -((level_code + 1) >> 1)
        };

        if suffix_length == 0 {
            suffix_length = 1;
        }
        if levels[i].unsigned_abs() > (3u32 << (suffix_length - 1)) && suffix_length < 6 {
            suffix_length += 1;
        }
    }

    // Zero placement.
    let total_zeros = if (total_coeff as usize) < max_coeff {
        let row = if nc == -1 {
            TOTAL_ZEROS_CHROMA_DC[total_coeff as usize - 1]
        } else {
            TOTAL_ZEROS_4X4[total_coeff as usize - 1]
        };
        match_vlc(reader, row, "total_zeros")? as u32
    } else {
        0
    };

    let mut zeros_left = total_zeros;
    let mut pos = total_zeros as usize + total_coeff as usize - 1;
    for i in 0..total_coeff as usize {
        let run_before = if i == total_coeff as usize - 1 {
            zeros_left
        } else if zeros_left > 0 {
            decode_run_before(reader, zeros_left)?
        } else {
            0
        };
        if run_before > zeros_left {
            return Err(Error::Bitstream("run_before exceeds zeros_left".into()));
        }

        out.coeffs[pos] = levels[i];
        zeros_left -= run_before;
        if i + 1 < total_coeff as usize {
            pos = pos
                .checked_sub(1 + run_before as usize)
                .ok_or_else(|| Error::Bitstream("run_before underflows block".into()))?;
        }
    }

    Ok(out)
}

/// nC predictor from neighbouring block coefficient counts (9.2.1).
pub fn nc_from_neighbors(left: Option<u8>, above: Option<u8>) -> i32 {
    match (left, above) {
        (Some(a), Some(b)) => ((a as i32) + (b as i32) + 1) >> 1,
        (Some(a), None) => a as i32,
        (None, Some(b)) => b as i32,
        (None, None) => 0,
    }
}
