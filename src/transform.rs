use crate::params::ScalingMatrix;

/// Zig-zag scan position -> raster index, 4x4.
pub const ZIGZAG_4X4: [usize; 16] = [0, 1, 4, 8, 5, 2, 3, 6, 9, 12, 13, 10, 7, 11, 14, 15];

/// Zig-zag scan position -> raster index, 8x8.
pub const ZIGZAG_8X8: [usize; 64] = [
    0, 1, 8, 16, 9, 2, 3, 10, 17, 24, 32, 25, 18, 11, 4, 5, 12, 19, 26, 33, 40, 48, 41, 34, 27,
    20, 13, 6, 7, 14, 21, 28, 35, 42, 49, 56, 57, 50, 43, 36, 29, 22, 15, 23, 30, 37, 44, 51, 58,
    59, 52, 45, 38, 31, 39, 46, 53, 60, 61, 54, 47, 55, 62, 63,
];

/// Base dequantizer vectors, one row per qp%6. Columns select by the
/// coefficient position parity, table 8-15 of the standard.
const V4X4: [[i32; 3]; 6] = [
    [10, 16, 13],
    [11, 18, 14],
    [13, 20, 16],
    [14, 23, 18],
    [16, 25, 20],
    [18, 29, 23],
];

const V8X8: [[i32; 6]; 6] = [
    [20, 18, 32, 19, 25, 24],
    [22, 19, 35, 21, 28, 26],
    [26, 23, 42, 24, 33, 31],
    [28, 25, 45, 26, 35, 33],
    [32, 28, 51, 30, 40, 38],
    [36, 32, 58, 34, 46, 43],
];

/// Dequantizer tables for one decoding context, combining the parity-derived
/// norm-adjust values with the active scaling lists.
///
/// `level_scale_*` corresponds to LevelScale in the standard: weight from the
/// scan-ordered scaling list times the norm-adjust value at that position.
pub struct QuantTables {
    pub norm_adjust_4x4: [[[i32; 4]; 4]; 6],
    pub norm_adjust_8x8: [[[i32; 8]; 8]; 6],
    /// Indexed by [list][qp%6][i][j]; lists 0..2 intra Y/Cb/Cr.
    pub level_scale_4x4: [[[[i32; 4]; 4]; 6]; 3],
    /// Luma intra 8x8.
    pub level_scale_8x8: [[[i32; 8]; 8]; 6],
}

impl QuantTables {
    pub fn new(matrix: &ScalingMatrix) -> Self {
        let mut norm_adjust_4x4 = [[[0i32; 4]; 4]; 6];
        let mut norm_adjust_8x8 = [[[0i32; 8]; 8]; 6];

        for q in 0..6 {
            for i in 0..4 {
                for j in 0..4 {
                    norm_adjust_4x4[q][i][j] = if i % 2 == 0 && j % 2 == 0 {
                        V4X4[q][0]
                    } else if i % 2 == 1 && j % 2 == 1 {
                        V4X4[q][1]
                    } else {
                        V4X4[q][2]
                    };
                }
            }

            for i in 0..8 {
                for j in 0..8 {
                    norm_adjust_8x8[q][i][j] = if i % 4 == 0 && j % 4 == 0 {
                        V8X8[q][0]
                    } else if i % 2 == 1 && j % 2 == 1 {
                        V8X8[q][1]
                    } else if i % 4 == 2 && j % 4 == 2 {
                        V8X8[q][2]
                    } else if (i % 4 == 0 && j % 2 == 1) || (i % 2 == 1 && j % 4 == 0) {
                        V8X8[q][3]
                    } else if (i % 4 == 0 && j % 4 == 2) || (i % 4 == 2 && j % 4 == 0) {
                        V8X8[q][4]
                    } else {
                        V8X8[q][5]
                    };
                }
            }
        }

        // Scaling lists are stored in scan order; spread them to raster
        // positions while folding in the norm-adjust factors.
        let mut level_scale_4x4 = [[[[0i32; 4]; 4]; 6]; 3];
        for (list, scale) in level_scale_4x4.iter_mut().enumerate() {
            for (k, &raster) in ZIGZAG_4X4.iter().enumerate() {
                let w = matrix.m4x4[list][k] as i32;
                let (i, j) = (raster / 4, raster % 4);
                for q in 0..6 {
                    scale[q][i][j] = w * norm_adjust_4x4[q][i][j];
                }
            }
        }

        let mut level_scale_8x8 = [[[0i32; 8]; 8]; 6];
        for (k, &raster) in ZIGZAG_8X8.iter().enumerate() {
            let w = matrix.m8x8[0][k] as i32;
            let (i, j) = (raster / 8, raster % 8);
            for q in 0..6 {
                level_scale_8x8[q][i][j] = w * norm_adjust_8x8[q][i][j];
            }
        }

        Self {
            norm_adjust_4x4,
            norm_adjust_8x8,
            level_scale_4x4,
            level_scale_8x8,
        }
    }

    /// Scale one 4x4 residual block in place (AC path, 8.5.12.1).
    ///
    /// `skip_dc` leaves position (0,0) alone for blocks whose DC arrives via
    /// a separate Hadamard pass.
    pub fn dequant_4x4(&self, block: &mut [i32; 16], list: usize, qp: i32, skip_dc: bool) {
        let m = (qp % 6) as usize;
        let shift = qp / 6;
        let scale = &self.level_scale_4x4[list][m];
        for idx in 0..16 {
            if skip_dc && idx == 0 {
                continue;
            }
            let (i, j) = (idx / 4, idx % 4);
            let c = block[idx];
            block[idx] = if shift >= 4 {
                (c * scale[i][j]) << (shift - 4)
            } else {
                (c * scale[i][j] + (1 << (3 - shift))) >> (4 - shift)
            };
        }
    }

    /// Scale one 8x8 residual block in place (8.5.13.1).
    pub fn dequant_8x8(&self, block: &mut [i32; 64], qp: i32) {
        let m = (qp % 6) as usize;
        let shift = qp / 6;
        let scale = &self.level_scale_8x8[m];
        for idx in 0..64 {
            let (i, j) = (idx / 8, idx % 8);
            let c = block[idx];
            block[idx] = if shift >= 6 {
                (c * scale[i][j]) << (shift - 6)
            } else {
                (c * scale[i][j] + (1 << (5 - shift))) >> (6 - shift)
            };
        }
    }

    /// Scale the 16 luma DC coefficients after their inverse Hadamard.
    pub fn dequant_luma_dc(&self, block: &mut [i32; 16], qp: i32) {
        let m = (qp % 6) as usize;
        let shift = qp / 6;
        let ls = self.level_scale_4x4[0][m][0][0];
        for c in block.iter_mut() {
            *c = if shift >= 6 {
                (*c * ls) << (shift - 6)
            } else {
                (*c * ls + (1 << (5 - shift))) >> (6 - shift)
            };
        }
    }

    /// Scale the 4 chroma DC coefficients after their 2x2 transform.
    pub fn dequant_chroma_dc(&self, block: &mut [i32; 4], list: usize, qp: i32) {
        let m = (qp % 6) as usize;
        let shift = qp / 6;
        let ls = self.level_scale_4x4[list][m][0][0];
        for c in block.iter_mut() {
            *c = ((*c * ls) << shift) >> 5;
        }
    }
}

/// Inverse 4x4 integer transform, 8.5.12.2. Output includes the final
/// `(x + 32) >> 6` rounding.
pub fn inverse_transform_4x4(block: &mut [i32; 16]) {
    // Rows.
    for r in 0..4 {
        let d = [block[4 * r], block[4 * r + 1], block[4 * r + 2], block[4 * r + 3]];
        let e0 = d[0] + d[2];
        let e1 = d[0] - d[2];
        let e2 = (d[1] >> 1) - d[3];
        let e3 = d[1] + (d[3] >> 1);
        block[4 * r] = e0 + e3;
        block[4 * r + 1] = e1 + e2;
        block[4 * r + 2] = e1 - e2;
        block[4 * r + 3] = e0 - e3;
    }
    // Columns.
    for c in 0..4 {
        let d = [block[c], block[c + 4], block[c + 8], block[c + 12]];
        let e0 = d[0] + d[2];
        let e1 = d[0] - d[2];
        let e2 = (d[1] >> 1) - d[3];
        let e3 = d[1] + (d[3] >> 1);
        block[c] = (e0 + e3 + 32) >> 6;
        block[c + 4] = (e1 + e2 + 32) >> 6;
        block[c + 8] = (e1 - e2 + 32) >> 6;
        block[c + 12] = (e0 - e3 + 32) >> 6;
    }
}

/// Inverse 8x8 integer transform, 8.5.13.2.
pub fn inverse_transform_8x8(block: &mut [i32; 64]) {
    for r in 0..8 {
        let row: [i32; 8] = std::array::from_fn(|i| block[8 * r + i]);
        let out = butterfly_8(&row);
        block[8 * r..8 * r + 8].copy_from_slice(&out);
    }
    for c in 0..8 {
        let col: [i32; 8] = std::array::from_fn(|i| block[8 * i + c]);
        let out = butterfly_8(&col);
        for (i, v) in out.into_iter().enumerate() {
            block[8 * i + c] = (v + 32) >> 6;
        }
    }
}

fn butterfly_8(d: &[i32; 8]) -> [i32; 8] {
    let e0 = d[0] + d[4];
    let e1 = -d[3] + d[5] - d[7] - (d[7] >> 1);
    let e2 = d[0] - d[4];
    let e3 = d[1] + d[7] - d[3] - (d[3] >> 1);
    let e4 = (d[2] >> 1) - d[6];
    let e5 = -d[1] + d[7] + d[5] + (d[5] >> 1);
    let e6 = d[2] + (d[6] >> 1);
    let e7 = d[3] + d[5] + d[1] + (d[1] >> 1);

    let f0 = e0 + e6;
    let f1 = e1 + (e7 >> 2);
    let f2 = e2 + e4;
    let f3 = e3 + (e5 >> 2);
    let f4 = e2 - e4;
    let f5 = (e3 >> 2) - e5;
    let f6 = e0 - e6;
    let f7 = e7 - (e1 >> 2);

    [
        f0 + f7,
        f2 + f5,
        f4 + f3,
        f6 + f1,
        f6 - f1,
        f4 - f3,
        f2 - f5,
        f0 - f7,
    ]
}

/// Inverse 4x4 Hadamard for Intra_16x16 luma DC, 8.5.10. No rounding shift;
/// scaling happens in the dequantizer afterwards.
pub fn inverse_hadamard_4x4(block: &mut [i32; 16]) {
    for r in 0..4 {
        let d = [block[4 * r], block[4 * r + 1], block[4 * r + 2], block[4 * r + 3]];
        let e0 = d[0] + d[2];
        let e1 = d[0] - d[2];
        let e2 = d[1] - d[3];
        let e3 = d[1] + d[3];
        block[4 * r] = e0 + e3;
        block[4 * r + 1] = e1 + e2;
        block[4 * r + 2] = e1 - e2;
        block[4 * r + 3] = e0 - e3;
    }
    for c in 0..4 {
        let d = [block[c], block[c + 4], block[c + 8], block[c + 12]];
        let e0 = d[0] + d[2];
        let e1 = d[0] - d[2];
        let e2 = d[1] - d[3];
        let e3 = d[1] + d[3];
        block[c] = e0 + e3;
        block[c + 4] = e1 + e2;
        block[c + 8] = e1 - e2;
        block[c + 12] = e0 - e3;
    }
}

/// 2x2 chroma DC transform, 8.5.11: a full butterfly on four values.
pub fn inverse_hadamard_2x2(c: &mut [i32; 4]) {
    let f = [
        c[0] + c[1] + c[2] + c[3],
        c[0] - c[1] + c[2] - c[3],
        c[0] + c[1] - c[2] - c[3],
        c[0] - c[1] - c[2] + c[3],
    ];
    *c = f;
}

#[inline]
pub fn clip_pixel(x: i32) -> u8 {
    x.clamp(0, 255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_tables() -> QuantTables {
        QuantTables::new(&ScalingMatrix::flat())
    }

    #[test]
    fn norm_adjust_4x4_parity() {
        let t = flat_tables();
        for q in 0..6 {
            assert_eq!(t.norm_adjust_4x4[q][0][0], V4X4[q][0]);
            assert_eq!(t.norm_adjust_4x4[q][2][2], V4X4[q][0]);
            assert_eq!(t.norm_adjust_4x4[q][1][1], V4X4[q][1]);
            assert_eq!(t.norm_adjust_4x4[q][3][3], V4X4[q][1]);
            assert_eq!(t.norm_adjust_4x4[q][0][1], V4X4[q][2]);
            assert_eq!(t.norm_adjust_4x4[q][2][1], V4X4[q][2]);
        }
    }

    #[test]
    fn norm_adjust_8x8_parity() {
        let t = flat_tables();
        for q in 0..6 {
            assert_eq!(t.norm_adjust_8x8[q][0][0], V8X8[q][0]);
            assert_eq!(t.norm_adjust_8x8[q][0][4], V8X8[q][0]);
            assert_eq!(t.norm_adjust_8x8[q][1][1], V8X8[q][1]);
            assert_eq!(t.norm_adjust_8x8[q][3][5], V8X8[q][1]);
            assert_eq!(t.norm_adjust_8x8[q][2][2], V8X8[q][2]);
            assert_eq!(t.norm_adjust_8x8[q][2][6], V8X8[q][2]);
            assert_eq!(t.norm_adjust_8x8[q][0][1], V8X8[q][3]);
            assert_eq!(t.norm_adjust_8x8[q][1][4], V8X8[q][3]);
            assert_eq!(t.norm_adjust_8x8[q][0][2], V8X8[q][4]);
            assert_eq!(t.norm_adjust_8x8[q][2][4], V8X8[q][4]);
            assert_eq!(t.norm_adjust_8x8[q][1][2], V8X8[q][5]);
        }
    }

    #[test]
    fn flat_matrix_reduces_to_norm_adjust() {
        // With the flat-16 list the weight cancels against the >>4 basis and
        // the dequantizer degenerates to `c * normAdjust << qp/6`.
        let t = flat_tables();
        let mut block = [0i32; 16];
        block[0] = 3;
        t.dequant_4x4(&mut block, 0, 24, false);
        assert_eq!(block[0], (3 * V4X4[0][0]) << 4);

        let mut block = [0i32; 16];
        block[5] = 2; // position (1,1)
        t.dequant_4x4(&mut block, 0, 7, false);
        assert_eq!(block[5], (2 * V4X4[1][1] * 16 + 4) >> 3);
    }

    #[test]
    fn dc_only_idct_spreads_evenly() {
        let mut block = [0i32; 16];
        block[0] = 64;
        inverse_transform_4x4(&mut block);
        assert_eq!(block, [1i32; 16]);
    }

    #[test]
    fn idct_8x8_dc_only() {
        let mut block = [0i32; 64];
        block[0] = 64;
        inverse_transform_8x8(&mut block);
        assert_eq!(block, [1i32; 64]);
    }

    #[test]
    fn hadamard_dc_only() {
        let mut block = [0i32; 16];
        block[0] = 4;
        inverse_hadamard_4x4(&mut block);
        assert_eq!(block, [4i32; 16]);
    }

    #[test]
    fn hadamard_2x2_sums() {
        let mut c = [1, 2, 3, 4];
        inverse_hadamard_2x2(&mut c);
        assert_eq!(c, [10, -2, -4, 0]);
    }

    #[test]
    fn clip_pixel_bounds() {
        assert_eq!(clip_pixel(-5), 0);
        assert_eq!(clip_pixel(0), 0);
        assert_eq!(clip_pixel(128), 128);
        assert_eq!(clip_pixel(300), 255);
    }
}
