//! Intra prediction sample generation (8.3). Callers gather the reference
//! samples (with availability applied); everything here is arithmetic.

use crate::error::{Error, Result};
use crate::transform::clip_pixel;

pub const PRED_4X4_VERTICAL: u8 = 0;
pub const PRED_4X4_HORIZONTAL: u8 = 1;
pub const PRED_4X4_DC: u8 = 2;
pub const PRED_4X4_DIAG_DOWN_LEFT: u8 = 3;
pub const PRED_4X4_DIAG_DOWN_RIGHT: u8 = 4;
pub const PRED_4X4_VERTICAL_RIGHT: u8 = 5;
pub const PRED_4X4_HORIZONTAL_DOWN: u8 = 6;
pub const PRED_4X4_VERTICAL_LEFT: u8 = 7;
pub const PRED_4X4_HORIZONTAL_UP: u8 = 8;

/// Reference samples for an NxN luma block. `above` holds 2N samples (the
/// above-right half already substituted when that neighbour is missing),
/// `left` holds N.
#[derive(Debug, Clone)]
pub struct BlockRefs {
    pub above: Option<Vec<i32>>,
    pub left: Option<Vec<i32>>,
    pub above_left: Option<i32>,
}

impl BlockRefs {
    fn a(&self, i: i32) -> i32 {
        if i < 0 {
            self.above_left.unwrap_or(128)
        } else {
            self.above.as_ref().map(|v| v[i as usize]).unwrap_or(128)
        }
    }

    fn l(&self, i: i32) -> i32 {
        if i < 0 {
            self.above_left.unwrap_or(128)
        } else {
            self.left.as_ref().map(|v| v[i as usize]).unwrap_or(128)
        }
    }
}

/// NxN directional/DC prediction shared by the 4x4 and 8x8 paths
/// (8.3.1.2 and 8.3.2.2). `out` is row-major NxN.
pub fn predict_nxn(mode: u8, n: usize, refs: &BlockRefs, out: &mut [i32]) -> Result<()> {
    debug_assert_eq!(out.len(), n * n);
    let need_above = matches!(mode, 0 | 3 | 7);
    let need_left = matches!(mode, 1 | 8);
    let need_all = matches!(mode, 4 | 5 | 6);

    if (need_above || need_all) && refs.above.is_none()
        || (need_left || need_all) && refs.left.is_none()
        || need_all && refs.above_left.is_none()
    {
        return Err(Error::Slice(format!(
            "intra mode {mode} needs unavailable neighbour samples"
        )));
    }

    let last = n as i32 - 1;
    match mode {
        PRED_4X4_VERTICAL => {
            for y in 0..n {
                for x in 0..n {
                    out[y * n + x] = refs.a(x as i32);
                }
            }
        }
        PRED_4X4_HORIZONTAL => {
            for y in 0..n {
                for x in 0..n {
                    out[y * n + x] = refs.l(y as i32);
                }
            }
        }
        PRED_4X4_DC => {
            let sum_a: i32 = (0..n).map(|x| refs.a(x as i32)).sum();
            let sum_l: i32 = (0..n).map(|y| refs.l(y as i32)).sum();
            let shift = n.trailing_zeros();
            let dc = match (refs.above.is_some(), refs.left.is_some()) {
                (true, true) => (sum_a + sum_l + n as i32) >> (shift + 1),
                (true, false) => (sum_a + (n as i32 >> 1)) >> shift,
                (false, true) => (sum_l + (n as i32 >> 1)) >> shift,
                (false, false) => 128,
            };
            out.fill(dc);
        }
        PRED_4X4_DIAG_DOWN_LEFT => {
            for y in 0..n as i32 {
                for x in 0..n as i32 {
                    let v = if x == last && y == last {
                        (refs.a(2 * last) + 3 * refs.a(2 * last + 1) + 2) >> 2
                    } else {
                        (refs.a(x + y) + 2 * refs.a(x + y + 1) + refs.a(x + y + 2) + 2) >> 2
                    };
                    out[(y * n as i32 + x) as usize] = v;
                }
            }
        }
        PRED_4X4_DIAG_DOWN_RIGHT => {
            for y in 0..n as i32 {
                for x in 0..n as i32 {
                    let v = if x > y {
                        (refs.a(x - y - 2) + 2 * refs.a(x - y - 1) + refs.a(x - y) + 2) >> 2
                    } else if x < y {
                        (refs.l(y - x - 2) + 2 * refs.l(y - x - 1) + refs.l(y - x) + 2) >> 2
                    } else {
                        (refs.a(0) + 2 * refs.a(-1) + refs.l(0) + 2) >> 2
                    };
                    out[(y * n as i32 + x) as usize] = v;
                }
            }
        }
        PRED_4X4_VERTICAL_RIGHT => {
            for y in 0..n as i32 {
                for x in 0..n as i32 {
                    let z = 2 * x - y;
                    let v = if z >= 0 && z % 2 == 0 {
                        (refs.a(x - (y >> 1) - 1) + refs.a(x - (y >> 1)) + 1) >> 1
                    } else if z >= 1 {
                        (refs.a(x - (y >> 1) - 2) + 2 * refs.a(x - (y >> 1) - 1)
                            + refs.a(x - (y >> 1))
                            + 2)
                            >> 2
                    } else if z == -1 {
                        (refs.l(0) + 2 * refs.a(-1) + refs.a(0) + 2) >> 2
                    } else {
                        (refs.l(y - 2 * x - 1) + 2 * refs.l(y - 2 * x - 2) + refs.l(y - 2 * x - 3)
                            + 2)
                            >> 2
                    };
                    out[(y * n as i32 + x) as usize] = v;
                }
            }
        }
        PRED_4X4_HORIZONTAL_DOWN => {
            for y in 0..n as i32 {
                for x in 0..n as i32 {
                    let z = 2 * y - x;
                    let v = if z >= 0 && z % 2 == 0 {
                        (refs.l(y - (x >> 1) - 1) + refs.l(y - (x >> 1)) + 1) >> 1
                    } else if z >= 1 {
                        (refs.l(y - (x >> 1) - 2) + 2 * refs.l(y - (x >> 1) - 1)
                            + refs.l(y - (x >> 1))
                            + 2)
                            >> 2
                    } else if z == -1 {
                        (refs.l(0) + 2 * refs.a(-1) + refs.a(0) + 2) >> 2
                    } else {
                        (refs.a(x - 2 * y - 1) + 2 * refs.a(x - 2 * y - 2) + refs.a(x - 2 * y - 3)
                            + 2)
                            >> 2
                    };
                    out[(y * n as i32 + x) as usize] = v;
                }
            }
        }
        PRED_4X4_VERTICAL_LEFT => {
            for y in 0..n as i32 {
                for x in 0..n as i32 {
                    let i = x + (y >> 1);
                    let v = if y % 2 == 0 {
                        (refs.a(i) + refs.a(i + 1) + 1) >> 1
                    } else {
                        (refs.a(i) + 2 * refs.a(i + 1) + refs.a(i + 2) + 2) >> 2
                    };
                    out[(y * n as i32 + x) as usize] = v;
                }
            }
        }
        PRED_4X4_HORIZONTAL_UP => {
            for y in 0..n as i32 {
                for x in 0..n as i32 {
                    let z = x + 2 * y;
                    let v = if z == 2 * last - 1 {
                        (refs.l(last - 1) + 3 * refs.l(last) + 2) >> 2
                    } else if z > 2 * last - 1 {
                        refs.l(last)
                    } else if z % 2 == 0 {
                        (refs.l(y + (x >> 1)) + refs.l(y + (x >> 1) + 1) + 1) >> 1
                    } else {
                        (refs.l(y + (x >> 1)) + 2 * refs.l(y + (x >> 1) + 1)
                            + refs.l(y + (x >> 1) + 2)
                            + 2)
                            >> 2
                    };
                    out[(y * n as i32 + x) as usize] = v;
                }
            }
        }
        _ => {
            return Err(Error::Slice(format!("intra 4x4 prediction mode {mode} out of range")));
        }
    }

    Ok(())
}

/// Reference filtering ahead of 8x8 prediction (8.3.2.2.1). Operates on the
/// gathered refs in place.
pub fn filter_8x8_refs(refs: &mut BlockRefs) {
    let above_left = refs.above_left;

    if let Some(above) = refs.above.as_mut() {
        let orig = above.clone();
        above[0] = match above_left {
            Some(m) => (m + 2 * orig[0] + orig[1] + 2) >> 2,
            None => (3 * orig[0] + orig[1] + 2) >> 2,
        };
        for x in 1..15 {
            above[x] = (orig[x - 1] + 2 * orig[x] + orig[x + 1] + 2) >> 2;
        }
        above[15] = (orig[14] + 3 * orig[15] + 2) >> 2;
    }

    if let Some(left) = refs.left.as_mut() {
        let orig = left.clone();
        left[0] = match above_left {
            Some(m) => (m + 2 * orig[0] + orig[1] + 2) >> 2,
            None => (3 * orig[0] + orig[1] + 2) >> 2,
        };
        for y in 1..7 {
            left[y] = (orig[y - 1] + 2 * orig[y] + orig[y + 1] + 2) >> 2;
        }
        left[7] = (orig[6] + 3 * orig[7] + 2) >> 2;
    }

    if let Some(m) = refs.above_left {
        let a0 = refs.above.as_ref().map(|v| v[0]);
        let l0 = refs.left.as_ref().map(|v| v[0]);
        refs.above_left = Some(match (a0, l0) {
            (Some(a), Some(l)) => (a + 2 * m + l + 2) >> 2,
            (Some(a), None) => (3 * m + a + 2) >> 2,
            (None, Some(l)) => (3 * m + l + 2) >> 2,
            (None, None) => m,
        });
    }
}

pub const PRED_16X16_VERTICAL: u8 = 0;
pub const PRED_16X16_HORIZONTAL: u8 = 1;
pub const PRED_16X16_DC: u8 = 2;
pub const PRED_16X16_PLANE: u8 = 3;

/// Whole-macroblock luma prediction (8.3.3). `out` is 16x16 row-major.
pub fn predict_16x16(
    mode: u8,
    above: Option<&[i32; 16]>,
    left: Option<&[i32; 16]>,
    above_left: Option<i32>,
    out: &mut [i32; 256],
) -> Result<()> {
    match mode {
        PRED_16X16_VERTICAL => {
            let above = above.ok_or_else(|| {
                Error::Slice("vertical 16x16 prediction without above neighbour".into())
            })?;
            for y in 0..16 {
                out[y * 16..y * 16 + 16].copy_from_slice(above);
            }
        }
        PRED_16X16_HORIZONTAL => {
            let left = left.ok_or_else(|| {
                Error::Slice("horizontal 16x16 prediction without left neighbour".into())
            })?;
            for y in 0..16 {
                out[y * 16..y * 16 + 16].fill(left[y]);
            }
        }
        PRED_16X16_DC => {
            let dc = match (above, left) {
                (Some(a), Some(l)) => {
                    (a.iter().sum::<i32>() + l.iter().sum::<i32>() + 16) >> 5
                }
                (Some(a), None) => (a.iter().sum::<i32>() + 8) >> 4,
                (None, Some(l)) => (l.iter().sum::<i32>() + 8) >> 4,
                (None, None) => 128,
            };
            out.fill(dc);
        }
        PRED_16X16_PLANE => {
            let (Some(a), Some(l), Some(m)) = (above, left, above_left) else {
                return Err(Error::Slice(
                    "plane 16x16 prediction without full neighbours".into(),
                ));
            };
            let mut h = 0i32;
            let mut v = 0i32;
            for i in 0..8i32 {
                let a_lo = if 6 - i >= 0 { a[(6 - i) as usize] } else { m };
                let l_lo = if 6 - i >= 0 { l[(6 - i) as usize] } else { m };
                h += (i + 1) * (a[(8 + i) as usize] - a_lo);
                v += (i + 1) * (l[(8 + i) as usize] - l_lo);
            }
            let aa = 16 * (a[15] + l[15]);
            let b = (5 * h + 32) >> 6;
            let c = (5 * v + 32) >> 6;
            for y in 0..16i32 {
                for x in 0..16i32 {
                    out[(y * 16 + x) as usize] =
                        clip_pixel((aa + b * (x - 7) + c * (y - 7) + 16) >> 5) as i32;
                }
            }
        }
        _ => {
            return Err(Error::Slice(format!(
                "intra 16x16 prediction mode {mode} out of range"
            )));
        }
    }
    Ok(())
}

pub const PRED_CHROMA_DC: u8 = 0;
pub const PRED_CHROMA_HORIZONTAL: u8 = 1;
pub const PRED_CHROMA_VERTICAL: u8 = 2;
pub const PRED_CHROMA_PLANE: u8 = 3;

/// 8x8 chroma prediction (8.3.4); each 4x4 quadrant derives its own DC.
pub fn predict_chroma(
    mode: u8,
    above: Option<&[i32; 8]>,
    left: Option<&[i32; 8]>,
    above_left: Option<i32>,
    out: &mut [i32; 64],
) -> Result<()> {
    match mode {
        PRED_CHROMA_DC => {
            for (qy, qx) in [(0usize, 0usize), (0, 1), (1, 0), (1, 1)] {
                let a_sum = above.map(|a| a[qx * 4..qx * 4 + 4].iter().sum::<i32>());
                let l_sum = left.map(|l| l[qy * 4..qy * 4 + 4].iter().sum::<i32>());
                // Corner quadrants average both edges; the off-diagonal
                // quadrants prefer the edge they touch.
                let dc = match (qx, qy) {
                    (0, 0) | (1, 1) => match (a_sum, l_sum) {
                        (Some(a), Some(l)) => (a + l + 4) >> 3,
                        (Some(a), None) => (a + 2) >> 2,
                        (None, Some(l)) => (l + 2) >> 2,
                        (None, None) => 128,
                    },
                    (1, 0) => match (a_sum, l_sum) {
                        (Some(a), _) => (a + 2) >> 2,
                        (None, Some(l)) => (l + 2) >> 2,
                        (None, None) => 128,
                    },
                    _ => match (l_sum, a_sum) {
                        (Some(l), _) => (l + 2) >> 2,
                        (None, Some(a)) => (a + 2) >> 2,
                        (None, None) => 128,
                    },
                };
                for y in 0..4 {
                    for x in 0..4 {
                        out[(qy * 4 + y) * 8 + qx * 4 + x] = dc;
                    }
                }
            }
        }
        PRED_CHROMA_HORIZONTAL => {
            let left = left.ok_or_else(|| {
                Error::Slice("horizontal chroma prediction without left neighbour".into())
            })?;
            for y in 0..8 {
                out[y * 8..y * 8 + 8].fill(left[y]);
            }
        }
        PRED_CHROMA_VERTICAL => {
            let above = above.ok_or_else(|| {
                Error::Slice("vertical chroma prediction without above neighbour".into())
            })?;
            for y in 0..8 {
                out[y * 8..y * 8 + 8].copy_from_slice(above);
            }
        }
        PRED_CHROMA_PLANE => {
            let (Some(a), Some(l), Some(m)) = (above, left, above_left) else {
                return Err(Error::Slice(
                    "plane chroma prediction without full neighbours".into(),
                ));
            };
            let mut h = 0i32;
            let mut v = 0i32;
            for i in 0..4i32 {
                let a_lo = if 2 - i >= 0 { a[(2 - i) as usize] } else { m };
                let l_lo = if 2 - i >= 0 { l[(2 - i) as usize] } else { m };
                h += (i + 1) * (a[(4 + i) as usize] - a_lo);
                v += (i + 1) * (l[(4 + i) as usize] - l_lo);
            }
            let aa = 16 * (a[7] + l[7]);
            let b = (17 * h + 16) >> 5;
            let c = (17 * v + 16) >> 5;
            for y in 0..8i32 {
                for x in 0..8i32 {
                    out[(y * 8 + x) as usize] =
                        clip_pixel((aa + b * (x - 3) + c * (y - 3) + 16) >> 5) as i32;
                }
            }
        }
        _ => {
            return Err(Error::Slice(format!(
                "intra chroma prediction mode {mode} out of range"
            )));
        }
    }
    Ok(())
}

/// Most-probable-mode derivation for 4x4/8x8 luma blocks (8.3.1.1).
pub fn derived_4x4_mode(
    mode_a: Option<u8>,
    mode_b: Option<u8>,
    prev_flag: bool,
    rem_mode: u8,
) -> u8 {
    let a = mode_a.unwrap_or(PRED_4X4_DC);
    let b = mode_b.unwrap_or(PRED_4X4_DC);
    let predicted = a.min(b);
    if prev_flag {
        predicted
    } else if rem_mode < predicted {
        rem_mode
    } else {
        rem_mode + 1
    }
}
