//! In-loop deblocking (8.7), run after the whole picture is reconstructed.
//! Intra-only decoding keeps the boundary-strength derivation short: 4 on
//! macroblock edges, 3 on interior transform edges.

use crate::macroblock::MbGrid;
use crate::picture::{Picture, Plane};
use crate::transform::clip_pixel;

/// alpha(indexA), table 8-16.
const ALPHA: [i32; 52] = [
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 4, 4, 5, 6, 7, 8, 9, 10, 12, 13, 15, 17, 20,
    22, 25, 28, 32, 36, 40, 45, 50, 56, 63, 71, 80, 90, 101, 113, 127, 144, 162, 182, 203, 226,
    255, 255,
];

/// beta(indexB), table 8-16.
const BETA: [i32; 52] = [
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 6, 6, 7, 7, 8,
    8, 9, 9, 10, 10, 11, 11, 12, 12, 13, 13, 14, 14, 15, 15, 16, 16, 17, 17, 18, 18,
];

/// tc0(indexA, bS), table 8-17, rows bS 1..3.
const TC0: [[i32; 3]; 52] = [
    [0, 0, 0], [0, 0, 0], [0, 0, 0], [0, 0, 0], [0, 0, 0], [0, 0, 0], [0, 0, 0], [0, 0, 0],
    [0, 0, 0], [0, 0, 0], [0, 0, 0], [0, 0, 0], [0, 0, 0], [0, 0, 0], [0, 0, 0], [0, 0, 0],
    [0, 0, 0], [0, 0, 1], [0, 0, 1], [0, 0, 1], [0, 0, 1], [0, 1, 1], [0, 1, 1], [1, 1, 1],
    [1, 1, 1], [1, 1, 1], [1, 1, 1], [1, 1, 2], [1, 1, 2], [1, 1, 2], [1, 1, 2], [1, 2, 3],
    [1, 2, 3], [2, 2, 3], [2, 2, 4], [2, 3, 4], [2, 3, 4], [3, 3, 5], [3, 4, 6], [3, 4, 6],
    [4, 5, 7], [4, 5, 8], [4, 6, 9], [5, 7, 10], [6, 8, 11], [6, 8, 13], [7, 10, 14], [8, 11, 16],
    [9, 12, 18], [10, 13, 20], [11, 15, 23], [13, 17, 25],
];

/// QPc from QPy after the chroma offset, table 8-15.
const CHROMA_QP: [i32; 52] = [
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25,
    26, 27, 28, 29, 29, 30, 31, 32, 32, 33, 34, 34, 35, 35, 36, 36, 37, 37, 37, 38, 38, 38, 39,
    39, 39, 39,
];

pub fn chroma_qp(qp_y: i32, offset: i32) -> i32 {
    CHROMA_QP[(qp_y + offset).clamp(0, 51) as usize]
}

/// Boundary strength for edges between intra macroblocks.
fn boundary_strength(mb_edge: bool) -> u8 {
    if mb_edge { 4 } else { 3 }
}

struct EdgeSample<'a> {
    plane: &'a mut Plane,
    /// Position of q0 for this line.
    x: usize,
    y: usize,
    vertical: bool,
}

impl EdgeSample<'_> {
    /// p(0..) walks away from the edge on the earlier side, q(0..) on the
    /// current side.
    fn p(&self, i: usize) -> i32 {
        if self.vertical {
            self.plane.get(self.x - 1 - i, self.y) as i32
        } else {
            self.plane.get(self.x, self.y - 1 - i) as i32
        }
    }

    fn q(&self, i: usize) -> i32 {
        if self.vertical {
            self.plane.get(self.x + i, self.y) as i32
        } else {
            self.plane.get(self.x, self.y + i) as i32
        }
    }

    fn set_p(&mut self, i: usize, v: i32) {
        let v = clip_pixel(v);
        if self.vertical {
            self.plane.set(self.x - 1 - i, self.y, v);
        } else {
            self.plane.set(self.x, self.y - 1 - i, v);
        }
    }

    fn set_q(&mut self, i: usize, v: i32) {
        let v = clip_pixel(v);
        if self.vertical {
            self.plane.set(self.x + i, self.y, v);
        } else {
            self.plane.set(self.x, self.y + i, v);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn filter_edge(
    plane: &mut Plane,
    x0: usize,
    y0: usize,
    vertical: bool,
    len: usize,
    is_luma: bool,
    bs: u8,
    index_a: usize,
    index_b: usize,
) {
    let alpha = ALPHA[index_a];
    let beta = BETA[index_b];
    if alpha == 0 {
        return;
    }

    for k in 0..len {
        let (x, y) = if vertical { (x0, y0 + k) } else { (x0 + k, y0) };
        let mut s = EdgeSample {
            plane: &mut *plane,
            x,
            y,
            vertical,
        };

        let p0 = s.p(0);
        let p1 = s.p(1);
        let q0 = s.q(0);
        let q1 = s.q(1);

        if (p0 - q0).abs() >= alpha || (p1 - p0).abs() >= beta || (q1 - q0).abs() >= beta {
            continue;
        }

        if bs < 4 {
            let tc0 = TC0[index_a][(bs - 1) as usize];
            if is_luma {
                let p2 = s.p(2);
                let q2 = s.q(2);
                let ap = (p2 - p0).abs() < beta;
                let aq = (q2 - q0).abs() < beta;
                let tc = tc0 + ap as i32 + aq as i32;

                let delta = (((q0 - p0) * 4 + (p1 - q1) + 4) >> 3).clamp(-tc, tc);
                s.set_p(0, p0 + delta);
                s.set_q(0, q0 - delta);

                if ap {
                    let d = ((p2 + ((p0 + q0 + 1) >> 1) - 2 * p1) >> 1).clamp(-tc0, tc0);
                    s.set_p(1, p1 + d);
                }
                if aq {
                    let d = ((q2 + ((p0 + q0 + 1) >> 1) - 2 * q1) >> 1).clamp(-tc0, tc0);
                    s.set_q(1, q1 + d);
                }
            } else {
                let tc = tc0 + 1;
                let delta = (((q0 - p0) * 4 + (p1 - q1) + 4) >> 3).clamp(-tc, tc);
                s.set_p(0, p0 + delta);
                s.set_q(0, q0 - delta);
            }
        } else if is_luma {
            let p2 = s.p(2);
            let p3 = s.p(3);
            let q2 = s.q(2);
            let q3 = s.q(3);
            let short_gap = (p0 - q0).abs() < (alpha >> 2) + 2;

            if short_gap && (p2 - p0).abs() < beta {
                s.set_p(0, (p2 + 2 * p1 + 2 * p0 + 2 * q0 + q1 + 4) >> 3);
                s.set_p(1, (p2 + p1 + p0 + q0 + 2) >> 2);
                s.set_p(2, (2 * p3 + 3 * p2 + p1 + p0 + q0 + 4) >> 3);
            } else {
                s.set_p(0, (2 * p1 + p0 + q1 + 2) >> 2);
            }

            if short_gap && (q2 - q0).abs() < beta {
                s.set_q(0, (q2 + 2 * q1 + 2 * q0 + 2 * p0 + p1 + 4) >> 3);
                s.set_q(1, (q2 + q1 + q0 + p0 + 2) >> 2);
                s.set_q(2, (2 * q3 + 3 * q2 + q1 + q0 + p0 + 4) >> 3);
            } else {
                s.set_q(0, (2 * q1 + q0 + p1 + 2) >> 2);
            }
        } else {
            s.set_p(0, (2 * p1 + p0 + q1 + 2) >> 2);
            s.set_q(0, (2 * q1 + q0 + p1 + 2) >> 2);
        }
    }
}

/// Filter every edge of the reconstructed picture, vertical edges first,
/// honouring the per-slice disable flag and offsets carried on each
/// macroblock.
pub fn deblock_picture(pic: &mut Picture, grid: &MbGrid, chroma_qp_offset: i32) {
    for mb_idx in 0..grid.len() {
        let mb = &grid.mbs[mb_idx];
        if !mb.decoded || mb.deblock.disable_idc == 1 {
            continue;
        }
        let (mbx, mby) = grid.pos(mb_idx);

        for vertical in [true, false] {
            for e in 0..4usize {
                let mb_edge = e == 0;
                let other_idx = if !mb_edge {
                    mb_idx
                } else if vertical {
                    if mbx == 0 {
                        continue;
                    }
                    mb_idx - 1
                } else {
                    if mby == 0 {
                        continue;
                    }
                    mb_idx - grid.width_mbs
                };
                let other = &grid.mbs[other_idx];
                if mb_edge {
                    if !other.decoded {
                        continue;
                    }
                    // disable_idc 2 keeps slice boundaries untouched.
                    if mb.deblock.disable_idc == 2 && other.slice_id != mb.slice_id {
                        continue;
                    }
                }
                // The 8x8 transform leaves only the centre interior edge.
                if !mb_edge && mb.transform_8x8 && e != 2 {
                    continue;
                }

                let bs = boundary_strength(mb_edge);
                let qp_av = (mb.qp_y + other.qp_y + 1) >> 1;
                let index_a = (qp_av + mb.deblock.alpha_offset).clamp(0, 51) as usize;
                let index_b = (qp_av + mb.deblock.beta_offset).clamp(0, 51) as usize;

                let (lx, ly) = if vertical {
                    (mbx * 16 + e * 4, mby * 16)
                } else {
                    (mbx * 16, mby * 16 + e * 4)
                };
                filter_edge(&mut pic.y, lx, ly, vertical, 16, true, bs, index_a, index_b);

                // Chroma edges exist at luma offsets 0 and 8 only.
                if e == 0 || e == 2 {
                    let qp_c =
                        (chroma_qp(mb.qp_y, chroma_qp_offset)
                            + chroma_qp(other.qp_y, chroma_qp_offset)
                            + 1)
                            >> 1;
                    let c_index_a = (qp_c + mb.deblock.alpha_offset).clamp(0, 51) as usize;
                    let c_index_b = (qp_c + mb.deblock.beta_offset).clamp(0, 51) as usize;
                    let (cx, cy) = if vertical {
                        (mbx * 8 + e * 2, mby * 8)
                    } else {
                        (mbx * 8, mby * 8 + e * 2)
                    };
                    for plane in [&mut pic.cb, &mut pic.cr] {
                        filter_edge(plane, cx, cy, vertical, 8, false, bs, c_index_a, c_index_b);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macroblock::MbInfo;

    #[test]
    fn table_endpoints() {
        assert_eq!(ALPHA[15], 0);
        assert_eq!(ALPHA[16], 4);
        assert_eq!(ALPHA[51], 255);
        assert_eq!(BETA[16], 2);
        assert_eq!(BETA[51], 18);
        assert_eq!(TC0[16], [0, 0, 0]);
        assert_eq!(TC0[51], [13, 17, 25]);
    }

    #[test]
    fn chroma_qp_mapping() {
        assert_eq!(chroma_qp(20, 0), 20);
        assert_eq!(chroma_qp(30, 0), 29);
        assert_eq!(chroma_qp(51, 0), 39);
        assert_eq!(chroma_qp(51, 12), 39);
        assert_eq!(chroma_qp(0, -12), 0);
    }

    #[test]
    fn small_step_is_smoothed() {
        // A mild step across the edge at x=4 is within alpha/beta at QP 32
        // (alpha=32, beta=9) and must be softened by the strong filter.
        let mut plane = Plane::new(8, 4);
        for y in 0..4 {
            for x in 0..8 {
                plane.set(x, y, if x < 4 { 60 } else { 66 });
            }
        }
        filter_edge(&mut plane, 4, 0, true, 4, true, 4, 32, 32);
        for y in 0..4 {
            let p0 = plane.get(3, y);
            let q0 = plane.get(4, y);
            assert!(p0 > 60 && q0 < 66, "edge not smoothed: {p0} {q0}");
        }
    }

    #[test]
    fn large_step_is_preserved() {
        // A real object edge (|p0-q0| >= alpha) must pass untouched.
        let mut plane = Plane::new(8, 4);
        for y in 0..4 {
            for x in 0..8 {
                plane.set(x, y, if x < 4 { 20 } else { 220 });
            }
        }
        let before = plane.clone();
        filter_edge(&mut plane, 4, 0, true, 4, true, 4, 32, 32);
        assert_eq!(plane, before);
    }

    #[test]
    fn disabled_filter_leaves_picture_alone() {
        let mut grid = MbGrid::new(2, 1);
        for mb in &mut grid.mbs {
            *mb = MbInfo {
                decoded: true,
                qp_y: 30,
                ..MbInfo::default()
            };
            mb.deblock.disable_idc = 1;
        }
        let mut pic = Picture::new(32, 16, 0);
        for y in 0..16 {
            for x in 0..32 {
                pic.y.set(x, y, if x < 16 { 50 } else { 58 });
            }
        }
        let before = pic.y.clone();
        deblock_picture(&mut pic, &grid, 0);
        assert_eq!(pic.y, before);
    }

    #[test]
    fn mb_edge_filtering_runs() {
        let mut grid = MbGrid::new(2, 1);
        for mb in &mut grid.mbs {
            mb.decoded = true;
            mb.qp_y = 32;
        }
        let mut pic = Picture::new(32, 16, 0);
        for y in 0..16 {
            for x in 0..32 {
                pic.y.set(x, y, if x < 16 { 60 } else { 66 });
            }
        }
        deblock_picture(&mut pic, &grid, 0);
        assert!(pic.y.get(15, 8) > 60);
        assert!(pic.y.get(16, 8) < 66);
    }
}
