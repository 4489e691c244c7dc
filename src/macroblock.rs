use crate::error::{Error, Result};

/// Luma 4x4 block index -> (x, y) offset within the macroblock, in the
/// 2x2-quad decoding order of the standard.
pub const BLOCK4_OFFSET: [(usize, usize); 16] = [
    (0, 0),
    (4, 0),
    (0, 4),
    (4, 4),
    (8, 0),
    (12, 0),
    (8, 4),
    (12, 4),
    (0, 8),
    (4, 8),
    (0, 12),
    (4, 12),
    (8, 8),
    (12, 8),
    (8, 12),
    (12, 12),
];

/// Raster 4x4 position (y4 * 4 + x4) -> decoding block index.
pub const RASTER_TO_BLOCK4: [usize; 16] = [0, 1, 4, 5, 2, 3, 6, 7, 8, 9, 12, 13, 10, 11, 14, 15];

/// Luma 8x8 block index -> (x, y) offset.
pub const BLOCK8_OFFSET: [(usize, usize); 4] = [(0, 0), (8, 0), (0, 8), (8, 8)];

/// coded_block_pattern mapping for Intra_4x4/Intra_8x8 macroblocks,
/// table 9-4 (codeNum -> CBP, ChromaArrayType 1).
pub const CBP_INTRA: [u8; 48] = [
    47, 31, 15, 0, 23, 27, 29, 30, 7, 11, 13, 14, 39, 43, 45, 46, 16, 3, 5, 10, 12, 19, 21, 26,
    28, 35, 37, 42, 44, 1, 2, 4, 8, 17, 18, 20, 24, 6, 9, 22, 25, 32, 33, 34, 36, 40, 38, 41,
];

/// Macroblock coding class for an I slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbClass {
    /// I_NxN: per-block intra prediction, 4x4 or 8x8 transform.
    IntraNxN,
    /// I_16x16 with the whole-macroblock prediction mode.
    Intra16x16 { pred_mode: u8 },
    IPcm,
}

/// Parsed `mb_type` for an I slice (7.4.5, table 7-11), together with the
/// coded-block pattern it implies for the I_16x16 variants.
#[derive(Debug, Clone, Copy)]
pub struct MbTypeInfo {
    pub class: MbClass,
    /// Four luma 8x8 bits; I_16x16 encodes all-or-nothing AC.
    pub cbp_luma: u8,
    /// 0 none, 1 DC only, 2 DC+AC.
    pub cbp_chroma: u8,
    /// CBP comes from the bitstream (I_NxN) rather than mb_type.
    pub cbp_in_stream: bool,
}

pub fn parse_i_mb_type(value: u32) -> Result<MbTypeInfo> {
    match value {
        0 => Ok(MbTypeInfo {
            class: MbClass::IntraNxN,
            cbp_luma: 0,
            cbp_chroma: 0,
            cbp_in_stream: true,
        }),
        1..=24 => {
            let m = value - 1;
            Ok(MbTypeInfo {
                class: MbClass::Intra16x16 {
                    pred_mode: (m % 4) as u8,
                },
                cbp_luma: if m / 12 == 0 { 0 } else { 0b1111 },
                cbp_chroma: ((m / 4) % 3) as u8,
                cbp_in_stream: false,
            })
        }
        25 => Ok(MbTypeInfo {
            class: MbClass::IPcm,
            cbp_luma: 0,
            cbp_chroma: 0,
            cbp_in_stream: false,
        }),
        _ => Err(Error::Slice(format!(
            "mb_type {value} is not an intra macroblock"
        ))),
    }
}

/// Per-macroblock deblocking controls inherited from the slice header.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeblockParams {
    pub disable_idc: u8,
    pub alpha_offset: i32,
    pub beta_offset: i32,
}

/// Decoded state one macroblock leaves behind for its neighbours: prediction
/// modes for mode derivation, coefficient counts for nC and QP for the loop
/// filter.
#[derive(Debug, Clone)]
pub struct MbInfo {
    pub class: MbClass,
    pub transform_8x8: bool,
    pub qp_y: i32,
    pub slice_id: u32,
    pub deblock: DeblockParams,
    /// total_coeff per luma 4x4 block, decoding order.
    pub luma_nz: [u8; 16],
    /// total_coeff per chroma AC 4x4 block, [component][block raster].
    pub chroma_nz: [[u8; 4]; 2],
    /// Intra 4x4 prediction modes, decoding order; DC (2) when not I_NxN.
    pub intra4x4_modes: [u8; 16],
    pub decoded: bool,
}

impl Default for MbInfo {
    fn default() -> Self {
        Self {
            class: MbClass::IntraNxN,
            transform_8x8: false,
            qp_y: 26,
            slice_id: 0,
            deblock: DeblockParams::default(),
            luma_nz: [0; 16],
            chroma_nz: [[0; 4]; 2],
            intra4x4_modes: [2; 16],
            decoded: false,
        }
    }
}

/// Raster indices of the A/B/C/D neighbours of a macroblock, picture bounds
/// applied but slice membership left to the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct MbNeighbors {
    pub a: Option<usize>,
    pub b: Option<usize>,
    pub c: Option<usize>,
    pub d: Option<usize>,
}

/// Row-major macroblock grid for one picture. Neighbour lookups go through
/// raster indices so the grid owns no back-references.
pub struct MbGrid {
    pub width_mbs: usize,
    pub height_mbs: usize,
    pub mbs: Vec<MbInfo>,
}

impl MbGrid {
    pub fn new(width_mbs: usize, height_mbs: usize) -> Self {
        Self {
            width_mbs,
            height_mbs,
            mbs: vec![MbInfo::default(); width_mbs * height_mbs],
        }
    }

    pub fn len(&self) -> usize {
        self.mbs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mbs.is_empty()
    }

    pub fn pos(&self, idx: usize) -> (usize, usize) {
        (idx % self.width_mbs, idx / self.width_mbs)
    }

    pub fn neighbors(&self, idx: usize) -> MbNeighbors {
        let (x, y) = self.pos(idx);
        MbNeighbors {
            a: (x > 0).then(|| idx - 1),
            b: (y > 0).then(|| idx - self.width_mbs),
            c: (y > 0 && x + 1 < self.width_mbs).then(|| idx - self.width_mbs + 1),
            d: (x > 0 && y > 0).then(|| idx - self.width_mbs - 1),
        }
    }

    /// A neighbour participates in prediction only when it was decoded in
    /// this picture and belongs to the same slice.
    pub fn available(&self, idx: Option<usize>, slice_id: u32) -> Option<usize> {
        idx.filter(|&i| self.mbs[i].decoded && self.mbs[i].slice_id == slice_id)
    }
}
