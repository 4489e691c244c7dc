use log::trace;

use crate::bitreader::BitReader;
use crate::cavlc;
use crate::deblock::chroma_qp;
use crate::error::{Error, Result};
use crate::intra;
use crate::macroblock::{
    BLOCK4_OFFSET, BLOCK8_OFFSET, CBP_INTRA, DeblockParams, MbClass, MbGrid, MbInfo,
    RASTER_TO_BLOCK4, parse_i_mb_type,
};
use crate::params::{ParameterSetStore, Pps};
use crate::picture::Picture;
use crate::transform::{
    QuantTables, ZIGZAG_4X4, ZIGZAG_8X8, clip_pixel, inverse_hadamard_2x2, inverse_hadamard_4x4,
    inverse_transform_4x4, inverse_transform_8x8,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceType {
    I,
    Si,
}

impl SliceType {
    fn from_value(value: u32) -> Result<Self> {
        match value % 5 {
            2 => Ok(SliceType::I),
            4 => Ok(SliceType::Si),
            other => Err(Error::Unsupported(format!(
                "slice_type {other} (only intra slices are decoded)"
            ))),
        }
    }
}

/// Slice header, 7.3.3, restricted to the intra subset this decoder accepts.
#[derive(Debug, Clone)]
pub struct SliceHeader {
    pub first_mb_in_slice: u32,
    pub slice_type: SliceType,
    pub pic_parameter_set_id: u8,
    pub frame_num: u32,
    pub idr_pic_id: u32,
    pub pic_order_cnt_lsb: u32,
    pub slice_qp: i32,
    pub deblock: DeblockParams,
}

impl SliceHeader {
    /// Parse from the RBSP reader, leaving it positioned at the first bit of
    /// the slice data. The store resolves the active PPS/SPS pair.
    pub fn parse(
        reader: &mut BitReader<'_>,
        is_idr: bool,
        store: &ParameterSetStore,
    ) -> Result<Self> {
        let first_mb_in_slice = reader.read_ue()?;
        let slice_type = SliceType::from_value(reader.read_ue()?)?;

        let pic_parameter_set_id = reader.read_ue()?;
        if pic_parameter_set_id > 255 {
            return Err(Error::Slice(format!(
                "pic_parameter_set_id {pic_parameter_set_id} out of range"
            )));
        }
        let (sps, pps) = store.active_pair(pic_parameter_set_id as u8)?;
        sps.check_supported()?;
        pps.check_supported()?;

        let frame_num = reader.read_bits(sps.log2_max_frame_num as u32)?;

        let mut idr_pic_id = 0;
        if is_idr {
            idr_pic_id = reader.read_ue()?;
        }

        let mut pic_order_cnt_lsb = 0;
        if sps.pic_order_cnt_type == 0 {
            pic_order_cnt_lsb = reader.read_bits(sps.log2_max_pic_order_cnt_lsb as u32)?;
            if pps.bottom_field_pic_order_in_frame_present_flag {
                let _delta_pic_order_cnt_bottom = reader.read_se()?;
            }
        } else if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero_flag {
            let _delta_pic_order_cnt0 = reader.read_se()?;
            if pps.bottom_field_pic_order_in_frame_present_flag {
                let _delta_pic_order_cnt1 = reader.read_se()?;
            }
        }

        if pps.redundant_pic_cnt_present_flag {
            let _redundant_pic_cnt = reader.read_ue()?;
        }

        // dec_ref_pic_marking: an IDR carries exactly two flags.
        if is_idr {
            let _no_output_of_prior_pics_flag = reader.read_flag()?;
            let _long_term_reference_flag = reader.read_flag()?;
        }

        let slice_qp_delta = reader.read_se()?;
        let slice_qp = pps.pic_init_qp + slice_qp_delta;
        if !(0..=51).contains(&slice_qp) {
            return Err(Error::Slice(format!("slice QP {slice_qp} out of range")));
        }

        if slice_type == SliceType::Si {
            let _slice_qs_delta = reader.read_se()?;
        }

        let mut deblock = DeblockParams::default();
        if pps.deblocking_filter_control_present_flag {
            let idc = reader.read_ue()?;
            if idc > 2 {
                return Err(Error::Slice(format!(
                    "disable_deblocking_filter_idc {idc} out of range"
                )));
            }
            deblock.disable_idc = idc as u8;
            if idc != 1 {
                deblock.alpha_offset = reader.read_se()? * 2;
                deblock.beta_offset = reader.read_se()? * 2;
            }
        }

        Ok(SliceHeader {
            first_mb_in_slice,
            slice_type,
            pic_parameter_set_id: pic_parameter_set_id as u8,
            frame_num,
            idr_pic_id,
            pic_order_cnt_lsb,
            slice_qp,
            deblock,
        })
    }
}

/// Parsed residual coefficients of one macroblock, still in scan order.
#[derive(Clone)]
struct MbResiduals {
    luma_dc: [i32; 16],
    luma: [[i32; 16]; 16],
    luma8: [[i32; 64]; 4],
    chroma_dc: [[i32; 4]; 2],
    chroma: [[[i32; 16]; 4]; 2],
}

impl Default for MbResiduals {
    fn default() -> Self {
        Self {
            luma_dc: [0; 16],
            luma: [[0; 16]; 16],
            luma8: [[0; 64]; 4],
            chroma_dc: [[0; 4]; 2],
            chroma: [[[0; 16]; 4]; 2],
        }
    }
}

/// Decode the macroblocks of one slice into the picture (7.3.4 slice data,
/// intra subset, CAVLC).
pub fn decode_slice_data(
    reader: &mut BitReader<'_>,
    header: &SliceHeader,
    pps: &Pps,
    quant: &QuantTables,
    grid: &mut MbGrid,
    pic: &mut Picture,
    slice_id: u32,
) -> Result<()> {
    if header.slice_type == SliceType::Si {
        return Err(Error::Unsupported("SI slice decoding".into()));
    }

    let mut dec = SliceDecoder {
        pps,
        quant,
        header,
        grid,
        pic,
        slice_id,
        prev_qp: header.slice_qp,
    };

    let mut addr = header.first_mb_in_slice as usize;
    loop {
        if addr >= dec.grid.len() {
            return Err(Error::Slice(format!(
                "macroblock address {addr} beyond picture ({} macroblocks)",
                dec.grid.len()
            )));
        }
        dec.decode_macroblock(reader, addr)?;
        addr += 1;
        if !reader.more_rbsp_data() {
            break;
        }
    }
    trace!(
        "slice {slice_id}: decoded macroblocks {}..{addr}",
        header.first_mb_in_slice
    );
    Ok(())
}

struct SliceDecoder<'a> {
    pps: &'a Pps,
    quant: &'a QuantTables,
    header: &'a SliceHeader,
    grid: &'a mut MbGrid,
    pic: &'a mut Picture,
    slice_id: u32,
    prev_qp: i32,
}

impl SliceDecoder<'_> {
    fn decode_macroblock(&mut self, reader: &mut BitReader<'_>, addr: usize) -> Result<()> {
        let mut info = MbInfo {
            slice_id: self.slice_id,
            deblock: self.header.deblock,
            ..MbInfo::default()
        };

        let mb_type = parse_i_mb_type(reader.read_ue()?)?;
        info.class = mb_type.class;

        if mb_type.class == MbClass::IPcm {
            self.decode_pcm(reader, addr, &mut info)?;
            self.grid.mbs[addr] = info;
            return Ok(());
        }

        let mut transform_8x8 = false;
        if mb_type.class == MbClass::IntraNxN && self.pps.transform_8x8_mode_flag {
            transform_8x8 = reader.read_flag()?;
        }
        info.transform_8x8 = transform_8x8;

        // Prediction modes.
        if mb_type.class == MbClass::IntraNxN {
            if transform_8x8 {
                for blk8 in 0..4 {
                    let prev = reader.read_flag()?;
                    let rem = if prev { 0 } else { reader.read_bits(3)? as u8 };
                    let mode = self.derive_4x4_mode(addr, &info, 4 * blk8, prev, rem);
                    for sub in 0..4 {
                        info.intra4x4_modes[4 * blk8 + sub] = mode;
                    }
                }
            } else {
                for blk in 0..16 {
                    let prev = reader.read_flag()?;
                    let rem = if prev { 0 } else { reader.read_bits(3)? as u8 };
                    info.intra4x4_modes[blk] = self.derive_4x4_mode(addr, &info, blk, prev, rem);
                }
            }
        }

        let chroma_mode = reader.read_ue()? as u8;
        if chroma_mode > 3 {
            return Err(Error::Slice(format!(
                "intra_chroma_pred_mode {chroma_mode} out of range"
            )));
        }

        // Coded block pattern.
        let (mut cbp_luma, mut cbp_chroma) = (mb_type.cbp_luma, mb_type.cbp_chroma);
        if mb_type.cbp_in_stream {
            let code = reader.read_ue()?;
            if code >= 48 {
                return Err(Error::Slice(format!("coded_block_pattern code {code} out of range")));
            }
            let cbp = CBP_INTRA[code as usize];
            cbp_luma = cbp & 0b1111;
            cbp_chroma = cbp >> 4;
            if cbp_chroma > 2 {
                return Err(Error::Slice(format!("chroma CBP {cbp_chroma} out of range")));
            }
        }

        let is_16x16 = matches!(mb_type.class, MbClass::Intra16x16 { .. });
        if cbp_luma != 0 || cbp_chroma != 0 || is_16x16 {
            let delta = reader.read_se()?;
            if !(-26..=25).contains(&delta) {
                return Err(Error::Slice(format!("mb_qp_delta {delta} out of range")));
            }
            self.prev_qp = (self.prev_qp + delta + 52) % 52;
        }
        info.qp_y = self.prev_qp;

        // Residuals.
        let mut res = MbResiduals::default();
        if is_16x16 {
            let nc = self.luma_nc(addr, &info, 0);
            let dc = cavlc::residual_block(reader, nc, 16)?;
            res.luma_dc = dc.coeffs;
        }

        for blk8 in 0..4usize {
            if cbp_luma & (1 << blk8) == 0 {
                continue;
            }
            for sub in 0..4usize {
                let blk = 4 * blk8 + sub;
                let nc = self.luma_nc(addr, &info, blk);
                let max = if is_16x16 { 15 } else { 16 };
                let block = cavlc::residual_block(reader, nc, max)?;
                info.luma_nz[blk] = block.total_coeff;
                if transform_8x8 {
                    // CAVLC ships an 8x8 block as four interleaved 4x4 reads.
                    for (k, &c) in block.coeffs.iter().enumerate() {
                        res.luma8[blk8][4 * k + sub] = c;
                    }
                } else {
                    res.luma[blk] = block.coeffs;
                }
            }
        }

        if cbp_chroma != 0 {
            for comp in 0..2usize {
                let dc = cavlc::residual_block(reader, -1, 4)?;
                res.chroma_dc[comp] = [dc.coeffs[0], dc.coeffs[1], dc.coeffs[2], dc.coeffs[3]];
            }
        }
        if cbp_chroma == 2 {
            for comp in 0..2usize {
                for blk in 0..4usize {
                    let nc = self.chroma_nc(addr, &info, comp, blk);
                    let block = cavlc::residual_block(reader, nc, 15)?;
                    info.chroma_nz[comp][blk] = block.total_coeff;
                    res.chroma[comp][blk] = block.coeffs;
                }
            }
        }

        // Reconstruction.
        match mb_type.class {
            MbClass::Intra16x16 { pred_mode } => {
                self.reconstruct_16x16(addr, &info, pred_mode, cbp_luma, &res)?;
            }
            MbClass::IntraNxN => {
                if transform_8x8 {
                    self.reconstruct_8x8(addr, &info, &res)?;
                } else {
                    self.reconstruct_4x4(addr, &info, &res)?;
                }
            }
            MbClass::IPcm => unreachable!(),
        }
        self.reconstruct_chroma(addr, &info, chroma_mode, cbp_chroma, &res)?;

        info.decoded = true;
        self.grid.mbs[addr] = info;
        Ok(())
    }

    fn decode_pcm(
        &mut self,
        reader: &mut BitReader<'_>,
        addr: usize,
        info: &mut MbInfo,
    ) -> Result<()> {
        reader.byte_align();
        let (mbx, mby) = self.grid.pos(addr);
        for y in 0..16 {
            for x in 0..16 {
                let v = reader.read_u8()?;
                self.pic.y.set(mbx * 16 + x, mby * 16 + y, v);
            }
        }
        for comp in 0..2 {
            for y in 0..8 {
                for x in 0..8 {
                    let v = reader.read_u8()?;
                    let plane = if comp == 0 { &mut self.pic.cb } else { &mut self.pic.cr };
                    plane.set(mbx * 8 + x, mby * 8 + y, v);
                }
            }
        }
        // PCM blocks count as fully coded for nC purposes and are exempt
        // from the loop filter via the zero QP.
        info.luma_nz = [16; 16];
        info.chroma_nz = [[16; 4]; 2];
        info.qp_y = 0;
        info.decoded = true;
        Ok(())
    }

    // -----------------------------
    // Neighbour state
    // -----------------------------

    /// Mode of the neighbouring 4x4 block for most-probable-mode derivation;
    /// None when unavailable, DC-coded when the neighbour is not I_NxN.
    fn neighbor_4x4_mode(
        &self,
        addr: usize,
        info: &MbInfo,
        bx: i32,
        by: i32,
    ) -> Option<u8> {
        let (mb_idx, blk) = self.locate_luma_block(addr, bx, by)?;
        if mb_idx == addr {
            return Some(info.intra4x4_modes[blk]);
        }
        let mb = &self.grid.mbs[mb_idx];
        if mb.class == MbClass::IntraNxN {
            Some(mb.intra4x4_modes[blk])
        } else {
            Some(intra::PRED_4X4_DC)
        }
    }

    fn derive_4x4_mode(&self, addr: usize, info: &MbInfo, blk: usize, prev: bool, rem: u8) -> u8 {
        let (x, y) = BLOCK4_OFFSET[blk];
        let (mbx, mby) = self.grid.pos(addr);
        let bx = (mbx * 4 + x / 4) as i32;
        let by = (mby * 4 + y / 4) as i32;
        let mode_a = self.neighbor_4x4_mode(addr, info, bx - 1, by);
        let mode_b = self.neighbor_4x4_mode(addr, info, bx, by - 1);
        intra::derived_4x4_mode(mode_a, mode_b, prev, rem)
    }

    /// Resolve global luma 4x4 block coordinates to (macroblock, block index),
    /// or None when outside the picture or in a foreign/undecoded macroblock.
    fn locate_luma_block(&self, addr: usize, bx: i32, by: i32) -> Option<(usize, usize)> {
        if bx < 0 || by < 0 {
            return None;
        }
        let (bx, by) = (bx as usize, by as usize);
        if bx >= self.grid.width_mbs * 4 || by >= self.grid.height_mbs * 4 {
            return None;
        }
        let mb_idx = (by / 4) * self.grid.width_mbs + bx / 4;
        let blk = RASTER_TO_BLOCK4[(by % 4) * 4 + bx % 4];
        if mb_idx == addr {
            return Some((mb_idx, blk));
        }
        self.grid
            .available(Some(mb_idx), self.slice_id)
            .map(|i| (i, blk))
    }

    fn luma_nc(&self, addr: usize, info: &MbInfo, blk: usize) -> i32 {
        let (x, y) = BLOCK4_OFFSET[blk];
        let (mbx, mby) = self.grid.pos(addr);
        let bx = (mbx * 4 + x / 4) as i32;
        let by = (mby * 4 + y / 4) as i32;

        let fetch = |nbx: i32, nby: i32| -> Option<u8> {
            self.locate_luma_block(addr, nbx, nby).map(|(mb_idx, b)| {
                if mb_idx == addr {
                    info.luma_nz[b]
                } else {
                    self.grid.mbs[mb_idx].luma_nz[b]
                }
            })
        };
        cavlc::nc_from_neighbors(fetch(bx - 1, by), fetch(bx, by - 1))
    }

    fn chroma_nc(&self, addr: usize, info: &MbInfo, comp: usize, blk: usize) -> i32 {
        let (mbx, mby) = self.grid.pos(addr);
        let bx = (mbx * 2 + blk % 2) as i32;
        let by = (mby * 2 + blk / 2) as i32;

        let fetch = |nbx: i32, nby: i32| -> Option<u8> {
            if nbx < 0 || nby < 0 {
                return None;
            }
            let (nbx, nby) = (nbx as usize, nby as usize);
            if nbx >= self.grid.width_mbs * 2 || nby >= self.grid.height_mbs * 2 {
                return None;
            }
            let mb_idx = (nby / 2) * self.grid.width_mbs + nbx / 2;
            let b = (nby % 2) * 2 + nbx % 2;
            if mb_idx == addr {
                Some(info.chroma_nz[comp][b])
            } else {
                self.grid
                    .available(Some(mb_idx), self.slice_id)
                    .map(|i| self.grid.mbs[i].chroma_nz[comp][b])
            }
        };
        cavlc::nc_from_neighbors(fetch(bx - 1, by), fetch(bx, by - 1))
    }

    // -----------------------------
    // Reference sample gathering
    // -----------------------------

    /// Luma sample availability for intra prediction: inside the picture, in
    /// this slice, and already reconstructed (earlier macroblock, or an
    /// earlier block of the current one).
    fn luma_sample_avail(&self, addr: usize, progress: usize, sx: i32, sy: i32) -> bool {
        if sx < 0 || sy < 0 {
            return false;
        }
        let (sx, sy) = (sx as usize, sy as usize);
        if sx >= self.grid.width_mbs * 16 || sy >= self.grid.height_mbs * 16 {
            return false;
        }
        let mb_idx = (sy / 16) * self.grid.width_mbs + sx / 16;
        if mb_idx == addr {
            let r = ((sy % 16) / 4) * 4 + (sx % 16) / 4;
            return RASTER_TO_BLOCK4[r] < progress;
        }
        self.grid.available(Some(mb_idx), self.slice_id).is_some()
    }

    fn chroma_sample_avail(&self, addr: usize, sx: i32, sy: i32) -> bool {
        if sx < 0 || sy < 0 {
            return false;
        }
        let (sx, sy) = (sx as usize, sy as usize);
        if sx >= self.grid.width_mbs * 8 || sy >= self.grid.height_mbs * 8 {
            return false;
        }
        let mb_idx = (sy / 8) * self.grid.width_mbs + sx / 8;
        if mb_idx == addr {
            return false;
        }
        self.grid.available(Some(mb_idx), self.slice_id).is_some()
    }

    /// Gather NxN block references with above-right substitution.
    fn luma_refs(&self, addr: usize, progress: usize, px: usize, py: usize, n: usize) -> intra::BlockRefs {
        let (px, py) = (px as i32, py as i32);

        let above = if self.luma_sample_avail(addr, progress, px, py - 1) {
            let mut row: Vec<i32> = (0..n as i32)
                .map(|i| self.pic.y.get((px + i) as usize, (py - 1) as usize) as i32)
                .collect();
            if self.luma_sample_avail(addr, progress, px + n as i32, py - 1) {
                for i in 0..n as i32 {
                    row.push(self.pic.y.get((px + n as i32 + i) as usize, (py - 1) as usize) as i32);
                }
            } else {
                let edge = row[n - 1];
                row.extend(std::iter::repeat_n(edge, n));
            }
            Some(row)
        } else {
            None
        };

        let left = if self.luma_sample_avail(addr, progress, px - 1, py) {
            Some(
                (0..n as i32)
                    .map(|i| self.pic.y.get((px - 1) as usize, (py + i) as usize) as i32)
                    .collect(),
            )
        } else {
            None
        };

        let above_left = self
            .luma_sample_avail(addr, progress, px - 1, py - 1)
            .then(|| self.pic.y.get((px - 1) as usize, (py - 1) as usize) as i32);

        intra::BlockRefs {
            above,
            left,
            above_left,
        }
    }

    // -----------------------------
    // Reconstruction
    // -----------------------------

    fn add_residual_4x4(&mut self, px: usize, py: usize, pred: &[i32; 16], raster: &[i32; 16]) {
        for y in 0..4 {
            for x in 0..4 {
                let v = clip_pixel(pred[y * 4 + x] + raster[y * 4 + x]);
                self.pic.y.set(px + x, py + y, v);
            }
        }
    }

    fn reconstruct_4x4(&mut self, addr: usize, info: &MbInfo, res: &MbResiduals) -> Result<()> {
        let (mbx, mby) = self.grid.pos(addr);
        for blk in 0..16 {
            let (ox, oy) = BLOCK4_OFFSET[blk];
            let (px, py) = (mbx * 16 + ox, mby * 16 + oy);

            let refs = self.luma_refs(addr, blk, px, py, 4);
            let mut pred = [0i32; 16];
            intra::predict_nxn(info.intra4x4_modes[blk], 4, &refs, &mut pred)?;

            let mut raster = [0i32; 16];
            for (k, &r) in ZIGZAG_4X4.iter().enumerate() {
                raster[r] = res.luma[blk][k];
            }
            self.quant.dequant_4x4(&mut raster, 0, info.qp_y, false);
            inverse_transform_4x4(&mut raster);
            self.add_residual_4x4(px, py, &pred, &raster);
        }
        Ok(())
    }

    fn reconstruct_8x8(&mut self, addr: usize, info: &MbInfo, res: &MbResiduals) -> Result<()> {
        let (mbx, mby) = self.grid.pos(addr);
        for blk8 in 0..4 {
            let (ox, oy) = BLOCK8_OFFSET[blk8];
            let (px, py) = (mbx * 16 + ox, mby * 16 + oy);

            let mut refs = self.luma_refs(addr, 4 * blk8, px, py, 8);
            intra::filter_8x8_refs(&mut refs);
            let mut pred = [0i32; 64];
            intra::predict_nxn(info.intra4x4_modes[4 * blk8], 8, &refs, &mut pred)?;

            let mut raster = [0i32; 64];
            for (k, &r) in ZIGZAG_8X8.iter().enumerate() {
                raster[r] = res.luma8[blk8][k];
            }
            self.quant.dequant_8x8(&mut raster, info.qp_y);
            inverse_transform_8x8(&mut raster);

            for y in 0..8 {
                for x in 0..8 {
                    let v = clip_pixel(pred[y * 8 + x] + raster[y * 8 + x]);
                    self.pic.y.set(px + x, py + y, v);
                }
            }
        }
        Ok(())
    }

    fn reconstruct_16x16(
        &mut self,
        addr: usize,
        info: &MbInfo,
        pred_mode: u8,
        cbp_luma: u8,
        res: &MbResiduals,
    ) -> Result<()> {
        let (mbx, mby) = self.grid.pos(addr);
        let (px, py) = (mbx * 16, mby * 16);

        let above: Option<[i32; 16]> = self
            .luma_sample_avail(addr, 0, px as i32, py as i32 - 1)
            .then(|| std::array::from_fn(|i| self.pic.y.get(px + i, py - 1) as i32));
        let left: Option<[i32; 16]> = self
            .luma_sample_avail(addr, 0, px as i32 - 1, py as i32)
            .then(|| std::array::from_fn(|i| self.pic.y.get(px - 1, py + i) as i32));
        let above_left = self
            .luma_sample_avail(addr, 0, px as i32 - 1, py as i32 - 1)
            .then(|| self.pic.y.get(px - 1, py - 1) as i32);

        let mut pred = [0i32; 256];
        intra::predict_16x16(pred_mode, above.as_ref(), left.as_ref(), above_left, &mut pred)?;

        // Luma DC travels through the extra Hadamard stage.
        let mut dc = [0i32; 16];
        for (k, &r) in ZIGZAG_4X4.iter().enumerate() {
            dc[r] = res.luma_dc[k];
        }
        inverse_hadamard_4x4(&mut dc);
        self.quant.dequant_luma_dc(&mut dc, info.qp_y);

        for blk in 0..16 {
            let (ox, oy) = BLOCK4_OFFSET[blk];
            let mut raster = [0i32; 16];
            if cbp_luma & (1 << (blk / 4)) != 0 {
                for (k, &r) in ZIGZAG_4X4.iter().enumerate().skip(1) {
                    raster[r] = res.luma[blk][k - 1];
                }
                self.quant.dequant_4x4(&mut raster, 0, info.qp_y, true);
            }
            // DC blocks are indexed in raster order within the macroblock.
            raster[0] = dc[(oy / 4) * 4 + ox / 4];
            inverse_transform_4x4(&mut raster);

            let mut block_pred = [0i32; 16];
            for y in 0..4 {
                for x in 0..4 {
                    block_pred[y * 4 + x] = pred[(oy + y) * 16 + ox + x];
                }
            }
            self.add_residual_4x4(px + ox, py + oy, &block_pred, &raster);
        }
        Ok(())
    }

    fn reconstruct_chroma(
        &mut self,
        addr: usize,
        info: &MbInfo,
        chroma_mode: u8,
        cbp_chroma: u8,
        res: &MbResiduals,
    ) -> Result<()> {
        let (mbx, mby) = self.grid.pos(addr);
        let (px, py) = (mbx * 8, mby * 8);

        for comp in 0..2usize {
            let plane = if comp == 0 { &self.pic.cb } else { &self.pic.cr };
            let above: Option<[i32; 8]> = self
                .chroma_sample_avail(addr, px as i32, py as i32 - 1)
                .then(|| std::array::from_fn(|i| plane.get(px + i, py - 1) as i32));
            let left: Option<[i32; 8]> = self
                .chroma_sample_avail(addr, px as i32 - 1, py as i32)
                .then(|| std::array::from_fn(|i| plane.get(px - 1, py + i) as i32));
            let above_left = self
                .chroma_sample_avail(addr, px as i32 - 1, py as i32 - 1)
                .then(|| plane.get(px - 1, py - 1) as i32);

            let mut pred = [0i32; 64];
            intra::predict_chroma(chroma_mode, above.as_ref(), left.as_ref(), above_left, &mut pred)?;

            let offset = if comp == 0 {
                self.pps.chroma_qp_index_offset
            } else {
                self.pps.second_chroma_qp_index_offset
            };
            let qp_c = chroma_qp(info.qp_y, offset);
            let list = 1 + comp;

            let mut dc = res.chroma_dc[comp];
            if cbp_chroma != 0 {
                inverse_hadamard_2x2(&mut dc);
                self.quant.dequant_chroma_dc(&mut dc, list, qp_c);
            }

            for blk in 0..4usize {
                let (ox, oy) = ((blk % 2) * 4, (blk / 2) * 4);
                let mut raster = [0i32; 16];
                if cbp_chroma == 2 {
                    for (k, &r) in ZIGZAG_4X4.iter().enumerate().skip(1) {
                        raster[r] = res.chroma[comp][blk][k - 1];
                    }
                    self.quant.dequant_4x4(&mut raster, list, qp_c, true);
                }
                if cbp_chroma != 0 {
                    raster[0] = dc[blk];
                }
                inverse_transform_4x4(&mut raster);

                for y in 0..4 {
                    for x in 0..4 {
                        let v = clip_pixel(pred[(oy + y) * 8 + ox + x] + raster[y * 4 + x]);
                        let plane = if comp == 0 { &mut self.pic.cb } else { &mut self.pic.cr };
                        plane.set(px + ox + x, py + oy + y, v);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitreader::BitWriter;
    use crate::params::{ScalingMatrix, Sps};

    fn single_mb_sps() -> Sps {
        let mut w = BitWriter::new();
        w.put_bits(66, 8);
        w.put_bits(0, 8);
        w.put_bits(10, 8);
        w.put_ue(0); // sps id
        w.put_ue(0); // log2_max_frame_num_minus4
        w.put_ue(2); // pic_order_cnt_type
        w.put_ue(1); // max_num_ref_frames
        w.put_bit(false);
        w.put_ue(0); // 1 mb wide
        w.put_ue(0); // 1 mb high
        w.put_bit(true); // frame_mbs_only
        w.put_bit(true);
        w.put_bit(false); // no cropping
        w.put_bit(false); // no vui
        Sps::parse(&w.finish()).unwrap()
    }

    fn plain_pps(store: &ParameterSetStore) -> Pps {
        let mut w = BitWriter::new();
        w.put_ue(0);
        w.put_ue(0);
        w.put_bit(false); // CAVLC
        w.put_bit(false);
        w.put_ue(0);
        w.put_ue(0);
        w.put_ue(0);
        w.put_bit(false);
        w.put_bits(0, 2);
        w.put_se(0); // pic_init_qp 26
        w.put_se(0);
        w.put_se(0);
        w.put_bit(true); // deblocking control present
        w.put_bit(false);
        w.put_bit(false);
        Pps::parse(&w.finish(), store).unwrap()
    }

    fn store_with_sets() -> ParameterSetStore {
        let mut store = ParameterSetStore::new();
        store.put_sps(single_mb_sps());
        let pps = plain_pps(&store);
        store.put_pps(pps);
        store
    }

    /// Slice header + one I_16x16 DC macroblock with no residual: a uniform
    /// mid-gray 16x16 IDR picture.
    fn gray_mb_slice_rbsp() -> Vec<u8> {
        let mut w = BitWriter::new();
        // slice header
        w.put_ue(0); // first_mb_in_slice
        w.put_ue(2); // slice_type I
        w.put_ue(0); // pps id
        w.put_bits(0, 4); // frame_num
        w.put_ue(0); // idr_pic_id
        w.put_bit(false); // no_output_of_prior_pics
        w.put_bit(false); // long_term_reference
        w.put_se(0); // slice_qp_delta
        w.put_ue(1); // disable deblocking
        // macroblock: I_16x16, DC pred, no coded residual -> mb_type 3
        w.put_ue(3);
        w.put_ue(0); // intra_chroma_pred_mode DC
        w.put_se(0); // mb_qp_delta
        w.put_bit(true); // luma DC coeff_token: TotalCoeff 0
        w.finish()
    }

    #[test]
    fn header_parses_idr_fields() {
        let store = store_with_sets();
        let rbsp = gray_mb_slice_rbsp();
        let mut reader = BitReader::new(&rbsp);
        let header = SliceHeader::parse(&mut reader, true, &store).unwrap();

        assert_eq!(header.first_mb_in_slice, 0);
        assert_eq!(header.slice_type, SliceType::I);
        assert_eq!(header.pic_parameter_set_id, 0);
        assert_eq!(header.slice_qp, 26);
        assert_eq!(header.deblock.disable_idc, 1);
    }

    #[test]
    fn non_intra_slice_type_is_rejected() {
        let store = store_with_sets();
        let mut w = BitWriter::new();
        w.put_ue(0);
        w.put_ue(0); // P slice
        w.put_ue(0);
        let rbsp = w.finish();
        let mut reader = BitReader::new(&rbsp);
        assert!(matches!(
            SliceHeader::parse(&mut reader, false, &store),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn gray_macroblock_decodes_flat() {
        let store = store_with_sets();
        let rbsp = gray_mb_slice_rbsp();
        let mut reader = BitReader::new(&rbsp);
        let header = SliceHeader::parse(&mut reader, true, &store).unwrap();
        let (_sps, pps) = store.active_pair(0).unwrap();

        let quant = QuantTables::new(&ScalingMatrix::flat());
        let mut grid = MbGrid::new(1, 1);
        let mut pic = Picture::new(16, 16, 0);

        decode_slice_data(&mut reader, &header, pps, &quant, &mut grid, &mut pic, 1)
            .unwrap();

        assert!(grid.mbs[0].decoded);
        assert_eq!(grid.mbs[0].qp_y, 26);
        assert!(pic.y.data.iter().all(|&v| v == 128));
        assert!(pic.cb.data.iter().all(|&v| v == 128));
        assert!(pic.cr.data.iter().all(|&v| v == 128));
    }

    #[test]
    fn pcm_macroblock_copies_samples() {
        let store = store_with_sets();
        let mut w = BitWriter::new();
        w.put_ue(0);
        w.put_ue(2);
        w.put_ue(0);
        w.put_bits(0, 4);
        w.put_ue(0);
        w.put_bit(false);
        w.put_bit(false);
        w.put_se(0);
        w.put_ue(1); // disable deblocking
        w.put_ue(25); // I_PCM
        // pcm_alignment_zero_bit up to the byte boundary, then raw samples.
        let mut rbsp = w.into_bytes();
        rbsp.extend(std::iter::repeat_n(0x55u8, 256)); // luma
        rbsp.extend(std::iter::repeat_n(0x22u8, 64)); // cb
        rbsp.extend(std::iter::repeat_n(0x99u8, 64)); // cr
        rbsp.push(0x80); // stop bit

        let mut reader = BitReader::new(&rbsp);
        let header = SliceHeader::parse(&mut reader, true, &store).unwrap();
        let (_sps, pps) = store.active_pair(0).unwrap();
        let quant = QuantTables::new(&ScalingMatrix::flat());
        let mut grid = MbGrid::new(1, 1);
        let mut pic = Picture::new(16, 16, 0);

        decode_slice_data(&mut reader, &header, pps, &quant, &mut grid, &mut pic, 1)
            .unwrap();

        assert!(pic.y.data.iter().all(|&v| v == 0x55));
        assert!(pic.cb.data.iter().all(|&v| v == 0x22));
        assert!(pic.cr.data.iter().all(|&v| v == 0x99));
        assert_eq!(grid.mbs[0].luma_nz, [16; 16]);
        assert_eq!(grid.mbs[0].qp_y, 0);
    }
}
