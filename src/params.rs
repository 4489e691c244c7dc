use log::debug;

use crate::bitreader::BitReader;
use crate::error::{Error, Result};
use crate::nal::{Nal, NalUnitType};

pub const MAX_SPS: usize = 32;
pub const MAX_PPS: usize = 256;

// Default scaling matrices from ISO/IEC 14496-10 tables 7-3/7-4, in
// zig-zag scan order.
pub const DEFAULT_4X4_INTRA: [u8; 16] = [6, 13, 13, 20, 20, 20, 28, 28, 28, 28, 32, 32, 32, 37, 37, 42];
pub const DEFAULT_4X4_INTER: [u8; 16] = [10, 14, 14, 20, 20, 20, 24, 24, 24, 24, 27, 27, 27, 30, 30, 34];
pub const DEFAULT_8X8_INTRA: [u8; 64] = [
    6, 10, 10, 13, 11, 13, 16, 16, 16, 16, 18, 18, 18, 18, 18, 23, 23, 23, 23, 23, 23, 25, 25, 25,
    25, 25, 25, 25, 27, 27, 27, 27, 27, 27, 27, 27, 29, 29, 29, 29, 29, 29, 29, 29, 31, 31, 31, 31,
    31, 31, 31, 33, 33, 33, 33, 33, 36, 36, 36, 36, 38, 38, 40, 42,
];
pub const DEFAULT_8X8_INTER: [u8; 64] = [
    9, 13, 13, 15, 13, 15, 17, 17, 17, 17, 19, 19, 19, 19, 19, 21, 21, 21, 21, 21, 21, 22, 22, 22,
    22, 22, 22, 22, 24, 24, 24, 24, 24, 24, 24, 24, 25, 25, 25, 25, 25, 25, 25, 25, 27, 27, 27, 27,
    27, 27, 27, 28, 28, 28, 28, 28, 30, 30, 30, 30, 32, 32, 33, 35,
];

/// Resolved weight matrices, zig-zag scan order. Lists 0..2 are the intra
/// Y/Cb/Cr 4x4 lists, 3..5 inter; 8x8 lists are luma intra/inter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalingMatrix {
    pub m4x4: [[u8; 16]; 6],
    pub m8x8: [[u8; 64]; 2],
}

impl ScalingMatrix {
    pub fn flat() -> Self {
        Self {
            m4x4: [[16; 16]; 6],
            m8x8: [[16; 64]; 2],
        }
    }
}

/// One scaling_list() invocation, 7.3.2.1.1. Returns whether the stream
/// asked for the default matrix.
fn parse_scaling_list(reader: &mut BitReader<'_>, list: &mut [u8]) -> Result<bool> {
    let mut last_scale: i32 = 8;
    let mut next_scale: i32 = 8;
    let mut use_default = false;

    for (j, slot) in list.iter_mut().enumerate() {
        if next_scale != 0 {
            let delta_scale = reader.read_se()?;
            next_scale = (last_scale + delta_scale + 256) % 256;
            if j == 0 && next_scale == 0 {
                use_default = true;
            }
        }
        *slot = if next_scale == 0 {
            last_scale as u8
        } else {
            next_scale as u8
        };
        last_scale = *slot as i32;
    }

    Ok(use_default)
}

/// Shared scaling-matrix body for SPS and PPS.
///
/// `fallback` supplies the list used when the stream omits one: the SPS
/// matrix for a PPS (fall-back rule B), `None` for rule A defaults.
fn parse_scaling_matrix(
    reader: &mut BitReader<'_>,
    count_8x8: usize,
    fallback: Option<&ScalingMatrix>,
) -> Result<ScalingMatrix> {
    let mut matrix = match fallback {
        Some(m) => m.clone(),
        None => ScalingMatrix::flat(),
    };

    for i in 0..6 + count_8x8 {
        let present = reader.read_flag()?;
        let (default_intra, default_inter) = if i < 6 {
            (&DEFAULT_4X4_INTRA[..], &DEFAULT_4X4_INTER[..])
        } else {
            (&DEFAULT_8X8_INTRA[..], &DEFAULT_8X8_INTER[..])
        };

        let mut scratch = [0u8; 64];
        let len = if i < 6 { 16 } else { 64 };

        if present {
            let use_default = parse_scaling_list(reader, &mut scratch[..len])?;
            if use_default {
                // 4x4 lists 0..2 are intra, 3..5 inter; 8x8 lists alternate.
                let intra = if i < 6 { i < 3 } else { (i - 6) % 2 == 0 };
                scratch[..len].copy_from_slice(if intra { default_intra } else { default_inter });
            }
        } else {
            // Fall-back rules: anchor lists take the default (rule A) or the
            // active SPS list (rule B); the rest inherit the previous list.
            match (i, fallback) {
                (0, None) => scratch[..len].copy_from_slice(default_intra),
                (3, None) => scratch[..len].copy_from_slice(default_inter),
                (6, None) => scratch[..len].copy_from_slice(default_intra),
                (7, None) => scratch[..len].copy_from_slice(default_inter),
                (0 | 3 | 6 | 7, Some(_)) => {
                    // Already seeded from the fallback matrix.
                    continue;
                }
                _ => {
                    if i < 6 {
                        scratch[..len].copy_from_slice(&matrix.m4x4[i - 1]);
                    } else if i < 8 {
                        scratch[..len].copy_from_slice(&matrix.m8x8[i - 7]);
                    }
                }
            }
        }

        if i < 6 {
            matrix.m4x4[i].copy_from_slice(&scratch[..16]);
        } else if i < 8 {
            matrix.m8x8[i - 6].copy_from_slice(&scratch[..64]);
        }
        // 4:4:4 chroma 8x8 lists (i >= 8) are consumed but not retained.
    }

    Ok(matrix)
}

fn is_high_profile(profile_idc: u8) -> bool {
    matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    )
}

/// Sequence parameter set, 7.3.2.1.
#[derive(Debug, Clone)]
pub struct Sps {
    pub profile_idc: u8,
    pub level_idc: u8,
    pub seq_parameter_set_id: u8,

    pub chroma_format_idc: u8,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub qpprime_y_zero_transform_bypass_flag: bool,
    pub scaling_matrix: Option<ScalingMatrix>,

    pub log2_max_frame_num: u8,
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb: u8,
    pub delta_pic_order_always_zero_flag: bool,

    pub max_num_ref_frames: u32,
    pub gaps_in_frame_num_value_allowed_flag: bool,
    pub pic_width_in_mbs: u32,
    pub pic_height_in_map_units: u32,
    pub frame_mbs_only_flag: bool,
    pub mb_adaptive_frame_field_flag: bool,
    pub direct_8x8_inference_flag: bool,

    pub frame_cropping_flag: bool,
    pub frame_crop_left_offset: u32,
    pub frame_crop_right_offset: u32,
    pub frame_crop_top_offset: u32,
    pub frame_crop_bottom_offset: u32,

    pub vui_parameters_present_flag: bool,
}

impl Sps {
    /// Parse a verbatim parameter-set blob (NAL header byte included), as
    /// stored in `avcC`.
    pub fn parse_blob(blob: &[u8]) -> Result<Self> {
        let nal = Nal::parse(blob)?;
        if nal.unit_type != NalUnitType::Sps {
            return Err(Error::MalformedSps(format!(
                "expected SPS NAL, got {:?}",
                nal.unit_type
            )));
        }
        Self::parse(&nal.to_rbsp())
    }

    pub fn parse(rbsp: &[u8]) -> Result<Self> {
        let mut reader = BitReader::new(rbsp);

        let profile_idc = reader.read_u8()?;
        let _constraint_flags = reader.read_bits(6)?;
        let _reserved_zero_2bits = reader.read_bits(2)?;
        let level_idc = reader.read_u8()?;

        let seq_parameter_set_id = reader.read_ue()?;
        if seq_parameter_set_id as usize >= MAX_SPS {
            return Err(Error::MalformedSps(format!(
                "seq_parameter_set_id {seq_parameter_set_id} out of range"
            )));
        }

        let mut chroma_format_idc = 1;
        let mut bit_depth_luma_minus8 = 0;
        let mut bit_depth_chroma_minus8 = 0;
        let mut qpprime_y_zero_transform_bypass_flag = false;
        let mut scaling_matrix = None;

        if is_high_profile(profile_idc) {
            chroma_format_idc = reader.read_ue()? as u8;
            if chroma_format_idc > 3 {
                return Err(Error::MalformedSps(format!(
                    "chroma_format_idc {chroma_format_idc} out of range"
                )));
            }
            if chroma_format_idc == 3 {
                let _separate_colour_plane_flag = reader.read_flag()?;
            }

            bit_depth_luma_minus8 = reader.read_ue()? as u8;
            bit_depth_chroma_minus8 = reader.read_ue()? as u8;
            qpprime_y_zero_transform_bypass_flag = reader.read_flag()?;

            if reader.read_flag()? {
                let count_8x8 = if chroma_format_idc != 3 { 2 } else { 6 };
                // Only the two luma 8x8 lists are retained; 4:4:4 chroma 8x8
                // lists are parsed for stream position but out of profile.
                let matrix = parse_scaling_matrix(&mut reader, count_8x8, None)?;
                scaling_matrix = Some(matrix);
            }
        }

        let log2_max_frame_num_minus4 = reader.read_ue()?;
        if log2_max_frame_num_minus4 > 12 {
            return Err(Error::MalformedSps(format!(
                "log2_max_frame_num_minus4 {log2_max_frame_num_minus4} out of range"
            )));
        }

        let pic_order_cnt_type = reader.read_ue()? as u8;
        let mut log2_max_pic_order_cnt_lsb = 4;
        let mut delta_pic_order_always_zero_flag = false;

        match pic_order_cnt_type {
            0 => {
                let minus4 = reader.read_ue()?;
                if minus4 > 12 {
                    return Err(Error::MalformedSps(format!(
                        "log2_max_pic_order_cnt_lsb_minus4 {minus4} out of range"
                    )));
                }
                log2_max_pic_order_cnt_lsb = minus4 as u8 + 4;
            }
            1 => {
                delta_pic_order_always_zero_flag = reader.read_flag()?;
                let _offset_for_non_ref_pic = reader.read_se()?;
                let _offset_for_top_to_bottom_field = reader.read_se()?;
                let cycle_len = reader.read_ue()?;
                for _ in 0..cycle_len {
                    let _offset_for_ref_frame = reader.read_se()?;
                }
            }
            2 => {}
            _ => {
                return Err(Error::MalformedSps(format!(
                    "pic_order_cnt_type {pic_order_cnt_type} out of range"
                )));
            }
        }

        let max_num_ref_frames = reader.read_ue()?;
        let gaps_in_frame_num_value_allowed_flag = reader.read_flag()?;

        let pic_width_in_mbs = reader.read_ue()? + 1;
        let pic_height_in_map_units = reader.read_ue()? + 1;

        let frame_mbs_only_flag = reader.read_flag()?;
        let mut mb_adaptive_frame_field_flag = false;
        if !frame_mbs_only_flag {
            mb_adaptive_frame_field_flag = reader.read_flag()?;
        }

        let direct_8x8_inference_flag = reader.read_flag()?;

        let frame_cropping_flag = reader.read_flag()?;
        let mut frame_crop_left_offset = 0;
        let mut frame_crop_right_offset = 0;
        let mut frame_crop_top_offset = 0;
        let mut frame_crop_bottom_offset = 0;
        if frame_cropping_flag {
            frame_crop_left_offset = reader.read_ue()?;
            frame_crop_right_offset = reader.read_ue()?;
            frame_crop_top_offset = reader.read_ue()?;
            frame_crop_bottom_offset = reader.read_ue()?;
        }

        let vui_parameters_present_flag = reader.read_flag()?;
        // VUI carries timing/display hints only; nothing downstream needs it.

        Ok(Sps {
            profile_idc,
            level_idc,
            seq_parameter_set_id: seq_parameter_set_id as u8,
            chroma_format_idc,
            bit_depth_luma_minus8,
            bit_depth_chroma_minus8,
            qpprime_y_zero_transform_bypass_flag,
            scaling_matrix,
            log2_max_frame_num: log2_max_frame_num_minus4 as u8 + 4,
            pic_order_cnt_type,
            log2_max_pic_order_cnt_lsb,
            delta_pic_order_always_zero_flag,
            max_num_ref_frames,
            gaps_in_frame_num_value_allowed_flag,
            pic_width_in_mbs,
            pic_height_in_map_units,
            frame_mbs_only_flag,
            mb_adaptive_frame_field_flag,
            direct_8x8_inference_flag,
            frame_cropping_flag,
            frame_crop_left_offset,
            frame_crop_right_offset,
            frame_crop_top_offset,
            frame_crop_bottom_offset,
            vui_parameters_present_flag,
        })
    }

    pub fn pic_height_in_mbs(&self) -> u32 {
        self.pic_height_in_map_units * if self.frame_mbs_only_flag { 1 } else { 2 }
    }

    /// Display width in luma samples after cropping.
    pub fn width(&self) -> u32 {
        let full = self.pic_width_in_mbs * 16;
        if !self.frame_cropping_flag {
            return full;
        }
        let sub_width_c = if self.chroma_format_idc == 3 { 1 } else { 2 };
        full.saturating_sub(sub_width_c * (self.frame_crop_left_offset + self.frame_crop_right_offset))
    }

    /// Display height in luma samples after cropping.
    pub fn height(&self) -> u32 {
        let full = self.pic_height_in_mbs() * 16;
        if !self.frame_cropping_flag {
            return full;
        }
        let sub_height_c = if self.chroma_format_idc == 1 { 2 } else { 1 };
        let mult = if self.frame_mbs_only_flag { 1 } else { 2 };
        full.saturating_sub(sub_height_c * mult * (self.frame_crop_top_offset + self.frame_crop_bottom_offset))
    }

    /// Reject sequences outside the supported profile subset.
    pub fn check_supported(&self) -> Result<()> {
        if self.chroma_format_idc != 1 {
            return Err(Error::Unsupported(format!(
                "chroma_format_idc {} (only 4:2:0)",
                self.chroma_format_idc
            )));
        }
        if self.bit_depth_luma_minus8 != 0 || self.bit_depth_chroma_minus8 != 0 {
            return Err(Error::Unsupported("bit depths other than 8".into()));
        }
        if !self.frame_mbs_only_flag {
            return Err(Error::Unsupported("interlaced (field) coding".into()));
        }
        Ok(())
    }
}

/// Picture parameter set, 7.3.2.2.
#[derive(Debug, Clone)]
pub struct Pps {
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,
    pub entropy_coding_mode_flag: bool,
    pub bottom_field_pic_order_in_frame_present_flag: bool,
    pub num_slice_groups: u32,

    pub num_ref_idx_l0_default_active: u8,
    pub num_ref_idx_l1_default_active: u8,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_idc: u8,
    pub pic_init_qp: i32,
    pub pic_init_qs: i32,
    pub chroma_qp_index_offset: i32,
    pub deblocking_filter_control_present_flag: bool,
    pub constrained_intra_pred_flag: bool,
    pub redundant_pic_cnt_present_flag: bool,

    pub transform_8x8_mode_flag: bool,
    pub scaling_matrix: Option<ScalingMatrix>,
    pub second_chroma_qp_index_offset: i32,
}

impl Pps {
    pub fn parse_blob(blob: &[u8], store: &ParameterSetStore) -> Result<Self> {
        let nal = Nal::parse(blob)?;
        if nal.unit_type != NalUnitType::Pps {
            return Err(Error::MalformedPps(format!(
                "expected PPS NAL, got {:?}",
                nal.unit_type
            )));
        }
        Self::parse(&nal.to_rbsp(), store)
    }

    /// Parse a PPS RBSP. The store supplies the referenced SPS, whose
    /// scaling matrix seeds fall-back rule B.
    pub fn parse(rbsp: &[u8], store: &ParameterSetStore) -> Result<Self> {
        let mut reader = BitReader::new(rbsp);

        let pic_parameter_set_id = reader.read_ue()?;
        if pic_parameter_set_id as usize >= MAX_PPS {
            return Err(Error::MalformedPps(format!(
                "pic_parameter_set_id {pic_parameter_set_id} out of range"
            )));
        }

        let seq_parameter_set_id = reader.read_ue()?;
        if seq_parameter_set_id as usize >= MAX_SPS {
            return Err(Error::MalformedPps(format!(
                "seq_parameter_set_id {seq_parameter_set_id} out of range"
            )));
        }
        let sps = store
            .sps(seq_parameter_set_id as u8)
            .ok_or(Error::MissingSps(seq_parameter_set_id as u8))?;

        let entropy_coding_mode_flag = reader.read_flag()?;
        let bottom_field_pic_order_in_frame_present_flag = reader.read_flag()?;

        let num_slice_groups = reader.read_ue()? + 1;
        if num_slice_groups > 1 {
            // FMO: parse the map so the bit position stays valid.
            let slice_group_map_type = reader.read_ue()?;
            match slice_group_map_type {
                0 => {
                    for _ in 0..num_slice_groups {
                        let _run_length = reader.read_ue()?;
                    }
                }
                2 => {
                    for _ in 0..num_slice_groups - 1 {
                        let _top_left = reader.read_ue()?;
                        let _bottom_right = reader.read_ue()?;
                    }
                }
                3 | 4 | 5 => {
                    let _change_direction_flag = reader.read_flag()?;
                    let _change_rate = reader.read_ue()?;
                }
                6 => {
                    let pic_size_in_map_units = reader.read_ue()? + 1;
                    let bits = 32 - (num_slice_groups - 1).leading_zeros();
                    for _ in 0..pic_size_in_map_units {
                        reader.read_bits(bits.max(1))?;
                    }
                }
                _ => {}
            }
        }

        let num_ref_idx_l0_default_active = reader.read_ue()? + 1;
        let num_ref_idx_l1_default_active = reader.read_ue()? + 1;
        if num_ref_idx_l0_default_active > 32 || num_ref_idx_l1_default_active > 32 {
            return Err(Error::MalformedPps("num_ref_idx defaults out of range".into()));
        }

        let weighted_pred_flag = reader.read_flag()?;
        let weighted_bipred_idc = reader.read_bits(2)? as u8;

        let pic_init_qp_minus26 = reader.read_se()?;
        if !(-26..=25).contains(&pic_init_qp_minus26) {
            return Err(Error::MalformedPps(format!(
                "pic_init_qp_minus26 {pic_init_qp_minus26} out of range"
            )));
        }
        let pic_init_qs_minus26 = reader.read_se()?;
        if !(-26..=25).contains(&pic_init_qs_minus26) {
            return Err(Error::MalformedPps(format!(
                "pic_init_qs_minus26 {pic_init_qs_minus26} out of range"
            )));
        }

        let chroma_qp_index_offset = reader.read_se()?;
        if !(-12..=12).contains(&chroma_qp_index_offset) {
            return Err(Error::MalformedPps(format!(
                "chroma_qp_index_offset {chroma_qp_index_offset} out of range"
            )));
        }

        let deblocking_filter_control_present_flag = reader.read_flag()?;
        let constrained_intra_pred_flag = reader.read_flag()?;
        let redundant_pic_cnt_present_flag = reader.read_flag()?;

        let mut transform_8x8_mode_flag = false;
        let mut scaling_matrix = None;
        let mut second_chroma_qp_index_offset = chroma_qp_index_offset;

        if reader.more_rbsp_data() {
            transform_8x8_mode_flag = reader.read_flag()?;
            if reader.read_flag()? {
                let count_8x8 = if transform_8x8_mode_flag { 2 } else { 0 };
                let matrix =
                    parse_scaling_matrix(&mut reader, count_8x8, sps.scaling_matrix.as_ref())?;
                scaling_matrix = Some(matrix);
            }
            second_chroma_qp_index_offset = reader.read_se()?;
            if !(-12..=12).contains(&second_chroma_qp_index_offset) {
                return Err(Error::MalformedPps(
                    "second_chroma_qp_index_offset out of range".into(),
                ));
            }
        }

        Ok(Pps {
            pic_parameter_set_id: pic_parameter_set_id as u8,
            seq_parameter_set_id: seq_parameter_set_id as u8,
            entropy_coding_mode_flag,
            bottom_field_pic_order_in_frame_present_flag,
            num_slice_groups,
            num_ref_idx_l0_default_active: num_ref_idx_l0_default_active as u8,
            num_ref_idx_l1_default_active: num_ref_idx_l1_default_active as u8,
            weighted_pred_flag,
            weighted_bipred_idc,
            pic_init_qp: 26 + pic_init_qp_minus26,
            pic_init_qs: 26 + pic_init_qs_minus26,
            chroma_qp_index_offset,
            deblocking_filter_control_present_flag,
            constrained_intra_pred_flag,
            redundant_pic_cnt_present_flag,
            transform_8x8_mode_flag,
            scaling_matrix,
            second_chroma_qp_index_offset,
        })
    }

    pub fn check_supported(&self) -> Result<()> {
        if self.entropy_coding_mode_flag {
            return Err(Error::Unsupported("CABAC entropy coding".into()));
        }
        if self.num_slice_groups > 1 {
            return Err(Error::Unsupported("slice groups (FMO)".into()));
        }
        Ok(())
    }
}

/// Fixed-capacity SPS/PPS tables keyed by id. `put` overwrites; later
/// parameter sets with the same id replace earlier ones.
pub struct ParameterSetStore {
    sps: Vec<Option<Sps>>,
    pps: Vec<Option<Pps>>,
}

impl ParameterSetStore {
    pub fn new() -> Self {
        Self {
            sps: vec![None; MAX_SPS],
            pps: vec![None; MAX_PPS],
        }
    }

    pub fn put_sps(&mut self, sps: Sps) {
        debug!("activating SPS {}", sps.seq_parameter_set_id);
        let id = sps.seq_parameter_set_id as usize;
        self.sps[id] = Some(sps);
    }

    pub fn put_pps(&mut self, pps: Pps) {
        debug!("activating PPS {}", pps.pic_parameter_set_id);
        let id = pps.pic_parameter_set_id as usize;
        self.pps[id] = Some(pps);
    }

    pub fn sps(&self, id: u8) -> Option<&Sps> {
        self.sps.get(id as usize).and_then(|s| s.as_ref())
    }

    pub fn pps(&self, id: u8) -> Option<&Pps> {
        self.pps.get(id as usize).and_then(|p| p.as_ref())
    }

    /// Resolve the active pair for a slice: slice -> PPS id -> SPS id.
    pub fn active_pair(&self, pps_id: u8) -> Result<(&Sps, &Pps)> {
        let pps = self.pps(pps_id).ok_or(Error::MissingPps(pps_id))?;
        let sps = self
            .sps(pps.seq_parameter_set_id)
            .ok_or(Error::MissingSps(pps.seq_parameter_set_id))?;
        Ok((sps, pps))
    }
}

impl Default for ParameterSetStore {
    fn default() -> Self {
        Self::new()
    }
}
