use log::{debug, warn};
use serde::Serialize;

use crate::samples::{SampleIndex, SampleKind, StreamKind};

/// How thumbnails are picked from the available IDR frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExtractionMode {
    /// Keep the index as-is; the decoder walks it front to back.
    Unfiltered,
    /// First N eligible IDRs in stream order.
    Ordered,
    /// N eligible IDRs spread across the program duration.
    Distributed,
}

/// Rejection threshold divisor: frames below `avg / 1.66` (~60% of the
/// average payload) carry too little visual information to bother with.
const SIZE_THRESHOLD_DIVISOR: f64 = 1.66;

/// Fraction of IDRs dropped from each end of the program (title cards,
/// black intros, credits).
const BORDER_FRACTION: f64 = 0.03;

/// Reduce a video sample index to at most `picture_count` significant IDRs.
///
/// Configuration entries are preserved verbatim; undersized IDRs and the
/// first/last few percent of the program are culled before selection.
/// Returns the (possibly replaced) index and the number of IDRs the caller
/// should expect to decode. A count of zero with an empty-IDR input is not
/// an error; the caller decides what that means.
pub fn idr_filter(
    index: SampleIndex,
    picture_count: usize,
    mode: ExtractionMode,
) -> (SampleIndex, usize) {
    if index.stream_kind != StreamKind::Video {
        warn!("idr filter invoked on a non-video index");
        return (index, 0);
    }

    let idr_count = index.sample_count_idr;
    if idr_count == 0 {
        warn!("no IDR samples inside the stream, 0 pictures will be extracted");
        return (index, 0);
    }

    let mut n = picture_count;
    if idr_count < n {
        warn!("not enough IDR samples inside the stream, only {idr_count} pictures will be extracted");
        n = idr_count;
    }

    if mode == ExtractionMode::Unfiltered || n == 0 {
        return (index, n);
    }

    // Nothing to thin out; this also makes the filter idempotent, since a
    // filtered index re-enters here with exactly n IDRs.
    if idr_count <= n {
        return (index, n);
    }

    let idrs: Vec<usize> = index
        .entries
        .iter()
        .enumerate()
        .filter(|(_, e)| e.kind == SampleKind::VideoIdr)
        .map(|(i, _)| i)
        .collect();

    let payload: u64 = idrs.iter().map(|&i| index.entries[i].byte_size as u64).sum();
    let threshold = (payload as f64 / idr_count as f64 / SIZE_THRESHOLD_DIVISOR) as u32;
    let border = (idr_count as f64 * BORDER_FRACTION).ceil() as usize;

    // First cut: drop the borders, then everything under the size threshold.
    let kept: Vec<usize> = idrs[border..idr_count - border]
        .iter()
        .copied()
        .filter(|&i| index.entries[i].byte_size > threshold)
        .collect();

    debug!(
        "idr filter: {idr_count} IDRs, threshold {threshold} bytes, border {border}, {} kept",
        kept.len()
    );

    if n > kept.len() {
        n = kept.len();
    }

    // Second cut: pick n of the surviving IDRs.
    let chosen: Vec<usize> = match mode {
        ExtractionMode::Ordered => kept[..n].to_vec(),
        ExtractionMode::Distributed => {
            if n == 0 {
                Vec::new()
            } else if n == 1 {
                vec![kept[kept.len() / 2]]
            } else {
                let step = kept.len().div_ceil(n - 1);
                (0..n)
                    .map(|i| kept[(i * step).min(kept.len() - 1)])
                    .collect()
            }
        }
        ExtractionMode::Unfiltered => unreachable!(),
    };

    let mut filtered = SampleIndex::new(StreamKind::Video);
    filtered.whole_access_units = index.whole_access_units;
    for entry in index.entries.iter().filter(|e| e.kind == SampleKind::Config) {
        filtered.push(entry.clone());
    }
    for &i in &chosen {
        filtered.push(index.entries[i].clone());
    }

    (filtered, n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::samples::SampleEntry;

    fn video_index(idr_sizes: &[u32]) -> SampleIndex {
        let mut index = SampleIndex::new(StreamKind::Video);
        index.push(SampleEntry {
            kind: SampleKind::Config,
            byte_offset: 40,
            byte_size: 20,
            pts: 0,
            dts: 0,
            valid: true,
        });
        index.push(SampleEntry {
            kind: SampleKind::Config,
            byte_offset: 60,
            byte_size: 6,
            pts: 0,
            dts: 0,
            valid: true,
        });
        let mut off = 1000u64;
        for (i, &size) in idr_sizes.iter().enumerate() {
            index.push(SampleEntry {
                kind: SampleKind::VideoIdr,
                byte_offset: off,
                byte_size: size,
                pts: i as i64 * 1000,
                dts: i as i64 * 1000,
                valid: true,
            });
            off += size as u64;
        }
        index
    }

    /// 100 uniform IDRs, sizes ramping 40..50 KiB. Borders cut ordinals 0-2
    /// and 97-99, the threshold (~27 KiB) rejects nothing else.
    fn uniform_sizes() -> Vec<u32> {
        (0..100)
            .map(|i| 40 * 1024 + (i * 10 * 1024) / 99)
            .collect()
    }

    fn selected_ordinals(filtered: &SampleIndex) -> Vec<i64> {
        filtered
            .entries
            .iter()
            .filter(|e| e.kind == SampleKind::VideoIdr)
            .map(|e| e.pts / 1000)
            .collect()
    }

    #[test]
    fn distributed_selection_spreads() {
        let index = video_index(&uniform_sizes());
        let (filtered, n) = idr_filter(index, 4, ExtractionMode::Distributed);
        assert_eq!(n, 4);
        assert_eq!(selected_ordinals(&filtered), vec![3, 35, 67, 96]);
        assert_eq!(filtered.config_count, 2);
    }

    #[test]
    fn ordered_selection_takes_prefix() {
        let index = video_index(&uniform_sizes());
        let (filtered, n) = idr_filter(index, 4, ExtractionMode::Ordered);
        assert_eq!(n, 4);
        assert_eq!(selected_ordinals(&filtered), vec![3, 4, 5, 6]);
    }

    #[test]
    fn undersized_idr_is_rejected() {
        let mut sizes = vec![50 * 1024u32; 100];
        sizes[50] = 2 * 1024;
        let index = video_index(&sizes);
        let (filtered, n) = idr_filter(index, 1, ExtractionMode::Distributed);
        assert_eq!(n, 1);
        let picked = selected_ordinals(&filtered);
        assert_eq!(picked.len(), 1);
        assert_ne!(picked[0], 50);
    }

    #[test]
    fn unfiltered_leaves_index_alone() {
        let index = video_index(&uniform_sizes());
        let before = index.clone();
        let (after, n) = idr_filter(index, 4, ExtractionMode::Unfiltered);
        assert_eq!(n, 4);
        assert_eq!(after, before);
    }

    #[test]
    fn zero_requested_pictures() {
        let index = video_index(&uniform_sizes());
        let (_, n) = idr_filter(index, 0, ExtractionMode::Distributed);
        assert_eq!(n, 0);
    }

    #[test]
    fn no_idrs_yields_zero() {
        let index = SampleIndex::new(StreamKind::Video);
        let (_, n) = idr_filter(index, 4, ExtractionMode::Distributed);
        assert_eq!(n, 0);
    }

    #[test]
    fn three_idrs_with_border_one_does_not_underflow() {
        // border = ceil(3 * 0.03) = 1: only the middle IDR survives the cut.
        let index = video_index(&[50_000, 50_000, 50_000]);
        let (filtered, n) = idr_filter(index, 2, ExtractionMode::Distributed);
        assert_eq!(n, 1);
        assert_eq!(selected_ordinals(&filtered), vec![1]);
    }

    #[test]
    fn filter_is_idempotent() {
        let index = video_index(&uniform_sizes());
        let (once, n1) = idr_filter(index, 4, ExtractionMode::Distributed);
        let (twice, n2) = idr_filter(once.clone(), 4, ExtractionMode::Distributed);
        assert_eq!(n1, n2);
        assert_eq!(once, twice);
    }

    #[test]
    fn config_entries_survive_filtering() {
        let index = video_index(&uniform_sizes());
        let configs_before: Vec<_> = index
            .entries
            .iter()
            .filter(|e| e.kind == SampleKind::Config)
            .cloned()
            .collect();
        let (filtered, _) = idr_filter(index, 7, ExtractionMode::Distributed);
        let configs_after: Vec<_> = filtered
            .entries
            .iter()
            .filter(|e| e.kind == SampleKind::Config)
            .cloned()
            .collect();
        assert_eq!(configs_before, configs_after);
        assert!(filtered.sample_count_idr <= 7);
    }
}
