use serde::Serialize;

/// What a single index entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SampleKind {
    /// SPS/PPS bytes stored inline in the container (inside `avcC`).
    Config,
    VideoIdr,
    VideoNonIdr,
    Audio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StreamKind {
    Video,
    Audio,
}

/// One coded sample: where it lives in the file and when it plays.
///
/// `pts == dts` for I-frames; both are ticks in the track's timescale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleEntry {
    pub kind: SampleKind,
    pub byte_offset: u64,
    pub byte_size: u32,
    pub pts: i64,
    pub dts: i64,
    /// Cleared by bounds validation when the payload straddles EOF.
    pub valid: bool,
}

/// Ordered per-track table of coded samples, sorted by DTS.
///
/// Configuration entries come first, then media samples. Construction is
/// append-only during demux; afterwards the index is immutable except for
/// wholesale replacement by the IDR filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleIndex {
    pub stream_kind: StreamKind,
    pub entries: Vec<SampleEntry>,
    /// Number of leading `SampleKind::Config` entries.
    pub config_count: usize,
    pub sample_count_idr: usize,
    /// Each entry is a whole access unit; MP4 samples always are.
    pub whole_access_units: bool,
}

impl SampleIndex {
    pub fn new(stream_kind: StreamKind) -> Self {
        Self {
            stream_kind,
            entries: Vec::new(),
            config_count: 0,
            sample_count_idr: 0,
            whole_access_units: true,
        }
    }

    pub fn push(&mut self, entry: SampleEntry) {
        match entry.kind {
            SampleKind::Config => self.config_count += 1,
            SampleKind::VideoIdr => self.sample_count_idr += 1,
            _ => {}
        }
        self.entries.push(entry);
    }

    pub fn sample_count(&self) -> usize {
        self.entries.len()
    }

    /// Iterator over the media (non-config) entries.
    pub fn media_entries(&self) -> impl Iterator<Item = &SampleEntry> {
        self.entries.iter().filter(|e| e.kind != SampleKind::Config)
    }

    /// Mark entries whose payload straddles EOF as invalid.
    ///
    /// Returns how many entries were flagged.
    pub fn validate_bounds(&mut self, file_size: u64) -> usize {
        let mut invalid = 0;
        for entry in &mut self.entries {
            let end = entry.byte_offset.saturating_add(entry.byte_size as u64);
            if entry.byte_size == 0 || end > file_size {
                entry.valid = false;
                invalid += 1;
            }
        }
        invalid
    }

    pub fn invalid_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.valid).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(kind: SampleKind, offset: u64, size: u32) -> SampleEntry {
        SampleEntry {
            kind,
            byte_offset: offset,
            byte_size: size,
            pts: 0,
            dts: 0,
            valid: true,
        }
    }

    #[test]
    fn counts_track_kinds() {
        let mut index = SampleIndex::new(StreamKind::Video);
        index.push(entry(SampleKind::Config, 100, 20));
        index.push(entry(SampleKind::VideoIdr, 200, 5000));
        index.push(entry(SampleKind::VideoNonIdr, 5200, 800));
        index.push(entry(SampleKind::VideoIdr, 6000, 4800));

        assert_eq!(index.sample_count(), 4);
        assert_eq!(index.config_count, 1);
        assert_eq!(index.sample_count_idr, 2);
        assert!(index.sample_count_idr <= index.sample_count());
        assert_eq!(index.media_entries().count(), 3);
    }

    #[test]
    fn bounds_validation_flags_overruns() {
        let mut index = SampleIndex::new(StreamKind::Video);
        index.push(entry(SampleKind::VideoIdr, 0, 100));
        index.push(entry(SampleKind::VideoIdr, 900, 200));
        index.push(entry(SampleKind::VideoIdr, 500, 0));

        assert_eq!(index.validate_bounds(1000), 2);
        assert!(index.entries[0].valid);
        assert!(!index.entries[1].valid);
        assert!(!index.entries[2].valid);
        assert_eq!(index.invalid_count(), 2);
    }
}
