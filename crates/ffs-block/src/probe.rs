//! Extent enumeration.
//!
//! [`FiemapProbe`] asks the kernel for the allocation map in one FIEMAP
//! call. When the filesystem or kernel rejects FIEMAP (`EOPNOTSUPP` or
//! `ENOTTY`), [`FallbackProbe`] retries with [`FibmapProbe`], the legacy
//! per-block query, reached through `filefrag -B` and parsed by
//! [`parse_filefrag_output`].
//!
//! Whatever goes wrong, [`FallbackProbe`] reports it as
//! [`FfsError::ExtentQuery`].

use blkmap::Fiemap;
use ffs_error::{FfsError, IoErrorKind, Result};
use ffs_extent::{Extent, ExtentMap};
use ffs_log::Logger;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Source of file extent maps.
pub trait ExtentProbe: Send + Sync {
    fn name(&self) -> &'static str;

    /// Physical extents of `path` in logical order, in bytes.
    fn query(&self, path: &Path) -> Result<ExtentMap>;
}

impl<T: ExtentProbe + ?Sized> ExtentProbe for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn query(&self, path: &Path) -> Result<ExtentMap> {
        (**self).query(path)
    }
}

fn is_unsupported(err: &FfsError) -> bool {
    matches!(
        err,
        FfsError::Io {
            kind: IoErrorKind::Unsupported,
            ..
        }
    )
}

fn query_error(path: &Path, detail: impl fmt::Display) -> FfsError {
    FfsError::ExtentQuery {
        path: path.display().to_string(),
        detail: detail.to_string(),
    }
}

/// Rewrap anything that is not already an extent query failure.
fn as_query_error(path: &Path, err: FfsError) -> FfsError {
    match err {
        FfsError::ExtentQuery { .. } => err,
        other => query_error(path, other),
    }
}

/// Precise probe first, legacy probe when the precise one is unsupported.
pub struct FallbackProbe<P, L> {
    precise: P,
    legacy: L,
    logger: Logger,
}

impl<P: ExtentProbe, L: ExtentProbe> FallbackProbe<P, L> {
    #[must_use]
    pub fn new(precise: P, legacy: L, logger: &Logger) -> Self {
        Self {
            precise,
            legacy,
            logger: logger.child("probe"),
        }
    }
}

impl FallbackProbe<FiemapProbe, FibmapProbe> {
    /// FIEMAP with FIBMAP fallback.
    #[must_use]
    pub fn system(block_size: u64, logger: &Logger) -> Self {
        Self::new(FiemapProbe::new(), FibmapProbe::new(block_size), logger)
    }
}

impl<P: ExtentProbe, L: ExtentProbe> ExtentProbe for FallbackProbe<P, L> {
    fn name(&self) -> &'static str {
        "fallback"
    }

    fn query(&self, path: &Path) -> Result<ExtentMap> {
        match self.precise.query(path) {
            Ok(map) => Ok(map),
            Err(err) if is_unsupported(&err) => {
                self.logger.notice(format!(
                    "{} unsupported for {} ({err}), falling back to {}",
                    self.precise.name(),
                    path.display(),
                    self.legacy.name()
                ));
                self.legacy.query(path).map_err(|err| as_query_error(path, err))
            }
            Err(err) => Err(as_query_error(path, err)),
        }
    }
}

// ── FIEMAP ──────────────────────────────────────────────────────────────────

/// Single-call allocation map query through the FIEMAP ioctl.
#[derive(Debug, Clone, Copy, Default)]
pub struct FiemapProbe;

impl FiemapProbe {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// Unsupported stays an `Io` error so [`FallbackProbe`] can see it; every
/// other failure is an extent query failure.
fn classify_fiemap_error(path: &Path, err: &std::io::Error) -> FfsError {
    let adapted = crate::io_error("extent query", err);
    if is_unsupported(&adapted) {
        adapted
    } else {
        query_error(path, adapted)
    }
}

impl ExtentProbe for FiemapProbe {
    fn name(&self) -> &'static str {
        "fiemap"
    }

    fn query(&self, path: &Path) -> Result<ExtentMap> {
        let file = File::open(path).map_err(|e| query_error(path, e))?;
        // Resolve delayed allocation so every extent has a physical home.
        file.sync_all().map_err(|e| query_error(path, e))?;
        let mut rows = file.fiemap().map_err(|e| classify_fiemap_error(path, &e))?;
        rows.sort_by_key(|row| row.logical);

        let mut extents = Vec::with_capacity(rows.len());
        for row in rows {
            // Physical offset zero is what unlocated and inline extents report.
            if row.physical == 0 {
                return Err(query_error(
                    path,
                    format!(
                        "extent at logical offset {} has no stable location",
                        row.logical
                    ),
                ));
            }
            let extent =
                Extent::device(row.physical, row.length).map_err(|e| query_error(path, e))?;
            extents.push(extent);
        }
        ExtentMap::new(extents).map_err(|e| query_error(path, e))
    }
}

// ── FIBMAP via filefrag ─────────────────────────────────────────────────────

/// Legacy per-block query: runs `filefrag -B -v` and parses its table.
#[derive(Debug, Clone)]
pub struct FibmapProbe {
    program: PathBuf,
    block_size: u64,
}

impl FibmapProbe {
    #[must_use]
    pub fn new(block_size: u64) -> Self {
        Self {
            program: PathBuf::from("filefrag"),
            block_size,
        }
    }

    #[must_use]
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }
}

impl ExtentProbe for FibmapProbe {
    fn name(&self) -> &'static str {
        "fibmap"
    }

    fn query(&self, path: &Path) -> Result<ExtentMap> {
        let output = Command::new(&self.program)
            .env("LC_ALL", "C")
            .arg("-B")
            .arg("-v")
            .arg(format!("-b{}", self.block_size))
            .arg(path)
            .output()
            .map_err(|e| {
                query_error(
                    path,
                    format!("cannot run {}: {e}", self.program.display()),
                )
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(query_error(
                path,
                format!("filefrag exited with {}: {}", output.status, stderr.trim()),
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_filefrag_output(&path.display().to_string(), &stdout, self.block_size)
    }
}

fn parse_range(field: &str) -> Option<(u64, u64)> {
    let (start, end) = field.split_once("..")?;
    Some((start.trim().parse().ok()?, end.trim().parse().ok()?))
}

/// Parse the verbose table printed by `filefrag -v -b<block_size>`.
///
/// Rows look like
/// `   0:        0..       1:      34816..     34817:      2:             last,eof`.
/// Units are `block_size` bytes. Rows flagged `unknown_loc`, `delalloc` or
/// `inline` have no stable physical location and are rejected.
pub fn parse_filefrag_output(path: &str, text: &str, block_size: u64) -> Result<ExtentMap> {
    let query_err = |detail: String| FfsError::ExtentQuery {
        path: path.to_owned(),
        detail,
    };
    let mut rows: Vec<(u64, Extent)> = Vec::new();

    for line in text.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 4 || fields[0].trim().parse::<u64>().is_err() {
            continue;
        }
        let (Some((logical, _)), Some((physical, _))) =
            (parse_range(fields[1]), parse_range(fields[2]))
        else {
            continue;
        };
        let blocks: u64 = fields[3]
            .trim()
            .parse()
            .map_err(|_| query_err(format!("bad length in row {line:?}")))?;
        let flags = fields.last().copied().unwrap_or_default();
        if ["unknown_loc", "delalloc", "inline"]
            .iter()
            .any(|f| flags.contains(f))
        {
            return Err(query_err(format!(
                "extent without a stable location: {}",
                line.trim()
            )));
        }

        let to_bytes = |v: u64| {
            v.checked_mul(block_size)
                .ok_or_else(|| query_err(format!("offset overflows in row {line:?}")))
        };
        let extent = Extent::device(to_bytes(physical)?, to_bytes(blocks)?)
            .map_err(|e| query_err(e.to_string()))?;
        rows.push((to_bytes(logical)?, extent));
    }

    rows.sort_by_key(|&(logical, _)| logical);
    ExtentMap::new(rows.into_iter().map(|(_, e)| e).collect())
        .map_err(|e| query_err(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errno_error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ENOTTY: i32 = 25;
    const EOPNOTSUPP: i32 = 95;

    const FIBMAP_OUTPUT: &str = "\
Filesystem type is: ef53
File size of data.bin is 20480 (5 blocks of 4096 bytes)
 ext:     logical_offset:        physical_offset: length:   expected: flags:
   0:        0..       1:      34816..     34817:      2:
   1:        2..       4:      40000..     40002:      3:      34818: last,eof
data.bin: 2 extents found
";

    #[test]
    fn parses_filefrag_table() {
        let map = parse_filefrag_output("data.bin", FIBMAP_OUTPUT, 4096).unwrap();
        assert_eq!(
            map.as_slice(),
            &[
                Extent::device(34816 * 4096, 2 * 4096).unwrap(),
                Extent::device(40000 * 4096, 3 * 4096).unwrap(),
            ]
        );
        assert_eq!(map.total_length(), 20480);
    }

    #[test]
    fn rows_are_ordered_by_logical_offset() {
        let text = "\
 ext: logical_offset: physical_offset: length: expected: flags:
   0:        4..       4:        900..       900:      1:
   1:        0..       3:        100..       103:      4:
";
        let map = parse_filefrag_output("f", text, 512).unwrap();
        assert_eq!(map.as_slice()[0].offset(), 100 * 512);
        assert_eq!(map.as_slice()[1].offset(), 900 * 512);
    }

    #[test]
    fn rejects_unlocated_extents() {
        let text = "   0:        0..       0:          0..         0:      1:             unknown_loc,delalloc,eof\n";
        let err = parse_filefrag_output("f", text, 4096).unwrap_err();
        assert!(matches!(err, FfsError::ExtentQuery { .. }));
    }

    #[test]
    fn overlapping_rows_are_an_extent_query_error() {
        let text = "\
   0:        0..       3:        100..       103:      4:
   1:        4..       7:        102..       105:      4:
";
        let err = parse_filefrag_output("f", text, 4096).unwrap_err();
        assert!(matches!(err, FfsError::ExtentQuery { ref path, .. } if path == "f"));
    }

    #[test]
    fn empty_file_has_empty_map() {
        let text = "Filesystem type is: ef53\nFile size of e is 0 (0 blocks of 4096 bytes)\ne: 0 extents found\n";
        assert!(parse_filefrag_output("e", text, 4096).unwrap().is_empty());
    }

    #[test]
    fn fiemap_unsupported_is_decided_by_errno() {
        for errno in [EOPNOTSUPP, ENOTTY] {
            let err = std::io::Error::from_raw_os_error(errno);
            let adapted = classify_fiemap_error(Path::new("f"), &err);
            assert!(is_unsupported(&adapted), "errno {errno}: {adapted:?}");
            assert_eq!(adapted.platform_code(), Some(errno));
        }
        let err = std::io::Error::from_raw_os_error(5);
        assert!(matches!(
            classify_fiemap_error(Path::new("f"), &err),
            FfsError::ExtentQuery { .. }
        ));
    }

    #[test]
    fn fiemap_result_is_a_map_or_a_typed_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, vec![7_u8; 8192]).unwrap();
        match FiemapProbe::new().query(&path) {
            Ok(map) => assert!(map.total_length() >= 8192),
            Err(err) => assert!(
                is_unsupported(&err) || matches!(err, FfsError::ExtentQuery { .. }),
                "{err:?}"
            ),
        }
    }

    struct Fixed {
        result: Result<ExtentMap>,
        name: &'static str,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn new(result: Result<ExtentMap>, name: &'static str) -> Self {
            Self {
                result,
                name,
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ExtentProbe for Fixed {
        fn name(&self) -> &'static str {
            self.name
        }

        fn query(&self, _path: &Path) -> Result<ExtentMap> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.result {
                Ok(map) => Ok(map.clone()),
                Err(FfsError::Io { kind, code, .. }) => Err(FfsError::Io {
                    op: "extent query",
                    kind: *kind,
                    code: *code,
                    detail: "canned".into(),
                }),
                Err(other) => Err(FfsError::ExtentQuery {
                    path: "canned".into(),
                    detail: other.to_string(),
                }),
            }
        }
    }

    impl ExtentProbe for &Fixed {
        fn name(&self) -> &'static str {
            (**self).name()
        }

        fn query(&self, path: &Path) -> Result<ExtentMap> {
            (**self).query(path)
        }
    }

    fn legacy_map() -> ExtentMap {
        ExtentMap::new(vec![Extent::device(0, 4096).unwrap()]).unwrap()
    }

    #[test]
    fn unsupported_precise_query_falls_back() {
        let precise = Fixed::new(Err(errno_error("q", EOPNOTSUPP, "no fiemap")), "fiemap");
        let legacy = Fixed::new(Ok(legacy_map()), "fibmap");
        let probe = FallbackProbe::new(&precise, &legacy, &Logger::discard());
        assert_eq!(probe.query(Path::new("x")).unwrap(), legacy_map());
        assert_eq!(legacy.calls(), 1);
    }

    #[test]
    fn other_precise_failures_do_not_fall_back() {
        let precise = Fixed::new(Err(errno_error("q", 5, "media error")), "fiemap");
        let legacy = Fixed::new(Ok(legacy_map()), "fibmap");
        let probe = FallbackProbe::new(&precise, &legacy, &Logger::discard());
        let err = probe.query(Path::new("x")).unwrap_err();
        assert!(matches!(err, FfsError::ExtentQuery { ref path, .. } if path == "x"));
        assert_eq!(legacy.calls(), 0);
    }

    #[test]
    fn both_probes_unsupported_is_an_extent_query_error() {
        let precise = Fixed::new(Err(errno_error("q", EOPNOTSUPP, "no fiemap")), "fiemap");
        let legacy = Fixed::new(Err(errno_error("q", ENOTTY, "no fibmap")), "fibmap");
        let probe = FallbackProbe::new(&precise, &legacy, &Logger::discard());
        let err = probe.query(Path::new("x")).unwrap_err();
        assert!(matches!(err, FfsError::ExtentQuery { .. }), "{err:?}");
        assert_eq!((precise.calls(), legacy.calls()), (1, 1));
    }

    #[test]
    fn precise_success_skips_legacy() {
        let precise = Fixed::new(Ok(legacy_map()), "fiemap");
        let legacy = Fixed::new(Err(errno_error("q", 5, "unused")), "fibmap");
        let probe = FallbackProbe::new(&precise, &legacy, &Logger::discard());
        assert_eq!(probe.query(Path::new("x")).unwrap(), legacy_map());
        assert_eq!(legacy.calls(), 0);
    }

    #[test]
    fn missing_program_is_an_extent_query_error() {
        let probe = FibmapProbe::new(4096).with_program("/definitely/not/filefrag");
        let err = probe.query(Path::new("/etc/hostname")).unwrap_err();
        assert!(matches!(err, FfsError::ExtentQuery { .. }), "{err:?}");
    }
}
