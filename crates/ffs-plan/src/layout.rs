//! JSON layout files.
//!
//! Surrounding tooling decides the target layout; it hands the planner a
//! document like:
//!
//! ```json
//! {
//!   "block_size": 4096,
//!   "source":  [{ "offset": 0,     "length": 8192 }],
//!   "target":  [{ "offset": 16384, "length": 8192 }],
//!   "free":    [{ "offset": 16384, "length": 65536 }],
//!   "scratch": { "offset": 0, "length": 1048576 }
//! }
//! ```
//!
//! `source` and `target` are in logical order. `scratch` offsets address
//! the scratch store, not the device.

use crate::{PlannerConfig, RemapInput};
use ffs_error::{FfsError, Result};
use ffs_extent::{Extent, ExtentMap, ExtentSet};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RangeSpec {
    pub offset: u64,
    pub length: u64,
}

impl From<Extent> for RangeSpec {
    fn from(e: Extent) -> Self {
        Self {
            offset: e.offset(),
            length: e.length(),
        }
    }
}

const fn default_block_size() -> u64 {
    PlannerConfig::DEFAULT_BLOCK_SIZE
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayoutSpec {
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    pub source: Vec<RangeSpec>,
    pub target: Vec<RangeSpec>,
    #[serde(default)]
    pub free: Vec<RangeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scratch: Option<RangeSpec>,
}

impl LayoutSpec {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| FfsError::Format(format!("layout file: {e}")))
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| FfsError::Format(format!("layout file: {e}")))
    }

    #[must_use]
    pub const fn config(&self) -> PlannerConfig {
        PlannerConfig {
            block_size: self.block_size,
        }
    }

    /// Validate ranges and build planner input.
    pub fn to_input(&self) -> Result<RemapInput> {
        let device = |ranges: &[RangeSpec]| -> Result<Vec<Extent>> {
            ranges
                .iter()
                .map(|r| Extent::device(r.offset, r.length))
                .collect()
        };
        Ok(RemapInput {
            source_map: ExtentMap::new(device(&self.source)?)?,
            target_map: ExtentMap::new(device(&self.target)?)?,
            free_extents: ExtentSet::new(device(&self.free)?)?,
            scratch: self
                .scratch
                .map(|r| Extent::scratch(r.offset, r.length))
                .transpose()?,
        })
    }

    #[must_use]
    pub fn from_input(input: &RemapInput, config: PlannerConfig) -> Self {
        Self {
            block_size: config.block_size,
            source: input.source_map.as_slice().iter().copied().map(RangeSpec::from).collect(),
            target: input.target_map.as_slice().iter().copied().map(RangeSpec::from).collect(),
            free: input.free_extents.iter().copied().map(RangeSpec::from).collect(),
            scratch: input.scratch.map(RangeSpec::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_document_with_defaults() {
        let layout = LayoutSpec::from_json(
            r#"{ "source": [{"offset": 0, "length": 4096}],
                 "target": [{"offset": 8192, "length": 4096}] }"#,
        )
        .unwrap();
        assert_eq!(layout.block_size, 4096);
        assert!(layout.free.is_empty());
        assert!(layout.scratch.is_none());
        let input = layout.to_input().unwrap();
        assert_eq!(input.source_map.total_length(), 4096);
        assert!(input.scratch.is_none());
    }

    #[test]
    fn rejects_unknown_fields_and_bad_ranges() {
        let err = LayoutSpec::from_json(r#"{ "source": [], "target": [], "spare": [] }"#).unwrap_err();
        assert!(matches!(err, FfsError::Format(_)));

        let layout = LayoutSpec::from_json(
            r#"{ "source": [{"offset": 0, "length": 0}], "target": [] }"#,
        )
        .unwrap();
        assert!(matches!(layout.to_input(), Err(FfsError::InvalidExtent(_))));
    }

    #[test]
    fn input_conversion_preserves_logical_order() {
        let layout = LayoutSpec {
            block_size: 1,
            source: vec![RangeSpec { offset: 50, length: 5 }, RangeSpec { offset: 0, length: 5 }],
            target: vec![RangeSpec { offset: 0, length: 10 }],
            free: vec![],
            scratch: Some(RangeSpec { offset: 0, length: 5 }),
        };
        let input = layout.to_input().unwrap();
        assert_eq!(input.source_map.as_slice()[0].offset(), 50);
        assert_eq!(LayoutSpec::from_input(&input, layout.config()), layout);
    }
}
