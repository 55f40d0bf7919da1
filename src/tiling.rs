//! Tile-grid arithmetic shared by the outer tilers
//!
//! An axis of the problem is cut into tiles measured in blocks of the array
//! granule; the final tile along an axis may be short, and when the problem
//! size is not a multiple of the granule the final tile also carries padding
//! that the hardware masks off. Tile size times tile count, after padding,
//! always equals the rounded-up problem size.

use std::fmt;

/// Round `x` up to the next multiple of `granule`
pub fn round_up_to(x: usize, granule: usize) -> usize {
    x.div_ceil(granule) * granule
}

/// Tiling of one problem axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisTiling {
    /// Problem extent in elements
    pub len: usize,
    /// Problem extent rounded up to the granule
    pub len_padded: usize,
    /// Tile extent in granule blocks
    pub tile: usize,
    /// Number of tiles along the axis
    pub tiles: usize,
    /// Extent of the final tile in granule blocks
    pub last: usize,
    /// Padding elements the final tile masks off
    pub padding: usize,
    granule: usize,
}

impl AxisTiling {
    pub fn new(len: usize, tile: usize, granule: usize) -> Self {
        let len_padded = round_up_to(len, granule);
        let tile_elems = tile * granule;
        let tiles = len_padded.div_ceil(tile_elems);
        let last = if len_padded % tile_elems == 0 {
            tile
        } else {
            (len_padded / granule) % tile
        };
        Self {
            len,
            len_padded,
            tile,
            tiles,
            last,
            padding: len_padded - len,
            granule,
        }
    }

    /// Tile extent in granule blocks at grid position `idx`
    pub fn extent(&self, idx: usize) -> usize {
        if idx < self.tiles - 1 {
            self.tile
        } else {
            self.last
        }
    }

    /// Padding elements applied at grid position `idx`
    pub fn pad(&self, idx: usize) -> usize {
        if idx == self.tiles - 1 {
            self.padding
        } else {
            0
        }
    }

    /// Element offset of tile `idx` into the problem axis
    pub fn offset(&self, idx: usize) -> usize {
        idx * self.tile * self.granule
    }
}

impl fmt::Display for AxisTiling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} ({} tiles of {} blocks, last {}, padding {})",
            self.len, self.len_padded, self.tiles, self.tile, self.last, self.padding
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up() {
        assert_eq!(round_up_to(45, 16), 48);
        assert_eq!(round_up_to(48, 16), 48);
        assert_eq!(round_up_to(1, 16), 16);
    }

    #[test]
    fn test_exact_axis() {
        let axis = AxisTiling::new(64, 2, 16);
        assert_eq!(axis.len_padded, 64);
        assert_eq!(axis.tiles, 2);
        assert_eq!(axis.last, 2);
        assert_eq!(axis.padding, 0);
        assert_eq!(axis.extent(0), 2);
        assert_eq!(axis.extent(1), 2);
        assert_eq!(axis.pad(1), 0);
    }

    #[test]
    fn test_short_last_tile() {
        let axis = AxisTiling::new(80, 3, 16);
        // 80 elements = 5 blocks: tiles of 3 and 2 blocks
        assert_eq!(axis.tiles, 2);
        assert_eq!(axis.last, 2);
        assert_eq!(axis.padding, 0);
    }

    #[test]
    fn test_boundary_scenario() {
        // The 45x39x67 matmul against a 16-wide array pads to 48x48x80 and
        // with single-block tiles forms a 3x3x5 grid.
        let i = AxisTiling::new(45, 1, 16);
        let j = AxisTiling::new(39, 1, 16);
        let k = AxisTiling::new(67, 1, 16);

        assert_eq!((i.len_padded, j.len_padded, k.len_padded), (48, 48, 80));
        assert_eq!((i.tiles, j.tiles, k.tiles), (3, 3, 5));
        assert_eq!(i.pad(i.tiles - 1), 3);
        assert_eq!(j.pad(j.tiles - 1), 9);
        assert_eq!(k.pad(k.tiles - 1), 13);
        for idx in 0..i.tiles - 1 {
            assert_eq!(i.pad(idx), 0);
        }
    }

    #[test]
    fn test_partition_property() {
        // Every element is covered exactly once when padding is discounted.
        for (len, tile, granule) in [(45, 2, 16), (64, 3, 16), (7, 1, 4), (100, 4, 8)] {
            let axis = AxisTiling::new(len, tile, granule);
            let mut covered = 0;
            for idx in 0..axis.tiles {
                let elems = axis.extent(idx) * granule - axis.pad(idx);
                assert_eq!(axis.offset(idx), covered);
                covered += elems;
            }
            assert_eq!(covered, len);
            assert_eq!(
                axis.tile * granule * (axis.tiles - 1) + axis.last * granule - axis.padding,
                len
            );
        }
    }
}
