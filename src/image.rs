//! Planar YUV 4:2:0 frames and the tile partition/merge used by the tiled
//! pipeline.

use crate::error::ProtocolError;

/// An owned I420 picture: full-resolution luma plane, quarter-resolution
/// chroma planes. Width and height must be even.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImage {
    width: u16,
    height: u16,
    y: Vec<u8>,
    u: Vec<u8>,
    v: Vec<u8>,
}

impl RawImage {
    pub fn new(width: u16, height: u16) -> RawImage {
        assert!(width % 2 == 0 && height % 2 == 0, "I420 needs even dimensions");
        let y_size = usize::from(width) * usize::from(height);
        RawImage {
            width,
            height,
            y: vec![0; y_size],
            u: vec![0; y_size / 4],
            v: vec![0; y_size / 4],
        }
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    pub fn y_size(&self) -> usize {
        usize::from(self.width) * usize::from(self.height)
    }

    pub fn uv_size(&self) -> usize {
        self.y_size() / 4
    }

    pub fn y(&self) -> &[u8] {
        &self.y
    }

    pub fn u(&self) -> &[u8] {
        &self.u
    }

    pub fn v(&self) -> &[u8] {
        &self.v
    }

    pub fn y_mut(&mut self) -> &mut [u8] {
        &mut self.y
    }

    pub fn u_mut(&mut self) -> &mut [u8] {
        &mut self.u
    }

    pub fn v_mut(&mut self) -> &mut [u8] {
        &mut self.v
    }
}

/// How a frame splits into `rows x cols` equally sized tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGeometry {
    pub rows: u16,
    pub cols: u16,
    pub frame_width: u16,
    pub frame_height: u16,
    pub tile_width: u16,
    pub tile_height: u16,
}

impl TileGeometry {
    /// Tile dimensions must divide the frame evenly and stay even themselves
    /// (each tile is an independent I420 picture).
    pub fn new(
        frame_width: u16,
        frame_height: u16,
        rows: u16,
        cols: u16,
    ) -> Result<TileGeometry, ProtocolError> {
        let bad = || ProtocolError::BadGeometry {
            width: frame_width,
            height: frame_height,
            rows,
            cols,
        };

        if rows == 0 || cols == 0 || frame_width % cols != 0 || frame_height % rows != 0 {
            return Err(bad());
        }
        let tile_width = frame_width / cols;
        let tile_height = frame_height / rows;
        if tile_width % 2 != 0 || tile_height % 2 != 0 {
            return Err(bad());
        }

        Ok(TileGeometry {
            rows,
            cols,
            frame_width,
            frame_height,
            tile_width,
            tile_height,
        })
    }

    pub fn tile_count(&self) -> usize {
        usize::from(self.rows) * usize::from(self.cols)
    }

    pub fn tile_index(&self, row: u16, col: u16) -> usize {
        usize::from(row) * usize::from(self.cols) + usize::from(col)
    }
}

fn copy_plane_region(
    dst: &mut [u8],
    dst_stride: usize,
    src: &[u8],
    src_stride: usize,
    src_x: usize,
    src_y: usize,
    width: usize,
    height: usize,
) {
    for row in 0..height {
        let src_off = (src_y + row) * src_stride + src_x;
        let dst_off = row * dst_stride;
        dst[dst_off..dst_off + width].copy_from_slice(&src[src_off..src_off + width]);
    }
}

fn paste_plane_region(
    dst: &mut [u8],
    dst_stride: usize,
    dst_x: usize,
    dst_y: usize,
    src: &[u8],
    src_stride: usize,
    width: usize,
    height: usize,
) {
    for row in 0..height {
        let src_off = row * src_stride;
        let dst_off = (dst_y + row) * dst_stride + dst_x;
        dst[dst_off..dst_off + width].copy_from_slice(&src[src_off..src_off + width]);
    }
}

/// Copies tile `(row, col)` of `frame` into a fresh tile-sized image.
pub fn crop_tile(frame: &RawImage, geo: &TileGeometry, row: u16, col: u16) -> RawImage {
    debug_assert_eq!(frame.width(), geo.frame_width);
    debug_assert_eq!(frame.height(), geo.frame_height);

    let mut tile = RawImage::new(geo.tile_width, geo.tile_height);
    let (tw, th) = (usize::from(geo.tile_width), usize::from(geo.tile_height));
    let (fx, fy) = (usize::from(col) * tw, usize::from(row) * th);
    let fw = usize::from(geo.frame_width);

    copy_plane_region(tile.y_mut(), tw, frame.y(), fw, fx, fy, tw, th);
    copy_plane_region(tile.u_mut(), tw / 2, frame.u(), fw / 2, fx / 2, fy / 2, tw / 2, th / 2);
    copy_plane_region(tile.v_mut(), tw / 2, frame.v(), fw / 2, fx / 2, fy / 2, tw / 2, th / 2);
    tile
}

/// Pastes a tile back at `(row, col)`, the inverse of [`crop_tile`].
pub fn merge_tile(frame: &mut RawImage, tile: &RawImage, geo: &TileGeometry, row: u16, col: u16) {
    debug_assert_eq!(tile.width(), geo.tile_width);
    debug_assert_eq!(tile.height(), geo.tile_height);

    let (tw, th) = (usize::from(geo.tile_width), usize::from(geo.tile_height));
    let (fx, fy) = (usize::from(col) * tw, usize::from(row) * th);
    let fw = usize::from(geo.frame_width);

    paste_plane_region(frame.y_mut(), fw, fx, fy, tile.y(), tw, tw, th);
    paste_plane_region(frame.u_mut(), fw / 2, fx / 2, fy / 2, tile.u(), tw / 2, tw / 2, th / 2);
    paste_plane_region(frame.v_mut(), fw / 2, fx / 2, fy / 2, tile.v(), tw / 2, tw / 2, th / 2);
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rstest::rstest;

    /// Fills each plane with a position-dependent pattern so misplaced
    /// copies show up.
    fn patterned(width: u16, height: u16) -> RawImage {
        let mut img = RawImage::new(width, height);
        for (i, b) in img.y_mut().iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        for (i, b) in img.u_mut().iter_mut().enumerate() {
            *b = (i % 241) as u8;
        }
        for (i, b) in img.v_mut().iter_mut().enumerate() {
            *b = (i % 239) as u8;
        }
        img
    }

    #[rstest]
    #[case::square_4x4(64, 64, 4, 4)]
    #[case::rect_2x3(48, 32, 2, 3)]
    #[case::single(16, 16, 1, 1)]
    fn partition_then_merge_is_identity(
        #[case] width: u16,
        #[case] height: u16,
        #[case] rows: u16,
        #[case] cols: u16,
    ) {
        let geo = TileGeometry::new(width, height, rows, cols).unwrap();
        let original = patterned(width, height);

        let mut rebuilt = RawImage::new(width, height);
        for row in 0..rows {
            for col in 0..cols {
                let tile = crop_tile(&original, &geo, row, col);
                merge_tile(&mut rebuilt, &tile, &geo, row, col);
            }
        }
        assert_eq!(rebuilt, original);
    }

    #[rstest]
    #[case::uneven_cols(100, 64, 2, 3)]
    #[case::uneven_rows(64, 100, 3, 2)]
    #[case::odd_tile_width(36, 36, 2, 12)]
    #[case::zero_rows(64, 64, 0, 4)]
    fn bad_geometry_is_rejected(
        #[case] width: u16,
        #[case] height: u16,
        #[case] rows: u16,
        #[case] cols: u16,
    ) {
        assert_matches!(
            TileGeometry::new(width, height, rows, cols),
            Err(ProtocolError::BadGeometry { .. })
        );
    }

    #[test]
    fn geometry_dimensions() {
        let geo = TileGeometry::new(1280, 720, 4, 4).unwrap();
        assert_eq!(geo.tile_width, 320);
        assert_eq!(geo.tile_height, 180);
        assert_eq!(geo.tile_count(), 16);
        assert_eq!(geo.tile_index(0, 0), 0);
        assert_eq!(geo.tile_index(1, 0), 4);
        assert_eq!(geo.tile_index(3, 3), 15);
    }

    #[test]
    fn plane_sizes_are_i420() {
        let img = RawImage::new(640, 480);
        assert_eq!(img.y().len(), 640 * 480);
        assert_eq!(img.u().len(), 640 * 480 / 4);
        assert_eq!(img.v().len(), 640 * 480 / 4);
    }
}
