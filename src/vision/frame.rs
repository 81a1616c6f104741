use crate::{Error, Result};

/// A single decoded video frame: an owned, interleaved RGB8 buffer.
///
/// Frames are transient. One frame is alive per detection loop iteration; only
/// the first frame of a session is retained longer, for identity resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

/// One square region of a frame.
///
/// Tiles are addressed row-major within a cropped frame:
/// `index = row * (width / size) + col`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tile {
    size: u32,
    data: Vec<u8>,
}

/// Ratios selecting the rectangular sub-region of a frame that contains the
/// tile grid.
///
/// The defaults are the production values for a 1280x720 stream, which select a
/// 580x580 region on the left side of the frame.
#[derive(Clone, Copy, Debug)]
pub struct CropRegion {
    pub x_ratio: f64,
    pub x_offset_ratio: f64,
    pub y_ratio: f64,
    pub y_offset_ratio: f64,
}

impl Default for CropRegion {
    fn default() -> Self {
        Self {
            x_ratio: 0.453125,
            x_offset_ratio: 0.0,
            y_ratio: 0.9027777777777778,
            y_offset_ratio: 0.09722222222222222,
        }
    }
}

impl CropRegion {
    /// A no-op crop covering the entire frame.
    pub fn full() -> Self {
        Self {
            x_ratio: 1.0,
            x_offset_ratio: 0.0,
            y_ratio: 1.0,
            y_offset_ratio: 0.0,
        }
    }

    // Pixel bounds for a frame of the given real dimensions. Ratios are
    // truncated to whole pixels, matching the integer-cast slice semantics the
    // calibrated crop constants were derived with.
    fn bounds(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let x0 = ((self.x_offset_ratio * width as f64) as u32).min(width);
        let x1 = ((self.x_ratio * width as f64) as u32).clamp(x0, width);
        let y0 = ((self.y_offset_ratio * height as f64) as u32).min(height);
        let y1 = ((self.y_ratio * height as f64) as u32).clamp(y0, height);
        (x0, x1, y0, y1)
    }
}

impl Frame {
    /// Constructs a frame from an interleaved RGB8 buffer. Returns [None] if
    /// the buffer length does not match the dimensions.
    pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        if data.len() != (width as usize) * (height as usize) * 3 {
            return None;
        }
        Some(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns the sub-frame selected by `region`, using this frame's real
    /// dimensions.
    pub fn crop(&self, region: &CropRegion) -> Frame {
        let (x0, x1, y0, y1) = region.bounds(self.width, self.height);
        let (width, height) = (x1 - x0, y1 - y0);
        let mut data = Vec::with_capacity((width as usize) * (height as usize) * 3);
        for y in y0..y1 {
            let start = ((y * self.width + x0) * 3) as usize;
            let end = ((y * self.width + x1) * 3) as usize;
            data.extend_from_slice(&self.data[start..end]);
        }
        Frame {
            width,
            height,
            data,
        }
    }

    /// Partitions the frame into a row-major grid of `square_size` tiles.
    ///
    /// Both dimensions must be divisible by `square_size`; the tile at index
    /// `row * cols + col` holds the pixels of that grid cell, so the operation
    /// is exactly invertible via [Frame::reassemble].
    pub fn segment(&self, square_size: u32) -> Result<Vec<Tile>> {
        if square_size == 0 || self.width % square_size != 0 || self.height % square_size != 0 {
            return Err(Error::TileGeometry {
                width: self.width,
                height: self.height,
                square_size,
            });
        }
        let rows = self.height / square_size;
        let cols = self.width / square_size;
        let mut tiles = Vec::with_capacity((rows * cols) as usize);
        for row in 0..rows {
            for col in 0..cols {
                let mut data = Vec::with_capacity((square_size * square_size * 3) as usize);
                for y in 0..square_size {
                    let fy = row * square_size + y;
                    let start = ((fy * self.width + col * square_size) * 3) as usize;
                    data.extend_from_slice(&self.data[start..start + (square_size * 3) as usize]);
                }
                tiles.push(Tile {
                    size: square_size,
                    data,
                });
            }
        }
        Ok(tiles)
    }

    /// Rebuilds a frame from a row-major tile grid. Exact inverse of
    /// [Frame::segment] for the same dimensions.
    pub fn reassemble(tiles: &[Tile], square_size: u32, width: u32, height: u32) -> Result<Frame> {
        if square_size == 0
            || width % square_size != 0
            || height % square_size != 0
            || tiles.len() != ((width / square_size) * (height / square_size)) as usize
            || tiles.iter().any(|t| t.size != square_size)
        {
            return Err(Error::TileGeometry {
                width,
                height,
                square_size,
            });
        }
        let cols = width / square_size;
        let mut data = vec![0u8; (width as usize) * (height as usize) * 3];
        for (idx, tile) in tiles.iter().enumerate() {
            let row = idx as u32 / cols;
            let col = idx as u32 % cols;
            for y in 0..square_size {
                let fy = row * square_size + y;
                let dst = ((fy * width + col * square_size) * 3) as usize;
                let src = (y * square_size * 3) as usize;
                data[dst..dst + (square_size * 3) as usize]
                    .copy_from_slice(&tile.data[src..src + (square_size * 3) as usize]);
            }
        }
        Ok(Frame {
            width,
            height,
            data,
        })
    }

    /// Extracts the single tile whose top-left corner is at `(x, y)`.
    pub fn tile_at(&self, x: u32, y: u32, square_size: u32) -> Result<Tile> {
        if square_size == 0
            || x.checked_add(square_size).map_or(true, |x1| x1 > self.width)
            || y.checked_add(square_size)
                .map_or(true, |y1| y1 > self.height)
        {
            return Err(Error::TileGeometry {
                width: self.width,
                height: self.height,
                square_size,
            });
        }
        let mut data = Vec::with_capacity((square_size * square_size * 3) as usize);
        for row in y..y + square_size {
            let start = ((row * self.width + x) * 3) as usize;
            data.extend_from_slice(&self.data[start..start + (square_size * 3) as usize]);
        }
        Ok(Tile {
            size: square_size,
            data,
        })
    }
}

impl Tile {
    /// Constructs a tile from an interleaved RGB8 buffer. Returns [None] if
    /// the buffer length does not match a `size` x `size` x 3 tile.
    pub fn from_raw(size: u32, data: Vec<u8>) -> Option<Self> {
        if data.len() != (size as usize) * (size as usize) * 3 {
            return None;
        }
        Some(Self { size, data })
    }

    /// Converts a decoded image into a tile. Returns [None] if the image is
    /// not square.
    pub fn from_rgb_image(img: &image::RgbImage) -> Option<Self> {
        if img.width() != img.height() {
            return None;
        }
        Self::from_raw(img.width(), img.as_raw().clone())
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vision::testutil::gradient_frame;

    #[test]
    fn test_default_crop_matches_production_dimensions() {
        let frame = gradient_frame(1280, 720);
        let cropped = frame.crop(&CropRegion::default());
        assert_eq!(cropped.width(), 580);
        assert_eq!(cropped.height(), 580);
    }

    #[test]
    fn test_crop_full_is_identity() {
        let frame = gradient_frame(64, 48);
        assert_eq!(frame.crop(&CropRegion::full()), frame);
    }

    #[test]
    fn test_segment_reassemble_round_trip() {
        let frame = gradient_frame(60, 40);
        let tiles = frame.segment(20).unwrap();
        assert_eq!(tiles.len(), 6);
        let rebuilt = Frame::reassemble(&tiles, 20, 60, 40).unwrap();
        assert_eq!(rebuilt, frame);
    }

    #[test]
    fn test_segment_round_trips_after_crop() {
        let frame = gradient_frame(1280, 720);
        let cropped = frame.crop(&CropRegion::default());
        let tiles = cropped.segment(20).unwrap();
        let rebuilt = Frame::reassemble(&tiles, 20, cropped.width(), cropped.height()).unwrap();
        assert_eq!(rebuilt, cropped);
    }

    #[test]
    fn test_segment_is_row_major() {
        let frame = gradient_frame(40, 40);
        let tiles = frame.segment(20).unwrap();
        // Tile 1 is the top-right cell: its first pixel is frame pixel (20, 0).
        let expected = frame.tile_at(20, 0, 20).unwrap();
        assert_eq!(tiles[1], expected);
        // Tile 2 is the bottom-left cell.
        let expected = frame.tile_at(0, 20, 20).unwrap();
        assert_eq!(tiles[2], expected);
    }

    #[test]
    fn test_segment_rejects_indivisible_dimensions() {
        let frame = gradient_frame(50, 40);
        assert!(matches!(
            frame.segment(20),
            Err(crate::Error::TileGeometry { .. })
        ));
    }

    #[test]
    fn test_tile_at_out_of_bounds() {
        let frame = gradient_frame(40, 40);
        assert!(frame.tile_at(30, 0, 20).is_err());
        assert!(frame.tile_at(0, 0, 20).is_ok());
    }

    #[test]
    fn test_from_raw_length_mismatch() {
        assert!(Frame::from_raw(10, 10, vec![0u8; 10]).is_none());
        assert!(Tile::from_raw(10, vec![0u8; 10]).is_none());
    }
}
