//! Frame buffers exchanged between the capture and analysis stages.

use std::fmt;

/// Colour samples per pixel (packed RGB24).
pub const CHANNELS: usize = 3;

/// A decoded RGB24 frame.
///
/// Ownership moves from capture to analysis with every sampled frame; the
/// analysis stage keeps at most one of them for differencing.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame width in pixels
    pub width: u32,

    /// Frame height in pixels
    pub height: u32,

    /// Tightly packed RGB samples, row-major
    pub data: Vec<u8>,
}

impl Frame {
    /// Wrap a packed RGB24 buffer. Returns `None` if the buffer length does not
    /// match the dimensions.
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        (data.len() == Self::expected_len(width, height)).then_some(Self {
            width,
            height,
            data,
        })
    }

    /// Create a frame filled with a single colour.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let data = rgb
            .iter()
            .copied()
            .cycle()
            .take(Self::expected_len(width, height))
            .collect();
        Self {
            width,
            height,
            data,
        }
    }

    /// Byte length of a packed frame with the given dimensions.
    pub fn expected_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * CHANNELS
    }

    /// Offset of the first sample of pixel (x, y).
    #[inline]
    pub fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * CHANNELS
    }

    /// Set one pixel. Out-of-bounds writes are ignored.
    pub fn put_pixel(&mut self, x: u32, y: u32, rgb: [u8; 3]) {
        if x < self.width && y < self.height {
            let offset = self.offset(x, y);
            self.data[offset..offset + CHANNELS].copy_from_slice(&rgb);
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Stream properties, known once decoding has produced the first frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamMeta {
    pub width: u32,
    pub height: u32,

    /// Frames per second used for sampling, rotation and the stream clock
    pub fps: f64,
}

impl StreamMeta {
    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Per-sample absolute difference of two frames with sensor noise removed.
#[derive(Debug, Clone)]
pub struct DiffImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl DiffImage {
    /// `|current - previous|` per colour sample, zeroing values below `noise_floor`.
    ///
    /// Both frames must have the same dimensions.
    pub fn compute(previous: &Frame, current: &Frame, noise_floor: u8) -> Self {
        debug_assert_eq!(previous.dimensions(), current.dimensions());

        let data = previous
            .data
            .iter()
            .zip(current.data.iter())
            .map(|(a, b)| {
                let d = a.abs_diff(*b);
                if d < noise_floor {
                    0
                } else {
                    d
                }
            })
            .collect();

        Self {
            width: current.width,
            height: current.height,
            data,
        }
    }

    /// Sum of all samples.
    pub fn total(&self) -> u64 {
        self.data.iter().map(|&v| v as u64).sum()
    }

    /// Offset of the first sample of pixel (x, y).
    #[inline]
    pub fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * CHANNELS
    }
}
