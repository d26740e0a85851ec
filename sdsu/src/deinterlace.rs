/*!
Reordering of multi-port CCD readouts.

When a CCD is read through more than one amplifier the controller interleaves
the ports sample by sample. Each [`DeinterlaceType`] describes one readout
topology as an exact mapping from raw stream position to row-major pixel
position; [`deinterlace`] applies it and [`interlace`] applies its inverse.
*/

use crate::addressing::Amplifier;
use crate::error::{Result, SdsuError};
use crate::protocol::BYTES_PER_PIXEL;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Physical readout topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeinterlaceType {
    /// One amplifier, data already in row-major order
    Single,
    /// Two amplifiers at opposite ends of the parallel direction
    SplitParallel,
    /// Two amplifiers at opposite ends of the serial register
    SplitSerial,
    /// Four amplifiers, one per corner
    SplitQuad,
}

impl DeinterlaceType {
    pub const ALL: [DeinterlaceType; 4] = [
        Self::Single,
        Self::SplitParallel,
        Self::SplitSerial,
        Self::SplitQuad,
    ];

    /// Parse from the numeric value used in setup files
    pub fn from_i32(value: i32) -> Result<Self> {
        match value {
            0 => Ok(Self::Single),
            1 => Ok(Self::SplitParallel),
            2 => Ok(Self::SplitSerial),
            3 => Ok(Self::SplitQuad),
            _ => Err(SdsuError::invalid_argument(
                "deinterlace",
                format!("unknown deinterlace type {}", value),
            )),
        }
    }

    /// Amplifier selection that produces this topology
    pub fn amplifier(self) -> Amplifier {
        match self {
            Self::Single => Amplifier::BottomLeft,
            Self::SplitParallel => Amplifier::BothLeft,
            Self::SplitSerial => Amplifier::BothBottom,
            Self::SplitQuad => Amplifier::All,
        }
    }

    /// Topology selected by an amplifier wire code
    pub fn from_amplifier_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.amplifier().code() == code)
    }

    /// Check the image dimensions satisfy this topology's parity constraints
    pub fn validate_dimensions(self, ncols: usize, nrows: usize) -> Result<()> {
        let (cols_even, rows_even) = match self {
            Self::Single => (false, false),
            Self::SplitParallel => (false, true),
            Self::SplitSerial => (true, false),
            Self::SplitQuad => (true, true),
        };
        if cols_even && ncols % 2 != 0 {
            return Err(SdsuError::invalid_argument(
                "deinterlace",
                format!("{:?} needs an even column count, got {}", self, ncols),
            ));
        }
        if rows_even && nrows % 2 != 0 {
            return Err(SdsuError::invalid_argument(
                "deinterlace",
                format!("{:?} needs an even row count, got {}", self, nrows),
            ));
        }
        Ok(())
    }

    /// Call `f(raw_index, image_index)` for every sample.
    ///
    /// Dimensions must already have passed [`Self::validate_dimensions`].
    fn for_each_mapping(self, ncols: usize, nrows: usize, mut f: impl FnMut(usize, usize)) {
        let n = ncols * nrows;
        match self {
            Self::Single => (0..n).for_each(|i| f(i, i)),
            Self::SplitParallel => {
                for i in 0..n / 2 {
                    f(2 * i, i);
                    f(2 * i + 1, n - 1 - i);
                }
            }
            Self::SplitSerial => {
                for row in 0..nrows {
                    let start = row * ncols;
                    for j in 0..ncols / 2 {
                        f(start + 2 * j, start + j);
                        f(start + 2 * j + 1, start + ncols - 1 - j);
                    }
                }
            }
            Self::SplitQuad => {
                let mut raw = 0;
                for k in 0..nrows / 2 {
                    let front = k * ncols;
                    let back = (nrows - 1 - k) * ncols;
                    for j in 0..ncols / 2 {
                        f(raw, front + j);
                        f(raw + 1, front + ncols - 1 - j);
                        f(raw + 2, back + ncols - 1 - j);
                        f(raw + 3, back + j);
                        raw += 4;
                    }
                }
            }
        }
    }
}

/// A frame of 16-bit pixels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBuffer {
    ncols: usize,
    nrows: usize,
    pixels: Vec<u16>,
}

impl ImageBuffer {
    pub fn new(ncols: usize, nrows: usize, pixels: Vec<u16>) -> Result<Self> {
        if pixels.len() != ncols * nrows {
            return Err(SdsuError::invalid_argument(
                "image_buffer",
                format!("{} pixels for a {}x{} image", pixels.len(), ncols, nrows),
            ));
        }
        Ok(Self { ncols, nrows, pixels })
    }

    /// Decode the controller's little-endian 16-bit byte stream
    pub fn from_le_bytes(ncols: usize, nrows: usize, bytes: &[u8]) -> Result<Self> {
        if bytes.len() != ncols * nrows * BYTES_PER_PIXEL {
            return Err(SdsuError::invalid_argument(
                "image_buffer",
                format!("{} bytes for a {}x{} image", bytes.len(), ncols, nrows),
            ));
        }
        let pixels = bytes
            .chunks_exact(BYTES_PER_PIXEL)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .collect();
        Ok(Self { ncols, nrows, pixels })
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.pixels.iter().flat_map(|p| p.to_le_bytes()).collect()
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn pixels(&self) -> &[u16] {
        &self.pixels
    }

    pub fn into_pixels(self) -> Vec<u16> {
        self.pixels
    }

    /// Pixel at (row, col) in row-major order
    pub fn get(&self, row: usize, col: usize) -> Option<u16> {
        if row >= self.nrows || col >= self.ncols {
            return None;
        }
        self.pixels.get(row * self.ncols + col).copied()
    }
}

/// Result of [`deinterlace`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeinterlaceOutcome {
    /// Pixels are in row-major order
    Transformed(ImageBuffer),
    /// The output buffer could not be allocated; this is the raw interlaced
    /// buffer, returned so the exposure is not lost
    Unchanged(ImageBuffer),
}

impl DeinterlaceOutcome {
    pub fn is_transformed(&self) -> bool {
        matches!(self, Self::Transformed(_))
    }

    pub fn image(&self) -> &ImageBuffer {
        match self {
            Self::Transformed(image) | Self::Unchanged(image) => image,
        }
    }

    pub fn into_image(self) -> ImageBuffer {
        match self {
            Self::Transformed(image) | Self::Unchanged(image) => image,
        }
    }
}

fn try_alloc(len: usize) -> Option<Vec<u16>> {
    let mut out = Vec::new();
    out.try_reserve_exact(len).ok()?;
    out.resize(len, 0);
    Some(out)
}

/// Reorder a raw readout into row-major order
pub fn deinterlace(kind: DeinterlaceType, raw: ImageBuffer) -> Result<DeinterlaceOutcome> {
    deinterlace_with(kind, raw, try_alloc)
}

fn deinterlace_with(
    kind: DeinterlaceType,
    raw: ImageBuffer,
    alloc: impl FnOnce(usize) -> Option<Vec<u16>>,
) -> Result<DeinterlaceOutcome> {
    kind.validate_dimensions(raw.ncols, raw.nrows)?;
    if kind == DeinterlaceType::Single {
        return Ok(DeinterlaceOutcome::Transformed(raw));
    }

    let Some(mut out) = alloc(raw.pixels.len()) else {
        warn!(
            ncols = raw.ncols,
            nrows = raw.nrows,
            "could not allocate deinterlace buffer, keeping interlaced data"
        );
        return Ok(DeinterlaceOutcome::Unchanged(raw));
    };
    kind.for_each_mapping(raw.ncols, raw.nrows, |r, o| out[o] = raw.pixels[r]);
    Ok(DeinterlaceOutcome::Transformed(ImageBuffer {
        ncols: raw.ncols,
        nrows: raw.nrows,
        pixels: out,
    }))
}

/// Produce the stream the controller would send for a row-major image
pub fn interlace(kind: DeinterlaceType, image: &ImageBuffer) -> Result<ImageBuffer> {
    kind.validate_dimensions(image.ncols, image.nrows)?;
    let mut raw = try_alloc(image.pixels.len())
        .ok_or_else(|| SdsuError::resource("could not allocate interlace buffer"))?;
    kind.for_each_mapping(image.ncols, image.nrows, |r, o| raw[r] = image.pixels[o]);
    Ok(ImageBuffer {
        ncols: image.ncols,
        nrows: image.nrows,
        pixels: raw,
    })
}
