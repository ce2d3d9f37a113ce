//! Images: strided pixel views of a buffer
//!
//! An [`Image`] describes `width x height` pixels of a [`Format`] stored in a
//! [`Buffer`] at a byte offset, with independent pixel and row strides. Pixel
//! access goes through the buffer's read/write path, so images work on any
//! storage class.

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::runtime::Device;
use crate::tensor::Buffer;

/// Pixel format of an image
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Format {
    /// One f32 channel
    Float,
    /// Two f32 channels
    Float2,
    /// Three f32 channels
    Float3,
    /// Four f32 channels
    Float4,
    /// One f16 channel
    Half,
    /// Two f16 channels
    Half2,
    /// Three f16 channels
    Half3,
    /// Four f16 channels
    Half4,
}

impl Format {
    /// Number of channels per pixel
    pub const fn num_channels(self) -> usize {
        match self {
            Format::Float | Format::Half => 1,
            Format::Float2 | Format::Half2 => 2,
            Format::Float3 | Format::Half3 => 3,
            Format::Float4 | Format::Half4 => 4,
        }
    }

    /// Channel element type
    pub const fn dtype(self) -> DType {
        match self {
            Format::Float | Format::Float2 | Format::Float3 | Format::Float4 => DType::F32,
            Format::Half | Format::Half2 | Format::Half3 | Format::Half4 => DType::F16,
        }
    }

    /// Size of one packed pixel in bytes
    pub const fn byte_size(self) -> usize {
        self.num_channels() * self.dtype().size_in_bytes()
    }
}

/// Strided 2D pixel view of a buffer
#[derive(Clone, Debug)]
pub struct Image {
    buffer: Buffer,
    format: Format,
    width: usize,
    height: usize,
    byte_offset: usize,
    pixel_byte_stride: usize,
    row_byte_stride: usize,
}

impl Image {
    /// Describe pixels stored in `buffer`
    ///
    /// A stride of 0 means packed: `format.byte_size()` for pixels and
    /// `width * pixel_byte_stride` for rows. Zero-sized images are accepted
    /// here and rejected by the filter at commit.
    pub fn new(
        buffer: Buffer,
        format: Format,
        width: usize,
        height: usize,
        byte_offset: usize,
        pixel_byte_stride: usize,
        row_byte_stride: usize,
    ) -> Result<Self> {
        let pixel_byte_stride = if pixel_byte_stride == 0 {
            format.byte_size()
        } else {
            pixel_byte_stride
        };
        if pixel_byte_stride < format.byte_size() {
            return Err(Error::invalid_argument(
                "pixel_byte_stride",
                format!(
                    "stride {pixel_byte_stride} is smaller than the {format:?} pixel size {}",
                    format.byte_size()
                ),
            ));
        }
        let row_byte_stride = if row_byte_stride == 0 {
            width * pixel_byte_stride
        } else {
            row_byte_stride
        };
        if row_byte_stride < width * pixel_byte_stride {
            return Err(Error::invalid_argument(
                "row_byte_stride",
                format!(
                    "stride {row_byte_stride} is smaller than a row of {width} pixels"
                ),
            ));
        }

        let image = Self {
            buffer,
            format,
            width,
            height,
            byte_offset,
            pixel_byte_stride,
            row_byte_stride,
        };
        let end = image.byte_offset + image.byte_span();
        if end > image.buffer.byte_size() {
            return Err(Error::invalid_argument(
                "byte_offset",
                format!(
                    "image needs {end} bytes, buffer has {}",
                    image.buffer.byte_size()
                ),
            ));
        }
        Ok(image)
    }

    /// Allocate a packed image on `device`
    pub fn alloc(device: &dyn Device, format: Format, width: usize, height: usize) -> Result<Self> {
        let byte_size = width * height * format.byte_size();
        let buffer = device.new_buffer(byte_size)?;
        Self::new(buffer, format, width, height, 0, 0, 0)
    }

    /// Underlying buffer
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// Pixel format
    pub fn format(&self) -> Format {
        self.format
    }

    /// Width in pixels
    pub fn width(&self) -> usize {
        self.width
    }

    /// Height in pixels
    pub fn height(&self) -> usize {
        self.height
    }

    /// Byte offset of the first pixel
    pub fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    /// Bytes between horizontally adjacent pixels
    pub fn pixel_byte_stride(&self) -> usize {
        self.pixel_byte_stride
    }

    /// Bytes between vertically adjacent pixels
    pub fn row_byte_stride(&self) -> usize {
        self.row_byte_stride
    }

    /// Whether the image has no pixels
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Number of bytes from the first pixel to the end of the last one
    pub fn byte_span(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        (self.height - 1) * self.row_byte_stride
            + (self.width - 1) * self.pixel_byte_stride
            + self.format.byte_size()
    }

    /// Whether two images share any byte of memory
    ///
    /// Pointer-addressed memory is compared by absolute address range, so two
    /// shared buffers wrapping the same caller allocation are detected. Handle
    /// storage only overlaps within the same allocation.
    pub fn overlaps(&self, other: &Image) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        let span = |image: &Image, base: u64| {
            let start = base + image.byte_offset as u64;
            start..start + image.byte_span() as u64
        };
        match (self.buffer.address_range(), other.buffer.address_range()) {
            (Some(a), Some(b)) => {
                let a = span(self, a.start);
                let b = span(other, b.start);
                a.start < b.end && b.start < a.end
            }
            _ => {
                if !self.buffer.same_allocation(&other.buffer) {
                    return false;
                }
                let a = span(self, 0);
                let b = span(other, 0);
                a.start < b.end && b.start < a.end
            }
        }
    }

    /// Whether two images have the same dimensions
    pub fn same_size(&self, other: &Image) -> bool {
        self.width == other.width && self.height == other.height
    }

    fn check_region(&self, x: usize, y: usize, w: usize, h: usize) -> Result<()> {
        if x + w > self.width || y + h > self.height {
            return Err(Error::invalid_argument(
                "region",
                format!(
                    "region {w}x{h} at ({x}, {y}) exceeds image {}x{}",
                    self.width, self.height
                ),
            ));
        }
        Ok(())
    }

    /// Byte offset and length covering rows `y..y+h` of columns `x..x+w`
    fn region_span(&self, x: usize, y: usize, w: usize, h: usize) -> (usize, usize) {
        let start = self.byte_offset + y * self.row_byte_stride + x * self.pixel_byte_stride;
        let len = (h - 1) * self.row_byte_stride
            + (w - 1) * self.pixel_byte_stride
            + self.format.byte_size();
        (start, len)
    }

    /// Read a region as interleaved f32 channels, row-major
    pub fn read_pixels(&self, x: usize, y: usize, w: usize, h: usize) -> Result<Vec<f32>> {
        self.check_region(x, y, w, h)?;
        let channels = self.format.num_channels();
        let mut out = Vec::with_capacity(w * h * channels);
        if w == 0 || h == 0 {
            return Ok(out);
        }

        let (start, len) = self.region_span(x, y, w, h);
        let mut bytes = vec![0u8; len];
        self.buffer.read(start, &mut bytes)?;

        let dtype = self.format.dtype();
        let elem = dtype.size_in_bytes();
        for row in 0..h {
            for col in 0..w {
                let p = row * self.row_byte_stride + col * self.pixel_byte_stride;
                for c in 0..channels {
                    out.push(dtype.decode(&bytes[p + c * elem..]));
                }
            }
        }
        Ok(out)
    }

    /// Write the first `channels` channels of a region from interleaved f32 data
    ///
    /// Channels past `channels` and bytes between strided pixels keep their
    /// previous contents.
    pub fn write_pixels(
        &self,
        x: usize,
        y: usize,
        w: usize,
        h: usize,
        channels: usize,
        data: &[f32],
    ) -> Result<()> {
        self.check_region(x, y, w, h)?;
        if channels == 0 || channels > self.format.num_channels() {
            return Err(Error::invalid_argument(
                "channels",
                format!(
                    "{channels} channels requested, {:?} has {}",
                    self.format,
                    self.format.num_channels()
                ),
            ));
        }
        if data.len() != w * h * channels {
            return Err(Error::invalid_argument(
                "data",
                format!("expected {} values, got {}", w * h * channels, data.len()),
            ));
        }
        if w == 0 || h == 0 {
            return Ok(());
        }

        let (start, len) = self.region_span(x, y, w, h);
        let packed = self.pixel_byte_stride == self.format.byte_size()
            && channels == self.format.num_channels()
            && (h == 1 || self.row_byte_stride == w * self.pixel_byte_stride);
        let mut bytes = vec![0u8; len];
        if !packed {
            self.buffer.read(start, &mut bytes)?;
        }

        let dtype = self.format.dtype();
        let elem = dtype.size_in_bytes();
        let mut values = data.iter();
        for row in 0..h {
            for col in 0..w {
                let p = row * self.row_byte_stride + col * self.pixel_byte_stride;
                for c in 0..channels {
                    let v = values.next().copied().unwrap_or_default();
                    dtype.encode(v, &mut bytes[p + c * elem..]);
                }
            }
        }
        self.buffer.write(start, &bytes)
    }

    /// Copy all pixels of `src` into this image, `rows_per_chunk` rows at a time
    pub fn copy_from(&self, src: &Image, rows_per_chunk: usize) -> Result<()> {
        self.copy_channels_from(src, usize::MAX, rows_per_chunk)
    }

    /// Copy at most the first `max_channels` channels of every pixel of `src`
    ///
    /// Remaining channels of this image keep their contents.
    pub fn copy_channels_from(
        &self,
        src: &Image,
        max_channels: usize,
        rows_per_chunk: usize,
    ) -> Result<()> {
        if !self.same_size(src) {
            return Err(Error::invalid_argument(
                "src",
                format!(
                    "source is {}x{}, destination is {}x{}",
                    src.width, src.height, self.width, self.height
                ),
            ));
        }
        let channels = self
            .format
            .num_channels()
            .min(src.format.num_channels())
            .min(max_channels);
        let rows_per_chunk = rows_per_chunk.max(1);
        let mut y = 0;
        while y < self.height {
            let h = rows_per_chunk.min(self.height - y);
            let pixels = src.read_pixels(0, y, self.width, h)?;
            let src_channels = src.format.num_channels();
            let data: Vec<f32> = if src_channels == channels {
                pixels
            } else {
                pixels
                    .chunks_exact(src_channels)
                    .flat_map(|p| p[..channels].iter().copied())
                    .collect()
            };
            self.write_pixels(0, y, self.width, h, channels, &data)?;
            y += h;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(feature = "cpu")]
    fn test_copy_channels_keeps_remaining_channels() {
        let device = crate::runtime::cpu::CpuDevice::create(Default::default()).unwrap();
        let dst = Image::alloc(device.as_ref(), Format::Float4, 2, 1).unwrap();
        dst.write_pixels(0, 0, 2, 1, 4, &[0.0, 0.0, 0.0, 0.5, 0.0, 0.0, 0.0, 0.5])
            .unwrap();
        let src = Image::alloc(device.as_ref(), Format::Half4, 2, 1).unwrap();
        src.write_pixels(0, 0, 2, 1, 4, &[1.0, 2.0, 3.0, 0.0, 4.0, 5.0, 6.0, 0.0])
            .unwrap();

        dst.copy_channels_from(&src, 3, 1).unwrap();
        assert_eq!(
            dst.read_pixels(0, 0, 2, 1).unwrap(),
            vec![1.0, 2.0, 3.0, 0.5, 4.0, 5.0, 6.0, 0.5]
        );
    }

    #[test]
    fn test_format_sizes() {
        assert_eq!(Format::Float3.byte_size(), 12);
        assert_eq!(Format::Half4.byte_size(), 8);
        assert_eq!(Format::Half.num_channels(), 1);
        assert_eq!(Format::Float2.dtype(), DType::F32);
    }
}
