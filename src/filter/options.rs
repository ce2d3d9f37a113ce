//! String-keyed filter parameters

use crate::error::{Error, Result};

/// Requested quality/performance trade-off
///
/// Recorded and validated; every level runs the same network.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Quality {
    /// Backend default
    #[default]
    Default,
    /// Fastest
    Fast,
    /// Balanced
    Balanced,
    /// Highest quality
    High,
}

impl Quality {
    /// Integer value used by the parameter interface
    pub const fn value(self) -> i32 {
        match self {
            Quality::Default => 0,
            Quality::Fast => 4,
            Quality::Balanced => 5,
            Quality::High => 6,
        }
    }

    /// Parse the integer value
    pub fn from_value(value: i32) -> Result<Self> {
        match value {
            0 => Ok(Quality::Default),
            4 => Ok(Quality::Fast),
            5 => Ok(Quality::Balanced),
            6 => Ok(Quality::High),
            other => Err(Error::invalid_argument(
                "quality",
                format!("unsupported quality level {other}"),
            )),
        }
    }
}

/// How the filter decides whether input and output images alias
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum AliasingMode {
    /// Compare the address ranges of the bound images
    #[default]
    Detect,
    /// Treat the output as never overlapping an input
    AssumeDisjoint,
    /// Treat the output as always overlapping an input
    AssumeAliased,
}

/// Whether `execute` waits for the device
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum SyncMode {
    /// Return after all work has completed
    #[default]
    Sync,
    /// Return after submission; the caller waits on the device
    Async,
}

/// Parameters of a U-Net filter
#[derive(Clone, Debug, PartialEq)]
pub struct Options {
    /// Quality level
    pub quality: Quality,
    /// Colour is high dynamic range
    pub hdr: bool,
    /// Colour is sRGB encoded (LDR only)
    pub srgb: bool,
    /// Colour holds signed directional values
    pub directional: bool,
    /// Scale applied to input values; NaN selects automatic
    pub input_scale: f32,
    /// Auxiliary images are noise free
    pub clean_aux: bool,
    /// Memory budget in MiB; negative is unbounded
    pub max_memory_mb: i32,
    /// Cap on the pixels of one tile; zero uses the default
    pub max_tile_pixels: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            quality: Quality::Default,
            hdr: false,
            srgb: false,
            directional: false,
            input_scale: f32::NAN,
            clean_aux: false,
            max_memory_mb: -1,
            max_tile_pixels: 0,
        }
    }
}

fn parse_bool(name: &'static str, value: i32) -> Result<bool> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(Error::invalid_argument(
            name,
            format!("expected 0 or 1, got {other}"),
        )),
    }
}

impl Options {
    /// Set an integer parameter
    ///
    /// Returns `Ok(false)` when the name is not recognized; the value is then
    /// ignored and a warning is logged.
    pub fn set_int(&mut self, name: &str, value: i32) -> Result<bool> {
        match name {
            "quality" => self.quality = Quality::from_value(value)?,
            "hdr" => self.hdr = parse_bool("hdr", value)?,
            "srgb" => self.srgb = parse_bool("srgb", value)?,
            "directional" => self.directional = parse_bool("directional", value)?,
            "cleanAux" => self.clean_aux = parse_bool("cleanAux", value)?,
            "maxMemoryMB" => self.max_memory_mb = value,
            "maxTilePixels" => {
                self.max_tile_pixels = usize::try_from(value).map_err(|_| {
                    Error::invalid_argument("maxTilePixels", "must not be negative")
                })?
            }
            _ => {
                tracing::warn!(parameter = name, value, "Unknown integer parameter ignored");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Get an integer parameter
    pub fn get_int(&self, name: &str) -> Result<i32> {
        Ok(match name {
            "quality" => self.quality.value(),
            "hdr" => self.hdr as i32,
            "srgb" => self.srgb as i32,
            "directional" => self.directional as i32,
            "cleanAux" => self.clean_aux as i32,
            "maxMemoryMB" => self.max_memory_mb,
            "maxTilePixels" => i32::try_from(self.max_tile_pixels).unwrap_or(i32::MAX),
            _ => {
                return Err(Error::invalid_argument(
                    "name",
                    format!("unknown integer parameter '{name}'"),
                ));
            }
        })
    }

    /// Set a float parameter; see [`set_int`](Options::set_int) for unknown names
    pub fn set_float(&mut self, name: &str, value: f32) -> Result<bool> {
        match name {
            "inputScale" | "hdrScale" => self.input_scale = value,
            _ => {
                tracing::warn!(parameter = name, value, "Unknown float parameter ignored");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Get a float parameter
    pub fn get_float(&self, name: &str) -> Result<f32> {
        match name {
            "inputScale" | "hdrScale" => Ok(self.input_scale),
            _ => Err(Error::invalid_argument(
                "name",
                format!("unknown float parameter '{name}'"),
            )),
        }
    }

    /// Scale applied to inputs; automatic resolves to 1
    pub fn effective_input_scale(&self) -> f32 {
        if self.input_scale.is_nan() {
            1.0
        } else {
            self.input_scale
        }
    }

    /// Memory budget in bytes, `None` when unbounded
    pub fn max_memory_bytes(&self) -> Option<usize> {
        usize::try_from(self.max_memory_mb)
            .ok()
            .map(|mb| mb.saturating_mul(1024 * 1024))
    }

    /// Check combinations that cannot be expressed by a single setter
    pub fn validate(&self) -> Result<()> {
        if !self.input_scale.is_nan() && !(self.input_scale.is_finite() && self.input_scale > 0.0)
        {
            return Err(Error::invalid_argument(
                "inputScale",
                format!("must be positive and finite, got {}", self.input_scale),
            ));
        }
        if self.hdr && self.srgb {
            return Err(Error::invalid_argument(
                "srgb",
                "sRGB encoding is only valid for LDR colour",
            ));
        }
        if self.directional && (self.hdr || self.srgb) {
            return Err(Error::invalid_argument(
                "directional",
                "directional colour cannot be HDR or sRGB",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_defaults() {
        let options = Options::default();
        assert_eq!(options.get_int("quality").unwrap(), 0);
        assert_eq!(options.get_int("maxMemoryMB").unwrap(), -1);
        assert!(options.get_float("inputScale").unwrap().is_nan());
        assert_eq!(options.effective_input_scale(), 1.0);
        assert_eq!(options.max_memory_bytes(), None);
    }

    #[test]
    fn test_set_and_get() {
        let mut options = Options::default();
        assert!(options.set_int("hdr", 1).unwrap());
        assert!(options.set_int("quality", 5).unwrap());
        assert!(options.set_int("maxMemoryMB", 64).unwrap());
        assert!(options.set_float("inputScale", 0.5).unwrap());
        assert!(options.hdr);
        assert_eq!(options.quality, Quality::Balanced);
        assert_eq!(options.max_memory_bytes(), Some(64 << 20));
        assert_eq!(options.get_float("hdrScale").unwrap(), 0.5);
    }

    #[test]
    fn test_unknown_names() {
        let mut options = Options::default();
        assert!(!options.set_int("sharpness", 3).unwrap());
        assert!(!options.set_float("gamma", 2.2).unwrap());
        assert_eq!(options.get_int("quality").unwrap(), 0);
        assert!(options.input_scale.is_nan());
        let err = options.get_int("sharpness").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(options.get_float("hdr").is_err());
    }

    #[test]
    fn test_invalid_values() {
        let mut options = Options::default();
        assert!(options.set_int("quality", 3).is_err());
        assert!(options.set_int("hdr", 2).is_err());
        assert!(options.set_int("maxTilePixels", -1).is_err());

        options.set_float("inputScale", -1.0).unwrap();
        assert!(options.validate().is_err());
        options.set_float("inputScale", f32::INFINITY).unwrap();
        assert!(options.validate().is_err());
        options.set_float("inputScale", f32::NAN).unwrap();
        assert!(options.validate().is_ok());

        options.hdr = true;
        options.srgb = true;
        assert!(options.validate().is_err());
        options.srgb = false;
        options.directional = true;
        assert!(options.validate().is_err());
    }
}
