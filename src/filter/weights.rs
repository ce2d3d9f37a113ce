//! Network weights supplied by the caller
//!
//! Weights arrive as named host tensors: `<layer>.weight` with dims
//! `[O, I, KH, KW]` and `<layer>.bias` with dims `[O]`. Sets are registered
//! per [`WeightsKey`] before commit; the filter picks the set matching its
//! options. Decoding weight files is left to the caller.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Dense f32 tensor in host memory, row-major in its dims
#[derive(Clone, Debug, PartialEq)]
pub struct HostTensor {
    dims: Vec<usize>,
    data: Vec<f32>,
}

impl HostTensor {
    /// Create a tensor; `data.len()` must equal the product of `dims`
    pub fn new(dims: &[usize], data: Vec<f32>) -> Result<Self> {
        let n: usize = dims.iter().product();
        if dims.is_empty() || n != data.len() {
            return Err(Error::invalid_argument(
                "data",
                format!("dims {dims:?} need {n} values, got {}", data.len()),
            ));
        }
        Ok(Self {
            dims: dims.to_vec(),
            data,
        })
    }

    /// Dimensions
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Values in row-major order
    pub fn data(&self) -> &[f32] {
        &self.data
    }
}

/// Named weight tensors of one network
#[derive(Clone, Debug, Default)]
pub struct Weights {
    tensors: HashMap<String, HostTensor>,
}

impl Weights {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a tensor
    pub fn insert(&mut self, name: impl Into<String>, tensor: HostTensor) {
        self.tensors.insert(name.into(), tensor);
    }

    /// Add weight and bias of a convolution layer
    pub fn insert_layer(&mut self, layer: &str, weight: HostTensor, bias: HostTensor) {
        self.insert(format!("{layer}.weight"), weight);
        self.insert(format!("{layer}.bias"), bias);
    }

    /// Look up a tensor by name
    pub fn get(&self, name: &str) -> Option<&HostTensor> {
        self.tensors.get(name)
    }

    /// Number of tensors
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Weight and bias of a convolution layer, validated against each other
    pub fn layer(&self, layer: &str) -> Result<(&HostTensor, &HostTensor)> {
        let fetch = |suffix: &str| {
            let name = format!("{layer}.{suffix}");
            self.get(&name).ok_or_else(|| {
                Error::invalid_argument("weights", format!("missing tensor '{name}'"))
            })
        };
        let weight = fetch("weight")?;
        let bias = fetch("bias")?;
        if weight.dims().len() != 4 {
            return Err(Error::invalid_argument(
                "weights",
                format!("'{layer}.weight' must be rank 4, got {:?}", weight.dims()),
            ));
        }
        if bias.dims() != [weight.dims()[0]] {
            return Err(Error::invalid_argument(
                "weights",
                format!(
                    "'{layer}.bias' must be [{}], got {:?}",
                    weight.dims()[0],
                    bias.dims()
                ),
            ));
        }
        Ok((weight, bias))
    }

    /// Total bytes of the raw f32 values
    pub fn byte_size(&self) -> usize {
        self.tensors
            .values()
            .map(|t| t.data.len() * std::mem::size_of::<f32>())
            .sum()
    }
}

/// Capability combination a weight set was trained for
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum WeightsKey {
    /// HDR colour
    Hdr,
    /// HDR colour with albedo
    HdrAlb,
    /// HDR colour with albedo and normal
    HdrAlbNrm,
    /// HDR colour with noise-free albedo and normal
    HdrCalbCnrm,
    /// LDR colour
    Ldr,
    /// LDR colour with albedo
    LdrAlb,
    /// LDR colour with albedo and normal
    LdrAlbNrm,
    /// LDR colour with noise-free albedo and normal
    LdrCalbCnrm,
    /// Directional (signed) values
    Dir,
    /// Albedo on its own
    Alb,
    /// Normals on their own
    Nrm,
}

impl WeightsKey {
    /// All keys
    pub const ALL: [WeightsKey; 11] = [
        WeightsKey::Hdr,
        WeightsKey::HdrAlb,
        WeightsKey::HdrAlbNrm,
        WeightsKey::HdrCalbCnrm,
        WeightsKey::Ldr,
        WeightsKey::LdrAlb,
        WeightsKey::LdrAlbNrm,
        WeightsKey::LdrCalbCnrm,
        WeightsKey::Dir,
        WeightsKey::Alb,
        WeightsKey::Nrm,
    ];

    /// Canonical name, e.g. `hdr_alb_nrm`
    pub const fn name(self) -> &'static str {
        match self {
            WeightsKey::Hdr => "hdr",
            WeightsKey::HdrAlb => "hdr_alb",
            WeightsKey::HdrAlbNrm => "hdr_alb_nrm",
            WeightsKey::HdrCalbCnrm => "hdr_calb_cnrm",
            WeightsKey::Ldr => "ldr",
            WeightsKey::LdrAlb => "ldr_alb",
            WeightsKey::LdrAlbNrm => "ldr_alb_nrm",
            WeightsKey::LdrCalbCnrm => "ldr_calb_cnrm",
            WeightsKey::Dir => "dir",
            WeightsKey::Alb => "alb",
            WeightsKey::Nrm => "nrm",
        }
    }

    /// Key for a combination of bound images and options
    ///
    /// Without colour exactly one auxiliary image is filtered on its own.
    pub fn select(
        has_color: bool,
        has_albedo: bool,
        has_normal: bool,
        hdr: bool,
        directional: bool,
        clean_aux: bool,
    ) -> Result<WeightsKey> {
        if !has_color {
            return match (has_albedo, has_normal) {
                (true, false) => Ok(WeightsKey::Alb),
                (false, true) => Ok(WeightsKey::Nrm),
                (false, false) => Err(Error::invalid_argument(
                    "color",
                    "no colour image and no auxiliary image bound",
                )),
                (true, true) => Err(Error::invalid_argument(
                    "color",
                    "auxiliary images are filtered one at a time without colour",
                )),
            };
        }
        if directional {
            return Ok(WeightsKey::Dir);
        }
        let key = match (hdr, has_albedo, has_normal, clean_aux) {
            (true, false, _, _) => WeightsKey::Hdr,
            (true, true, false, _) => WeightsKey::HdrAlb,
            (true, true, true, false) => WeightsKey::HdrAlbNrm,
            (true, true, true, true) => WeightsKey::HdrCalbCnrm,
            (false, false, _, _) => WeightsKey::Ldr,
            (false, true, false, _) => WeightsKey::LdrAlb,
            (false, true, true, false) => WeightsKey::LdrAlbNrm,
            (false, true, true, true) => WeightsKey::LdrCalbCnrm,
        };
        Ok(key)
    }
}

impl fmt::Display for WeightsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for WeightsKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        WeightsKey::ALL
            .iter()
            .copied()
            .find(|k| k.name() == s)
            .ok_or_else(|| Error::invalid_argument("key", format!("unknown weights key '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_selection() {
        let sel = |c, a, n, hdr, dir, clean| WeightsKey::select(c, a, n, hdr, dir, clean).unwrap();
        assert_eq!(sel(true, false, false, true, false, false), WeightsKey::Hdr);
        assert_eq!(sel(true, true, true, true, false, true), WeightsKey::HdrCalbCnrm);
        assert_eq!(sel(true, true, false, false, false, true), WeightsKey::LdrAlb);
        assert_eq!(sel(true, true, true, false, false, false), WeightsKey::LdrAlbNrm);
        assert_eq!(sel(true, false, false, false, true, false), WeightsKey::Dir);
        assert_eq!(sel(false, true, false, false, false, false), WeightsKey::Alb);
        assert_eq!(sel(false, false, true, true, false, false), WeightsKey::Nrm);
        assert!(WeightsKey::select(false, false, false, false, false, false).is_err());
    }

    #[test]
    fn test_key_names_roundtrip() {
        for key in WeightsKey::ALL {
            assert_eq!(key.name().parse::<WeightsKey>().unwrap(), key);
        }
        assert!("hdr_nrm".parse::<WeightsKey>().is_err());
    }

    #[test]
    fn test_layer_validation() {
        let mut w = Weights::new();
        w.insert_layer(
            "enc_conv0",
            HostTensor::new(&[2, 3, 3, 3], vec![0.0; 54]).unwrap(),
            HostTensor::new(&[3], vec![0.0; 3]).unwrap(),
        );
        assert!(w.layer("enc_conv0").is_err());
        assert!(w.layer("enc_conv1").is_err());
        assert!(HostTensor::new(&[2, 2], vec![0.0; 3]).is_err());
    }
}
