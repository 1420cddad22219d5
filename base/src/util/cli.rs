use std::fmt::Debug;
use std::str::FromStr;

use arrayvec::ArrayVec;

use crate::defs::{Error, ErrorKind::*, Result};

pub struct Array<T: FromStr, const N: usize>(pub [T; N]);

impl<T: Debug + Default + FromStr, const N: usize> FromStr for Array<T, N> {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let malformed_err = || {
            let desc = format!("malformed value array '{}'", s);
            Error::new(MalformedData, desc)
        };

        let mut iter = s.split(',').map(str::trim);
        let mut vec = ArrayVec::<T, N>::new();

        for _ in 0..N {
            let part = iter.next().ok_or_else(malformed_err)?;
            vec.push(if part.is_empty() {
                T::default()
            } else {
                part.parse::<T>().map_err(|_| malformed_err())?
            });
        }

        if iter.next().is_some() {
            return Err(malformed_err());
        }

        vec.into_inner().map(Array).map_err(|_| malformed_err())
    }
}

impl<T: FromStr, const N: usize> From<[T; N]> for Array<T, N> {
    fn from(array: [T; N]) -> Self {
        Self(array)
    }
}

/// 8-bit RGB color given either as `r,g,b` or as `#rrggbb`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RgbColor(pub [u8; 3]);

impl FromStr for RgbColor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(hex) = s.strip_prefix('#') {
            let value = u32::from_str_radix(hex, 16).ok().filter(|_| hex.len() == 6);
            return match value {
                Some(v) => Ok(RgbColor([(v >> 16) as u8, (v >> 8) as u8, v as u8])),
                None => {
                    let desc = format!("malformed hex color '{}'", s);
                    Err(Error::new(MalformedData, desc))
                }
            };
        }
        s.parse::<Array<u8, 3>>().map(|a| RgbColor(a.0))
    }
}
