//! GPIB bus addresses.

use std::{fmt, str::FromStr};

use crate::GpibError;

const PAD_MAX: u8 = 30;
const SAD_MIN: u8 = 0x60;
const SAD_MAX: u8 = 0x7E;
const URL_SCHEME: &str = "gpib:";

/// A GPIB bus address, consisting of a primary address and an optional secondary address.
///
/// The primary address (`pad`) must be in the range 0 to 30. The secondary address (`sad`) is
/// either 0, which means that no secondary address is used, or in the range `0x60` to `0x7E`.
///
/// Equality treats a missing secondary address as a wildcard: two addresses with the same primary
/// address are equal if either of them has no secondary address. Note that this relation is not
/// transitive, which is why `GpibAddress` does not implement `Eq` or `Hash`.
///
/// The canonical string form is `gpib:<pad>[,<sad>]`:
///
/// ```
/// use gpibrs::GpibAddress;
///
/// let addr: GpibAddress = "gpib:5,97".parse().unwrap();
/// assert_eq!(addr.pad(), 5);
/// assert_eq!(addr.sad(), 0x61);
/// assert_eq!(addr.to_string(), "gpib:5,97");
/// assert_eq!(addr, GpibAddress::try_new(5, 0).unwrap());
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct GpibAddress {
    pad: u8,
    sad: u8,
}

impl GpibAddress {
    /// Try to create a new address from a primary and a secondary address.
    ///
    /// # Arguments
    /// * `pad` - Primary address, 0 to 30.
    /// * `sad` - Secondary address, 0 for none or `0x60` to `0x7E`.
    pub fn try_new(pad: u8, sad: u8) -> Result<Self, GpibError> {
        if pad > PAD_MAX {
            return Err(GpibError::IntValueOutOfRange {
                value: pad.into(),
                min: 0,
                max: PAD_MAX.into(),
            });
        }
        if sad != 0 && !(SAD_MIN..=SAD_MAX).contains(&sad) {
            return Err(GpibError::IntValueOutOfRange {
                value: sad.into(),
                min: SAD_MIN.into(),
                max: SAD_MAX.into(),
            });
        }
        Ok(Self { pad, sad })
    }

    /// Get the primary address.
    pub fn pad(&self) -> u8 {
        self.pad
    }

    /// Get the secondary address, 0 if none is set.
    pub fn sad(&self) -> u8 {
        self.sad
    }

    /// Returns `true` if a secondary address is set.
    pub fn has_sad(&self) -> bool {
        self.sad != 0
    }

    /// The arguments of the gateway's `++addr` command for this address, e.g., `"5 96"`.
    pub(crate) fn addr_args(&self) -> String {
        if self.has_sad() {
            format!("{} {}", self.pad, self.sad)
        } else {
            self.pad.to_string()
        }
    }
}

impl PartialEq for GpibAddress {
    fn eq(&self, other: &Self) -> bool {
        self.pad == other.pad && (self.sad == 0 || other.sad == 0 || self.sad == other.sad)
    }
}

impl fmt::Display for GpibAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_sad() {
            write!(f, "{URL_SCHEME}{},{}", self.pad, self.sad)
        } else {
            write!(f, "{URL_SCHEME}{}", self.pad)
        }
    }
}

impl FromStr for GpibAddress {
    type Err = GpibError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_err = || GpibError::AddressParse(s.to_string());

        let rest = s.trim().strip_prefix(URL_SCHEME).ok_or_else(parse_err)?;
        let (pad, sad) = match rest.split_once(',') {
            Some((pad, sad)) => (pad, Some(sad)),
            None => (rest, None),
        };
        let pad: u8 = pad.trim().parse().map_err(|_| parse_err())?;
        let sad: u8 = match sad {
            Some(sad) => sad.trim().parse().map_err(|_| parse_err())?,
            None => 0,
        };
        Self::try_new(pad, sad)
    }
}
