use std::fmt;
use std::str::FromStr;

/// A 128-bit interface or class identifier with the platform `GUID` layout.
///
/// # Examples
///
/// ```
/// use opc_da_client::com::Guid;
///
/// let guid: Guid = "{39C13A4D-011E-11D0-9675-0020AFD8ADB3}".parse().unwrap();
/// assert_eq!(guid, Guid::from_u128(0x39c13a4d_011e_11d0_9675_0020afd8adb3));
/// assert_eq!(guid.to_string(), "39C13A4D-011E-11D0-9675-0020AFD8ADB3");
/// ```
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

/// Failure to parse a textual GUID.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid GUID string: {0}")]
pub struct GuidParseError(pub String);

impl Guid {
    pub const fn zeroed() -> Self {
        Self {
            data1: 0,
            data2: 0,
            data3: 0,
            data4: [0; 8],
        }
    }

    pub const fn from_u128(value: u128) -> Self {
        Self {
            data1: (value >> 96) as u32,
            data2: (value >> 80) as u16,
            data3: (value >> 64) as u16,
            data4: (value as u64).to_be_bytes(),
        }
    }

    pub const fn to_u128(&self) -> u128 {
        ((self.data1 as u128) << 96)
            | ((self.data2 as u128) << 80)
            | ((self.data3 as u128) << 64)
            | (u64::from_be_bytes(self.data4) as u128)
    }
}

impl FromStr for Guid {
    type Err = GuidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let inner = trimmed
            .strip_prefix('{')
            .and_then(|rest| rest.strip_suffix('}'))
            .unwrap_or(trimmed);

        let groups: Vec<&str> = inner.split('-').collect();
        let lengths = [8usize, 4, 4, 4, 12];
        if groups.len() != lengths.len()
            || groups.iter().zip(lengths).any(|(g, len)| g.len() != len)
        {
            return Err(GuidParseError(s.to_string()));
        }

        let hex: String = groups.concat();
        u128::from_str_radix(&hex, 16)
            .map(Self::from_u128)
            .map_err(|_| GuidParseError(s.to_string()))
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = &self.data4;
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            self.data1, self.data2, self.data3, d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7]
        )
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{self}}}")
    }
}

#[cfg(windows)]
impl From<Guid> for windows::core::GUID {
    fn from(value: Guid) -> Self {
        Self::from_u128(value.to_u128())
    }
}

#[cfg(windows)]
impl From<windows::core::GUID> for Guid {
    fn from(value: windows::core::GUID) -> Self {
        Self::from_u128(value.to_u128())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guid_layout_matches_platform() {
        assert_eq!(std::mem::size_of::<Guid>(), 16);
        let guid = Guid::from_u128(0x0000_0000_0000_0000_c000_0000_0000_0046);
        assert_eq!(guid.data1, 0);
        assert_eq!(guid.data4, [0xC0, 0, 0, 0, 0, 0, 0, 0x46]);
    }

    #[test]
    fn test_guid_parse_with_and_without_braces() {
        let a: Guid = "F31DFDE2-07B6-11d2-B2D8-0060083BA1FB".parse().unwrap();
        let b: Guid = "{f31dfde2-07b6-11d2-b2d8-0060083ba1fb}".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_u128(), 0xF31D_FDE2_07B6_11D2_B2D8_0060_083B_A1FB);
    }

    #[test]
    fn test_guid_parse_rejects_garbage() {
        assert!("Matrikon.OPC.Simulation.1".parse::<Guid>().is_err());
        assert!("{F31DFDE2-07B6-11d2-B2D8}".parse::<Guid>().is_err());
        assert!("G31DFDE2-07B6-11d2-B2D8-0060083BA1FB".parse::<Guid>().is_err());
    }

    #[test]
    fn test_guid_debug_has_braces() {
        let guid = Guid::from_u128(1);
        assert_eq!(format!("{guid:?}"), "{00000000-0000-0000-0000-000000000001}");
    }
}
