use serde::{Deserialize, Serialize};

/// Byte order of a capture file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    /// Byte order of the machine running the reader.
    pub const fn host() -> Self {
        if cfg!(target_endian = "big") {
            Endianness::Big
        } else {
            Endianness::Little
        }
    }

    /// Decode the endianness byte from the file header (0 little, 1 big).
    pub fn from_header_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Endianness::Little),
            1 => Some(Endianness::Big),
            _ => None,
        }
    }

    pub fn is_host(self) -> bool {
        self == Self::host()
    }

    /// Python-struct style marker, '<' for little and '>' for big.
    pub fn marker(self) -> char {
        match self {
            Endianness::Little => '<',
            Endianness::Big => '>',
        }
    }

    pub fn u16(self, b: [u8; 2]) -> u16 {
        match self {
            Endianness::Little => u16::from_le_bytes(b),
            Endianness::Big => u16::from_be_bytes(b),
        }
    }

    pub fn u32(self, b: [u8; 4]) -> u32 {
        match self {
            Endianness::Little => u32::from_le_bytes(b),
            Endianness::Big => u32::from_be_bytes(b),
        }
    }

    pub fn u64(self, b: [u8; 8]) -> u64 {
        match self {
            Endianness::Little => u64::from_le_bytes(b),
            Endianness::Big => u64::from_be_bytes(b),
        }
    }

    /// Read an unsigned integer of `bytes.len()` (1, 2, 4 or 8) bytes.
    ///
    /// Returns `None` for any other width.
    pub fn read_uint(self, bytes: &[u8]) -> Option<u64> {
        Some(match bytes.len() {
            1 => bytes[0] as u64,
            2 => self.u16(bytes.try_into().ok()?) as u64,
            4 => self.u32(bytes.try_into().ok()?) as u64,
            8 => self.u64(bytes.try_into().ok()?),
            _ => return None,
        })
    }

    /// Write the low `out.len()` bytes of `value` in this byte order.
    ///
    /// Returns `false` if `out` is not 1, 2, 4 or 8 bytes wide.
    pub fn write_uint(self, value: u64, out: &mut [u8]) -> bool {
        match (out.len(), self) {
            (1, _) => out[0] = value as u8,
            (2, Endianness::Little) => out.copy_from_slice(&(value as u16).to_le_bytes()),
            (2, Endianness::Big) => out.copy_from_slice(&(value as u16).to_be_bytes()),
            (4, Endianness::Little) => out.copy_from_slice(&(value as u32).to_le_bytes()),
            (4, Endianness::Big) => out.copy_from_slice(&(value as u32).to_be_bytes()),
            (8, Endianness::Little) => out.copy_from_slice(&value.to_le_bytes()),
            (8, Endianness::Big) => out.copy_from_slice(&value.to_be_bytes()),
            _ => return false,
        }
        true
    }
}
