//! Small string/byte helpers shared by the loader and workspace.

use failure::Error;

/// Read an ASCII, null-terminated string out of a buffer, trimming the
/// terminator. Used for import/export names, which the spec bounds to a
/// 256-byte read.
pub fn read_ascii(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Read a UTF-16LE, null-terminated string. Not exercised by any PE field
/// this crate currently parses, but kept available for forward
/// compatibility (e.g. resource-directory strings), per the spec.
pub fn read_utf16le(buf: &[u8]) -> Result<String, Error> {
    let units: Vec<u16> = buf
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    Ok(String::from_utf16(&units)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_trims_at_null() {
        assert_eq!(read_ascii(b"GetProcAddress\x00garbage"), "GetProcAddress");
    }

    #[test]
    fn ascii_without_null_reads_whole_buffer() {
        assert_eq!(read_ascii(b"NoNull"), "NoNull");
    }

    #[test]
    fn utf16le_reads_until_null() {
        let buf = b"A\x00B\x00\x00\x00junk";
        assert_eq!(read_utf16le(buf).unwrap(), "AB");
    }
}
