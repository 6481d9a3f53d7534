use core::fmt;

/// Bytes shown before a preview is truncated.
const PREVIEW_LEN: usize = 16;

/// Lowercase hex rendering of a byte slice for log lines. Long buffers are
/// cut after [`PREVIEW_LEN`] bytes and suffixed with the total length.
pub struct HexPreview<'a>(&'a [u8]);

impl<'a> HexPreview<'a> {
    fn new<T>(data: &'a T) -> HexPreview<'a>
    where
        T: ?Sized + AsRef<[u8]> + 'a,
    {
        HexPreview(data.as_ref())
    }
}

impl fmt::Display for HexPreview<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter().take(PREVIEW_LEN) {
            write!(f, "{:02x}", byte)?;
        }
        if self.0.len() > PREVIEW_LEN {
            write!(f, "..({} bytes)", self.0.len())?;
        }
        Ok(())
    }
}

impl fmt::Debug for HexPreview<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

pub trait HexPreviewExt {
    fn hex(&self) -> HexPreview<'_>;
}

impl<T> HexPreviewExt for T
where
    T: ?Sized + AsRef<[u8]>,
{
    fn hex(&self) -> HexPreview<'_> {
        HexPreview::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_buffers_are_printed_in_full() {
        assert_eq!([0x01u8, 0xab].hex().to_string(), "01ab");
        assert_eq!(b"".hex().to_string(), "");
    }

    #[test]
    fn long_buffers_are_truncated() {
        let data = vec![0xffu8; 40];
        let shown = data.hex().to_string();
        assert!(shown.starts_with(&"ff".repeat(PREVIEW_LEN)));
        assert!(shown.ends_with("..(40 bytes)"));
    }
}
