//! Row codec: length-prefixed serialisation of a record.
//!
//! Wire format: `[id:4][ulen:2][username:ulen][elen:2][email:elen]`, all
//! integers little-endian. Sizes range from 8 bytes (both strings empty) to
//! 293 bytes. The id always occupies the first four bytes of a record, so
//! key comparisons on a leaf never deserialize the full row.

use forge_common::constants::{MAX_EMAIL_LEN, MAX_USERNAME_LEN};

/// A single record: a `u32` primary key plus two short strings.
///
/// # Example
///
/// ```rust
/// use forge_storage::row::Row;
///
/// let row = Row::new(1, "alice", "alice@example.com");
/// let mut buf = [0u8; 293];
/// let n = row.serialize(&mut buf);
/// assert_eq!(n, row.serialized_size());
/// assert_eq!(Row::deserialize(&buf[..n]), row);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// Primary key.
    pub id: u32,
    /// Username, at most 31 bytes.
    pub username: String,
    /// Email address, at most 254 bytes.
    pub email: String,
}

impl Row {
    /// Creates a row, truncating over-long fields to the format limits.
    pub fn new(id: u32, username: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id,
            username: clamp(username.into(), MAX_USERNAME_LEN),
            email: clamp(email.into(), MAX_EMAIL_LEN),
        }
    }

    /// Returns the exact number of bytes [`serialize`](Self::serialize)
    /// will write.
    #[inline]
    #[must_use]
    pub fn serialized_size(&self) -> usize {
        4 + 2 + self.username.len() + 2 + self.email.len()
    }

    /// Writes the wire form into `buf` and returns the number of bytes
    /// written.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`serialized_size`](Self::serialized_size).
    pub fn serialize(&self, buf: &mut [u8]) -> usize {
        let ulen = self.username.len();
        let elen = self.email.len();
        debug_assert!(ulen <= MAX_USERNAME_LEN && elen <= MAX_EMAIL_LEN);

        let mut off = 0;
        buf[off..off + 4].copy_from_slice(&self.id.to_le_bytes());
        off += 4;
        buf[off..off + 2].copy_from_slice(&(ulen as u16).to_le_bytes());
        off += 2;
        buf[off..off + ulen].copy_from_slice(self.username.as_bytes());
        off += ulen;
        buf[off..off + 2].copy_from_slice(&(elen as u16).to_le_bytes());
        off += 2;
        buf[off..off + elen].copy_from_slice(self.email.as_bytes());
        off + elen
    }

    /// Reads a row back from its wire form.
    ///
    /// Non-UTF-8 string bytes are replaced rather than rejected; the CRC
    /// layer is responsible for detecting corruption.
    #[must_use]
    pub fn deserialize(buf: &[u8]) -> Self {
        let id = u32::from_le_bytes(buf[0..4].try_into().unwrap());

        let ulen = u16::from_le_bytes(buf[4..6].try_into().unwrap()) as usize;
        let username = String::from_utf8_lossy(&buf[6..6 + ulen]).into_owned();

        let estart = 6 + ulen + 2;
        let elen = u16::from_le_bytes(buf[6 + ulen..estart].try_into().unwrap()) as usize;
        let email = String::from_utf8_lossy(&buf[estart..estart + elen]).into_owned();

        Self {
            id,
            username,
            email,
        }
    }

    /// Reads only the primary key from a serialized record.
    #[inline]
    #[must_use]
    pub fn key_of(record: &[u8]) -> u32 {
        u32::from_le_bytes(record[0..4].try_into().unwrap())
    }
}

/// Truncates to at most `max` bytes, respecting char boundaries.
fn clamp(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
    s
}
