//! Message buffer used for every payload that crosses the engine
//!
//! A [`Packet`] either owns its storage (allocated and copied on
//! construction) or borrows caller memory through a shared [`Bytes`] handle
//! plus an offset. Borrowed packets are never copied or reallocated, which
//! makes them the cheap choice for fan-out sends such as room broadcasts.

use std::fmt;

use bytes::Bytes;

#[derive(Clone)]
enum Storage {
    Owned(Vec<u8>),
    Borrowed(Bytes),
}

/// A byte buffer with owned or borrowed storage
#[derive(Clone)]
pub struct Packet {
    storage: Storage,
    offset: usize,
    len: usize,
}

impl Packet {
    /// Allocate a zeroed owned packet of `size` bytes
    pub fn new(size: usize) -> Self {
        Self {
            storage: Storage::Owned(vec![0; size]),
            offset: 0,
            len: size,
        }
    }

    /// Owned packet holding a copy of `data`
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            storage: Storage::Owned(data.to_vec()),
            offset: 0,
            len: data.len(),
        }
    }

    /// Borrowed packet over the whole of `data`
    pub fn borrowed(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let len = data.len();
        Self {
            storage: Storage::Borrowed(data),
            offset: 0,
            len,
        }
    }

    /// Borrowed packet over `len` bytes of `data` starting at `offset`
    ///
    /// Returns `None` when the range does not fit inside `data`.
    pub fn borrowed_range(data: Bytes, offset: usize, len: usize) -> Option<Self> {
        check_range(data.len(), offset, len)?;
        Some(Self {
            storage: Storage::Borrowed(data),
            offset,
            len,
        })
    }

    /// Logical length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Offset of the logical bytes inside the backing storage
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Size of the backing storage
    pub fn allocated_len(&self) -> usize {
        match &self.storage {
            Storage::Owned(buf) => buf.len(),
            Storage::Borrowed(bytes) => bytes.len(),
        }
    }

    /// Whether the packet owns its storage
    pub fn is_allocated(&self) -> bool {
        matches!(self.storage, Storage::Owned(_))
    }

    /// The logical bytes
    pub fn as_slice(&self) -> &[u8] {
        let range = self.offset..self.offset + self.len;
        match &self.storage {
            Storage::Owned(buf) => &buf[range],
            Storage::Borrowed(bytes) => &bytes[range],
        }
    }

    /// Mutable access to the logical bytes; borrowed packets are read-only
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        let range = self.offset..self.offset + self.len;
        match &mut self.storage {
            Storage::Owned(buf) => Some(&mut buf[range]),
            Storage::Borrowed(_) => None,
        }
    }

    /// Replace the contents with `len` bytes of `data` starting at `offset`
    ///
    /// Owned packets copy into their existing storage when it is large
    /// enough and reallocate otherwise. Borrowed packets rebind to `data`
    /// without copying. Returns `false` if the range does not fit.
    pub fn set_packet(&mut self, data: &Bytes, offset: usize, len: usize) -> bool {
        if check_range(data.len(), offset, len).is_none() {
            return false;
        }
        let src = &data[offset..offset + len];
        match &mut self.storage {
            Storage::Owned(buf) => {
                if buf.len() >= len {
                    buf[..len].copy_from_slice(src);
                } else {
                    *buf = src.to_vec();
                }
                self.offset = 0;
            }
            Storage::Borrowed(bytes) => {
                *bytes = data.clone();
                self.offset = offset;
            }
        }
        self.len = len;
        true
    }

    /// Turn an owned packet into a borrowed one without copying
    ///
    /// Used before fanning one payload out to many connections, where every
    /// clone of an owned packet would otherwise copy it.
    pub fn into_shared(self) -> Self {
        match self.storage {
            Storage::Owned(buf) => {
                let bytes = Bytes::from(buf).slice(self.offset..self.offset + self.len);
                Self::borrowed(bytes)
            }
            Storage::Borrowed(_) => self,
        }
    }

    /// Copy the logical bytes out
    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }
}

fn check_range(available: usize, offset: usize, len: usize) -> Option<()> {
    let end = offset.checked_add(len)?;
    (end <= available).then_some(())
}

impl From<Vec<u8>> for Packet {
    fn from(buf: Vec<u8>) -> Self {
        let len = buf.len();
        Self {
            storage: Storage::Owned(buf),
            offset: 0,
            len,
        }
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for Packet {}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len)
            .field("offset", &self.offset)
            .field("allocated", &self.is_allocated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owned_packet_copies_input() {
        let mut source = vec![1u8, 2, 3];
        let packet = Packet::from_slice(&source);
        source[0] = 9;

        assert!(packet.is_allocated());
        assert_eq!(packet.as_slice(), &[1, 2, 3]);
        assert_eq!(packet.allocated_len(), 3);
    }

    #[test]
    fn test_borrowed_range_shares_memory() {
        let data = Bytes::from_static(b"hello world");
        let packet = Packet::borrowed_range(data.clone(), 6, 5).unwrap();

        assert!(!packet.is_allocated());
        assert_eq!(packet.offset(), 6);
        assert_eq!(packet.as_slice(), b"world");
        assert_eq!(packet.allocated_len(), data.len());
        assert_eq!(packet.as_slice().as_ptr(), data[6..].as_ptr());
    }

    #[test]
    fn test_borrowed_range_rejects_out_of_bounds() {
        let data = Bytes::from_static(b"abc");
        assert!(Packet::borrowed_range(data.clone(), 2, 2).is_none());
        assert!(Packet::borrowed_range(data, usize::MAX, 2).is_none());
    }

    #[test]
    fn test_set_packet_reuses_owned_storage() {
        let mut packet = Packet::new(8);
        let data = Bytes::from_static(b"abcd");

        assert!(packet.set_packet(&data, 1, 3));
        assert_eq!(packet.as_slice(), b"bcd");
        assert_eq!(packet.allocated_len(), 8);
    }

    #[test]
    fn test_set_packet_grows_owned_storage() {
        let mut packet = Packet::new(2);
        let data = Bytes::from_static(b"abcdef");

        assert!(packet.set_packet(&data, 0, 6));
        assert_eq!(packet.as_slice(), b"abcdef");
        assert_eq!(packet.allocated_len(), 6);
        assert_eq!(packet.offset(), 0);
    }

    #[test]
    fn test_set_packet_rebinds_borrowed() {
        let mut packet = Packet::borrowed(Bytes::from_static(b"old"));
        let data = Bytes::from_static(b"brand new");

        assert!(packet.set_packet(&data, 6, 3));
        assert!(!packet.is_allocated());
        assert_eq!(packet.offset(), 6);
        assert_eq!(packet.as_slice(), b"new");
    }

    #[test]
    fn test_borrowed_is_read_only() {
        let mut packet = Packet::borrowed(Bytes::from_static(b"ro"));
        assert!(packet.as_mut_slice().is_none());

        let mut owned = Packet::new(2);
        owned.as_mut_slice().unwrap().copy_from_slice(b"rw");
        assert_eq!(owned.as_slice(), b"rw");
    }

    #[test]
    fn test_clone_semantics() {
        let owned = Packet::from_slice(b"xyz");
        let copy = owned.clone();
        assert_ne!(owned.as_slice().as_ptr(), copy.as_slice().as_ptr());

        let borrowed = Packet::borrowed(Bytes::from_static(b"xyz"));
        let shared = borrowed.clone();
        assert_eq!(borrowed.as_slice().as_ptr(), shared.as_slice().as_ptr());
        assert_eq!(owned, borrowed);
    }

    #[test]
    fn test_into_shared_keeps_contents() {
        let mut packet = Packet::new(6);
        packet.set_packet(&Bytes::from_static(b"abc"), 0, 3);

        let shared = packet.into_shared();
        assert!(!shared.is_allocated());
        assert_eq!(shared.as_slice(), b"abc");

        let again = shared.clone().into_shared();
        assert_eq!(again.as_slice().as_ptr(), shared.as_slice().as_ptr());
    }
}
