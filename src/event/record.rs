/*!
 * Event Record Wire Format
 *
 * Binary layout consumed by any draining code: a 16-byte little-endian
 * header `{system: u8, id: u8, serial: u16, size: u32, object: u64}`
 * followed by `size - 16` payload bytes, the total padded to 4-byte
 * alignment. A record whose `system` field is 0 terminates a block.
 */

use crate::core::limits::{EVENT_ALIGN, EVENT_HEADER_LEN};
use crate::core::types::{Handle, Serial};

/// Decoded event record header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    /// Originating subsystem, non-zero for real records
    pub system: u8,
    /// Event id within the subsystem
    pub id: u8,
    /// Stream-wide order stamp (16-bit, wraps)
    pub serial: Serial,
    /// Total record size in bytes, header included, 4-byte aligned
    pub size: u32,
    /// Handle of the posting object
    pub object: Handle,
}

impl EventHeader {
    /// Encode into the first [`EVENT_HEADER_LEN`] bytes of `buf`
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0] = self.system;
        buf[1] = self.id;
        buf[2..4].copy_from_slice(&self.serial.to_le_bytes());
        buf[4..8].copy_from_slice(&self.size.to_le_bytes());
        buf[8..16].copy_from_slice(&self.object.raw().to_le_bytes());
    }

    /// Decode from the first [`EVENT_HEADER_LEN`] bytes of `buf`
    pub fn read_from(buf: &[u8]) -> Self {
        Self {
            system: buf[0],
            id: buf[1],
            serial: u16::from_le_bytes([buf[2], buf[3]]),
            size: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            object: Handle(u64::from_le_bytes([
                buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
            ])),
        }
    }
}

/// Total record size for a payload, header included, 4-byte aligned
#[inline]
pub fn record_size(payload_len: usize) -> usize {
    (EVENT_HEADER_LEN + payload_len + EVENT_ALIGN - 1) & !(EVENT_ALIGN - 1)
}

/// One drained event record
///
/// Borrowed view into a drained block; alive until the next `process()`
/// call on the owning stream.
#[derive(Debug, Clone, Copy)]
pub struct EventRef<'a> {
    pub header: EventHeader,
    payload: &'a [u8],
}

impl<'a> EventRef<'a> {
    /// Payload bytes, including alignment padding
    ///
    /// The wire format does not record the pre-padding length; callers that
    /// need exact framing carry it inside the payload.
    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    /// Padded payload length (`size - 16`)
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}

/// Restartable iterator over the records of one drained block
///
/// Advances by each record's `size` field and stops at the zero-`system`
/// sentinel (equivalently, at the end of the block's used bytes).
#[derive(Debug, Clone)]
pub struct EventIter<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> EventIter<'a> {
    /// Iterate the used bytes of a block
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }
}

impl<'a> Iterator for EventIter<'a> {
    type Item = EventRef<'a>;

    fn next(&mut self) -> Option<EventRef<'a>> {
        if self.offset + EVENT_HEADER_LEN > self.data.len() {
            return None;
        }
        let header = EventHeader::read_from(&self.data[self.offset..]);
        if header.system == 0 {
            return None;
        }

        let size = header.size as usize;
        let end = self.offset + size;
        if size < EVENT_HEADER_LEN || size % EVENT_ALIGN != 0 || end > self.data.len() {
            debug_assert!(false, "corrupt event record at offset {}", self.offset);
            return None;
        }

        let payload = &self.data[self.offset + EVENT_HEADER_LEN..end];
        self.offset = end;
        Some(EventRef { header, payload })
    }
}
