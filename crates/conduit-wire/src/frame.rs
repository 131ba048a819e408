use bytes::Bytes;

use crate::{
    codec,
    header::{Flags, Header},
};

/// Outbound message buffer.
///
/// A frame owns a primary buffer (header space plus structured fields
/// appended through the `append_*` methods) and an optional extended segment:
/// a zero-copy handle to bulk bytes transmitted immediately after the
/// primary buffer. Two write cursors track how much of each segment has hit
/// the wire, so a partial write leaves the frame resumable.
///
/// The header is patched in place by [`Frame::seal`] once the final segment
/// sizes are known; the comm layer calls it after assigning the message id,
/// just before the frame enters a send queue.
#[derive(Debug, Clone)]
pub struct Frame {
    header: Header,
    primary: Vec<u8>,
    ext: Bytes,
    primary_sent: usize,
    ext_sent: usize,
}

impl Frame {
    /// Creates a frame for the given sub-protocol, reserving header space
    /// plus `primary_capacity` bytes up front. The append cursor starts just
    /// past the header.
    pub fn new(protocol: u8, primary_capacity: usize) -> Self {
        Self::with_extended(protocol, primary_capacity, Bytes::new())
    }

    /// As [`Frame::new`], additionally attaching an extended segment that is
    /// transmitted after the primary buffer without being copied.
    pub fn with_extended(protocol: u8, primary_capacity: usize, ext: Bytes) -> Self {
        let mut primary = Vec::with_capacity(Header::LEN + primary_capacity);
        primary.resize(Header::LEN, 0);
        Self { header: Header::new(protocol), primary, ext, primary_sent: 0, ext_sent: 0 }
    }

    /// Carries over the request's id, group and protocol and clears the
    /// REQUEST flag. Used when building responses.
    pub fn initialize_from_request(&mut self, request: &Header) {
        self.header.protocol = request.protocol;
        self.header.id = request.id;
        self.header.group = request.group;
        self.header.flags = request.flags - Flags::REQUEST;
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Header access for the comm layer (id assignment, flag stamping).
    pub fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    /// Tags the frame with a serialization group. Frames sharing a non-zero
    /// group on one connection are delivered in submission order.
    pub fn set_group(&mut self, group: u32) {
        self.header.group = group;
    }

    pub fn add_flags(&mut self, flags: Flags) {
        self.header.flags |= flags;
    }

    /// Finalizes `total_len` from the actual segment sizes and writes the
    /// header into its reserved space.
    pub fn seal(&mut self) {
        self.header.total_len = (self.primary.len() + self.ext.len()) as u32;
        let header = self.header;
        header.encode_into(&mut self.primary[..Header::LEN]);
    }

    /// Total bytes this frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        self.primary.len() + self.ext.len()
    }

    /// Unsent remainders of the primary and extended segments, in
    /// transmission order. Either slice may be empty.
    pub fn pending_slices(&self) -> (&[u8], &[u8]) {
        (&self.primary[self.primary_sent..], &self.ext[self.ext_sent..])
    }

    /// Advances the write cursors past `n` transmitted bytes.
    pub fn advance(&mut self, n: usize) {
        let primary_step = n.min(self.primary.len() - self.primary_sent);
        self.primary_sent += primary_step;
        self.ext_sent += n - primary_step;
        debug_assert!(self.ext_sent <= self.ext.len());
    }

    pub fn is_fully_sent(&self) -> bool {
        self.primary_sent == self.primary.len() && self.ext_sent == self.ext.len()
    }

    /// Rewinds both write cursors to the start of their segments.
    pub fn reset_cursors(&mut self) {
        self.primary_sent = 0;
        self.ext_sent = 0;
    }

    pub fn append_bool(&mut self, val: bool) {
        codec::encode_bool(&mut self.primary, val);
    }

    pub fn append_u8(&mut self, val: u8) {
        codec::encode_u8(&mut self.primary, val);
    }

    pub fn append_u16(&mut self, val: u16) {
        codec::encode_u16(&mut self.primary, val);
    }

    pub fn append_u32(&mut self, val: u32) {
        codec::encode_u32(&mut self.primary, val);
    }

    pub fn append_u64(&mut self, val: u64) {
        codec::encode_u64(&mut self.primary, val);
    }

    pub fn append_vi32(&mut self, val: u32) {
        codec::encode_vi32(&mut self.primary, val);
    }

    pub fn append_vi64(&mut self, val: u64) {
        codec::encode_vi64(&mut self.primary, val);
    }

    pub fn append_str16(&mut self, val: &str) {
        codec::encode_str16(&mut self.primary, val);
    }

    pub fn append_vstr(&mut self, val: &str) {
        codec::encode_vstr(&mut self.primary, val);
    }

    pub fn append_bytes(&mut self, val: &[u8]) {
        codec::encode_bytes(&mut self.primary, val);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::PROTOCOL_NONE;

    #[test]
    fn sealed_total_len_covers_both_segments() {
        let ext = Bytes::from(vec![9u8; 100]);
        let mut frame = Frame::with_extended(PROTOCOL_NONE, 32, ext);
        frame.append_u32(0x100);
        frame.append_u32(1_048_576);
        frame.seal();

        assert_eq!(frame.wire_len(), Header::LEN + 8 + 100);
        assert_eq!(frame.header().total_len as usize, frame.wire_len());
        assert_eq!(frame.header().header_len as usize, Header::LEN);

        let (primary, ext) = frame.pending_slices();
        let mut cur = primary;
        let hdr = Header::decode(&mut cur).unwrap();
        assert!(hdr.is_well_formed());
        assert_eq!(hdr.payload_len(), 8 + 100);
        assert_eq!(codec::decode_u32(&mut cur).unwrap(), 0x100);
        assert_eq!(codec::decode_u32(&mut cur).unwrap(), 1_048_576);
        assert_eq!(ext.len(), 100);
    }

    #[test]
    fn cursors_resume_across_partial_writes() {
        let mut frame = Frame::with_extended(PROTOCOL_NONE, 8, Bytes::from_static(b"bulkdata"));
        frame.append_vstr("hi");
        frame.seal();
        let total = frame.wire_len();

        // Partial write ends inside the primary segment.
        frame.advance(Header::LEN + 1);
        let (primary, ext) = frame.pending_slices();
        assert_eq!(primary.len() + ext.len(), total - Header::LEN - 1);
        assert!(!frame.is_fully_sent());

        // Next write crosses into the extended segment.
        frame.advance(primary.len() + 3);
        let (primary, ext) = frame.pending_slices();
        assert!(primary.is_empty());
        assert_eq!(ext, b"kdata");

        frame.advance(ext.len());
        assert!(frame.is_fully_sent());

        frame.reset_cursors();
        let (primary, ext) = frame.pending_slices();
        assert_eq!(primary.len() + ext.len(), total);
    }

    #[test]
    fn response_inherits_request_identity() {
        let mut request = Header::new(4);
        request.flags = Flags::REQUEST;
        request.id = 77;
        request.group = 3;

        let mut response = Frame::new(PROTOCOL_NONE, 16);
        response.initialize_from_request(&request);
        response.append_vstr("HELLO");
        response.seal();

        let hdr = response.header();
        assert_eq!(hdr.protocol, 4);
        assert_eq!(hdr.id, 77);
        assert_eq!(hdr.group, 3);
        assert!(!hdr.is_request());
    }
}
