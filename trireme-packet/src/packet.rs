use crate::checksum;
use crate::error::{ParseError, Result};

pub const MIN_IPV4_HEADER: usize = 20;
pub const MIN_TCP_HEADER: usize = 20;
pub const UDP_HEADER: usize = 8;
pub const MAX_TCP_HEADER: usize = 60;

/// The custom TCP option kind used to carry a Trireme identity token,
/// placed after MSS.
pub const TOKEN_OPTION_KIND: u8 = 34;
const TCP_OPTION_MSS: u8 = 2;
const TCP_OPTION_NOP: u8 = 1;
const TCP_OPTION_EOL: u8 = 0;

/// Whether a packet was captured leaving the workload (toward the network)
/// or arriving at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    AppOriginated,
    NetworkOriginated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpProto {
    Tcp,
    Udp,
}

impl IpProto {
    fn from_byte(b: u8) -> Result<Self> {
        match b {
            6 => Ok(IpProto::Tcp),
            17 => Ok(IpProto::Udp),
            other => Err(ParseError::UnsupportedProtocol(other)),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            IpProto::Tcp => 6,
            IpProto::Udp => 17,
        }
    }
}

/// The subset of TCP flags the flow state machine dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpFlags(u8);

impl TcpFlags {
    pub fn syn(self) -> bool {
        self.0 & 0x02 != 0
    }
    pub fn ack(self) -> bool {
        self.0 & 0x10 != 0
    }
    pub fn fin(self) -> bool {
        self.0 & 0x01 != 0
    }
    pub fn rst(self) -> bool {
        self.0 & 0x04 != 0
    }
    pub fn bits(self) -> u8 {
        self.0
    }
}

/// The canonical 5-tuple a connection table is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiveTuple {
    pub src_addr: [u8; 4],
    pub src_port: u16,
    pub dst_addr: [u8; 4],
    pub dst_port: u16,
    pub proto: IpProto,
}

impl FiveTuple {
    /// The tuple as seen from the other side of the flow, used to look a
    /// reply packet up against the orig-table entry it answers.
    pub fn reversed(self) -> Self {
        FiveTuple {
            src_addr: self.dst_addr,
            src_port: self.dst_port,
            dst_addr: self.src_addr,
            dst_port: self.src_port,
            proto: self.proto,
        }
    }
}

/// A decoded view over one captured frame.
///
/// `buf` is the *capacity* of the underlying buffer, not the packet's
/// logical length. The capture transport is expected to hand us a buffer
/// with tailroom so a token option can be spliced in without reallocating.
/// The logical length always lives in the IPv4 total-length field and is
/// re-read on demand rather than cached, since rewrites change it.
pub struct Packet<'a> {
    buf: &'a mut [u8],
    direction: Direction,
    proto: IpProto,
}

impl<'a> Packet<'a> {
    pub fn parse(buf: &'a mut [u8], direction: Direction) -> Result<Self> {
        if buf.len() < MIN_IPV4_HEADER {
            return Err(ParseError::Malformed(buf.len()));
        }
        let ihl = (buf[0] & 0x0F) as usize * 4;
        if ihl < MIN_IPV4_HEADER || buf.len() < ihl {
            return Err(ParseError::Malformed(buf.len()));
        }
        let proto = IpProto::from_byte(buf[9])?;
        let l4_offset = ihl;
        let min_l4 = match proto {
            IpProto::Tcp => MIN_TCP_HEADER,
            IpProto::Udp => UDP_HEADER,
        };
        if buf.len() < l4_offset + min_l4 {
            return Err(ParseError::Malformed(buf.len()));
        }
        Ok(Packet { buf, direction, proto })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn proto(&self) -> IpProto {
        self.proto
    }

    pub fn ip_header_len(&self) -> usize {
        (self.buf[0] & 0x0F) as usize * 4
    }

    fn l4_offset(&self) -> usize {
        self.ip_header_len()
    }

    pub fn total_length(&self) -> u16 {
        u16::from_be_bytes([self.buf[2], self.buf[3]])
    }

    pub fn src_addr(&self) -> [u8; 4] {
        self.buf[12..16].try_into().unwrap()
    }

    pub fn dst_addr(&self) -> [u8; 4] {
        self.buf[16..20].try_into().unwrap()
    }

    pub fn src_port(&self) -> u16 {
        let l4 = self.l4_offset();
        u16::from_be_bytes([self.buf[l4], self.buf[l4 + 1]])
    }

    pub fn dst_port(&self) -> u16 {
        let l4 = self.l4_offset();
        u16::from_be_bytes([self.buf[l4 + 2], self.buf[l4 + 3]])
    }

    pub fn five_tuple(&self) -> FiveTuple {
        FiveTuple {
            src_addr: self.src_addr(),
            src_port: self.src_port(),
            dst_addr: self.dst_addr(),
            dst_port: self.dst_port(),
            proto: self.proto,
        }
    }

    /// TCP data offset in bytes (20..=60). Panics if called on a UDP packet.
    pub fn tcp_header_len(&self) -> usize {
        debug_assert!(matches!(self.proto, IpProto::Tcp));
        let l4 = self.l4_offset();
        ((self.buf[l4 + 12] >> 4) as usize) * 4
    }

    pub fn flags(&self) -> TcpFlags {
        debug_assert!(matches!(self.proto, IpProto::Tcp));
        let l4 = self.l4_offset();
        TcpFlags(self.buf[l4 + 13])
    }

    pub fn payload(&self) -> &[u8] {
        let l4 = self.l4_offset();
        let header_len = match self.proto {
            IpProto::Tcp => self.tcp_header_len(),
            IpProto::Udp => UDP_HEADER,
        };
        let start = l4 + header_len;
        let end = self.total_length() as usize;
        &self.buf[start..end]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let l4 = self.l4_offset();
        let header_len = match self.proto {
            IpProto::Tcp => self.tcp_header_len(),
            IpProto::Udp => UDP_HEADER,
        };
        let start = l4 + header_len;
        let end = self.total_length() as usize;
        &mut self.buf[start..end]
    }

    fn find_option(&self, kind: u8) -> Result<(usize, usize)> {
        let l4 = self.l4_offset();
        let opts_start = l4 + MIN_TCP_HEADER;
        let opts_end = l4 + self.tcp_header_len();
        let mut i = opts_start;
        while i < opts_end {
            let k = self.buf[i];
            if k == TCP_OPTION_EOL {
                break;
            }
            if k == TCP_OPTION_NOP {
                i += 1;
                continue;
            }
            if i + 1 >= opts_end {
                return Err(ParseError::MalformedOptions);
            }
            let len = self.buf[i + 1] as usize;
            if len < 2 || i + len > opts_end {
                return Err(ParseError::MalformedOptions);
            }
            if k == kind {
                return Ok((i, len));
            }
            i += len;
        }
        Err(ParseError::OptionNotFound(kind))
    }

    pub fn has_option(&self, kind: u8) -> bool {
        self.find_option(kind).is_ok()
    }

    /// Splices a `[kind][len][payload]` TLV onto the end of the TCP option
    /// area, padded to a 4-byte boundary with NOPs, and adjusts the IP and
    /// TCP checksums incrementally. The option is always appended last;
    /// `extract_and_remove_option` relies on that to find the removal
    /// boundary without re-parsing the whole option chain.
    pub fn inject_option(&mut self, kind: u8, payload: &[u8]) -> Result<()> {
        if !matches!(self.proto, IpProto::Tcp) {
            return Err(ParseError::UnsupportedProtocol(self.proto.as_byte()));
        }
        let opt_len = 2 + payload.len();
        if opt_len > 255 {
            return Err(ParseError::NoOptionSpace { needed: opt_len, available: 255 });
        }
        let padded_len = round_up4(opt_len);
        let header_len = self.tcp_header_len();
        let new_header_len = header_len + padded_len;
        if new_header_len > MAX_TCP_HEADER {
            return Err(ParseError::NoOptionSpace {
                needed: padded_len,
                available: MAX_TCP_HEADER - header_len,
            });
        }

        let ip_header_len = self.ip_header_len();
        let l4 = self.l4_offset();
        let total_length = self.total_length() as usize;
        let new_total_length = total_length + padded_len;
        if new_total_length > self.buf.len() {
            return Err(ParseError::NoCapacity { capacity: self.buf.len(), required: new_total_length });
        }

        let option_region_end = l4 + header_len;
        self.buf.copy_within(option_region_end..total_length, option_region_end + padded_len);

        let mut w = option_region_end;
        self.buf[w] = kind;
        w += 1;
        self.buf[w] = opt_len as u8;
        w += 1;
        self.buf[w..w + payload.len()].copy_from_slice(payload);
        w += payload.len();
        for b in &mut self.buf[w..option_region_end + padded_len] {
            *b = TCP_OPTION_NOP;
        }

        let old_flags_word = u16::from_be_bytes([self.buf[l4 + 12], self.buf[l4 + 13]]);
        let new_data_offset_words = (new_header_len / 4) as u8;
        self.buf[l4 + 12] = (new_data_offset_words << 4) | (self.buf[l4 + 12] & 0x0F);
        let new_flags_word = u16::from_be_bytes([self.buf[l4 + 12], self.buf[l4 + 13]]);

        let inserted_words = be_words(&self.buf[option_region_end..option_region_end + padded_len]);

        self.adjust_ip_checksum(total_length as u16, new_total_length as u16);
        self.adjust_tcp_checksum(
            old_flags_word,
            new_flags_word,
            (total_length - ip_header_len) as u16,
            (new_total_length - ip_header_len) as u16,
            &[],
            &inserted_words,
        );

        self.buf[2..4].copy_from_slice(&(new_total_length as u16).to_be_bytes());
        Ok(())
    }

    pub fn inject_token_option(&mut self, payload: &[u8]) -> Result<()> {
        self.inject_option(TOKEN_OPTION_KIND, payload)
    }

    /// Removes a previously injected TLV (assumed to be the trailing
    /// option, per `inject_option`'s contract) and returns its payload.
    pub fn extract_and_remove_option(&mut self, kind: u8) -> Result<Vec<u8>> {
        let (opt_off, opt_len) = self.find_option(kind)?;
        let payload = self.buf[opt_off + 2..opt_off + opt_len].to_vec();

        let ip_header_len = self.ip_header_len();
        let l4 = self.l4_offset();
        let header_len = self.tcp_header_len();
        let total_length = self.total_length() as usize;
        let abs_opts_end = l4 + header_len;

        let removed_words = be_words(&self.buf[opt_off..abs_opts_end]);
        let removed_len = abs_opts_end - opt_off;
        let new_header_len = header_len - removed_len;
        let new_total_length = total_length - removed_len;

        self.buf.copy_within(abs_opts_end..total_length, opt_off);

        let old_flags_word = u16::from_be_bytes([self.buf[l4 + 12], self.buf[l4 + 13]]);
        let new_data_offset_words = (new_header_len / 4) as u8;
        self.buf[l4 + 12] = (new_data_offset_words << 4) | (self.buf[l4 + 12] & 0x0F);
        let new_flags_word = u16::from_be_bytes([self.buf[l4 + 12], self.buf[l4 + 13]]);

        self.adjust_ip_checksum(total_length as u16, new_total_length as u16);
        self.adjust_tcp_checksum(
            old_flags_word,
            new_flags_word,
            (total_length - ip_header_len) as u16,
            (new_total_length - ip_header_len) as u16,
            &removed_words,
            &[],
        );

        self.buf[2..4].copy_from_slice(&(new_total_length as u16).to_be_bytes());
        Ok(payload)
    }

    pub fn extract_and_remove_token_option(&mut self) -> Result<Vec<u8>> {
        self.extract_and_remove_option(TOKEN_OPTION_KIND)
    }

    /// Clamps the TCP MSS option down to `ceiling` if it currently
    /// advertises something larger, leaving the header length unchanged.
    pub fn clamp_mss(&mut self, ceiling: u16) -> Result<()> {
        let (opt_off, opt_len) = self.find_option(TCP_OPTION_MSS)?;
        if opt_len != 4 {
            return Err(ParseError::MalformedOptions);
        }
        let value_off = opt_off + 2;
        let current = u16::from_be_bytes([self.buf[value_off], self.buf[value_off + 1]]);
        if current <= ceiling {
            return Ok(());
        }
        self.buf[value_off..value_off + 2].copy_from_slice(&ceiling.to_be_bytes());
        let l4 = self.l4_offset();
        let checksum_off = l4 + 16;
        let old_checksum = u16::from_be_bytes([self.buf[checksum_off], self.buf[checksum_off + 1]]);
        let new_checksum = checksum::adjust(old_checksum, current, ceiling);
        self.buf[checksum_off..checksum_off + 2].copy_from_slice(&new_checksum.to_be_bytes());
        Ok(())
    }

    fn adjust_ip_checksum(&mut self, old_total_length: u16, new_total_length: u16) {
        let off = 10;
        let old = u16::from_be_bytes([self.buf[off], self.buf[off + 1]]);
        let new = checksum::adjust(old, old_total_length, new_total_length);
        self.buf[off..off + 2].copy_from_slice(&new.to_be_bytes());
    }

    #[allow(clippy::too_many_arguments)]
    fn adjust_tcp_checksum(
        &mut self,
        old_flags_word: u16,
        new_flags_word: u16,
        old_tcp_len: u16,
        new_tcp_len: u16,
        removed_words: &[u16],
        inserted_words: &[u16],
    ) {
        let l4 = self.l4_offset();
        let off = l4 + 16;
        let old = u16::from_be_bytes([self.buf[off], self.buf[off + 1]]);
        let mid = checksum::adjust(old, old_flags_word, new_flags_word);
        let mid = checksum::adjust(mid, old_tcp_len, new_tcp_len);
        let new = checksum::adjust_region(mid, removed_words, inserted_words);
        self.buf[off..off + 2].copy_from_slice(&new.to_be_bytes());
    }

    /// UDP has no options area; by convention the first datagram in each
    /// direction carries the token as a `[len: u16][payload]` prefix of the
    /// UDP payload (see DESIGN.md Open Question 4).
    pub fn inject_udp_token(&mut self, payload: &[u8]) -> Result<()> {
        if !matches!(self.proto, IpProto::Udp) {
            return Err(ParseError::UnsupportedProtocol(self.proto.as_byte()));
        }
        let prefix_len = 2 + payload.len();
        let l4 = self.l4_offset();
        let total_length = self.total_length() as usize;
        let new_total_length = total_length + prefix_len;
        if new_total_length > self.buf.len() {
            return Err(ParseError::NoCapacity { capacity: self.buf.len(), required: new_total_length });
        }
        let payload_start = l4 + UDP_HEADER;
        self.buf.copy_within(payload_start..total_length, payload_start + prefix_len);
        self.buf[payload_start..payload_start + 2].copy_from_slice(&(payload.len() as u16).to_be_bytes());
        self.buf[payload_start + 2..payload_start + prefix_len].copy_from_slice(payload);

        self.adjust_ip_checksum(total_length as u16, new_total_length as u16);
        let old_udp_len = (total_length - l4) as u16;
        let new_udp_len = (new_total_length - l4) as u16;
        let inserted_words = be_words(&self.buf[payload_start..payload_start + prefix_len]);
        self.buf[l4 + 4..l4 + 6].copy_from_slice(&new_udp_len.to_be_bytes());
        self.adjust_udp_checksum(old_udp_len, new_udp_len, &[], &inserted_words);

        self.buf[2..4].copy_from_slice(&(new_total_length as u16).to_be_bytes());
        Ok(())
    }

    pub fn extract_and_remove_udp_token(&mut self) -> Result<Vec<u8>> {
        if !matches!(self.proto, IpProto::Udp) {
            return Err(ParseError::UnsupportedProtocol(self.proto.as_byte()));
        }
        let l4 = self.l4_offset();
        let payload_start = l4 + UDP_HEADER;
        let total_length = self.total_length() as usize;
        if payload_start + 2 > total_length {
            return Err(ParseError::MalformedOptions);
        }
        let len = u16::from_be_bytes([self.buf[payload_start], self.buf[payload_start + 1]]) as usize;
        let prefix_len = 2 + len;
        if payload_start + prefix_len > total_length {
            return Err(ParseError::MalformedOptions);
        }
        let token = self.buf[payload_start + 2..payload_start + prefix_len].to_vec();
        let removed_words = be_words(&self.buf[payload_start..payload_start + prefix_len]);
        let new_total_length = total_length - prefix_len;

        self.buf.copy_within(payload_start + prefix_len..total_length, payload_start);

        self.adjust_ip_checksum(total_length as u16, new_total_length as u16);
        let old_udp_len = (total_length - l4) as u16;
        let new_udp_len = (new_total_length - l4) as u16;
        self.buf[l4 + 4..l4 + 6].copy_from_slice(&new_udp_len.to_be_bytes());
        self.adjust_udp_checksum(old_udp_len, new_udp_len, &removed_words, &[]);

        self.buf[2..4].copy_from_slice(&(new_total_length as u16).to_be_bytes());
        Ok(token)
    }

    /// Opens a window on an otherwise data-free TCP segment (the final ACK
    /// of the handshake) and splices a `[len: u16][payload]` prefix onto the
    /// payload, growing the segment without touching the option area or
    /// data offset. Used when the identity token is too large for the
    /// 40-byte option budget but fits the deployment's `ackSize`.
    pub fn inject_tcp_payload_prefix(&mut self, payload: &[u8]) -> Result<()> {
        if !matches!(self.proto, IpProto::Tcp) {
            return Err(ParseError::UnsupportedProtocol(self.proto.as_byte()));
        }
        let prefix_len = 2 + payload.len();
        let l4 = self.l4_offset();
        let header_len = self.tcp_header_len();
        let payload_start = l4 + header_len;
        let total_length = self.total_length() as usize;
        let new_total_length = total_length + prefix_len;
        if new_total_length > self.buf.len() {
            return Err(ParseError::NoCapacity { capacity: self.buf.len(), required: new_total_length });
        }

        self.buf.copy_within(payload_start..total_length, payload_start + prefix_len);
        self.buf[payload_start..payload_start + 2].copy_from_slice(&(payload.len() as u16).to_be_bytes());
        self.buf[payload_start + 2..payload_start + prefix_len].copy_from_slice(payload);

        let ip_header_len = self.ip_header_len();
        let flags_word = u16::from_be_bytes([self.buf[l4 + 12], self.buf[l4 + 13]]);
        let inserted_words = be_words(&self.buf[payload_start..payload_start + prefix_len]);

        self.adjust_ip_checksum(total_length as u16, new_total_length as u16);
        self.adjust_tcp_checksum(
            flags_word,
            flags_word,
            (total_length - ip_header_len) as u16,
            (new_total_length - ip_header_len) as u16,
            &[],
            &inserted_words,
        );

        self.buf[2..4].copy_from_slice(&(new_total_length as u16).to_be_bytes());
        Ok(())
    }

    /// Inverse of `inject_tcp_payload_prefix`: removes the length-prefixed
    /// token from the front of the payload and returns it, restoring the
    /// segment a standards-conformant peer would expect.
    pub fn extract_and_remove_tcp_payload_prefix(&mut self) -> Result<Vec<u8>> {
        if !matches!(self.proto, IpProto::Tcp) {
            return Err(ParseError::UnsupportedProtocol(self.proto.as_byte()));
        }
        let l4 = self.l4_offset();
        let header_len = self.tcp_header_len();
        let payload_start = l4 + header_len;
        let total_length = self.total_length() as usize;
        if payload_start + 2 > total_length {
            return Err(ParseError::MalformedOptions);
        }
        let len = u16::from_be_bytes([self.buf[payload_start], self.buf[payload_start + 1]]) as usize;
        let prefix_len = 2 + len;
        if payload_start + prefix_len > total_length {
            return Err(ParseError::MalformedOptions);
        }
        let token = self.buf[payload_start + 2..payload_start + prefix_len].to_vec();

        let ip_header_len = self.ip_header_len();
        let flags_word = u16::from_be_bytes([self.buf[l4 + 12], self.buf[l4 + 13]]);
        let removed_words = be_words(&self.buf[payload_start..payload_start + prefix_len]);
        let new_total_length = total_length - prefix_len;

        self.buf.copy_within(payload_start + prefix_len..total_length, payload_start);

        self.adjust_ip_checksum(total_length as u16, new_total_length as u16);
        self.adjust_tcp_checksum(
            flags_word,
            flags_word,
            (total_length - ip_header_len) as u16,
            (new_total_length - ip_header_len) as u16,
            &removed_words,
            &[],
        );

        self.buf[2..4].copy_from_slice(&(new_total_length as u16).to_be_bytes());
        Ok(token)
    }

    fn adjust_udp_checksum(&mut self, old_udp_len: u16, new_udp_len: u16, removed_words: &[u16], inserted_words: &[u16]) {
        let l4 = self.l4_offset();
        let off = l4 + 6;
        let old = u16::from_be_bytes([self.buf[off], self.buf[off + 1]]);
        if old == 0 {
            // checksum disabled for this datagram; leave it disabled.
            return;
        }
        let mid = checksum::adjust(old, old_udp_len, new_udp_len);
        let new = checksum::adjust_region(mid, removed_words, inserted_words);
        self.buf[off..off + 2].copy_from_slice(&new.to_be_bytes());
    }
}

fn round_up4(n: usize) -> usize {
    (n + 3) & !3
}

fn be_words(bytes: &[u8]) -> Vec<u16> {
    bytes.chunks(2).map(|c| if c.len() == 2 { u16::from_be_bytes([c[0], c[1]]) } else { u16::from_be_bytes([c[0], 0]) }).collect()
}
