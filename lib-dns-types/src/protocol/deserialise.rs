//! Deserialisation of DNS queries from the network.  See the `types`
//! module for details of the format.
//!
//! Only the header and question section are decoded: this service
//! never inspects resource records.

use bytes::Bytes;

use crate::protocol::types::*;

/// Hard ceiling on compression pointer dereferences while decoding a
/// single name.  Pointers must also always target an earlier offset,
/// which already rules out loops; the ceiling additionally bounds the
/// work a contrived-but-legal chain can cause.
pub const MAX_POINTER_JUMPS: usize = 10;

impl Message {
    /// Decode the header and question section of a datagram,
    /// retaining a copy of the datagram itself.
    ///
    /// # Errors
    ///
    /// If the message cannot be parsed.
    pub fn from_octets(octets: &[u8]) -> Result<Self, Error> {
        let mut buffer = ConsumableBuffer::new(octets);
        let wire_header = WireHeader::deserialise(&mut buffer)?;

        // a 512-octet datagram cannot hold anywhere near 2^16
        // questions, so don't trust qdcount for preallocation
        let mut questions = Vec::with_capacity(usize::from(wire_header.qdcount).min(128));
        for _ in 0..wire_header.qdcount {
            questions.push(Question::deserialise(wire_header.header.id, &mut buffer)?);
        }

        Ok(Self {
            header: wire_header.header,
            questions,
            raw: Bytes::copy_from_slice(octets),
        })
    }
}

impl WireHeader {
    /// # Errors
    ///
    /// If the header is too short.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let id = buffer.next_u16().ok_or(Error::CompletelyBusted)?;
        let flags1 = buffer.next_u8().ok_or(Error::HeaderTooShort(id))?;
        let flags2 = buffer.next_u8().ok_or(Error::HeaderTooShort(id))?;
        let qdcount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;
        let ancount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;
        let nscount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;
        let arcount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;

        Ok(Self {
            header: Header {
                id,
                is_response: flags1 & HEADER_MASK_QR != 0,
                opcode: Opcode::from((flags1 & HEADER_MASK_OPCODE) >> HEADER_OFFSET_OPCODE),
                is_authoritative: flags1 & HEADER_MASK_AA != 0,
                is_truncated: flags1 & HEADER_MASK_TC != 0,
                recursion_desired: flags1 & HEADER_MASK_RD != 0,
                recursion_available: flags2 & HEADER_MASK_RA != 0,
                z: (flags2 & HEADER_MASK_Z) >> HEADER_OFFSET_Z,
                rcode: Rcode::from((flags2 & HEADER_MASK_RCODE) >> HEADER_OFFSET_RCODE),
            },
            qdcount,
            ancount,
            nscount,
            arcount,
        })
    }
}

impl Question {
    /// # Errors
    ///
    /// If the question cannot be parsed.
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let name = DomainName::deserialise(id, buffer)?;
        let qtype = buffer
            .next_u16()
            .map(QueryType::from)
            .ok_or(Error::QuestionTooShort(id))?;
        let qclass = buffer
            .next_u16()
            .map(QueryClass::from)
            .ok_or(Error::QuestionTooShort(id))?;

        Ok(Self {
            name,
            qtype,
            qclass,
        })
    }
}

impl DomainName {
    /// Decode a possibly-compressed name.
    ///
    /// The buffer is left positioned just after the first encoded
    /// form of the name: following a pointer never advances the
    /// caller-visible position past that pointer's two octets.
    ///
    /// # Errors
    ///
    /// If the domain cannot be parsed.
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        Self::deserialise_jumped(id, buffer, 0)
    }

    fn deserialise_jumped(
        id: u16,
        buffer: &mut ConsumableBuffer,
        jumps: usize,
    ) -> Result<Self, Error> {
        let mut octets = Vec::<u8>::with_capacity(DOMAINNAME_MAX_LEN);
        let mut labels = Vec::<Vec<u8>>::with_capacity(5);

        'outer: loop {
            let size_pos = buffer.position;
            let size = buffer.next_u8().ok_or(Error::DomainTooShort(id))?;

            match size & 0b1100_0000 {
                0b0000_0000 => {
                    octets.push(size);

                    if size == 0 {
                        break 'outer;
                    }

                    if let Some(os) = buffer.take(size as usize) {
                        octets.extend_from_slice(os);
                        labels.push(os.to_vec());
                    } else {
                        return Err(Error::DomainTooShort(id));
                    }

                    if octets.len() > DOMAINNAME_MAX_LEN {
                        return Err(Error::DomainTooLong(id));
                    }
                }
                0b1100_0000 => {
                    if jumps >= MAX_POINTER_JUMPS {
                        return Err(Error::DomainPointerLimit(id));
                    }

                    let hi = size & 0b0011_1111;
                    let lo = buffer.next_u8().ok_or(Error::DomainTooShort(id))?;
                    let ptr = usize::from(u16::from_be_bytes([hi, lo]));

                    // pointers must target an offset strictly before
                    // their own position (RFC 1035 section 4.1.4 only
                    // says "prior occurance"; requiring strict
                    // decrease is what makes loops impossible)
                    if ptr >= size_pos {
                        return Err(Error::DomainPointerInvalid(id));
                    }

                    let mut other =
                        DomainName::deserialise_jumped(id, &mut buffer.at_offset(ptr), jumps + 1)?;

                    // the pointed-to suffix brings its own terminator
                    octets.append(&mut other.octets);
                    labels.append(&mut other.labels);
                    break 'outer;
                }
                // 0b01 and 0b10 are reserved label types
                _ => return Err(Error::DomainLabelInvalid(id)),
            }
        }

        if octets.len() <= DOMAINNAME_MAX_LEN {
            Ok(DomainName { octets, labels })
        } else {
            Err(Error::DomainTooLong(id))
        }
    }
}

/// Errors encountered when parsing a datagram.  In all the errors
/// which have a `u16` parameter, that is the ID from the header - so
/// that an error response can be sent.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// The datagram is not even 2 octets long, so it doesn't even
    /// contain a valid ID.  An error cannot even be sent back to the
    /// client in this case as, without an ID, it cannot be linked
    /// with the correct query.
    CompletelyBusted,

    /// The header is missing one or more required fields.
    HeaderTooShort(u16),

    /// A question ends with an incomplete field.
    QuestionTooShort(u16),

    /// A domain is incomplete.
    DomainTooShort(u16),

    /// A domain is over 255 octets in size.
    DomainTooLong(u16),

    /// A domain pointer does not point strictly backwards.
    DomainPointerInvalid(u16),

    /// A domain used more than `MAX_POINTER_JUMPS` pointers.
    DomainPointerLimit(u16),

    /// A label starts with the reserved `0b01` or `0b10` tag.
    DomainLabelInvalid(u16),
}

impl Error {
    pub fn id(self) -> Option<u16> {
        match self {
            Error::CompletelyBusted => None,
            Error::HeaderTooShort(id)
            | Error::QuestionTooShort(id)
            | Error::DomainTooShort(id)
            | Error::DomainTooLong(id)
            | Error::DomainPointerInvalid(id)
            | Error::DomainPointerLimit(id)
            | Error::DomainLabelInvalid(id) => Some(id),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::CompletelyBusted => write!(f, "datagram too short to carry an ID"),
            Error::HeaderTooShort(id) => write!(f, "header incomplete (id {id})"),
            Error::QuestionTooShort(id) => write!(f, "question incomplete (id {id})"),
            Error::DomainTooShort(id) => write!(f, "domain name incomplete (id {id})"),
            Error::DomainTooLong(id) => write!(f, "domain name over 255 octets (id {id})"),
            Error::DomainPointerInvalid(id) => {
                write!(f, "compression pointer not strictly backwards (id {id})")
            }
            Error::DomainPointerLimit(id) => {
                write!(f, "too many compression pointers (id {id})")
            }
            Error::DomainLabelInvalid(id) => write!(f, "reserved label type (id {id})"),
        }
    }
}

impl std::error::Error for Error {}

/// A buffer which will be consumed by the parsing process.
pub struct ConsumableBuffer<'a> {
    octets: &'a [u8],
    pub(crate) position: usize,
}

impl<'a> ConsumableBuffer<'a> {
    pub fn new(octets: &'a [u8]) -> Self {
        Self {
            octets,
            position: 0,
        }
    }

    pub fn next_u8(&mut self) -> Option<u8> {
        if self.octets.len() > self.position {
            let a = self.octets[self.position];
            self.position += 1;
            Some(a)
        } else {
            None
        }
    }

    pub fn next_u16(&mut self) -> Option<u16> {
        if self.octets.len() > self.position + 1 {
            let a = self.octets[self.position];
            let b = self.octets[self.position + 1];
            self.position += 2;
            Some(u16::from_be_bytes([a, b]))
        } else {
            None
        }
    }

    pub fn take(&mut self, size: usize) -> Option<&'a [u8]> {
        if self.octets.len() >= self.position + size {
            let slice = &self.octets[self.position..self.position + size];
            self.position += size;
            Some(slice)
        } else {
            None
        }
    }

    pub fn at_offset(&self, position: usize) -> ConsumableBuffer<'a> {
        Self {
            octets: self.octets,
            position,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name_at(octets: &[u8], position: usize) -> Result<(DomainName, usize), Error> {
        let mut buffer = ConsumableBuffer::new(octets).at_offset(position);
        let name = DomainName::deserialise(0, &mut buffer)?;
        Ok((name, buffer.position))
    }

    #[test]
    fn header_too_short() {
        for len in 2..WIRE_HEADER_LEN {
            let octets = vec![0; len];
            assert_eq!(
                Err(Error::HeaderTooShort(0)),
                WireHeader::deserialise(&mut ConsumableBuffer::new(&octets))
            );
        }

        assert_eq!(
            Err(Error::CompletelyBusted),
            WireHeader::deserialise(&mut ConsumableBuffer::new(&[0x12]))
        );
    }

    #[test]
    fn header_just_long_enough() {
        let octets = [
            0x12, 0x34, // ID
            0x01, 0x00, // flags: RD
            0x00, 0x01, // QDCOUNT
            0x00, 0x00, // ANCOUNT
            0x00, 0x00, // NSCOUNT
            0x00, 0x00, // ARCOUNT
        ];
        let wire_header = WireHeader::deserialise(&mut ConsumableBuffer::new(&octets)).unwrap();

        assert_eq!(0x1234, wire_header.header.id);
        assert!(!wire_header.header.is_response);
        assert_eq!(Opcode::Standard, wire_header.header.opcode);
        assert!(wire_header.header.recursion_desired);
        assert_eq!(Rcode::NoError, wire_header.header.rcode);
        assert_eq!(1, wire_header.qdcount);
        assert_eq!(0, wire_header.ancount);
    }

    #[test]
    fn name_simple() {
        let octets = [
            3, b'w', b'w', b'w', 6, b'g', b'o', b'o', b'g', b'l', b'e', 3, b'c', b'o', b'm', 0,
        ];
        let (name, position) = name_at(&octets, 0).unwrap();

        assert_eq!("www.google.com", name.to_dotted_string());
        assert_eq!(octets.to_vec(), name.octets);
        assert_eq!(octets.len(), position);
    }

    #[test]
    fn name_preserves_case() {
        let octets = [3, b'C', b'o', b'M', 0];
        let (name, _) = name_at(&octets, 0).unwrap();

        assert_eq!("CoM", name.to_dotted_string());
    }

    #[test]
    fn name_root() {
        let (name, position) = name_at(&[0, 0xff], 0).unwrap();

        assert!(name.is_root());
        assert_eq!(1, position);
    }

    #[test]
    fn name_compressed() {
        // "www.google.com" at offset 0, "mail" + pointer to offset 4
        // ("google.com") at offset 16
        let mut octets = vec![
            3, b'w', b'w', b'w', 6, b'g', b'o', b'o', b'g', b'l', b'e', 3, b'c', b'o', b'm', 0,
        ];
        octets.extend_from_slice(&[4, b'm', b'a', b'i', b'l', 0xC0, 0x04]);

        let (name, position) = name_at(&octets, 16).unwrap();

        assert_eq!("mail.google.com", name.to_dotted_string());
        // cursor is fixed just after the pointer, not at the target
        assert_eq!(23, position);
    }

    #[test]
    fn name_pointer_to_self() {
        assert_eq!(
            Err(Error::DomainPointerInvalid(0)),
            name_at(&[0xC0, 0x00], 0).map(|(name, _)| name)
        );
    }

    #[test]
    fn name_pointer_forwards() {
        let octets = [3, b'f', b'o', b'o', 0xC0, 0x06, 3, b'c', b'o', b'm', 0];
        assert_eq!(
            Err(Error::DomainPointerInvalid(0)),
            name_at(&octets, 0).map(|(name, _)| name)
        );
    }

    #[test]
    fn name_pointer_chain_at_limit() {
        // a name at offset 0 and 10 pointers each targeting the
        // previous one: decoding from the last succeeds with exactly
        // MAX_POINTER_JUMPS dereferences
        let mut octets = vec![1, b'x', 0];
        for _ in 0..MAX_POINTER_JUMPS {
            let target = octets.len() - 3;
            // safe cast: the buffer stays far below 2^14 octets
            octets.extend_from_slice(&[0xC0 | (target >> 8) as u8, target as u8]);
            octets.push(0); // padding so targets stay 3 apart
        }

        let start = octets.len() - 3;
        let (name, _) = name_at(&octets, start).unwrap();
        assert_eq!("x", name.to_dotted_string());
    }

    #[test]
    fn name_pointer_chain_over_limit() {
        let mut octets = vec![1, b'x', 0];
        for _ in 0..=MAX_POINTER_JUMPS {
            let target = octets.len() - 3;
            octets.extend_from_slice(&[0xC0 | (target >> 8) as u8, target as u8]);
            octets.push(0);
        }

        let start = octets.len() - 3;
        assert_eq!(
            Err(Error::DomainPointerLimit(0)),
            name_at(&octets, start).map(|(name, _)| name)
        );
    }

    #[test]
    fn name_label_64_is_reserved_type() {
        let mut octets = vec![64];
        octets.extend_from_slice(&[b'a'; 64]);
        octets.push(0);

        assert_eq!(
            Err(Error::DomainLabelInvalid(0)),
            name_at(&octets, 0).map(|(name, _)| name)
        );
    }

    #[test]
    fn name_reserved_label_types() {
        for tag in [0b0100_0000, 0b1000_0000] {
            assert_eq!(
                Err(Error::DomainLabelInvalid(0)),
                name_at(&[tag, 0], 0).map(|(name, _)| name)
            );
        }
    }

    #[test]
    fn name_length_limit() {
        // three 63-octet labels and one 61-octet label encode to
        // exactly 255 octets
        let mut exact = Vec::new();
        for _ in 0..3 {
            exact.push(63);
            exact.extend_from_slice(&[b'a'; 63]);
        }
        exact.push(61);
        exact.extend_from_slice(&[b'a'; 61]);
        exact.push(0);
        assert_eq!(255, exact.len());

        let (name, _) = name_at(&exact, 0).unwrap();
        assert_eq!(255, name.octets.len());

        // one more octet in the final label tips it over
        let mut over = Vec::new();
        for _ in 0..3 {
            over.push(63);
            over.extend_from_slice(&[b'a'; 63]);
        }
        over.push(62);
        over.extend_from_slice(&[b'a'; 62]);
        over.push(0);
        assert_eq!(256, over.len());

        assert_eq!(
            Err(Error::DomainTooLong(0)),
            name_at(&over, 0).map(|(name, _)| name)
        );
    }

    #[test]
    fn name_truncated() {
        assert_eq!(
            Err(Error::DomainTooShort(0)),
            name_at(&[3, b'w', b'w'], 0).map(|(name, _)| name)
        );

        assert_eq!(
            Err(Error::DomainTooShort(0)),
            name_at(&[3, b'w', b'w', b'w'], 0).map(|(name, _)| name)
        );
    }

    #[test]
    fn message_with_question() {
        let octets = [
            0xAB, 0xCD, // ID
            0x01, 0x00, // flags: RD
            0x00, 0x01, // QDCOUNT
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // other counts
            6, b'g', b'o', b'o', b'g', b'l', b'e', 3, b'c', b'o', b'm', 0, // QNAME
            0x00, 0x01, // QTYPE = A
            0x00, 0x01, // QCLASS = IN
        ];
        let message = Message::from_octets(&octets).unwrap();

        assert_eq!(0xABCD, message.header.id);
        assert!(message.header.recursion_desired);
        assert_eq!(1, message.questions.len());

        let question = message.first_question().unwrap();
        assert_eq!("google.com", question.name.to_dotted_string());
        assert_eq!(QueryType::A, question.qtype);
        assert_eq!(QueryClass::IN, question.qclass);

        assert_eq!(&octets[..], message.raw.as_ref());
    }

    #[test]
    fn message_question_truncated() {
        let octets = [
            0xAB, 0xCD, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // header
            6, b'g', b'o', b'o', b'g', b'l', b'e', 3, b'c', b'o', b'm', 0, // QNAME
            0x00, 0x01, // QTYPE but no QCLASS
        ];
        assert_eq!(
            Err(Error::QuestionTooShort(0xABCD)),
            Message::from_octets(&octets)
        );
    }

    #[test]
    fn message_no_questions() {
        let octets = [0xAB, 0xCD, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        let message = Message::from_octets(&octets).unwrap();

        assert!(message.questions.is_empty());
        assert_eq!(None, message.first_question());
    }
}
