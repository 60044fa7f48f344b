//! Serialisation of DNS messages to the wire format, and synthesis of
//! negative responses.  See the `types` module for details of the
//! format.

use crate::protocol::deserialise::ConsumableBuffer;
use crate::protocol::types::*;

impl Message {
    /// Build a response to this query carrying the given rcode and no
    /// answers.
    ///
    /// The question section is copied octet-for-octet from the
    /// retained datagram rather than re-encoded from the decoded
    /// questions: RFC 1035 section 4.1.1 requires the question to be
    /// echoed exactly, and some clients match on the raw bytes.
    ///
    /// # Errors
    ///
    /// If the rcode is not a negative one, or if the question section
    /// cannot be walked (see `negative_response_from_raw`).
    pub fn negative_response(&self, rcode: Rcode) -> Result<Vec<u8>, Error> {
        negative_response_from_raw(&self.raw, rcode)
    }
}

/// Build a negative response directly from query bytes, which need
/// not have parsed: this is how a `FORMERR` gets sent for a datagram
/// whose question section is intact but whose later octets are
/// malformed.
///
/// The response header is:
///
/// - id copied from the query
/// - QR set, opcode zero, AA / TC / RA / Z clear, RD copied
/// - the given rcode
/// - QDCOUNT copied, all other counts zero
///
/// followed by a verbatim copy of the query's question section.  The
/// copy's length is found by walking the first QNAME, which must be
/// uncompressed, plus the four QTYPE/QCLASS octets.
///
/// # Errors
///
/// If the rcode is not a negative one, if the header or question
/// section is incomplete, or if the QNAME uses compression pointers
/// (or reserved label types) and so cannot be copied verbatim.
pub fn negative_response_from_raw(raw: &[u8], rcode: Rcode) -> Result<Vec<u8>, Error> {
    if !rcode.is_negative() {
        return Err(Error::NotANegativeRcode(rcode));
    }

    let wire_header = WireHeader::deserialise(&mut ConsumableBuffer::new(raw))
        .map_err(|_| Error::HeaderIncomplete)?;

    // a query with no questions (already an error at the pipeline)
    // has nothing to echo
    let question_end = if wire_header.qdcount == 0 {
        WIRE_HEADER_LEN
    } else {
        walk_uncompressed_question(raw)?
    };

    let response_header = WireHeader {
        header: Header {
            id: wire_header.header.id,
            is_response: true,
            opcode: Opcode::Standard,
            is_authoritative: false,
            is_truncated: false,
            recursion_desired: wire_header.header.recursion_desired,
            recursion_available: false,
            z: 0,
            rcode,
        },
        qdcount: wire_header.qdcount,
        ancount: 0,
        nscount: 0,
        arcount: 0,
    };

    let mut buffer = WritableBuffer::default();
    response_header.serialise(&mut buffer);
    buffer.write_octets(&raw[WIRE_HEADER_LEN..question_end]);

    Ok(buffer.octets)
}

/// Find the offset just past the first question, walking the QNAME as
/// a plain label sequence.  Any octet with either of its two high
/// bits set stops the walk: a compressed or reserved-type name cannot
/// be copied verbatim as a question echo.
fn walk_uncompressed_question(raw: &[u8]) -> Result<usize, Error> {
    let mut position = WIRE_HEADER_LEN;

    loop {
        let size = *raw.get(position).ok_or(Error::QuestionIncomplete)?;
        if size & 0b1100_0000 != 0 {
            return Err(Error::QuestionCompressed);
        }

        position += 1 + usize::from(size);
        if size == 0 {
            break;
        }
    }

    // QTYPE and QCLASS
    position += 4;
    if position <= raw.len() {
        Ok(position)
    } else {
        Err(Error::QuestionIncomplete)
    }
}

impl WireHeader {
    /// Write the 12 header octets.
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        self.header.serialise(buffer);
        buffer.write_u16(self.qdcount);
        buffer.write_u16(self.ancount);
        buffer.write_u16(self.nscount);
        buffer.write_u16(self.arcount);
    }
}

impl Header {
    /// Write the ID and flag octets.  The count fields belong to
    /// `WireHeader`.
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        // octet 1
        let flag_qr = if self.is_response { HEADER_MASK_QR } else { 0 };
        let field_opcode = HEADER_MASK_OPCODE & (u8::from(self.opcode) << HEADER_OFFSET_OPCODE);
        let flag_aa = if self.is_authoritative {
            HEADER_MASK_AA
        } else {
            0
        };
        let flag_tc = if self.is_truncated { HEADER_MASK_TC } else { 0 };
        let flag_rd = if self.recursion_desired {
            HEADER_MASK_RD
        } else {
            0
        };
        // octet 2
        let flag_ra = if self.recursion_available {
            HEADER_MASK_RA
        } else {
            0
        };
        let field_z = HEADER_MASK_Z & (self.z << HEADER_OFFSET_Z);
        let field_rcode = HEADER_MASK_RCODE & (u8::from(self.rcode) << HEADER_OFFSET_RCODE);

        buffer.write_u16(self.id);
        buffer.write_u8(flag_qr | field_opcode | flag_aa | flag_tc | flag_rd);
        buffer.write_u8(flag_ra | field_z | field_rcode);
    }
}

impl DomainName {
    /// Write the uncompressed encoding of this name.
    pub fn serialise(&self, buffer: &mut WritableBuffer) {
        buffer.write_octets(&self.octets);
    }
}

/// Errors encountered when synthesising a response.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// Only the five error rcodes may appear in a synthesised
    /// response.
    NotANegativeRcode(Rcode),

    /// The query is shorter than a header.
    HeaderIncomplete,

    /// The question section runs off the end of the query.
    QuestionIncomplete,

    /// The QNAME is compressed (or uses a reserved label type), so
    /// its bytes cannot be echoed as-is.
    QuestionCompressed,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NotANegativeRcode(rcode) => {
                write!(f, "'{rcode}' is not a negative response code")
            }
            Error::HeaderIncomplete => write!(f, "query header incomplete"),
            Error::QuestionIncomplete => write!(f, "question section incomplete"),
            Error::QuestionCompressed => write!(f, "question name is not a plain label sequence"),
        }
    }
}

impl std::error::Error for Error {}

/// A buffer which can be written to, for serialisation purposes.
pub struct WritableBuffer {
    pub octets: Vec<u8>,
}

impl Default for WritableBuffer {
    fn default() -> Self {
        Self {
            octets: Vec::with_capacity(512),
        }
    }
}

impl WritableBuffer {
    pub fn write_u8(&mut self, octet: u8) {
        self.octets.push(octet);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.octets.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_octets(&mut self, octets: &[u8]) {
        self.octets.extend_from_slice(octets);
    }
}
