use bytes::Bytes;
use std::fmt;

/// Maximum encoded length of a domain name: length octets plus label
/// octets plus the terminating zero.
pub const DOMAINNAME_MAX_LEN: usize = 255;

/// Maximum length of a single label in a domain name.
pub const LABEL_MAX_LEN: usize = 63;

/// Length of the fixed header at the start of every message.
pub const WIRE_HEADER_LEN: usize = 12;

/// Octet mask for the QR flag being set (response).
pub const HEADER_MASK_QR: u8 = 0b1000_0000;

/// Octet mask for the opcode field.
pub const HEADER_MASK_OPCODE: u8 = 0b0111_1000;

/// Offset for the opcode field.
pub const HEADER_OFFSET_OPCODE: usize = 3;

/// Octet mask for the AA flag being set (authoritative)
pub const HEADER_MASK_AA: u8 = 0b0000_0100;

/// Octet mask for the TC flag being set (truncated)
pub const HEADER_MASK_TC: u8 = 0b0000_0010;

/// Octet mask for the RD flag being set (desired)
pub const HEADER_MASK_RD: u8 = 0b0000_0001;

/// Octet mask for the RA flag being set (available)
pub const HEADER_MASK_RA: u8 = 0b1000_0000;

/// Octet mask for the reserved Z bits.
pub const HEADER_MASK_Z: u8 = 0b0111_0000;

/// Offset for the reserved Z bits.
pub const HEADER_OFFSET_Z: usize = 4;

/// Octet mask for the rcode field.
pub const HEADER_MASK_RCODE: u8 = 0b0000_1111;

/// Offset for the rcode field.
pub const HEADER_OFFSET_RCODE: usize = 0;

/// A query as this service sees it: the header, the questions, and a
/// retained copy of the datagram the questions were decoded from.
///
/// ```text
///     +---------------------+
///     |        Header       |
///     +---------------------+
///     |       Question      | the question for the name server
///     +---------------------+
///     |        Answer       | RRs answering the question
///     +---------------------+
///     |      Authority      | RRs pointing toward an authority
///     +---------------------+
///     |      Additional     | RRs holding additional information
///     +---------------------+
/// ```
///
/// See section 4.1 of RFC 1035.  The answer, authority, and additional
/// sections are never decoded here: on the query path they carry no
/// meaning for a forwarder, and on the answer path the upstream's
/// bytes are passed through untouched.
///
/// The retained bytes are the authoritative source for the question
/// section when a response is synthesised: the client's exact QNAME
/// encoding must be echoed, and re-encoding the decoded name would
/// lose case and other byte-level detail.  The decoded questions are
/// used for classification and logging only.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub raw: Bytes,
}

impl Message {
    /// The question this service acts on.  Messages carrying more
    /// than one question have only their first considered.
    pub fn first_question(&self) -> Option<&Question> {
        self.questions.first()
    }
}

/// Common header type for all messages.
///
/// ```text
///                                     1  1  1  1  1  1
///       0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                      ID                       |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |QR|   Opcode  |AA|TC|RD|RA|   Z    |   RCODE   |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                    QDCOUNT                    |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                    ANCOUNT                    |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                    NSCOUNT                    |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                    ARCOUNT                    |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
/// ```
///
/// See section 4.1.1 of RFC 1035.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Header {
    /// A 16 bit identifier assigned by the program that generates any
    /// kind of query.  This identifier is copied into the
    /// corresponding reply and can be used by the requester to match
    /// up replies to outstanding queries.
    pub id: u16,

    /// A one bit field that specifies whether this message is a query
    /// (0), or a response (1).
    pub is_response: bool,

    /// A four bit field that specifies the kind of query in this
    /// message.  Decoded verbatim: no opcode validation happens at
    /// parse time.
    pub opcode: Opcode,

    /// Authoritative Answer - this bit is valid in responses, and
    /// specifies that the responding name server is an authority for
    /// the domain name in question section.
    pub is_authoritative: bool,

    /// TrunCation - specifies that this message was truncated due to
    /// length greater than that permitted on the transmission
    /// channel.
    pub is_truncated: bool,

    /// Recursion Desired - this bit may be set in a query and is
    /// copied into the response.
    pub recursion_desired: bool,

    /// Recursion Available - this bit is set or cleared in a
    /// response, and denotes whether recursive query support is
    /// available in the name server.
    pub recursion_available: bool,

    /// The three reserved bits, preserved verbatim so that a decoded
    /// header re-encodes to the same octets.  Always zero in
    /// responses built by this service.
    pub z: u8,

    /// Response code - this 4 bit field is set as part of responses.
    pub rcode: Rcode,
}

/// A `Header` as it appears on the network.  This type is used for
/// serialisation and deserialisation only: including the count fields
/// in the normal `Header` type would require ensuring those values
/// are correct.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct WireHeader {
    /// The header that will be persisted to / is taken from the
    /// `Message`.
    pub header: Header,

    /// an unsigned 16 bit integer specifying the number of entries in
    /// the question section.
    pub qdcount: u16,

    /// an unsigned 16 bit integer specifying the number of resource
    /// records in the answer section.
    pub ancount: u16,

    /// an unsigned 16 bit integer specifying the number of name
    /// server resource records in the authority records section.
    pub nscount: u16,

    /// an unsigned 16 bit integer specifying the number of
    /// resource records in the additional records section.
    pub arcount: u16,
}

/// A single entry from the question section.
///
/// ```text
///                                     1  1  1  1  1  1
///       0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                                               |
///     /                     QNAME                     /
///     /                                               /
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                     QTYPE                     |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                     QCLASS                    |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
/// ```
///
/// See section 4.1.2 of RFC 1035.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Question {
    /// a domain name represented as a sequence of labels, where each
    /// label consists of a length octet followed by that number of
    /// octets.
    pub name: DomainName,

    /// a two octet code which specifies the type of the query.
    pub qtype: QueryType,

    /// a two octet code that specifies the class of the query.  For
    /// example, the QCLASS field is IN for the Internet.
    pub qclass: QueryClass,
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.name.to_dotted_string(),
            self.qclass,
            self.qtype
        )
    }
}

/// What sort of query this is.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Opcode {
    Standard,
    Inverse,
    Status,
    Reserved(OpcodeReserved),
}

/// A struct with a private constructor, to ensure invalid `Opcode`s
/// cannot be created.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct OpcodeReserved(u8);

impl From<u8> for Opcode {
    fn from(octet: u8) -> Self {
        match octet & 0b0000_1111 {
            0 => Opcode::Standard,
            1 => Opcode::Inverse,
            2 => Opcode::Status,
            other => Opcode::Reserved(OpcodeReserved(other)),
        }
    }
}

impl From<Opcode> for u8 {
    fn from(value: Opcode) -> Self {
        match value {
            Opcode::Standard => 0,
            Opcode::Inverse => 1,
            Opcode::Status => 2,
            Opcode::Reserved(OpcodeReserved(octet)) => octet,
        }
    }
}

/// What sort of response this is.
///
/// Responses synthesised by this service only ever carry the five
/// error codes; `NoError` answers come from the upstream and are
/// never built locally.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Rcode {
    NoError,
    FormatError,
    ServerFailure,
    NameError,
    NotImplemented,
    Refused,
    Reserved(RcodeReserved),
}

/// A struct with a private constructor, to ensure invalid `Rcode`s
/// cannot be created.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RcodeReserved(u8);

impl Rcode {
    /// True for the rcodes a synthesised negative response may carry.
    pub fn is_negative(self) -> bool {
        matches!(
            self,
            Rcode::FormatError
                | Rcode::ServerFailure
                | Rcode::NameError
                | Rcode::NotImplemented
                | Rcode::Refused
        )
    }
}

impl fmt::Display for Rcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Rcode::NoError => write!(f, "NOERROR"),
            Rcode::FormatError => write!(f, "FORMERR"),
            Rcode::ServerFailure => write!(f, "SERVFAIL"),
            Rcode::NameError => write!(f, "NXDOMAIN"),
            Rcode::NotImplemented => write!(f, "NOTIMPL"),
            Rcode::Refused => write!(f, "REFUSED"),
            Rcode::Reserved(RcodeReserved(n)) => write!(f, "RESERVED({n})"),
        }
    }
}

impl From<u8> for Rcode {
    fn from(octet: u8) -> Self {
        match octet & 0b0000_1111 {
            0 => Rcode::NoError,
            1 => Rcode::FormatError,
            2 => Rcode::ServerFailure,
            3 => Rcode::NameError,
            4 => Rcode::NotImplemented,
            5 => Rcode::Refused,
            other => Rcode::Reserved(RcodeReserved(other)),
        }
    }
}

impl From<Rcode> for u8 {
    fn from(value: Rcode) -> Self {
        match value {
            Rcode::NoError => 0,
            Rcode::FormatError => 1,
            Rcode::ServerFailure => 2,
            Rcode::NameError => 3,
            Rcode::NotImplemented => 4,
            Rcode::Refused => 5,
            Rcode::Reserved(RcodeReserved(octet)) => octet,
        }
    }
}

/// A domain name is a sequence of labels, where each label is a
/// length octet followed by that number of octets.
///
/// `octets` is the complete uncompressed wire encoding, including the
/// terminating zero; `labels` holds the label octets with the length
/// prefixes stripped and with no trailing empty label.  Label case is
/// preserved as decoded; lowercasing for filter lookup is the
/// caller's concern.
///
/// A label must be 63 octets or shorter.  A name must be 255 octets
/// or shorter in its encoded form, including both length and label
/// octets.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DomainName {
    pub octets: Vec<u8>,
    pub labels: Vec<Vec<u8>>,
}

impl DomainName {
    pub fn root_domain() -> Self {
        DomainName {
            octets: vec![0],
            labels: Vec::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.labels.is_empty()
    }

    /// The dot-separated form of this name, with no trailing dot.
    /// The root domain renders as the empty string.
    pub fn to_dotted_string(&self) -> String {
        let mut out = String::with_capacity(self.octets.len());
        let mut first = true;
        for label in &self.labels {
            if first {
                first = false;
            } else {
                out.push('.');
            }
            for octet in label {
                out.push(*octet as char);
            }
        }

        out
    }

    /// Parse a dot-separated name.  A single trailing dot is accepted
    /// and ignored; the empty string is the root.  Label bytes are
    /// taken as given.
    pub fn from_dotted_string(s: &str) -> Option<Self> {
        if s.is_empty() || s == "." {
            return Some(Self::root_domain());
        }

        let stripped = s.strip_suffix('.').unwrap_or(s);
        let labels = stripped
            .split('.')
            .map(|label| label.as_bytes().to_vec())
            .collect();

        Self::from_labels(labels)
    }

    /// Build a name from its labels, validating the label and name
    /// length limits.  Empty labels are rejected: the root is the
    /// empty label *sequence*, not a sequence of empty labels.
    pub fn from_labels(labels: Vec<Vec<u8>>) -> Option<Self> {
        let mut octets = Vec::<u8>::with_capacity(DOMAINNAME_MAX_LEN);

        for label in &labels {
            if label.is_empty() || label.len() > LABEL_MAX_LEN {
                return None;
            }

            if let Ok(n) = u8::try_from(label.len()) {
                octets.push(n);
                octets.extend_from_slice(label);
            } else {
                return None;
            }
        }
        octets.push(0);

        if octets.len() <= DOMAINNAME_MAX_LEN {
            Some(Self { octets, labels })
        } else {
            None
        }
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_dotted_string())
    }
}

impl fmt::Debug for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainName")
            .field("to_dotted_string()", &self.to_dotted_string())
            .finish()
    }
}

/// Query types.  Only `A` is served by this forwarder; the rest are
/// decoded so the decision can be logged meaningfully.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum QueryType {
    A,
    NS,
    CNAME,
    SOA,
    PTR,
    MX,
    TXT,
    AAAA,
    Unknown(QueryTypeUnknown),
}

/// A struct with a private constructor, to ensure invalid
/// `QueryType`s cannot be created.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct QueryTypeUnknown(u16);

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            QueryType::A => write!(f, "A"),
            QueryType::NS => write!(f, "NS"),
            QueryType::CNAME => write!(f, "CNAME"),
            QueryType::SOA => write!(f, "SOA"),
            QueryType::PTR => write!(f, "PTR"),
            QueryType::MX => write!(f, "MX"),
            QueryType::TXT => write!(f, "TXT"),
            QueryType::AAAA => write!(f, "AAAA"),
            QueryType::Unknown(QueryTypeUnknown(n)) => write!(f, "{n}"),
        }
    }
}

impl From<u16> for QueryType {
    fn from(value: u16) -> Self {
        match value {
            1 => QueryType::A,
            2 => QueryType::NS,
            5 => QueryType::CNAME,
            6 => QueryType::SOA,
            12 => QueryType::PTR,
            15 => QueryType::MX,
            16 => QueryType::TXT,
            28 => QueryType::AAAA,
            _ => QueryType::Unknown(QueryTypeUnknown(value)),
        }
    }
}

impl From<QueryType> for u16 {
    fn from(value: QueryType) -> Self {
        match value {
            QueryType::A => 1,
            QueryType::NS => 2,
            QueryType::CNAME => 5,
            QueryType::SOA => 6,
            QueryType::PTR => 12,
            QueryType::MX => 15,
            QueryType::TXT => 16,
            QueryType::AAAA => 28,
            QueryType::Unknown(QueryTypeUnknown(value)) => value,
        }
    }
}

/// Query classes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum QueryClass {
    IN,
    Unknown(QueryClassUnknown),
}

/// A struct with a private constructor, to ensure invalid
/// `QueryClass`es cannot be created.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct QueryClassUnknown(u16);

impl fmt::Display for QueryClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            QueryClass::IN => write!(f, "IN"),
            QueryClass::Unknown(QueryClassUnknown(n)) => write!(f, "{n}"),
        }
    }
}

impl From<u16> for QueryClass {
    fn from(value: u16) -> Self {
        match value {
            1 => QueryClass::IN,
            _ => QueryClass::Unknown(QueryClassUnknown(value)),
        }
    }
}

impl From<QueryClass> for u16 {
    fn from(value: QueryClass) -> Self {
        match value {
            QueryClass::IN => 1,
            QueryClass::Unknown(QueryClassUnknown(value)) => value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u8_opcode_roundtrip() {
        for i in 0..15 {
            assert_eq!(u8::from(Opcode::from(i)), i);
        }
    }

    #[test]
    fn u8_rcode_roundtrip() {
        for i in 0..15 {
            assert_eq!(u8::from(Rcode::from(i)), i);
        }
    }

    #[test]
    fn u16_querytype_roundtrip() {
        for i in 0..100 {
            assert_eq!(u16::from(QueryType::from(i)), i);
        }
    }

    #[test]
    fn u16_queryclass_roundtrip() {
        for i in 0..100 {
            assert_eq!(u16::from(QueryClass::from(i)), i);
        }
    }

    #[test]
    fn negative_rcodes() {
        for i in 0..=15u8 {
            let rcode = Rcode::from(i);
            assert_eq!((1..=5).contains(&i), rcode.is_negative());
        }
    }

    #[test]
    fn domainname_root_conversions() {
        assert_eq!(
            Some(DomainName::root_domain()),
            DomainName::from_dotted_string("")
        );

        assert_eq!(
            Some(DomainName::root_domain()),
            DomainName::from_dotted_string(".")
        );

        assert_eq!("", DomainName::root_domain().to_dotted_string());
    }

    #[test]
    fn domainname_conversions() {
        for name in ["example.com", "www.example.com", "a.b.c.d.e"] {
            let parsed = DomainName::from_dotted_string(name).unwrap();
            assert_eq!(name, parsed.to_dotted_string());

            let trailing = format!("{name}.");
            let parsed = DomainName::from_dotted_string(&trailing).unwrap();
            assert_eq!(name, parsed.to_dotted_string());
        }
    }

    #[test]
    fn domainname_preserves_case() {
        let parsed = DomainName::from_dotted_string("WwW.Example.COM").unwrap();
        assert_eq!("WwW.Example.COM", parsed.to_dotted_string());
    }

    #[test]
    fn domainname_wire_octets() {
        let parsed = DomainName::from_dotted_string("www.example.com").unwrap();
        assert_eq!(
            vec![
                3, b'w', b'w', b'w', 7, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 3, b'c', b'o',
                b'm', 0
            ],
            parsed.octets
        );
    }

    #[test]
    fn from_labels_rejects_invalid() {
        assert_eq!(None, DomainName::from_labels(vec![Vec::new()]));
        assert_eq!(None, DomainName::from_labels(vec![vec![b'x'; 64]]));

        // 4 labels of 63 octets encode to 4 * 64 + 1 = 257 octets
        assert_eq!(None, DomainName::from_labels(vec![vec![b'x'; 63]; 4]));
    }

    #[test]
    fn from_dotted_string_rejects_empty_labels() {
        assert_eq!(None, DomainName::from_dotted_string("a..b"));
        assert_eq!(None, DomainName::from_dotted_string(".a"));
    }
}
