//! DNS wire format for the captive-portal hijacker.
//!
//! Parses inbound RFC 1035 query datagrams and serializes hijack replies
//! that answer every A/IN question with the access point's own IPv4
//! address. The responder is stateless: each datagram is answered into a
//! caller-provided bounded buffer and nothing is kept between datagrams.
//!
//! # Reply Layout
//!
//! ```text
//! [Header: 12 bytes]    id echoed, QR/AA/RA set, RD copied, counts patched
//! [Question section]    echoed verbatim from the query
//! [Answer 0: 16 bytes]  one per A/IN question
//! ...
//! ```
//!
//! Each answer record is:
//! - `name`: u16 BE — compression pointer to the question's name
//! - `type`: u16 BE — A (1)
//! - `class`: u16 BE — IN (1)
//! - `ttl`: u32 BE — 10 seconds
//! - `rdlength`: u16 BE — 4
//! - `rdata`: `[u8; 4]` — the AP IPv4 address octets

use derive_more::{Display, Error};
use smallvec::SmallVec;
use std::net::Ipv4Addr;

/// Fixed DNS header size in bytes.
pub const HEADER_SIZE: usize = 12;

/// Reply serialization buffer size. 512 bytes covers every expected query;
/// anything beyond is truncated (clients retry over TCP or re-ask).
pub const MAX_REPLY_SIZE: usize = 512;

/// Record type A (IPv4 host address).
pub const TYPE_A: u16 = 1;

/// Record class IN (internet).
pub const CLASS_IN: u16 = 1;

/// TTL for hijack answers, in seconds. Kept short so clients re-resolve
/// promptly once they leave the portal network.
pub const ANSWER_TTL: u32 = 10;

/// Size of one serialized answer record (pointer-compressed name).
const ANSWER_RR_SIZE: usize = 16;

const FLAG_QR: u16 = 0x8000;
const FLAG_OPCODE_MASK: u16 = 0x7800;
const FLAG_AA: u16 = 0x0400;
const FLAG_TC: u16 = 0x0200;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;

/// Maximum assembled name length per RFC 1035.
const MAX_NAME_LEN: usize = 255;

/// Compression pointer chain limit; real questions need one jump at most.
const MAX_POINTER_JUMPS: usize = 8;

/// Errors produced while parsing an inbound DNS datagram.
///
/// The responder drops the datagram on any of these; none of them carry a
/// source error.
#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum WireError {
    /// Datagram shorter than the fixed 12-byte header.
    #[display("datagram too short: {_0} bytes")]
    TooShort(#[error(not(source))] usize),
    /// Ran off the end of the datagram at the given offset.
    #[display("datagram truncated at offset {_0}")]
    Truncated(#[error(not(source))] usize),
    /// Label length with reserved bits (0x40/0x80) at the given offset.
    #[display("invalid label at offset {_0}")]
    InvalidLabel(#[error(not(source))] usize),
    /// Compression pointer chain exceeded the jump limit.
    #[display("name compression loop")]
    CompressionLoop,
    /// Assembled name exceeds 255 bytes.
    #[display("name too long")]
    NameTooLong,
    /// QR bit set or non-zero opcode; only standard queries are answered.
    #[display("not a standard query")]
    NotAQuery,
    /// Header declares zero questions.
    #[display("no questions in query")]
    NoQuestions,
}

/// A single parsed question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    /// Presentation-form name (labels joined with dots), for logging.
    pub name: String,
    /// Question type.
    pub qtype: u16,
    /// Question class.
    pub qclass: u16,
    /// Byte offset of this question's name within the query datagram.
    /// Answer records point here via name compression.
    pub name_offset: usize,
}

impl Question {
    /// Whether this question gets a hijack answer (type A, class IN).
    #[must_use]
    pub fn is_a(&self) -> bool {
        self.qtype == TYPE_A && self.qclass == CLASS_IN
    }
}

/// A parsed query datagram, valid for the lifetime of one UDP receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    /// Transaction id, echoed in the reply.
    pub id: u16,
    /// Raw header flags from the query.
    pub flags: u16,
    /// Parsed questions, in wire order.
    pub questions: SmallVec<[Question; 4]>,
    /// End offset of the question section within the datagram.
    question_end: usize,
}

impl DnsQuery {
    /// Parse a query datagram.
    ///
    /// Accepts standard queries only (QR=0, opcode 0, at least one
    /// question). Name compression in the question section is honoured.
    ///
    /// # Errors
    ///
    /// Any [`WireError`]; the caller is expected to drop the datagram.
    pub fn parse(datagram: &[u8]) -> Result<Self, WireError> {
        if datagram.len() < HEADER_SIZE {
            return Err(WireError::TooShort(datagram.len()));
        }

        let id = u16::from_be_bytes([datagram[0], datagram[1]]);
        let flags = u16::from_be_bytes([datagram[2], datagram[3]]);
        if flags & (FLAG_QR | FLAG_OPCODE_MASK) != 0 {
            return Err(WireError::NotAQuery);
        }

        let qd_count = u16::from_be_bytes([datagram[4], datagram[5]]);
        if qd_count == 0 {
            return Err(WireError::NoQuestions);
        }

        let mut questions = SmallVec::new();
        let mut pos = HEADER_SIZE;
        for _ in 0..qd_count {
            let name_offset = pos;
            let (name, end) = parse_name(datagram, pos)?;
            let fixed = datagram
                .get(end..end + 4)
                .ok_or(WireError::Truncated(end))?;
            let qtype = u16::from_be_bytes([fixed[0], fixed[1]]);
            let qclass = u16::from_be_bytes([fixed[2], fixed[3]]);
            pos = end + 4;
            questions.push(Question {
                name,
                qtype,
                qclass,
                name_offset,
            });
        }

        Ok(Self {
            id,
            flags,
            questions,
            question_end: pos,
        })
    }

    /// Iterator over the questions that will receive a hijack answer.
    pub fn a_questions(&self) -> impl Iterator<Item = &Question> {
        self.questions.iter().filter(|q| q.is_a())
    }
}

/// Parse a name starting at `start`, following compression pointers.
///
/// Returns the presentation-form name and the offset just past the name
/// in the un-jumped byte stream (i.e. where the fixed question fields
/// continue).
fn parse_name(datagram: &[u8], start: usize) -> Result<(String, usize), WireError> {
    let mut name = String::new();
    let mut pos = start;
    let mut end = 0;
    let mut jumped = false;
    let mut jumps = 0;

    loop {
        let len_byte = *datagram.get(pos).ok_or(WireError::Truncated(pos))?;

        if len_byte & 0xC0 == 0xC0 {
            let low = *datagram.get(pos + 1).ok_or(WireError::Truncated(pos + 1))?;
            if !jumped {
                end = pos + 2;
                jumped = true;
            }
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                return Err(WireError::CompressionLoop);
            }
            pos = usize::from(len_byte & 0x3F) << 8 | usize::from(low);
            continue;
        }
        if len_byte & 0xC0 != 0 {
            return Err(WireError::InvalidLabel(pos));
        }
        if len_byte == 0 {
            if !jumped {
                end = pos + 1;
            }
            break;
        }

        let len = usize::from(len_byte);
        let label = datagram
            .get(pos + 1..pos + 1 + len)
            .ok_or(WireError::Truncated(pos))?;
        if name.len() + len + 1 > MAX_NAME_LEN {
            return Err(WireError::NameTooLong);
        }
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(label));
        pos += 1 + len;
    }

    Ok((name, end))
}

/// Compression pointer to a name at `offset`, if representable.
fn name_pointer(offset: usize) -> Option<u16> {
    u16::try_from(offset).ok().filter(|o| *o <= 0x3FFF).map(|o| 0xC000 | o)
}

fn write_header(reply: &mut [u8], id: u16, flags: u16, qd_count: u16, an_count: u16) {
    reply[0..2].copy_from_slice(&id.to_be_bytes());
    reply[2..4].copy_from_slice(&flags.to_be_bytes());
    reply[4..6].copy_from_slice(&qd_count.to_be_bytes());
    reply[6..8].copy_from_slice(&an_count.to_be_bytes());
    reply[8..10].copy_from_slice(&0u16.to_be_bytes());
    reply[10..12].copy_from_slice(&0u16.to_be_bytes());
}

/// Serialize the hijack reply for `query` into `reply`.
///
/// `datagram` must be the buffer `query` was parsed from; its question
/// section is echoed verbatim so the answer pointers stay valid. Every
/// A/IN question gets one answer with RDATA = `ap_ip` and TTL
/// [`ANSWER_TTL`]. A query with no A question yields a reply with zero
/// answer records (one reply per query, always).
///
/// Answers that would overflow the buffer are dropped and the TC bit is
/// set. Returns the number of bytes written.
pub fn build_hijack_reply(
    query: &DnsQuery,
    datagram: &[u8],
    ap_ip: Ipv4Addr,
    reply: &mut [u8; MAX_REPLY_SIZE],
) -> usize {
    let question_bytes = &datagram[HEADER_SIZE..query.question_end];
    let mut flags = FLAG_QR | FLAG_AA | FLAG_RA | (query.flags & FLAG_RD);

    // Question section that cannot be echoed at all: header-only reply.
    if question_bytes.len() > MAX_REPLY_SIZE - HEADER_SIZE {
        write_header(reply, query.id, flags | FLAG_TC, 0, 0);
        return HEADER_SIZE;
    }

    let mut pos = HEADER_SIZE;
    reply[pos..pos + question_bytes.len()].copy_from_slice(question_bytes);
    pos += question_bytes.len();

    let mut answers: u16 = 0;
    for question in query.a_questions() {
        let Some(pointer) = name_pointer(question.name_offset) else {
            continue;
        };
        if pos + ANSWER_RR_SIZE > MAX_REPLY_SIZE {
            flags |= FLAG_TC;
            break;
        }
        reply[pos..pos + 2].copy_from_slice(&pointer.to_be_bytes());
        reply[pos + 2..pos + 4].copy_from_slice(&TYPE_A.to_be_bytes());
        reply[pos + 4..pos + 6].copy_from_slice(&CLASS_IN.to_be_bytes());
        reply[pos + 6..pos + 10].copy_from_slice(&ANSWER_TTL.to_be_bytes());
        reply[pos + 10..pos + 12].copy_from_slice(&4u16.to_be_bytes());
        reply[pos + 12..pos + 16].copy_from_slice(&ap_ip.octets());
        pos += ANSWER_RR_SIZE;
        answers += 1;
    }

    // Question count came from a u16, so the length always fits.
    #[allow(clippy::cast_possible_truncation)]
    let qd_count = query.questions.len() as u16;
    write_header(reply, query.id, flags, qd_count, answers);
    pos
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_name(name: &str) -> Vec<u8> {
        let mut out = Vec::new();
        for label in name.split('.') {
            out.push(u8::try_from(label.len()).expect("label fits"));
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
        out
    }

    fn query_bytes(id: u16, flags: u16, questions: &[(&str, u16, u16)]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(&flags.to_be_bytes());
        out.extend_from_slice(&u16::try_from(questions.len()).expect("fits").to_be_bytes());
        out.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        for (name, qtype, qclass) in questions {
            out.extend_from_slice(&encode_name(name));
            out.extend_from_slice(&qtype.to_be_bytes());
            out.extend_from_slice(&qclass.to_be_bytes());
        }
        out
    }

    const AP: Ipv4Addr = Ipv4Addr::new(192, 168, 4, 1);

    #[test]
    fn parse_single_a_question() {
        let datagram = query_bytes(0x1234, 0x0100, &[("captive.apple.com", TYPE_A, CLASS_IN)]);
        let query = DnsQuery::parse(&datagram).expect("should parse");

        assert_eq!(query.id, 0x1234);
        assert_eq!(query.questions.len(), 1);
        assert_eq!(query.questions[0].name, "captive.apple.com");
        assert_eq!(query.questions[0].qtype, TYPE_A);
        assert_eq!(query.questions[0].qclass, CLASS_IN);
        assert_eq!(query.questions[0].name_offset, HEADER_SIZE);
        assert!(query.questions[0].is_a());
    }

    #[test]
    fn reply_single_a_question() {
        let datagram = query_bytes(0xBEEF, 0x0100, &[("connectivitycheck.gstatic.com", TYPE_A, CLASS_IN)]);
        let query = DnsQuery::parse(&datagram).expect("should parse");

        let mut reply = [0u8; MAX_REPLY_SIZE];
        let len = build_hijack_reply(&query, &datagram, AP, &mut reply);

        // id echoed
        assert_eq!(&reply[0..2], &0xBEEFu16.to_be_bytes());
        // QR set, RD copied from the query
        let flags = u16::from_be_bytes([reply[2], reply[3]]);
        assert_ne!(flags & 0x8000, 0, "QR must be set");
        assert_ne!(flags & 0x0100, 0, "RD must be copied");
        assert_eq!(flags & 0x0200, 0, "TC must not be set");
        // counts: one question, one answer
        assert_eq!(u16::from_be_bytes([reply[4], reply[5]]), 1);
        assert_eq!(u16::from_be_bytes([reply[6], reply[7]]), 1);
        // question echoed verbatim
        let qlen = datagram.len() - HEADER_SIZE;
        assert_eq!(&reply[HEADER_SIZE..HEADER_SIZE + qlen], &datagram[HEADER_SIZE..]);
        // answer record
        let a = HEADER_SIZE + qlen;
        assert_eq!(len, a + 16);
        assert_eq!(&reply[a..a + 2], &0xC00Cu16.to_be_bytes(), "pointer to question name");
        assert_eq!(u16::from_be_bytes([reply[a + 2], reply[a + 3]]), TYPE_A);
        assert_eq!(u16::from_be_bytes([reply[a + 4], reply[a + 5]]), CLASS_IN);
        assert_eq!(
            u32::from_be_bytes([reply[a + 6], reply[a + 7], reply[a + 8], reply[a + 9]]),
            ANSWER_TTL
        );
        assert_eq!(u16::from_be_bytes([reply[a + 10], reply[a + 11]]), 4);
        assert_eq!(&reply[a + 12..a + 16], &AP.octets());
    }

    #[test]
    fn mixed_question_types_answer_a_only() {
        let datagram = query_bytes(
            7,
            0,
            &[
                ("example.com", 28, CLASS_IN), // AAAA
                ("example.com", TYPE_A, CLASS_IN),
                ("example.com", 16, CLASS_IN), // TXT
            ],
        );
        let query = DnsQuery::parse(&datagram).expect("should parse");
        assert_eq!(query.a_questions().count(), 1);

        let mut reply = [0u8; MAX_REPLY_SIZE];
        let len = build_hijack_reply(&query, &datagram, AP, &mut reply);

        // all three questions echoed, exactly one answer
        assert_eq!(u16::from_be_bytes([reply[4], reply[5]]), 3);
        assert_eq!(u16::from_be_bytes([reply[6], reply[7]]), 1);

        // the answer points at the second question's name
        let second_name_offset = query.questions[1].name_offset;
        let a = len - 16;
        let pointer = u16::from_be_bytes([reply[a], reply[a + 1]]);
        assert_eq!(usize::from(pointer & 0x3FFF), second_name_offset);
    }

    #[test]
    fn non_a_query_gets_empty_reply() {
        let datagram = query_bytes(9, 0x0100, &[("example.com", 28, CLASS_IN)]);
        let query = DnsQuery::parse(&datagram).expect("should parse");

        let mut reply = [0u8; MAX_REPLY_SIZE];
        let len = build_hijack_reply(&query, &datagram, AP, &mut reply);

        assert_eq!(len, datagram.len(), "header + echoed question, no answers");
        assert_eq!(u16::from_be_bytes([reply[6], reply[7]]), 0);
        assert_ne!(u16::from_be_bytes([reply[2], reply[3]]) & 0x8000, 0);
    }

    #[test]
    fn compressed_question_name() {
        // Second question's name is a pointer back to the first.
        let mut datagram = query_bytes(3, 0, &[("portal.example", TYPE_A, CLASS_IN)]);
        datagram[4..6].copy_from_slice(&2u16.to_be_bytes()); // QDCOUNT = 2
        let pointer_offset = datagram.len();
        datagram.extend_from_slice(&0xC00Cu16.to_be_bytes());
        datagram.extend_from_slice(&TYPE_A.to_be_bytes());
        datagram.extend_from_slice(&CLASS_IN.to_be_bytes());

        let query = DnsQuery::parse(&datagram).expect("should parse");
        assert_eq!(query.questions.len(), 2);
        assert_eq!(query.questions[1].name, "portal.example");
        assert_eq!(query.questions[1].name_offset, pointer_offset);

        let mut reply = [0u8; MAX_REPLY_SIZE];
        build_hijack_reply(&query, &datagram, AP, &mut reply);
        assert_eq!(u16::from_be_bytes([reply[6], reply[7]]), 2);
    }

    #[test]
    fn response_datagram_rejected() {
        let datagram = query_bytes(1, 0x8180, &[("example.com", TYPE_A, CLASS_IN)]);
        assert_eq!(DnsQuery::parse(&datagram), Err(WireError::NotAQuery));
    }

    #[test]
    fn non_query_opcode_rejected() {
        // Opcode 4 (NOTIFY)
        let datagram = query_bytes(1, 0x2000, &[("example.com", TYPE_A, CLASS_IN)]);
        assert_eq!(DnsQuery::parse(&datagram), Err(WireError::NotAQuery));
    }

    #[test]
    fn short_datagram_rejected() {
        assert_eq!(DnsQuery::parse(&[0u8; 5]), Err(WireError::TooShort(5)));
    }

    #[test]
    fn zero_questions_rejected() {
        let datagram = query_bytes(1, 0, &[]);
        assert_eq!(DnsQuery::parse(&datagram), Err(WireError::NoQuestions));
    }

    #[test]
    fn reserved_label_bits_rejected() {
        let mut datagram = query_bytes(1, 0, &[("x", TYPE_A, CLASS_IN)]);
        datagram[HEADER_SIZE] = 0x40;
        assert_eq!(
            DnsQuery::parse(&datagram),
            Err(WireError::InvalidLabel(HEADER_SIZE))
        );
    }

    #[test]
    fn pointer_loop_rejected() {
        let mut datagram = Vec::new();
        datagram.extend_from_slice(&1u16.to_be_bytes());
        datagram.extend_from_slice(&0u16.to_be_bytes());
        datagram.extend_from_slice(&1u16.to_be_bytes());
        datagram.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        // Name is a pointer to itself.
        datagram.extend_from_slice(&0xC00Cu16.to_be_bytes());
        datagram.extend_from_slice(&TYPE_A.to_be_bytes());
        datagram.extend_from_slice(&CLASS_IN.to_be_bytes());
        assert_eq!(DnsQuery::parse(&datagram), Err(WireError::CompressionLoop));
    }

    #[test]
    fn truncated_question_rejected() {
        let datagram = query_bytes(1, 0, &[("example.com", TYPE_A, CLASS_IN)]);
        let cut = &datagram[..datagram.len() - 3];
        assert!(matches!(
            DnsQuery::parse(cut),
            Err(WireError::Truncated(_))
        ));
    }

    #[test]
    fn overflowing_answers_truncated() {
        // 40 short A questions: the echoed section fits the reply buffer,
        // the full answer set does not.
        let names: Vec<String> = (0..40).map(|i| format!("q{i:02}")).collect();
        let questions: Vec<(&str, u16, u16)> = names
            .iter()
            .map(|n| (n.as_str(), TYPE_A, CLASS_IN))
            .collect();
        let datagram = query_bytes(5, 0, &questions);
        let query = DnsQuery::parse(&datagram).expect("should parse");

        let mut reply = [0u8; MAX_REPLY_SIZE];
        let len = build_hijack_reply(&query, &datagram, AP, &mut reply);

        assert!(len <= MAX_REPLY_SIZE);
        let flags = u16::from_be_bytes([reply[2], reply[3]]);
        assert_ne!(flags & 0x0200, 0, "TC must be set");
        let answers = u16::from_be_bytes([reply[6], reply[7]]);
        assert!(answers > 0 && answers < 40, "partial answer set, got {answers}");
        assert_eq!(usize::from(answers), (MAX_REPLY_SIZE - datagram.len()) / 16);
    }

    #[test]
    fn rd_bit_not_invented() {
        let datagram = query_bytes(2, 0, &[("example.com", TYPE_A, CLASS_IN)]);
        let query = DnsQuery::parse(&datagram).expect("should parse");
        let mut reply = [0u8; MAX_REPLY_SIZE];
        build_hijack_reply(&query, &datagram, AP, &mut reply);
        let flags = u16::from_be_bytes([reply[2], reply[3]]);
        assert_eq!(flags & 0x0100, 0, "RD must not be set when the query lacks it");
    }
}
