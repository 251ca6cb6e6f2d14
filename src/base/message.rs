//! Parsing and rendering of DNS messages.
//!
//! The main type of this module is [`ParsedMessage`]. It is a reusable
//! message object: a request is parsed into it, the very same object is then
//! turned into a reply skeleton via [`ParsedMessage::reply`], filled with
//! records, and rendered into a send buffer. Between requests the object is
//! [`reset`][ParsedMessage::reset] rather than dropped so that its section
//! vectors keep their allocations.
//!
//! Only as much of the message structure is interpreted as is needed to
//! route a request: the header, the question section, the OPT pseudo-record
//! and a trailing transaction signature. All other record data is kept as
//! opaque octets.

use core::{fmt, str};

use bytes::{BufMut, BytesMut};

use super::header::{Header, HeaderCounts};
use super::iana::{Class, Opcode, OptRcode, Rtype};

//------------ Name ----------------------------------------------------------

/// An uncompressed domain name in wire format.
///
/// Names compare case-insensitively.
#[derive(Clone)]
pub struct Name(Vec<u8>);

impl Name {
    /// The maximum length of a name in wire format.
    pub const MAX_LEN: usize = 255;

    /// Returns the root name.
    pub fn root() -> Self {
        Name(vec![0])
    }

    /// Returns whether this is the root name.
    pub fn is_root(&self) -> bool {
        self.0 == [0]
    }

    /// Returns the wire format octets of the name.
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Returns the length of the name in wire format.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns whether the name is empty. It never is.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parses a possibly compressed name starting at `pos` in `msg`.
    ///
    /// Returns the name and the position right after it. Compression
    /// pointers must point strictly backwards, which also rules out loops.
    fn parse(msg: &[u8], mut pos: usize) -> Result<(Self, usize), ParseError> {
        let mut res = Vec::new();
        let mut end = None;
        let mut limit = pos;
        loop {
            let len = *msg.get(pos).ok_or(ParseError::ShortMessage)?;
            match len & 0xC0 {
                0x00 if len == 0 => {
                    res.push(0);
                    return Ok((Name(res), end.unwrap_or(pos + 1)));
                }
                0x00 => {
                    let len = usize::from(len);
                    let label = msg
                        .get(pos + 1..pos + 1 + len)
                        .ok_or(ParseError::ShortMessage)?;
                    if res.len() + len + 2 > Self::MAX_LEN {
                        return Err(ParseError::BadName);
                    }
                    res.push(len as u8);
                    res.extend_from_slice(label);
                    pos += len + 1;
                }
                0xC0 => {
                    let low = *msg.get(pos + 1).ok_or(ParseError::ShortMessage)?;
                    let target = (usize::from(len & 0x3F) << 8) | usize::from(low);
                    if end.is_none() {
                        end = Some(pos + 2);
                    }
                    if target >= limit {
                        return Err(ParseError::BadName);
                    }
                    limit = target;
                    pos = target;
                }
                _ => return Err(ParseError::BadName),
            }
        }
    }
}

//--- FromStr

impl str::FromStr for Name {
    type Err = ParseError;

    /// Converts a name in dotted presentation format.
    ///
    /// Escape sequences are not supported.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_suffix('.').unwrap_or(s);
        let mut res = Vec::new();
        if !s.is_empty() {
            for label in s.split('.') {
                if label.is_empty() || label.len() > 63 {
                    return Err(ParseError::BadName);
                }
                res.push(label.len() as u8);
                res.extend_from_slice(label.as_bytes());
            }
        }
        res.push(0);
        if res.len() > Self::MAX_LEN {
            return Err(ParseError::BadName);
        }
        Ok(Name(res))
    }
}

//--- PartialEq and Eq

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for Name {}

//--- Display and Debug

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return f.write_str(".");
        }
        let mut pos = 0;
        while let Some(&len) = self.0.get(pos) {
            if len == 0 {
                break;
            }
            let label = &self.0[pos + 1..pos + 1 + usize::from(len)];
            for &ch in label {
                if ch.is_ascii_graphic() && ch != b'.' && ch != b'\\' {
                    write!(f, "{}", ch as char)?;
                } else {
                    write!(f, "\\{:03}", ch)?;
                }
            }
            f.write_str(".")?;
            pos += usize::from(len) + 1;
        }
        Ok(())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({})", self)
    }
}

//------------ Question ------------------------------------------------------

/// A question: the name, type and class being asked for.
///
/// In UPDATE messages the question section holds the zone.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Question {
    pub qname: Name,
    pub qtype: Rtype,
    pub qclass: Class,
}

impl Question {
    pub fn new(qname: Name, qtype: Rtype, qclass: Class) -> Self {
        Question {
            qname,
            qtype,
            qclass,
        }
    }

    fn wire_len(&self) -> usize {
        self.qname.len() + 4
    }

    fn compose(&self, target: &mut BytesMut) {
        target.put_slice(self.qname.as_slice());
        target.put_u16(self.qtype.to_int());
        target.put_u16(self.qclass.to_int());
    }
}

//------------ Record --------------------------------------------------------

/// A resource record with opaque record data.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Record {
    pub owner: Name,
    pub rtype: Rtype,
    pub class: Class,
    pub ttl: u32,
    pub data: Vec<u8>,
}

impl Record {
    pub fn new(
        owner: Name,
        rtype: Rtype,
        class: Class,
        ttl: u32,
        data: Vec<u8>,
    ) -> Self {
        Record {
            owner,
            rtype,
            class,
            ttl,
            data,
        }
    }

    fn wire_len(&self) -> usize {
        self.owner.len() + 10 + self.data.len()
    }

    fn compose(&self, target: &mut BytesMut) {
        target.put_slice(self.owner.as_slice());
        target.put_u16(self.rtype.to_int());
        target.put_u16(self.class.to_int());
        target.put_u32(self.ttl);
        // Record data is bounded by the render limit which never exceeds
        // 65535 octets.
        target.put_u16(self.data.len() as u16);
        target.put_slice(&self.data);
    }
}

//------------ Opt -----------------------------------------------------------

/// The content of an OPT pseudo-record.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Opt {
    /// The UDP payload size the sender is able to receive.
    pub udp_payload_size: u16,

    /// The upper eight bits of the extended response code.
    pub ext_rcode: u8,

    /// The EDNS version.
    pub version: u8,

    /// Whether the sender wants DNSSEC records.
    pub dnssec_ok: bool,

    /// The options in wire format.
    pub options: Vec<u8>,
}

impl Opt {
    /// Creates a version 0 OPT record advertising the given payload size.
    pub fn new(udp_payload_size: u16) -> Self {
        Opt {
            udp_payload_size,
            ..Default::default()
        }
    }

    fn from_record(record: Record) -> Result<Self, ParseError> {
        if !record.owner.is_root() {
            return Err(ParseError::BadOpt);
        }
        Ok(Opt {
            udp_payload_size: record.class.to_int(),
            ext_rcode: (record.ttl >> 24) as u8,
            version: (record.ttl >> 16) as u8,
            dnssec_ok: record.ttl & 0x8000 != 0,
            options: record.data,
        })
    }

    fn wire_len(&self) -> usize {
        11 + self.options.len()
    }

    fn compose(&self, ext_rcode: u8, target: &mut BytesMut) {
        let mut ttl =
            (u32::from(ext_rcode) << 24) | (u32::from(self.version) << 16);
        if self.dnssec_ok {
            ttl |= 0x8000;
        }
        target.put_u8(0);
        target.put_u16(Rtype::OPT.to_int());
        target.put_u16(self.udp_payload_size);
        target.put_u32(ttl);
        target.put_u16(self.options.len() as u16);
        target.put_slice(&self.options);
    }
}

//------------ ParsedMessage -------------------------------------------------

/// A reusable DNS message.
///
/// The object is either holding a parsed request, a reply under
/// construction derived from that request, or nothing at all after a
/// [`reset`][Self::reset].
#[derive(Clone, Debug, Default)]
pub struct ParsedMessage {
    header: Header,
    counts: HeaderCounts,

    /// At least the ID and flags could be read.
    header_valid: bool,

    /// The complete question section could be read.
    question_valid: bool,

    question: Vec<Question>,
    answer: Vec<Record>,
    authority: Vec<Record>,
    additional: Vec<Record>,

    /// The OPT record of the parsed message.
    opt: Option<Opt>,

    /// The trailing TSIG or SIG(0) record of the parsed message.
    signature: Option<Record>,

    /// The full response code of a reply.
    rcode: OptRcode,

    /// The OPT record to include when rendering.
    outgoing_opt: Option<Opt>,
}

/// # Creation and Reuse
///
impl ParsedMessage {
    /// Creates a new, empty message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query for a single question.
    pub fn query(id: u16, question: Question) -> Self {
        let mut res = Self::new();
        res.header.set_id(id);
        res.header_valid = true;
        res.question_valid = true;
        res.question.push(question);
        res
    }

    /// Returns the message to its empty state and keeps its allocations.
    ///
    /// This does not release the object. It is called between two requests
    /// handled by the same client so that the next [`parse`][Self::parse]
    /// starts from a clean slate.
    pub fn reset(&mut self) {
        self.header = Header::new();
        self.counts = HeaderCounts::new();
        self.header_valid = false;
        self.question_valid = false;
        self.question.clear();
        self.answer.clear();
        self.authority.clear();
        self.additional.clear();
        self.opt = None;
        self.signature = None;
        self.rcode = OptRcode::NOERROR;
        self.outgoing_opt = None;
    }
}

/// # Parsing
///
impl ParsedMessage {
    /// Parses a complete message from `msg`.
    ///
    /// The message is reset first. Parsing proceeds section by section. If
    /// an error happens, whatever could be read remains accessible. In
    /// particular, [`header_valid`][Self::header_valid] and
    /// [`question_valid`][Self::question_valid] tell whether a reply can be
    /// formed.
    pub fn parse(&mut self, msg: &[u8]) -> Result<(), ParseError> {
        self.reset();
        self.header = Header::from_message_slice(msg).ok_or(ParseError::ShortHeader)?;
        self.header_valid = true;
        self.counts = HeaderCounts::from_message_slice(msg).ok_or(ParseError::ShortHeader)?;

        let mut pos = 12;
        for _ in 0..self.counts.qdcount() {
            let (qname, next) = Name::parse(msg, pos)?;
            let qtype = read_u16(msg, next)?;
            let qclass = read_u16(msg, next + 2)?;
            self.question
                .push(Question::new(qname, qtype.into(), qclass.into()));
            pos = next + 4;
        }
        self.question_valid = true;

        for _ in 0..self.counts.ancount() {
            let (record, next) = parse_record(msg, pos)?;
            self.answer.push(record);
            pos = next;
        }
        for _ in 0..self.counts.nscount() {
            let (record, next) = parse_record(msg, pos)?;
            self.authority.push(record);
            pos = next;
        }
        let arcount = self.counts.arcount();
        for i in 0..arcount {
            let (record, next) = parse_record(msg, pos)?;
            pos = next;
            if record.rtype == Rtype::OPT {
                if self.opt.is_some() {
                    return Err(ParseError::BadOpt);
                }
                self.opt = Some(Opt::from_record(record)?);
            } else if record.rtype == Rtype::TSIG || record.rtype == Rtype::SIG {
                if i + 1 != arcount {
                    return Err(ParseError::BadSignature);
                }
                self.signature = Some(record);
            } else {
                self.additional.push(record);
            }
        }

        if pos != msg.len() {
            return Err(ParseError::TrailingData);
        }
        Ok(())
    }

    /// Returns whether the ID and flags of the message are known.
    pub fn header_valid(&self) -> bool {
        self.header_valid
    }

    /// Returns whether the question section was read completely.
    pub fn question_valid(&self) -> bool {
        self.question_valid
    }
}

/// # Access
///
impl ParsedMessage {
    pub fn header(&self) -> Header {
        self.header
    }

    pub fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    pub fn counts(&self) -> HeaderCounts {
        self.counts
    }

    pub fn opcode(&self) -> Opcode {
        self.header.opcode()
    }

    pub fn question(&self) -> &[Question] {
        &self.question
    }

    pub fn first_question(&self) -> Option<&Question> {
        self.question.first()
    }

    /// Returns the class of the message.
    ///
    /// This is the class of the first question or zone record. Messages
    /// without one don't have a class.
    pub fn class(&self) -> Option<Class> {
        self.first_question().map(|q| q.qclass)
    }

    pub fn answer(&self) -> &[Record] {
        &self.answer
    }

    pub fn authority(&self) -> &[Record] {
        &self.authority
    }

    pub fn additional(&self) -> &[Record] {
        &self.additional
    }

    /// Returns the OPT record of the parsed message.
    pub fn opt(&self) -> Option<&Opt> {
        self.opt.as_ref()
    }

    /// Returns the transaction signature of the parsed message.
    pub fn signature(&self) -> Option<&Record> {
        self.signature.as_ref()
    }

    /// Returns the response code set for rendering.
    pub fn rcode(&self) -> OptRcode {
        self.rcode
    }
}

/// # Building Replies
///
impl ParsedMessage {
    /// Turns the parsed request into a reply skeleton.
    ///
    /// The ID, opcode and the RD and CD flags are kept, QR is set, and all
    /// record sections are emptied. The question section is kept only if
    /// `with_question` is true and the opcode is QUERY or NOTIFY.
    pub fn reply(&mut self, with_question: bool) -> Result<(), ReplyError> {
        if !self.header_valid {
            return Err(ReplyError::NoHeader);
        }
        let with_question = with_question
            && (self.opcode() == Opcode::QUERY || self.opcode() == Opcode::NOTIFY);
        if with_question && !self.question_valid {
            return Err(ReplyError::BadQuestion);
        }

        let mut header = Header::new();
        header.set_id(self.header.id());
        header.set_opcode(self.header.opcode());
        header.set_rd(self.header.rd());
        header.set_cd(self.header.cd());
        header.set_qr(true);
        self.header = header;

        if !with_question {
            self.question.clear();
        }
        self.answer.clear();
        self.authority.clear();
        self.additional.clear();
        self.signature = None;
        self.rcode = OptRcode::NOERROR;
        self.outgoing_opt = None;
        Ok(())
    }

    /// Sets the response code.
    ///
    /// Extended codes need an outgoing OPT record to be rendered fully.
    pub fn set_rcode(&mut self, rcode: OptRcode) {
        self.rcode = rcode;
        self.header.set_rcode(rcode.rcode());
    }

    /// Sets the OPT record rendered with the message.
    pub fn set_outgoing_opt(&mut self, opt: Option<Opt>) {
        self.outgoing_opt = opt;
    }

    pub fn outgoing_opt(&self) -> Option<&Opt> {
        self.outgoing_opt.as_ref()
    }

    pub fn push_question(&mut self, question: Question) {
        self.question.push(question);
    }

    pub fn push_answer(&mut self, record: Record) {
        self.answer.push(record);
    }

    pub fn push_authority(&mut self, record: Record) {
        self.authority.push(record);
    }

    pub fn push_additional(&mut self, record: Record) {
        self.additional.push(record);
    }
}

/// # Rendering
///
impl ParsedMessage {
    /// Appends the wire format of the message to `target`.
    ///
    /// At most `limit` octets are appended. Room for the outgoing OPT
    /// record is reserved up front. If a question or record does not fit,
    /// it and everything after it is left out and the TC flag is set.
    ///
    /// Returns whether the message was truncated.
    pub fn render(
        &self,
        limit: usize,
        target: &mut BytesMut,
    ) -> Result<bool, RenderError> {
        let start = target.len();
        let opt_len = self.outgoing_opt.as_ref().map_or(0, Opt::wire_len);
        if 12 + opt_len > limit {
            return Err(RenderError::NoSpace);
        }
        let budget = start + limit - opt_len;
        target.put_slice(&[0; 12]);

        let mut counts = HeaderCounts::new();
        let mut truncated = false;

        let mut qdcount = 0u16;
        for question in &self.question {
            if target.len() + question.wire_len() > budget {
                truncated = true;
                break;
            }
            question.compose(target);
            qdcount += 1;
        }
        counts.set_qdcount(qdcount);

        let mut section_counts = [0u16; 3];
        let sections = [&self.answer, &self.authority, &self.additional];
        for (section, count) in sections.iter().zip(section_counts.iter_mut()) {
            if truncated {
                break;
            }
            for record in section.iter() {
                if target.len() + record.wire_len() > budget {
                    truncated = true;
                    break;
                }
                record.compose(target);
                *count += 1;
            }
        }
        counts.set_ancount(section_counts[0]);
        counts.set_nscount(section_counts[1]);

        let mut arcount = section_counts[2];
        if let Some(opt) = self.outgoing_opt.as_ref() {
            opt.compose(self.rcode.ext(), target);
            arcount += 1;
        }
        counts.set_arcount(arcount);

        let mut header = self.header;
        header.set_tc(truncated);
        target[start..start + 4].copy_from_slice(header.as_slice());
        target[start + 4..start + 12].copy_from_slice(&counts.to_bytes());
        Ok(truncated)
    }
}

//------------ Helper Functions ----------------------------------------------

fn read_u16(msg: &[u8], pos: usize) -> Result<u16, ParseError> {
    let s = msg.get(pos..pos + 2).ok_or(ParseError::ShortMessage)?;
    Ok(u16::from_be_bytes([s[0], s[1]]))
}

fn read_u32(msg: &[u8], pos: usize) -> Result<u32, ParseError> {
    let s = msg.get(pos..pos + 4).ok_or(ParseError::ShortMessage)?;
    Ok(u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
}

fn parse_record(msg: &[u8], pos: usize) -> Result<(Record, usize), ParseError> {
    let (owner, pos) = Name::parse(msg, pos)?;
    let rtype = read_u16(msg, pos)?;
    let class = read_u16(msg, pos + 2)?;
    let ttl = read_u32(msg, pos + 4)?;
    let rdlen = usize::from(read_u16(msg, pos + 8)?);
    let data = msg
        .get(pos + 10..pos + 10 + rdlen)
        .ok_or(ParseError::ShortMessage)?;
    let record =
        Record::new(owner, rtype.into(), class.into(), ttl, data.to_vec());
    Ok((record, pos + 10 + rdlen))
}

//============ Error Types ===================================================

//------------ ParseError ----------------------------------------------------

/// A message could not be parsed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParseError {
    /// The message is shorter than the header.
    ShortHeader,

    /// The message ended in the middle of a section.
    ShortMessage,

    /// A domain name was malformed.
    BadName,

    /// The OPT record was malformed or duplicated.
    BadOpt,

    /// A transaction signature was not the last record.
    BadSignature,

    /// There was data after the last record.
    TrailingData,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            ParseError::ShortHeader => "short header",
            ParseError::ShortMessage => "unexpected end of message",
            ParseError::BadName => "malformed domain name",
            ParseError::BadOpt => "malformed OPT record",
            ParseError::BadSignature => "misplaced signature record",
            ParseError::TrailingData => "trailing data",
        })
    }
}

impl std::error::Error for ParseError {}

//------------ ReplyError ----------------------------------------------------

/// A reply skeleton could not be formed from a request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReplyError {
    /// Not even the ID and flags of the request are known.
    NoHeader,

    /// The question section of the request was not read completely.
    BadQuestion,
}

impl fmt::Display for ReplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            ReplyError::NoHeader => "request header unknown",
            ReplyError::BadQuestion => "request question section unusable",
        })
    }
}

impl std::error::Error for ReplyError {}

//------------ RenderError ---------------------------------------------------

/// A message could not be rendered.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RenderError {
    /// Not even the header and OPT record fit.
    NoSpace,
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            RenderError::NoSpace => f.write_str("no space for message"),
        }
    }
}

impl std::error::Error for RenderError {}

//============ Testing =======================================================
