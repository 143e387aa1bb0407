//! Wire codec: framed-token requests and replies
//!
//! A message is an array of length-prefixed binary-safe tokens:
//! `*<argc>\r\n` followed by `argc` tokens of the form
//! `$<len>\r\n<len bytes>\r\n`. The first token is the command name.
//!
//! A short buffer parses as "incomplete" (no request, zero bytes consumed),
//! while structurally invalid input (non-numeric length, missing terminator,
//! zero argc) is a protocol error.

use crate::error::{GossipError, Result};
use crate::node::{Node, NodeStatus};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::{IpAddr, SocketAddr};

/// Type tag for the sender's own fact
pub const SELF_TAG: &[u8] = b"self";
/// Type tag for the probe target in a ping-req
pub const PEER_TAG: &[u8] = b"peer";
/// Type tag for piggybacked facts
pub const RUMOR_TAG: &[u8] = b"rumor";

/// Tokens per self/peer encoding: tag, id, ip, port, version
const NODE_TOKENS: usize = 5;
/// Tokens per rumor encoding: tag, id, ip, port, version, status
const RUMOR_TOKENS: usize = 6;

/// A parsed inbound request: command name plus argument tokens, all
/// borrowed from the receive buffer. Never retained past one dispatch.
#[derive(Debug, PartialEq, Eq)]
pub struct Request<'a> {
    pub name: &'a [u8],
    pub args: Vec<&'a [u8]>,
}

/// Incremental request parser.
#[derive(Debug, Default)]
pub struct Parser;

impl Parser {
    /// Parse every complete request in `buf`.
    ///
    /// Returns the requests along with the number of bytes they cover; a
    /// trailing incomplete request consumes nothing and is left for the
    /// caller to retry with more data.
    pub fn parse<'a>(&self, buf: &'a [u8]) -> Result<(Vec<Request<'a>>, usize)> {
        let mut rest = buf;
        let mut requests = Vec::new();
        let mut parsed = 0;

        loop {
            let mut cursor = rest;
            let Some(argc) = parse_prefixed_num(b'*', &mut cursor)? else {
                break;
            };
            if argc == 0 {
                return Err(GossipError::Protocol(
                    "invalid request, no command name".into(),
                ));
            }

            // Cap the pre-allocation: argc is attacker-controlled.
            let mut tokens = Vec::with_capacity(argc.min(64));
            let mut complete = true;
            for _ in 0..argc {
                match parse_token(&mut cursor)? {
                    Some(token) => tokens.push(token),
                    None => {
                        complete = false;
                        break;
                    }
                }
            }
            if !complete {
                break;
            }

            let name = tokens.remove(0);
            requests.push(Request { name, args: tokens });
            rest = cursor;
            parsed = buf.len() - rest.len();
        }

        Ok((requests, parsed))
    }
}

/// Parse `<prefix><digits>\r\n`, advancing `rest` past it.
///
/// `Ok(None)` means the buffer ended mid-number (incomplete);
/// a wrong prefix, missing digits, or missing terminator is an error.
fn parse_prefixed_num(prefix: u8, rest: &mut &[u8]) -> Result<Option<usize>> {
    let buf = *rest;
    if buf.is_empty() {
        return Ok(None);
    }
    if buf[0] != prefix {
        return Err(GossipError::Protocol(format!(
            "expected '{}'",
            prefix as char
        )));
    }

    let mut value: usize = 0;
    let mut i = 1;
    while i < buf.len() && buf[i].is_ascii_digit() {
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add((buf[i] - b'0') as usize))
            .ok_or_else(|| GossipError::Protocol("length out of range".into()))?;
        i += 1;
    }

    if i == 1 {
        // No digits: either nothing after the prefix yet, or garbage.
        if i >= buf.len() {
            return Ok(None);
        }
        return Err(GossipError::Protocol("expected a positive integer".into()));
    }

    if i + 2 > buf.len() {
        return Ok(None);
    }
    if buf[i] != b'\r' || buf[i + 1] != b'\n' {
        return Err(GossipError::Protocol("expected '\\r\\n'".into()));
    }

    *rest = &buf[i + 2..];
    Ok(Some(value))
}

/// Parse one `$<len>\r\n<len bytes>\r\n` token, advancing `rest` past it.
fn parse_token<'a>(rest: &mut &'a [u8]) -> Result<Option<&'a [u8]>> {
    let Some(len) = parse_prefixed_num(b'$', rest)? else {
        return Ok(None);
    };

    let buf = *rest;
    if buf.len() < len + 2 {
        return Ok(None);
    }
    if buf[len] != b'\r' || buf[len + 1] != b'\n' {
        return Err(GossipError::Protocol("expected '\\r\\n'".into()));
    }

    let token = &buf[..len];
    *rest = &buf[len + 2..];
    Ok(Some(token))
}

/// Check for an inbound error notice (`-ERR ...\r\n`). Error frames are
/// logged by the receiver and never dispatched.
pub fn is_error_frame(buf: &[u8]) -> bool {
    buf.first() == Some(&b'-')
}

/// Builder for outbound framed messages.
#[derive(Debug, Default)]
pub struct MessageBuilder {
    buf: BytesMut,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an array header: `*<len>\r\n`
    pub fn array(mut self, len: usize) -> Self {
        self.buf.put_u8(b'*');
        self.buf.extend_from_slice(len.to_string().as_bytes());
        self.buf.extend_from_slice(b"\r\n");
        self
    }

    /// Append a bulk token: `$<len>\r\n<bytes>\r\n`
    pub fn bulk(mut self, token: &[u8]) -> Self {
        self.buf.put_u8(b'$');
        self.buf.extend_from_slice(token.len().to_string().as_bytes());
        self.buf.extend_from_slice(b"\r\n");
        self.buf.extend_from_slice(token);
        self.buf.extend_from_slice(b"\r\n");
        self
    }

    /// Append a simple error: `-<msg>\r\n`
    pub fn error(mut self, msg: &str) -> Self {
        self.buf.put_u8(b'-');
        self.buf.extend_from_slice(msg.as_bytes());
        self.buf.extend_from_slice(b"\r\n");
        self
    }

    /// Append a node as `<tag> id ip port version` (status implied ALIVE)
    pub fn node(self, tag: &[u8], node: &Node) -> Self {
        self.bulk(tag)
            .bulk(node.id.as_bytes())
            .bulk(node.addr.ip().to_string().as_bytes())
            .bulk(node.addr.port().to_string().as_bytes())
            .bulk(node.version.to_string().as_bytes())
    }

    /// Append a rumor as `rumor id ip port version status`
    pub fn rumor(self, node: &Node) -> Self {
        let status = node.status;
        self.node(RUMOR_TAG, node).bulk(status.as_str().as_bytes())
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Encode a full protocol message: command name, sender's self fact, an
/// optional peer fact (ping-req only) and the piggybacked rumor batch.
///
/// Array size is `1 + 5 (+ 5) + 6 × rumors`.
pub fn encode_message(name: &str, self_node: &Node, peer: Option<&Node>, rumors: &[Node]) -> Bytes {
    let argc =
        1 + NODE_TOKENS + peer.map_or(0, |_| NODE_TOKENS) + RUMOR_TOKENS * rumors.len();

    let mut builder = MessageBuilder::new()
        .array(argc)
        .bulk(name.as_bytes())
        .node(SELF_TAG, self_node);
    if let Some(peer) = peer {
        builder = builder.node(PEER_TAG, peer);
    }
    for rumor in rumors {
        builder = builder.rumor(rumor);
    }
    builder.finish()
}

/// Encode the error reply for a malformed request.
pub fn encode_error(reason: &str) -> Bytes {
    MessageBuilder::new()
        .error(&format!("ERR {}", reason))
        .finish()
}

fn token_str<'a>(token: &'a [u8], what: &str) -> Result<&'a str> {
    std::str::from_utf8(token)
        .map_err(|_| GossipError::Protocol(format!("expected utf-8 {}", what)))
}

fn token_num<T: std::str::FromStr>(token: &[u8], what: &str) -> Result<T> {
    token_str(token, what)?
        .parse()
        .map_err(|_| GossipError::Protocol(format!("expected a number for {}", what)))
}

/// Parse one node from the argument tokens starting at `*pos`.
///
/// Self/peer facts are exactly 5 tokens with status implied ALIVE; rumors
/// are exactly 6 and their status literal must be recognized.
pub fn parse_node(tag: &[u8], args: &[&[u8]], pos: &mut usize, with_status: bool) -> Result<Node> {
    let want = if with_status { RUMOR_TOKENS } else { NODE_TOKENS };
    if args.len() < *pos + want {
        return Err(GossipError::Protocol("invalid node info".into()));
    }
    if args[*pos] != tag {
        return Err(GossipError::Protocol(format!(
            "invalid node type: expected {}",
            String::from_utf8_lossy(tag)
        )));
    }

    let id = token_str(args[*pos + 1], "node id")?.to_owned();
    let ip: IpAddr = token_str(args[*pos + 2], "ip address")?
        .parse()
        .map_err(|_| GossipError::Protocol("expected an ip address".into()))?;
    let port: u16 = token_num(args[*pos + 3], "port")?;
    let version: u64 = token_num(args[*pos + 4], "version")?;

    let status = if with_status {
        let token = args[*pos + 5];
        match NodeStatus::from_wire(token) {
            NodeStatus::Unknown => {
                return Err(GossipError::UnknownStatus(
                    String::from_utf8_lossy(token).into_owned(),
                ));
            }
            status => status,
        }
    } else {
        NodeStatus::Alive
    };

    *pos += want;
    Ok(Node {
        id,
        addr: SocketAddr::new(ip, port),
        version,
        status,
    })
}

/// Parse the trailing rumor list, consuming the remaining tokens.
pub fn parse_rumors(args: &[&[u8]], pos: &mut usize) -> Result<Vec<Node>> {
    let mut rumors = Vec::new();
    while *pos < args.len() {
        rumors.push(parse_node(RUMOR_TAG, args, pos, true)?);
    }
    Ok(rumors)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping_with_rumor() -> (Node, Node, Bytes) {
        let this = Node::new("n1", "127.0.0.1:7946".parse().unwrap(), 3);
        let rumor = Node::new("n2", "127.0.0.1:7947".parse().unwrap(), 1);
        let bytes = encode_message("ping", &this, None, std::slice::from_ref(&rumor));
        (this, rumor, bytes)
    }

    #[test]
    fn test_frame_round_trip() {
        let (this, rumor, bytes) = ping_with_rumor();

        let (requests, parsed) = Parser.parse(&bytes).unwrap();
        assert_eq!(parsed, bytes.len());
        assert_eq!(requests.len(), 1);

        let request = &requests[0];
        assert_eq!(request.name, b"ping");
        assert_eq!(request.args.len(), NODE_TOKENS + RUMOR_TOKENS);

        let mut pos = 0;
        let parsed_self = parse_node(SELF_TAG, &request.args, &mut pos, false).unwrap();
        assert_eq!(parsed_self, this);

        let rumors = parse_rumors(&request.args, &mut pos).unwrap();
        assert_eq!(rumors, vec![rumor]);
    }

    #[test]
    fn test_short_buffer_is_incomplete_not_error() {
        let (_, _, bytes) = ping_with_rumor();

        // First 5 bytes: no request, zero bytes consumed.
        let (requests, parsed) = Parser.parse(&bytes[..5]).unwrap();
        assert!(requests.is_empty());
        assert_eq!(parsed, 0);

        // Every truncation point must be incomplete, never an error.
        for cut in 0..bytes.len() {
            let (requests, parsed) = Parser.parse(&bytes[..cut]).unwrap();
            assert!(requests.is_empty(), "cut at {}", cut);
            assert_eq!(parsed, 0, "cut at {}", cut);
        }

        // The full buffer completes exactly one request.
        let (requests, parsed) = Parser.parse(&bytes).unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(parsed, bytes.len());
    }

    #[test]
    fn test_two_requests_in_one_buffer() {
        let this = Node::new("n1", "127.0.0.1:7946".parse().unwrap(), 3);
        let mut buf = encode_message("ping", &this, None, &[]).to_vec();
        buf.extend_from_slice(&encode_message("ack", &this, None, &[]));

        let (requests, parsed) = Parser.parse(&buf).unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(parsed, buf.len());
        assert_eq!(requests[0].name, b"ping");
        assert_eq!(requests[1].name, b"ack");
    }

    #[test]
    fn test_trailing_incomplete_request_is_retained() {
        let this = Node::new("n1", "127.0.0.1:7946".parse().unwrap(), 3);
        let first = encode_message("ping", &this, None, &[]);
        let second = encode_message("ack", &this, None, &[]);

        let mut buf = first.to_vec();
        buf.extend_from_slice(&second[..second.len() - 4]);

        let (requests, parsed) = Parser.parse(&buf).unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(parsed, first.len());
    }

    #[test]
    fn test_structural_errors() {
        assert!(Parser.parse(b"@3\r\n").is_err());
        assert!(Parser.parse(b"*x\r\n").is_err());
        assert!(Parser.parse(b"*0\r\n").is_err());
        assert!(Parser.parse(b"*1\r\n$3\r\nfooXY").is_err());
        assert!(Parser.parse(b"*1\r\n$x\r\n").is_err());
        assert!(Parser.parse(b"*2\r\n+ok\r\n").is_err());
    }

    #[test]
    fn test_error_frame() {
        let frame = encode_error("expected a number");
        assert_eq!(frame.as_ref(), b"-ERR expected a number\r\n");
        assert!(is_error_frame(&frame));
        assert!(!is_error_frame(b"*1\r\n$4\r\nping\r\n"));
    }

    #[test]
    fn test_parse_node_rejects_bad_input() {
        let (_, _, bytes) = ping_with_rumor();
        let (requests, _) = Parser.parse(&bytes).unwrap();
        let args = &requests[0].args;

        // Wrong tag.
        let mut pos = 0;
        assert!(parse_node(PEER_TAG, args, &mut pos, false).is_err());
        assert_eq!(pos, 0, "failed parse consumes nothing");

        // Truncated token list.
        let mut pos = 0;
        assert!(parse_node(SELF_TAG, &args[..3], &mut pos, false).is_err());
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let this = Node::new("n1", "127.0.0.1:7946".parse().unwrap(), 3);
        let rumor = Node::new("n2", "127.0.0.1:7947".parse().unwrap(), 1);
        let bytes = encode_message("ping", &this, None, &[rumor]);

        // Corrupt the status literal.
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let bad = text.replace("$5\r\nALIVE", "$5\r\nDECAY");

        let (requests, _) = Parser.parse(bad.as_bytes()).unwrap();
        let args = &requests[0].args;
        let mut pos = NODE_TOKENS;
        match parse_rumors(args, &mut pos) {
            Err(GossipError::UnknownStatus(s)) => assert_eq!(s, "DECAY"),
            other => panic!("expected UnknownStatus, got {:?}", other),
        }
    }

    #[test]
    fn test_ping_req_encoding_has_peer() {
        let this = Node::new("n1", "127.0.0.1:7946".parse().unwrap(), 3);
        let peer = Node::new("n3", "127.0.0.1:7948".parse().unwrap(), 2);
        let bytes = encode_message("ping-req", &this, Some(&peer), &[]);

        let (requests, _) = Parser.parse(&bytes).unwrap();
        let request = &requests[0];
        assert_eq!(request.name, b"ping-req");
        assert_eq!(request.args.len(), 2 * NODE_TOKENS);

        let mut pos = 0;
        let parsed_self = parse_node(SELF_TAG, &request.args, &mut pos, false).unwrap();
        let parsed_peer = parse_node(PEER_TAG, &request.args, &mut pos, false).unwrap();
        assert_eq!(parsed_self, this);
        assert_eq!(parsed_peer, peer);
        assert!(parse_rumors(&request.args, &mut pos).unwrap().is_empty());
    }
}
