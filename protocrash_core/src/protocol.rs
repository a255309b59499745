use crate::dictionary::TokenClass;
use crate::mutation::{INTERESTING_16, INTERESTING_32, INTERESTING_8};
use rand::Rng;

/// The closed set of protocols the field-mutation stage understands, plus a
/// grammar-driven escape hatch for custom binary formats.
///
/// These are not full codecs. Each variant knows just enough structure to
/// project a mutation onto a specific field; length and checksum fields are
/// deliberately not repaired afterwards, since desynchronizing them from the
/// payload is one of the things worth testing.
#[derive(Debug, Clone)]
pub enum Protocol {
    Http,
    Dns,
    Smtp,
    Custom(BinaryGrammar),
}

/// Sequential field layout for a custom binary protocol.
#[derive(Debug, Clone)]
pub struct BinaryGrammar {
    pub fields: Vec<BinaryField>,
}

#[derive(Debug, Clone)]
pub struct BinaryField {
    pub name: String,
    pub width: usize,
    pub kind: FieldKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Big-endian integer; mutated with interesting values and arithmetic.
    Numeric,
    /// Free-form bytes; mutated with length-bound corruptions.
    Text,
    /// Declares the size of following payload; mutated to disagree with it.
    Length,
}

const HTTP_VERBS: &[&[u8]] = &[
    b"GET", b"POST", b"PUT", b"DELETE", b"HEAD", b"OPTIONS", b"PATCH", b"TRACE",
];

impl Protocol {
    /// Resolve a config-file protocol name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "http" => Some(Protocol::Http),
            "dns" => Some(Protocol::Dns),
            "smtp" => Some(Protocol::Smtp),
            _ => None,
        }
    }

    /// Dictionary family matching this protocol.
    pub fn token_class(&self) -> TokenClass {
        match self {
            Protocol::Http => TokenClass::Http,
            Protocol::Dns => TokenClass::Dns,
            Protocol::Smtp => TokenClass::Smtp,
            Protocol::Custom(_) => TokenClass::Generic,
        }
    }

    /// Project a mutation onto one field of `data`.
    ///
    /// Inputs that do not parse far enough to expose the chosen field come
    /// back unchanged; a degenerate mutation is not an error.
    pub fn mutate_field<R: Rng + ?Sized>(&self, data: &[u8], rng: &mut R) -> Vec<u8> {
        if data.is_empty() {
            return Vec::new();
        }
        match self {
            Protocol::Http => mutate_http_field(data, rng),
            Protocol::Dns => mutate_dns_field(data, rng),
            Protocol::Smtp => mutate_smtp_field(data, rng),
            Protocol::Custom(grammar) => mutate_custom_field(grammar, data, rng),
        }
    }
}

/// Corrupt a text field in place: truncate, elongate past typical buffer
/// sizes, or splatter non-ASCII bytes through it.
fn corrupt_text<R: Rng + ?Sized>(field: &[u8], rng: &mut R) -> Vec<u8> {
    match rng.random_range(0..4u8) {
        0 => field[..rng.random_range(0..=field.len())].to_vec(),
        1 => {
            let mut out = field.to_vec();
            let filler = if field.is_empty() { b'A' } else { field[0] };
            out.extend(std::iter::repeat(filler).take(rng.random_range(64..2048)));
            out
        }
        2 => {
            let mut out = field.to_vec();
            if !out.is_empty() {
                let pos = rng.random_range(0..out.len());
                out[pos] = rng.random_range(0x80..=0xFFu8);
            }
            out
        }
        _ => {
            let mut out = field.to_vec();
            out.extend_from_slice(b"%00%0d%0a");
            out
        }
    }
}

/// Overwrite a big-endian numeric field with an interesting value of its
/// width, or nudge it with a small delta.
fn mutate_numeric_be<R: Rng + ?Sized>(out: &mut [u8], rng: &mut R) {
    match out.len() {
        1 => {
            out[0] = if rng.random_bool(0.5) {
                INTERESTING_8[rng.random_range(0..INTERESTING_8.len())] as u8
            } else {
                out[0].wrapping_add(rng.random_range(1..=35))
            };
        }
        2 => {
            let value = if rng.random_bool(0.5) {
                INTERESTING_16[rng.random_range(0..INTERESTING_16.len())] as u16
            } else {
                u16::from_be_bytes([out[0], out[1]])
                    .wrapping_add(rng.random_range(1..=35u16))
            };
            out.copy_from_slice(&value.to_be_bytes());
        }
        4 => {
            let value = if rng.random_bool(0.5) {
                INTERESTING_32[rng.random_range(0..INTERESTING_32.len())] as u32
            } else {
                u32::from_be_bytes([out[0], out[1], out[2], out[3]])
                    .wrapping_add(rng.random_range(1..=35u32))
            };
            out.copy_from_slice(&value.to_be_bytes());
        }
        _ => {
            if !out.is_empty() {
                let pos = rng.random_range(0..out.len());
                out[pos] = rng.random::<u8>();
            }
        }
    }
}

fn mutate_http_field<R: Rng + ?Sized>(data: &[u8], rng: &mut R) -> Vec<u8> {
    // Head section only: request line plus header lines up to the blank.
    let text = data;
    let line_end = match find(text, b"\r\n") {
        Some(end) => end,
        None => return corrupt_text(data, rng),
    };
    let request_line = &text[..line_end];
    let rest = &text[line_end..];

    let mut parts: Vec<Vec<u8>> = request_line
        .split(|&b| b == b' ')
        .map(|p| p.to_vec())
        .collect();

    match rng.random_range(0..5u8) {
        // Method swap or corruption.
        0 if !parts.is_empty() => {
            parts[0] = if rng.random_bool(0.5) {
                HTTP_VERBS[rng.random_range(0..HTTP_VERBS.len())].to_vec()
            } else {
                corrupt_text(&parts[0], rng)
            };
            rebuild_request(parts, rest)
        }
        // Path corruption.
        1 if parts.len() >= 2 => {
            parts[1] = corrupt_text(&parts[1], rng);
            rebuild_request(parts, rest)
        }
        // Version corruption.
        2 if parts.len() >= 3 => {
            let last = parts.len() - 1;
            parts[last] = match rng.random_range(0..3u8) {
                0 => b"HTTP/9.9".to_vec(),
                1 => b"HTTP/0.0".to_vec(),
                _ => corrupt_text(&parts[last], rng),
            };
            rebuild_request(parts, rest)
        }
        // Header value corruption.
        3 => mutate_http_header(data, line_end, rng),
        // Content-Length desync: claim a size unrelated to the body.
        _ => {
            let mut out = data.to_vec();
            let bogus = INTERESTING_32[rng.random_range(0..INTERESTING_32.len())];
            let header = format!("Content-Length: {bogus}\r\n");
            out.splice(line_end + 2..line_end + 2, header.into_bytes());
            out
        }
    }
}

fn mutate_http_header<R: Rng + ?Sized>(data: &[u8], line_end: usize, rng: &mut R) -> Vec<u8> {
    let head = &data[line_end + 2..];
    let mut header_spans: Vec<(usize, usize)> = Vec::new();
    let mut offset = line_end + 2;
    for line in head.split_str(b"\r\n") {
        if line.is_empty() {
            break;
        }
        header_spans.push((offset, offset + line.len()));
        offset += line.len() + 2;
    }
    if header_spans.is_empty() {
        return corrupt_text(data, rng);
    }
    let (start, end) = header_spans[rng.random_range(0..header_spans.len())];
    let line = &data[start..end];
    let mutated = match find(line, b":") {
        Some(colon) => {
            let mut out = line[..colon + 1].to_vec();
            out.extend(corrupt_text(&line[colon + 1..], rng));
            out
        }
        None => corrupt_text(line, rng),
    };
    let mut out = Vec::with_capacity(data.len() + mutated.len());
    out.extend_from_slice(&data[..start]);
    out.extend_from_slice(&mutated);
    out.extend_from_slice(&data[end..]);
    out
}

fn rebuild_request(parts: Vec<Vec<u8>>, rest: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.push(b' ');
        }
        out.extend_from_slice(part);
    }
    out.extend_from_slice(rest);
    out
}

/// DNS header fields live at fixed offsets; question type/class sit at the
/// tail of a single-question packet.
fn mutate_dns_field<R: Rng + ?Sized>(data: &[u8], rng: &mut R) -> Vec<u8> {
    if data.len() < 12 {
        return data.to_vec();
    }
    let mut out = data.to_vec();
    match rng.random_range(0..7u8) {
        0 => mutate_numeric_be(&mut out[0..2], rng),  // id
        1 => mutate_numeric_be(&mut out[2..4], rng),  // flags
        // Count desync: claim questions/records that are not there.
        2 => out[4..6].copy_from_slice(&0xFFFFu16.to_be_bytes()), // qdcount
        3 => mutate_numeric_be(&mut out[6..8], rng),  // ancount
        4 => mutate_numeric_be(&mut out[8..10], rng), // nscount
        5 if out.len() >= 16 => {
            // qtype of a single-question packet.
            let qtype_at = out.len() - 4;
            mutate_numeric_be(&mut out[qtype_at..qtype_at + 2], rng);
        }
        _ => {
            // Turn a random label length into a compression pointer.
            let pos = 12 + rng.random_range(0..(out.len() - 12).max(1));
            if pos < out.len() {
                out[pos] = 0xC0;
            }
        }
    }
    out
}

fn mutate_smtp_field<R: Rng + ?Sized>(data: &[u8], rng: &mut R) -> Vec<u8> {
    let lines: Vec<&[u8]> = data.split_str(b"\r\n").collect();
    if lines.is_empty() {
        return corrupt_text(data, rng);
    }
    let pick = rng.random_range(0..lines.len());
    let mut out: Vec<Vec<u8>> = lines.iter().map(|l| l.to_vec()).collect();

    let line = &out[pick];
    let verb_end = line.iter().position(|&b| b == b' ').unwrap_or(line.len());
    out[pick] = match rng.random_range(0..3u8) {
        // Verb corruption.
        0 => {
            let mut mutated = corrupt_text(&line[..verb_end], rng);
            mutated.extend_from_slice(&line[verb_end..]);
            mutated
        }
        // Argument corruption.
        1 if verb_end < line.len() => {
            let mut mutated = line[..verb_end + 1].to_vec();
            mutated.extend(corrupt_text(&line[verb_end + 1..], rng));
            mutated
        }
        // Premature dot-termination.
        _ => b".".to_vec(),
    };

    let mut rebuilt = Vec::with_capacity(data.len() + 8);
    for (i, line) in out.iter().enumerate() {
        if i > 0 {
            rebuilt.extend_from_slice(b"\r\n");
        }
        rebuilt.extend_from_slice(line);
    }
    rebuilt
}

fn mutate_custom_field<R: Rng + ?Sized>(
    grammar: &BinaryGrammar,
    data: &[u8],
    rng: &mut R,
) -> Vec<u8> {
    // Fields laid out sequentially; keep only the ones fully inside the data.
    let mut spans: Vec<(usize, usize, FieldKind)> = Vec::new();
    let mut offset = 0;
    for field in &grammar.fields {
        if offset + field.width > data.len() {
            break;
        }
        spans.push((offset, offset + field.width, field.kind));
        offset += field.width;
    }
    if spans.is_empty() {
        return data.to_vec();
    }

    let (start, end, kind) = spans[rng.random_range(0..spans.len())];
    let mut out = data.to_vec();
    match kind {
        FieldKind::Numeric => mutate_numeric_be(&mut out[start..end], rng),
        FieldKind::Text => {
            let mutated = corrupt_text(&out[start..end], rng);
            out.splice(start..end, mutated);
        }
        FieldKind::Length => {
            // Desynchronize on purpose: the declared size must not match the
            // actual payload.
            let actual = (data.len() - end) as u32;
            let mut bogus = actual;
            while bogus == actual {
                bogus = if rng.random_bool(0.5) {
                    INTERESTING_32[rng.random_range(0..INTERESTING_32.len())] as u32
                } else {
                    rng.random::<u32>()
                };
            }
            let bytes = bogus.to_be_bytes();
            let width = (end - start).min(4);
            out[end - width..end].copy_from_slice(&bytes[4 - width..]);
        }
    }
    out
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Split on a multi-byte separator, like `str::split` for byte slices.
trait SplitStr {
    fn split_str<'a>(&'a self, sep: &'a [u8]) -> SplitStrIter<'a>;
}

impl SplitStr for [u8] {
    fn split_str<'a>(&'a self, sep: &'a [u8]) -> SplitStrIter<'a> {
        SplitStrIter {
            data: Some(self),
            sep,
        }
    }
}

struct SplitStrIter<'a> {
    data: Option<&'a [u8]>,
    sep: &'a [u8],
}

impl<'a> Iterator for SplitStrIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        let data = self.data?;
        match find(data, self.sep) {
            Some(pos) => {
                self.data = Some(&data[pos + self.sep.len()..]);
                Some(&data[..pos])
            }
            None => {
                self.data = None;
                Some(data)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::from_seed([11; 32])
    }

    #[test]
    fn names_resolve_case_insensitively() {
        assert!(matches!(Protocol::from_name("HTTP"), Some(Protocol::Http)));
        assert!(matches!(Protocol::from_name("dns"), Some(Protocol::Dns)));
        assert!(matches!(Protocol::from_name("Smtp"), Some(Protocol::Smtp)));
        assert!(Protocol::from_name("mqtt").is_none());
    }

    #[test]
    fn http_mutations_eventually_touch_every_field() {
        let protocol = Protocol::Http;
        let base = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let mut rng = rng();

        let mut changed = 0;
        for _ in 0..100 {
            let out = protocol.mutate_field(base, &mut rng);
            if out != base {
                changed += 1;
            }
        }
        assert!(changed > 50, "only {changed} of 100 mutations changed data");
    }

    #[test]
    fn http_without_crlf_still_mutates() {
        let protocol = Protocol::Http;
        let mut rng = rng();
        // No request line at all; the corruption fallback must not panic.
        for _ in 0..50 {
            let _ = protocol.mutate_field(b"GARBAGE", &mut rng);
        }
    }

    #[test]
    fn dns_short_packets_pass_through() {
        let protocol = Protocol::Dns;
        let mut rng = rng();
        let tiny = b"\x12\x34";
        assert_eq!(protocol.mutate_field(tiny, &mut rng), tiny);
    }

    #[test]
    fn dns_header_mutations_stay_in_bounds() {
        let protocol = Protocol::Dns;
        let mut rng = rng();
        // Plausible single-question query for example.com A.
        let mut packet = vec![
            0xAB, 0xCD, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        packet.extend_from_slice(b"\x07example\x03com\x00\x00\x01\x00\x01");

        for _ in 0..200 {
            let out = protocol.mutate_field(&packet, &mut rng);
            assert_eq!(out.len(), packet.len());
        }
    }

    #[test]
    fn smtp_mutation_keeps_line_structure_or_dots() {
        let protocol = Protocol::Smtp;
        let mut rng = rng();
        let base = b"HELO mail.example.com\r\nMAIL FROM:<a@b.c>\r\nQUIT";
        let mut changed = 0;
        for _ in 0..100 {
            let out = protocol.mutate_field(base, &mut rng);
            if out != base {
                changed += 1;
            }
        }
        assert!(changed > 50);
    }

    #[test]
    fn custom_length_field_desynchronizes() {
        let grammar = BinaryGrammar {
            fields: vec![
                BinaryField {
                    name: "magic".to_string(),
                    width: 2,
                    kind: FieldKind::Numeric,
                },
                BinaryField {
                    name: "len".to_string(),
                    width: 4,
                    kind: FieldKind::Length,
                },
            ],
        };
        let protocol = Protocol::Custom(grammar);
        let mut rng = rng();

        // magic + len(=4) + 4 payload bytes.
        let mut base = vec![0x13, 0x37];
        base.extend_from_slice(&4u32.to_be_bytes());
        base.extend_from_slice(b"PAYL");

        let mut saw_desync = false;
        for _ in 0..100 {
            let out = protocol.mutate_field(&base, &mut rng);
            let declared = u32::from_be_bytes([out[2], out[3], out[4], out[5]]);
            if out[..2] == base[..2] && declared != 4 {
                saw_desync = true;
            }
        }
        assert!(saw_desync, "length field was never desynchronized");
    }

    #[test]
    fn empty_input_is_preserved() {
        let mut rng = rng();
        for protocol in [Protocol::Http, Protocol::Dns, Protocol::Smtp] {
            assert!(protocol.mutate_field(b"", &mut rng).is_empty());
        }
    }
}
