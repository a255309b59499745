use rand::Rng;

/// Token families available to the dictionary stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenClass {
    Http,
    Dns,
    Smtp,
    /// Classic injection payloads: SQL, shell, format strings, traversal.
    Generic,
}

const HTTP_TOKENS: &[&[u8]] = &[
    b"GET",
    b"POST",
    b"PUT",
    b"DELETE",
    b"HEAD",
    b"OPTIONS",
    b"PATCH",
    b"TRACE",
    b"CONNECT",
    b"HTTP/1.0",
    b"HTTP/1.1",
    b"HTTP/2",
    b"Host:",
    b"Content-Length:",
    b"Content-Type:",
    b"Transfer-Encoding:",
    b"Connection:",
    b"Cookie:",
    b"User-Agent:",
    b"\r\n",
    b"\r\n\r\n",
    b"chunked",
];

const DNS_TOKENS: &[&[u8]] = &[
    b"\x00\x01", // A
    b"\x00\x02", // NS
    b"\x00\x05", // CNAME
    b"\x00\x06", // SOA
    b"\x00\x0c", // PTR
    b"\x00\x0f", // MX
    b"\x00\x10", // TXT
    b"\x00\x1c", // AAAA
    b"\x00\xff", // ANY
    b"\xc0",     // compression pointer prefix
    b"\xc0\x0c", // pointer to the usual question offset
    b"\x00\x00\x29", // OPT
];

const SMTP_TOKENS: &[&[u8]] = &[
    b"HELO ",
    b"EHLO ",
    b"MAIL FROM:",
    b"RCPT TO:",
    b"DATA",
    b"QUIT",
    b"RSET",
    b"NOOP",
    b"VRFY ",
    b"EXPN ",
    b"STARTTLS",
    b"\r\n",
    b"\r\n.\r\n",
];

const GENERIC_TOKENS: &[&[u8]] = &[
    b"' OR '1'='1",
    b"'; DROP TABLE users--",
    b"1' AND '1'='1",
    b"UNION SELECT NULL--",
    b"; ls",
    b"| id",
    b"`id`",
    b"$(id)",
    b"&& cat /etc/passwd",
    b"%s%s%s%s",
    b"%n%n%n%n",
    b"%x%x%x%x",
    b"../../../etc/passwd",
    b"\x00",
    b"\xff\xff\xff\xff",
];

/// Per-protocol token dictionaries for the dictionary mutation stage.
pub struct Dictionary;

impl Dictionary {
    pub fn tokens(class: TokenClass) -> &'static [&'static [u8]] {
        match class {
            TokenClass::Http => HTTP_TOKENS,
            TokenClass::Dns => DNS_TOKENS,
            TokenClass::Smtp => SMTP_TOKENS,
            TokenClass::Generic => GENERIC_TOKENS,
        }
    }

    /// Draw a token from the given class, or from all classes when none is
    /// specified.
    pub fn random_token<R: Rng + ?Sized>(rng: &mut R, class: Option<TokenClass>) -> &'static [u8] {
        match class {
            Some(class) => {
                let tokens = Self::tokens(class);
                tokens[rng.random_range(0..tokens.len())]
            }
            None => {
                let all = [
                    TokenClass::Http,
                    TokenClass::Dns,
                    TokenClass::Smtp,
                    TokenClass::Generic,
                ];
                let tokens = Self::tokens(all[rng.random_range(0..all.len())]);
                tokens[rng.random_range(0..tokens.len())]
            }
        }
    }

    /// Insert a token at a random offset. Empty inputs come back unchanged.
    pub fn inject<R: Rng + ?Sized>(
        data: &[u8],
        rng: &mut R,
        class: Option<TokenClass>,
    ) -> Vec<u8> {
        if data.is_empty() {
            return Vec::new();
        }
        let token = Self::random_token(rng, class);
        let offset = rng.random_range(0..=data.len());
        let mut out = Vec::with_capacity(data.len() + token.len());
        out.extend_from_slice(&data[..offset]);
        out.extend_from_slice(token);
        out.extend_from_slice(&data[offset..]);
        out
    }

    /// Overwrite bytes at a random offset with a token, clamped to the end
    /// of the input.
    pub fn overwrite<R: Rng + ?Sized>(
        data: &[u8],
        rng: &mut R,
        class: Option<TokenClass>,
    ) -> Vec<u8> {
        if data.is_empty() {
            return Vec::new();
        }
        let token = Self::random_token(rng, class);
        let offset = rng.random_range(0..data.len());
        let mut out = data.to_vec();
        for (i, &byte) in token.iter().enumerate() {
            match out.get_mut(offset + i) {
                Some(slot) => *slot = byte,
                None => break,
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    #[test]
    fn http_tokens_cover_the_essentials() {
        let tokens = Dictionary::tokens(TokenClass::Http);
        for expected in [&b"GET"[..], b"POST", b"HTTP/1.1", b"Host:", b"\r\n", b"chunked"] {
            assert!(tokens.contains(&expected));
        }
    }

    #[test]
    fn dns_tokens_are_packed_big_endian() {
        let tokens = Dictionary::tokens(TokenClass::Dns);
        assert!(tokens.contains(&&b"\x00\x01"[..])); // A
        assert!(tokens.contains(&&b"\x00\xff"[..])); // ANY
        assert!(tokens.contains(&&b"\xc0\x0c"[..])); // compression pointer
    }

    #[test]
    fn smtp_and_generic_tokens_present() {
        assert!(Dictionary::tokens(TokenClass::Smtp).contains(&&b"MAIL FROM:"[..]));
        assert!(Dictionary::tokens(TokenClass::Smtp).contains(&&b"\r\n.\r\n"[..]));
        assert!(Dictionary::tokens(TokenClass::Generic).contains(&&b"' OR '1'='1"[..]));
        assert!(Dictionary::tokens(TokenClass::Generic).contains(&&b"`id`"[..]));
        assert!(Dictionary::tokens(TokenClass::Generic).contains(&&b"%n%n%n%n"[..]));
    }

    #[test]
    fn inject_grows_the_input() {
        let mut rng = ChaCha8Rng::from_seed([3; 32]);
        let data = b"TEST";
        for _ in 0..50 {
            let out = Dictionary::inject(data, &mut rng, Some(TokenClass::Http));
            assert!(out.len() > data.len());
        }
    }

    #[test]
    fn inject_on_empty_stays_empty() {
        let mut rng = ChaCha8Rng::from_seed([4; 32]);
        assert!(Dictionary::inject(b"", &mut rng, None).is_empty());
        assert!(Dictionary::overwrite(b"", &mut rng, None).is_empty());
    }

    #[test]
    fn overwrite_preserves_length() {
        let mut rng = ChaCha8Rng::from_seed([5; 32]);
        let data = b"AAAABBBBCCCC";
        for _ in 0..50 {
            let out = Dictionary::overwrite(data, &mut rng, Some(TokenClass::Smtp));
            assert_eq!(out.len(), data.len());
        }
    }

    #[test]
    fn unknown_class_falls_back_to_any_token() {
        let mut rng = ChaCha8Rng::from_seed([6; 32]);
        let out = Dictionary::inject(b"X", &mut rng, None);
        assert!(out.len() > 1);
    }
}
