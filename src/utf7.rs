//! IMAP modified UTF-7 encoding (RFC 3501 §5.1.3) for mailbox names.
//!
//! Every mailbox name that crosses the wire (SELECT, LIST, STATUS, CREATE,
//! SUBSCRIBE, COPY targets) must be in this 7-bit form.

/// Encode a UTF-8 mailbox name into IMAP modified UTF-7.
pub fn encode(input: &str) -> String {
    if input
        .bytes()
        .all(|byte| (0x20..=0x7e).contains(&byte) && byte != b'&')
    {
        return input.to_string();
    }

    let mut out = String::new();
    let mut buf: Vec<u16> = Vec::new();

    let flush = |buf: &mut Vec<u16>, out: &mut String| {
        if buf.is_empty() {
            return;
        }
        let mut bytes = Vec::with_capacity(buf.len() * 2);
        for code_unit in buf.drain(..) {
            bytes.push((code_unit >> 8) as u8);
            bytes.push((code_unit & 0xff) as u8);
        }
        out.push('&');
        out.push_str(&mutf7_base64(&bytes));
        out.push('-');
    };

    for ch in input.chars() {
        let code = ch as u32;
        let is_direct = (0x20..=0x7e).contains(&code) && ch != '&';

        if is_direct {
            flush(&mut buf, &mut out);
            out.push(ch);
            continue;
        }

        if ch == '&' {
            flush(&mut buf, &mut out);
            out.push_str("&-");
            continue;
        }

        let mut tmp = [0u16; 2];
        for unit in ch.encode_utf16(&mut tmp) {
            buf.push(*unit);
        }
    }

    flush(&mut buf, &mut out);
    out
}

// Modified base64: standard alphabet with ',' instead of '/', no padding.
const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+,";

fn mutf7_base64(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len().div_ceil(3) * 4);
    for chunk in bytes.chunks(3) {
        let b0 = chunk[0] as u32;
        let b1 = chunk.get(1).copied().unwrap_or(0) as u32;
        let b2 = chunk.get(2).copied().unwrap_or(0) as u32;
        let group = (b0 << 16) | (b1 << 8) | b2;

        out.push(ALPHABET[(group >> 18) as usize & 0x3f] as char);
        out.push(ALPHABET[(group >> 12) as usize & 0x3f] as char);
        if chunk.len() > 1 {
            out.push(ALPHABET[(group >> 6) as usize & 0x3f] as char);
        }
        if chunk.len() > 2 {
            out.push(ALPHABET[group as usize & 0x3f] as char);
        }
    }
    out
}
