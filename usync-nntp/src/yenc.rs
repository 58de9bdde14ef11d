use anyhow::{bail, ensure, Context};

const LINE_LEN: usize = 128;
const ESCAPE: u8 = b'=';
const ESCAPE_OFFSET: u8 = 64;
const BYTE_OFFSET: u8 = 42;

/// Encodes `data` as a single yEnc part body (no `=ybegin`/`=yend` framing
/// lines; those are written by `crate::article`), wrapping at
/// `line=128` per §6's posted header. Critical bytes (NUL, LF, CR, `=`,
/// and the bytes that would collide with them after the offset) are
/// escaped with a leading `=`, the classic yEnc rule.
pub fn encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() + data.len() / LINE_LEN + 16);
    let mut col = 0usize;
    for &byte in data {
        let encoded = byte.wrapping_add(BYTE_OFFSET);
        if needs_escape(encoded) {
            out.push('=');
            out.push(char::from(encoded.wrapping_add(ESCAPE_OFFSET)));
            col += 2;
        } else {
            out.push(char::from(encoded));
            col += 1;
        }
        if col >= LINE_LEN {
            out.push('\r');
            out.push('\n');
            col = 0;
        }
    }
    out
}

fn needs_escape(encoded: u8) -> bool {
    matches!(encoded, 0x00 | 0x0A | 0x0D | b'=')
}

/// Decodes a yEnc part body back to raw bytes, ignoring line breaks.
pub fn decode(text: &str) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(text.len());
    let mut bytes = text.bytes().filter(|&b| b != b'\r' && b != b'\n');
    while let Some(b) = bytes.next() {
        if b == ESCAPE {
            let next = bytes.next().context("yEnc escape at end of input")?;
            out.push(next.wrapping_sub(ESCAPE_OFFSET).wrapping_sub(BYTE_OFFSET));
        } else {
            out.push(b.wrapping_sub(BYTE_OFFSET));
        }
    }
    Ok(out)
}

/// Parses the `=ybegin ... / =yend ...` framing around one part, per §6:
/// `=ybegin part={k} total={K} line=128 size={N} name={name}` and
/// `=yend size={N} part={k} pcrc32={hex}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YencPart {
    pub part: u32,
    pub total: u32,
    pub size: u64,
    pub name: String,
    pub pcrc32: u32,
}

pub fn format_part(part: u32, total: u32, name: &str, data: &[u8]) -> String {
    let crc = crc32fast::hash(data);
    let body = encode(data);
    format!(
        "=ybegin part={part} total={total} line={LINE_LEN} size={size} name={name}.dat\r\n{body}\r\n=yend size={size} part={part} pcrc32={crc:08x}\r\n",
        size = data.len(),
    )
}

/// Parses a formatted part back into its header fields and decoded
/// payload, verifying `pcrc32` against the decoded bytes (the "transport
/// CRC from the text encoder" named as the first integrity layer in
/// §4.4).
pub fn parse_part(raw: &str) -> anyhow::Result<(YencPart, Vec<u8>)> {
    let mut lines = raw.lines();
    let begin = lines.next().context("missing =ybegin line")?;
    ensure!(begin.starts_with("=ybegin"), "article body does not start with =ybegin");

    let part = field_u32(begin, "part").context("=ybegin part")?;
    let total = field_u32(begin, "total").context("=ybegin total")?;
    let size = field_u64(begin, "size").context("=ybegin size")?;
    let name = field_str(begin, "name").context("=ybegin name")?;

    let mut body_lines = Vec::new();
    let mut end_line = None;
    for line in lines {
        if line.starts_with("=yend") {
            end_line = Some(line.to_string());
            break;
        }
        body_lines.push(line);
    }
    let end_line = end_line.context("missing =yend line")?;
    let end_pcrc32 = field_hex_u32(&end_line, "pcrc32").context("=yend pcrc32")?;

    let body = body_lines.join("");
    let decoded = decode(&body)?;
    ensure!(
        decoded.len() as u64 == size,
        "decoded size {} does not match declared size {}",
        decoded.len(),
        size
    );
    let actual_crc = crc32fast::hash(&decoded);
    ensure!(actual_crc == end_pcrc32, "yEnc part CRC mismatch");

    Ok((
        YencPart {
            part,
            total,
            size,
            name: name.trim_end_matches(".dat").to_string(),
            pcrc32: end_pcrc32,
        },
        decoded,
    ))
}

fn field_str(line: &str, key: &str) -> anyhow::Result<String> {
    for token in line.split_whitespace() {
        if let Some(value) = token.strip_prefix(&format!("{key}=")) {
            return Ok(value.to_string());
        }
    }
    bail!("missing field {key} in {line:?}")
}

fn field_u32(line: &str, key: &str) -> anyhow::Result<u32> {
    field_str(line, key)?.parse().context("parsing integer field")
}

fn field_u64(line: &str, key: &str) -> anyhow::Result<u64> {
    field_str(line, key)?.parse().context("parsing integer field")
}

fn field_hex_u32(line: &str, key: &str) -> anyhow::Result<u32> {
    u32::from_str_radix(&field_str(line, key)?, 16).context("parsing hex field")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_round_trips_arbitrary_bytes() {
        let data: Vec<u8> = (0u8..=255).collect();
        let encoded = encode(&data);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn format_then_parse_part_round_trips() {
        let data = b"the quick brown fox";
        let formatted = format_part(1, 1, "abcxyz0123456789abcd", data);
        let (header, decoded) = parse_part(&formatted).unwrap();
        assert_eq!(decoded, data);
        assert_eq!(header.part, 1);
        assert_eq!(header.total, 1);
        assert_eq!(header.size, data.len() as u64);
    }

    #[test]
    fn parse_part_rejects_corrupted_body() {
        let data = b"some payload bytes";
        let mut formatted = format_part(2, 3, "name", data);
        let idx = formatted.find("=ybegin").unwrap() + 40;
        formatted.replace_range(idx..idx + 1, "X");
        assert!(parse_part(&formatted).is_err());
    }
}
