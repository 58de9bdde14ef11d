use crate::yenc;
use anyhow::Context;
use chrono::{DateTime, Utc};
use rand_core::{CryptoRng, RngCore};
use usync_common::lowercase_alnum_token;

/// `<{16 lowercase alnum}@{domain}>`, per §4.3/§6 (domain is the
/// configured `message_id_domain`, default `ngPost.com`). The server is
/// free to assign a different Message-ID on acceptance; §9 Open Question
/// decision 3 treats a mismatch in fixed-posting mode as `ProviderFatal`
/// rather than silently adopting the server's value.
pub fn generate_message_id(rng: &mut (impl RngCore + CryptoRng), domain: &str) -> String {
    format!("<{}@{domain}>", lowercase_alnum_token(rng, 16))
}

/// Everything needed to build or interpret one posted article, per §6.
#[derive(Debug, Clone)]
pub struct ArticleHeaders {
    pub message_id: String,
    pub subject: String,
    pub from_display_name: String,
    pub from_address: String,
    pub newsgroup: String,
    pub date: DateTime<Utc>,
}

/// Renders the full RFC-5322-ish article: headers, a blank line, then
/// the yEnc-framed ciphertext body (already wire-header-prepended by
/// `usync-crypto::encrypt_segment`).
pub fn format_article(headers: &ArticleHeaders, part: u32, total: u32, wire_framed: &[u8]) -> String {
    let body = yenc::format_part(part, total, &headers.subject, wire_framed);
    format!(
        "Message-ID: {message_id}\r\n\
         Subject: {subject}\r\n\
         From: {from_name} <{from_address}>\r\n\
         Newsgroups: {newsgroup}\r\n\
         Date: {date}\r\n\
         X-UsenetSync-Version: 1\r\n\
         \r\n\
         {body}",
        message_id = headers.message_id,
        subject = headers.subject,
        from_name = headers.from_display_name,
        from_address = headers.from_address,
        newsgroup = headers.newsgroup,
        date = headers.date.to_rfc2822(),
    )
}

/// Parses a retrieved article back into its headers and decoded,
/// wire-framed ciphertext. Does not itself decrypt; that is
/// `usync-crypto::decrypt_segment`'s job once the Segment's key is known.
pub fn parse_article(raw: &str) -> anyhow::Result<(ArticleHeaders, yenc::YencPart, Vec<u8>)> {
    let (header_block, body) = raw
        .split_once("\r\n\r\n")
        .or_else(|| raw.split_once("\n\n"))
        .context("article missing header/body separator")?;

    let mut message_id = None;
    let mut subject = None;
    let mut from = None;
    let mut newsgroup = None;
    let mut date = None;

    for line in header_block.lines() {
        if let Some(value) = line.strip_prefix("Message-ID:") {
            message_id = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("Subject:") {
            subject = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("From:") {
            from = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("Newsgroups:") {
            newsgroup = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("Date:") {
            date = Some(DateTime::parse_from_rfc2822(value.trim())?.with_timezone(&Utc));
        }
    }

    let from = from.context("missing From header")?;
    let (from_display_name, from_address) = split_from(&from)?;

    let headers = ArticleHeaders {
        message_id: message_id.context("missing Message-ID header")?,
        subject: subject.context("missing Subject header")?,
        from_display_name,
        from_address,
        newsgroup: newsgroup.context("missing Newsgroups header")?,
        date: date.context("missing or unparseable Date header")?,
    };

    let (part, payload) = yenc::parse_part(body)?;
    Ok((headers, part, payload))
}

fn split_from(from: &str) -> anyhow::Result<(String, String)> {
    let (name, rest) = from.split_once('<').context("From header missing address")?;
    let address = rest.strip_suffix('>').context("From header address missing closing '>'")?;
    Ok((name.trim().to_string(), address.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn generated_message_id_matches_expected_shape() {
        let id = generate_message_id(&mut OsRng, "ngPost.com");
        assert!(id.starts_with('<'));
        assert!(id.ends_with("@ngPost.com>"));
        assert_eq!(id.len(), "<".len() + 16 + "@ngPost.com>".len());
    }

    #[test]
    fn format_then_parse_article_round_trips() {
        let headers = ArticleHeaders {
            message_id: "<abcdefghij012345@ngPost.com>".to_string(),
            subject: "abcxyz0123456789abcd".to_string(),
            from_display_name: "UsenetSync".to_string(),
            from_address: "poster@example.invalid".to_string(),
            newsgroup: "alt.binaries.test".to_string(),
            date: Utc::now(),
        };
        let wire_framed = b"pretend-wire-framed-ciphertext".to_vec();
        let raw = format_article(&headers, 1, 1, &wire_framed);

        let (parsed_headers, part, payload) = parse_article(&raw).unwrap();
        assert_eq!(parsed_headers.message_id, headers.message_id);
        assert_eq!(parsed_headers.newsgroup, headers.newsgroup);
        assert_eq!(part.part, 1);
        assert_eq!(payload, wire_framed);
    }
}
