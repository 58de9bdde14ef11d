use crate::pool::NntpPool;
use async_trait::async_trait;
use usync_common::UsyncError;

/// Posting/retrieval, abstracted behind a trait the way `usync-catalog`
/// abstracts storage behind `Catalog`: the core depends on this, not on
/// `NntpPool` directly, so Publisher/Resolver/Uploader/Downloader tests
/// can swap in an in-memory double instead of a live TLS connection.
#[async_trait]
pub trait ArticleTransport: Send + Sync {
    async fn post(&self, raw_article: &str, proposed_message_id: &str) -> anyhow::Result<String>;
    async fn retrieve(&self, message_id: &str) -> anyhow::Result<String>;
}

#[async_trait]
impl ArticleTransport for NntpPool {
    async fn post(&self, raw_article: &str, proposed_message_id: &str) -> anyhow::Result<String> {
        post_article(self, raw_article, proposed_message_id).await
    }

    async fn retrieve(&self, message_id: &str) -> anyhow::Result<String> {
        retrieve_article(self, message_id).await
    }
}

/// Classifies an NNTP status line into the §7 error-kind vocabulary so
/// the retry driver in `crate::retry` can decide retryable vs. fatal
/// without re-parsing response codes itself.
fn classify_status(line: &str) -> Option<UsyncError> {
    let code = line.get(0..3)?;
    match code {
        "200" | "201" | "220" | "235" | "240" | "281" | "381" => None,
        "430" => Some(UsyncError::NotFound(format!("article not found: {line}"))),
        "411" => Some(UsyncError::NotFound(format!("no such newsgroup: {line}"))),
        "441" => Some(UsyncError::ProviderFatal(format!("posting failed: {line}"))),
        "480" | "481" | "502" => Some(UsyncError::ProviderFatal(format!(
            "authentication or permission error: {line}"
        ))),
        code if code.starts_with('4') => Some(UsyncError::ProviderTransient(line.to_string())),
        code if code.starts_with('5') => Some(UsyncError::ProviderFatal(line.to_string())),
        _ => Some(UsyncError::ProviderFatal(format!("unexpected response: {line}"))),
    }
}

/// Posts a pre-formatted article and returns the server-acknowledged
/// Message-ID. `proposed_message_id` is the one embedded in the article
/// headers; per §9 Open Question decision 3 a server-assigned mismatch
/// is treated as `ProviderFatal` rather than silently adopted.
pub async fn post_article(
    pool: &NntpPool,
    raw_article: &str,
    proposed_message_id: &str,
) -> anyhow::Result<String> {
    let mut conn = pool.get().await?;

    conn.write_line("POST").await?;
    let resp = conn.read_line().await?;
    if let Some(err) = classify_status(&resp) {
        return Err(err.into());
    }

    for line in raw_article.split("\r\n") {
        if line.starts_with('.') {
            conn.write_line(&format!(".{line}")).await?;
        } else {
            conn.write_line(line).await?;
        }
    }
    conn.write_line(".").await?;

    let resp = conn.read_line().await?;
    if let Some(err) = classify_status(&resp) {
        return Err(err.into());
    }

    let assigned = extract_message_id(&resp).unwrap_or_else(|| proposed_message_id.to_string());
    if assigned != proposed_message_id {
        anyhow::bail!(UsyncError::ProviderFatal(format!(
            "server assigned {assigned}, expected {proposed_message_id}"
        )));
    }
    Ok(assigned)
}

fn extract_message_id(status_line: &str) -> Option<String> {
    status_line
        .split_whitespace()
        .find(|token| token.starts_with('<') && token.ends_with('>'))
        .map(str::to_string)
}

/// Retrieves a full article (headers + body) by Message-ID.
pub async fn retrieve_article(pool: &NntpPool, message_id: &str) -> anyhow::Result<String> {
    let mut conn = pool.get().await?;
    conn.write_line(&format!("ARTICLE {message_id}")).await?;
    let resp = conn.read_line().await?;
    if let Some(err) = classify_status(&resp) {
        return Err(err.into());
    }
    conn.read_multiline().await
}
