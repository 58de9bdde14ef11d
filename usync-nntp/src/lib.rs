//! NNTP posting and retrieval: pooled TLS connections, article framing
//! (§6), the yEnc-class text codec, and the retry/backoff driver for
//! the error-class matrix in §4.5/§7. No teacher equivalent exists for
//! this crate; it is grounded on the wider retrieval pool (see DESIGN.md).

mod article;
mod client;
mod pool;
mod retry;
mod yenc;

pub use article::{format_article, generate_message_id, parse_article, ArticleHeaders};
pub use client::{post_article, retrieve_article, ArticleTransport};
pub use pool::{build_pool, default_tls_connector, NntpConnection, NntpManager, NntpPool, ServerEndpoint};
pub use retry::{is_retryable, BackoffPolicy};
pub use yenc::{decode, encode, format_part, parse_part, YencPart};
