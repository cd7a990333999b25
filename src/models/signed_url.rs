//! Time-limited access grants.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// A signed URL as issued by the object storage.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct SignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// A cached access grant for one document.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct SignedUrlEntry {
    pub document_id: String,
    pub url: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SignedUrlEntry {
    pub fn new(document_id: impl Into<String>, signed: SignedUrl, issued_at: DateTime<Utc>) -> Self {
        Self {
            document_id: document_id.into(),
            url: signed.url,
            issued_at,
            expires_at: signed.expires_at,
        }
    }

    /// True while `now < expires_at - buffer`.
    pub fn is_fresh(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        now < self.expires_at - buffer
    }

    pub fn as_signed_url(&self) -> SignedUrl {
        SignedUrl {
            url: self.url.clone(),
            expires_at: self.expires_at,
        }
    }
}
