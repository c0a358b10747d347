use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use secrecy::{ExposeSecret, Secret};
use serde::Serialize;
use tracing::{debug, warn};

use crate::{message::MeetingCode, peer::RtcConfig};

/// Backend that remembers which meetings a user visited.
#[async_trait(?Send)]
pub trait MeetingHistory {
    async fn record_visit(&self, code: &MeetingCode) -> anyhow::Result<()>;
}

#[derive(Serialize)]
struct VisitBody<'a> {
    meeting_code: &'a str,
}

/// Posts visits to `<api>/meeting/add` with a bearer token.
pub struct HttpHistory {
    url: String,
    token: Secret<String>,
}

impl std::fmt::Debug for HttpHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpHistory").field("url", &self.url).finish()
    }
}

impl HttpHistory {
    pub fn new<S: AsRef<str>>(api: S, token: Secret<String>) -> Self {
        Self {
            url: format!("{}/meeting/add", api.as_ref().trim_end_matches('/')),
            token,
        }
    }

    /// Guests (no token) or configs without an API get no history.
    pub fn from_config(config: &mut RtcConfig) -> Option<Self> {
        let api = config.history_url.clone()?;
        let token = config.take_token()?;
        Some(Self::new(api, Secret::new(token)))
    }
}

#[async_trait(?Send)]
impl MeetingHistory for HttpHistory {
    async fn record_visit(&self, code: &MeetingCode) -> anyhow::Result<()> {
        let res = awc::Client::new()
            .post(&self.url)
            .bearer_auth(self.token.expose_secret())
            .send_json(&VisitBody {
                meeting_code: code.as_str(),
            })
            .await
            .map_err(|e| anyhow!("History request failed: {}", e))?;
        if !res.status().is_success() {
            return Err(anyhow!("History backend answered {}", res.status()));
        }
        debug!(%code, "Meeting visit recorded");
        Ok(())
    }
}

/// Records the visit on the local task set without waiting for it.
pub(crate) fn record_in_background(history: Arc<dyn MeetingHistory>, code: MeetingCode) {
    actix_rt::spawn(async move {
        if let Err(e) = history.record_visit(&code).await {
            warn!(%code, ?e, "Could not record meeting visit");
        }
    });
}
