//! Session extraction - Drives a browser surface through sign-in and
//! recovers the session key and organization id.
//!
//! # State Machine
//!
//! ```text
//!            begin()            navigation to a            probe yields
//!   Idle ───────────► BrowserLoading ──► AwaitingSignIn ──► Extracting(n) ──► Succeeded
//!    ▲                                   (sign-in pages)    │  retry after delay
//!    │                                                      │  while n < max
//!    │  cancel / surface closed                             ▼
//!    └────────────────────────────── (any state)        Failed { attempts }
//!
//!   submit_manual() from any state ──► Succeeded
//! ```
//!
//! The browser itself is supplied by the host through [`BrowserSurface`];
//! the extracted pair is handed to a [`CredentialSink`].

mod flow;


pub use flow::ExtractionFlow;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use std::fmt;

/// Paths on the provider that still belong to the sign-in journey.
const SIGN_IN_PATHS: [&str; 4] = ["/login", "/logout", "/signup", "/magic-link"];

/// Extraction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionState {
    Idle,
    BrowserLoading,
    AwaitingSignIn,
    /// `attempt` probes have been started so far
    Extracting { attempt: u32 },
    Succeeded,
    ManualFallback,
    Failed { attempts: u32 },
}

impl fmt::Display for ExtractionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractionState::Idle => write!(f, "idle"),
            ExtractionState::BrowserLoading => write!(f, "browser_loading"),
            ExtractionState::AwaitingSignIn => write!(f, "awaiting_sign_in"),
            ExtractionState::Extracting { attempt } => write!(f, "extracting({})", attempt),
            ExtractionState::Succeeded => write!(f, "succeeded"),
            ExtractionState::ManualFallback => write!(f, "manual_fallback"),
            ExtractionState::Failed { attempts } => write!(f, "failed({})", attempts),
        }
    }
}

/// Human-readable status published on every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionStatus {
    pub state: ExtractionState,
    pub message: String,
}

/// Cookie as reported by the browser surface's cookie store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
}

/// Embedded browser driven by the flow.
#[async_trait]
pub trait BrowserSurface: Send + Sync {
    /// Opens `url` in a non-persistent browsing context.
    async fn open_isolated(&self, url: &str) -> Result<()>;

    /// Evaluates `script` in the current page and returns its JSON result.
    /// Scripts that produce a promise are awaited.
    async fn evaluate_script(&self, script: &str) -> Result<serde_json::Value>;

    /// All cookies of the browsing context, including script-inaccessible ones.
    async fn cookies(&self) -> Result<Vec<BrowserCookie>>;

    async fn close(&self);
}

/// Receives the credential pair once sign-in succeeds.
#[async_trait]
pub trait CredentialSink: Send + Sync {
    async fn deliver(&self, session_key: &str, organization_id: &str) -> Result<()>;
}

/// Result object produced by [`probe_script`].
#[derive(Debug, Default, Deserialize)]
pub struct ProbeReport {
    #[serde(default)]
    pub org_id: Option<String>,
    #[serde(default)]
    pub session_key: Option<String>,
    /// Status of the organizations call when it was not 2xx
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ProbeReport {
    pub fn organization_id(&self) -> Option<&str> {
        non_blank(self.org_id.as_deref())
    }

    pub fn session_key(&self) -> Option<&str> {
        non_blank(self.session_key.as_deref())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// In-page probe: asks the provider's organizations API for the first
/// organization and reads the session cookie from `document.cookie`.
///
/// The cookie is usually HttpOnly, in which case `session_key` comes back
/// null and the flow falls back to the cookie store.
pub fn probe_script(session_cookie_name: &str) -> String {
    let cookie_name = serde_json::Value::String(session_cookie_name.to_string());
    format!(
        r#"(async () => {{
  const readCookie = (name) => {{
    const entry = document.cookie.split('; ').find((c) => c.startsWith(name + '='));
    return entry ? decodeURIComponent(entry.substring(name.length + 1)) : null;
  }};
  const sessionKey = readCookie({cookie_name});
  try {{
    const res = await fetch('/api/organizations', {{
      credentials: 'include',
      headers: {{ 'accept': 'application/json' }}
    }});
    if (!res.ok) {{
      return {{ org_id: null, session_key: sessionKey, status: res.status }};
    }}
    const orgs = await res.json();
    const first = Array.isArray(orgs) && orgs.length > 0 ? orgs[0] : null;
    return {{ org_id: first && first.uuid ? String(first.uuid) : null, session_key: sessionKey }};
  }} catch (e) {{
    return {{ org_id: null, session_key: sessionKey, error: String(e) }};
  }}
}})()"#
    )
}

/// True when `url` is on the provider (host or subdomain) but outside the
/// sign-in pages, i.e. the user has finished signing in.
pub fn is_signed_in_url(url: &str, provider_host: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    if !matches!(parsed.scheme(), "https" | "http") {
        return false;
    }
    let Some(host) = parsed.host_str() else {
        return false;
    };

    let host = host.to_ascii_lowercase();
    let provider = provider_host.trim().to_ascii_lowercase();
    let on_provider = host == provider || host.ends_with(&format!(".{}", provider));

    let path = parsed.path();
    let on_sign_in_page = SIGN_IN_PATHS
        .iter()
        .any(|prefix| path == *prefix || path.starts_with(&format!("{}/", prefix)));

    on_provider && !on_sign_in_page
}
