//! Default User-Agent sent by the reqwest transport.

/// Project URL for User-Agent identification.
const PROJECT_UA_URL: &str = "https://github.com/fetchq/fetchq";

/// Default User-Agent identifying the engine and its version.
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("fetchq/{version} (+{PROJECT_UA_URL})")
}
