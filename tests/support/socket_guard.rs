//! Skips wiremock-backed tests in sandboxes that forbid loopback sockets.
//!
//! Set `FETCHQ_REQUIRE_SOCKET_TESTS=1` (CI) to turn a skip into a failure.

use std::net::TcpListener;
use std::panic::Location;
use std::sync::OnceLock;

use wiremock::MockServer;

const REQUIRE_ENV: &str = "FETCHQ_REQUIRE_SOCKET_TESTS";

/// Whether a loopback listener can be bound; probed once per test binary.
fn loopback_available() -> bool {
    static AVAILABLE: OnceLock<bool> = OnceLock::new();
    *AVAILABLE.get_or_init(|| TcpListener::bind(("127.0.0.1", 0)).is_ok())
}

fn skip_forbidden() -> bool {
    std::env::var(REQUIRE_ENV).is_ok_and(|value| {
        matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
    })
}

/// Starts a mock server, or returns `None` after logging why the caller's test is skipped.
///
/// Panics instead of skipping when [`REQUIRE_ENV`] is set.
#[track_caller]
pub fn start_mock_server_or_skip() -> impl Future<Output = Option<MockServer>> {
    let caller = Location::caller();
    let available = loopback_available();
    async move {
        if available {
            return Some(MockServer::start().await);
        }
        let reason = format!("{}:{}: loopback sockets unavailable", caller.file(), caller.line());
        assert!(!skip_forbidden(), "{reason} and {REQUIRE_ENV} is set");
        eprintln!("skipping: {reason} (set {REQUIRE_ENV}=1 to fail instead)");
        None
    }
}
