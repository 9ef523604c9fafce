//! Request ledger shared by the network listener tasks.
//!
//! Two mappings keyed by devtools request id: the URL seen on
//! `requestWillBeSent` and the failure text seen on `responseReceived`
//! (HTTP status >= 400) or `loadingFailed`. Four listener tasks write
//! concurrently, so both maps sit behind one lock.

use std::collections::HashMap;

use parking_lot::RwLock;

/// Chrome reports some subresource failures as an abort first and the real
/// cause second; an abort entry may be upgraded, anything else is final.
const ABORT_SENTINEL: &str = "net::ERR_ABORTED";

#[derive(Default)]
struct Entries {
    urls: HashMap<String, String>,
    errors: HashMap<String, String>,
}

#[derive(Default)]
pub(crate) struct RequestLedger {
    entries: RwLock<Entries>,
}

impl RequestLedger {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_request(&self, request_id: &str, url: &str) {
        let mut entries = self.entries.write();
        entries
            .urls
            .insert(request_id.to_string(), url.to_string());
    }

    /// Records an HTTP error observation. Overwrites an existing entry only
    /// when that entry is the abort sentinel. Returns whether the entry was
    /// written, which is the caller's cue to cancel the readiness scope.
    pub(crate) fn record_response_error(&self, request_id: &str, message: &str) -> bool {
        let mut entries = self.entries.write();
        match entries.errors.get(request_id) {
            Some(existing) if existing != ABORT_SENTINEL => false,
            _ => {
                entries
                    .errors
                    .insert(request_id.to_string(), message.to_string());
                true
            }
        }
    }

    /// Records a load failure. First entry wins. Returns whether the entry
    /// was written.
    pub(crate) fn record_load_failure(&self, request_id: &str, message: &str) -> bool {
        let mut entries = self.entries.write();
        if entries.errors.contains_key(request_id) {
            return false;
        }
        entries
            .errors
            .insert(request_id.to_string(), message.to_string());
        true
    }

    pub(crate) fn url_for(&self, request_id: &str) -> String {
        self.entries
            .read()
            .urls
            .get(request_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Newline-joined `"<url>: <message>"` report, or `None` when every
    /// request went through cleanly.
    pub(crate) fn failure_report(&self) -> Option<String> {
        let entries = self.entries.read();
        if entries.errors.is_empty() {
            return None;
        }
        let lines: Vec<String> = entries
            .errors
            .iter()
            .map(|(request_id, message)| {
                let url = entries.urls.get(request_id).cloned().unwrap_or_default();
                format!("{url}: {message}")
            })
            .collect();
        Some(lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_error_wins() {
        let ledger = RequestLedger::new();
        assert!(ledger.record_response_error("1", "404 Not Found"));
        assert!(!ledger.record_response_error("1", "500 Internal Server Error"));
        assert!(!ledger.record_load_failure("1", "net::ERR_FAILED"));
        let report = ledger.failure_report().unwrap();
        assert!(report.contains("404 Not Found"));
        assert!(!report.contains("500"));
    }

    #[test]
    fn abort_entries_upgrade_to_the_real_cause() {
        let ledger = RequestLedger::new();
        assert!(ledger.record_load_failure("9", "net::ERR_ABORTED"));
        assert!(ledger.record_response_error("9", "404 Not Found"));
        let report = ledger.failure_report().unwrap();
        assert!(report.contains("404 Not Found"));
        assert!(!report.contains("net::ERR_ABORTED"));
    }

    #[test]
    fn report_joins_url_and_message() {
        let ledger = RequestLedger::new();
        ledger.record_request("7", "http://t/api");
        ledger.record_response_error("7", "503 Service Unavailable");
        assert_eq!(
            ledger.failure_report().unwrap(),
            "http://t/api: 503 Service Unavailable"
        );
    }

    #[test]
    fn clean_ledger_reports_nothing() {
        let ledger = RequestLedger::new();
        ledger.record_request("1", "http://t/ok");
        assert!(ledger.failure_report().is_none());
    }
}
