//! PIN-gated access session.
//!
//! At most one [`SessionRecord`] exists per [`AccessSession`]. Creating a new
//! record replaces the old one unconditionally; the controller is the only
//! place that enforces "one session at a time". A PIN is only ever compared
//! against the current record, so ending (or replacing) the session
//! invalidates the old PIN for every later check, including checks coming from
//! sockets that are still open.
//!
//! The client set is bookkeeping for the connected-client count shown in the
//! UI. It is never consulted for authorization.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use rand::Rng;
use tracing::{debug, info};

use crate::error::RemoteAccessError;

/// Lowest and highest PIN values; every PIN is exactly six decimal digits.
const PIN_MIN: u32 = 100_000;
const PIN_MAX: u32 = 999_999;

/// Snapshot of the current session.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub pin: String,
    pub url: Option<String>,
    pub created_at: SystemTime,
    pub clients: HashSet<String>,
}

/// Process-wide access session, shared by the controller and the gateway.
///
/// Cloning is cheap; all clones observe the same record.
#[derive(Clone, Default)]
pub struct AccessSession {
    inner: Arc<RwLock<Option<SessionRecord>>>,
}

/// Draw a uniformly random PIN in `[100000, 999999]`.
pub fn generate_pin() -> String {
    let value = rand::thread_rng().gen_range(PIN_MIN..=PIN_MAX);
    format!("{value:06}")
}

impl AccessSession {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Option<SessionRecord>> {
        self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Option<SessionRecord>> {
        self.inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Start a fresh session with a new PIN, replacing any existing one.
    /// Returns the new PIN.
    pub fn create(&self) -> String {
        let pin = generate_pin();
        let replaced = self
            .write()
            .replace(SessionRecord {
                pin: pin.clone(),
                url: None,
                created_at: SystemTime::now(),
                clients: HashSet::new(),
            })
            .is_some();
        info!(replaced, "Access session created");
        pin
    }

    /// Exact match against the current session's PIN; `false` without a session.
    pub fn validate_pin(&self, pin: &str) -> bool {
        self.read()
            .as_ref()
            .is_some_and(|s| constant_time_eq(s.pin.as_bytes(), pin.as_bytes()))
    }

    /// Validate `pin` and, on success, mint and register an opaque client id.
    pub fn authenticate(&self, pin: &str) -> Result<String, RemoteAccessError> {
        let mut guard = self.write();
        let Some(record) = guard.as_mut() else {
            return Err(RemoteAccessError::Authentication);
        };
        if !constant_time_eq(record.pin.as_bytes(), pin.as_bytes()) {
            return Err(RemoteAccessError::Authentication);
        }
        let client_id = uuid::Uuid::new_v4().to_string();
        record.clients.insert(client_id.clone());
        Ok(client_id)
    }

    /// Attach the public tunnel URL once discovered. No-op without a session.
    pub fn set_url(&self, url: &str) {
        if let Some(record) = self.write().as_mut() {
            record.url = Some(url.to_string());
        }
    }

    pub fn add_client(&self, id: &str) {
        if let Some(record) = self.write().as_mut() {
            record.clients.insert(id.to_string());
        }
    }

    pub fn remove_client(&self, id: &str) {
        if let Some(record) = self.write().as_mut() {
            if record.clients.remove(id) {
                debug!(client_id = %crate::util::short_id(id), "Client removed from session");
            }
        }
    }

    /// Clear the record. The previous PIN is invalid from here on.
    pub fn end(&self) {
        if self.write().take().is_some() {
            info!("Access session ended");
        }
    }

    pub fn is_active(&self) -> bool {
        self.read().is_some()
    }

    pub fn client_count(&self) -> usize {
        self.read().as_ref().map_or(0, |s| s.clients.len())
    }

    pub fn snapshot(&self) -> Option<SessionRecord> {
        self.read().clone()
    }
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the PIN length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pins_are_six_digits_in_range() {
        for _ in 0..2000 {
            let pin = generate_pin();
            assert_eq!(pin.len(), 6);
            assert!(pin.bytes().all(|b| b.is_ascii_digit()));
            let value: u32 = pin.parse().unwrap();
            assert!((PIN_MIN..=PIN_MAX).contains(&value));
        }
    }

    #[test]
    fn validate_without_session_is_false() {
        let session = AccessSession::new();
        assert!(!session.validate_pin("123456"));
        assert!(!session.validate_pin(""));
    }

    #[test]
    fn validate_matches_latest_pin_only() {
        let session = AccessSession::new();
        let first = session.create();
        assert!(session.validate_pin(&first));

        let second = loop {
            let pin = session.create();
            if pin != first {
                break pin;
            }
        };
        assert!(session.validate_pin(&second));
        assert!(!session.validate_pin(&first));
    }

    #[test]
    fn end_invalidates_previous_pin() {
        let session = AccessSession::new();
        let pin = session.create();
        assert!(session.validate_pin(&pin));
        session.end();
        assert!(!session.validate_pin(&pin));
        assert!(!session.is_active());
    }

    #[test]
    fn prefix_and_extension_do_not_match() {
        let session = AccessSession::new();
        let pin = session.create();
        assert!(!session.validate_pin(&pin[..5]));
        assert!(!session.validate_pin(&format!("{pin}0")));
    }

    #[test]
    fn authenticate_registers_client() {
        let session = AccessSession::new();
        let pin = session.create();
        assert!(matches!(
            session.authenticate("000000"),
            Err(RemoteAccessError::Authentication)
        ));
        let id = session.authenticate(&pin).unwrap();
        assert_eq!(session.client_count(), 1);
        session.remove_client(&id);
        assert_eq!(session.client_count(), 0);
    }

    #[test]
    fn clones_share_state() {
        let session = AccessSession::new();
        let other = session.clone();
        let pin = session.create();
        other.set_url("https://a.trycloudflare.com");
        assert!(other.validate_pin(&pin));
        assert_eq!(
            session.snapshot().and_then(|s| s.url).as_deref(),
            Some("https://a.trycloudflare.com")
        );
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"482913", b"482913"));
        assert!(!constant_time_eq(b"482913", b"482914"));
        assert!(!constant_time_eq(b"482913", b""));
    }
}
