//! Domain identifiers.
//!
//! Tasks keep the stable string id written in the sprint definition.
//! Runtime records (sessions, completion signals) get ULID ids through the
//! generic `Id<T>` type, where `T` is a zero-sized marker. The marker never
//! exists at runtime, it only keeps `SessionId` and `SignalId` from being
//! mixed up at compile time.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Borrow;
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// Marker trait for `Id<T>`. Provides the display prefix.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ULID-backed identifier, rendered as `<prefix><ulid>`.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Error returned when a string is not a valid `Id<T>`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid id '{0}'")]
pub struct ParseIdError(String);

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    /// Accepts both the prefixed form and a bare ULID.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw)
            .map(Self::from_ulid)
            .map_err(|_| ParseIdError(s.to_string()))
    }
}

impl<T: IdMarker> Serialize for Id<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de, T: IdMarker> Deserialize<'de> for Id<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Session {}

impl IdMarker for Session {
    fn prefix() -> &'static str {
        "session-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Signal {}

impl IdMarker for Signal {
    fn prefix() -> &'static str {
        "signal-"
    }
}

/// Identifier of a WorkSession (one worker bound to one task).
pub type SessionId = Id<Session>;

/// Identifier of a published CompletionSignal.
pub type SignalId = Id<Signal>;

/// Stable task identifier taken from the sprint definition.
///
/// Task ids double as channel file names, so only `[A-Za-z0-9._-]` is
/// accepted by [`TaskId::is_well_formed`]. The check runs at load time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_well_formed(&self) -> bool {
        !self.0.is_empty()
            && !self.0.starts_with('.')
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Borrow<str> for TaskId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_render_with_prefix() {
        let session = SessionId::from_ulid(Ulid::new());
        let signal = SignalId::from_ulid(Ulid::new());

        assert!(session.to_string().starts_with("session-"));
        assert!(signal.to_string().starts_with("signal-"));
        // let _: SessionId = signal; // <- does not compile
    }

    #[test]
    fn ids_parse_with_or_without_prefix() {
        let ulid = Ulid::new();
        let prefixed: SessionId = format!("session-{ulid}").parse().unwrap();
        let bare: SessionId = ulid.to_string().parse().unwrap();
        assert_eq!(prefixed, bare);
        assert!("session-not-a-ulid".parse::<SessionId>().is_err());
    }

    #[test]
    fn ids_serialize_as_strings() {
        let id = SignalId::from_ulid(Ulid::new());
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: SignalId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn phantom_marker_is_free() {
        assert_eq!(std::mem::size_of::<SessionId>(), std::mem::size_of::<Ulid>());
    }

    #[test]
    fn task_id_character_set() {
        assert!(TaskId::new("api-2.auth_v1").is_well_formed());
        assert!(!TaskId::new("").is_well_formed());
        assert!(!TaskId::new("../escape").is_well_formed());
        assert!(!TaskId::new("has space").is_well_formed());
        assert!(!TaskId::new(".hidden").is_well_formed());
    }
}
