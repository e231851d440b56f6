use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Log-assigned entry identifier.
///
/// Opaque to the worker apart from ordering. Redis stream ids have the shape
/// `<millis>-<seq>` and are ordered numerically on both parts; anything else
/// falls back to byte order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(String);

impl EntryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn parts(&self) -> Option<(u64, u64)> {
        let (ms, seq) = self.0.split_once('-')?;
        Some((ms.parse().ok()?, seq.parse().ok()?))
    }
}

impl Ord for EntryId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.parts(), other.parts()) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            _ => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for EntryId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntryId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for EntryId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// One entry read from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub id: EntryId,
    /// `None` when the entry is still pending but its body was trimmed from
    /// the stream.
    pub payload: Option<Vec<u8>>,
}

impl LogEntry {
    pub fn new(id: impl Into<EntryId>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            payload: Some(payload.into()),
        }
    }

    pub fn trimmed(id: impl Into<EntryId>) -> Self {
        Self {
            id: id.into(),
            payload: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_ids_order_numerically() {
        let mut ids: Vec<EntryId> = ["1700000000000-10", "1700000000000-9", "999-0"]
            .into_iter()
            .map(EntryId::from)
            .collect();
        ids.sort();

        assert_eq!(
            ids.iter().map(EntryId::as_str).collect::<Vec<_>>(),
            vec!["999-0", "1700000000000-9", "1700000000000-10"]
        );
    }

    #[test]
    fn test_non_stream_ids_fall_back_to_string_order() {
        assert!(EntryId::from("a") < EntryId::from("b"));
    }
}
