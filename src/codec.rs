//! Record Codec Boundary
//!
//! Records cross the persistence boundary wrapped in an [`Envelope`] that
//! carries retry metadata alongside the application payload. A [`Codec`]
//! turns envelopes into bytes and back; the default [`JsonCodec`] uses
//! serde_json, so any `Serialize + DeserializeOwned` record works out of
//! the box. Codecs must be deterministic and lossless for every field,
//! including the retry metadata.

use std::marker::PhantomData;
use std::time::SystemTime;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};

/// Persisted wrapper around an application record.
///
/// `try_count` starts at 0 and is incremented by the retry scheduler;
/// `first_attempt_at` is set when the record first fails. Both round-trip
/// through the codec so retry state survives a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub(crate) try_count: u32,
    pub(crate) first_attempt_at: Option<SystemTime>,
    pub(crate) record: T,
}

impl<T> Envelope<T> {
    /// Wrap a freshly submitted record.
    pub(crate) fn new(record: T) -> Self {
        Self {
            try_count: 0,
            first_attempt_at: None,
            record,
        }
    }

    /// Reassemble an envelope from its parts. Intended for codec
    /// implementations that do not go through serde.
    pub fn from_parts(record: T, try_count: u32, first_attempt_at: Option<SystemTime>) -> Self {
        Self {
            try_count,
            first_attempt_at,
            record,
        }
    }

    /// Number of failed attempts so far.
    pub fn try_count(&self) -> u32 {
        self.try_count
    }

    /// Wall-clock time of the first failed attempt, if any.
    pub fn first_attempt_at(&self) -> Option<SystemTime> {
        self.first_attempt_at
    }

    pub fn record(&self) -> &T {
        &self.record
    }

    pub fn into_record(self) -> T {
        self.record
    }

    /// Record a failed attempt prior to scheduling a retry.
    pub(crate) fn note_failure(&mut self, now: SystemTime) {
        if self.first_attempt_at.is_none() {
            self.first_attempt_at = Some(now);
        }
        self.try_count += 1;
    }
}

/// Serialization boundary between the queue and the spill store.
pub trait Codec<T>: Send + Sync {
    fn encode(&self, envelope: &Envelope<T>) -> QueueResult<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> QueueResult<Envelope<T>>;
}

/// Default codec persisting envelopes as JSON documents.
pub struct JsonCodec<T> {
    _phantom: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn encode(&self, envelope: &Envelope<T>) -> QueueResult<Vec<u8>> {
        serde_json::to_vec(envelope).map_err(|e| {
            QueueError::io(format!(
                "failed to serialize {}: {}",
                std::any::type_name::<T>(),
                e
            ))
        })
    }

    fn decode(&self, bytes: &[u8]) -> QueueResult<Envelope<T>> {
        serde_json::from_slice(bytes).map_err(|e| {
            let preview_len = bytes.len().min(100);
            QueueError::io(format!(
                "failed to deserialize {}: {} | data_length: {}, data_preview: '{}'",
                std::any::type_name::<T>(),
                e,
                bytes.len(),
                String::from_utf8_lossy(&bytes[..preview_len])
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestRecord {
        id: u64,
        payload: String,
    }

    #[test]
    fn test_envelope_round_trip_preserves_metadata() {
        let codec = JsonCodec::<TestRecord>::new();
        let mut envelope = Envelope::new(TestRecord {
            id: 42,
            payload: "hello".to_string(),
        });
        envelope.note_failure(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        envelope.note_failure(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_100));

        let bytes = codec.encode(&envelope).unwrap();
        let decoded = codec.decode(&bytes).unwrap();

        assert_eq!(decoded.try_count(), 2);
        assert_eq!(
            decoded.first_attempt_at(),
            Some(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000))
        );
        assert_eq!(decoded.record(), envelope.record());
    }

    #[test]
    fn test_note_failure_sets_first_attempt_once() {
        let mut envelope = Envelope::new(TestRecord {
            id: 1,
            payload: String::new(),
        });
        assert_eq!(envelope.try_count(), 0);
        assert!(envelope.first_attempt_at().is_none());

        let t0 = SystemTime::now();
        envelope.note_failure(t0);
        envelope.note_failure(t0 + Duration::from_secs(5));

        assert_eq!(envelope.try_count(), 2);
        assert_eq!(envelope.first_attempt_at(), Some(t0));
    }

    #[test]
    fn test_decode_error_reports_preview() {
        let codec = JsonCodec::<TestRecord>::new();
        let err = codec.decode(b"not json at all").unwrap_err();
        match err {
            QueueError::Io { message } => {
                assert!(message.contains("not json at all"));
                assert!(message.contains("TestRecord"));
            }
            other => panic!("Expected Io error, got: {:?}", other),
        }
    }
}
