//! In-band control messages.
//!
//! A control message travels on the regular data queue and is recognised by its sender
//! identity (`app_id`) together with its `type` property. The consumer loop acknowledges and
//! handles it itself; it never reaches the delivery handler.
//!
//! | type          | body                    | effect                                 |
//! |---------------|-------------------------|----------------------------------------|
//! | `shutdown`    | ignored                 | flush, then stop after this message    |
//! | `reconfigure` | JSON array of integers  | retune prefetch, idle timeout, batch   |
//!
//! A producer that happens to use the reserved app id and one of these types will be taken
//! for a control message, so pick a [`control_app_id`](crate::ConsumerConfig::control_app_id)
//! no application uses.

use std::time::Duration;

use thiserror::Error;

use crate::Envelope;

/// Default reserved app id of control messages
pub const DEFAULT_CONTROL_APP_ID: &str = "ackloop";

/// `type` of the shutdown control message
pub const SHUTDOWN: &str = "shutdown";

/// `type` of the reconfigure control message
pub const RECONFIGURE: &str = "reconfigure";

/// A recognised control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Shutdown,
    Reconfigure,
    /// Sent by the reserved app id with a type this consumer does not know
    Unknown(String),
}

impl ControlMessage {
    /// Classify an envelope. Returns `None` for application traffic.
    pub fn from_envelope(envelope: &Envelope, control_app_id: &str) -> Option<Self> {
        if envelope.app_id() != Some(control_app_id) {
            return None;
        }

        Some(match envelope.message_type().unwrap_or_default() {
            SHUTDOWN => ControlMessage::Shutdown,
            RECONFIGURE => ControlMessage::Reconfigure,
            other => ControlMessage::Unknown(other.to_owned()),
        })
    }
}

/// Why a reconfigure body was refused
#[derive(Debug, Error)]
pub enum ReconfigureError {
    #[error("reconfigure body is not a JSON array of integers: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("reconfigure needs at least 3 values, got {0}")]
    TooFewValues(usize),

    #[error("reconfigure value at position {index} is out of range: {value}")]
    OutOfRange { index: usize, value: i64 },

    #[error("reconfigure batch size must be greater than zero")]
    ZeroBatchSize,
}

/// Tuning parameters carried by a `reconfigure` message.
///
/// The body is `[prefetch_count, idle_timeout_secs, batch_size, prefetch_size?, ...]`. An idle
/// timeout of `0` disables idle flushing. Values after the fourth are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconfigure {
    pub prefetch_count: u16,
    pub idle_timeout: Option<Duration>,
    pub batch_size: usize,
    pub prefetch_size: u32,
}

impl Reconfigure {
    pub fn parse(body: &[u8]) -> Result<Self, ReconfigureError> {
        let values: Vec<i64> = serde_json::from_slice(body)?;
        if values.len() < 3 {
            return Err(ReconfigureError::TooFewValues(values.len()));
        }

        let prefetch_count = u16::try_from(values[0]).map_err(|_| ReconfigureError::OutOfRange {
            index: 0,
            value: values[0],
        })?;
        let idle_secs = u64::try_from(values[1]).map_err(|_| ReconfigureError::OutOfRange {
            index: 1,
            value: values[1],
        })?;
        let batch_size = usize::try_from(values[2]).map_err(|_| ReconfigureError::OutOfRange {
            index: 2,
            value: values[2],
        })?;
        if batch_size == 0 {
            return Err(ReconfigureError::ZeroBatchSize);
        }
        let prefetch_size = match values.get(3) {
            Some(&value) => u32::try_from(value)
                .map_err(|_| ReconfigureError::OutOfRange { index: 3, value })?,
            None => 0,
        };

        Ok(Self {
            prefetch_count,
            idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
            batch_size,
            prefetch_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessageAttributes;

    fn control(message_type: &str) -> Envelope {
        Envelope::new("", 1).with_attributes(
            MessageAttributes::default()
                .with_app_id(DEFAULT_CONTROL_APP_ID)
                .with_message_type(message_type),
        )
    }

    #[test]
    fn recognises_control_messages_by_app_id_and_type() {
        assert_eq!(
            ControlMessage::from_envelope(&control("shutdown"), DEFAULT_CONTROL_APP_ID),
            Some(ControlMessage::Shutdown)
        );
        assert_eq!(
            ControlMessage::from_envelope(&control("reconfigure"), DEFAULT_CONTROL_APP_ID),
            Some(ControlMessage::Reconfigure)
        );
        assert_eq!(
            ControlMessage::from_envelope(&control("pause"), DEFAULT_CONTROL_APP_ID),
            Some(ControlMessage::Unknown("pause".to_owned()))
        );
    }

    #[test]
    fn application_traffic_is_not_control() {
        let envelope = Envelope::new("", 1).with_attributes(
            MessageAttributes::default()
                .with_app_id("orders")
                .with_message_type("shutdown"),
        );
        assert_eq!(ControlMessage::from_envelope(&envelope, DEFAULT_CONTROL_APP_ID), None);
        assert_eq!(ControlMessage::from_envelope(&Envelope::new("", 1), DEFAULT_CONTROL_APP_ID), None);
    }

    #[test]
    fn parses_reconfigure_body() {
        let reconfigure = Reconfigure::parse(b"[1,5,8,0,1]").unwrap();
        assert_eq!(
            reconfigure,
            Reconfigure {
                prefetch_count: 1,
                idle_timeout: Some(Duration::from_secs(5)),
                batch_size: 8,
                prefetch_size: 0,
            }
        );

        let reconfigure = Reconfigure::parse(b"[10, 0, 3]").unwrap();
        assert_eq!(reconfigure.idle_timeout, None);
        assert_eq!(reconfigure.prefetch_size, 0);
    }

    #[test]
    fn rejects_bad_reconfigure_bodies() {
        assert!(matches!(
            Reconfigure::parse(b"not json"),
            Err(ReconfigureError::Malformed(_))
        ));
        assert!(matches!(
            Reconfigure::parse(b"{\"batch\": 3}"),
            Err(ReconfigureError::Malformed(_))
        ));
        assert!(matches!(
            Reconfigure::parse(b"[1, 2]"),
            Err(ReconfigureError::TooFewValues(2))
        ));
        assert!(matches!(
            Reconfigure::parse(b"[1, -2, 3]"),
            Err(ReconfigureError::OutOfRange { index: 1, value: -2 })
        ));
        assert!(matches!(
            Reconfigure::parse(b"[70000, 2, 3]"),
            Err(ReconfigureError::OutOfRange { index: 0, .. })
        ));
        assert!(matches!(
            Reconfigure::parse(b"[1, 2, 0]"),
            Err(ReconfigureError::ZeroBatchSize)
        ));
    }
}
