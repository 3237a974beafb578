use serde::{Deserialize, Serialize};

use crate::model::{ObservationCounts, StopId};

/// JSON text messages sent from the relay to its client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Connected {
        stop_id: Option<StopId>,
        url: String,
        fps_mode: String,
        target_fps: f32,
        skip_factor: u32,
    },
    /// Sent after every emitted frame. `people_count`/`bus_count` are smoothed.
    #[serde(rename_all = "camelCase")]
    Metadata {
        people_count: u32,
        bus_count: u32,
        frame_number: u64,
        raw: ObservationCounts,
        smoothed: ObservationCounts,
    },
    Error {
        message: String,
    },
    Closed {
        reason: String,
    },
}

impl ServerMessage {
    pub fn metadata(frame_number: u64, raw: ObservationCounts, smoothed: ObservationCounts) -> Self {
        ServerMessage::Metadata {
            people_count: smoothed.people,
            bus_count: smoothed.buses,
            frame_number,
            raw,
            smoothed,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_wire_shape() -> anyhow::Result<()> {
        let msg = ServerMessage::metadata(
            12,
            ObservationCounts { people: 9, buses: 1 },
            ObservationCounts { people: 2, buses: 1 },
        );
        let value = serde_json::to_value(&msg)?;
        assert_eq!(value["type"], "metadata");
        assert_eq!(value["peopleCount"], 2);
        assert_eq!(value["busCount"], 1);
        assert_eq!(value["frameNumber"], 12);
        assert_eq!(value["raw"]["people"], 9);
        Ok(())
    }

    #[test]
    fn connected_uses_camel_case_fields() -> anyhow::Result<()> {
        let msg = ServerMessage::Connected {
            stop_id: Some(3),
            url: "stub://x".to_string(),
            fps_mode: "active".to_string(),
            target_fps: 8.0,
            skip_factor: 3,
        };
        let value = serde_json::to_value(&msg)?;
        assert_eq!(value["type"], "connected");
        assert_eq!(value["stopId"], 3);
        assert_eq!(value["skipFactor"], 3);
        Ok(())
    }
}
