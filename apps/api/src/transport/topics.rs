//! Topic hierarchy shared by the broker, the bridge socket and the poll path
//!
//! Inbound (device -> service):
//! - `devices/{deviceId}/heartbeat`
//! - `devices/{deviceId}/status`
//! - `devices/discovery/announce`
//! - `devices/{deviceId}/events`
//! - `devices/{deviceId}/progress`
//!
//! Outbound (service -> device):
//! - `devices/{deviceId}/commands/{command}`
//! - `sessions/{sessionId}/commands/{command}`
//! - `sessions/{sessionId}/participants/{participantId}/commands/{command}`

use uuid::Uuid;

use crate::models::validate_device_id;

pub const ANNOUNCE_TOPIC: &str = "devices/discovery/announce";

/// Pattern the broker listener subscribes to
pub const INBOUND_PATTERN: &str = "devices/*";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    Heartbeat { device_id: String },
    Status { device_id: String },
    Announce,
    Events { device_id: String },
    Progress { device_id: String },
    DeviceCommand { device_id: String, command: String },
    SessionCommand { session_id: Uuid, command: String },
    ParticipantCommand {
        session_id: Uuid,
        participant_id: Uuid,
        command: String,
    },
}

impl Topic {
    pub fn parse(topic: &str) -> Option<Self> {
        if topic == ANNOUNCE_TOPIC {
            return Some(Self::Announce);
        }

        let parts: Vec<&str> = topic.split('/').collect();
        match parts.as_slice() {
            ["devices", device_id, leaf] if is_device_segment(device_id) => {
                let device_id = device_id.to_string();
                match *leaf {
                    "heartbeat" => Some(Self::Heartbeat { device_id }),
                    "status" => Some(Self::Status { device_id }),
                    "events" => Some(Self::Events { device_id }),
                    "progress" => Some(Self::Progress { device_id }),
                    _ => None,
                }
            }
            ["devices", device_id, "commands", command] if is_device_segment(device_id) => {
                Some(Self::DeviceCommand {
                    device_id: device_id.to_string(),
                    command: command.to_string(),
                })
            }
            ["sessions", session_id, "commands", command] => Some(Self::SessionCommand {
                session_id: Uuid::parse_str(session_id).ok()?,
                command: command.to_string(),
            }),
            ["sessions", session_id, "participants", participant_id, "commands", command] => {
                Some(Self::ParticipantCommand {
                    session_id: Uuid::parse_str(session_id).ok()?,
                    participant_id: Uuid::parse_str(participant_id).ok()?,
                    command: command.to_string(),
                })
            }
            _ => None,
        }
    }

    /// Whether devices publish on this topic
    pub fn is_inbound(&self) -> bool {
        matches!(
            self,
            Self::Heartbeat { .. }
                | Self::Status { .. }
                | Self::Announce
                | Self::Events { .. }
                | Self::Progress { .. }
        )
    }

    pub fn device_command(device_id: &str, command: &str) -> String {
        format!("devices/{}/commands/{}", device_id, command)
    }

    pub fn session_command(session_id: Uuid, command: &str) -> String {
        format!("sessions/{}/commands/{}", session_id, command)
    }

    pub fn participant_command(session_id: Uuid, participant_id: Uuid, command: &str) -> String {
        format!(
            "sessions/{}/participants/{}/commands/{}",
            session_id, participant_id, command
        )
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Heartbeat { device_id } => write!(f, "devices/{}/heartbeat", device_id),
            Self::Status { device_id } => write!(f, "devices/{}/status", device_id),
            Self::Announce => f.write_str(ANNOUNCE_TOPIC),
            Self::Events { device_id } => write!(f, "devices/{}/events", device_id),
            Self::Progress { device_id } => write!(f, "devices/{}/progress", device_id),
            Self::DeviceCommand { device_id, command } => {
                f.write_str(&Self::device_command(device_id, command))
            }
            Self::SessionCommand {
                session_id,
                command,
            } => f.write_str(&Self::session_command(*session_id, command)),
            Self::ParticipantCommand {
                session_id,
                participant_id,
                command,
            } => f.write_str(&Self::participant_command(
                *session_id,
                *participant_id,
                command,
            )),
        }
    }
}

fn is_device_segment(segment: &str) -> bool {
    segment != "discovery" && validate_device_id(segment).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("devices/VR_#001/heartbeat", Topic::Heartbeat { device_id: "VR_#001".into() })]
    #[case("devices/CHAIR_#002/status", Topic::Status { device_id: "CHAIR_#002".into() })]
    #[case("devices/discovery/announce", Topic::Announce)]
    #[case("devices/VR_#001/events", Topic::Events { device_id: "VR_#001".into() })]
    #[case("devices/VR_#001/progress", Topic::Progress { device_id: "VR_#001".into() })]
    #[case(
        "devices/VR_#001/commands/pause",
        Topic::DeviceCommand { device_id: "VR_#001".into(), command: "pause".into() }
    )]
    fn test_parse_device_topics(#[case] raw: &str, #[case] expected: Topic) {
        let parsed = Topic::parse(raw).unwrap();
        assert_eq!(parsed, expected);
        assert_eq!(parsed.to_string(), raw);
    }

    #[test]
    fn test_parse_session_topics() {
        let sid = Uuid::new_v4();
        let pid = Uuid::new_v4();

        let raw = Topic::session_command(sid, "start");
        assert_eq!(
            Topic::parse(&raw),
            Some(Topic::SessionCommand {
                session_id: sid,
                command: "start".into()
            })
        );

        let raw = Topic::participant_command(sid, pid, "seek");
        let parsed = Topic::parse(&raw).unwrap();
        assert!(!parsed.is_inbound());
        assert_eq!(parsed.to_string(), raw);
    }

    #[rstest]
    #[case("devices/discovery/heartbeat")]
    #[case("devices/VR_#001/unknown")]
    #[case("devices/+/heartbeat")]
    #[case("sessions/not-a-uuid/commands/start")]
    #[case("")]
    fn test_rejects_malformed(#[case] raw: &str) {
        assert!(Topic::parse(raw).is_none());
    }

    #[test]
    fn test_inbound_classification() {
        assert!(Topic::Announce.is_inbound());
        assert!(Topic::Heartbeat {
            device_id: "x".into()
        }
        .is_inbound());
        assert!(!Topic::DeviceCommand {
            device_id: "x".into(),
            command: "stop".into()
        }
        .is_inbound());
    }
}
