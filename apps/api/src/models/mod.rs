//! Database models and types for Lockstep
//!
//! This module contains SQLx models for:
//! - Devices (VR headsets and motion chairs)
//! - Pairing codes, bundles and device pairs
//! - Sessions, participants, playback entries and the session log

pub mod device;
pub mod pairing;
pub mod session;

pub use device::{validate_device_id, Device, DeviceKind, DeviceValidationError, UpsertDevice};
pub use pairing::{
    BundleState, BundleStatus, DevicePair, IssuedCode, PairingBundle, PairingCode,
};
pub use session::{
    ClockPhase, CommandParseError, OverallStatus, ParticipantStatus, PlaybackClock,
    PlaybackEntry, SeatInfo, Session, SessionCommand, SessionDetail, SessionLog, MAX_POSITION_MS,
    SessionParticipant, SessionStatus, SessionType, TransitionRejected,
};
