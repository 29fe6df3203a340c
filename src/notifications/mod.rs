//! Typed notifications and their fan-out to the application.
//!
//! Records from the notification feed and push messages are validated here,
//! at the boundary, into [`Notification`] values. [`NotificationCenter`]
//! delivers each one to subscribed observers exactly once.

mod center;
mod model;

pub use center::NotificationCenter;
pub use model::{
    EquipmentUpdate, Notification, NotificationKind, NotificationSource, DEFAULT_CHANNEL,
    EMERGENCY_CHANNEL, EQUIPMENT_CHANNEL, HOLD_CHANNEL, MESSAGE_CHANNEL, REQUEST_CHANNEL,
};
