//! Row view models returned by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use crate::notify::AlertNotification;

/// Outbox slice used by the delivery worker.
#[derive(Debug, Clone)]
pub struct NotificationForOutbox {
    pub id: i64,
    pub attempt: i32,
    pub notification: AlertNotification,
}
