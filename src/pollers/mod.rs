//! Background pollers: email, calendar, service health.
//!
//! Each poller is a [`BackgroundAgent`](crate::scheduler::BackgroundAgent)
//! registered with the scheduler. Pollers detect external events and
//! return `notify_user` tasks; the queue consumer turns those into
//! published notifications. Provider calls go through collaborator traits
//! returning records already normalised by the transport layer.

pub mod calendar;
pub mod email;
pub mod health;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::Integration;

/// An unread email normalised by the email collaborator, newest first in
/// listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    /// Provider message id.
    pub id: String,
    /// Sender address.
    pub from: String,
    /// Subject line.
    pub subject: String,
    /// Delivery timestamp.
    pub received_at: DateTime<Utc>,
}

/// Email provider collaborator.
#[async_trait]
pub trait EmailProvider: Send + Sync {
    /// List unread messages since `since`, newest first, at most `max`.
    ///
    /// # Errors
    ///
    /// Returns an error if the mailbox is unreachable.
    async fn list_unread(
        &self,
        integration: &Integration,
        since: DateTime<Utc>,
        max: usize,
    ) -> anyhow::Result<Vec<EmailMessage>>;
}

/// A calendar event normalised by the calendar collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarEvent {
    /// Provider event id.
    pub id: String,
    /// Event title.
    pub title: String,
    /// Start time.
    pub start: DateTime<Utc>,
}

/// Calendar provider collaborator.
#[async_trait]
pub trait CalendarProvider: Send + Sync {
    /// List events starting within `[start, end)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the calendar is unreachable.
    async fn list_events(
        &self,
        integration: &Integration,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<CalendarEvent>>;
}
