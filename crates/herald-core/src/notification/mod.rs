//! Notification domain model: channels, priorities, the persistent
//! record, and its delivery state machine.

pub mod message;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

pub use message::{NotificationMessage, X_ATTEMPTS, X_CORRELATION_ID, X_FIRST_ENQUEUED_AT};

/// Delivery channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    Email,
    InApp,
    Push,
    Sms,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::Email, Channel::InApp, Channel::Push, Channel::Sms];

    /// Stable lowercase name used in queue names and metric labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::InApp => "in_app",
            Channel::Push => "push",
            Channel::Sms => "sms",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "email" => Ok(Channel::Email),
            "in_app" | "inapp" => Ok(Channel::InApp),
            "push" => Ok(Channel::Push),
            "sms" => Ok(Channel::Sms),
            _ => Err(format!("Invalid channel: {}", s)),
        }
    }
}

/// Notification priority; ordering drives queue selection and the
/// quiet-hours override.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl Priority {
    /// Routing key on the main exchange; `HIGH` and above take the
    /// priority lane.
    pub fn routing_key(&self) -> &'static str {
        match self {
            Priority::Low | Priority::Normal => "notification.created",
            Priority::High => "notification.priority.high",
            Priority::Urgent => "notification.priority.urgent",
            Priority::Critical => "notification.priority.critical",
        }
    }

    /// AMQP per-message priority (the priority queue declares
    /// `x-max-priority = 10`).
    pub fn amqp_priority(&self) -> u8 {
        match self {
            Priority::Low => 1,
            Priority::Normal => 3,
            Priority::High => 6,
            Priority::Urgent => 8,
            Priority::Critical => 10,
        }
    }

    pub fn is_priority_lane(&self) -> bool {
        *self >= Priority::High
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
            Priority::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// Domain event categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    PasswordReset,
    HiveInvitation,
    BuddyRequest,
    AchievementUnlocked,
    SystemAlert,
}

impl NotificationKind {
    /// Preference category key; `*` is the wildcard category.
    pub fn category(&self) -> &'static str {
        match self {
            NotificationKind::PasswordReset => "password_reset",
            NotificationKind::HiveInvitation => "hive_invitation",
            NotificationKind::BuddyRequest => "buddy_request",
            NotificationKind::AchievementUnlocked => "achievement_unlocked",
            NotificationKind::SystemAlert => "system_alert",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.category())
    }
}

impl std::str::FromStr for NotificationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "password_reset" => Ok(NotificationKind::PasswordReset),
            "hive_invitation" => Ok(NotificationKind::HiveInvitation),
            "buddy_request" => Ok(NotificationKind::BuddyRequest),
            "achievement_unlocked" => Ok(NotificationKind::AchievementUnlocked),
            "system_alert" => Ok(NotificationKind::SystemAlert),
            _ => Err(format!("Invalid notification kind: {}", s)),
        }
    }
}

/// Delivery lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationState {
    Pending,
    Queued,
    Rendered,
    Sending,
    Sent,
    Failed,
    Dead,
    Archived,
}

impl Default for NotificationState {
    fn default() -> Self {
        NotificationState::Pending
    }
}

impl NotificationState {
    /// Terminal states never transition except into the archive.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NotificationState::Sent | NotificationState::Dead | NotificationState::Archived
        )
    }

    /// Whether a dispatcher or worker touching a record in this state
    /// must treat the message as already handled.
    pub fn is_in_flight_or_done(&self) -> bool {
        matches!(self, NotificationState::Sending) || self.is_terminal()
    }

    /// Legal transitions of the delivery state machine. The only
    /// backward edge is the transient-failure retry
    /// (`Sending -> Queued`) and the dead-letter replay
    /// (`Dead | Failed -> Queued`).
    pub fn can_transition_to(&self, to: NotificationState) -> bool {
        use NotificationState::*;
        match (*self, to) {
            (Pending, Queued) | (Pending, Sent) | (Pending, Dead) => true,
            (Queued, Rendered) | (Queued, Sending) | (Queued, Sent) | (Queued, Dead) => true,
            (Rendered, Sending) | (Rendered, Dead) => true,
            (Sending, Sent) | (Sending, Queued) | (Sending, Failed) | (Sending, Dead) => true,
            (Failed, Queued) | (Failed, Dead) | (Failed, Archived) => true,
            (Dead, Queued) | (Dead, Archived) => true,
            (Sent, Archived) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for NotificationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NotificationState::Pending => "pending",
            NotificationState::Queued => "queued",
            NotificationState::Rendered => "rendered",
            NotificationState::Sending => "sending",
            NotificationState::Sent => "sent",
            NotificationState::Failed => "failed",
            NotificationState::Dead => "dead",
            NotificationState::Archived => "archived",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for NotificationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(NotificationState::Pending),
            "queued" => Ok(NotificationState::Queued),
            "rendered" => Ok(NotificationState::Rendered),
            "sending" => Ok(NotificationState::Sending),
            "sent" => Ok(NotificationState::Sent),
            "failed" => Ok(NotificationState::Failed),
            "dead" => Ok(NotificationState::Dead),
            "archived" => Ok(NotificationState::Archived),
            _ => Err(format!("Invalid notification state: {}", s)),
        }
    }
}

/// The persistent notification record. This row is the single source
/// of truth for a delivery; broker messages only point at it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: NotificationKind,
    pub priority: Priority,
    pub title: String,
    pub content: String,
    pub template_id: Option<String>,
    pub variables: serde_json::Value,
    pub locale: Option<String>,
    pub channels: Json<Vec<Channel>>,
    pub metadata: serde_json::Value,
    pub state: NotificationState,
    pub attempts: i32,
    pub suppressed_reason: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn new(user_id: Uuid, kind: NotificationKind, title: String, content: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            kind,
            priority: Priority::default(),
            title,
            content,
            template_id: None,
            variables: serde_json::Value::Null,
            locale: None,
            channels: Json(Vec::new()),
            metadata: serde_json::Value::Null,
            state: NotificationState::Pending,
            attempts: 0,
            suppressed_reason: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            sent_at: None,
            read_at: None,
            deleted_at: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_channels(mut self, channels: Vec<Channel>) -> Self {
        self.channels = Json(channels);
        self
    }

    pub fn with_template(
        mut self,
        template_id: impl Into<String>,
        variables: serde_json::Value,
    ) -> Self {
        self.template_id = Some(template_id.into());
        self.variables = variables;
        self
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn wants_channel(&self, channel: Channel) -> bool {
        self.channels.iter().any(|c| *c == channel)
    }

    pub fn is_read(&self) -> bool {
        self.read_at.is_some()
    }

    /// The recipient email, taken only from the stored record.
    pub fn user_email(&self) -> Option<String> {
        self.metadata
            .get("userEmail")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    pub fn can_retry(&self, max_retries: i32) -> bool {
        !self.state.is_terminal() && self.attempts < max_retries
    }
}

/// Paged listing filter for the ingress API
#[derive(Debug, Clone, Default)]
pub struct NotificationFilter {
    pub is_read: Option<bool>,
    pub kind: Option<NotificationKind>,
}

/// Per-user delivery statistics for the admin surface
#[derive(Debug, Clone, Serialize)]
pub struct NotificationStats {
    pub total: i64,
    pub pending: i64,
    pub sent: i64,
    pub failed: i64,
    pub dead: i64,
    pub unread: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::Urgent);
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn test_priority_routing_keys() {
        assert_eq!(Priority::Low.routing_key(), "notification.created");
        assert_eq!(Priority::Normal.routing_key(), "notification.created");
        assert_eq!(Priority::High.routing_key(), "notification.priority.high");
        assert_eq!(
            Priority::Critical.routing_key(),
            "notification.priority.critical"
        );
        assert!(!Priority::Normal.is_priority_lane());
        assert!(Priority::High.is_priority_lane());
    }

    #[test]
    fn test_amqp_priority_bounded() {
        for p in [
            Priority::Low,
            Priority::Normal,
            Priority::High,
            Priority::Urgent,
            Priority::Critical,
        ] {
            assert!(p.amqp_priority() <= 10);
        }
        assert_eq!(Priority::Critical.amqp_priority(), 10);
    }

    #[test]
    fn test_state_machine_forward_edges() {
        use NotificationState::*;
        assert!(Pending.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Sending));
        assert!(Sending.can_transition_to(Sent));
        assert!(Sending.can_transition_to(Dead));
        assert!(Sent.can_transition_to(Archived));
    }

    #[test]
    fn test_state_machine_retry_and_replay_edges() {
        use NotificationState::*;
        // transient failure re-queues
        assert!(Sending.can_transition_to(Queued));
        // dead-letter replay
        assert!(Dead.can_transition_to(Queued));
        assert!(Failed.can_transition_to(Queued));
    }

    #[test]
    fn test_state_machine_rejects_illegal_edges() {
        use NotificationState::*;
        assert!(!Sent.can_transition_to(Sending));
        assert!(!Sent.can_transition_to(Queued));
        assert!(!Archived.can_transition_to(Queued));
        assert!(!Pending.can_transition_to(Sending));
        assert!(!Dead.can_transition_to(Sent));
    }

    #[test]
    fn test_terminal_states() {
        assert!(NotificationState::Sent.is_terminal());
        assert!(NotificationState::Dead.is_terminal());
        assert!(NotificationState::Archived.is_terminal());
        assert!(!NotificationState::Sending.is_terminal());
        assert!(NotificationState::Sending.is_in_flight_or_done());
        assert!(!NotificationState::Queued.is_in_flight_or_done());
    }

    #[test]
    fn test_notification_builder() {
        let n = Notification::new(
            Uuid::new_v4(),
            NotificationKind::PasswordReset,
            "Reset your password".to_string(),
            "Use the link".to_string(),
        )
        .with_priority(Priority::High)
        .with_channels(vec![Channel::Email])
        .with_metadata(serde_json::json!({"userEmail": "a@x.com"}));

        assert_eq!(n.state, NotificationState::Pending);
        assert_eq!(n.attempts, 0);
        assert!(n.wants_channel(Channel::Email));
        assert!(!n.wants_channel(Channel::Sms));
        assert_eq!(n.user_email(), Some("a@x.com".to_string()));
    }

    #[test]
    fn test_kind_roundtrip() {
        for kind in [
            NotificationKind::PasswordReset,
            NotificationKind::HiveInvitation,
            NotificationKind::BuddyRequest,
            NotificationKind::AchievementUnlocked,
            NotificationKind::SystemAlert,
        ] {
            let parsed: NotificationKind = kind.category().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_channel_serde_names() {
        let json = serde_json::to_string(&Channel::InApp).unwrap();
        assert_eq!(json, "\"IN_APP\"");
        let parsed: Channel = serde_json::from_str("\"EMAIL\"").unwrap();
        assert_eq!(parsed, Channel::Email);
    }
}
