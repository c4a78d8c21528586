//! Preference & policy gate.
//!
//! Decides, per channel, whether a notification is delivered now,
//! deferred past quiet hours, folded into a digest, or dropped. The
//! pure planning logic is separated from the store/cache plumbing so
//! the rules are testable without backends.

pub mod digest;

use chrono::{DateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use tracing::debug;

use crate::cache::TokenBlacklist;
use crate::notification::{Channel, Notification, Priority};
use crate::repository::{DeliveryFrequency, Preference, PreferenceStore, CATEGORY_ANY};
use crate::Result;

pub use digest::DigestBuffer;

/// Why a channel was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    ChannelDisabled,
    FrequencyOff,
    QuietHours,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::ChannelDisabled => "channel_disabled",
            DropReason::FrequencyOff => "frequency_off",
            DropReason::QuietHours => "quiet_hours",
        }
    }
}

/// Per-channel plan produced by the gate
#[derive(Debug, Clone, Default)]
pub struct GatePlan {
    /// Channels to deliver immediately
    pub deliver: Vec<Channel>,

    /// Channels deferred until quiet hours end
    pub deferred: Vec<(Channel, DateTime<Utc>)>,

    /// Channels folded into the digest buffer
    pub digested: Vec<Channel>,

    /// Channels dropped outright
    pub dropped: Vec<(Channel, DropReason)>,
}

impl GatePlan {
    /// Nothing survives in any form: the notification is suppressed.
    pub fn is_suppressed(&self) -> bool {
        self.deliver.is_empty() && self.deferred.is_empty() && self.digested.is_empty()
    }
}

/// Gate outcome for one notification
#[derive(Debug)]
pub enum GateOutcome {
    /// At least one channel proceeds (now, deferred, or digested)
    Proceed(GatePlan),

    /// No channel survives; carries the suppression reason
    Suppressed(String),
}

/// Preference & policy gate
pub struct PreferenceGate {
    preferences: std::sync::Arc<dyn PreferenceStore>,
    blacklist: TokenBlacklist,
    digest: DigestBuffer,
}

impl PreferenceGate {
    pub fn new(
        preferences: std::sync::Arc<dyn PreferenceStore>,
        blacklist: TokenBlacklist,
        digest: DigestBuffer,
    ) -> Self {
        Self {
            preferences,
            blacklist,
            digest,
        }
    }

    /// Evaluate a notification against the recipient's preferences.
    /// Digested channels are appended to the digest buffer as a side
    /// effect.
    pub async fn gate(&self, notification: &Notification, now: DateTime<Utc>) -> Result<GateOutcome> {
        if self.blacklist.is_user_revoked(notification.user_id).await {
            return Ok(GateOutcome::Suppressed("revoked".to_string()));
        }

        let preference = self
            .effective_preference(notification.user_id, notification.kind.category())
            .await?;

        let plan = plan_channels(&preference, notification, now);

        for (channel, reason) in &plan.dropped {
            debug!(
                notification = %notification.id,
                channel = %channel,
                reason = reason.as_str(),
                "Channel dropped by policy"
            );
        }

        if plan.is_suppressed() {
            return Ok(GateOutcome::Suppressed("suppressed".to_string()));
        }

        for channel in &plan.digested {
            self.digest
                .append(
                    notification.user_id,
                    notification.kind.category(),
                    preference.frequency,
                    notification.id,
                    *channel,
                )
                .await?;
        }

        Ok(GateOutcome::Proceed(plan))
    }

    async fn effective_preference(
        &self,
        user_id: uuid::Uuid,
        category: &str,
    ) -> Result<Preference> {
        let rows = self.preferences.list_for_user(user_id).await?;
        Ok(resolve_effective(rows, user_id, category))
    }
}

/// Most-specific preference wins: `(user, category)` over `(user, *)`
/// over the built-in default.
pub fn resolve_effective(
    rows: Vec<Preference>,
    user_id: uuid::Uuid,
    category: &str,
) -> Preference {
    let specific = rows.iter().find(|p| p.category == category);
    let wildcard = rows.iter().find(|p| p.category == CATEGORY_ANY);

    specific
        .or(wildcard)
        .cloned()
        .unwrap_or_else(|| Preference::default_for(user_id))
}

/// Whether a string names a known IANA timezone.
pub fn valid_timezone(name: &str) -> bool {
    name.parse::<Tz>().is_ok()
}

/// Pure per-channel planning. `CRITICAL` overrides quiet hours but
/// never a channel opt-out.
pub fn plan_channels(
    preference: &Preference,
    notification: &Notification,
    now: DateTime<Utc>,
) -> GatePlan {
    let mut plan = GatePlan::default();

    // Empty channel set on the record means the channels come from the
    // recipient's preferences.
    let requested: Vec<Channel> = if notification.channels.is_empty() {
        preference.channels_enabled.0.clone()
    } else {
        notification.channels.0.clone()
    };

    let quiet = quiet_window(preference, now);

    for channel in requested {
        if !preference.channel_enabled(channel) {
            plan.dropped.push((channel, DropReason::ChannelDisabled));
            continue;
        }

        if preference.frequency == DeliveryFrequency::Off {
            plan.dropped.push((channel, DropReason::FrequencyOff));
            continue;
        }

        if let Some(resume_at) = quiet {
            if notification.priority < Priority::Critical {
                if preference.defer_during_quiet_hours {
                    plan.deferred.push((channel, resume_at));
                } else {
                    plan.dropped.push((channel, DropReason::QuietHours));
                }
                continue;
            }
        }

        if preference.frequency.bucket_secs().is_some() {
            plan.digested.push(channel);
            continue;
        }

        plan.deliver.push(channel);
    }

    plan
}

/// If `now` falls inside the preference's quiet hours, returns when
/// they end (in UTC). Overnight windows (start > end) are supported.
fn quiet_window(preference: &Preference, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (start, end) = match (preference.quiet_hours_start, preference.quiet_hours_end) {
        (Some(start), Some(end)) => (start, end),
        _ => return None,
    };

    let tz: Option<Tz> = preference
        .timezone
        .as_deref()
        .and_then(|name| name.parse().ok());

    match tz {
        Some(tz) => {
            let local = now.with_timezone(&tz);
            if !in_window(local.time(), start, end) {
                return None;
            }
            Some(next_end(local.date_naive(), local.time(), end, |date, time| {
                tz.from_local_datetime(&date.and_time(time))
                    .earliest()
                    .map(|dt| dt.with_timezone(&Utc))
            }))
        }
        None => {
            let local = now.naive_utc();
            if !in_window(local.time(), start, end) {
                return None;
            }
            Some(next_end(local.date(), local.time(), end, |date, time| {
                Some(Utc.from_utc_datetime(&date.and_time(time)))
            }))
        }
    }
}

fn in_window(t: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    if start <= end {
        t >= start && t < end
    } else {
        // Overnight window, e.g. 22:00-08:00
        t >= start || t < end
    }
}

fn next_end<F>(
    date: chrono::NaiveDate,
    time: NaiveTime,
    end: NaiveTime,
    to_utc: F,
) -> DateTime<Utc>
where
    F: Fn(chrono::NaiveDate, NaiveTime) -> Option<DateTime<Utc>>,
{
    let end_date = if time < end {
        date
    } else {
        date.succ_opt().unwrap_or(date)
    };

    to_utc(end_date, end)
        // Skip over DST gaps rather than failing the deferral
        .or_else(|| to_utc(end_date, end.with_hour((end.hour() + 1) % 24).unwrap_or(end)))
        .unwrap_or_else(|| Utc::now() + chrono::Duration::hours(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::NotificationKind;
    use chrono::TimeZone;
    use sqlx::types::Json;
    use uuid::Uuid;

    fn notification(priority: Priority, channels: Vec<Channel>) -> Notification {
        Notification::new(
            Uuid::new_v4(),
            NotificationKind::SystemAlert,
            "t".to_string(),
            "c".to_string(),
        )
        .with_priority(priority)
        .with_channels(channels)
    }

    fn preference() -> Preference {
        Preference::default_for(Uuid::new_v4())
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_enabled_channels_deliver() {
        let plan = plan_channels(
            &preference(),
            &notification(Priority::Normal, vec![Channel::Email, Channel::InApp]),
            at(12),
        );
        assert_eq!(plan.deliver, vec![Channel::Email, Channel::InApp]);
        assert!(plan.deferred.is_empty());
        assert!(!plan.is_suppressed());
    }

    #[test]
    fn test_disabled_channel_dropped() {
        let mut pref = preference();
        pref.channels_enabled = Json(vec![Channel::InApp]);

        let plan = plan_channels(
            &pref,
            &notification(Priority::Normal, vec![Channel::Email, Channel::InApp]),
            at(12),
        );
        assert_eq!(plan.deliver, vec![Channel::InApp]);
        assert_eq!(plan.dropped, vec![(Channel::Email, DropReason::ChannelDisabled)]);
    }

    #[test]
    fn test_empty_channel_set_derived_from_preferences() {
        let mut pref = preference();
        pref.channels_enabled = Json(vec![Channel::Push]);

        let plan = plan_channels(&pref, &notification(Priority::Normal, vec![]), at(12));
        assert_eq!(plan.deliver, vec![Channel::Push]);
    }

    #[test]
    fn test_quiet_hours_defer_normal_priority() {
        let mut pref = preference();
        pref.quiet_hours_start = Some(NaiveTime::from_hms_opt(22, 0, 0).unwrap());
        pref.quiet_hours_end = Some(NaiveTime::from_hms_opt(8, 0, 0).unwrap());

        // 23:00 UTC is inside the overnight window
        let plan = plan_channels(
            &pref,
            &notification(Priority::Normal, vec![Channel::Email]),
            at(23),
        );
        assert!(plan.deliver.is_empty());
        assert_eq!(plan.deferred.len(), 1);

        let (channel, resume_at) = plan.deferred[0];
        assert_eq!(channel, Channel::Email);
        // Deferred until 08:00 the next day
        assert_eq!(resume_at, Utc.with_ymd_and_hms(2026, 3, 11, 8, 0, 0).unwrap());
    }

    #[test]
    fn test_quiet_hours_resume_same_day_in_early_morning() {
        let mut pref = preference();
        pref.quiet_hours_start = Some(NaiveTime::from_hms_opt(22, 0, 0).unwrap());
        pref.quiet_hours_end = Some(NaiveTime::from_hms_opt(8, 0, 0).unwrap());

        let plan = plan_channels(
            &pref,
            &notification(Priority::Normal, vec![Channel::Email]),
            at(6),
        );
        let (_, resume_at) = plan.deferred[0];
        assert_eq!(resume_at, Utc.with_ymd_and_hms(2026, 3, 10, 8, 0, 0).unwrap());
    }

    #[test]
    fn test_critical_bypasses_quiet_hours() {
        let mut pref = preference();
        pref.quiet_hours_start = Some(NaiveTime::from_hms_opt(22, 0, 0).unwrap());
        pref.quiet_hours_end = Some(NaiveTime::from_hms_opt(8, 0, 0).unwrap());

        let plan = plan_channels(
            &pref,
            &notification(Priority::Critical, vec![Channel::Email]),
            at(23),
        );
        assert_eq!(plan.deliver, vec![Channel::Email]);
        assert!(plan.deferred.is_empty());
    }

    #[test]
    fn test_critical_respects_channel_opt_out() {
        let mut pref = preference();
        pref.channels_enabled = Json(vec![Channel::InApp]);

        let plan = plan_channels(
            &pref,
            &notification(Priority::Critical, vec![Channel::Email]),
            at(12),
        );
        assert!(plan.is_suppressed());
        assert_eq!(plan.dropped, vec![(Channel::Email, DropReason::ChannelDisabled)]);
    }

    #[test]
    fn test_quiet_hours_drop_when_defer_disabled() {
        let mut pref = preference();
        pref.quiet_hours_start = Some(NaiveTime::from_hms_opt(22, 0, 0).unwrap());
        pref.quiet_hours_end = Some(NaiveTime::from_hms_opt(8, 0, 0).unwrap());
        pref.defer_during_quiet_hours = false;

        let plan = plan_channels(
            &pref,
            &notification(Priority::Normal, vec![Channel::Email]),
            at(23),
        );
        assert!(plan.is_suppressed());
        assert_eq!(plan.dropped, vec![(Channel::Email, DropReason::QuietHours)]);
    }

    #[test]
    fn test_quiet_hours_respect_timezone() {
        let mut pref = preference();
        pref.quiet_hours_start = Some(NaiveTime::from_hms_opt(22, 0, 0).unwrap());
        pref.quiet_hours_end = Some(NaiveTime::from_hms_opt(8, 0, 0).unwrap());
        pref.timezone = Some("America/New_York".to_string());

        // 23:00 UTC on 2026-03-10 is 19:00 in New York (EDT): outside
        let plan = plan_channels(
            &pref,
            &notification(Priority::Normal, vec![Channel::Email]),
            at(23),
        );
        assert_eq!(plan.deliver, vec![Channel::Email]);

        // 03:00 UTC is 23:00 in New York the previous evening: inside
        let plan = plan_channels(
            &pref,
            &notification(Priority::Normal, vec![Channel::Email]),
            at(3),
        );
        assert_eq!(plan.deferred.len(), 1);
    }

    #[test]
    fn test_digest_frequency_withholds_delivery() {
        let mut pref = preference();
        pref.frequency = DeliveryFrequency::DigestDaily;

        let plan = plan_channels(
            &pref,
            &notification(Priority::Normal, vec![Channel::Email]),
            at(12),
        );
        assert!(plan.deliver.is_empty());
        assert_eq!(plan.digested, vec![Channel::Email]);
        assert!(!plan.is_suppressed());
    }

    #[test]
    fn test_frequency_off_drops() {
        let mut pref = preference();
        pref.frequency = DeliveryFrequency::Off;

        let plan = plan_channels(
            &pref,
            &notification(Priority::Normal, vec![Channel::Email]),
            at(12),
        );
        assert!(plan.is_suppressed());
        assert_eq!(plan.dropped, vec![(Channel::Email, DropReason::FrequencyOff)]);
    }

    #[test]
    fn test_most_specific_preference_wins() {
        let user_id = Uuid::new_v4();

        let mut wildcard = Preference::default_for(user_id);
        wildcard.frequency = DeliveryFrequency::DigestDaily;

        let mut specific = Preference::default_for(user_id);
        specific.category = "system_alert".to_string();
        specific.frequency = DeliveryFrequency::Immediate;

        let rows = vec![wildcard.clone(), specific.clone()];

        let effective = resolve_effective(rows.clone(), user_id, "system_alert");
        assert_eq!(effective.frequency, DeliveryFrequency::Immediate);

        // Other categories fall back to the wildcard row
        let effective = resolve_effective(rows, user_id, "buddy_request");
        assert_eq!(effective.frequency, DeliveryFrequency::DigestDaily);

        // No rows at all: built-in default
        let effective = resolve_effective(Vec::new(), user_id, "buddy_request");
        assert_eq!(effective.frequency, DeliveryFrequency::Immediate);
        assert_eq!(effective.category, CATEGORY_ANY);
    }

    #[test]
    fn test_day_window_not_crossing_midnight() {
        let mut pref = preference();
        pref.quiet_hours_start = Some(NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        pref.quiet_hours_end = Some(NaiveTime::from_hms_opt(17, 0, 0).unwrap());

        let inside = plan_channels(
            &pref,
            &notification(Priority::Normal, vec![Channel::Email]),
            at(12),
        );
        assert_eq!(inside.deferred.len(), 1);

        let outside = plan_channels(
            &pref,
            &notification(Priority::Normal, vec![Channel::Email]),
            at(18),
        );
        assert_eq!(outside.deliver, vec![Channel::Email]);
    }
}
