//! Business-hours scheduling.
//!
//! Non-emergency messages are only sent inside the facility's local windows:
//! Monday to Friday and Saturday have one window each, Sunday is closed.
//! Outside a window the message is deferred to a single deterministic start:
//!
//! 1. before today's opening on a weekday or Saturday: today's opening;
//! 2. otherwise: the next weekday (Monday to Friday) opening.

use time::{Date, OffsetDateTime, Time, UtcOffset, Weekday};

use crate::config::BusinessHoursConfig;
use crate::error::NotificationError;
use crate::types::Priority;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleDecision {
    pub send_now: bool,
    /// Equal to `now` when `send_now` is true
    pub next_window_start: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct BusinessHours {
    offset: UtcOffset,
    weekday: (Time, Time),
    saturday: (Time, Time),
}

impl BusinessHours {
    pub fn from_config(config: &BusinessHoursConfig) -> Result<Self, NotificationError> {
        Ok(Self {
            offset: config.offset().map_err(NotificationError::InvalidConfig)?,
            weekday: config
                .weekday_window()
                .map_err(NotificationError::InvalidConfig)?,
            saturday: config
                .saturday_window()
                .map_err(NotificationError::InvalidConfig)?,
        })
    }

    pub fn decide(&self, now: OffsetDateTime, priority: Priority) -> ScheduleDecision {
        if priority == Priority::Emergency || self.is_open(now) {
            return ScheduleDecision {
                send_now: true,
                next_window_start: now,
            };
        }
        ScheduleDecision {
            send_now: false,
            next_window_start: self.next_window_start(now),
        }
    }

    pub fn is_open(&self, now: OffsetDateTime) -> bool {
        let local = now.to_offset(self.offset);
        match self.window(local.weekday()) {
            Some((open, close)) => local.time() >= open && local.time() < close,
            None => false,
        }
    }

    /// Start of the next window for a time outside business hours.
    pub fn next_window_start(&self, now: OffsetDateTime) -> OffsetDateTime {
        let local = now.to_offset(self.offset);
        let today = local.date();

        if let Some((open, _)) = self.window(today.weekday())
            && local.time() < open
        {
            return self.at(today, open);
        }

        let mut day = today;
        loop {
            day = match day.next_day() {
                Some(d) => d,
                None => return now,
            };
            if is_weekday(day.weekday()) {
                return self.at(day, self.weekday.0);
            }
        }
    }

    fn window(&self, weekday: Weekday) -> Option<(Time, Time)> {
        match weekday {
            Weekday::Sunday => None,
            Weekday::Saturday => Some(self.saturday),
            _ => Some(self.weekday),
        }
    }

    fn at(&self, date: Date, time: Time) -> OffsetDateTime {
        date.with_time(time)
            .assume_offset(self.offset)
            .to_offset(UtcOffset::UTC)
    }
}

fn is_weekday(weekday: Weekday) -> bool {
    !matches!(weekday, Weekday::Saturday | Weekday::Sunday)
}
