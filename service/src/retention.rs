use std::time::Duration;

use crate::Error;

/// The retention ladder a client may choose from when creating a clip.
///
/// The token is persisted verbatim on the upload session; the clip's
/// expiration is computed once, at publication, from the completion time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    FiveMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    OneHour,
    SixHours,
    TwentyFourHours,
}

impl Retention {
    pub const ALL: [Retention; 6] = [
        Retention::FiveMinutes,
        Retention::FifteenMinutes,
        Retention::ThirtyMinutes,
        Retention::OneHour,
        Retention::SixHours,
        Retention::TwentyFourHours,
    ];

    pub fn as_token(&self) -> &'static str {
        match self {
            Retention::FiveMinutes => "5min",
            Retention::FifteenMinutes => "15min",
            Retention::ThirtyMinutes => "30min",
            Retention::OneHour => "1hr",
            Retention::SixHours => "6hr",
            Retention::TwentyFourHours => "24hr",
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            Retention::FiveMinutes => Duration::from_secs(5 * 60),
            Retention::FifteenMinutes => Duration::from_secs(15 * 60),
            Retention::ThirtyMinutes => Duration::from_secs(30 * 60),
            Retention::OneHour => Duration::from_secs(60 * 60),
            Retention::SixHours => Duration::from_secs(6 * 60 * 60),
            Retention::TwentyFourHours => Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl std::str::FromStr for Retention {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Retention::ALL
            .into_iter()
            .find(|r| r.as_token() == s)
            .ok_or_else(|| Error::InvalidRetention(s.to_string()))
    }
}

impl std::fmt::Display for Retention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_token())
    }
}
