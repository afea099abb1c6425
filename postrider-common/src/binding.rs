//! Delayed retry-queue bindings.
//!
//! Every message that cannot be delivered right now is republished to one of
//! the broker's time-delayed queues. The bindings form a fixed chain: each
//! transient failure moves the message one step further along it, until it
//! lands in the terminal `not_send` queue.

use serde::{Deserialize, Serialize};

/// A named delayed queue on the broker side.
///
/// `Unknown` is what a freshly published message carries; the chain starts
/// at [`Binding::Second`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Binding {
    #[default]
    Unknown,
    Second,
    ThirtySecond,
    Minute,
    FiveMinutes,
    TenMinutes,
    TwentyMinutes,
    ThirtyMinutes,
    FortyMinutes,
    FiftyMinutes,
    Hour,
    SixHours,
    Day,
    NotSend,
}

impl Binding {
    /// The next-longer delay in the chain. `NotSend` is terminal.
    #[must_use]
    pub const fn next(self) -> Self {
        match self {
            Self::Unknown => Self::Second,
            Self::Second => Self::ThirtySecond,
            Self::ThirtySecond => Self::Minute,
            Self::Minute => Self::FiveMinutes,
            Self::FiveMinutes => Self::TenMinutes,
            Self::TenMinutes => Self::TwentyMinutes,
            Self::TwentyMinutes => Self::ThirtyMinutes,
            Self::ThirtyMinutes => Self::FortyMinutes,
            Self::FortyMinutes => Self::FiftyMinutes,
            Self::FiftyMinutes => Self::Hour,
            Self::Hour => Self::SixHours,
            Self::SixHours => Self::Day,
            Self::Day | Self::NotSend => Self::NotSend,
        }
    }

    /// Queue name used when republishing.
    #[must_use]
    pub const fn queue_name(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Second => "second",
            Self::ThirtySecond => "thirty_second",
            Self::Minute => "minute",
            Self::FiveMinutes => "five_minutes",
            Self::TenMinutes => "ten_minutes",
            Self::TwentyMinutes => "twenty_minutes",
            Self::ThirtyMinutes => "thirty_minutes",
            Self::FortyMinutes => "forty_minutes",
            Self::FiftyMinutes => "fifty_minutes",
            Self::Hour => "hour",
            Self::SixHours => "six_hours",
            Self::Day => "day",
            Self::NotSend => "not_send",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_walks_to_not_send() {
        let mut binding = Binding::Unknown;
        let mut steps = 0;
        while binding != Binding::NotSend {
            binding = binding.next();
            steps += 1;
            assert!(steps <= 13, "chain must terminate");
        }
        assert_eq!(steps, 13);
    }

    #[test]
    fn test_not_send_is_terminal() {
        assert_eq!(Binding::NotSend.next(), Binding::NotSend);
    }

    #[test]
    fn test_serde_names_are_camel_case() {
        let binding: Binding = serde_json::from_str("\"thirtySecond\"").unwrap();
        assert_eq!(binding, Binding::ThirtySecond);
        assert_eq!(
            serde_json::to_string(&Binding::FiveMinutes).unwrap(),
            "\"fiveMinutes\""
        );
    }
}
