//! Scalar values carried by PTP metrics

use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// A metric sample that decodes into a typed value
pub trait MetricValue: Copy + PartialEq + Debug + Send + Sync + 'static {
    fn from_sample(value: f64) -> Option<Self>;
    fn to_sample(self) -> f64;
}

macro_rules! metric_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl MetricValue for $name {
            fn from_sample(value: f64) -> Option<Self> {
                $(if value == $value as f64 {
                    return Some($name::$variant);
                })+
                None
            }

            fn to_sample(self) -> f64 {
                match self {
                    $($name::$variant => $value as f64),+
                }
            }
        }
    };
}

metric_enum!(
    /// `openshift_ptp_clock_state`
    ClockState { Freerun = 0, Locked = 1, Holdover = 2 }
);

metric_enum!(
    /// `openshift_ptp_interface_role`
    InterfaceRole { Passive = 0, Follower = 1, Listening = 2, Faulty = 3, Leader = 4, Unknown = 5 }
);

metric_enum!(
    /// `openshift_ptp_process_status`
    ProcessStatus { Down = 0, Up = 1 }
);

metric_enum!(
    /// `openshift_ptp_ha_profile_status`
    HaProfileStatus { Inactive = 0, Active = 1 }
);

/// `openshift_ptp_clock_class`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClockClass(pub u8);

impl ClockClass {
    pub const LOCKED: ClockClass = ClockClass(6);
    pub const HOLDOVER_IN_SPEC: ClockClass = ClockClass(7);
    pub const HOLDOVER_OUT_OF_SPEC: ClockClass = ClockClass(140);
    pub const FREERUN: ClockClass = ClockClass(248);
    pub const DEFAULT: ClockClass = ClockClass(255);
}

impl MetricValue for ClockClass {
    fn from_sample(value: f64) -> Option<Self> {
        if value.fract() == 0.0 && (0.0..=255.0).contains(&value) {
            Some(ClockClass(value as u8))
        } else {
            None
        }
    }

    fn to_sample(self) -> f64 {
        self.0 as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_decoding() {
        assert_eq!(ClockState::from_sample(1.0), Some(ClockState::Locked));
        assert_eq!(ClockState::from_sample(3.0), None);
        assert_eq!(InterfaceRole::from_sample(2.0), Some(InterfaceRole::Listening));
        assert_eq!(ProcessStatus::Up.to_sample(), 1.0);
        assert_eq!(HaProfileStatus::from_sample(0.0), Some(HaProfileStatus::Inactive));
    }

    #[test]
    fn test_clock_class_decoding() {
        assert_eq!(ClockClass::from_sample(6.0), Some(ClockClass::LOCKED));
        assert_eq!(ClockClass::from_sample(6.5), None);
        assert_eq!(ClockClass::from_sample(300.0), None);
    }
}
