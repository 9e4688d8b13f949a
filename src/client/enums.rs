//! Closed enumerations mirroring the Hyper-V cmdlet enums.
//!
//! Each type carries the integer code the cmdlets use and a canonical name.
//! Values serialise as the integer code and deserialise from either form,
//! because `ConvertTo-Json` emits enums as numbers on Windows PowerShell and
//! as names when `-EnumsAsStrings` is in play.

use std::fmt;
use std::marker::PhantomData;

use serde::de::{self, Visitor};

use crate::error::HypervError;

trait WireEnum: Sized {
    const NAME: &'static str;

    fn lookup_code(code: i64) -> Option<Self>;

    fn lookup_label(label: &str) -> Option<Self>;
}

struct WireVisitor<T>(PhantomData<T>);

impl<T: WireEnum> Visitor<'_> for WireVisitor<T> {
    type Value = T;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "a {} code or name", T::NAME)
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<T, E> {
        T::lookup_code(value)
            .ok_or_else(|| E::custom(format!("unknown {} code {value}", T::NAME)))
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<T, E> {
        i64::try_from(value)
            .ok()
            .and_then(T::lookup_code)
            .ok_or_else(|| E::custom(format!("unknown {} code {value}", T::NAME)))
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<T, E> {
        T::lookup_label(value)
            .ok_or_else(|| E::custom(format!("unknown {} name {value:?}", T::NAME)))
    }
}

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $default:ident = $default_code:literal => $default_label:literal,
            $($variant:ident = $code:literal => $label:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
        pub enum $name {
            #[doc = concat!("`", $default_label, "` (code ", stringify!($default_code), ").")]
            #[default]
            $default,
            $(
                #[doc = concat!("`", $label, "` (code ", stringify!($code), ").")]
                $variant,
            )+
        }

        impl $name {
            /// Every variant in declaration order.
            pub const ALL: &'static [Self] = &[Self::$default, $(Self::$variant),+];

            /// Integer code used by the Hyper-V cmdlets.
            #[must_use]
            pub const fn code(self) -> i64 {
                match self {
                    Self::$default => $default_code,
                    $(Self::$variant => $code,)+
                }
            }

            /// Canonical name.
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    Self::$default => $default_label,
                    $(Self::$variant => $label,)+
                }
            }

            /// Looks a variant up by integer code.
            ///
            /// # Errors
            ///
            /// Returns [`HypervError::Validation`] for unknown codes.
            pub fn from_code(code: i64) -> Result<Self, HypervError> {
                <Self as WireEnum>::lookup_code(code).ok_or_else(|| {
                    HypervError::validation(stringify!($name), format!("unknown code {code}"))
                })
            }

            /// Looks a variant up by name, ignoring ASCII case.
            ///
            /// # Errors
            ///
            /// Returns [`HypervError::Validation`] for unknown names.
            pub fn from_label(label: &str) -> Result<Self, HypervError> {
                <Self as WireEnum>::lookup_label(label).ok_or_else(|| {
                    HypervError::validation(stringify!($name), format!("unknown value {label:?}"))
                })
            }
        }

        impl WireEnum for $name {
            const NAME: &'static str = stringify!($name);

            fn lookup_code(code: i64) -> Option<Self> {
                Self::ALL.iter().copied().find(|variant| variant.code() == code)
            }

            fn lookup_label(label: &str) -> Option<Self> {
                let wanted = label.trim();
                Self::ALL
                    .iter()
                    .copied()
                    .find(|variant| variant.as_str().eq_ignore_ascii_case(wanted))
            }
        }

        impl std::str::FromStr for $name {
            type Err = HypervError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                Self::from_label(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_i64(self.code())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                deserializer.deserialize_any(WireVisitor::<Self>(PhantomData))
            }
        }
    };
}

wire_enum! {
    /// Allocation scheme of a virtual hard disk.
    VhdType {
        Unknown = 0 => "Unknown",
        Fixed = 2 => "Fixed",
        Dynamic = 3 => "Dynamic",
        Differencing = 4 => "Differencing",
    }
}

wire_enum! {
    /// On-disk container format of a virtual hard disk.
    VhdFormat {
        Unknown = 0 => "Unknown",
        Vhd = 2 => "VHD",
        Vhdx = 3 => "VHDX",
        VhdSet = 4 => "VHDSet",
    }
}

wire_enum! {
    /// Connectivity of a virtual switch.
    VmSwitchType {
        Private = 0 => "Private",
        Internal = 1 => "Internal",
        External = 2 => "External",
    }
}

wire_enum! {
    /// Runtime state of a virtual machine.
    VmState {
        Unknown = 0 => "Unknown",
        Other = 1 => "Other",
        Running = 2 => "Running",
        Off = 3 => "Off",
        Stopping = 4 => "Stopping",
        Saved = 6 => "Saved",
        Paused = 9 => "Paused",
        Starting = 10 => "Starting",
        Reset = 11 => "Reset",
        Saving = 32773 => "Saving",
        Pausing = 32776 => "Pausing",
        Resuming = 32777 => "Resuming",
        FastSaved = 32779 => "FastSaved",
        FastSaving = 32780 => "FastSaving",
    }
}

impl VmState {
    /// States a caller may request through a status update.
    pub const REQUESTABLE: &'static [Self] = &[Self::Running, Self::Off, Self::Paused, Self::Saved];

    /// Whether the state can be requested rather than only observed.
    #[must_use]
    pub fn is_requestable(self) -> bool {
        Self::REQUESTABLE.contains(&self)
    }
}

wire_enum! {
    /// Checkpoint flavour taken for a virtual machine.
    CheckpointType {
        Unknown = 0 => "Unknown",
        Disabled = 2 => "Disabled",
        Production = 3 => "Production",
        ProductionOnly = 4 => "ProductionOnly",
        Standard = 5 => "Standard",
    }
}

wire_enum! {
    /// Action taken for a virtual machine when the host starts.
    StartAction {
        Unknown = 0 => "Unknown",
        Nothing = 2 => "Nothing",
        StartIfRunning = 3 => "StartIfRunning",
        Start = 4 => "Start",
    }
}

wire_enum! {
    /// Action taken for a virtual machine when the host shuts down.
    StopAction {
        Unknown = 0 => "Unknown",
        TurnOff = 2 => "TurnOff",
        Save = 3 => "Save",
        ShutDown = 4 => "ShutDown",
    }
}

wire_enum! {
    /// Console redirection mode of generation 2 firmware.
    ConsoleMode {
        Default = 0 => "Default",
        Com1 = 1 => "COM1",
        Com2 = 2 => "COM2",
        None = 3 => "None",
    }
}

wire_enum! {
    /// Preferred protocol for network boot.
    IpProtocolPreference {
        Ipv4 = 0 => "IPv4",
        Ipv6 = 1 => "IPv6",
    }
}

wire_enum! {
    /// Two-valued switch used by many VM settings.
    OnOffState {
        On = 0 => "On",
        Off = 1 => "Off",
    }
}

wire_enum! {
    /// Bus a drive is attached to.
    ControllerType {
        Ide = 0 => "IDE",
        Scsi = 1 => "SCSI",
    }
}

wire_enum! {
    /// Port mirroring role of a network adapter.
    PortMirroring {
        None = 0 => "None",
        Destination = 1 => "Destination",
        Source = 2 => "Source",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::BTreeSet;

    fn assert_table_is_bijective<T>(all: &[T], code: fn(T) -> i64, name: fn(T) -> &'static str)
    where
        T: Copy,
    {
        let codes: BTreeSet<i64> = all.iter().map(|v| code(*v)).collect();
        let names: BTreeSet<String> = all.iter().map(|v| name(*v).to_ascii_lowercase()).collect();
        assert_eq!(codes.len(), all.len(), "duplicate codes");
        assert_eq!(names.len(), all.len(), "duplicate names");
    }

    #[test]
    fn tables_are_bijective() {
        assert_table_is_bijective(VhdType::ALL, VhdType::code, VhdType::as_str);
        assert_table_is_bijective(VhdFormat::ALL, VhdFormat::code, VhdFormat::as_str);
        assert_table_is_bijective(VmSwitchType::ALL, VmSwitchType::code, VmSwitchType::as_str);
        assert_table_is_bijective(VmState::ALL, VmState::code, VmState::as_str);
        assert_table_is_bijective(CheckpointType::ALL, CheckpointType::code, CheckpointType::as_str);
        assert_table_is_bijective(StartAction::ALL, StartAction::code, StartAction::as_str);
        assert_table_is_bijective(StopAction::ALL, StopAction::code, StopAction::as_str);
        assert_table_is_bijective(ConsoleMode::ALL, ConsoleMode::code, ConsoleMode::as_str);
        assert_table_is_bijective(
            IpProtocolPreference::ALL,
            IpProtocolPreference::code,
            IpProtocolPreference::as_str,
        );
        assert_table_is_bijective(OnOffState::ALL, OnOffState::code, OnOffState::as_str);
        assert_table_is_bijective(ControllerType::ALL, ControllerType::code, ControllerType::as_str);
        assert_table_is_bijective(PortMirroring::ALL, PortMirroring::code, PortMirroring::as_str);
    }

    #[test]
    fn every_variant_survives_both_lookups() {
        for variant in VmState::ALL {
            assert_eq!(VmState::from_code(variant.code()).ok(), Some(*variant));
            assert_eq!(variant.as_str().parse::<VmState>().ok(), Some(*variant));
        }
    }

    #[rstest]
    #[case("dynamic", VhdType::Dynamic)]
    #[case("DIFFERENCING", VhdType::Differencing)]
    #[case(" Fixed ", VhdType::Fixed)]
    fn names_parse_ignoring_case(#[case] input: &str, #[case] expected: VhdType) {
        assert_eq!(input.parse::<VhdType>().expect("known name"), expected);
    }

    #[test]
    fn unknown_literals_are_validation_errors() {
        let err = "sparse".parse::<VhdType>().expect_err("unknown name");
        assert!(matches!(err, HypervError::Validation { ref field, .. } if field == "VhdType"));
        assert!(VhdFormat::from_code(7).is_err());
    }

    #[test]
    fn serialises_as_code_and_reads_either_form() {
        assert_eq!(serde_json::to_string(&VhdFormat::Vhdx).expect("json"), "3");
        let from_code: VhdFormat = serde_json::from_str("3").expect("code");
        let from_name: VhdFormat = serde_json::from_str("\"vhdx\"").expect("name");
        assert_eq!(from_code, VhdFormat::Vhdx);
        assert_eq!(from_name, VhdFormat::Vhdx);
        assert!(serde_json::from_str::<VhdFormat>("9").is_err());
    }

    #[test]
    fn only_stable_states_are_requestable() {
        assert!(VmState::Running.is_requestable());
        assert!(!VmState::Stopping.is_requestable());
    }
}
