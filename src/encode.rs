//! pprof protobuf encoding of a [`Profile`].
//!
//! Output is the uncompressed `perftools.profiles.Profile` message, which
//! `go tool pprof` and other pprof readers accept as-is.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use prost::Message;

use crate::profile::{Profile, ValueType};

/// Wire types of `perftools.profiles` (profile.proto).
pub mod proto {
    /// Root message.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Profile {
        #[prost(message, repeated, tag = "1")]
        pub sample_type: Vec<ValueType>,
        #[prost(message, repeated, tag = "2")]
        pub sample: Vec<Sample>,
        #[prost(message, repeated, tag = "3")]
        pub mapping: Vec<Mapping>,
        #[prost(message, repeated, tag = "4")]
        pub location: Vec<Location>,
        #[prost(message, repeated, tag = "5")]
        pub function: Vec<Function>,
        #[prost(string, repeated, tag = "6")]
        pub string_table: Vec<String>,
        #[prost(int64, tag = "7")]
        pub drop_frames: i64,
        #[prost(int64, tag = "8")]
        pub keep_frames: i64,
        #[prost(int64, tag = "9")]
        pub time_nanos: i64,
        #[prost(int64, tag = "10")]
        pub duration_nanos: i64,
        #[prost(message, optional, tag = "11")]
        pub period_type: Option<ValueType>,
        #[prost(int64, tag = "12")]
        pub period: i64,
        #[prost(int64, repeated, tag = "13")]
        pub comment: Vec<i64>,
        #[prost(int64, tag = "14")]
        pub default_sample_type: i64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ValueType {
        #[prost(int64, tag = "1")]
        pub r#type: i64,
        #[prost(int64, tag = "2")]
        pub unit: i64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Sample {
        #[prost(uint64, repeated, tag = "1")]
        pub location_id: Vec<u64>,
        #[prost(int64, repeated, tag = "2")]
        pub value: Vec<i64>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Mapping {
        #[prost(uint64, tag = "1")]
        pub id: u64,
        #[prost(uint64, tag = "2")]
        pub memory_start: u64,
        #[prost(uint64, tag = "3")]
        pub memory_limit: u64,
        #[prost(uint64, tag = "4")]
        pub file_offset: u64,
        #[prost(int64, tag = "5")]
        pub filename: i64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Location {
        #[prost(uint64, tag = "1")]
        pub id: u64,
        #[prost(uint64, tag = "2")]
        pub mapping_id: u64,
        #[prost(uint64, tag = "3")]
        pub address: u64,
        #[prost(message, repeated, tag = "4")]
        pub line: Vec<Line>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Line {
        #[prost(uint64, tag = "1")]
        pub function_id: u64,
        #[prost(int64, tag = "2")]
        pub line: i64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Function {
        #[prost(uint64, tag = "1")]
        pub id: u64,
        #[prost(int64, tag = "2")]
        pub name: i64,
        #[prost(int64, tag = "3")]
        pub system_name: i64,
        #[prost(int64, tag = "4")]
        pub filename: i64,
        #[prost(int64, tag = "5")]
        pub start_line: i64,
    }
}

/// Interns strings into the pprof string table; index 0 is always "".
#[derive(Default)]
struct StringTable {
    strings: Vec<String>,
    index: HashMap<String, i64>,
}

impl StringTable {
    fn new() -> Self {
        let mut table = Self::default();
        table.intern("");
        table
    }

    fn intern(&mut self, value: &str) -> i64 {
        if let Some(&id) = self.index.get(value) {
            return id;
        }
        let id = i64::try_from(self.strings.len()).unwrap_or(i64::MAX);
        self.strings.push(value.to_owned());
        self.index.insert(value.to_owned(), id);
        id
    }

    fn value_type(&mut self, value_type: &ValueType) -> proto::ValueType {
        proto::ValueType {
            r#type: self.intern(&value_type.kind),
            unit: self.intern(&value_type.unit),
        }
    }
}

/// Build the protobuf message for a profile.
///
/// Each distinct frame name becomes one function and one location sharing
/// the same id.
#[must_use]
pub fn to_message(profile: &Profile) -> proto::Profile {
    let mut strings = StringTable::new();
    let mut location_ids: HashMap<&str, u64> = HashMap::new();
    let mut functions = Vec::new();
    let mut locations = Vec::new();

    let sample_type = profile
        .sample_types()
        .iter()
        .map(|t| strings.value_type(t))
        .collect();

    let samples = profile
        .samples()
        .iter()
        .map(|sample| {
            let location_id = sample
                .frames
                .iter()
                .map(|frame| {
                    if let Some(&id) = location_ids.get(frame.as_str()) {
                        return id;
                    }
                    let id = u64::try_from(location_ids.len()).unwrap_or(u64::MAX).saturating_add(1);
                    let name = strings.intern(frame);
                    functions.push(proto::Function {
                        id,
                        name,
                        system_name: name,
                        ..proto::Function::default()
                    });
                    locations.push(proto::Location {
                        id,
                        line: vec![proto::Line {
                            function_id: id,
                            line: 0,
                        }],
                        ..proto::Location::default()
                    });
                    location_ids.insert(frame.as_str(), id);
                    id
                })
                .collect();
            proto::Sample {
                location_id,
                value: sample.values.clone(),
            }
        })
        .collect();

    let period_type = profile.period_type().map(|t| strings.value_type(t));
    let comment = vec![strings.intern(profile.name())];
    let default_sample_type = profile
        .default_sample_type()
        .map_or(0, |kind| strings.intern(kind));

    let time_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|d| d.checked_sub(profile.duration()))
        .and_then(|d| i64::try_from(d.as_nanos()).ok())
        .unwrap_or_default();

    proto::Profile {
        sample_type,
        sample: samples,
        location: locations,
        function: functions,
        string_table: strings.strings,
        time_nanos,
        duration_nanos: i64::try_from(profile.duration().as_nanos()).unwrap_or(i64::MAX),
        period_type,
        period: profile.period(),
        comment,
        default_sample_type,
        ..proto::Profile::default()
    }
}

/// Encode a profile as pprof protobuf bytes.
#[must_use]
pub fn to_pprof(profile: &Profile) -> Vec<u8> {
    to_message(profile).encode_to_vec()
}
