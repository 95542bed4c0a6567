use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// Writes `value` as an `i32` when it fits, so small durations come out as BSON int32 the way
/// servers write them, and as an `i64` otherwise.
fn serialize_whole_number<S: Serializer>(
    value: u128,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match i32::try_from(value) {
        Ok(small) => serializer.serialize_i32(small),
        Err(_) => serializer.serialize_i64(i64::try_from(value).unwrap_or(i64::MAX)),
    }
}

/// `Option<Duration>` as a whole number of seconds, e.g. `maxStalenessSeconds`.
pub(crate) mod duration_option_as_int_seconds {
    use super::*;

    pub(crate) fn serialize<S: Serializer>(
        val: &Option<Duration>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match val {
            Some(duration) => serialize_whole_number(duration.as_secs().into(), serializer),
            None => serializer.serialize_none(),
        }
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}

/// `Option<Duration>` as a whole number of milliseconds.
pub(crate) mod duration_option_as_int_millis {
    use super::*;

    pub(crate) fn serialize<S: Serializer>(
        val: &Option<Duration>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match val {
            Some(duration) => serialize_whole_number(duration.as_millis(), serializer),
            None => serializer.serialize_none(),
        }
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

pub(crate) fn serialize_error_as_string<S: Serializer>(
    val: &Error,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(val)
}

pub(crate) fn serialize_duration_as_int_millis<S: Serializer>(
    val: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    u64::try_from(val.as_millis())
        .unwrap_or(u64::MAX)
        .serialize(serializer)
}
