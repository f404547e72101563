use chrono::{DateTime, Utc};
use mongodb::bson::DateTime as BsonDateTime;

pub fn chrono_to_bson(dt: DateTime<Utc>) -> BsonDateTime {
    BsonDateTime::from_millis(dt.timestamp_millis())
}

pub fn bson_to_chrono(dt: BsonDateTime) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(dt.timestamp_millis()).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Truncate to the millisecond precision MongoDB stores, so in-memory and
/// persisted rows compare equal.
pub fn to_storage_precision(dt: DateTime<Utc>) -> DateTime<Utc> {
    bson_to_chrono(chrono_to_bson(dt))
}

// Serde converters for chrono::DateTime <-> mongodb::bson::DateTime
pub mod bson_datetime_as_chrono {
    use chrono::{DateTime, Utc};
    use mongodb::bson;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        super::chrono_to_bson(*date).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bson_dt = bson::DateTime::deserialize(deserializer)?;
        Ok(super::bson_to_chrono(bson_dt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_precision_drops_sub_millisecond_part() {
        let dt = DateTime::from_timestamp(1_700_000_000, 123_456_789).unwrap();
        let truncated = to_storage_precision(dt);
        assert_eq!(truncated.timestamp_subsec_nanos(), 123_000_000);
        assert_eq!(to_storage_precision(truncated), truncated);
    }
}
