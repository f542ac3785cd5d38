// Serde helper modules for custom serialization/deserialization
//
// Timeouts and backoff delays are written to config and snapshot files as
// whole milliseconds.

/// Module for serializing `std::time::Duration` as milliseconds
/// Use with #[serde(with = "crate::utils::duration_ms_serde")]
pub mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct TestStruct {
        #[serde(with = "duration_ms_serde")]
        delay: Duration,
    }

    #[test]
    fn test_duration_serialization() {
        let test = TestStruct {
            delay: Duration::from_millis(1500),
        };

        let json = serde_json::to_string(&test).unwrap();
        assert_eq!(json, r#"{"delay":1500}"#);
        let deserialized: TestStruct = serde_json::from_str(&json).unwrap();

        assert_eq!(test, deserialized);
    }

    #[test]
    fn test_toml_values() {
        let parsed: TestStruct = toml::from_str("delay = 250").unwrap();
        assert_eq!(parsed.delay, Duration::from_millis(250));
        assert!(toml::from_str::<TestStruct>("delay = -1").is_err());
    }
}
