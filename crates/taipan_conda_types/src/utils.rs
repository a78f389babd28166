//! Serde helpers shared by the record types.

pub(crate) mod timestamp {
    //! (De)serializes a timestamp as milliseconds since the unix epoch.
    //! Very old repodata entries stored seconds instead; values that are too
    //! small to be milliseconds are interpreted as seconds, like conda does.

    use chrono::{DateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        timestamp: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match timestamp {
            Some(timestamp) => serializer.serialize_some(&timestamp.timestamp_millis()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let Some(mut value) = Option::<i64>::deserialize(deserializer)? else {
            return Ok(None);
        };

        // Anything before ~2001 in milliseconds is a seconds timestamp.
        if value < 1_000_000_000_000 {
            value *= 1000;
        }

        Ok(Some(Utc.timestamp_millis_opt(value).single().ok_or_else(
            || serde::de::Error::custom("timestamp out of range"),
        )?))
    }
}

pub(crate) mod features {
    //! `track_features` appears in repodata both as a list of strings and as
    //! a single comma- or space-separated string.

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        features: &Vec<String>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(features)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<String>, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            List(Vec<String>),
            Str(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::List(features) => features,
            Raw::Str(str) => str
                .split([',', ' '])
                .map(str::trim)
                .filter(|feature| !feature.is_empty())
                .map(ToOwned::to_owned)
                .collect(),
        })
    }
}

/// Writes `content` to `path` through a temporary sibling file that is
/// persisted with an atomic rename.
pub(crate) fn atomic_write(path: &std::path::Path, content: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let directory = path.parent().unwrap_or_else(|| std::path::Path::new("."));
    let mut file = tempfile::NamedTempFile::new_in(directory)?;
    file.write_all(content)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}
