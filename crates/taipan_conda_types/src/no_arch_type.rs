use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The `noarch` field of a package record. `noarch` packages are
/// platform-independent: either generic data files or pure Python packages
/// whose files are mapped into the interpreter's `site-packages` at link
/// time.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Hash)]
pub struct NoArchType(Option<RawNoArchType>);

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
enum RawNoArchType {
    /// The older `noarch: true` form, equivalent to `generic`.
    GenericV1,
    /// A platform independent package without special link behavior.
    GenericV2,
    /// A pure Python package, relocated into `site-packages` when linked.
    Python,
}

impl NoArchType {
    /// A package that is not `noarch`.
    pub fn none() -> Self {
        Self(None)
    }

    /// A `noarch: python` package.
    pub fn python() -> Self {
        Self(Some(RawNoArchType::Python))
    }

    /// A `noarch: generic` package.
    pub fn generic() -> Self {
        Self(Some(RawNoArchType::GenericV2))
    }

    /// Returns true if this is not a `noarch` package.
    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }

    /// Returns true if this is a `noarch: python` package.
    pub fn is_python(&self) -> bool {
        matches!(self.0, Some(RawNoArchType::Python))
    }
}

impl Serialize for NoArchType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            None => serializer.serialize_none(),
            Some(RawNoArchType::GenericV1) => serializer.serialize_bool(true),
            Some(RawNoArchType::GenericV2) => serializer.serialize_str("generic"),
            Some(RawNoArchType::Python) => serializer.serialize_str("python"),
        }
    }
}

impl<'de> Deserialize<'de> for NoArchType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Repodata contains both the old boolean form and the newer string
        // form of the field.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bool(bool),
            Str(String),
        }

        let raw = Option::<Raw>::deserialize(deserializer)?;
        Ok(match raw {
            None | Some(Raw::Bool(false)) => NoArchType(None),
            Some(Raw::Bool(true)) => NoArchType(Some(RawNoArchType::GenericV1)),
            Some(Raw::Str(str)) => match str.as_str() {
                "python" => NoArchType(Some(RawNoArchType::Python)),
                "generic" => NoArchType(Some(RawNoArchType::GenericV2)),
                other => {
                    return Err(serde::de::Error::custom(format!(
                        "invalid noarch type '{other}'"
                    )))
                }
            },
        })
    }
}

#[cfg(test)]
mod test {
    use super::NoArchType;

    #[test]
    fn test_deserialize() {
        let parse = |s: &str| serde_json::from_str::<NoArchType>(s).unwrap();
        assert!(parse("null").is_none());
        assert!(parse("false").is_none());
        assert!(!parse("true").is_none());
        assert!(parse("\"python\"").is_python());
        assert!(!parse("\"generic\"").is_python());
        assert!(serde_json::from_str::<NoArchType>("\"java\"").is_err());
    }
}
