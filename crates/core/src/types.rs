use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! newtype_string {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance from a string value.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Return the inner string as a str slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;

            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

newtype_string!(UserId, "Identifies a user account.");
newtype_string!(OrgId, "Identifies an organization (billing tenant).");
newtype_string!(TrackId, "Identifies a track in the catalog.");
newtype_string!(SessionId, "Identifies a listening session.");
newtype_string!(ApiKeyId, "Identifies an API key record (never the secret).");
newtype_string!(RecommendationId, "Identifies a single served impression slot.");
newtype_string!(DeviceId, "Client-reported stable device identifier.");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newtype_from_str() {
        let id = UserId::from("usr-1");
        assert_eq!(id.as_str(), "usr-1");
        assert_eq!(&*id, "usr-1");
    }

    #[test]
    fn newtype_serde_roundtrip() {
        let id = TrackId::new("trk-99");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"trk-99\"");
        let back: TrackId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn newtype_display() {
        let id = SessionId::new("ses-7");
        assert_eq!(format!("{id}"), "ses-7");
    }
}
