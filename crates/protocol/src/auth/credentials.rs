/*
 * Petrel mail delivery agent
 *
 * Copyright (C) 2003 - viridIT SAS
 * Licensed under the Elastic License 2.0
 *
 * You should have received a copy of the Elastic License 2.0 along with
 * this program. If not, see https://www.elastic.co/licensing/elastic-license.
 *
 */

/// The pair we present to a relay which requires authentication.
#[derive(Clone, PartialEq, Eq, serde::Deserialize)]
#[cfg_attr(debug_assertions, derive(Debug, serde::Serialize))]
pub struct Credentials {
    pub authid: String,
    pub authpass: String,
}

#[cfg(not(debug_assertions))]
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("authid", &self.authid)
            .field("authpass", &"***")
            .finish()
    }
}

#[cfg(not(debug_assertions))]
impl serde::Serialize for Credentials {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut s = serializer.serialize_struct("Credentials", 2)?;
        s.serialize_field("authid", "***")?;
        s.serialize_field("authpass", "***")?;
        s.end()
    }
}
