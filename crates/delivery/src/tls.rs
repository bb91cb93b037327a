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

/// Whether the session must be upgraded with `STARTTLS` before the envelope
/// is sent.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Requirement {
    /// Refuse to send anything in clear text, even to servers which do not
    /// advertise `STARTTLS`.
    Required,
    /// Upgrade when the server offers it, otherwise stay in clear text.
    #[default]
    Optional,
    /// Never upgrade, even when offered.
    Disabled,
}

#[derive(Default, Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct Tls {
    #[serde(default)]
    pub starttls: Requirement,
}
