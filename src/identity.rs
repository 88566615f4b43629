//! Experiment and variant identity derivation.
//!
//! Identities are readable strings derived from the rotator id, the campaign name and
//! (for variants) the member page id:
//!
//! ```text
//! rotator  r_<body>           campaign <name>      page p_<page>
//! experiment  e_<body>_<name>
//! variant     v_<body>_<name>_<page>
//! ```
//!
//! Every identity also has a [`ContentKey`] (lowercase hex SHA-256 of the id) used for
//! indexed lookups in the store.
//!
//! Neither the campaign name nor the page body may contain `_`, which keeps the readable
//! form injective: the last separator of a variant id splits off the page, and the last
//! separator of an experiment id splits the rotator body from the campaign.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::EngineError;

/// Namespace prefix for rotator pages.
pub const ROTATOR_PREFIX: &str = "r_";
/// Namespace prefix for experiments.
pub const EXPERIMENT_PREFIX: &str = "e_";
/// Namespace prefix for variants.
pub const VARIANT_PREFIX: &str = "v_";
/// Namespace prefix for plain pages (stripped when deriving variant ids).
pub const PAGE_PREFIX: &str = "p_";

/// Lowercase hex SHA-256 of an identity string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ContentKey(String);

impl ContentKey {
    /// Hash `s` into a content key.
    #[must_use]
    pub fn of(s: &str) -> Self {
        Self(hex::encode(Sha256::digest(s.as_bytes())))
    }

    /// Wrap an already-computed hex key (e.g. read back from storage).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! id_newtype {
    ($(#[$m:meta])* $name:ident) => {
        $(#[$m])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Content key of this id.
            #[must_use]
            pub fn key(&self) -> ContentKey {
                ContentKey::of(&self.0)
            }

            /// Wrap an id read back from storage without re-deriving it.
            pub fn from_stored(s: impl Into<String>) -> Self {
                Self(s.into())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

id_newtype!(
    /// Stable identity of one `(rotator, campaign)` experiment.
    ExperimentId
);
id_newtype!(
    /// Stable identity of one arm: an experiment's member page.
    VariantId
);

/// Everything derived from a validated `(rotator, campaign)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExperimentIdentity {
    pub id: ExperimentId,
    pub key: ContentKey,
    pub rotator_id: String,
    pub rotator_key: ContentKey,
    pub campaign: String,
}

impl ExperimentIdentity {
    /// Variant identity for one of this experiment's member pages.
    #[must_use]
    pub fn variant(&self, page_id: &str) -> VariantId {
        let body = &self.id.as_str()[EXPERIMENT_PREFIX.len()..];
        let page = page_id.strip_prefix(PAGE_PREFIX).unwrap_or(page_id);
        VariantId(format!("{VARIANT_PREFIX}{body}_{page}"))
    }

    /// Whether `variant` was derived from this experiment.
    pub fn owns(&self, variant: &VariantId) -> bool {
        let body = &self.id.as_str()[EXPERIMENT_PREFIX.len()..];
        variant
            .as_str()
            .strip_prefix(VARIANT_PREFIX)
            .and_then(|rest| rest.strip_prefix(body))
            .and_then(|rest| rest.strip_prefix('_'))
            .is_some_and(|page| !page.is_empty() && !page.contains('_'))
    }
}

/// Reject inputs that would make derived identities ambiguous.
pub fn validate_inputs(rotator_id: &str, campaign: &str) -> Result<(), EngineError> {
    let body = rotator_id
        .strip_prefix(ROTATOR_PREFIX)
        .ok_or_else(|| EngineError::invalid("rotator_id", "must start with `r_`"))?;
    if body.is_empty() {
        return Err(EngineError::invalid("rotator_id", "empty after `r_` prefix"));
    }
    if body.chars().any(char::is_whitespace) {
        return Err(EngineError::invalid("rotator_id", "contains whitespace"));
    }
    if campaign.is_empty() {
        return Err(EngineError::invalid("campaign", "empty"));
    }
    if campaign.contains('_') {
        return Err(EngineError::invalid("campaign", "may not contain `_`"));
    }
    if campaign.chars().any(char::is_whitespace) {
        return Err(EngineError::invalid("campaign", "contains whitespace"));
    }
    Ok(())
}

/// Reject a page id whose body (after `p_`) is empty or contains `_` or whitespace.
pub fn validate_page_id(page_id: &str) -> Result<(), EngineError> {
    let page = page_id.strip_prefix(PAGE_PREFIX).unwrap_or(page_id);
    if page.is_empty() {
        return Err(EngineError::invalid("page_id", "empty"));
    }
    if page.contains('_') {
        return Err(EngineError::invalid("page_id", "may not contain `_`"));
    }
    if page.chars().any(char::is_whitespace) {
        return Err(EngineError::invalid("page_id", "contains whitespace"));
    }
    Ok(())
}

/// Derive the experiment identity for `(rotator_id, campaign)`.
///
/// Validates first; see [`validate_inputs`].
pub fn derive_experiment(
    rotator_id: &str,
    campaign: &str,
) -> Result<ExperimentIdentity, EngineError> {
    validate_inputs(rotator_id, campaign)?;
    let body = &rotator_id[ROTATOR_PREFIX.len()..];
    let id = ExperimentId(format!("{EXPERIMENT_PREFIX}{body}_{campaign}"));
    Ok(ExperimentIdentity {
        key: id.key(),
        id,
        rotator_id: rotator_id.to_string(),
        rotator_key: ContentKey::of(rotator_id),
        campaign: campaign.to_string(),
    })
}

/// Derive a variant identity directly from its inputs.
pub fn derive_variant(
    rotator_id: &str,
    campaign: &str,
    page_id: &str,
) -> Result<VariantId, EngineError> {
    validate_page_id(page_id)?;
    Ok(derive_experiment(rotator_id, campaign)?.variant(page_id))
}
