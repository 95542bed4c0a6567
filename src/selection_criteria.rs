//! Contains the types used to describe which replica set members an operation may be routed to.

use std::{collections::HashMap, time::Duration};

use serde::{de::Error as SerdeError, Deserialize, Deserializer, Serialize};
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::{
    error::{ErrorKind, Result, PRIMARY_WITH_TAGS_MESSAGE},
    serde_util,
};

/// A read preference tag set. An empty tag set matches every server.
pub type TagSet = HashMap<String, String>;

/// The mode of a [`ReadPreference`], without any of its options.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, derive_more::Display)]
#[non_exhaustive]
pub enum ReadPreferenceMode {
    /// Only route this operation to the primary.
    #[display("primary")]
    Primary,

    /// Only route this operation to a secondary.
    #[display("secondary")]
    Secondary,

    /// Route this operation to the primary if it's available, but fall back to the secondaries if
    /// not.
    #[display("primaryPreferred")]
    PrimaryPreferred,

    /// Route this operation to a secondary if one is available, but fall back to the primary if
    /// not.
    #[display("secondaryPreferred")]
    SecondaryPreferred,

    /// Route this operation to the member with the least network latency regardless of whether
    /// it's the primary or a secondary.
    #[display("nearest")]
    Nearest,
}

impl std::str::FromStr for ReadPreferenceMode {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "primary" => Ok(Self::Primary),
            "secondary" => Ok(Self::Secondary),
            "primarypreferred" => Ok(Self::PrimaryPreferred),
            "secondarypreferred" => Ok(Self::SecondaryPreferred),
            "nearest" => Ok(Self::Nearest),
            other => Err(ErrorKind::InvalidPreference {
                message: format!("'{other}' is not a valid read preference"),
            }
            .into()),
        }
    }
}

/// Specifies how an operation is routed to members of a replica set.
///
/// If applicable, `tag_sets` can be used to target specific members, and `max_staleness`
/// specifies the maximum lag behind the primary that a secondary can be to remain eligible for
/// the operation.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ReadPreference {
    /// Only route this operation to the primary.
    Primary,

    /// Only route this operation to a secondary.
    Secondary {
        options: Option<ReadPreferenceOptions>,
    },

    /// Route this operation to the primary if it's available, but fall back to the secondaries if
    /// not.
    PrimaryPreferred {
        options: Option<ReadPreferenceOptions>,
    },

    /// Route this operation to a secondary if one is available, but fall back to the primary if
    /// not.
    SecondaryPreferred {
        options: Option<ReadPreferenceOptions>,
    },

    /// Route this operation to the member with the least network latency regardless of whether
    /// it's the primary or a secondary.
    Nearest {
        options: Option<ReadPreferenceOptions>,
    },
}

impl Default for ReadPreference {
    fn default() -> Self {
        Self::Primary
    }
}

impl std::fmt::Display for ReadPreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut mode = self.mode().to_string();
        mode[0..1].make_ascii_uppercase();
        write!(f, "{{ Mode: {mode}")?;

        if let Some(options) = self.options() {
            if let Some(ref tag_sets) = options.tag_sets {
                write!(f, ", Tag Sets: {tag_sets:?}")?;
            }
            if let Some(ref max_staleness) = options.max_staleness {
                write!(f, ", Max Staleness: {max_staleness:?}")?;
            }
        }

        write!(f, " }}")
    }
}

impl<'de> Deserialize<'de> for ReadPreference {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ReadPreferenceHelper {
            mode: String,
            #[serde(flatten)]
            options: ReadPreferenceOptions,
        }
        let helper = ReadPreferenceHelper::deserialize(deserializer)?;
        let mode = helper
            .mode
            .parse::<ReadPreferenceMode>()
            .map_err(|e| D::Error::custom(e.to_string()))?;
        let options = if helper.options.is_default() {
            None
        } else {
            Some(helper.options)
        };
        ReadPreference::new(mode, options).map_err(|e| D::Error::custom(e.to_string()))
    }
}

impl Serialize for ReadPreference {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        #[skip_serializing_none]
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct ReadPreferenceHelper<'a> {
            mode: String,
            #[serde(flatten)]
            options: Option<&'a ReadPreferenceOptions>,
        }

        let helper = ReadPreferenceHelper {
            mode: self.mode().to_string(),
            options: self.options(),
        };
        helper.serialize(serializer)
    }
}

/// Specifies read preference options for non-primary read preferences.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ReadPreferenceOptions {
    /// Specifies which replica set members should be considered for operations. Each tag set will
    /// be checked in order until one or more servers is found with each tag in the set.
    #[serde(alias = "tag_sets")]
    pub tag_sets: Option<Vec<TagSet>>,

    /// Specifies the maximum amount of lag behind the primary that a secondary can be to be
    /// considered for the given operation.
    ///
    /// `max_staleness` must be at least 90 seconds, and at least the heartbeat frequency plus ten
    /// seconds. Selecting with a smaller value returns an error.
    #[serde(
        rename = "maxStalenessSeconds",
        default,
        with = "serde_util::duration_option_as_int_seconds"
    )]
    pub max_staleness: Option<Duration>,
}

impl ReadPreferenceOptions {
    pub(crate) fn is_default(&self) -> bool {
        self.max_staleness.is_none() && !has_tags(self.tag_sets.as_deref())
    }
}

/// Any tag set at all counts, even `{}`.
fn has_tags(tag_sets: Option<&[TagSet]>) -> bool {
    tag_sets.is_some_and(|tag_sets| !tag_sets.is_empty())
}

fn primary_with_tags() -> crate::error::Error {
    ErrorKind::InvalidPreference {
        message: PRIMARY_WITH_TAGS_MESSAGE.to_string(),
    }
    .into()
}

impl ReadPreference {
    /// Constructs a read preference from a mode and its options.
    ///
    /// Returns an `InvalidPreference` error if a primary mode is combined with any tag sets or
    /// with a max staleness.
    pub fn new(mode: ReadPreferenceMode, options: Option<ReadPreferenceOptions>) -> Result<Self> {
        Ok(match mode {
            ReadPreferenceMode::Primary => {
                if let Some(options) = options {
                    if has_tags(options.tag_sets.as_deref()) {
                        return Err(primary_with_tags());
                    }
                    if options.max_staleness.is_some() {
                        return Err(ErrorKind::InvalidPreference {
                            message: "max staleness can only be specified when a non-primary \
                                      mode is specified"
                                .to_string(),
                        }
                        .into());
                    }
                }
                Self::Primary
            }
            ReadPreferenceMode::Secondary => Self::Secondary { options },
            ReadPreferenceMode::PrimaryPreferred => Self::PrimaryPreferred { options },
            ReadPreferenceMode::SecondaryPreferred => Self::SecondaryPreferred { options },
            ReadPreferenceMode::Nearest => Self::Nearest { options },
        })
    }

    /// The mode of this read preference.
    pub fn mode(&self) -> ReadPreferenceMode {
        match self {
            Self::Primary => ReadPreferenceMode::Primary,
            Self::Secondary { .. } => ReadPreferenceMode::Secondary,
            Self::PrimaryPreferred { .. } => ReadPreferenceMode::PrimaryPreferred,
            Self::SecondaryPreferred { .. } => ReadPreferenceMode::SecondaryPreferred,
            Self::Nearest { .. } => ReadPreferenceMode::Nearest,
        }
    }

    /// The options of this read preference, if any.
    pub fn options(&self) -> Option<&ReadPreferenceOptions> {
        match self {
            Self::Primary => None,
            Self::Secondary { options }
            | Self::PrimaryPreferred { options }
            | Self::SecondaryPreferred { options }
            | Self::Nearest { options } => options.as_ref(),
        }
    }

    pub(crate) fn max_staleness(&self) -> Option<Duration> {
        self.options().and_then(|options| options.max_staleness)
    }

    pub(crate) fn tag_sets(&self) -> Option<&Vec<TagSet>> {
        self.options().and_then(|options| options.tag_sets.as_ref())
    }

    /// Returns this read preference with its tag sets replaced by `tag_sets`.
    ///
    /// Returns an `InvalidPreference` error if this is a primary read preference and `tag_sets`
    /// is not empty, even if it only holds `{}`.
    pub fn with_tag_sets(mut self, tag_sets: Vec<TagSet>) -> Result<Self> {
        let options = match self {
            Self::Primary => {
                if has_tags(Some(tag_sets.as_slice())) {
                    return Err(primary_with_tags());
                }
                return Ok(self);
            }
            Self::Secondary { ref mut options }
            | Self::PrimaryPreferred { ref mut options }
            | Self::SecondaryPreferred { ref mut options }
            | Self::Nearest { ref mut options } => options,
        };

        options.get_or_insert_with(Default::default).tag_sets = Some(tag_sets);

        Ok(self)
    }

    pub(crate) fn with_max_staleness(mut self, max_staleness: Duration) -> Result<Self> {
        let options = match self {
            ReadPreference::Primary => {
                return Err(ErrorKind::InvalidArgument {
                    message: "max staleness can only be specified when a non-primary mode is \
                              specified"
                        .to_string(),
                }
                .into());
            }
            ReadPreference::Secondary { ref mut options }
            | ReadPreference::PrimaryPreferred { ref mut options }
            | ReadPreference::SecondaryPreferred { ref mut options }
            | ReadPreference::Nearest { ref mut options } => options,
        };

        options.get_or_insert_with(Default::default).max_staleness = Some(max_staleness);

        Ok(self)
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::{ReadPreference, ReadPreferenceMode, ReadPreferenceOptions, TagSet};
    use crate::{bson::doc, error::ErrorKind};

    fn tag_set(pairs: &[(&str, &str)]) -> TagSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn primary_rejects_tags() {
        let error = ReadPreference::Primary
            .with_tag_sets(vec![tag_set(&[("dc", "sf")])])
            .unwrap_err();
        assert!(matches!(*error.kind, ErrorKind::InvalidPreference { .. }));
        assert_eq!(error.to_string(), "PRIMARY cannot be combined with tags");

        let options = ReadPreferenceOptions::builder()
            .tag_sets(vec![tag_set(&[("dc", "ny")])])
            .build();
        let error = ReadPreference::new(ReadPreferenceMode::Primary, Some(options)).unwrap_err();
        assert!(matches!(*error.kind, ErrorKind::InvalidPreference { .. }));
    }

    #[test]
    fn primary_rejects_empty_tag_set() {
        let error = ReadPreference::Primary
            .with_tag_sets(vec![TagSet::new()])
            .unwrap_err();
        assert!(matches!(*error.kind, ErrorKind::InvalidPreference { .. }));

        let options = ReadPreferenceOptions::builder()
            .tag_sets(vec![TagSet::new()])
            .build();
        assert!(ReadPreference::new(ReadPreferenceMode::Primary, Some(options)).is_err());

        // no tag sets at all is fine
        let read_pref = ReadPreference::Primary.with_tag_sets(Vec::new()).unwrap();
        assert_eq!(read_pref, ReadPreference::Primary);
    }

    #[test]
    fn tags_replace_existing() {
        let read_pref = ReadPreference::Secondary {
            options: Some(
                ReadPreferenceOptions::builder()
                    .tag_sets(vec![tag_set(&[("dc", "ny")])])
                    .max_staleness(Duration::from_secs(120))
                    .build(),
            ),
        }
        .with_tag_sets(vec![tag_set(&[("dc", "sf")])])
        .unwrap();

        assert_eq!(read_pref.tag_sets(), Some(&vec![tag_set(&[("dc", "sf")])]));
        assert_eq!(read_pref.max_staleness(), Some(Duration::from_secs(120)));
    }

    #[test]
    fn deserialize() {
        let read_pref: ReadPreference = crate::bson::from_document(doc! {
            "mode": "secondaryPreferred",
            "tagSets": [{ "dc": "sf" }, {}],
            "maxStalenessSeconds": 120,
        })
        .unwrap();
        assert_eq!(
            read_pref,
            ReadPreference::SecondaryPreferred {
                options: Some(
                    ReadPreferenceOptions::builder()
                        .tag_sets(vec![tag_set(&[("dc", "sf")]), TagSet::new()])
                        .max_staleness(Duration::from_secs(120))
                        .build()
                )
            }
        );

        let read_pref: ReadPreference =
            crate::bson::from_document(doc! { "mode": "primary" }).unwrap();
        assert_eq!(read_pref, ReadPreference::Primary);

        crate::bson::from_document::<ReadPreference>(doc! {
            "mode": "primary",
            "tagSets": [{ "dc": "sf" }],
        })
        .unwrap_err();
    }

    #[test]
    fn display() {
        let read_pref = ReadPreference::Nearest {
            options: Some(
                ReadPreferenceOptions::builder()
                    .max_staleness(Duration::from_secs(90))
                    .build(),
            ),
        };
        assert_eq!(
            read_pref.to_string(),
            "{ Mode: Nearest, Max Staleness: 90s }"
        );
    }
}
