//! Conduit configuration and sync preferences.

use hotsync_storage::FourCc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Priority assigned when none is given.
pub const DEFAULT_PRIORITY: u32 = 2;

/// Kind of handler registered for a creator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConduitKind {
    /// A sync component loaded by the session.
    Component,
    /// A desktop application conduit.
    #[default]
    Application,
}

/// How a database is synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    /// Incremental: only records flagged as modified are exchanged.
    #[default]
    Fast,
    /// Full comparison of both stores.
    Slow,
    /// The handheld overwrites the desktop.
    HandheldToPc,
    /// The desktop overwrites the handheld.
    PcToHandheld,
    /// Install pending files only.
    Install,
    /// Copy the handheld to the desktop without clearing its flags.
    Backup,
    /// Skip this database.
    DoNothing,
}

impl SyncType {
    /// Returns true for the two reconciling modes.
    #[must_use]
    pub const fn is_reconcile(self) -> bool {
        matches!(self, SyncType::Fast | SyncType::Slow)
    }

    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            SyncType::Fast => "fast",
            SyncType::Slow => "slow",
            SyncType::HandheldToPc => "handheld-to-pc",
            SyncType::PcToHandheld => "pc-to-handheld",
            SyncType::Install => "install",
            SyncType::Backup => "backup",
            SyncType::DoNothing => "do-nothing",
        }
    }
}

impl fmt::Display for SyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            SyncType::Fast,
            SyncType::Slow,
            SyncType::HandheldToPc,
            SyncType::PcToHandheld,
            SyncType::Install,
            SyncType::Backup,
            SyncType::DoNothing,
        ]
        .into_iter()
        .find(|t| t.as_str() == s)
        .ok_or_else(|| format!("unknown sync type: {s}"))
    }
}

/// How long a user-selected sync type stays in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferenceScope {
    /// No preference; the session decides.
    #[default]
    None,
    /// Applies to every session.
    Permanent,
    /// Applies to the next session only.
    Temporary,
}

/// A conduit's sync preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncPreference {
    /// Lifetime of the preference.
    pub scope: PreferenceScope,
    /// Requested sync type.
    pub sync_type: SyncType,
}

impl SyncPreference {
    /// No preference.
    pub const NONE: Self = Self {
        scope: PreferenceScope::None,
        sync_type: SyncType::Fast,
    };

    /// A permanent preference.
    #[must_use]
    pub const fn permanent(sync_type: SyncType) -> Self {
        Self {
            scope: PreferenceScope::Permanent,
            sync_type,
        }
    }

    /// A one-shot preference.
    #[must_use]
    pub const fn temporary(sync_type: SyncType) -> Self {
        Self {
            scope: PreferenceScope::Temporary,
            sync_type,
        }
    }

    /// The requested sync type, if a preference is set.
    #[must_use]
    pub const fn requested(self) -> Option<SyncType> {
        match self.scope {
            PreferenceScope::None => None,
            PreferenceScope::Permanent | PreferenceScope::Temporary => Some(self.sync_type),
        }
    }
}

/// Registration of one conduit.
///
/// Built with `with_*` methods and handed to
/// [`ConduitRegistry::register`](crate::ConduitRegistry::register).
///
/// # Example
///
/// ```rust
/// use hotsync_conduit::{ConduitConfig, SyncPreference, SyncType};
///
/// let config = ConduitConfig::new("memo".parse().unwrap(), "memo_conduit")
///     .with_remote("MemoDB")
///     .with_directory("Memo")
///     .with_priority(10)
///     .with_sync_preference(SyncPreference::permanent(SyncType::Slow));
/// assert_eq!(config.title(), "memo_conduit");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConduitConfig {
    /// Application creator.
    pub creator: FourCc,
    /// Handler kind.
    #[serde(default)]
    pub kind: ConduitKind,
    /// Handler name.
    pub name: String,
    /// Display title; the name is shown when unset.
    #[serde(default)]
    pub title: Option<String>,
    /// Local directory under the user's data path.
    #[serde(default)]
    pub directory: Option<String>,
    /// Local file name.
    #[serde(default)]
    pub file: Option<String>,
    /// Remote database name.
    #[serde(default)]
    pub remote: Option<String>,
    /// User the conduit was installed for.
    #[serde(default)]
    pub user: Option<String>,
    /// Free-form information.
    #[serde(default)]
    pub info: Option<String>,
    /// Desktop integration module.
    #[serde(default)]
    pub module: Option<String>,
    /// Argument passed to the integration module.
    #[serde(default)]
    pub argument: Option<String>,
    /// Run order; lower runs first.
    pub priority: u32,
    /// Desktop integration flags.
    #[serde(default)]
    pub integrate: u32,
    /// Whether the conduit takes part in sessions.
    pub enabled: bool,
    /// User-selected sync type.
    #[serde(default)]
    pub sync_preference: SyncPreference,
}

impl ConduitConfig {
    /// Creates an enabled configuration with the default priority.
    pub fn new(creator: FourCc, name: impl Into<String>) -> Self {
        Self {
            creator,
            kind: ConduitKind::Application,
            name: name.into(),
            title: None,
            directory: None,
            file: None,
            remote: None,
            user: None,
            info: None,
            module: None,
            argument: None,
            priority: DEFAULT_PRIORITY,
            integrate: 0,
            enabled: true,
            sync_preference: SyncPreference::NONE,
        }
    }

    /// Display title, falling back to the name.
    #[must_use]
    pub fn title(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.name)
    }

    /// Sets the handler kind.
    #[must_use]
    pub fn with_kind(mut self, kind: ConduitKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the display title.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Sets the local directory.
    #[must_use]
    pub fn with_directory(mut self, directory: impl Into<String>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    /// Sets the local file name.
    #[must_use]
    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    /// Sets the remote database name.
    #[must_use]
    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = Some(remote.into());
        self
    }

    /// Sets the user.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Sets the free-form information.
    #[must_use]
    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = Some(info.into());
        self
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Enables or disables the conduit.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the sync preference.
    #[must_use]
    pub fn with_sync_preference(mut self, preference: SyncPreference) -> Self {
        self.sync_preference = preference;
        self
    }
}
