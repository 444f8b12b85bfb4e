//! The conduit registry.
//!
//! An ordered collection of per-creator conduit configurations plus a few
//! registry-wide values (PC identifier, core path, backup conduit). The
//! registry is kept in memory and persisted as a JSON file.

use crate::config::{ConduitConfig, PreferenceScope, SyncPreference};
use crate::error::{RegistryError, RegistryResult};
use hotsync_storage::FourCc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::Path;

/// Copies `value` and a trailing NUL into `buf`.
///
/// Returns the number of bytes written, terminator included.
///
/// # Errors
///
/// `BufferTooSmall` with the required size when `buf` cannot hold the value
/// and its terminator. Nothing is written in that case.
pub fn copy_into(value: &str, buf: &mut [u8]) -> RegistryResult<usize> {
    let required = value.len() + 1;
    if buf.len() < required {
        return Err(RegistryError::BufferTooSmall { required });
    }
    buf[..value.len()].copy_from_slice(value.as_bytes());
    buf[value.len()] = 0;
    Ok(required)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RegistryEntry {
    seq: u64,
    config: ConduitConfig,
    #[serde(default)]
    values_u32: BTreeMap<String, u32>,
    #[serde(default)]
    values_string: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    pc_identifier: u32,
    #[serde(default)]
    core_path: Option<String>,
    #[serde(default)]
    backup_conduit: Option<String>,
    next_seq: u64,
    conduits: Vec<RegistryEntry>,
}

macro_rules! string_accessors {
    ($($(#[$doc:meta])* $field:ident, $setter:ident, $into:ident;)*) => {
        $(
            $(#[$doc])*
            pub fn $field(&self, creator: FourCc) -> RegistryResult<Option<&str>> {
                Ok(self.entry(creator)?.config.$field.as_deref())
            }

            /// Sets the value; an empty string clears it.
            pub fn $setter(&mut self, creator: FourCc, value: &str) -> RegistryResult<()> {
                let entry = self.entry_mut(creator)?;
                entry.config.$field = (!value.is_empty()).then(|| value.to_string());
                Ok(())
            }

            /// Copies the value into `buf` with a trailing NUL. An unset value
            /// is copied as the empty string.
            pub fn $into(&self, creator: FourCc, buf: &mut [u8]) -> RegistryResult<usize> {
                copy_into(self.$field(creator)?.unwrap_or(""), buf)
            }
        )*
    };
}

/// Registry of conduits keyed by creator.
///
/// # Ordering
///
/// [`list_creators`](Self::list_creators) returns creators by ascending
/// priority. Equal priorities keep registration order, tracked by a
/// monotonic counter that survives save and load.
///
/// # Example
///
/// ```rust
/// use hotsync_conduit::{ConduitConfig, ConduitRegistry};
///
/// let mut registry = ConduitRegistry::new();
/// let memo = "memo".parse().unwrap();
/// registry.register(ConduitConfig::new(memo, "memo_conduit").with_remote("MemoDB")).unwrap();
///
/// let mut buf = [0u8; 4];
/// let err = registry.remote_into(memo, &mut buf).unwrap_err();
/// assert_eq!(err.to_string(), "buffer too small: 7 bytes required");
/// ```
#[derive(Debug, Clone)]
pub struct ConduitRegistry {
    entries: BTreeMap<FourCc, RegistryEntry>,
    next_seq: u64,
    pc_identifier: u32,
    core_path: Option<String>,
    backup_conduit: Option<String>,
}

impl Default for ConduitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConduitRegistry {
    /// Creates an empty registry with a fresh random PC identifier.
    #[must_use]
    pub fn new() -> Self {
        Self::with_pc_identifier(rand::random::<u32>().max(1))
    }

    /// Creates an empty registry with the given PC identifier.
    #[must_use]
    pub fn with_pc_identifier(pc_identifier: u32) -> Self {
        Self {
            entries: BTreeMap::new(),
            next_seq: 0,
            pc_identifier,
            core_path: None,
            backup_conduit: None,
        }
    }

    /// Loads a registry file, or creates a new registry if it does not
    /// exist.
    ///
    /// # Errors
    ///
    /// `AccessDenied` if the file cannot be read, `Serialization` if it is
    /// malformed.
    pub fn load(path: &Path) -> RegistryResult<Self> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no registry file, starting empty");
                return Ok(Self::new());
            }
            Err(e) => return Err(access_error(path, e)),
        };
        let file: RegistryFile = serde_json::from_slice(&data)?;
        let entries = file
            .conduits
            .into_iter()
            .map(|e| (e.config.creator, e))
            .collect::<BTreeMap<_, _>>();
        let next_seq = entries
            .values()
            .map(|e| e.seq + 1)
            .max()
            .unwrap_or(0)
            .max(file.next_seq);
        Ok(Self {
            entries,
            next_seq,
            pc_identifier: file.pc_identifier,
            core_path: file.core_path,
            backup_conduit: file.backup_conduit,
        })
    }

    /// Writes the registry to `path` atomically.
    pub fn save(&self, path: &Path) -> RegistryResult<()> {
        let file = RegistryFile {
            pc_identifier: self.pc_identifier,
            core_path: self.core_path.clone(),
            backup_conduit: self.backup_conduit.clone(),
            next_seq: self.next_seq,
            conduits: self.ordered().into_iter().cloned().collect(),
        };
        let data = serde_json::to_vec_pretty(&file)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| access_error(parent, e))?;
        }
        let temp = path.with_extension("json.tmp");
        let mut out = File::create(&temp).map_err(|e| access_error(&temp, e))?;
        out.write_all(&data)?;
        out.sync_all()?;
        drop(out);
        fs::rename(&temp, path)?;
        tracing::debug!(path = %path.display(), conduits = self.entries.len(), "saved registry");
        Ok(())
    }

    /// Registers a conduit.
    ///
    /// # Errors
    ///
    /// `AlreadyInUse` if the creator is registered, `InvalidCreator` for the
    /// wildcard creator.
    pub fn register(&mut self, config: ConduitConfig) -> RegistryResult<()> {
        let creator = config.creator;
        if creator.is_wildcard() {
            return Err(RegistryError::InvalidCreator(creator.to_string_lossy()));
        }
        if self.entries.contains_key(&creator) {
            return Err(RegistryError::AlreadyInUse(creator));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            creator,
            RegistryEntry {
                seq,
                config,
                values_u32: BTreeMap::new(),
                values_string: BTreeMap::new(),
            },
        );
        tracing::info!(creator = %creator, "conduit registered");
        Ok(())
    }

    /// Removes the creator's registration if present, then registers
    /// `config`. The conduit moves to the end of its priority group.
    pub fn reinstall(&mut self, config: ConduitConfig) -> RegistryResult<()> {
        match self.unregister(config.creator) {
            Ok(()) | Err(RegistryError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.register(config)
    }

    /// Removes a registration.
    ///
    /// # Errors
    ///
    /// `NotFound` if the creator is not registered.
    pub fn unregister(&mut self, creator: FourCc) -> RegistryResult<()> {
        if self.entries.remove(&creator).is_none() {
            return Err(RegistryError::NotFound(creator));
        }
        tracing::info!(creator = %creator, "conduit removed");
        Ok(())
    }

    /// Returns true if the creator is registered.
    #[must_use]
    pub fn contains(&self, creator: FourCc) -> bool {
        self.entries.contains_key(&creator)
    }

    /// Number of registered conduits.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no conduit is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns a registration.
    pub fn get(&self, creator: FourCc) -> RegistryResult<&ConduitConfig> {
        Ok(&self.entry(creator)?.config)
    }

    /// Creators in run order: ascending priority, then registration order.
    #[must_use]
    pub fn list_creators(&self) -> Vec<FourCc> {
        self.ordered()
            .into_iter()
            .map(|e| e.config.creator)
            .collect()
    }

    /// Registrations in run order.
    #[must_use]
    pub fn conduits(&self) -> Vec<&ConduitConfig> {
        self.ordered().into_iter().map(|e| &e.config).collect()
    }

    /// Returns the priority.
    pub fn priority(&self, creator: FourCc) -> RegistryResult<u32> {
        Ok(self.entry(creator)?.config.priority)
    }

    /// Sets the priority.
    pub fn set_priority(&mut self, creator: FourCc, priority: u32) -> RegistryResult<()> {
        self.entry_mut(creator)?.config.priority = priority;
        Ok(())
    }

    /// Returns the handler name.
    pub fn name(&self, creator: FourCc) -> RegistryResult<&str> {
        Ok(&self.entry(creator)?.config.name)
    }

    /// Sets the handler name.
    pub fn set_name(&mut self, creator: FourCc, name: &str) -> RegistryResult<()> {
        self.entry_mut(creator)?.config.name = name.to_string();
        Ok(())
    }

    /// Copies the handler name into `buf` with a trailing NUL.
    pub fn name_into(&self, creator: FourCc, buf: &mut [u8]) -> RegistryResult<usize> {
        copy_into(self.name(creator)?, buf)
    }

    string_accessors! {
        /// Returns the display title, if set.
        title, set_title, title_into;
        /// Returns the local directory, if set.
        directory, set_directory, directory_into;
        /// Returns the local file name, if set.
        file, set_file, file_into;
        /// Returns the remote database name, if set.
        remote, set_remote, remote_into;
        /// Returns the user, if set.
        user, set_user, user_into;
        /// Returns the free-form information, if set.
        info, set_info, info_into;
        /// Returns the integration module, if set.
        module, set_module, module_into;
        /// Returns the integration module argument, if set.
        argument, set_argument, argument_into;
    }

    /// Returns the integration flags.
    pub fn integrate(&self, creator: FourCc) -> RegistryResult<u32> {
        Ok(self.entry(creator)?.config.integrate)
    }

    /// Sets the integration flags.
    pub fn set_integrate(&mut self, creator: FourCc, flags: u32) -> RegistryResult<()> {
        self.entry_mut(creator)?.config.integrate = flags;
        Ok(())
    }

    /// Returns true if the conduit takes part in sessions.
    pub fn enabled(&self, creator: FourCc) -> RegistryResult<bool> {
        Ok(self.entry(creator)?.config.enabled)
    }

    /// Enables or disables the conduit.
    pub fn set_enabled(&mut self, creator: FourCc, enabled: bool) -> RegistryResult<()> {
        self.entry_mut(creator)?.config.enabled = enabled;
        Ok(())
    }

    /// Returns the sync preference.
    pub fn sync_preference(&self, creator: FourCc) -> RegistryResult<SyncPreference> {
        Ok(self.entry(creator)?.config.sync_preference)
    }

    /// Sets the sync preference.
    pub fn set_sync_preference(
        &mut self,
        creator: FourCc,
        preference: SyncPreference,
    ) -> RegistryResult<()> {
        self.entry_mut(creator)?.config.sync_preference = preference;
        Ok(())
    }

    /// Drops a temporary preference after the session that used it.
    /// Returns true if one was cleared.
    pub fn clear_temporary_preference(&mut self, creator: FourCc) -> RegistryResult<bool> {
        let entry = self.entry_mut(creator)?;
        if entry.config.sync_preference.scope == PreferenceScope::Temporary {
            entry.config.sync_preference = SyncPreference::NONE;
            return Ok(true);
        }
        Ok(false)
    }

    /// Stores a named integer.
    pub fn set_value_u32(&mut self, creator: FourCc, key: &str, value: u32) -> RegistryResult<()> {
        self.entry_mut(creator)?
            .values_u32
            .insert(key.to_string(), value);
        Ok(())
    }

    /// Reads a named integer, or `default` if it was never stored.
    pub fn get_value_u32(&self, creator: FourCc, key: &str, default: u32) -> RegistryResult<u32> {
        Ok(self
            .entry(creator)?
            .values_u32
            .get(key)
            .copied()
            .unwrap_or(default))
    }

    /// Stores a named string.
    pub fn set_value_string(
        &mut self,
        creator: FourCc,
        key: &str,
        value: &str,
    ) -> RegistryResult<()> {
        self.entry_mut(creator)?
            .values_string
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Reads a named string, or `default` if it was never stored.
    pub fn get_value_string<'a>(
        &'a self,
        creator: FourCc,
        key: &str,
        default: &'a str,
    ) -> RegistryResult<&'a str> {
        Ok(self
            .entry(creator)?
            .values_string
            .get(key)
            .map_or(default, String::as_str))
    }

    /// Copies a named string (or `default`) into `buf` with a trailing NUL.
    pub fn get_value_string_into(
        &self,
        creator: FourCc,
        key: &str,
        default: &str,
        buf: &mut [u8],
    ) -> RegistryResult<usize> {
        copy_into(self.get_value_string(creator, key, default)?, buf)
    }

    /// Identifier of this desktop, recorded on the device after a sync.
    #[must_use]
    pub fn pc_identifier(&self) -> u32 {
        self.pc_identifier
    }

    /// Root directory of the user data, if configured.
    #[must_use]
    pub fn core_path(&self) -> Option<&str> {
        self.core_path.as_deref()
    }

    /// Sets the core path.
    pub fn set_core_path(&mut self, path: impl Into<String>) {
        self.core_path = Some(path.into());
    }

    /// Copies the core path into `buf` with a trailing NUL.
    pub fn core_path_into(&self, buf: &mut [u8]) -> RegistryResult<usize> {
        copy_into(self.core_path().unwrap_or(""), buf)
    }

    /// Handler used for databases no conduit claims, if configured.
    #[must_use]
    pub fn backup_conduit(&self) -> Option<&str> {
        self.backup_conduit.as_deref()
    }

    /// Sets the backup conduit.
    pub fn set_backup_conduit(&mut self, name: impl Into<String>) {
        self.backup_conduit = Some(name.into());
    }

    fn entry(&self, creator: FourCc) -> RegistryResult<&RegistryEntry> {
        self.entries
            .get(&creator)
            .ok_or(RegistryError::NotFound(creator))
    }

    fn entry_mut(&mut self, creator: FourCc) -> RegistryResult<&mut RegistryEntry> {
        self.entries
            .get_mut(&creator)
            .ok_or(RegistryError::NotFound(creator))
    }

    fn ordered(&self) -> Vec<&RegistryEntry> {
        let mut entries: Vec<&RegistryEntry> = self.entries.values().collect();
        entries.sort_by_key(|e| (e.config.priority, e.seq));
        entries
    }
}

fn access_error(path: &Path, e: std::io::Error) -> RegistryError {
    if e.kind() == ErrorKind::PermissionDenied {
        RegistryError::AccessDenied(path.display().to_string())
    } else {
        RegistryError::Io(e)
    }
}
