//! Account Directory
//!
//! On-disk layout under the data directory:
//!
//! ```text
//! emails.idx              email    -> account id
//! usernames.idx           username -> account id
//! storage.key             hex storage key (unless supplied by env)
//! accounts/<id>/email     sealed field
//! accounts/<id>/username  sealed field
//! accounts/<id>/password  sealed field
//! accounts/<id>/profile.json
//! ```
//!
//! Each field is sealed independently with the storage key so one can be
//! read without touching the others. Index files are rewritten in full on
//! every insert through a temp file and a rename.
//!
//! Read failures on existing data are logged and treated as absent.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::crypto::{CryptoError, SymmetricKey};
use crate::network::protocol::{CharacterSummary, PlayerClass, PlayerRace};
use crate::network::session::SessionId;
use crate::storage::index::{IndexError, SortedIndex};

const EMAIL_INDEX: &str = "emails.idx";
const USERNAME_INDEX: &str = "usernames.idx";
const ACCOUNTS_DIR: &str = "accounts";
const KEY_FILE: &str = "storage.key";
const PROFILE_FILE: &str = "profile.json";

/// Sealed per-account fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// Email address.
    Email,
    /// Username.
    Username,
    /// Password (reversibly encrypted).
    Password,
}

impl Field {
    fn file_name(self) -> &'static str {
        match self {
            Field::Email => "email",
            Field::Username => "username",
            Field::Password => "password",
        }
    }
}

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Filesystem failure.
    #[error("storage io error: {0}")]
    Io(#[from] io::Error),

    /// Field could not be sealed or opened.
    #[error("storage crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Index update rejected.
    #[error("index error: {0}")]
    Index(#[from] IndexError),

    /// Profile metadata could not be written.
    #[error("profile error: {0}")]
    Profile(#[from] serde_json::Error),

    /// Email is already registered.
    #[error("email already registered")]
    EmailTaken,

    /// Username is already registered.
    #[error("username already registered")]
    UsernameTaken,

    /// Storage key is not 32 hex-encoded bytes.
    #[error("invalid storage key: {0}")]
    InvalidKey(String),
}

// =============================================================================
// IDS AND ACCOUNTS
// =============================================================================

/// Unique account identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(Uuid);

impl AccountId {
    /// Fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

impl FromStr for AccountId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A registered account. The password is never held in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    /// Account id.
    pub id: AccountId,
    /// Username.
    pub username: String,
    /// Email address.
    pub email: String,
}

impl Account {
    /// Name of the account's default character.
    pub fn character_name(&self) -> String {
        format!("{}'s character", self.username)
    }

    /// Public summary of the active character for a session.
    pub fn summary(&self, session: SessionId) -> CharacterSummary {
        CharacterSummary {
            session,
            account: self.id,
            name: self.character_name(),
            class: PlayerClass::Blank,
            race: PlayerRace::Turtle,
        }
    }
}

/// Non-secret account metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Account id.
    pub id: AccountId,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// CONFIG
// =============================================================================

/// Storage configuration.
#[derive(Clone, Debug)]
pub struct StorageConfig {
    /// Root of all persisted data.
    pub data_dir: PathBuf,
    /// Storage key. When `None` it is loaded from or created in `data_dir`.
    pub storage_key: Option<SymmetricKey>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("server-data"),
            storage_key: None,
        }
    }
}

impl StorageConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let storage_key = std::env::var("FINAL_AISLE_STORAGE_KEY")
            .ok()
            .and_then(|raw| match parse_key(&raw) {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!("Ignoring FINAL_AISLE_STORAGE_KEY: {}", e);
                    None
                }
            });

        Self {
            data_dir: std::env::var("FINAL_AISLE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            storage_key,
        }
    }

    /// Configured key, or the one stored in `data_dir` (created on first use).
    pub fn load_or_create_key(&self) -> Result<SymmetricKey, StorageError> {
        if let Some(key) = &self.storage_key {
            return Ok(key.clone());
        }

        let path = self.data_dir.join(KEY_FILE);
        match fs::read_to_string(&path) {
            Ok(raw) => parse_key(&raw),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(&self.data_dir)?;
                let key = SymmetricKey::generate();
                fs::write(&path, hex::encode(key.as_bytes()))?;
                info!("Generated new storage key at {}", path.display());
                Ok(key)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn parse_key(raw: &str) -> Result<SymmetricKey, StorageError> {
    let bytes = hex::decode(raw.trim()).map_err(|e| StorageError::InvalidKey(e.to_string()))?;
    SymmetricKey::from_bytes(&bytes).map_err(|e| StorageError::InvalidKey(e.to_string()))
}

// =============================================================================
// DIRECTORY
// =============================================================================

/// Email and username indices plus per-account sealed records.
pub struct AccountDirectory {
    root: PathBuf,
    key: SymmetricKey,
    emails: SortedIndex,
    usernames: SortedIndex,
}

impl AccountDirectory {
    /// Open the directory described by `config`.
    pub fn open(config: &StorageConfig) -> Result<Self, StorageError> {
        let key = config.load_or_create_key()?;
        Self::open_with_key(&config.data_dir, key)
    }

    /// Open `root` with an explicit storage key.
    pub fn open_with_key(root: impl Into<PathBuf>, key: SymmetricKey) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(root.join(ACCOUNTS_DIR))?;

        let emails = load_index(&root.join(EMAIL_INDEX));
        let usernames = load_index(&root.join(USERNAME_INDEX));
        debug!(
            emails = emails.len(),
            usernames = usernames.len(),
            "Loaded account indices"
        );

        Ok(Self {
            root,
            key,
            emails,
            usernames,
        })
    }

    /// Number of registered accounts.
    pub fn len(&self) -> usize {
        self.emails.len()
    }

    /// True when no account exists.
    pub fn is_empty(&self) -> bool {
        self.emails.is_empty()
    }

    /// Email index.
    pub fn emails(&self) -> &SortedIndex {
        &self.emails
    }

    /// Username index.
    pub fn usernames(&self) -> &SortedIndex {
        &self.usernames
    }

    /// Account registered under `email`.
    pub fn lookup_email(&self, email: &str) -> Option<AccountId> {
        self.emails.get(email)
    }

    /// Account registered under `username`.
    pub fn lookup_username(&self, username: &str) -> Option<AccountId> {
        self.usernames.get(username)
    }

    /// Resolve a login identifier, trying email before username.
    pub fn resolve(&self, identifier: &str) -> Option<AccountId> {
        self.lookup_email(identifier)
            .or_else(|| self.lookup_username(identifier))
    }

    /// Persist a new account and add it to both indices.
    pub fn create(&mut self, email: &str, username: &str, password: &str) -> Result<Account, StorageError> {
        if self.emails.contains(email) {
            return Err(StorageError::EmailTaken);
        }
        if self.usernames.contains(username) {
            return Err(StorageError::UsernameTaken);
        }

        let mut id = AccountId::generate();
        while self.account_dir(id).exists() {
            id = AccountId::generate();
        }

        let dir = self.account_dir(id);
        fs::create_dir_all(&dir)?;
        self.write_field(&dir, Field::Email, email)?;
        self.write_field(&dir, Field::Username, username)?;
        self.write_field(&dir, Field::Password, password)?;

        let profile = Profile {
            id,
            created_at: Utc::now(),
        };
        fs::write(dir.join(PROFILE_FILE), serde_json::to_vec_pretty(&profile)?)?;

        self.emails.insert(email, id)?;
        if let Err(e) = self.usernames.insert(username, id) {
            self.emails.remove(email);
            return Err(e.into());
        }

        if let Err(e) = self.persist_indices() {
            self.emails.remove(email);
            self.usernames.remove(username);
            return Err(e);
        }

        info!(account = %id, username, "Created account");
        Ok(Account {
            id,
            username: username.to_owned(),
            email: email.to_owned(),
        })
    }

    /// Load an account's public fields.
    pub fn load(&self, id: AccountId) -> Option<Account> {
        let dir = self.account_dir(id);
        Some(Account {
            id,
            username: self.read_field(&dir, Field::Username)?,
            email: self.read_field(&dir, Field::Email)?,
        })
    }

    /// Read one sealed field.
    pub fn field(&self, id: AccountId, field: Field) -> Option<String> {
        self.read_field(&self.account_dir(id), field)
    }

    /// Compare `password` with the stored one.
    pub fn check_password(&self, id: AccountId, password: &str) -> bool {
        self.field(id, Field::Password)
            .is_some_and(|stored| stored == password)
    }

    /// Creation metadata.
    pub fn profile(&self, id: AccountId) -> Option<Profile> {
        let path = self.account_dir(id).join(PROFILE_FILE);
        let raw = read_or_warn(&path)?;
        serde_json::from_slice(&raw)
            .map_err(|e| warn!("Unreadable profile {}: {}", path.display(), e))
            .ok()
    }

    fn account_dir(&self, id: AccountId) -> PathBuf {
        self.root.join(ACCOUNTS_DIR).join(id.to_string())
    }

    fn write_field(&self, dir: &Path, field: Field, value: &str) -> Result<(), StorageError> {
        let sealed = self.key.seal(value.as_bytes())?;
        fs::write(dir.join(field.file_name()), sealed)?;
        Ok(())
    }

    fn read_field(&self, dir: &Path, field: Field) -> Option<String> {
        let path = dir.join(field.file_name());
        let sealed = read_or_warn(&path)?;
        let plain = self
            .key
            .open(&sealed)
            .map_err(|e| warn!("Cannot open {}: {}", path.display(), e))
            .ok()?;
        String::from_utf8(plain)
            .map_err(|_| warn!("{} is not UTF-8", path.display()))
            .ok()
    }

    fn persist_indices(&self) -> Result<(), StorageError> {
        write_atomic(&self.root.join(EMAIL_INDEX), &self.emails.to_lines())?;
        write_atomic(&self.root.join(USERNAME_INDEX), &self.usernames.to_lines())?;
        Ok(())
    }
}

impl fmt::Debug for AccountDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountDirectory")
            .field("root", &self.root)
            .field("accounts", &self.len())
            .finish_non_exhaustive()
    }
}

fn read_or_warn(path: &Path) -> Option<Vec<u8>> {
    match fs::read(path) {
        Ok(data) => Some(data),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!("Cannot read {}: {}", path.display(), e);
            None
        }
    }
}

fn load_index(path: &Path) -> SortedIndex {
    let Some(raw) = read_or_warn(path) else {
        return SortedIndex::new();
    };

    match std::str::from_utf8(&raw)
        .map_err(|e| e.to_string())
        .and_then(|text| SortedIndex::from_lines(text).map_err(|e| e.to_string()))
    {
        Ok(index) => index,
        Err(e) => {
            warn!("Ignoring unreadable index {}: {}", path.display(), e);
            SortedIndex::new()
        }
    }
}

fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
    let tmp = path.with_extension("idx.tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}
