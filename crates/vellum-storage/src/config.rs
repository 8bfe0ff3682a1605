//! Backend configuration: connection target, reconnect policy, pool sizing,
//! and the SQLite pragma whitelists.
//!
//! String pragma values are modelled as enums, so an invalid value fails at
//! configure time (parse time for string-sourced config) and no PRAGMA is
//! ever issued for it.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use vellum_core::error::{Result, VellumError};

/// How many prepared statements a driver caches per connection.
pub const STATEMENT_CACHE_CAPACITY: usize = 100;

macro_rules! pragma_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $sql:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_sql(&self) -> &'static str {
                match self {
                    $(Self::$variant => $sql),+
                }
            }
        }

        impl FromStr for $name {
            type Err = VellumError;

            fn from_str(s: &str) -> Result<Self> {
                match s.to_ascii_uppercase().as_str() {
                    $($sql => Ok(Self::$variant),)+
                    other => Err(VellumError::validation(format!(
                        concat!("invalid ", stringify!($name), " '{}'; expected one of: ", $($sql, " "),+),
                        other
                    ))),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = VellumError;

            fn try_from(s: String) -> Result<Self> {
                s.parse()
            }
        }

        impl From<$name> for String {
            fn from(v: $name) -> String {
                v.as_sql().to_string()
            }
        }
    };
}

pragma_enum!(
    /// `PRAGMA journal_mode` whitelist.
    JournalMode {
        Delete => "DELETE",
        Truncate => "TRUNCATE",
        Persist => "PERSIST",
        Memory => "MEMORY",
        Wal => "WAL",
        Off => "OFF",
    }
);

pragma_enum!(
    /// `PRAGMA synchronous` whitelist.
    Synchronous {
        Off => "OFF",
        Normal => "NORMAL",
        Full => "FULL",
        Extra => "EXTRA",
    }
);

pragma_enum!(
    /// `PRAGMA temp_store` whitelist.
    TempStore {
        Default => "DEFAULT",
        File => "FILE",
        Memory => "MEMORY",
    }
);

pragma_enum!(
    /// `PRAGMA locking_mode` whitelist.
    LockingMode {
        Normal => "NORMAL",
        Exclusive => "EXCLUSIVE",
    }
);

pragma_enum!(
    /// `PRAGMA auto_vacuum` whitelist.
    AutoVacuum {
        None => "NONE",
        Full => "FULL",
        Incremental => "INCREMENTAL",
    }
);

/// SQLite pragma settings applied when a connection is configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlitePragmas {
    pub journal_mode: Option<JournalMode>,
    pub synchronous: Option<Synchronous>,
    pub temp_store: Option<TempStore>,
    pub locking_mode: Option<LockingMode>,
    pub auto_vacuum: Option<AutoVacuum>,
    /// Milliseconds; `None` keeps the default of 5000.
    pub busy_timeout_ms: Option<u32>,
    /// WAL auto-checkpoint interval in pages.
    pub wal_autocheckpoint: Option<u32>,
    /// Page-cache size in KiB, stored positive and applied negated. `None`
    /// sizes the cache from available memory.
    pub page_cache_kib: Option<u32>,
}

impl Default for SqlitePragmas {
    fn default() -> Self {
        Self {
            journal_mode: Some(JournalMode::Wal),
            synchronous: None,
            temp_store: None,
            locking_mode: None,
            auto_vacuum: None,
            busy_timeout_ms: None,
            wal_autocheckpoint: None,
            page_cache_kib: None,
        }
    }
}

impl SqlitePragmas {
    /// Checks the numeric pragmas. The unsigned types already exclude
    /// non-finite and negative values; this bounds the outliers.
    pub fn validate(&self) -> Result<()> {
        if let Some(kib) = self.page_cache_kib {
            if kib > crate::mem::MAX_PAGE_CACHE_KIB as u32 {
                return Err(VellumError::validation(format!(
                    "page_cache_kib {kib} exceeds the maximum of {}",
                    crate::mem::MAX_PAGE_CACHE_KIB
                )));
            }
        }
        Ok(())
    }
}

/// Connection-pool sizing and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_connections: usize,
    pub max_connections: usize,
    pub acquire_timeout: Duration,
    pub create_timeout: Duration,
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
    /// Attempts per connection creation before giving up.
    pub max_retries: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 8,
            acquire_timeout: Duration::from_secs(30),
            create_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            reap_interval: Duration::from_secs(60),
            max_retries: 3,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(VellumError::validation("max_connections must be at least 1"));
        }
        if self.min_connections > self.max_connections {
            return Err(VellumError::validation(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }
}

/// Full backend configuration for a [`Database`](crate::db::Database).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    /// Database file path; ignored when `memory` is set.
    pub path: Option<PathBuf>,
    /// Use an in-memory database.
    pub memory: bool,
    /// Pool the backend across multiple connections. Without this the
    /// database runs on a single shared connection.
    pub pool: Option<PoolConfig>,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    /// Base reconnect delay; attempt `n` waits `base * (n + 1)`.
    pub reconnect_delay: Duration,
    pub pragmas: SqlitePragmas,
    /// Abort operations when a plugin hook fails, instead of logging and
    /// continuing.
    pub strict_plugins: bool,
    /// Elapsed-time budget per plugin hook; overruns raise `PluginTimeout`.
    pub hook_budget: Option<Duration>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: None,
            memory: false,
            pool: None,
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(100),
            pragmas: SqlitePragmas::default(),
            strict_plugins: false,
            hook_budget: None,
        }
    }
}

impl DbConfig {
    /// Configuration for a database file at `path`.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Configuration for a private in-memory database.
    pub fn in_memory() -> Self {
        Self {
            memory: true,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.memory && self.path.is_none() {
            return Err(VellumError::validation(
                "config needs either a path or memory = true",
            ));
        }
        self.pragmas.validate()?;
        if let Some(ref pool) = self.pool {
            pool.validate()?;
        }
        Ok(())
    }
}
