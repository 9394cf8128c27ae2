//! Settings kept in git's configuration.
//!
//! Everything persistent lives in git config: tracker endpoints and credentials as well as the
//! per-branch issue associations managed by [`crate::changelist`]. [`Settings`] is read once at
//! startup and handed to whoever needs it.

use git2::{ConfigLevel, ErrorCode, Repository};
use serde::{Serialize, Serializer};
use std::path::Path;
use thiserror::Error;

pub const TRACKER_SERVER: &str = "allura.tracker";
pub const TOKEN: &str = "allura.token";
pub const REVIEW_SERVER: &str = "rietveld.server";
pub const CC: &str = "rietveld.cc";
pub const PROJECT: &str = "projecthosting.project";
pub const USER: &str = "projecthosting.user";
pub const HOSTING_TOKEN: &str = "projecthosting.token";
pub const HOSTING_SERVER: &str = "projecthosting.server";

pub const DEFAULT_HOSTING_SERVER: &str = "https://code.google.com";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Setting `{key}' is missing. You must configure your setup by running `cl-tracker config'")]
    ConfigMissing { key: String },
    #[error("Setting `{key}' contains invalid value `{value}'")]
    Invalid { key: String, value: String },
    #[error("Cannot determine current branch (detached HEAD?)")]
    NoBranch,
    #[error("Cannot access git configuration")]
    Git(#[from] git2::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Key-value store for all persistent settings
pub trait ConfigStore {
    /// Returns `None` for absent or empty values
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&mut self, key: &str, value: &str) -> Result<()>;

    /// Removes `key`. Removing an absent key is not an error.
    fn unset(&mut self, key: &str) -> Result<()>;
}

/// Config of the git repository we are running in
pub struct GitConfig {
    repo: Repository,
}

impl GitConfig {
    /// Finds the repository containing `path`
    pub fn discover<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(Repository::discover(path)?))
    }

    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    /// Path of the `.git` directory
    pub fn git_dir(&self) -> &Path {
        self.repo.path()
    }

    /// Short name of the checked out branch, e.g. `master`
    pub fn current_branch(&self) -> Result<String> {
        let head = self.repo.head()?;
        if !head.is_branch() {
            return Err(Error::NoBranch);
        }
        let name = head.name().ok_or(Error::NoBranch)?;
        Ok(crate::changelist::short_branch_name(name).to_owned())
    }

    fn local(&self) -> Result<git2::Config> {
        Ok(self.repo.config()?.open_level(ConfigLevel::Local)?)
    }
}

impl ConfigStore for GitConfig {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match self.repo.config()?.get_string(key) {
            Ok(v) if v.trim().is_empty() => Ok(None),
            Ok(v) => Ok(Some(v.trim().to_owned())),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        debug!("git config {} {}", key, value);
        Ok(self.local()?.set_str(key, value)?)
    }

    fn unset(&mut self, key: &str) -> Result<()> {
        debug!("git config --unset {}", key);
        match self.local()?.remove(key) {
            Err(e) if e.code() == ErrorCode::NotFound => Ok(()),
            r => Ok(r?),
        }
    }
}

fn redact<S: Serializer>(v: &Option<String>, s: S) -> Result<S::Ok, S::Error> {
    match v {
        Some(_) => s.serialize_some("********"),
        None => s.serialize_none(),
    }
}

/// Tracker and review settings, read once at startup
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Settings {
    pub tracker_server: Option<String>,
    #[serde(serialize_with = "redact")]
    pub token: Option<String>,
    pub review_server: Option<String>,
    pub cc: Option<String>,
    pub project: Option<String>,
    pub user: Option<String>,
    #[serde(serialize_with = "redact")]
    pub hosting_token: Option<String>,
    pub hosting_server: Option<String>,
}

fn required<'a>(val: &'a Option<String>, key: &str) -> Result<&'a str> {
    val.as_deref().ok_or_else(|| Error::ConfigMissing {
        key: key.to_owned(),
    })
}

impl Settings {
    pub fn load(store: &dyn ConfigStore) -> Result<Self> {
        Ok(Self {
            tracker_server: store.get(TRACKER_SERVER)?,
            token: store.get(TOKEN)?,
            review_server: store.get(REVIEW_SERVER)?,
            cc: store.get(CC)?,
            project: store.get(PROJECT)?,
            user: store.get(USER)?,
            hosting_token: store.get(HOSTING_TOKEN)?,
            hosting_server: store.get(HOSTING_SERVER)?,
        })
    }

    /// Writes all set fields. Fields which are `None` are left alone.
    pub fn save(&self, store: &mut dyn ConfigStore) -> Result<()> {
        for (key, val) in self.fields() {
            if let Some(v) = val {
                store.set(key, v)?;
            }
        }
        Ok(())
    }

    /// Fills all unset fields from `other`
    pub fn or(self, other: Settings) -> Self {
        Self {
            tracker_server: self.tracker_server.or(other.tracker_server),
            token: self.token.or(other.token),
            review_server: self.review_server.or(other.review_server),
            cc: self.cc.or(other.cc),
            project: self.project.or(other.project),
            user: self.user.or(other.user),
            hosting_token: self.hosting_token.or(other.hosting_token),
            hosting_server: self.hosting_server.or(other.hosting_server),
        }
    }

    fn fields(&self) -> [(&'static str, &Option<String>); 8] {
        [
            (TRACKER_SERVER, &self.tracker_server),
            (TOKEN, &self.token),
            (REVIEW_SERVER, &self.review_server),
            (CC, &self.cc),
            (PROJECT, &self.project),
            (USER, &self.user),
            (HOSTING_TOKEN, &self.hosting_token),
            (HOSTING_SERVER, &self.hosting_server),
        ]
    }

    pub fn tracker_server(&self) -> Result<&str> {
        required(&self.tracker_server, TRACKER_SERVER)
    }

    pub fn token(&self) -> Result<&str> {
        required(&self.token, TOKEN)
    }

    pub fn project(&self) -> Result<&str> {
        required(&self.project, PROJECT)
    }

    pub fn user(&self) -> Result<&str> {
        required(&self.user, USER)
    }

    pub fn hosting_token(&self) -> Result<&str> {
        required(&self.hosting_token, HOSTING_TOKEN)
    }

    pub fn hosting_server(&self) -> &str {
        self.hosting_server
            .as_deref()
            .unwrap_or(DEFAULT_HOSTING_SERVER)
    }
}
