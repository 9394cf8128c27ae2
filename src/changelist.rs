//! Per-branch association of tracker issue, code review issue and patchset.
//!
//! The mapping lives in git config next to the branch's other settings, so deleting a branch
//! drops its mapping as well. Key names are shared with git-cl.

use crate::settings::{self, ConfigStore};
use crate::tracker::http_client;

use anyhow::{bail, Context, Result};
use colored::*;
use reqwest::header::HeaderMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Pre-config mapping file inside `.git`
pub const LEGACY_MAPPING: &str = "cl-mapping";

/// Converts `refs/heads/foo` to just `foo`
pub fn short_branch_name(branch: &str) -> &str {
    branch.strip_prefix("refs/heads/").unwrap_or(branch)
}

/// Code review URL for a review issue
pub fn review_url(server: &str, issue: u64) -> String {
    format!("https://{}/{}", server.trim_end_matches('/'), issue)
}

/// Patch description as entered on the code review server
pub fn fetch_description(review_url: &str, timeout: Duration) -> Result<String> {
    let url = format!("{}/description", review_url.trim_end_matches('/'));
    debug!("GET {}", url);
    let res = http_client(HeaderMap::new(), timeout)?
        .get(&url)
        .send()
        .and_then(|res| res.error_for_status())
        .with_context(|| format!("Cannot fetch patch description from {}", url))?;
    Ok(res.text()?.trim().to_owned())
}

/// Moves branch/issue pairs from the old `.git/cl-mapping` file into git config.
///
/// Returns the number of migrated entries. The file is only removed after all entries have been
/// written.
pub fn migrate_legacy_mapping(git_dir: &Path, store: &mut dyn ConfigStore) -> Result<usize> {
    let path = git_dir.join(LEGACY_MAPPING);
    if !path.exists() {
        return Ok(0);
    }
    info!(
        "Old-style git-cl mapping file {} found; migrating",
        path.display().to_string().yellow()
    );
    let content =
        fs::read_to_string(&path).with_context(|| format!("Cannot read {}", path.display()))?;
    let mut pairs = Vec::new();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next(), fields.next()) {
            (Some(branch), Some(issue), None) => pairs.push((branch, issue)),
            _ => bail!("Malformed line in {}: `{}'", path.display(), line),
        }
    }
    for (branch, issue) in &pairs {
        store.set(&review_issue_key(short_branch_name(branch)), issue)?;
    }
    fs::remove_file(&path).with_context(|| format!("Cannot remove {}", path.display()))?;
    Ok(pairs.len())
}

fn tracker_issue_key(branch: &str) -> String {
    format!("branch.{}.googlecodeissue", branch)
}

fn review_issue_key(branch: &str) -> String {
    format!("branch.{}.rietveldissue", branch)
}

fn patchset_key(branch: &str) -> String {
    format!("branch.{}.rietveldpatchset", branch)
}

/// Local branch with its associated issues
pub struct Changelist<'a> {
    store: &'a mut dyn ConfigStore,
    branch: String,
}

impl<'a> Changelist<'a> {
    pub fn new<S: AsRef<str>>(store: &'a mut dyn ConfigStore, branch: S) -> Self {
        Self {
            store,
            branch: short_branch_name(branch.as_ref()).to_owned(),
        }
    }

    /// Short branch name, e.g. `master`
    pub fn branch(&self) -> &str {
        &self.branch
    }

    fn get_num(&self, key: &str) -> settings::Result<Option<u64>> {
        match self.store.get(key)? {
            Some(v) => v
                .parse()
                .map(Some)
                .map_err(|_| settings::Error::Invalid {
                    key: key.to_owned(),
                    value: v,
                }),
            None => Ok(None),
        }
    }

    /// Writes `num` or removes the key if `num` is 0
    fn set_num(&mut self, key: &str, num: u64) -> settings::Result<()> {
        if num == 0 {
            self.store.unset(key)
        } else {
            self.store.set(key, &num.to_string())
        }
    }

    pub fn tracker_issue(&self) -> settings::Result<Option<u64>> {
        self.get_num(&tracker_issue_key(&self.branch))
    }

    /// Associates a tracker issue with this branch. 0 clears the association.
    pub fn set_tracker_issue(&mut self, issue: u64) -> settings::Result<()> {
        let key = tracker_issue_key(&self.branch);
        self.set_num(&key, issue)
    }

    pub fn review_issue(&self) -> settings::Result<Option<u64>> {
        self.get_num(&review_issue_key(&self.branch))
    }

    /// Associates a code review issue with this branch. 0 clears it together with the tracker
    /// issue and patchset.
    pub fn set_review_issue(&mut self, issue: u64) -> settings::Result<()> {
        let key = review_issue_key(&self.branch);
        self.set_num(&key, issue)?;
        if issue == 0 {
            self.set_tracker_issue(0)?;
            self.set_patchset(0)?;
        }
        Ok(())
    }

    pub fn patchset(&self) -> settings::Result<Option<u64>> {
        self.get_num(&patchset_key(&self.branch))
    }

    /// 0 clears the patchset
    pub fn set_patchset(&mut self, patchset: u64) -> settings::Result<()> {
        let key = patchset_key(&self.branch);
        self.set_num(&key, patchset)
    }
}
