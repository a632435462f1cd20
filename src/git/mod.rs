//! Git transport for workspace sync.
//!
//! Wraps the local working tree of one workspace: remote configuration,
//! fetch and push of the sync branch, staging and committing, and reading
//! change logs straight out of a commit without checking it out.

use git2::build::CheckoutBuilder;
use git2::{
    Commit, Cred, CredentialType, ErrorCode, FetchOptions, IndexAddOption, Oid, PushOptions,
    RemoteCallbacks, Repository, ResetType, Signature,
};
use std::path::{Path, PathBuf};

use crate::sync::event::{is_log_file, parse_log, ChangeEvent, CHANGES_DIR};

/// Name of the remote every sync working tree pushes to and fetches from.
pub const REMOTE_NAME: &str = "origin";

/// A workspace's local git repository.
pub struct SyncRepo {
    repo: Repository,
    workdir: PathBuf,
}

impl SyncRepo {
    /// Opens the repository at `workdir`, initializing one if needed, and
    /// points `origin` at `remote_url` when given.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository cannot be opened or created, or
    /// the remote cannot be configured.
    pub fn open_or_init(workdir: &Path, remote_url: Option<&str>) -> Result<Self, git2::Error> {
        let repo = Repository::open(workdir).or_else(|_| Repository::init(workdir))?;
        let sync_repo = Self {
            repo,
            workdir: workdir.to_path_buf(),
        };

        if let Some(url) = remote_url {
            sync_repo.set_remote(url)?;
        }
        Ok(sync_repo)
    }

    /// Creates `origin` or repoints it at `url`.
    pub fn set_remote(&self, url: &str) -> Result<(), git2::Error> {
        let current = match self.repo.find_remote(REMOTE_NAME) {
            Ok(remote) => Some(remote.url().map(str::to_string)),
            Err(e) if e.code() == ErrorCode::NotFound => None,
            Err(e) => return Err(e),
        };

        match current {
            None => {
                self.repo.remote(REMOTE_NAME, url)?;
            }
            Some(existing) if existing.as_deref() != Some(url) => {
                tracing::debug!(
                    "Updating {REMOTE_NAME} of {} to {url}",
                    self.workdir.display()
                );
                self.repo.remote_set_url(REMOTE_NAME, url)?;
            }
            Some(_) => {}
        }
        Ok(())
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn has_remote(&self) -> bool {
        self.repo.find_remote(REMOTE_NAME).is_ok()
    }

    /// Fetches every branch of `origin` and returns the tip of `branch`,
    /// or `None` if the remote does not have it yet.
    pub fn fetch(&self, branch: &str) -> Result<Option<Oid>, git2::Error> {
        let mut remote = self.repo.find_remote(REMOTE_NAME)?;
        let refspec = format!("+refs/heads/*:refs/remotes/{REMOTE_NAME}/*");
        let mut options = FetchOptions::new();
        options.remote_callbacks(self.remote_callbacks());
        remote.fetch(&[refspec.as_str()], Some(&mut options), None)?;
        Ok(self.remote_tip(branch))
    }

    /// Last fetched or pushed tip of `branch` on `origin`.
    pub fn remote_tip(&self, branch: &str) -> Option<Oid> {
        self.repo
            .refname_to_id(&tracking_ref(branch))
            .ok()
    }

    /// Commit HEAD points to, `None` on an unborn branch.
    pub fn head_oid(&self) -> Option<Oid> {
        self.repo.head().ok().and_then(|head| head.target())
    }

    pub fn head_tree_id(&self) -> Option<Oid> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
            .map(|commit| commit.tree_id())
    }

    /// Makes sure HEAD is a born `branch`.
    ///
    /// Adopts the remote branch when `remote_tip` is known, otherwise
    /// starts the branch with an empty commit. Does nothing once HEAD
    /// already has a commit.
    pub fn ensure_branch(
        &self,
        branch: &str,
        remote_tip: Option<Oid>,
        sig: &Signature<'_>,
    ) -> Result<(), git2::Error> {
        if self.head_oid().is_some() {
            return Ok(());
        }

        let local_ref = format!("refs/heads/{branch}");
        match remote_tip {
            Some(tip) => {
                tracing::debug!("Adopting {REMOTE_NAME}/{branch} at {tip}");
                self.repo
                    .reference(&local_ref, tip, true, "lore: adopt remote branch")?;
                self.repo.set_head(&local_ref)?;
                self.repo
                    .checkout_head(Some(CheckoutBuilder::new().force()))?;
            }
            None => {
                self.repo.set_head(&local_ref)?;
                let tree_id = self.repo.treebuilder(None)?.write()?;
                let tree = self.repo.find_tree(tree_id)?;
                self.repo.commit(
                    Some("HEAD"),
                    sig,
                    sig,
                    "Initialize lore workspace",
                    &tree,
                    &[],
                )?;
            }
        }
        Ok(())
    }

    /// Stages every change in the working tree, deletions included, and
    /// returns the resulting tree id.
    pub fn stage_all(&self) -> Result<Oid, git2::Error> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;
        index.write_tree()
    }

    /// Commits `tree_id` on HEAD. The first parent must be the current HEAD.
    pub fn commit(
        &self,
        tree_id: Oid,
        message: &str,
        sig: &Signature<'_>,
        parents: &[Oid],
    ) -> Result<Oid, git2::Error> {
        let tree = self.repo.find_tree(tree_id)?;
        let parents = parents
            .iter()
            .map(|oid| self.repo.find_commit(*oid))
            .collect::<Result<Vec<_>, _>>()?;
        let parent_refs: Vec<&Commit<'_>> = parents.iter().collect();
        self.repo
            .commit(Some("HEAD"), sig, sig, message, &tree, &parent_refs)
    }

    /// Pushes the local `branch` to `origin` and moves the tracking ref.
    ///
    /// # Errors
    ///
    /// Transport failures and references rejected by the remote (for
    /// example a non-fast-forward) are both returned as errors.
    pub fn push(&self, branch: &str) -> Result<(), git2::Error> {
        let Some(head) = self.head_oid() else {
            return Err(git2::Error::from_str("nothing to push: branch has no commits"));
        };

        let mut remote = self.repo.find_remote(REMOTE_NAME)?;
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        let mut rejections = Vec::new();
        {
            let mut callbacks = self.remote_callbacks();
            callbacks.push_update_reference(|refname, status| {
                if let Some(message) = status {
                    rejections.push(format!("{refname}: {message}"));
                }
                Ok(())
            });
            let mut options = PushOptions::new();
            options.remote_callbacks(callbacks);
            remote.push(&[refspec.as_str()], Some(&mut options))?;
        }

        if !rejections.is_empty() {
            return Err(git2::Error::from_str(&format!(
                "push rejected: {}",
                rejections.join("; ")
            )));
        }

        self.repo
            .reference(&tracking_ref(branch), head, true, "lore: push")?;
        Ok(())
    }

    /// Callbacks that authenticate the way command-line git would: the
    /// ssh agent for ssh remotes, configured credential helpers for https.
    fn remote_callbacks<'a>(&self) -> RemoteCallbacks<'a> {
        let config = self.repo.config().ok();
        let mut attempts = CredentialAttempts::default();

        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(move |url, username, allowed| {
            let user = username.unwrap_or("git");
            match attempts.next(allowed) {
                Some(CredentialSource::Username) => Cred::username(user),
                Some(CredentialSource::SshAgent) => Cred::ssh_key_from_agent(user),
                Some(CredentialSource::Helper) => match &config {
                    Some(config) => Cred::credential_helper(config, url, username),
                    None => Err(git2::Error::from_str("git config unavailable for credential helper")),
                },
                Some(CredentialSource::Default) => Cred::default(),
                None => Err(git2::Error::from_str(&format!(
                    "authentication failed for {url}: no usable credentials"
                ))),
            }
        });
        callbacks
    }

    /// Whether `commit` is `ancestor` or one of its descendants.
    pub fn contains(&self, commit: Oid, ancestor: Oid) -> Result<bool, git2::Error> {
        if commit == ancestor {
            return Ok(true);
        }
        self.repo.graph_descendant_of(commit, ancestor)
    }

    /// Reads every change log stored in `commit`, keyed by file name.
    pub fn read_logs_at(&self, commit: Oid) -> Result<Vec<(String, Vec<ChangeEvent>)>, git2::Error> {
        let tree = self.repo.find_commit(commit)?.tree()?;
        let entry = match tree.get_path(Path::new(CHANGES_DIR)) {
            Ok(entry) => entry,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let dir = entry.to_object(&self.repo)?.peel_to_tree()?;

        let mut logs = Vec::new();
        for item in dir.iter() {
            let Some(name) = item.name() else {
                continue;
            };
            if !is_log_file(name) {
                continue;
            }
            let blob = item.to_object(&self.repo)?.peel_to_blob()?;
            logs.push((name.to_string(), parse_log(blob.content())));
        }
        Ok(logs)
    }

    /// Moves HEAD and the index to `target`, leaving the working tree alone.
    pub fn reset_mixed(&self, target: Oid) -> Result<(), git2::Error> {
        let object = self.repo.find_object(target, None)?;
        self.repo.reset(&object, ResetType::Mixed, None)
    }
}

/// Commit signature for sync commits.
pub fn signature(name: &str, email: &str) -> Result<Signature<'static>, git2::Error> {
    Signature::now(name, email)
}

/// Where a credential comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CredentialSource {
    Username,
    SshAgent,
    Helper,
    Default,
}

/// Remembers which credential sources were already offered during one
/// connection, so a rejected credential is not retried forever.
#[derive(Debug, Default)]
struct CredentialAttempts {
    username: bool,
    ssh_agent: bool,
    helper: bool,
    default: bool,
}

impl CredentialAttempts {
    fn next(&mut self, allowed: CredentialType) -> Option<CredentialSource> {
        if allowed.contains(CredentialType::USERNAME) && !self.username {
            self.username = true;
            return Some(CredentialSource::Username);
        }
        if allowed.contains(CredentialType::SSH_KEY) && !self.ssh_agent {
            self.ssh_agent = true;
            return Some(CredentialSource::SshAgent);
        }
        if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) && !self.helper {
            self.helper = true;
            return Some(CredentialSource::Helper);
        }
        if allowed.contains(CredentialType::DEFAULT) && !self.default {
            self.default = true;
            return Some(CredentialSource::Default);
        }
        None
    }
}

fn tracking_ref(branch: &str) -> String {
    format!("refs/remotes/{REMOTE_NAME}/{branch}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::event::{append_event, log_path, Change, ChangeOperation, EntityKind};
    use crate::sync::VectorClock;
    use tempfile::tempdir;

    fn test_sig() -> Signature<'static> {
        signature("Test", "test@example.com").unwrap()
    }

    fn bare_remote(dir: &Path) -> String {
        let path = dir.join("remote.git");
        Repository::init_bare(&path).unwrap();
        path.to_string_lossy().to_string()
    }

    fn sample_event(device: &str) -> ChangeEvent {
        ChangeEvent::stamp(
            Change::new(ChangeOperation::Create, EntityKind::Realm, "r1"),
            device,
            VectorClock::from([(device, 1)]),
        )
    }

    #[test]
    fn test_open_or_init_is_idempotent() {
        let dir = tempdir().unwrap();
        let workdir = dir.path().join("ws");
        std::fs::create_dir_all(&workdir).unwrap();

        let repo = SyncRepo::open_or_init(&workdir, None).unwrap();
        assert!(!repo.has_remote());
        drop(repo);

        let repo = SyncRepo::open_or_init(&workdir, Some("/tmp/elsewhere.git")).unwrap();
        assert!(repo.has_remote());
        let repo = SyncRepo::open_or_init(&workdir, Some("/tmp/other.git")).unwrap();
        let url = repo
            .repo
            .find_remote(REMOTE_NAME)
            .unwrap()
            .url()
            .map(str::to_string);
        assert_eq!(url.as_deref(), Some("/tmp/other.git"));
    }

    #[test]
    fn test_ensure_branch_creates_initial_commit() {
        let dir = tempdir().unwrap();
        let repo = SyncRepo::open_or_init(dir.path(), None).unwrap();
        assert!(repo.head_oid().is_none());

        repo.ensure_branch("main", None, &test_sig()).unwrap();
        let head = repo.head_oid().expect("HEAD should be born");

        repo.ensure_branch("main", None, &test_sig()).unwrap();
        assert_eq!(repo.head_oid(), Some(head), "Second call is a no-op");
    }

    #[test]
    fn test_push_fetch_and_read_logs() {
        let dir = tempdir().unwrap();
        let url = bare_remote(dir.path());

        let first_dir = dir.path().join("first");
        std::fs::create_dir_all(&first_dir).unwrap();
        let first = SyncRepo::open_or_init(&first_dir, Some(&url)).unwrap();
        let tip = first.fetch("main").unwrap();
        assert!(tip.is_none(), "Empty remote has no branch");
        first.ensure_branch("main", tip, &test_sig()).unwrap();

        let event = sample_event("laptop");
        append_event(&log_path(&first_dir, "laptop"), &event).unwrap();
        let tree = first.stage_all().unwrap();
        assert_ne!(Some(tree), first.head_tree_id());
        let head = first.head_oid().unwrap();
        let commit = first.commit(tree, "add log", &test_sig(), &[head]).unwrap();
        first.push("main").unwrap();
        assert_eq!(first.remote_tip("main"), Some(commit));

        let second_dir = dir.path().join("second");
        std::fs::create_dir_all(&second_dir).unwrap();
        let second = SyncRepo::open_or_init(&second_dir, Some(&url)).unwrap();
        let tip = second.fetch("main").unwrap();
        assert_eq!(tip, Some(commit));
        second.ensure_branch("main", tip, &test_sig()).unwrap();
        assert_eq!(second.head_oid(), Some(commit));
        assert!(log_path(&second_dir, "laptop").exists(), "Checkout fills the working tree");

        let logs = second.read_logs_at(commit).unwrap();
        assert_eq!(logs, vec![("laptop.jsonl".to_string(), vec![event])]);
        assert!(second.contains(commit, head).unwrap());
        assert!(!second.contains(head, commit).unwrap());
    }

    #[test]
    fn test_read_logs_without_changes_dir() {
        let dir = tempdir().unwrap();
        let repo = SyncRepo::open_or_init(dir.path(), None).unwrap();
        repo.ensure_branch("main", None, &test_sig()).unwrap();
        let head = repo.head_oid().unwrap();
        assert!(repo.read_logs_at(head).unwrap().is_empty());
    }

    #[test]
    fn test_non_fast_forward_push_is_rejected() {
        let dir = tempdir().unwrap();
        let url = bare_remote(dir.path());

        let mut repos = Vec::new();
        for name in ["a", "b"] {
            let workdir = dir.path().join(name);
            std::fs::create_dir_all(&workdir).unwrap();
            let repo = SyncRepo::open_or_init(&workdir, Some(&url)).unwrap();
            repo.ensure_branch("main", None, &test_sig()).unwrap();
            repos.push(repo);
        }

        repos[0].push("main").unwrap();
        assert!(repos[1].push("main").is_err(), "Unrelated history cannot fast-forward");
    }

    #[test]
    fn test_reset_mixed_keeps_working_tree() {
        let dir = tempdir().unwrap();
        let repo = SyncRepo::open_or_init(dir.path(), None).unwrap();
        repo.ensure_branch("main", None, &test_sig()).unwrap();
        let base = repo.head_oid().unwrap();

        std::fs::write(dir.path().join("note.txt"), "hello").unwrap();
        let tree = repo.stage_all().unwrap();
        let next = repo.commit(tree, "note", &test_sig(), &[base]).unwrap();

        repo.reset_mixed(base).unwrap();
        assert_eq!(repo.head_oid(), Some(base));
        assert!(dir.path().join("note.txt").exists());
        assert_ne!(repo.head_oid(), Some(next));
    }

    #[test]
    fn test_ssh_credentials_try_agent_once() {
        let mut attempts = CredentialAttempts::default();
        assert_eq!(
            attempts.next(CredentialType::USERNAME),
            Some(CredentialSource::Username)
        );
        assert_eq!(
            attempts.next(CredentialType::SSH_KEY),
            Some(CredentialSource::SshAgent)
        );
        // Agent key rejected: give up instead of looping
        assert_eq!(attempts.next(CredentialType::SSH_KEY), None);
    }

    #[test]
    fn test_https_credentials_use_helper_then_default() {
        let mut attempts = CredentialAttempts::default();
        let allowed = CredentialType::USER_PASS_PLAINTEXT | CredentialType::DEFAULT;
        assert_eq!(attempts.next(allowed), Some(CredentialSource::Helper));
        assert_eq!(attempts.next(allowed), Some(CredentialSource::Default));
        assert_eq!(attempts.next(allowed), None);
    }
}
