use serde::{Deserialize, Serialize};

/// Push event as delivered by a git host webhook.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PushEvent {
    #[serde(rename = "ref")]
    pub ref_name: String,
    #[serde(default)]
    pub commits: Vec<PushCommit>,
    pub head_commit: Option<PushCommit>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PushCommit {
    pub id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub author: CommitAuthor,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CommitAuthor {
    #[serde(default)]
    pub name: String,
}

/// The fields the pipeline factory needs from a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushTrigger {
    pub branch: String,
    pub commit_sha: String,
    pub author: String,
    pub message: String,
}

impl PushEvent {
    /// `refs/heads/feature/x` -> `feature/x`. Refs without the prefix are used as-is.
    pub fn branch(&self) -> &str {
        self.ref_name
            .strip_prefix("refs/heads/")
            .unwrap_or(&self.ref_name)
    }

    /// The explicit head commit if the payload carries one, else the newest listed commit.
    pub fn head(&self) -> Option<&PushCommit> {
        self.head_commit.as_ref().or_else(|| self.commits.last())
    }

    /// `None` when the push has no commits or no usable branch / commit id.
    pub fn to_trigger(&self) -> Option<PushTrigger> {
        if self.commits.is_empty() {
            return None;
        }
        let branch = self.branch();
        let head = self.head()?;
        if branch.is_empty() || head.id.trim().is_empty() {
            return None;
        }

        Some(PushTrigger {
            branch: branch.to_string(),
            commit_sha: head.id.trim().chars().take(8).collect(),
            author: head.author.name.clone(),
            message: head.message.clone(),
        })
    }
}
