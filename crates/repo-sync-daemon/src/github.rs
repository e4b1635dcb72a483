//! GitHub transport: `RemoteStore` over the git-data REST API.
//!
//! All requests carry the access token as a bearer credential. Nothing is
//! retried here; the coordinator reports failures and the host decides.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use repo_sync_core::remote::{NewTreeEntry, RemoteError, RemoteFile, RemoteStore, Result, TreeId};
use repo_sync_core::{CommitId, ContentHash, FileMode, Settings, TreeEntry};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
const API_VERSION: &str = "2022-11-28";
const USER_AGENT: &str = concat!("repo-sync/", env!("CARGO_PKG_VERSION"));

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct ShaObject {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct RefResponse {
    object: ShaObject,
}

#[derive(Debug, Deserialize)]
struct TreeItem {
    path: String,
    #[serde(default)]
    mode: String,
    #[serde(rename = "type")]
    kind: String,
    sha: String,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TreeResponse {
    tree: Vec<TreeItem>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct ContentFile {
    #[serde(rename = "type")]
    kind: String,
    sha: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
}

/// `contents/` answers with an object for a file and an array for a directory.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ContentsResponse {
    Entry(ContentFile),
    Listing(Vec<serde_json::Value>),
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    sha: String,
    tree: ShaObject,
}

#[derive(Debug, Serialize)]
struct CreateBlob<'a> {
    content: &'a str,
    encoding: &'static str,
}

#[derive(Debug, Serialize)]
struct CreateTreeItem<'a> {
    path: &'a str,
    mode: FileMode,
    #[serde(rename = "type")]
    kind: &'static str,
    /// `null` removes the path from the base tree
    sha: Option<&'a str>,
}

impl<'a> From<&'a NewTreeEntry> for CreateTreeItem<'a> {
    fn from(entry: &'a NewTreeEntry) -> Self {
        Self {
            path: &entry.path,
            mode: entry.mode,
            kind: entry.kind,
            sha: entry.hash.as_ref().map(ContentHash::as_str),
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateTree<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    base_tree: Option<&'a str>,
    tree: Vec<CreateTreeItem<'a>>,
}

#[derive(Debug, Serialize)]
struct CreateCommit<'a> {
    message: &'a str,
    tree: &'a str,
    parents: Vec<&'a str>,
}

#[derive(Debug, Serialize)]
struct UpdateRef<'a> {
    sha: &'a str,
    force: bool,
}

// ============================================================================
// Client
// ============================================================================

/// One repository branch on GitHub.
pub struct GitHubRemote {
    client: Client,
    /// `{api}/repos/{owner}/{repo}`
    repo_url: Url,
    branch: String,
    token: String,
}

impl GitHubRemote {
    pub fn new(settings: &Settings) -> Result<Self> {
        Self::with_api_base(settings, DEFAULT_API_BASE)
    }

    /// Point at a different API host (GitHub Enterprise, test servers).
    pub fn with_api_base(settings: &Settings, api_base: &str) -> Result<Self> {
        let mut repo_url = Url::parse(api_base)
            .map_err(|e| RemoteError::Transport(format!("Invalid API base {}: {}", api_base, e)))?;
        repo_url
            .path_segments_mut()
            .map_err(|_| RemoteError::Transport(format!("Invalid API base {}", api_base)))?
            .pop_if_empty()
            .extend(["repos", settings.owner.as_str(), settings.repo.as_str()]);

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            repo_url,
            branch: settings.branch().to_string(),
            token: settings.credential_material.clone(),
        })
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Repository url extended with `/`-separated `segments`.
    fn url(&self, segments: &str) -> Url {
        let mut url = self.repo_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.extend(segments.split('/').filter(|s| !s.is_empty()));
        }
        url
    }

    fn contents_url(&self, path: &str) -> Url {
        let mut url = self.url(&format!("contents/{}", path));
        url.query_pairs_mut().append_pair("ref", &self.branch);
        url
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    /// Send `request`, map the status, and decode the JSON body.
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<T> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| RemoteError::Transport(format!("{}: {}", what, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, what, &body));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| RemoteError::InvalidResponse(format!("{}: {}", what, e)))
    }

    async fn base_tree(&self, commit: &CommitId) -> Result<String> {
        let url = self.url(&format!("git/commits/{}", commit));
        let response: CommitResponse = self
            .send(self.client.get(url), &format!("commit {}", commit))
            .await?;
        Ok(response.tree.sha)
    }
}

/// Map a non-success status to the engine's error taxonomy.
fn status_error(status: StatusCode, what: &str, body: &str) -> RemoteError {
    let detail = format!("{} ({}): {}", what, status.as_u16(), body.trim());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Auth(detail),
        StatusCode::NOT_FOUND => RemoteError::NotFound(what.to_string()),
        _ => RemoteError::Transport(detail),
    }
}

fn parse_hash(sha: &str) -> Result<ContentHash> {
    ContentHash::from_hex(sha)
        .map_err(|e| RemoteError::InvalidResponse(format!("{}: {}", sha, e)))
}

fn tree_entries(response: TreeResponse) -> Result<Vec<TreeEntry>> {
    if response.truncated {
        warn!("Remote tree listing was truncated; some files will not sync");
    }
    response
        .tree
        .into_iter()
        .filter(|item| item.kind == "blob")
        .map(|item| {
            Ok(TreeEntry {
                hash: parse_hash(&item.sha)?,
                mode: FileMode::parse(&item.mode).unwrap_or_default(),
                path: item.path,
                url: item.url,
            })
        })
        .collect()
}

fn decode_contents(path: &str, response: ContentsResponse) -> Result<RemoteFile> {
    let file = match response {
        ContentsResponse::Entry(file) if file.kind == "file" => file,
        _ => return Err(RemoteError::NotAFile(path.to_string())),
    };

    let encoded = file.content.unwrap_or_default();
    let content = match file.encoding.as_deref() {
        Some("base64") => {
            // GitHub wraps the payload at 60 columns
            let compact: String = encoded.split_whitespace().collect();
            BASE64
                .decode(compact)
                .map_err(|e| RemoteError::InvalidResponse(format!("{}: {}", path, e)))?
        }
        Some("none") | None if encoded.is_empty() => {
            // Files over 1 MB come back without inline content
            return Err(RemoteError::InvalidResponse(format!(
                "{}: content not included in response",
                path
            )));
        }
        _ => encoded.into_bytes(),
    };

    Ok(RemoteFile {
        content,
        hash: parse_hash(&file.sha)?,
    })
}

#[async_trait]
impl RemoteStore for GitHubRemote {
    async fn get_reference(&self) -> Result<CommitId> {
        let url = self.url(&format!("git/ref/heads/{}", self.branch));
        let response: RefResponse = self
            .send(self.client.get(url), &format!("branch {}", self.branch))
            .await?;
        Ok(CommitId::new(response.object.sha))
    }

    async fn get_tree(&self, commit: &CommitId) -> Result<Vec<TreeEntry>> {
        let mut url = self.url(&format!("git/trees/{}", commit));
        url.query_pairs_mut().append_pair("recursive", "1");
        let response: TreeResponse = self
            .send(self.client.get(url), &format!("tree of {}", commit))
            .await?;
        tree_entries(response)
    }

    async fn get_content(&self, path: &str) -> Result<RemoteFile> {
        let response: ContentsResponse = self
            .send(self.client.get(self.contents_url(path)), path)
            .await?;
        decode_contents(path, response)
    }

    async fn create_blob(&self, content: &[u8]) -> Result<ContentHash> {
        let encoded = BASE64.encode(content);
        let body = CreateBlob {
            content: &encoded,
            encoding: "base64",
        };
        let response: ShaObject = self
            .send(self.client.post(self.url("git/blobs")).json(&body), "blob")
            .await?;
        parse_hash(&response.sha)
    }

    async fn create_tree(&self, base: &CommitId, entries: &[NewTreeEntry]) -> Result<TreeId> {
        let base_tree = if base.is_empty() {
            None
        } else {
            Some(self.base_tree(base).await?)
        };

        let body = CreateTree {
            base_tree: base_tree.as_deref(),
            tree: entries.iter().map(CreateTreeItem::from).collect(),
        };
        let response: ShaObject = self
            .send(self.client.post(self.url("git/trees")).json(&body), "tree")
            .await?;
        debug!("Created tree {} ({} entries)", response.sha, entries.len());
        Ok(TreeId::new(response.sha))
    }

    async fn create_commit(
        &self,
        message: &str,
        tree: &TreeId,
        parent: &CommitId,
    ) -> Result<CommitId> {
        let parents = if parent.is_empty() {
            Vec::new()
        } else {
            vec![parent.as_str()]
        };
        let body = CreateCommit {
            message,
            tree: tree.as_str(),
            parents,
        };
        let response: ShaObject = self
            .send(self.client.post(self.url("git/commits")).json(&body), "commit")
            .await?;
        Ok(CommitId::new(response.sha))
    }

    async fn update_reference(&self, commit: &CommitId) -> Result<()> {
        let url = self.url(&format!("git/refs/heads/{}", self.branch));
        let body = UpdateRef {
            sha: commit.as_str(),
            force: false,
        };
        let _: serde_json::Value = self
            .send(
                self.client.patch(url).json(&body),
                &format!("branch {}", self.branch),
            )
            .await?;
        Ok(())
    }
}
