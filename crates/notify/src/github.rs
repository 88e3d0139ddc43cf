//! GitHub PR comment sink.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ephem_core::LifecycleResult;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{format_comment, NotificationError, NotificationSink, COMMENT_MARKER};

const ENV_TOKEN: &str = "GITHUB_TOKEN";
const ENV_REPOSITORY: &str = "GITHUB_REPOSITORY";
const ENV_API_URL: &str = "GITHUB_API_URL";
const DEFAULT_API_URL: &str = "https://api.github.com";
const COMMENTS_PER_PAGE: usize = 100;
const MAX_COMMENT_PAGES: u32 = 50;
const USER_AGENT: &str = concat!("ephem/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct IssueComment {
    id: u64,
    #[serde(default)]
    body: Option<String>,
}

#[derive(Serialize)]
struct CommentBody<'a> {
    body: &'a str,
}

/// What [`GitHubSink::publish`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommentAction {
    Created,
    Updated(u64),
}

pub struct GitHubSink {
    api_base: String,
    repository: String,
    token: String,
    client: reqwest::Client,
}

impl GitHubSink {
    pub fn new(api_base: impl Into<String>, repository: impl Into<String>, token: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            repository: repository.into(),
            token: token.into(),
            client,
        }
    }

    /// `GITHUB_TOKEN` and `GITHUB_REPOSITORY` (owner/repo) are required;
    /// `GITHUB_API_URL` overrides the API base.
    pub fn from_env() -> Result<Self, NotificationError> {
        let token = std::env::var(ENV_TOKEN)
            .ok()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| NotificationError::NotConfigured(format!("{} is not set", ENV_TOKEN)))?;
        let repository = std::env::var(ENV_REPOSITORY)
            .ok()
            .filter(|r| r.contains('/'))
            .ok_or_else(|| NotificationError::NotConfigured(format!("{} must be owner/repo", ENV_REPOSITORY)))?;
        let api_base = std::env::var(ENV_API_URL).unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        debug!(repository = %repository, api = %api_base, "GitHub comments enabled");
        Ok(Self::new(api_base, repository, token))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}/repos/{}{}", self.api_base, self.repository, path))
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn check(action: &'static str, resp: reqwest::Response) -> Result<reqwest::Response, NotificationError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(NotificationError::Status { action, status: status.as_u16(), body })
    }

    /// Id of the first comment on the PR carrying [`COMMENT_MARKER`]. Pages
    /// through the comments until a short page.
    pub async fn find_marked_comment(&self, pr: u64) -> Result<Option<u64>, NotificationError> {
        let per_page = COMMENTS_PER_PAGE.to_string();
        for page in 1..=MAX_COMMENT_PAGES {
            let page_no = page.to_string();
            let resp = self
                .request(reqwest::Method::GET, &format!("/issues/{}/comments", pr))
                .query(&[("per_page", per_page.as_str()), ("page", page_no.as_str())])
                .send()
                .await?;
            let comments: Vec<IssueComment> = Self::check("list comments", resp).await?.json().await?;
            let count = comments.len();
            let marked = comments.into_iter().find(|c| c.body.as_deref().is_some_and(|b| b.contains(COMMENT_MARKER)));
            if let Some(c) = marked {
                return Ok(Some(c.id));
            }
            if count < COMMENTS_PER_PAGE {
                return Ok(None);
            }
            debug!(pr, page, "marker not on this page");
        }
        warn!(pr, pages = MAX_COMMENT_PAGES, "gave up looking for the marked comment");
        Ok(None)
    }

    /// Update the marked comment if one exists, otherwise post a new one.
    pub async fn publish(&self, pr: u64, result: &LifecycleResult) -> Result<CommentAction, NotificationError> {
        let text = format_comment(pr, result, Utc::now());
        let body = CommentBody { body: &text };
        match self.find_marked_comment(pr).await? {
            Some(id) => {
                let resp = self
                    .request(reqwest::Method::PATCH, &format!("/issues/comments/{}", id))
                    .json(&body)
                    .send()
                    .await?;
                Self::check("update comment", resp).await?;
                Ok(CommentAction::Updated(id))
            }
            None => {
                let resp = self
                    .request(reqwest::Method::POST, &format!("/issues/{}/comments", pr))
                    .json(&body)
                    .send()
                    .await?;
                Self::check("create comment", resp).await?;
                Ok(CommentAction::Created)
            }
        }
    }
}

#[async_trait]
impl NotificationSink for GitHubSink {
    fn name(&self) -> &'static str {
        "github"
    }

    async fn notify(&self, pr: u64, result: &LifecycleResult) {
        match self.publish(pr, result).await {
            Ok(action) => info!(pr, repository = %self.repository, ?action, "PR comment published"),
            Err(e) => warn!(pr, repository = %self.repository, error = %e, "failed to publish PR comment"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ephem_core::{EnvironmentId, Operation};
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn result() -> LifecycleResult {
        let mut r = LifecycleResult::new(Operation::Create, 42, Some(EnvironmentId::from_pr(42).unwrap()));
        r.urls.insert("web".into(), "http://localhost/pr-42/".into());
        r
    }

    #[tokio::test]
    async fn posts_new_comment_when_none_is_marked() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/shop/issues/42/comments"))
            .and(header("authorization", "Bearer t0ken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1, "body": "lgtm"}])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/repos/acme/shop/issues/42/comments"))
            .and(body_string_contains("ephem:preview"))
            .and(body_string_contains("http://localhost/pr-42/"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 9})))
            .expect(1)
            .mount(&server)
            .await;

        let sink = GitHubSink::new(server.uri(), "acme/shop", "t0ken");
        assert_eq!(sink.publish(42, &result()).await.unwrap(), CommentAction::Created);
    }

    #[tokio::test]
    async fn updates_existing_marked_comment() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/shop/issues/42/comments"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 3, "body": "first"},
                {"id": 7, "body": format!("{}\n\nold", COMMENT_MARKER)}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/repos/acme/shop/issues/comments/7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 7})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&server)
            .await;

        let sink = GitHubSink::new(server.uri(), "acme/shop", "t0ken");
        assert_eq!(sink.publish(42, &result()).await.unwrap(), CommentAction::Updated(7));
    }

    #[tokio::test]
    async fn finds_marker_past_the_first_page() {
        let server = MockServer::start().await;
        let chatter: Vec<_> = (1..=100).map(|id| json!({"id": id, "body": "ci passed"})).collect();
        Mock::given(method("GET"))
            .and(path("/repos/acme/shop/issues/42/comments"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chatter))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/shop/issues/42/comments"))
            .and(query_param("page", "2"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([{"id": 150, "body": format!("{}\nold", COMMENT_MARKER)}])),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/repos/acme/shop/issues/comments/150"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 150})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&server)
            .await;

        let sink = GitHubSink::new(server.uri(), "acme/shop", "t0ken");
        assert_eq!(sink.publish(42, &result()).await.unwrap(), CommentAction::Updated(150));
    }

    #[tokio::test]
    async fn api_errors_surface_from_publish_but_not_from_notify() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let sink = GitHubSink::new(server.uri(), "acme/shop", "t0ken");
        match sink.publish(42, &result()).await {
            Err(NotificationError::Status { status, body, .. }) => {
                assert_eq!(status, 403);
                assert_eq!(body, "rate limited");
            }
            other => panic!("unexpected {:?}", other),
        }
        sink.notify(42, &result()).await;
    }
}
