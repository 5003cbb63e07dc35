//! REST client for the anonymisation node's store.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("anonymisation node request failed")]
    Http(#[from] reqwest::Error),
    #[error("anonymisation node returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("node response was not the expected shape: {0}")]
    Shape(&'static str),
}

/// The slice of the node this stage needs: list a study's instances and fetch
/// their files. Seamed for tests.
#[async_trait::async_trait]
pub trait StudyNode: Send + Sync {
    async fn instance_ids(&self, study_id: &str) -> anyhow::Result<Vec<String>>;
    async fn instance_file(&self, instance_id: &str) -> anyhow::Result<Vec<u8>>;
}

pub struct AnonNode {
    url: url::Url,
    username: String,
    password: String,
    client: reqwest::Client,
}

impl AnonNode {
    pub fn new(url: url::Url, username: String, password: String) -> Result<Self, NodeError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            url,
            username,
            password,
            client,
        })
    }

    pub async fn heart_beat(&self) -> Result<(), NodeError> {
        self.get("system").await?;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, NodeError> {
        let url = self.url.join(path).expect("node URL is a valid base");
        let response = self
            .client
            .get(url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NodeError::Status {
                status,
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl StudyNode for AnonNode {
    async fn instance_ids(&self, study_id: &str) -> anyhow::Result<Vec<String>> {
        let listed: serde_json::Value = self
            .get(&format!("studies/{study_id}/instances"))
            .await?
            .json()
            .await
            .map_err(NodeError::from)?;

        let ids = listed
            .as_array()
            .ok_or(NodeError::Shape("instance list is not an array"))?
            .iter()
            .filter_map(|instance| instance["ID"].as_str().map(str::to_string))
            .collect();
        Ok(ids)
    }

    async fn instance_file(&self, instance_id: &str) -> anyhow::Result<Vec<u8>> {
        let bytes = self
            .get(&format!("instances/{instance_id}/file"))
            .await?
            .bytes()
            .await
            .map_err(NodeError::from)?;
        Ok(bytes.to_vec())
    }
}
