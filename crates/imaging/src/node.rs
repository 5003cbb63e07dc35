//! REST client for the embedded DICOM node fronting the raw store.
//!
//! The node speaks C-FIND/C-MOVE on our behalf; this client only drives its
//! job-oriented HTTP API. Everything is seamed behind [`ArchiveNode`] so the
//! fetch state machine can be exercised without a node.

use std::collections::BTreeMap;
use std::time::Duration;

use project_config::tags::PROJECT_NAME_TAG;
use serde::Serialize;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("node request failed")]
    Http(#[from] reqwest::Error),
    #[error("node returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("node response was not the expected shape: {0}")]
    Shape(&'static str),
}

/// A study-level query, by UID when known and by (PatientID, AccessionNumber)
/// otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StudyQuery {
    #[serde(rename = "Level")]
    level: &'static str,
    #[serde(rename = "Query")]
    query: BTreeMap<&'static str, String>,
}

impl StudyQuery {
    pub fn by_uid(study_uid: &str) -> Self {
        Self {
            level: "Study",
            query: BTreeMap::from([("StudyInstanceUID", study_uid.to_string())]),
        }
    }

    pub fn by_identifiers(mrn: &str, accession_number: &str) -> Self {
        Self {
            level: "Study",
            query: BTreeMap::from([
                ("PatientID", mrn.to_string()),
                ("AccessionNumber", accession_number.to_string()),
            ]),
        }
    }
}

/// State of an asynchronous node job (C-MOVE retrieval).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    InProgress,
    Success,
    Failure,
}

#[async_trait::async_trait]
pub trait ArchiveNode: Send + Sync {
    /// Resource ids of matching studies already in the raw store.
    async fn find_local(&self, query: &StudyQuery) -> anyhow::Result<Vec<String>>;

    /// Query a remote archive modality. `None` means no answers, and an
    /// elapsed query timeout is indistinguishable from an empty answer set.
    async fn query_remote(&self, modality: &str, query: &StudyQuery)
        -> anyhow::Result<Option<String>>;

    /// Start the C-MOVE for an answered query; returns the job id.
    async fn retrieve(&self, query_id: &str) -> anyhow::Result<String>;

    async fn job_state(&self, job_id: &str) -> anyhow::Result<JobState>;

    /// Stamp the project marker onto a stored study. Idempotent.
    async fn stamp_project(&self, study_id: &str, project_slug: &str) -> anyhow::Result<()>;

    /// Ask the raw store to transmit a study to the anonymisation node.
    async fn send_to_anon(&self, resource_id: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct DicomNodeConfig {
    pub url: url::Url,
    pub username: String,
    pub password: String,
    /// Application entity title of the raw node, the C-MOVE target.
    pub aet: String,
    pub query_timeout: Duration,
}

/// The production [`ArchiveNode`], backed by the node's REST API.
pub struct DicomNode {
    config: DicomNodeConfig,
    client: reqwest::Client,
}

impl DicomNode {
    pub fn new(config: DicomNodeConfig) -> Result<Self, NodeError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { config, client })
    }

    pub async fn heart_beat(&self) -> Result<(), NodeError> {
        self.get("system").await?;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<serde_json::Value, NodeError> {
        let url = self.config.url.join(path).expect("node URL is a valid base");
        let response = self
            .client
            .get(url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await?;
        decode(response).await
    }

    async fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, NodeError> {
        let url = self.config.url.join(path).expect("node URL is a valid base");
        let mut request = self
            .client
            .post(url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        decode(request.send().await?).await
    }
}

async fn decode(response: reqwest::Response) -> Result<serde_json::Value, NodeError> {
    let status = response.status();
    if !status.is_success() {
        return Err(NodeError::Status {
            status,
            body: response.text().await.unwrap_or_default(),
        });
    }
    Ok(response.json().await?)
}

#[async_trait::async_trait]
impl ArchiveNode for DicomNode {
    async fn find_local(&self, query: &StudyQuery) -> anyhow::Result<Vec<String>> {
        let answer = self
            .post("tools/find", &serde_json::to_value(query)?, None)
            .await?;
        let ids = answer
            .as_array()
            .ok_or(NodeError::Shape("find response is not an array"))?
            .iter()
            .filter_map(|id| id.as_str().map(str::to_string))
            .collect();
        Ok(ids)
    }

    async fn query_remote(
        &self,
        modality: &str,
        query: &StudyQuery,
    ) -> anyhow::Result<Option<String>> {
        let response = self
            .post(
                &format!("modalities/{modality}/query"),
                &serde_json::to_value(query)?,
                Some(self.config.query_timeout),
            )
            .await;

        let response = match response {
            Ok(response) => response,
            // The archive not answering in time reads as "no answers".
            Err(NodeError::Http(error)) if error.is_timeout() => {
                tracing::debug!(modality, "remote query timed out; treating as empty");
                return Ok(None);
            }
            Err(error) => return Err(error.into()),
        };

        let query_id = response["ID"]
            .as_str()
            .ok_or(NodeError::Shape("query response has no ID"))?
            .to_string();

        let answers = self.get(&format!("queries/{query_id}/answers")).await?;
        let count = answers.as_array().map_or(0, Vec::len);
        if count > 0 {
            Ok(Some(query_id))
        } else {
            Ok(None)
        }
    }

    async fn retrieve(&self, query_id: &str) -> anyhow::Result<String> {
        let response = self
            .post(
                &format!("queries/{query_id}/retrieve"),
                &json!({ "TargetAet": self.config.aet, "Synchronous": false }),
                None,
            )
            .await?;
        Ok(response["ID"]
            .as_str()
            .ok_or(NodeError::Shape("retrieve response has no ID"))?
            .to_string())
    }

    async fn job_state(&self, job_id: &str) -> anyhow::Result<JobState> {
        let job = self.get(&format!("jobs/{job_id}")).await?;
        let state = job["State"]
            .as_str()
            .ok_or(NodeError::Shape("job has no State"))?;
        Ok(match state {
            "Success" => JobState::Success,
            "Failure" => JobState::Failure,
            _ => JobState::InProgress,
        })
    }

    async fn stamp_project(&self, study_id: &str, project_slug: &str) -> anyhow::Result<()> {
        // Instances cannot be modified through the instance API, so the tag
        // goes on via the studies API. KeepSource=false stops the node from
        // retaining the unstamped copy.
        self.post(
            &format!("studies/{study_id}/modify"),
            &json!({
                "PrivateCreator": PROJECT_NAME_TAG.creator,
                "Permissive": false,
                "KeepSource": false,
                "Replace": { PROJECT_NAME_TAG.nickname: project_slug },
            }),
            None,
        )
        .await?;
        Ok(())
    }

    async fn send_to_anon(&self, resource_id: &str) -> anyhow::Result<()> {
        self.post("send-to-anon", &json!({ "ResourceId": resource_id }), None)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_query_serialisation() {
        let by_uid = serde_json::to_value(StudyQuery::by_uid("1.2.3")).unwrap();
        assert_eq!(
            by_uid,
            json!({"Level": "Study", "Query": {"StudyInstanceUID": "1.2.3"}}),
        );

        let by_ids = serde_json::to_value(StudyQuery::by_identifiers("m", "a")).unwrap();
        assert_eq!(
            by_ids,
            json!({"Level": "Study", "Query": {"AccessionNumber": "a", "PatientID": "m"}}),
        );
    }
}
