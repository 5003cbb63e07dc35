//! Client for the keyed-hash oracle.
//!
//! The hasher service owns the key material (fetched from the vault on its
//! side) and exposes a narrow HTTP surface. Identical inputs yield identical
//! digests across runs, which is what makes pseudonymisation stable. This
//! crate also generates fresh DICOM study UIDs, which need randomness but no
//! key, so they are minted locally.

use std::time::Duration;

use rand::Rng;

/// The Azure DICOM service requires identifiers under 64 characters, which
/// bounds every digest we ask for.
pub const MAX_HASH_LENGTH: u32 = 64;
pub const MIN_HASH_LENGTH: u32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum HasherError {
    #[error("hash length must be within [{MIN_HASH_LENGTH}, {MAX_HASH_LENGTH}], received: {0}")]
    InvalidLength(u32),
    #[error("hasher request failed")]
    Http(#[from] reqwest::Error),
    #[error("hasher returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// A synchronous-in-spirit client: one request, one digest, no state.
#[derive(Debug, Clone)]
pub struct HasherClient {
    base_url: url::Url,
    client: reqwest::Client,
}

impl HasherClient {
    pub fn new(base_url: url::Url, timeout: Duration) -> Result<Self, HasherError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { base_url, client })
    }

    /// Produce a keyed hex digest of `message` for the project, truncated to
    /// `length` characters. Lengths outside [2, 64] are rejected before any
    /// request is made.
    pub async fn hash(
        &self,
        project_slug: &str,
        message: &str,
        length: u32,
    ) -> Result<String, HasherError> {
        if !(MIN_HASH_LENGTH..=MAX_HASH_LENGTH).contains(&length) {
            return Err(HasherError::InvalidLength(length));
        }

        let mut url = self.base_url.join("hash").expect("base URL is a valid base");
        url.query_pairs_mut()
            .append_pair("project_slug", project_slug)
            .append_pair("message", message)
            .append_pair("length", &length.to_string());

        let response = self.client.get(url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(HasherError::Status { status, body });
        }
        tracing::debug!(project_slug, length, "hashed value via oracle");
        Ok(body)
    }

    /// Liveness probe, used by `pixl check-env`.
    pub async fn heart_beat(&self) -> Result<(), HasherError> {
        let url = self
            .base_url
            .join("heart-beat")
            .expect("base URL is a valid base");
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(HasherError::Status {
                status,
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

/// Mint a DICOM-valid study UID under the UUID-derived root: dotted decimal,
/// at most 64 characters, with no leading-zero components.
pub fn new_study_uid() -> String {
    new_study_uid_from(rand::thread_rng().gen())
}

fn new_study_uid_from(entropy: u128) -> String {
    // The decimal rendering of a u128 never carries a leading zero, and
    // "2.25." plus at most 39 digits stays comfortably under 64 characters.
    format!("2.25.{entropy}")
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_hash_length_is_clamped_client_side() {
        let client = HasherClient::new(
            url::Url::parse("http://hasher-api:8000/").unwrap(),
            Duration::from_secs(1),
        )
        .unwrap();

        for length in [0, 1, 65, 1000] {
            let err = client.hash("project", "message", length).await.unwrap_err();
            assert!(matches!(err, HasherError::InvalidLength(l) if l == length), "{err}");
        }
    }

    #[test]
    fn test_study_uid_shape() {
        for _ in 0..100 {
            let uid = new_study_uid();
            assert!(uid.len() <= 64, "{uid}");
            let mut components = uid.split('.');
            assert_eq!(components.next(), Some("2"));
            assert_eq!(components.next(), Some("25"));
            let suffix = components.next().unwrap();
            assert!(components.next().is_none());
            assert!(suffix.chars().all(|c| c.is_ascii_digit()));
            assert!(suffix.len() == 1 || !suffix.starts_with('0'), "{uid}");
        }
    }

    #[test]
    fn test_study_uid_is_deterministic_in_entropy() {
        assert_eq!(new_study_uid_from(0), "2.25.0");
        assert_eq!(new_study_uid_from(u128::MAX).len(), 5 + 39);
        assert_ne!(new_study_uid_from(1), new_study_uid_from(2));
    }
}
