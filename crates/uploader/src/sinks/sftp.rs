//! SFTP delivery with host-key pinning.

use std::io::Write;
use std::net::TcpStream;
use std::path::{Path, PathBuf};

use exports::ParquetExport;
use ssh2::{CheckResult, KnownHostFileKind, Session};

use crate::secrets::SecretStore;
use crate::sinks::{fetch_secret, sink_error};
use crate::{StudyArchive, UploadError, Uploader};

#[derive(Clone)]
pub struct SftpUploader {
    host: String,
    port: u16,
    username: String,
    password: String,
    /// OpenSSH known-hosts file the server's key must match.
    known_hosts_path: PathBuf,
}

impl SftpUploader {
    pub async fn from_secrets(
        prefix: &str,
        secrets: &dyn SecretStore,
    ) -> Result<Self, UploadError> {
        Ok(Self {
            host: fetch_secret(secrets, prefix, "sftp", "host").await?,
            port: fetch_secret(secrets, prefix, "sftp", "port")
                .await?
                .parse()
                .map_err(|_| UploadError::Rejected("sftp port is not a number".to_string()))?,
            username: fetch_secret(secrets, prefix, "sftp", "username").await?,
            password: fetch_secret(secrets, prefix, "sftp", "password").await?,
            known_hosts_path: fetch_secret(secrets, prefix, "sftp", "known-hosts-path")
                .await?
                .into(),
        })
    }

    fn connect(&self) -> Result<(Session, ssh2::Sftp), UploadError> {
        let tcp = TcpStream::connect((self.host.as_str(), self.port)).map_err(sink_error)?;
        let mut session = Session::new().map_err(sink_error)?;
        session.set_tcp_stream(tcp);
        session.handshake().map_err(sink_error)?;

        // Reject-by-default host key policy: anything not pinned in the
        // known-hosts file terminates the connection.
        let mut known_hosts = session.known_hosts().map_err(sink_error)?;
        known_hosts
            .read_file(&self.known_hosts_path, KnownHostFileKind::OpenSSH)
            .map_err(sink_error)?;
        let (key, _key_type) = session
            .host_key()
            .ok_or_else(|| UploadError::Rejected("server offered no host key".to_string()))?;
        match known_hosts.check_port(&self.host, self.port, key) {
            CheckResult::Match => {}
            CheckResult::Mismatch => {
                return Err(UploadError::Rejected(
                    "server host key does not match the pinned key".to_string(),
                ));
            }
            CheckResult::NotFound | CheckResult::Failure => {
                return Err(UploadError::Rejected(format!(
                    "no pinned host key for {}:{}",
                    self.host, self.port,
                )));
            }
        }

        session
            .userauth_password(&self.username, &self.password)
            .map_err(sink_error)?;
        let sftp = session.sftp().map_err(sink_error)?;
        Ok((session, sftp))
    }
}

/// `mkdir -p` on the remote side.
fn create_remote_dirs(sftp: &ssh2::Sftp, directory: &Path) -> Result<(), UploadError> {
    let mut current = PathBuf::new();
    for segment in directory.iter() {
        current.push(segment);
        if sftp.stat(&current).is_err() {
            sftp.mkdir(&current, 0o755).map_err(sink_error)?;
        }
    }
    Ok(())
}

fn write_remote_file(sftp: &ssh2::Sftp, path: &Path, bytes: &[u8]) -> Result<(), UploadError> {
    let mut remote = sftp.create(path).map_err(sink_error)?;
    remote.write_all(bytes).map_err(sink_error)?;
    Ok(())
}

#[async_trait::async_trait]
impl Uploader for SftpUploader {
    async fn upload_dicom(&self, study: &StudyArchive) -> Result<(), UploadError> {
        let pseudo_study_uid = study.pseudo_study_uid.clone();
        tracing::info!(%pseudo_study_uid, "starting SFTP upload");
        let uploader = self.clone();
        let study = study.clone();

        tokio::task::spawn_blocking(move || -> Result<(), UploadError> {
            let (_session, sftp) = uploader.connect()?;
            let directory = Path::new(&study.project_slug);
            create_remote_dirs(&sftp, directory)?;
            write_remote_file(&sftp, &directory.join(study.file_name()), &study.zip_bytes)
        })
        .await
        .map_err(anyhow::Error::from)??;

        tracing::info!(%pseudo_study_uid, "finished SFTP upload");
        Ok(())
    }

    async fn upload_parquet(&self, export: &ParquetExport) -> Result<(), UploadError> {
        let project_slug = export.project_slug.clone();
        tracing::info!(project = %project_slug, "starting SFTP parquet upload");
        let files = export.parquet_files()?;
        let uploader = self.clone();
        let export = export.clone();

        tokio::task::spawn_blocking(move || -> Result<(), UploadError> {
            let (_session, sftp) = uploader.connect()?;
            let remote_base = Path::new(&export.project_slug)
                .join(&export.extract_time_slug)
                .join("parquet");

            for relative in files {
                let bytes = std::fs::read(export.current_extract_base.join(&relative))
                    .map_err(sink_error)?;
                let remote = remote_base.join(&relative);
                create_remote_dirs(&sftp, remote.parent().expect("remote path has a parent"))?;
                write_remote_file(&sftp, &remote, &bytes)?;
            }
            Ok(())
        })
        .await
        .map_err(anyhow::Error::from)??;

        tracing::info!(project = %project_slug, "finished SFTP parquet upload");
        Ok(())
    }
}
