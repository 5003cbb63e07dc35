//! FTPS delivery over implicit TLS.

use std::io::Cursor;
use std::path::Path;

use exports::ParquetExport;
use suppaftp::native_tls::TlsConnector;
use suppaftp::{NativeTlsConnector, NativeTlsFtpStream};

use crate::secrets::SecretStore;
use crate::sinks::{fetch_secret, sink_error};
use crate::{StudyArchive, UploadError, Uploader};

pub struct FtpsUploader {
    host: String,
    port: u16,
    username: String,
    password: String,
}

impl FtpsUploader {
    pub async fn from_secrets(
        prefix: &str,
        secrets: &dyn SecretStore,
    ) -> Result<Self, UploadError> {
        Ok(Self {
            host: fetch_secret(secrets, prefix, "ftp", "host").await?,
            port: fetch_secret(secrets, prefix, "ftp", "port")
                .await?
                .parse()
                .map_err(|_| UploadError::Rejected("ftp port is not a number".to_string()))?,
            username: fetch_secret(secrets, prefix, "ftp", "username").await?,
            password: fetch_secret(secrets, prefix, "ftp", "password").await?,
        })
    }

    fn connect(&self) -> Result<NativeTlsFtpStream, UploadError> {
        let connector = NativeTlsConnector::from(TlsConnector::new().map_err(sink_error)?);
        let mut ftp = NativeTlsFtpStream::connect_secure_implicit(
            (self.host.as_str(), self.port),
            connector,
            &self.host,
        )
        .map_err(sink_error)?;
        ftp.login(&self.username, &self.password)
            .map_err(sink_error)?;
        Ok(ftp)
    }
}

/// Change into `dir`, creating it when absent.
fn create_and_enter(ftp: &mut NativeTlsFtpStream, dir: &str) -> Result<(), UploadError> {
    if ftp.cwd(dir).is_ok() {
        return Ok(());
    }
    ftp.mkdir(dir).map_err(sink_error)?;
    ftp.cwd(dir).map_err(sink_error)
}

fn enter_path(ftp: &mut NativeTlsFtpStream, path: &Path) -> Result<(), UploadError> {
    for segment in path.iter() {
        create_and_enter(ftp, &segment.to_string_lossy())?;
    }
    Ok(())
}

#[async_trait::async_trait]
impl Uploader for FtpsUploader {
    async fn upload_dicom(&self, study: &StudyArchive) -> Result<(), UploadError> {
        let pseudo_study_uid = study.pseudo_study_uid.clone();
        tracing::info!(%pseudo_study_uid, "starting FTPS upload");
        let uploader = self.clone_config();
        let study = study.clone();

        tokio::task::spawn_blocking(move || -> Result<(), UploadError> {
            let mut ftp = uploader.connect()?;
            create_and_enter(&mut ftp, &study.project_slug)?;
            ftp.put_file(study.file_name(), &mut Cursor::new(&study.zip_bytes))
                .map_err(sink_error)?;
            let _ = ftp.quit();
            Ok(())
        })
        .await
        .map_err(anyhow::Error::from)??;

        tracing::info!(%pseudo_study_uid, "finished FTPS upload");
        Ok(())
    }

    async fn upload_parquet(&self, export: &ParquetExport) -> Result<(), UploadError> {
        let project_slug = export.project_slug.clone();
        tracing::info!(project = %project_slug, "starting FTPS parquet upload");
        let files = export.parquet_files()?;
        let uploader = self.clone_config();
        let export = export.clone();

        tokio::task::spawn_blocking(move || -> Result<(), UploadError> {
            let mut ftp = uploader.connect()?;
            let remote_base = Path::new(&export.project_slug)
                .join(&export.extract_time_slug)
                .join("parquet");

            for relative in files {
                let bytes = std::fs::read(export.current_extract_base.join(&relative))
                    .map_err(sink_error)?;

                // Back to the root, then into the file's directory.
                ftp.cwd("/").map_err(sink_error)?;
                let remote = remote_base.join(&relative);
                let remote_dir = remote.parent().expect("remote path has a parent");
                enter_path(&mut ftp, remote_dir)?;

                let name = remote.file_name().expect("parquet file has a name");
                ftp.put_file(&name.to_string_lossy(), &mut Cursor::new(&bytes))
                    .map_err(sink_error)?;
            }
            let _ = ftp.quit();
            Ok(())
        })
        .await
        .map_err(anyhow::Error::from)??;

        tracing::info!(project = %project_slug, "finished FTPS parquet upload");
        Ok(())
    }
}

impl FtpsUploader {
    fn clone_config(&self) -> Self {
        Self {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}
