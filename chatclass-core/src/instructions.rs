//! Versioned instruction text for the session and message classifiers.
//!
//! The version tag is opaque and recorded verbatim as
//! `instructions_version` on every result row.

use crate::config::{InstructionSource, InstructionsConfig};
use crate::types::ClassificationKind;
use crate::{Error, Result};
use reqwest::header::ETAG;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::Duration;

/// Instruction text plus its version tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instructions {
    pub text: String,
    pub version: String,
}

impl Instructions {
    /// Instructions versioned by their own content
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        let version = content_version(&text);
        Self { text, version }
    }
}

/// Supplies instruction text per classifier kind.
pub trait InstructionProvider: Send + Sync {
    fn get_instructions(&self, kind: ClassificationKind) -> Result<Instructions>;
}

/// Create the provider selected by `[instructions] source`.
pub fn create_instruction_provider(
    config: &InstructionsConfig,
) -> Result<Box<dyn InstructionProvider>> {
    match config.source {
        InstructionSource::File => Ok(Box::new(FileInstructionProvider::new(
            config.session_path.clone(),
            config.message_path.clone(),
        ))),
        InstructionSource::Http => Ok(Box::new(HttpInstructionProvider::new(config)?)),
    }
}

/// `sha256:` followed by the first 16 hex chars of the content hash
pub fn content_version(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("sha256:{}", &digest[..16])
}

/// Reads instructions from local files.
pub struct FileInstructionProvider {
    session_path: PathBuf,
    message_path: PathBuf,
}

impl FileInstructionProvider {
    pub fn new(session_path: PathBuf, message_path: PathBuf) -> Self {
        Self {
            session_path,
            message_path,
        }
    }
}

impl InstructionProvider for FileInstructionProvider {
    fn get_instructions(&self, kind: ClassificationKind) -> Result<Instructions> {
        let path = match kind {
            ClassificationKind::Session => &self.session_path,
            ClassificationKind::Message => &self.message_path,
        };
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Instructions(format!(
                "failed to read {} instructions from {}: {}",
                kind,
                path.display(),
                e
            ))
        })?;

        let instructions = Instructions::from_text(text);
        tracing::info!(
            kind = %kind,
            path = %path.display(),
            version = %instructions.version,
            "Loaded instructions"
        );
        Ok(instructions)
    }
}

/// Fetches instructions from a blob container over HTTP.
///
/// The version tag is the blob's ETag when the server sends one.
pub struct HttpInstructionProvider {
    base_url: String,
    session_blob: String,
    message_blob: String,
    sas_token: Option<String>,
    runtime: tokio::runtime::Runtime,
    http: reqwest::Client,
}

impl HttpInstructionProvider {
    pub fn new(config: &InstructionsConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| Error::Config("instructions.base_url is required".to_string()))?
            .trim_end_matches('/')
            .to_string();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Instructions(format!("failed to build tokio runtime: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| Error::Instructions(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url,
            session_blob: config.session_blob.clone(),
            message_blob: config.message_blob.clone(),
            sas_token: config.sas_token.clone(),
            runtime,
            http,
        })
    }

    fn blob_url(&self, blob: &str) -> String {
        let path = blob
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let mut url = format!("{}/{}", self.base_url, path);
        if let Some(token) = self.sas_token.as_deref() {
            url.push('?');
            url.push_str(token.trim_start_matches('?'));
        }
        url
    }
}

impl InstructionProvider for HttpInstructionProvider {
    fn get_instructions(&self, kind: ClassificationKind) -> Result<Instructions> {
        let blob = match kind {
            ClassificationKind::Session => &self.session_blob,
            ClassificationKind::Message => &self.message_blob,
        };
        let url = self.blob_url(blob);

        let (text, etag) = self.runtime.block_on(async {
            let resp =
                self.http.get(&url).send().await.map_err(|e| {
                    Error::Instructions(format!("fetching blob {blob} failed: {e}"))
                })?;
            let status = resp.status();
            let etag = resp
                .headers()
                .get(ETAG)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim_matches('"').to_string());
            let body = resp
                .text()
                .await
                .map_err(|e| Error::Instructions(format!("reading blob {blob} failed: {e}")))?;
            if !status.is_success() {
                return Err(Error::Instructions(format!(
                    "blob {} returned {}",
                    blob,
                    status.as_u16()
                )));
            }
            Ok::<_, Error>((body, etag))
        })?;

        let instructions = match etag {
            Some(version) if !version.is_empty() => Instructions { text, version },
            _ => Instructions::from_text(text),
        };
        tracing::info!(
            kind = %kind,
            blob = %blob,
            version = %instructions.version,
            "Fetched instructions"
        );
        Ok(instructions)
    }
}
