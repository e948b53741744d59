use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;

use crate::providers::{canonical_filename, BackupContext, DestinationProvider, RetentionProvider, BACKUP_FILE_PREFIX};
use crate::store::models::BackupDestination;

#[derive(Debug, Deserialize)]
#[serde(rename = "multistatus")]
struct Multistatus {
    #[serde(rename = "response", default)]
    responses: Vec<DavResponse>,
}

#[derive(Debug, Deserialize)]
struct DavResponse {
    href: String,
    propstat: Propstat,
}

#[derive(Debug, Deserialize)]
struct Propstat {
    prop: Prop,
}

#[derive(Debug, Deserialize, Default)]
struct Prop {
    #[serde(default)]
    displayname: String,
    #[serde(default)]
    getlastmodified: String,
    #[serde(default)]
    resourcetype: ResourceType,
}

#[derive(Debug, Deserialize, Default)]
struct ResourceType {
    collection: Option<()>,
}

pub struct FileInfo {
    pub name: String,
    pub modified: Option<DateTime<Utc>>,
    pub is_dir: bool,
}

/// Shared 60-second-timeout client, used only for uploads (matching the
/// original driver's split between a bare client for PROPFIND/DELETE and a
/// timeout-bound one for PUT).
fn upload_client() -> &'static Client {
    static CLIENT: OnceLock<Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("building webdav upload client")
    })
}

fn base_url(dest: &BackupDestination) -> String {
    dest.webdav_url.trim_end_matches('/').to_string()
}

fn join_path(base: &str, path: &str) -> String {
    format!("{base}/{}", path.trim_start_matches('/'))
}

pub async fn upload_file(dest: &BackupDestination, local_path: &str, remote_path: &str) -> anyhow::Result<()> {
    let bytes = tokio::fs::read(local_path).await?;
    let url = join_path(&base_url(dest), remote_path);
    let resp = upload_client()
        .put(&url)
        .basic_auth(&dest.webdav_username, Some(&dest.webdav_password))
        .body(bytes)
        .send()
        .await?;
    let status = resp.status().as_u16();
    if !matches!(status, 200 | 201 | 204) {
        anyhow::bail!("upload failed with status: {status}");
    }
    Ok(())
}

pub async fn list_files(dest: &BackupDestination, remote_path: &str) -> anyhow::Result<Vec<FileInfo>> {
    let url = join_path(&base_url(dest), remote_path);
    let client = Client::new();
    let resp = client
        .request(reqwest::Method::from_bytes(b"PROPFIND").unwrap(), &url)
        .basic_auth(&dest.webdav_username, Some(&dest.webdav_password))
        .header("Depth", "1")
        .send()
        .await?;
    let status = resp.status().as_u16();
    if !matches!(status, 207 | 200) {
        anyhow::bail!("list failed with status: {status}");
    }
    let body = resp.text().await?;
    let ms: Multistatus = serde_xml_rs::from_str(&body)?;

    let request_path = remote_path.trim_start_matches('/').trim_end_matches('/');
    let mut files = Vec::new();
    for r in ms.responses {
        let href = r.href.trim_end_matches('/');
        if href.is_empty() || href.ends_with(request_path) {
            continue;
        }
        let is_dir = r.propstat.prop.resourcetype.collection.is_some();
        let modified = parse_webdav_time(&r.propstat.prop.getlastmodified);
        let mut name = r.propstat.prop.displayname;
        if name.is_empty() {
            name = href.rsplit('/').next().unwrap_or(href).to_string();
        }
        files.push(FileInfo { name, modified, is_dir });
    }
    Ok(files)
}

pub async fn delete_file(dest: &BackupDestination, remote_path: &str) -> anyhow::Result<()> {
    let url = join_path(&base_url(dest), remote_path);
    let client = Client::new();
    let resp = client
        .delete(&url)
        .basic_auth(&dest.webdav_username, Some(&dest.webdav_password))
        .send()
        .await?;
    let status = resp.status().as_u16();
    if !matches!(status, 200 | 204) {
        anyhow::bail!("delete failed with status: {status}");
    }
    Ok(())
}

fn parse_webdav_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = ["%a, %d %b %Y %H:%M:%S GMT", "%a, %d %b %Y %H:%M:%S %z"];
    for fmt in formats {
        if let Ok(t) = DateTime::parse_from_str(s, fmt) {
            return Some(t.with_timezone(&Utc));
        }
    }
    DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc)).or(None)
}

pub struct WebdavProvider;

#[async_trait]
impl DestinationProvider for WebdavProvider {
    async fn backup(&self, ctx: &BackupContext<'_>) -> anyhow::Result<String> {
        let dest = ctx.destination;
        let filename = canonical_filename(ctx.task_name, ctx.timestamp);
        let remote_path = join_path(dest.webdav_path.trim_end_matches('/'), &filename);
        upload_file(dest, ctx.source_file_path, &remote_path).await?;
        Ok(format!("{}/{}", base_url(dest), remote_path.trim_start_matches('/')))
    }
}

#[async_trait]
impl RetentionProvider for WebdavProvider {
    async fn cleanup(&self, destination: &BackupDestination, max_count: i64) -> anyhow::Result<usize> {
        if max_count <= 0 {
            return Ok(0);
        }
        let files = list_files(destination, &destination.webdav_path).await?;
        let mut candidates: Vec<_> = files
            .into_iter()
            .filter(|f| !f.is_dir && f.name.starts_with(BACKUP_FILE_PREFIX) && f.name.ends_with(".json"))
            .collect();
        if candidates.len() <= max_count as usize {
            return Ok(0);
        }
        candidates.sort_by(|a, b| b.modified.cmp(&a.modified));

        let mut deleted = 0;
        for f in candidates.into_iter().skip(max_count as usize) {
            let remote_path = join_path(destination.webdav_path.trim_end_matches('/'), &f.name);
            if delete_file(destination, &remote_path).await.is_ok() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::{BackupDestination, DestinationKind};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn parses_rfc1123_and_gmt_variants() {
        assert!(parse_webdav_time("Tue, 28 Jul 2026 03:00:00 GMT").is_some());
        assert!(parse_webdav_time("Tue, 28 Jul 2026 03:00:00 +0000").is_some());
        assert!(parse_webdav_time("not a date").is_none());
    }

    #[test]
    fn join_path_avoids_double_slashes() {
        assert_eq!(join_path("https://dav.example.com", "/backups/x.json"), "https://dav.example.com/backups/x.json");
    }

    fn dest(server: &MockServer) -> BackupDestination {
        BackupDestination {
            kind: Some(DestinationKind::Webdav),
            webdav_url: server.uri(),
            webdav_username: "user".to_string(),
            webdav_password: "pass".to_string(),
            webdav_path: "/backups".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn upload_file_accepts_201_created() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/backups/backup_nightly_20260728_030000.json"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("source.json");
        tokio::fs::write(&src, b"{}").await.unwrap();

        let destination = dest(&server);
        upload_file(&destination, src.to_str().unwrap(), "/backups/backup_nightly_20260728_030000.json")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn upload_file_rejects_server_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/backups/x.json"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("source.json");
        tokio::fs::write(&src, b"{}").await.unwrap();

        let destination = dest(&server);
        assert!(upload_file(&destination, src.to_str().unwrap(), "/backups/x.json").await.is_err());
    }

    #[tokio::test]
    async fn list_files_parses_multistatus_and_skips_the_container() {
        let server = MockServer::start().await;
        let body = r#"<?xml version="1.0"?>
<multistatus>
  <response>
    <href>/backups/</href>
    <propstat><prop>
      <displayname>backups</displayname>
      <resourcetype><collection/></resourcetype>
    </prop></propstat>
  </response>
  <response>
    <href>/backups/backup_nightly_20260728_030000.json</href>
    <propstat><prop>
      <displayname>backup_nightly_20260728_030000.json</displayname>
      <getlastmodified>Tue, 28 Jul 2026 03:00:00 GMT</getlastmodified>
    </prop></propstat>
  </response>
</multistatus>"#;
        Mock::given(method("PROPFIND"))
            .and(path("/backups"))
            .respond_with(ResponseTemplate::new(207).set_body_string(body))
            .mount(&server)
            .await;

        let destination = dest(&server);
        let files = list_files(&destination, "/backups").await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "backup_nightly_20260728_030000.json");
        assert!(!files[0].is_dir);
        assert!(files[0].modified.is_some());
    }

    #[tokio::test]
    async fn delete_file_accepts_204_no_content() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/backups/old.json"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let destination = dest(&server);
        delete_file(&destination, "/backups/old.json").await.unwrap();
    }

    #[tokio::test]
    async fn delete_file_rejects_unexpected_status() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/backups/old.json"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let destination = dest(&server);
        assert!(delete_file(&destination, "/backups/old.json").await.is_err());
    }
}
