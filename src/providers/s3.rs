use async_trait::async_trait;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::Client;

use crate::providers::{canonical_filename, BackupContext, DestinationProvider, RetentionProvider};
use crate::store::models::BackupDestination;

pub struct S3Provider;

async fn build_client(dest: &BackupDestination) -> Client {
    let credentials = Credentials::new(
        &dest.s3_access_key,
        &dest.s3_secret_key,
        None,
        None,
        "vault-backup",
    );
    let shared_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .credentials_provider(credentials)
        .region(aws_sdk_s3::config::Region::new(dest.s3_region.clone()))
        .load()
        .await;

    let mut builder = aws_sdk_s3::config::Builder::from(&shared_config);
    if !dest.s3_endpoint.is_empty() {
        builder = builder.endpoint_url(&dest.s3_endpoint).force_path_style(true);
    }
    Client::from_conf(builder.build())
}

fn remote_prefix(path: &str) -> String {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

#[async_trait]
impl DestinationProvider for S3Provider {
    async fn backup(&self, ctx: &BackupContext<'_>) -> anyhow::Result<String> {
        let dest = ctx.destination;
        let client = build_client(dest).await;
        let body = aws_sdk_s3::primitives::ByteStream::from_path(ctx.source_file_path).await?;
        let filename = canonical_filename(ctx.task_name, ctx.timestamp);
        let key = format!("{}{}", remote_prefix(&dest.s3_path), filename);

        client
            .put_object()
            .bucket(&dest.s3_bucket)
            .key(&key)
            .body(body)
            .send()
            .await?;

        Ok(format!("s3://{}/{}", dest.s3_bucket, key))
    }
}

#[async_trait]
impl RetentionProvider for S3Provider {
    async fn cleanup(&self, destination: &BackupDestination, max_count: i64) -> anyhow::Result<usize> {
        if max_count <= 0 {
            return Ok(0);
        }
        let client = build_client(destination).await;
        let prefix = format!("{}backup_", remote_prefix(&destination.s3_path));

        let listed = client
            .list_objects_v2()
            .bucket(&destination.s3_bucket)
            .prefix(&prefix)
            .send()
            .await?;

        let mut objects: Vec<_> = listed
            .contents()
            .iter()
            .filter(|o| o.key().is_some_and(|k| k.ends_with(".json")))
            .cloned()
            .collect();

        if objects.len() <= max_count as usize {
            return Ok(0);
        }

        // Descending by modtime; an object with no `LastModified` sorts as
        // the newest (an un-dateable object is treated as possibly fresh).
        objects.sort_by(|a, b| match (a.last_modified(), b.last_modified()) {
            (Some(x), Some(y)) => y.as_secs_f64().partial_cmp(&x.as_secs_f64()).unwrap(),
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });

        let to_delete: Vec<_> = objects
            .into_iter()
            .skip(max_count as usize)
            .filter_map(|o| o.key().map(|k| k.to_string()))
            .collect();

        if to_delete.is_empty() {
            return Ok(0);
        }

        let deleted_count = to_delete.len();
        let object_ids: Vec<_> = to_delete
            .into_iter()
            .filter_map(|k| aws_sdk_s3::types::ObjectIdentifier::builder().key(k).build().ok())
            .collect();
        let delete = aws_sdk_s3::types::Delete::builder()
            .set_objects(Some(object_ids))
            .build()?;

        client
            .delete_objects()
            .bucket(&destination.s3_bucket)
            .delete(delete)
            .send()
            .await?;

        Ok(deleted_count)
    }
}
