use std::error::Error;
use std::io::Read;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::{convert::TryInto, env, fmt, time};

use async_channel::{Receiver, Sender};
use futures::future;
use log::{debug, error, warn};
use md5::Digest;
use rusoto_core::{credential::StaticProvider, ByteStream, HttpClient, Region};
use rusoto_s3::{
    CreateMultipartUploadRequest, GetObjectRequest, ListObjectsV2Request, PutObjectRequest,
    S3Client, S3,
};
use sha2::Sha384;
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;

use crate::status::S3Access;

/// Files up to this size go up in one request; larger ones in parts of this
/// size.
pub const PART_SIZE: usize = 32 * 1024 * 1024;
pub const RETRIES: u64 = 3;
pub const RETRY_PAUSE: time::Duration = time::Duration::from_secs(60);
const SSE: &str = "AES256";

#[derive(Debug)]
pub struct S3UploadFailedError(String, String);
impl fmt::Display for S3UploadFailedError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "S3 upload operation {} failed with error: {}",
            self.0, self.1
        )
    }
}
impl Error for S3UploadFailedError {}

macro_rules! _wrapper {
    ($f:expr, $( $args:expr $(,)? )* ) => {{
        $f( $($args,)* )
    }};
}

macro_rules! retry {
    ($( $args:expr$(,)? )+) => {{
        let mut attempt: u64 = 1;
        loop {
            let res = _wrapper!($( $args, )*).await;
            if res.is_ok() {
                break res;
            }
            if attempt < RETRIES {
                warn!("task failed, retrying... attempt {}: {}", attempt, res.unwrap_err());
                std::thread::sleep(RETRY_PAUSE);
                attempt += 1;
                continue;
            }
            warn!("task failed, ran out of retry attempts");
            break res;
        }
    }};
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Object key of a backed-up file: the last segment is the SHA-384 of its
/// absolute path, so arbitrary path bytes never leak into key syntax.
pub fn file_key(user: &str, backup_id: i64, path: &str) -> String {
    format!(
        "{}/backup_{}/filesystem/{}",
        user,
        backup_id,
        hex(&Sha384::digest(path.as_bytes()))
    )
}

pub fn db_key(user: &str, backup_id: i64, basename: &str) -> String {
    format!("{}/backup_{}/databases/{}", user, backup_id, basename)
}

pub fn db_prefix(user: &str, backup_id: i64) -> String {
    format!("{}/backup_{}/databases/", user, backup_id)
}

pub fn catalog_key(user: &str, backup_id: i64, basename: &str) -> String {
    format!("{}/backup_{}/{}", user, backup_id, basename)
}

/// Key layout of the first agent generation. Recognized when restoring old
/// manifests, never produced by new writes.
pub fn legacy_key(user: &str, path: &str) -> String {
    format!("{}{}.gz", user, path)
}

#[derive(Clone)]
struct UploadContext {
    client: S3Client,
    bucket: String,
    key: String,
    upload_id: String,
    data_sent: Arc<AtomicUsize>,
}

impl UploadContext {
    fn get_bytes_sent(&self) -> usize {
        self.data_sent.load(Ordering::SeqCst)
    }
}

/// Stateless-per-call S3 wrapper bound to one bucket. Every upload requests
/// server-side encryption.
pub struct S3Store {
    client: S3Client,
    bucket: String,
}

impl S3Store {
    pub fn new(access: &S3Access) -> Result<S3Store, Box<dyn Error>> {
        let region = match env::var("S3_ENDPOINT_URL") {
            Ok(endpoint) => Region::Custom {
                name: "us-east-1".to_owned(),
                endpoint,
            },
            Err(_) => Region::default(),
        };
        let creds =
            StaticProvider::new_minimal(access.key_id.clone(), access.secret_key.clone());
        let client = S3Client::new_with(HttpClient::new()?, creds, region);
        Ok(S3Store {
            client,
            bucket: access.bucket.clone(),
        })
    }

    pub fn with_client(client: S3Client, bucket: &str) -> S3Store {
        S3Store {
            client,
            bucket: bucket.to_string(),
        }
    }

    /// Single-request upload for small bodies.
    pub async fn put(&self, key: &str, body: Vec<u8>) -> Result<u64, Box<dyn Error>> {
        let size = body.len() as u64;
        let r: Result<(), Box<dyn Error>> = retry!(
            |client: S3Client, bucket: String, key: String, body: Vec<u8>| async move {
                client
                    .put_object(PutObjectRequest {
                        bucket,
                        key,
                        body: Some(ByteStream::from(body)),
                        server_side_encryption: Some(SSE.to_string()),
                        ..Default::default()
                    })
                    .await?;
                Ok(())
            },
            self.client.clone(),
            self.bucket.clone(),
            key.to_string(),
            body.clone()
        );
        r?;
        Ok(size)
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>, Box<dyn Error>> {
        let r: Result<Vec<u8>, Box<dyn Error>> = retry!(
            |client: S3Client, bucket: String, key: String| async move {
                let output = client
                    .get_object(GetObjectRequest {
                        bucket,
                        key,
                        ..Default::default()
                    })
                    .await?;
                let body = output
                    .body
                    .ok_or_else(|| S3UploadFailedError("get".to_string(), "empty body".to_string()))?;
                let mut buffer = Vec::new();
                body.into_async_read().read_to_end(&mut buffer).await?;
                Ok(buffer)
            },
            self.client.clone(),
            self.bucket.clone(),
            key.to_string()
        );
        r
    }

    /// All keys under a prefix, following continuation markers.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, Box<dyn Error>> {
        let mut scan = true;
        let mut continuation_token: Option<String> = None;
        let mut result = Vec::new();
        while scan {
            let response = self
                .client
                .list_objects_v2(ListObjectsV2Request {
                    bucket: self.bucket.clone(),
                    prefix: Some(prefix.to_string()),
                    continuation_token: continuation_token.take(),
                    ..Default::default()
                })
                .await?;
            continuation_token = response.next_continuation_token;
            scan = response.is_truncated.unwrap_or(false) && continuation_token.is_some();
            for entry in response.contents.unwrap_or_default() {
                if let Some(key) = entry.key {
                    result.push(key);
                }
            }
        }
        Ok(result)
    }

    /// Multipart upload reading fixed-size parts from `source` until EOF.
    /// The session is aborted when any part runs out of retries.
    pub async fn put_stream(
        &self,
        key: &str,
        source: Box<dyn Read + Send>,
    ) -> Result<u64, Box<dyn Error>> {
        let upload_id: Result<String, Box<dyn Error>> = retry!(
            |client: S3Client, bucket: String, key: String| async move {
                let upload_id = client
                    .create_multipart_upload(CreateMultipartUploadRequest {
                        bucket,
                        key,
                        server_side_encryption: Some(SSE.to_string()),
                        ..Default::default()
                    })
                    .await
                    .map(|output| output.upload_id.unwrap())?;
                Ok(upload_id)
            },
            self.client.clone(),
            self.bucket.clone(),
            key.to_string()
        );
        let upload_context = UploadContext {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: key.to_string(),
            upload_id: upload_id?,
            data_sent: Arc::new(AtomicUsize::new(0)),
        };

        match send_parts(upload_context.clone(), source).await {
            Ok(completed_parts) => {
                debug!(
                    "  completing file s3://{}/{}",
                    &upload_context.bucket, &upload_context.key
                );
                let r: Result<(), Box<dyn Error>> = retry!(
                    |upload_context: UploadContext,
                     completed_parts: Vec<rusoto_s3::CompletedPart>| async move {
                        upload_context
                            .client
                            .complete_multipart_upload(rusoto_s3::CompleteMultipartUploadRequest {
                                bucket: upload_context.bucket.clone(),
                                key: upload_context.key.clone(),
                                upload_id: upload_context.upload_id.clone(),
                                multipart_upload: Some(rusoto_s3::CompletedMultipartUpload {
                                    parts: Some(completed_parts.clone()),
                                }),
                                ..Default::default()
                            })
                            .await?;
                        Ok(())
                    },
                    upload_context.clone(),
                    completed_parts.clone()
                );
                r?;
                Ok(upload_context.get_bytes_sent().try_into()?)
            }
            Err(original_err) => {
                warn!(
                    "  aborting multipart upload s3://{}/{}",
                    &self.bucket, key
                );
                let r: Result<(), Box<dyn Error>> = retry!(
                    |upload_context: UploadContext| async move {
                        upload_context
                            .client
                            .abort_multipart_upload(rusoto_s3::AbortMultipartUploadRequest {
                                bucket: upload_context.bucket.clone(),
                                key: upload_context.key.clone(),
                                upload_id: upload_context.upload_id.clone(),
                                ..Default::default()
                            })
                            .await?;
                        Ok(())
                    },
                    upload_context.clone()
                );
                if let Err(err) = r {
                    error!(
                        "error during multipart upload, in addition abort_multipart_upload also failed: {}",
                        err.to_string()
                    );
                }
                Err(original_err)
            }
        }
    }
}

async fn send_parts(
    upload_context: UploadContext,
    mut source: Box<dyn Read + Send>,
) -> Result<Vec<rusoto_s3::CompletedPart>, Box<dyn Error>> {
    type BufferChannel = (i64, Vec<u8>);
    type CompletedPartChannel = Result<rusoto_s3::CompletedPart, String>;

    let (tx_buffer, rx_buffer): (Sender<BufferChannel>, Receiver<BufferChannel>) =
        async_channel::bounded(2);
    let (tx_completedpart, rx_completedpart): (
        Sender<CompletedPartChannel>,
        Receiver<CompletedPartChannel>,
    ) = async_channel::unbounded();
    let mut completed_parts: Vec<rusoto_s3::CompletedPart> = Vec::new();

    let senders: Vec<JoinHandle<Result<(), String>>> = (0..num_cpus::get())
        .map(|sender_thread| {
            let rx_channel = rx_buffer.clone();
            let tx_completedpart_channel = tx_completedpart.clone();
            let upload_context = upload_context.clone();
            tokio::spawn(async move {
                while let Ok((part_count, buffer)) = rx_channel.recv().await {
                    let content_md5 = base64::encode(md5::Md5::digest(&buffer));
                    let buffer_size: usize = buffer.len();

                    let completed_part = retry!(
                        |upload_context: UploadContext,
                         buffer: Vec<u8>,
                         content_md5: String| async move {
                            debug!(
                                "  sender: start part {} of s3://{}/{} - thread {}",
                                part_count,
                                upload_context.bucket,
                                upload_context.key,
                                sender_thread
                            );
                            let e_tag = upload_context
                                .client
                                .upload_part(rusoto_s3::UploadPartRequest {
                                    bucket: upload_context.bucket.to_string(),
                                    key: upload_context.key.to_string(),
                                    upload_id: upload_context.upload_id.to_string(),
                                    body: Some(ByteStream::from(buffer)),
                                    content_length: Some(buffer_size.try_into().unwrap()),
                                    content_md5: Some(content_md5),
                                    part_number: part_count,
                                    ..Default::default()
                                })
                                .await
                                .map(|x| x.e_tag.unwrap());
                            debug!(
                                "  sender: completed part {} of s3://{}/{} - thread {}",
                                part_count,
                                &upload_context.bucket,
                                &upload_context.key,
                                sender_thread
                            );
                            upload_context
                                .data_sent
                                .fetch_add(buffer_size, Ordering::SeqCst);
                            Ok(rusoto_s3::CompletedPart {
                                e_tag: Some(e_tag.map_err(|x| x.to_string())?),
                                part_number: Some(part_count),
                            })
                        },
                        upload_context.clone(),
                        buffer.clone(),
                        content_md5.clone()
                    );
                    tx_completedpart_channel
                        .send(completed_part)
                        .await
                        .map_err(|x| x.to_string())?;
                }
                Ok(())
            })
        })
        .collect();
    drop(tx_completedpart);

    {
        let mut part_count: i64 = 0;
        let source_ref = &mut source;
        loop {
            part_count += 1;
            let (buffer, bytes_read) = {
                let mut b = Vec::with_capacity(PART_SIZE);
                let bytes_read = source_ref
                    .take(PART_SIZE.try_into().unwrap())
                    .read_to_end(&mut b)?;
                (b, bytes_read)
            };
            while let Ok(result) = rx_completedpart.try_recv() {
                // exit early if a sender already failed
                completed_parts.push(result.map_err(|e| {
                    S3UploadFailedError("uploadparts".to_string(), e)
                })?);
            }
            if bytes_read > 0 {
                tx_buffer.send((part_count, buffer)).await?;
            } else {
                debug!("end of stream reached");
                break;
            }
        }
    }
    drop(tx_buffer);

    for sender in future::join_all(senders).await {
        let sender = sender?;
        sender.map_err(|e| S3UploadFailedError("uploadparts".to_string(), e))?;
    }

    let completed_parts = {
        while let Ok(result) = rx_completedpart.recv().await {
            completed_parts
                .push(result.map_err(|e| S3UploadFailedError("uploadparts".to_string(), e))?);
        }
        completed_parts.sort_by(|a, b| a.part_number.partial_cmp(&b.part_number).unwrap());
        completed_parts
    };
    Ok(completed_parts)
}
