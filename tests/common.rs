#![allow(dead_code)]

use std::error::Error;
use std::path::PathBuf;
use std::{env, fs};

use rand::distributions::Alphanumeric;
use rand::Rng;
use rusoto_core::Region;
use rusoto_s3::{CreateBucketRequest, GetObjectRequest, S3Client, S3};
use tokio::io::AsyncReadExt;

pub const ACCESS_KEY: &str = "minio";
pub const SECRET_KEY: &str = "minio1234";
pub const ENDPOINT: &str = "http://127.0.0.1:9000";

pub fn log_init(module_name: &str) {
    env::set_var("RUST_LOG", format!("{},bitcalm", module_name));
    env::set_var("RUST_LOG_STYLE", "always");
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn generate_unique_name() -> String {
    let mut rng = rand::thread_rng();
    let data = String::from_utf8(
        std::iter::repeat(())
            .map(|()| rng.sample(Alphanumeric))
            .take(20)
            .collect(),
    )
    .unwrap();
    format!("test-{}", data).to_lowercase()
}

/// Fresh scratch directory under the system temp dir, named uniquely so
/// parallel tests never collide.
pub fn scratch_dir() -> PathBuf {
    let dir = env::temp_dir().join(generate_unique_name());
    fs::create_dir_all(&dir).unwrap();
    dir
}

#[macro_export]
macro_rules! execute_in_docker {
    ($closure:tt) =>  {
        {
            use images::generic::WaitFor;
            use testcontainers::*;
            use std::env;
            let docker = clients::Cli::default();
            let image = images::generic::GenericImage::new(format!("{}:{}", "minio/minio", "latest"))
                .with_mapped_port((9000, 9000))
                .with_env_var("MINIO_ACCESS_KEY", ACCESS_KEY)
                .with_env_var("MINIO_SECRET_KEY", SECRET_KEY)
                .with_wait_for(WaitFor::LogMessage {
                    message: "Browser Access:".to_string(),
                    stream: images::generic::Stream::StdOut,
                })
                .with_args(vec!["server".to_string(), "/data".to_string()]);
            env::set_var("AWS_ACCESS_KEY_ID", ACCESS_KEY);
            env::set_var("AWS_SECRET_ACCESS_KEY", SECRET_KEY);
            env::set_var("S3_ENDPOINT_URL", ENDPOINT);
            let container = docker.run(image);
            let result = $closure().await;
            container.stop();
            result
        }
    };
}

pub fn minio_region() -> Region {
    Region::Custom {
        name: "us-east-1".to_owned(),
        endpoint: ENDPOINT.to_string(),
    }
}

pub async fn create_client(bucket: &str) -> Result<S3Client, Box<dyn Error>> {
    let client = S3Client::new(minio_region());
    client
        .create_bucket(CreateBucketRequest {
            bucket: bucket.to_string(),
            ..Default::default()
        })
        .await?;
    Ok(client)
}

pub async fn download_file(
    bucket: &str,
    key: &str,
    client: &S3Client,
) -> Result<Vec<u8>, Box<dyn Error>> {
    let request = client
        .get_object(GetObjectRequest {
            bucket: bucket.to_string(),
            key: key.to_string(),
            ..Default::default()
        })
        .await?;
    let mut stream = request.body.unwrap().into_async_read();
    let mut buffer = Vec::new();
    stream.read_to_end(&mut buffer).await?;
    Ok(buffer)
}
