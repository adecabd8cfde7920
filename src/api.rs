use std::error::Error;
use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::debug;
use reqwest::multipart::{Form, Part};
use serde_json::Value;

use crate::config::Config;
use crate::filesystem::LevelEntry;

pub type ApiResult = Result<(u16, String), Box<dyn Error>>;

/// HTTP client for the controller. Every request carries the install uuid
/// and key; the connection is not reused between calls.
pub struct Api {
    client: reqwest::Client,
    base: String,
    uuid: String,
    key: String,
}

fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    // writing to a Vec cannot fail
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

impl Api {
    pub fn new(config: &Config, key: &str) -> Api {
        let scheme = if config.https { "https" } else { "http" };
        Api {
            client: reqwest::Client::new(),
            base: format!("{}://{}:{}/api", scheme, config.host, config.port),
            uuid: config.uuid.clone(),
            key: key.to_string(),
        }
    }

    fn base_params(&self) -> Vec<(String, String)> {
        vec![
            ("uuid".to_string(), self.uuid.clone()),
            ("key".to_string(), self.key.clone()),
        ]
    }

    async fn get(&self, path: &str, extra: Vec<(String, String)>) -> ApiResult {
        let url = format!("{}/{}/", self.base, path);
        let mut params = self.base_params();
        params.extend(extra);
        debug!("GET {}", url);
        let response = self.client.get(&url).query(&params).send().await?;
        let status = response.status().as_u16();
        Ok((status, response.text().await?))
    }

    async fn post(&self, path: &str, extra: Vec<(String, String)>) -> ApiResult {
        let url = format!("{}/{}/", self.base, path);
        let mut params = self.base_params();
        params.extend(extra);
        debug!("POST {}", url);
        let response = self.client.post(&url).form(&params).send().await?;
        let status = response.status().as_u16();
        Ok((status, response.text().await?))
    }

    /// multipart/form-data POST for endpoints taking a compressed blob.
    async fn post_file(
        &self,
        path: &str,
        extra: Vec<(String, String)>,
        field: &str,
        bytes: Vec<u8>,
    ) -> ApiResult {
        let url = format!("{}/{}/", self.base, path);
        let mut form = Form::new();
        for (k, v) in self.base_params().into_iter().chain(extra) {
            form = form.text(k, v);
        }
        form = form.part(
            field.to_string(),
            Part::bytes(bytes).file_name(field.to_string()),
        );
        debug!("POST {} (multipart)", url);
        let response = self.client.post(&url).multipart(form).send().await?;
        let status = response.status().as_u16();
        Ok((status, response.text().await?))
    }

    fn json(result: ApiResult) -> Result<(u16, Value), Box<dyn Error>> {
        let (status, body) = result?;
        let value = if status == 200 && !body.is_empty() {
            serde_json::from_str(&body)?
        } else {
            Value::Null
        };
        Ok((status, value))
    }

    pub async fn hi(&self, host: &str, uname: &str, version: &str) -> ApiResult {
        self.post(
            "hi",
            vec![
                ("host".to_string(), host.to_string()),
                ("uname".to_string(), uname.to_string()),
                ("v".to_string(), version.to_string()),
            ],
        )
        .await
    }

    /// Ships one level of the filesystem walk. `action` is `set`, `start`
    /// or `append`; `wait_more` tells the server another slice follows.
    pub async fn update_fs(
        &self,
        levels: &[LevelEntry],
        action: &str,
        wait_more: bool,
    ) -> Result<u16, Box<dyn Error>> {
        let payload = serde_json::to_vec(levels)?;
        let (status, _) = self
            .post_file(
                &format!("fs/{}", action),
                vec![("wait_more".to_string(), (wait_more as i32).to_string())],
                "levels",
                deflate(&payload),
            )
            .await?;
        Ok(status)
    }

    pub async fn upload_log(&self, entries: &[String]) -> Result<u16, Box<dyn Error>> {
        let (status, _) = if entries.len() > 1 {
            self.post_file(
                "log",
                Vec::new(),
                "entries",
                deflate(entries.join(";").as_bytes()),
            )
            .await?
        } else {
            self.post(
                "log",
                vec![(
                    "entries".to_string(),
                    entries.first().cloned().unwrap_or_default(),
                )],
            )
            .await?
        };
        Ok(status)
    }

    pub async fn get_schedules(&self) -> Result<(u16, Value), Box<dyn Error>> {
        Api::json(self.get("get/schedules", Vec::new()).await)
    }

    pub async fn get_changes(&self) -> Result<(u16, Value), Box<dyn Error>> {
        Api::json(self.get("changes", Vec::new()).await)
    }

    pub async fn get_s3_access(&self) -> Result<(u16, Value), Box<dyn Error>> {
        Api::json(self.get("get/access", Vec::new()).await)
    }

    pub async fn backup_prepare(
        &self,
        time: i64,
        schedule_id: i64,
    ) -> Result<Option<i64>, Box<dyn Error>> {
        let (status, body) = self
            .post(
                "backup/prepare",
                vec![
                    ("time".to_string(), time.to_string()),
                    ("schedule".to_string(), schedule_id.to_string()),
                ],
            )
            .await?;
        if status == 200 {
            Ok(Some(body.trim().parse()?))
        } else {
            Ok(None)
        }
    }

    pub async fn backup_filesystem(
        &self,
        backup_id: i64,
        has_info: bool,
    ) -> Result<Option<Value>, Box<dyn Error>> {
        let (status, body) = self
            .post(
                "backup/filesystem",
                vec![
                    ("id".to_string(), backup_id.to_string()),
                    ("has_info".to_string(), (has_info as i32).to_string()),
                ],
            )
            .await?;
        if status == 200 {
            Ok(Some(serde_json::from_str(&body)?))
        } else {
            Ok(None)
        }
    }

    pub async fn backup_database(&self, backup_id: i64) -> Result<u16, Box<dyn Error>> {
        let (status, _) = self
            .post(
                "backup/database",
                vec![("id".to_string(), backup_id.to_string())],
            )
            .await?;
        Ok(status)
    }

    pub async fn backup_complete(
        &self,
        backup_id: i64,
        time: i64,
        size: u64,
    ) -> Result<u16, Box<dyn Error>> {
        let (status, _) = self
            .post(
                "backup/complete",
                vec![
                    ("id".to_string(), backup_id.to_string()),
                    ("time".to_string(), time.to_string()),
                    ("size".to_string(), size.to_string()),
                ],
            )
            .await?;
        Ok(status)
    }

    /// Progress statistics for a running backup, flushed periodically.
    pub async fn upload_files_info(
        &self,
        backup_id: i64,
        files_count: u64,
        size: u64,
    ) -> Result<u16, Box<dyn Error>> {
        let (status, _) = self
            .post(
                &format!("backup/{}/files", backup_id),
                vec![
                    ("count".to_string(), files_count.to_string()),
                    ("size".to_string(), size.to_string()),
                ],
            )
            .await?;
        Ok(status)
    }

    pub async fn get_files_info(&self, backup_id: i64) -> Result<(u16, Value), Box<dyn Error>> {
        Api::json(
            self.get(&format!("backup/{}/files", backup_id), Vec::new())
                .await,
        )
    }

    pub async fn set_databases(&self, databases: &Value) -> Result<u16, Box<dyn Error>> {
        let (status, _) = self
            .post(
                "databases",
                vec![("db".to_string(), serde_json::to_string(databases)?)],
            )
            .await?;
        Ok(status)
    }

    pub async fn get_db_credentials(&self) -> Result<(u16, Value), Box<dyn Error>> {
        Api::json(self.get("get/db", Vec::new()).await)
    }

    pub async fn report_crash(&self, info: &[u8], when: i64) -> Result<u16, Box<dyn Error>> {
        let (status, _) = self
            .post_file(
                "crash",
                vec![("time".to_string(), when.to_string())],
                "info",
                deflate(info),
            )
            .await?;
        Ok(status)
    }

    pub async fn check_restore(&self) -> Result<(u16, Value), Box<dyn Error>> {
        Api::json(self.get("get/restore", Vec::new()).await)
    }

    pub async fn restore_complete(&self, tasks: &[i64]) -> Result<u16, Box<dyn Error>> {
        let joined = tasks
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let (status, _) = self
            .post("backup/restore_complete", vec![("tasks".to_string(), joined)])
            .await?;
        Ok(status)
    }

    pub async fn check_version(&self, version: &str) -> ApiResult {
        self.post("version", vec![("v".to_string(), version.to_string())])
            .await
    }

    pub async fn get_version(&self) -> Result<(u16, Value), Box<dyn Error>> {
        Api::json(self.get("version/current", Vec::new()).await)
    }

    pub async fn emergency(&self) -> Result<(u16, Value), Box<dyn Error>> {
        Api::json(self.get("emergency", Vec::new()).await)
    }

    /// Plain download of an absolute URL, e.g. an update package.
    pub async fn download(&self, url: &str) -> Result<Vec<u8>, Box<dyn Error>> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(format!("download of {} returned {}", url, response.status()).into());
        }
        Ok(response.bytes().await?.to_vec())
    }
}
