use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use std::sync::Arc;

use super::{ByteRange, ByteStream, ObjectMeta, ObjectStore, ObjectStoreError};

const STORAGE_API: &str = "https://storage.googleapis.com/storage/v1";
const UPLOAD_API: &str = "https://storage.googleapis.com/upload/storage/v1";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Refresh the access token this long before it expires.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

/// Google Cloud Storage object store backend. Cloning shares the client and token.
#[derive(Clone)]
pub struct GcsStore {
    inner: Arc<GcsInner>,
}

struct GcsInner {
    bucket: String,
    client: Client,
    token: tokio::sync::RwLock<AccessToken>,
    credentials_file: Option<String>,
}

struct AccessToken {
    value: String,
    expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    token_uri: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

#[derive(Deserialize)]
struct ObjectResource {
    name: String,
    /// GCS reports sizes as decimal strings
    size: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    items: Vec<ObjectResource>,
    next_page_token: Option<String>,
}

impl GcsStore {
    pub async fn new(bucket: &str, credentials_file: Option<&str>) -> Result<Self, anyhow::Error> {
        let client = Client::builder().build()?;

        let store = Self {
            inner: Arc::new(GcsInner {
                bucket: bucket.to_string(),
                client,
                token: tokio::sync::RwLock::new(AccessToken {
                    value: String::new(),
                    expires_at: DateTime::<Utc>::MIN_UTC,
                }),
                credentials_file: credentials_file.map(|s| s.to_string()),
            }),
        };

        store.refresh_token().await?;
        Ok(store)
    }

    async fn refresh_token(&self) -> Result<(), anyhow::Error> {
        let resp = if let Some(ref creds_path) = self.inner.credentials_file {
            self.token_from_service_account(creds_path).await?
        } else {
            self.token_from_metadata_server().await?
        };

        let mut lock = self.inner.token.write().await;
        *lock = AccessToken {
            value: resp.access_token,
            expires_at: Utc::now() + Duration::seconds(resp.expires_in),
        };
        tracing::debug!(expires_at = %lock.expires_at, "Refreshed GCS access token");
        Ok(())
    }

    /// Current bearer token, refreshed when close to expiry.
    async fn bearer(&self) -> Result<String, ObjectStoreError> {
        {
            let token = self.inner.token.read().await;
            if token.expires_at - Utc::now() > Duration::seconds(TOKEN_REFRESH_MARGIN_SECS) {
                return Ok(token.value.clone());
            }
        }
        self.refresh_token()
            .await
            .map_err(|e| ObjectStoreError::Backend(format!("GCS token refresh failed: {e}")))?;
        Ok(self.inner.token.read().await.value.clone())
    }

    async fn token_from_service_account(&self, path: &str) -> Result<TokenResponse, anyhow::Error> {
        let key_json = tokio::fs::read_to_string(path).await?;
        let key: ServiceAccountKey = serde_json::from_str(&key_json)?;

        let now = Utc::now().timestamp();
        let claims = serde_json::json!({
            "iss": key.client_email,
            "scope": "https://www.googleapis.com/auth/devstorage.read_write",
            "aud": key.token_uri,
            "iat": now,
            "exp": now + 3600,
        });

        let header = base64_url_encode(&serde_json::to_vec(&serde_json::json!({
            "alg": "RS256",
            "typ": "JWT"
        }))?);
        let payload = base64_url_encode(&serde_json::to_vec(&claims)?);
        let unsigned = format!("{header}.{payload}");

        let signature = sign_rs256(unsigned.as_bytes(), &key.private_key)?;
        let jwt = format!("{unsigned}.{}", base64_url_encode(&signature));

        let resp: TokenResponse = self
            .inner
            .client
            .post(&key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", &jwt),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(resp)
    }

    async fn token_from_metadata_server(&self) -> Result<TokenResponse, anyhow::Error> {
        let resp: TokenResponse = self
            .inner
            .client
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(resp)
    }

    fn upload_url(&self, key: &str) -> String {
        format!(
            "{UPLOAD_API}/b/{}/o?uploadType=media&name={}",
            self.inner.bucket,
            encode_object_name(key)
        )
    }

    fn object_url(&self, key: &str) -> String {
        format!("{STORAGE_API}/b/{}/o/{}", self.inner.bucket, encode_object_name(key))
    }

    fn media_url(&self, key: &str) -> String {
        format!("{}?alt=media", self.object_url(key))
    }

    fn list_url(&self) -> String {
        format!("{STORAGE_API}/b/{}/o", self.inner.bucket)
    }

    async fn download(
        &self,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<Response, ObjectStoreError> {
        let token = self.bearer().await?;
        let mut request = self.inner.client.get(self.media_url(key)).bearer_auth(&token);
        if let Some(range) = range {
            request = request.header(
                reqwest::header::RANGE,
                format!("bytes={}-{}", range.start, range.end),
            );
        }

        let resp = request
            .send()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ObjectStoreError::NotFound(key.to_string()));
        }
        check_status(resp, "download").await
    }
}

#[async_trait]
impl ObjectStore for GcsStore {
    async fn put(&self, key: &str, data: ByteStream) -> Result<u64, ObjectStoreError> {
        let token = self.bearer().await?;

        let resp = self
            .inner
            .client
            .post(self.upload_url(key))
            .bearer_auth(&token)
            .header("Content-Type", "application/octet-stream")
            .body(reqwest::Body::wrap_stream(data))
            .send()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;

        let resource: ObjectResource = check_status(resp, "upload")
            .await?
            .json()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;

        parse_size(&resource.size)
    }

    async fn get(&self, key: &str) -> Result<ByteStream, ObjectStoreError> {
        let resp = self.download(key, None).await?;
        Ok(resp.bytes_stream().map_err(std::io::Error::other).boxed())
    }

    async fn get_range(
        &self,
        key: &str,
        ranges: &[ByteRange],
    ) -> Result<ByteStream, ObjectStoreError> {
        let Some((first, rest)) = ranges.split_first() else {
            return Ok(futures::stream::empty().boxed());
        };

        // The first request surfaces NotFound eagerly; later ranges are fetched on demand
        let head = self
            .download(key, Some(*first))
            .await?
            .bytes_stream()
            .map_err(std::io::Error::other);

        let store = self.clone();
        let key = key.to_string();
        let tail = futures::stream::iter(rest.to_vec())
            .then(move |range| {
                let store = store.clone();
                let key = key.clone();
                async move {
                    let resp = store
                        .download(&key, Some(range))
                        .await
                        .map_err(std::io::Error::other)?;
                    Ok::<_, std::io::Error>(resp.bytes_stream().map_err(std::io::Error::other))
                }
            })
            .try_flatten();

        Ok(head.chain(tail).boxed())
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        let token = self.bearer().await?;

        let resp = self
            .inner
            .client
            .delete(self.object_url(key))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;

        // 404 is fine -- object already gone
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(resp, "delete").await?;
        Ok(())
    }

    async fn stat(&self, key: &str) -> Result<Option<ObjectMeta>, ObjectStoreError> {
        let token = self.bearer().await?;

        let resp = self
            .inner
            .client
            .get(self.object_url(key))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resource: ObjectResource = check_status(resp, "stat")
            .await?
            .json()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;

        Ok(Some(ObjectMeta {
            key: resource.name,
            size: parse_size(&resource.size)?,
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let mut keys = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let token = self.bearer().await?;
            let mut query = vec![("prefix", prefix.to_string())];
            if let Some(ref page) = page_token {
                query.push(("pageToken", page.clone()));
            }

            let resp = self
                .inner
                .client
                .get(self.list_url())
                .bearer_auth(&token)
                .query(&query)
                .send()
                .await
                .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;

            let page: ListResponse = check_status(resp, "list")
                .await?
                .json()
                .await
                .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;

            keys.extend(page.items.into_iter().map(|item| item.name));
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        keys.sort();
        Ok(keys)
    }

    fn backend_name(&self) -> &'static str {
        "gcs"
    }
}

async fn check_status(resp: Response, action: &str) -> Result<Response, ObjectStoreError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    tracing::debug!(status, action, "GCS request failed");
    Err(ObjectStoreError::Status { status, body })
}

fn parse_size(raw: &str) -> Result<u64, ObjectStoreError> {
    raw.parse()
        .map_err(|_| ObjectStoreError::Backend(format!("GCS returned invalid object size: {raw}")))
}

/// Percent-encode an object name for use as a single URL path segment or query value.
fn encode_object_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn base64_url_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
}

fn sign_rs256(data: &[u8], private_key_pem: &str) -> Result<Vec<u8>, anyhow::Error> {
    // Strip PEM armor and decode base64 to DER
    let der_b64: String = private_key_pem
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .collect();
    let der = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &der_b64)?;

    let key_pair = ring::signature::RsaKeyPair::from_pkcs8(&der)
        .map_err(|e| anyhow::anyhow!("Failed to parse RSA key: {e}"))?;

    let mut signature = vec![0u8; key_pair.public().modulus_len()];
    key_pair
        .sign(
            &ring::signature::RSA_PKCS1_SHA256,
            &ring::rand::SystemRandom::new(),
            data,
            &mut signature,
        )
        .map_err(|e| anyhow::anyhow!("Failed to sign: {e}"))?;

    Ok(signature)
}
