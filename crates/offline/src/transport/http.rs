//! HTTP implementation of [`RemoteTransport`] over `reqwest`.

use std::time::Duration;

use guardian_core::IdentityKey;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::{
    DeleteOutcome, RemoteTransport, SyncChildrenResponse, SyncUsersResponse, TransportError,
};

/// `add-record` answers either `{ "history": [...] }` or a bare array.
#[derive(Deserialize)]
#[serde(untagged)]
enum HistoryBody {
    Wrapped { history: Vec<Value> },
    Bare(Vec<Value>),
}

impl HistoryBody {
    fn into_history(self) -> Vec<Value> {
        match self {
            HistoryBody::Wrapped { history } => history,
            HistoryBody::Bare(history) => history,
        }
    }
}

/// Remote backend reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: Url,
    token: Option<String>,
    timeout: Duration,
    client: Client,
}

impl HttpTransport {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let base_url =
            Url::parse(base_url).map_err(|e| TransportError::InvalidEndpoint(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(TransportError::InvalidEndpoint(base_url.to_string()));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;

        Ok(Self {
            base_url,
            token,
            timeout,
            client,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Build the URL for `segments` below the base URL, percent-encoding each
    /// segment so identity keys can hold any text.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, TransportError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| TransportError::InvalidEndpoint(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder, TransportError> {
        let url = self.endpoint(segments)?;
        let mut req = self.client.request(method, url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        Ok(req)
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, TransportError> {
        req.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(self.timeout)
            } else {
                TransportError::Network(e.to_string())
            }
        })
    }

    async fn api_error(resp: Response) -> TransportError {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        TransportError::Api { status, body }
    }

    async fn parse<T: DeserializeOwned>(resp: Response) -> Result<T, TransportError> {
        resp.json::<T>()
            .await
            .map_err(|e| TransportError::Parse(e.to_string()))
    }

    async fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, TransportError> {
        let resp = self.send(req).await?;
        if !resp.status().is_success() {
            return Err(Self::api_error(resp).await);
        }
        Self::parse(resp).await
    }
}

#[async_trait::async_trait]
impl RemoteTransport for HttpTransport {
    async fn probe(&self) -> Result<(), TransportError> {
        let resp = self.send(self.request(Method::GET, &["health"])?).await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Self::api_error(resp).await)
        }
    }

    async fn sync_users(&self, users: &[Value]) -> Result<SyncUsersResponse, TransportError> {
        let req = self
            .request(Method::POST, &["sync-users"])?
            .json(&json!({ "users": users }));
        self.send_json(req).await
    }

    async fn sync_children(&self, children: &[Value]) -> Result<SyncChildrenResponse, TransportError> {
        let req = self
            .request(Method::POST, &["sync-children"])?
            .json(&json!({ "children": children }));
        self.send_json(req).await
    }

    async fn fetch_users(&self) -> Result<Vec<Value>, TransportError> {
        self.send_json(self.request(Method::GET, &["all-users"])?).await
    }

    async fn fetch_children(&self) -> Result<Vec<Value>, TransportError> {
        self.send_json(self.request(Method::GET, &["children"])?).await
    }

    async fn fetch_child(&self, key: &IdentityKey) -> Result<Option<Value>, TransportError> {
        let req = self.request(Method::GET, &["child-by-unique-id", key.as_str()])?;
        let resp = self.send(req).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Self::parse(resp).await.map(Some),
            _ => Err(Self::api_error(resp).await),
        }
    }

    async fn add_record(&self, child: &IdentityKey, record: &Value) -> Result<Vec<Value>, TransportError> {
        let req = self
            .request(Method::PUT, &["add-record", child.as_str()])?
            .json(record);
        let resp = self.send(req).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(TransportError::ParentNotFound(child.clone())),
            status if status.is_success() => {
                Self::parse::<HistoryBody>(resp).await.map(HistoryBody::into_history)
            }
            _ => Err(Self::api_error(resp).await),
        }
    }

    async fn delete_child(&self, key: &IdentityKey) -> Result<DeleteOutcome, TransportError> {
        let resp = self
            .send(self.request(Method::DELETE, &["child", key.as_str()])?)
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(DeleteOutcome::AlreadyAbsent),
            status if status.is_success() => Ok(DeleteOutcome::Deleted),
            _ => Err(Self::api_error(resp).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_encode_keys_and_keep_base_path() {
        let transport =
            HttpTransport::new("http://localhost:5000/api/", None, Duration::from_secs(1)).unwrap();
        let url = transport.endpoint(&["add-record", "K 1/2"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:5000/api/add-record/K%201%2F2");

        let transport =
            HttpTransport::new("http://localhost:5000", None, Duration::from_secs(1)).unwrap();
        assert_eq!(
            transport.endpoint(&["children"]).unwrap().as_str(),
            "http://localhost:5000/children"
        );
    }

    #[test]
    fn rejects_unusable_base_url() {
        assert!(matches!(
            HttpTransport::new("not a url", None, Duration::from_secs(1)),
            Err(TransportError::InvalidEndpoint(_))
        ));
        assert!(HttpTransport::new("mailto:ops@example.org", None, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn history_body_accepts_both_shapes() {
        let wrapped: HistoryBody = serde_json::from_value(json!({ "history": [{ "id": "R1" }] })).unwrap();
        assert_eq!(wrapped.into_history().len(), 1);
        let bare: HistoryBody = serde_json::from_value(json!([{ "id": "R1" }, { "id": "R2" }])).unwrap();
        assert_eq!(bare.into_history().len(), 2);
    }
}
