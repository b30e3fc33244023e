pub mod extract;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;

use crate::core::resource::{CachedToken, Credentials, Resource};
use crate::error::TokenError;

/// Default OAuth endpoint for app-credential resources that do not name
/// their own
pub const DEFAULT_OAUTH_ENDPOINT: &str = "https://www.arcgis.com/sharing/oauth2";

/// Cache lifetime applied when the endpoint does not report an expiry
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(55 * 60);

type Flight = Shared<BoxFuture<'static, Result<CachedToken, TokenError>>>;

/// Acquires, caches and refreshes upstream tokens, one cache slot per
/// resource. Acquisitions are single-flight: the first caller for a
/// resource performs the network exchange, concurrent callers attach to
/// the same in-flight attempt and observe its outcome.
pub struct TokenBroker {
    client: reqwest::Client,
    flights: Arc<Mutex<HashMap<String, Flight>>>,
}

impl TokenBroker {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Produce a valid token for a credential-bearing resource: the cached
    /// token when live, otherwise a fresh acquisition. The referrer is the
    /// canonical key supplied by the dispatcher; the user-credential flow
    /// sends it to the token endpoint.
    pub async fn token_for(
        &self,
        resource: &Arc<Resource>,
        referrer: &str,
    ) -> Result<String, TokenError> {
        if let Some(token) = resource.live_token() {
            return Ok(token);
        }
        self.acquire(resource, referrer).await.map(|t| t.value)
    }

    /// Drop the cached token and acquire a fresh one. Used after an
    /// upstream auth-failure signal.
    pub async fn refresh(
        &self,
        resource: &Arc<Resource>,
        referrer: &str,
    ) -> Result<String, TokenError> {
        resource.invalidate_token();
        self.acquire(resource, referrer).await.map(|t| t.value)
    }

    async fn acquire(
        &self,
        resource: &Arc<Resource>,
        referrer: &str,
    ) -> Result<CachedToken, TokenError> {
        let flight = {
            let mut flights = self.flights.lock().await;
            match flights.get(&resource.url) {
                Some(existing) => existing.clone(),
                None => {
                    let flight = self.launch(resource, referrer);
                    flights.insert(resource.url.clone(), flight.clone());
                    flight
                }
            }
        };

        flight.await
    }

    /// Spawn the acquisition on its own task so it runs to completion and
    /// populates the cache even when the requesting client disconnects.
    fn launch(&self, resource: &Arc<Resource>, referrer: &str) -> Flight {
        let (tx, rx) = tokio::sync::oneshot::channel::<Result<CachedToken, TokenError>>();
        let client = self.client.clone();
        let resource = resource.clone();
        let referrer = referrer.to_string();
        let flights = self.flights.clone();

        tokio::spawn(async move {
            let result = acquire_fresh(&client, &resource, &referrer).await;
            if let Ok(token) = &result {
                resource.store_token(token.clone());
            }
            // Cache is populated before the flight entry disappears, so
            // late callers either attach or hit the cache.
            flights.lock().await.remove(&resource.url);
            let _ = tx.send(result);
        });

        rx.map(|received| match received {
            Ok(outcome) => outcome,
            Err(_) => Err(TokenError::Internal(
                "acquisition task dropped".to_string(),
            )),
        })
        .boxed()
        .shared()
    }
}

async fn acquire_fresh(
    client: &reqwest::Client,
    resource: &Resource,
    referrer: &str,
) -> Result<CachedToken, TokenError> {
    let body = match &resource.credentials {
        Credentials::App {
            client_id,
            client_secret,
        } => app_credential_login(client, resource, client_id, client_secret).await?,
        Credentials::User { username, password } => {
            user_credential_login(client, resource, referrer, username, password).await?
        }
        _ => return Err(TokenError::NoCredentials),
    };

    let value = extract::extract_token(&body)
        .ok_or_else(|| TokenError::MissingToken(truncate(&body, 200)))?;

    let now = SystemTime::now();
    let expires_at = extract::extract_expires_ms(&body)
        .map(|ms| UNIX_EPOCH + Duration::from_millis(ms))
        .filter(|expiry| *expiry > now)
        .unwrap_or(now + DEFAULT_TOKEN_LIFETIME);

    tracing::info!(resource = %resource.url, "Acquired upstream token");
    Ok(CachedToken {
        value,
        acquired_at: now,
        expires_at,
    })
}

/// App-credential flow: client-credentials grant for a portal token, then
/// exchange for a long-lived server token at the `/generateToken` sibling
/// of the OAuth endpoint.
async fn app_credential_login(
    client: &reqwest::Client,
    resource: &Resource,
    client_id: &str,
    client_secret: &str,
) -> Result<String, TokenError> {
    let endpoint = resource
        .oauth_endpoint
        .as_deref()
        .unwrap_or(DEFAULT_OAUTH_ENDPOINT)
        .trim_end_matches('/')
        .to_string();

    let portal_body = post_form(
        client,
        &format!("{}/token", endpoint),
        &[
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("grant_type", "client_credentials"),
            ("f", "json"),
        ],
    )
    .await?;
    let portal_token = extract::extract_token(&portal_body)
        .ok_or_else(|| TokenError::MissingToken(truncate(&portal_body, 200)))?;

    let exchange_url = if endpoint.contains("/oauth2") {
        endpoint.replacen("/oauth2", "/generateToken", 1)
    } else {
        format!("{}/generateToken", endpoint)
    };
    post_form(
        client,
        &exchange_url,
        &[
            ("token", portal_token.as_str()),
            ("serverURL", resource.url.as_str()),
            ("f", "json"),
        ],
    )
    .await
}

/// User-credential flow: discover the token service from the server's
/// info document, then exchange username and password for a token.
async fn user_credential_login(
    client: &reqwest::Client,
    resource: &Resource,
    referrer: &str,
    username: &str,
    password: &str,
) -> Result<String, TokenError> {
    let info_url = derive_info_url(&resource.url);
    let info_body = client
        .get(&info_url)
        .query(&[("f", "json")])
        .send()
        .await
        .map_err(|e| TokenError::Request(e.to_string()))?
        .text()
        .await
        .map_err(|e| TokenError::Request(e.to_string()))?;

    let info: serde_json::Value = serde_json::from_str(&info_body)
        .map_err(|e| TokenError::Endpoint(format!("{}: {}", info_url, e)))?;
    let token_url = info["authInfo"]["tokenServicesUrl"]
        .as_str()
        .map(|s| s.to_string())
        .or_else(|| {
            info["owningSystemUrl"].as_str().map(|owner| {
                format!("{}/sharing/generateToken", owner.trim_end_matches('/'))
            })
        })
        .ok_or_else(|| {
            TokenError::Endpoint(format!("no token service advertised by {}", info_url))
        })?;

    post_form(
        client,
        &token_url,
        &[
            ("request", "getToken"),
            ("f", "json"),
            ("referer", referrer),
            ("expiration", "60"),
            ("username", username),
            ("password", password),
        ],
    )
    .await
}

/// Derive the server info URL from a resource URL: strip from `/rest/`
/// onward, falling back to `/sharing/`, falling back to appending the
/// conventional instance path.
fn derive_info_url(url: &str) -> String {
    if let Some(idx) = url.find("/rest/") {
        format!("{}/rest/info", &url[..idx])
    } else if let Some(idx) = url.find("/sharing/") {
        format!("{}/sharing/rest/info", &url[..idx])
    } else {
        format!("{}/arcgis/rest/info", url.trim_end_matches('/'))
    }
}

async fn post_form(
    client: &reqwest::Client,
    url: &str,
    form: &[(&str, &str)],
) -> Result<String, TokenError> {
    let response = client
        .post(url)
        .form(form)
        .send()
        .await
        .map_err(|e| TokenError::Request(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(TokenError::Request(format!("{} returned {}", url, status)));
    }
    response
        .text()
        .await
        .map_err(|e| TokenError::Request(e.to_string()))
}

fn truncate(body: &str, limit: usize) -> String {
    if body.len() <= limit {
        body.to_string()
    } else {
        let mut end = limit;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &body[..end])
    }
}
