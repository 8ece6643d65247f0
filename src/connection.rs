use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine as _;
use rand::RngCore as _;
use sha2::Digest as _;

use crate::api::{self, FeatureSet};

const AUTHORIZE_URL: &str = "https://iam.viessmann.com/idp/v3/authorize";
const TOKEN_URL: &str = "https://iam.viessmann.com/idp/v3/token";
const API_BASE_URL: &str = "https://api.viessmann.com/iot/v2";
/// Out-of-band redirect target registered for the client. The authorization
/// code is lifted from the redirect instead of following it.
const REDIRECT_URI: &str = "vicare://oauth-callback/everest";
const SCOPE: &str = "IoT User offline_access";
/// Renew the access token this long before its announced expiry.
const TOKEN_RENEWAL_MARGIN: jiff::SignedDuration = jiff::SignedDuration::from_secs(60);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not construct the HTTP client")]
    CreateClient(#[source] reqwest::Error),
    #[error("could not read the token store at {1:?}")]
    ReadTokenStore(#[source] std::io::Error, PathBuf),
    #[error("could not write the token store at {1:?}")]
    WriteTokenStore(#[source] std::io::Error, PathBuf),
    #[error("the token store at {1:?} is not valid JSON")]
    DecodeTokenStore(#[source] serde_json::Error, PathBuf),
    #[error("could not serialize the token store")]
    EncodeTokenStore(#[source] serde_json::Error),
    #[error("could not reach the authorization endpoint")]
    AuthorizeRequest(#[source] reqwest::Error),
    #[error("the credentials for `{0}` were not accepted")]
    CredentialsRejected(String),
    #[error("could not reach the token endpoint")]
    TokenRequest(#[source] reqwest::Error),
    #[error("the token endpoint answered {0}")]
    TokenRejected(reqwest::StatusCode),
    #[error("could not decode the token endpoint response")]
    DecodeToken(#[source] reqwest::Error),
    #[error("unable to retrieve data from ViCare server")]
    Connectivity(#[source] reqwest::Error),
    #[error("unable to decode data from ViCare server")]
    Decode(#[source] reqwest::Error),
    #[error("invalid data from ViCare server")]
    InvalidData(#[source] serde_json::Error),
    #[error("ViCare API rate limit exceeded")]
    RateLimited { reset_at: Option<jiff::Timestamp> },
    #[error("ViCare server answered {status} for `{url}`")]
    Status {
        status: reqwest::StatusCode,
        url: String,
    },
    #[error("the account has no devices")]
    NoDevices,
}

/// Capability view to apply to the adapted device.
///
/// `auto` probes every collection and lets feature availability decide;
/// the burner views skip compressors and the compressor views skip burners.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum, strum::Display, strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum HeatingType {
    Auto,
    Gas,
    Oil,
    Pellets,
    Heatpump,
    Fuelcell,
}

impl HeatingType {
    pub fn probes_burners(&self) -> bool {
        matches!(
            self,
            HeatingType::Auto
                | HeatingType::Gas
                | HeatingType::Oil
                | HeatingType::Pellets
                | HeatingType::Fuelcell
        )
    }

    pub fn probes_compressors(&self) -> bool {
        matches!(self, HeatingType::Auto | HeatingType::Heatpump)
    }
}

/// ViCare account and device options.
#[derive(clap::Parser, Clone)]
#[group(id = "connection::Args")]
pub struct Args {
    /// ViCare account user name.
    #[arg(long)]
    pub username: String,

    /// ViCare account password.
    #[arg(long)]
    pub password: String,

    /// OAuth client identifier issued by the Viessmann developer portal.
    #[arg(long)]
    pub client_id: String,

    /// File the OAuth tokens are persisted to between runs.
    #[arg(long, default_value = "vicare_token.save")]
    pub token_store: PathBuf,

    /// Name prefixed to every entity name.
    #[arg(long, default_value = "ViCare")]
    pub name: String,

    /// Capability view to apply to the device.
    #[arg(long, value_enum, default_value_t = HeatingType::Auto)]
    pub heating_type: HeatingType,

    /// How often to poll the backend. Doubles as the lifetime of the cached
    /// feature listing.
    #[arg(long, default_value = "60s")]
    pub scan_interval: humantime::Duration,

    /// Give up on a single API request after this long.
    #[arg(long, default_value = "30s")]
    pub request_timeout: humantime::Duration,
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
struct StoredToken {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_at: jiff::Timestamp,
}

impl StoredToken {
    fn is_fresh(&self, at: jiff::Timestamp) -> bool {
        self.expires_at.duration_since(at) > TOKEN_RENEWAL_MARGIN
    }
}

#[derive(serde::Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
}

impl TokenResponse {
    fn into_stored(self, at: jiff::Timestamp) -> StoredToken {
        // Adding a `SignedDuration` cannot fail; overflow saturates.
        let expires_at = at
            .saturating_add(jiff::SignedDuration::from_secs(self.expires_in))
            .unwrap_or(jiff::Timestamp::MAX);
        StoredToken {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
        }
    }
}

fn code_verifier() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn code_challenge(verifier: &str) -> String {
    let digest = sha2::Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
}

fn code_from_location(location: &str) -> Option<&str> {
    location
        .split(&['?', '&'])
        .find_map(|pair| pair.strip_prefix("code="))
}

async fn authorization_code(
    http: &reqwest::Client,
    args: &Args,
    challenge: &str,
) -> Result<String, Error> {
    let response = http
        .post(AUTHORIZE_URL)
        .query(&[
            ("client_id", args.client_id.as_str()),
            ("redirect_uri", REDIRECT_URI),
            ("response_type", "code"),
            ("code_challenge", challenge),
            ("code_challenge_method", "S256"),
            ("scope", SCOPE),
        ])
        .form(&[
            ("isiwebuserid", args.username.as_str()),
            ("isiwebpasswd", args.password.as_str()),
        ])
        .send()
        .await
        .map_err(Error::AuthorizeRequest)?;
    // A successful login answers with a redirect to the out-of-band URI,
    // carrying the authorization code in its query. Anything else means the
    // credentials or the client id were not accepted.
    let rejected = || Error::CredentialsRejected(args.username.clone());
    let location = response
        .headers()
        .get(reqwest::header::LOCATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(rejected)?;
    let code = code_from_location(location).ok_or_else(rejected)?;
    Ok(code.to_string())
}

async fn exchange(http: &reqwest::Client, form: &[(&str, &str)]) -> Result<StoredToken, Error> {
    let response = http
        .post(TOKEN_URL)
        .form(form)
        .send()
        .await
        .map_err(Error::TokenRequest)?;
    if !response.status().is_success() {
        return Err(Error::TokenRejected(response.status()));
    }
    let token: TokenResponse = response.json().await.map_err(Error::DecodeToken)?;
    Ok(token.into_stored(jiff::Timestamp::now()))
}

async fn login(http: &reqwest::Client, args: &Args) -> Result<StoredToken, Error> {
    tracing::info!(message = "logging in", username = args.username.as_str());
    let verifier = code_verifier();
    let code = authorization_code(http, args, &code_challenge(&verifier)).await?;
    exchange(
        http,
        &[
            ("grant_type", "authorization_code"),
            ("code", &code),
            ("code_verifier", &verifier),
            ("redirect_uri", REDIRECT_URI),
            ("client_id", &args.client_id),
        ],
    )
    .await
}

async fn renew(
    http: &reqwest::Client,
    args: &Args,
    stale: StoredToken,
) -> Result<StoredToken, Error> {
    let Some(refresh_token) = stale.refresh_token.as_deref() else {
        return login(http, args).await;
    };
    tracing::debug!(message = "renewing the access token");
    let form = [
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", &args.client_id),
    ];
    match exchange(http, &form).await {
        Ok(token) => Ok(token),
        Err(Error::TokenRejected(status)) => {
            // Refresh tokens are revoked when the account password changes.
            tracing::info!(
                message = "token renewal was rejected, logging in from scratch",
                %status,
            );
            login(http, args).await
        }
        Err(error) => Err(error),
    }
}

async fn load_token(path: &Path) -> Result<Option<StoredToken>, Error> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(Error::ReadTokenStore(error, path.to_path_buf())),
    };
    let token = serde_json::from_slice(&bytes)
        .map_err(|error| Error::DecodeTokenStore(error, path.to_path_buf()))?;
    Ok(Some(token))
}

async fn store_token(path: &Path, token: &StoredToken) -> Result<(), Error> {
    let bytes = serde_json::to_vec_pretty(token).map_err(Error::EncodeTokenStore)?;
    tokio::fs::write(path, bytes)
        .await
        .map_err(|error| Error::WriteTokenStore(error, path.to_path_buf()))
}

#[derive(serde::Deserialize)]
struct RateLimitBody {
    #[serde(rename = "extendedPayload", default)]
    extended_payload: Option<RateLimitPayload>,
}

#[derive(serde::Deserialize)]
struct RateLimitPayload {
    #[serde(rename = "limitReset", default)]
    limit_reset: Option<i64>,
}

fn rate_limit_reset(body: &[u8]) -> Option<jiff::Timestamp> {
    let body: RateLimitBody = serde_json::from_slice(body).ok()?;
    let millis = body.extended_payload?.limit_reset?;
    jiff::Timestamp::from_millisecond(millis).ok()
}

async fn rate_limited(response: reqwest::Response) -> Error {
    let reset_at = match response.bytes().await {
        Ok(bytes) => rate_limit_reset(&bytes),
        Err(_) => None,
    };
    Error::RateLimited { reset_at }
}

/// Address of one device within the account equipment tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub installation_id: i64,
    pub gateway_serial: String,
    pub device_id: String,
}

/// One device of the account equipment listing.
#[derive(Clone, Debug)]
pub struct DeviceRecord {
    pub route: Route,
    pub model_id: String,
    pub device_type: Option<String>,
    pub online: bool,
    pub installation_description: Option<String>,
}

struct CachedListing {
    route: Route,
    fetched_at: tokio::time::Instant,
    features: Arc<FeatureSet>,
}

/// Authenticated ViCare API session.
///
/// Holds the OAuth tokens and a short lived cache of the device feature
/// listing, so a burst of probes within one poll cycle costs one request.
pub struct Session {
    http: reqwest::Client,
    args: Args,
    auth: tokio::sync::Mutex<StoredToken>,
    listing: tokio::sync::Mutex<Option<CachedListing>>,
}

impl Session {
    /// Log in and return a ready session.
    ///
    /// A token persisted by an earlier run is reused while it lasts,
    /// otherwise the credential login flow runs from scratch.
    pub async fn open(args: Args) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(*args.request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(Error::CreateClient)?;
        let token = match load_token(&args.token_store).await? {
            Some(token) if token.is_fresh(jiff::Timestamp::now()) => {
                tracing::debug!(message = "reusing the persisted token", store = ?args.token_store);
                token
            }
            Some(stale) => renew(&http, &args, stale).await?,
            None => login(&http, &args).await?,
        };
        store_token(&args.token_store, &token).await?;
        Ok(Self {
            http,
            args,
            auth: tokio::sync::Mutex::new(token),
            listing: tokio::sync::Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, Error> {
        {
            let auth = self.auth.lock().await;
            if auth.is_fresh(jiff::Timestamp::now()) {
                return Ok(auth.access_token.clone());
            }
        }
        self.renewed_token().await
    }

    async fn renewed_token(&self) -> Result<String, Error> {
        let mut auth = self.auth.lock().await;
        *auth = renew(&self.http, &self.args, auth.clone()).await?;
        store_token(&self.args.token_store, &auth).await?;
        Ok(auth.access_token.clone())
    }

    async fn authorized_get(&self, url: &str, token: &str) -> Result<reqwest::Response, Error> {
        self.http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(Error::Connectivity)
    }

    async fn get(&self, url: &str) -> Result<serde_json::Value, Error> {
        let token = self.access_token().await?;
        let mut response = self.authorized_get(url, &token).await?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            // The backend revokes tokens before their announced expiry at
            // times. One renewal covers that.
            let token = self.renewed_token().await?;
            response = self.authorized_get(url, &token).await?;
        }
        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(rate_limited(response).await);
        }
        if !status.is_success() {
            return Err(Error::Status {
                status,
                url: url.to_string(),
            });
        }
        response.json().await.map_err(Error::Decode)
    }

    /// List every device the account can see, across all installations and
    /// gateways.
    pub async fn devices(&self) -> Result<Vec<DeviceRecord>, Error> {
        let url = format!("{API_BASE_URL}/equipment/installations?includeGateways=true");
        let document = self.get(&url).await?;
        let response: api::InstallationsResponse =
            serde_json::from_value(document).map_err(Error::InvalidData)?;
        let mut devices = Vec::new();
        for installation in response.data {
            for gateway in installation.gateways {
                for device in gateway.devices {
                    let online = device.is_online();
                    devices.push(DeviceRecord {
                        route: Route {
                            installation_id: installation.id,
                            gateway_serial: gateway.serial.clone(),
                            device_id: device.id,
                        },
                        model_id: device.model_id,
                        device_type: device.device_type,
                        online,
                        installation_description: installation.description.clone(),
                    });
                }
            }
        }
        Ok(devices)
    }

    /// Feature listing of a device, from cache while the previous fetch is
    /// younger than the scan interval.
    pub async fn features(&self, route: &Route) -> Result<Arc<FeatureSet>, Error> {
        let mut listing = self.listing.lock().await;
        if let Some(cached) = listing.as_ref() {
            if cached.route == *route && cached.fetched_at.elapsed() < *self.args.scan_interval {
                return Ok(Arc::clone(&cached.features));
            }
        }
        let url = format!(
            "{API_BASE_URL}/features/installations/{}/gateways/{}/devices/{}/features/",
            route.installation_id, route.gateway_serial, route.device_id
        );
        let document = self.get(&url).await?;
        let features = Arc::new(FeatureSet::from_response(document).map_err(Error::InvalidData)?);
        tracing::debug!(message = "fetched the feature listing", features = features.len());
        *listing = Some(CachedListing {
            route: route.clone(),
            fetched_at: tokio::time::Instant::now(),
            features: Arc::clone(&features),
        });
        Ok(features)
    }
}

/// Identity of the appliance entities are attributed to.
#[derive(Clone, Debug)]
pub struct DeviceIdentity {
    pub serial: String,
    pub model: String,
    pub online: bool,
}

impl DeviceIdentity {
    pub const MANUFACTURER: &'static str = "Viessmann";
}

/// Capability view over one device of the account.
///
/// Cheap to clone; clones share the session and its caches.
#[derive(Clone)]
pub struct DeviceView {
    session: Arc<Session>,
    route: Route,
    identity: Arc<DeviceIdentity>,
    heating_type: HeatingType,
}

impl DeviceView {
    pub async fn features(&self) -> Result<Arc<FeatureSet>, Error> {
        self.session.features(&self.route).await
    }

    pub fn account_name(&self) -> &str {
        &self.session.args.name
    }

    pub fn heating_type(&self) -> HeatingType {
        self.heating_type
    }

    pub fn identity(&self) -> &Arc<DeviceIdentity> {
        &self.identity
    }

    pub fn scan_interval(&self) -> std::time::Duration {
        *self.session.args.scan_interval
    }
}

/// Open a session and pick the device to adapt.
///
/// Only the first device of the account is adapted. The full listing is
/// logged so the owners of the rest can tell what was skipped.
pub async fn open_device(args: Args) -> Result<DeviceView, Error> {
    let heating_type = args.heating_type;
    let session = Arc::new(Session::open(args).await?);
    let devices = session.devices().await?;
    for device in &devices {
        tracing::info!(
            message = "found device",
            model = device.model_id.as_str(),
            online = device.online,
        );
    }
    let device = devices.into_iter().next().ok_or(Error::NoDevices)?;
    tracing::info!(
        message = "using capability view",
        heating_type = %heating_type,
        model = device.model_id.as_str(),
    );
    let identity = Arc::new(DeviceIdentity {
        serial: device.route.gateway_serial.clone(),
        model: device.model_id,
        online: device.online,
    });
    Ok(DeviceView {
        session,
        route: device.route,
        identity,
        heating_type,
    })
}
