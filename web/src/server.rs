use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Error, Result};
use axum::body::{boxed, Full};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::Response;
use lazy_static::lazy_static;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use copperline_agent::event::EventManager;
use copperline_cluster::election::Cluster;
use copperline_cluster::manager::{QueueManager, QueueManagerHandle};
use copperline_db::api::StoreSeed;
use copperline_db::message::{ApiCall, ApiError, ErrCode, LoginOpts};
use copperline_db::models::Agent;
use copperline_db::Database;

use crate::connection::{ConnectionWorker, PollOutcome};
use crate::crypto::RsaKeys;
use crate::session::{Session, SessionTable, LANG_COOKIE, SESSION_COOKIE};

lazy_static! {
    pub static ref WEB_SERVICE: WebService = WebService::new().unwrap();
}

fn default_listen() -> String {
    "0.0.0.0:5050".to_string()
}

fn default_www_root() -> String {
    "www".to_string()
}

fn default_key_path() -> String {
    "./key".to_string()
}

fn default_poll_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    120
}

fn default_heartbeat_ms() -> u64 {
    1000
}

fn default_window_ms() -> u64 {
    5000
}

#[derive(Deserialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_www_root")]
    pub www_root: String,
    pub dynamic_root: Option<String>,
    #[serde(default = "default_key_path")]
    pub key_path: String,
    /// Bounded poll wait, seconds.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout: u64,
    /// Connection worker self-terminates without keep_alive for this
    /// long, seconds.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    pub node: Option<String>,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default)]
    pub store: StoreSeed,
}

pub struct WebService {
    pub config: Config,
    pub db: Arc<Database>,
    pub sessions: SessionTable,
    pub keys: RsaKeys,
    pub event_manager: EventManager,
    queues: std::sync::RwLock<Option<QueueManagerHandle>>,
}

impl WebService {
    pub fn new() -> Result<WebService> {
        let path = std::env::var("COPPERLINE_CONF")
            .unwrap_or_else(|_| "/etc/copperline/copperline.conf".to_string());
        let mut config: Config = match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) => {
                warn!(path = %path, "no config file ({e}), using defaults");
                toml::from_str("")?
            }
        };
        let db = Arc::new(Database::new(std::mem::take(&mut config.store)));
        let keys = RsaKeys::load_or_generate(&config.key_path)?;
        Ok(WebService {
            config,
            db,
            sessions: SessionTable::new(),
            keys,
            event_manager: EventManager::default(),
            queues: std::sync::RwLock::new(None),
        })
    }

    pub fn queues(&self) -> Option<QueueManagerHandle> {
        self.queues.read().ok().and_then(|q| q.clone())
    }

    fn set_queues(&self, manager: QueueManagerHandle) {
        if let Ok(mut queues) = self.queues.write() {
            *queues = Some(manager);
        }
    }
}

pub struct Server;

impl Server {
    pub async fn run() -> Result<(), Error> {
        let config = &WEB_SERVICE.config;
        let node = config.node.clone().unwrap_or_else(|| {
            copperline_utils::get_hostname()
                .unwrap_or_else(|| "node-1".to_string())
        });

        let cluster = Cluster::new();
        let manager = QueueManager::start(
            node,
            cluster,
            WEB_SERVICE.db.clone(),
            Duration::from_millis(config.heartbeat_ms),
            Duration::from_millis(config.window_ms),
        )
        .await;
        for name in WEB_SERVICE.db.queue_names().await {
            if let Some(queue) = WEB_SERVICE.db.get_queue_config(&name).await {
                let _ = manager
                    .add_queue(&name, Some(queue.recipe), Some(queue.weight))
                    .await;
            }
        }
        WEB_SERVICE.set_queues(manager);

        let app = axum::Router::new()
            .route("/api", axum::routing::post(api))
            .fallback(dispatch);

        info!(listen = %config.listen, "web listener starting");
        axum::Server::bind(&SocketAddr::from_str(&config.listen)?)
            .serve(app.into_make_service())
            .await?;
        Ok(())
    }
}

// ---- canonical reply shapes ----

fn reply_ok() -> Value {
    json!({ "success": true })
}

fn reply_result(result: Value) -> Value {
    json!({ "success": true, "result": result })
}

fn reply_err(e: &ApiError) -> Value {
    json!({
        "success": false,
        "message": e.message,
        "errcode": e.errcode.to_string(),
    })
}

/// Per-request reply context: which cookies this response sets.
struct ReplyCx {
    cookies: Vec<String>,
}

impl ReplyCx {
    fn new(lang: &str) -> Self {
        Self {
            cookies: vec![format!("{LANG_COOKIE}={lang}; path=/")],
        }
    }

    fn set_session_cookie(&mut self, session_id: &str) {
        self.cookies
            .push(format!("{SESSION_COOKIE}={session_id}; path=/"));
    }

    fn json(&self, status: StatusCode, body: Value) -> Response {
        let mut builder = Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json");
        for cookie in &self.cookies {
            builder = builder.header(header::SET_COOKIE, cookie);
        }
        builder
            .body(boxed(Full::from(body.to_string())))
            .unwrap()
    }

    fn file(&self, content_type: &str, data: Vec<u8>) -> Response {
        let mut builder = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type);
        for cookie in &self.cookies {
            builder = builder.header(header::SET_COOKIE, cookie);
        }
        builder.body(boxed(Full::from(data))).unwrap()
    }
}

fn parse_cookies(headers: &HeaderMap) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for value in headers.get_all(header::COOKIE) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for pair in value.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                cookies.insert(name.to_string(), value.to_string());
            }
        }
    }
    cookies
}

/// Match Accept-Language against the shipped nls label files; fall back
/// to the bare language prefix, then to "en".
pub async fn negotiate_lang(accept: Option<&str>, www_root: &str) -> String {
    let Some(accept) = accept else {
        return "en".to_string();
    };
    let mut tags: Vec<(f32, String)> = accept
        .split(',')
        .filter_map(|part| {
            let mut part = part.trim().splitn(2, ';');
            let tag = part.next()?.trim();
            if tag.is_empty() || tag == "*" {
                return None;
            }
            let q = part
                .next()
                .and_then(|q| q.trim().strip_prefix("q="))
                .and_then(|q| q.parse().ok())
                .unwrap_or(1.0);
            Some((q, tag.to_string()))
        })
        .collect();
    tags.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    for (_, tag) in tags {
        if lang_available(www_root, &tag).await {
            return tag;
        }
        if let Some((prefix, _)) = tag.split_once('-') {
            if lang_available(www_root, prefix).await {
                return prefix.to_string();
            }
        }
    }
    "en".to_string()
}

async fn lang_available(www_root: &str, lang: &str) -> bool {
    let path = PathBuf::from(www_root)
        .join("agent/application/nls")
        .join(lang)
        .join("labels.js");
    tokio::fs::metadata(path).await.is_ok()
}

fn content_type_for(path: &str) -> &'static str {
    match path.rsplit('.').next().unwrap_or("") {
        "html" => "text/html",
        "js" => "application/javascript",
        "css" => "text/css",
        "json" => "application/json",
        "png" => "image/png",
        "gif" => "image/gif",
        "jpg" | "jpeg" => "image/jpeg",
        "ico" => "image/x-icon",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

/// Resolve a GET path against the static roots: `www/agent/<path>`, then
/// `www/contrib/<path>`; `/dynamic/<path>` uses the configured root.
pub async fn resolve_static(
    www_root: &str,
    dynamic_root: Option<&str>,
    path: &str,
) -> Option<PathBuf> {
    let rel = path.trim_start_matches('/');
    if rel.split('/').any(|c| c == "..") {
        return None;
    }
    if path == "/" {
        let index = PathBuf::from(www_root).join("agent/index.html");
        return tokio::fs::metadata(&index).await.is_ok().then_some(index);
    }
    if let Some(dynamic) = rel.strip_prefix("dynamic/") {
        let root = dynamic_root?;
        let file = PathBuf::from(root).join(dynamic);
        return tokio::fs::metadata(&file).await.is_ok().then_some(file);
    }
    for base in ["agent", "contrib"] {
        let file = PathBuf::from(www_root).join(base).join(rel);
        if tokio::fs::metadata(&file).await.is_ok() {
            return Some(file);
        }
    }
    None
}

// ---- handlers ----

async fn api(
    headers: HeaderMap,
    axum::extract::Form(form): axum::extract::Form<HashMap<String, String>>,
) -> Response {
    let call = match form.get("request") {
        None => Err(ApiError::new(
            ErrCode::NoFunction,
            "no request field in the form",
        )),
        Some(request) => parse_json_call(request),
    };
    dispatch_call(call, &headers).await
}

fn parse_json_call(request: &str) -> Result<ApiCall, ApiError> {
    let value: Value = serde_json::from_str(request)
        .map_err(|e| ApiError::new(ErrCode::NoFunction, &format!("bad json: {e}")))?;
    let function = value
        .get("function")
        .and_then(|f| f.as_str())
        .ok_or_else(|| ApiError::new(ErrCode::NoFunction, "no function name"))?;
    let args = value
        .get("args")
        .and_then(|a| a.as_array())
        .cloned()
        .unwrap_or_default();
    ApiCall::from_function(function, &args)
}

/// Everything that is not `/api`: the legacy command paths, static
/// files, and the raw fallthrough to the agent connection.
async fn dispatch(
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> Response {
    let form: HashMap<String, String> =
        serde_urlencoded::from_str(&body).unwrap_or_default();
    let path = uri.path().to_string();

    if let Some(call) = ApiCall::from_path(&path, &form) {
        return dispatch_call(call, &headers).await;
    }

    if method == Method::GET {
        let config = &WEB_SERVICE.config;
        if let Some(file) = resolve_static(
            &config.www_root,
            config.dynamic_root.as_deref(),
            &path,
        )
        .await
        {
            let lang = negotiate_lang(
                headers
                    .get(header::ACCEPT_LANGUAGE)
                    .and_then(|v| v.to_str().ok()),
                &config.www_root,
            )
            .await;
            let mut cx = ReplyCx::new(&lang);
            let cookies = parse_cookies(&headers);
            if WEB_SERVICE.sessions.lookup(&cookies).is_none() {
                let id = WEB_SERVICE.sessions.issue_session();
                cx.set_session_cookie(&id);
            }
            return match tokio::fs::read(&file).await {
                Ok(data) => {
                    cx.file(content_type_for(&file.to_string_lossy()), data)
                }
                Err(e) => cx.json(
                    StatusCode::OK,
                    reply_err(&ApiError::unknown(&format!("read failed: {e}"))),
                ),
            };
        }
    }

    // unknown path: raw fallthrough to the agent-connection API
    let call = ApiCall::Raw {
        function: path.trim_matches('/').to_string(),
        args: vec![serde_json::to_value(&form).unwrap_or(Value::Null)],
    };
    dispatch_call(Ok(call), &headers).await
}

async fn dispatch_call(
    call: Result<ApiCall, ApiError>,
    headers: &HeaderMap,
) -> Response {
    let config = &WEB_SERVICE.config;
    let lang = negotiate_lang(
        headers
            .get(header::ACCEPT_LANGUAGE)
            .and_then(|v| v.to_str().ok()),
        &config.www_root,
    )
    .await;
    let mut cx = ReplyCx::new(&lang);

    let cookies = parse_cookies(headers);
    let session = WEB_SERVICE.sessions.lookup(&cookies);
    if let Some(session) = &session {
        if let Some(connection) = &session.connection {
            connection.keep_alive();
        }
    }

    let call = match call {
        Ok(call) => call,
        Err(e) => return cx.json(StatusCode::OK, reply_err(&e)),
    };

    match call {
        ApiCall::CheckCookie => check_cookie(session, &mut cx).await,
        ApiCall::GetSalt => get_salt(session, &mut cx),
        ApiCall::Login {
            username,
            password,
            opts,
        } => login(session, &username, &password, &opts, &mut cx).await,
        ApiCall::GetQueueList => {
            let names = WEB_SERVICE.db.queue_names().await;
            let list: Vec<Value> =
                names.into_iter().map(|name| json!({ "name": name })).collect();
            cx.json(StatusCode::OK, reply_result(json!(list)))
        }
        ApiCall::GetBrandList => {
            let clients = WEB_SERVICE.db.clients().await;
            let list: Vec<Value> = clients
                .into_iter()
                .map(|c| json!({ "label": c.label, "id": c.id }))
                .collect();
            cx.json(StatusCode::OK, reply_result(json!(list)))
        }
        ApiCall::GetReleaseOpts => {
            let opts = WEB_SERVICE.db.release_opts().await;
            let list: Vec<Value> = opts
                .into_iter()
                .map(|o| {
                    json!({
                        "label": o.label,
                        "id": o.id,
                        "bias": o.bias,
                        "default": o.default,
                    })
                })
                .collect();
            cx.json(StatusCode::OK, reply_result(json!(list)))
        }
        ApiCall::Poll => match connected(&session) {
            Some(connection) => match connection.poll().await {
                PollOutcome::Events(events) => {
                    cx.json(StatusCode::OK, reply_result(json!(events)))
                }
                PollOutcome::Timeout => cx.json(
                    StatusCode::REQUEST_TIMEOUT,
                    reply_err(&ApiError::unknown("poll timeout")),
                ),
                PollOutcome::Killed => cx.json(
                    StatusCode::REQUEST_TIMEOUT,
                    reply_err(&ApiError::unknown("connection closed")),
                ),
            },
            None => session_required(&mut cx),
        },
        ApiCall::Logout => match connected(&session) {
            Some(connection) => {
                // revoke first so the liveness observer sees the session
                // already unbound and keeps the id usable
                if let Some(session) = &session {
                    WEB_SERVICE.sessions.revoke(&session.id);
                }
                connection.stop();
                cx.json(StatusCode::OK, reply_ok())
            }
            None => session_required(&mut cx),
        },
        call => match connected(&session) {
            Some(connection) => match connection.api(call).await {
                Ok(Value::Null) => cx.json(StatusCode::OK, reply_ok()),
                Ok(result) => {
                    cx.json(StatusCode::OK, reply_result(result))
                }
                Err(e) => cx.json(StatusCode::OK, reply_err(&e)),
            },
            None => session_required(&mut cx),
        },
    }
}

fn connected(session: &Option<Session>) -> Option<crate::connection::ConnectionHandle> {
    session
        .as_ref()
        .and_then(|s| s.connection.clone())
        .filter(|c| c.is_alive())
}

fn session_required(cx: &mut ReplyCx) -> Response {
    cx.json(
        StatusCode::FORBIDDEN,
        reply_err(&ApiError::new(
            ErrCode::BadCookie,
            "this path needs a logged-in session",
        )),
    )
}

async fn check_cookie(session: Option<Session>, cx: &mut ReplyCx) -> Response {
    let Some(session) = session else {
        let id = WEB_SERVICE.sessions.issue_session();
        cx.set_session_cookie(&id);
        return cx.json(
            StatusCode::OK,
            reply_err(&ApiError::new(ErrCode::BadCookie, "unknown cookie")),
        );
    };
    let Some(connection) = session.connection.filter(|c| c.is_alive()) else {
        return cx.json(
            StatusCode::OK,
            reply_err(&ApiError::new(ErrCode::NoAgent, "not logged in")),
        );
    };
    match connection.dump_agent().await {
        Some(snapshot) => match serde_json::to_value(&snapshot) {
            Ok(result) => cx.json(StatusCode::OK, reply_result(result)),
            Err(e) => cx.json(
                StatusCode::OK,
                reply_err(&ApiError::unknown(&format!("{e}"))),
            ),
        },
        None => cx.json(
            StatusCode::OK,
            reply_err(&ApiError::new(ErrCode::NoAgent, "not logged in")),
        ),
    }
}

fn get_salt(session: Option<Session>, cx: &mut ReplyCx) -> Response {
    let session_id = match session {
        Some(session) => session.id,
        None => {
            let id = WEB_SERVICE.sessions.issue_session();
            cx.set_session_cookie(&id);
            id
        }
    };
    let salt = match WEB_SERVICE.sessions.bind_salt(&session_id) {
        Some(salt) => salt,
        None => {
            // the entry vanished between lookup and bind; start over
            let id = WEB_SERVICE.sessions.issue_session();
            cx.set_session_cookie(&id);
            match WEB_SERVICE.sessions.bind_salt(&id) {
                Some(salt) => salt,
                None => {
                    return cx.json(
                        StatusCode::OK,
                        reply_err(&ApiError::unknown("session churn")),
                    )
                }
            }
        }
    };
    let (e, n) = match WEB_SERVICE.keys.public_parts() {
        Ok(parts) => parts,
        Err(err) => {
            return cx.json(
                StatusCode::OK,
                reply_err(&ApiError::unknown(&format!("{err:#}"))),
            )
        }
    };
    cx.json(
        StatusCode::OK,
        reply_result(json!({
            "salt": salt,
            "pubkey": { "E": e, "N": n },
        })),
    )
}

/// Decrypt and verify one login attempt against the auth store. The
/// plaintext must carry the session salt as prefix.
pub async fn authenticate_cipher(
    keys: &RsaKeys,
    db: &Database,
    salt: &str,
    username: &str,
    ciphertext: &str,
) -> Result<Agent, ApiError> {
    let plaintext = keys.decrypt_hex(ciphertext).map_err(|e| {
        ApiError::new(ErrCode::DecryptFailed, &format!("{e:#}"))
    })?;
    let password = plaintext.strip_prefix(salt).ok_or_else(|| {
        ApiError::new(ErrCode::NoSalt, "decrypted password has no salt prefix")
    })?;
    db.authenticate(username, password)
        .await
        .ok_or_else(|| ApiError::new(ErrCode::AuthFailed, "authentication denied"))
}

async fn login(
    session: Option<Session>,
    username: &str,
    ciphertext: &str,
    opts: &LoginOpts,
    cx: &mut ReplyCx,
) -> Response {
    let Some(session) = session else {
        let id = WEB_SERVICE.sessions.issue_session();
        cx.set_session_cookie(&id);
        return cx.json(
            StatusCode::OK,
            reply_err(&ApiError::new(ErrCode::BadCookie, "unknown cookie")),
        );
    };
    let Some(salt) = session.salt.clone() else {
        return cx.json(
            StatusCode::OK,
            reply_err(&ApiError::new(
                ErrCode::NoSalt,
                "get_salt must precede login",
            )),
        );
    };

    let agent = match authenticate_cipher(
        &WEB_SERVICE.keys,
        &WEB_SERVICE.db,
        &salt,
        username,
        ciphertext,
    )
    .await
    {
        Ok(agent) => agent,
        Err(e) => return cx.json(StatusCode::OK, reply_err(&e)),
    };

    let spec = match opts.resolve(username) {
        Ok(spec) => spec,
        Err(e) => return cx.json(StatusCode::OK, reply_err(&e)),
    };
    let ring_path = opts.ring_path(agent.default_ring_path);

    let config = &WEB_SERVICE.config;
    let handle = ConnectionWorker::start(
        agent.profile_view(),
        WEB_SERVICE.event_manager.clone(),
        WEB_SERVICE.queues(),
        WEB_SERVICE.db.clone(),
        Duration::from_secs(config.idle_timeout),
        Duration::from_secs(config.poll_timeout),
    );
    handle.set_endpoint(spec, ring_path);

    if !WEB_SERVICE
        .sessions
        .bind_connection(&session.id, &salt, handle.clone())
    {
        handle.stop();
        return cx.json(
            StatusCode::OK,
            reply_err(&ApiError::new(
                ErrCode::NoSalt,
                "salt changed during login",
            )),
        );
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    info!(agent = %agent.login, session = %session.id, "agent logged in");
    cx.json(
        StatusCode::OK,
        reply_result(json!({
            "profile": agent.profile,
            "statetime": now,
            "timestamp": now,
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use copperline_db::api::AgentSeed;
    use copperline_db::models::{RingPath, SecurityLevel};

    fn test_db() -> Database {
        Database::new(StoreSeed {
            agents: vec![AgentSeed {
                login: "alice".to_string(),
                password: "secret".to_string(),
                profile: None,
                skills: Vec::new(),
                security_level: SecurityLevel::Agent,
                ring_path: RingPath::Inband,
            }],
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn login_handshake_ladder() {
        let keys = RsaKeys::generate().unwrap();
        let db = test_db();
        let salt = "12345678";

        // happy path
        let cipher = keys.encrypt_hex(&format!("{salt}secret")).unwrap();
        let agent = authenticate_cipher(&keys, &db, salt, "alice", &cipher)
            .await
            .unwrap();
        assert_eq!(agent.login, "alice");

        // wrong password
        let cipher = keys.encrypt_hex(&format!("{salt}wrong")).unwrap();
        let err = authenticate_cipher(&keys, &db, salt, "alice", &cipher)
            .await
            .unwrap_err();
        assert_eq!(err.errcode, ErrCode::AuthFailed);

        // plaintext missing the salt prefix
        let cipher = keys.encrypt_hex("99999999secret").unwrap();
        let err = authenticate_cipher(&keys, &db, salt, "alice", &cipher)
            .await
            .unwrap_err();
        assert_eq!(err.errcode, ErrCode::NoSalt);

        // malformed ciphertext
        let err = authenticate_cipher(&keys, &db, salt, "alice", "feedface")
            .await
            .unwrap_err();
        assert_eq!(err.errcode, ErrCode::DecryptFailed);
    }

    #[tokio::test]
    async fn lang_negotiation_prefers_available_then_prefix() {
        let root = std::env::temp_dir()
            .join(format!("copperline-test-{}", copperline_utils::uuid()));
        let nls = root.join("agent/application/nls");
        std::fs::create_dir_all(nls.join("en")).unwrap();
        std::fs::create_dir_all(nls.join("de")).unwrap();
        std::fs::write(nls.join("en/labels.js"), "{}").unwrap();
        std::fs::write(nls.join("de/labels.js"), "{}").unwrap();
        let root = root.to_string_lossy().to_string();

        assert_eq!(negotiate_lang(Some("de-DE,en;q=0.5"), &root).await, "de");
        assert_eq!(negotiate_lang(Some("fr-FR"), &root).await, "en");
        assert_eq!(negotiate_lang(None, &root).await, "en");
        assert_eq!(
            negotiate_lang(Some("sv;q=0.3,en-GB;q=0.8"), &root).await,
            "en"
        );
    }

    #[tokio::test]
    async fn static_resolution_walks_agent_then_contrib() {
        let root = std::env::temp_dir()
            .join(format!("copperline-test-{}", copperline_utils::uuid()));
        std::fs::create_dir_all(root.join("agent")).unwrap();
        std::fs::create_dir_all(root.join("contrib")).unwrap();
        std::fs::write(root.join("agent/index.html"), "<html>").unwrap();
        std::fs::write(root.join("contrib/lib.js"), "//").unwrap();
        let root = root.to_string_lossy().to_string();

        let index = resolve_static(&root, None, "/").await.unwrap();
        assert!(index.ends_with("agent/index.html"));
        let lib = resolve_static(&root, None, "/lib.js").await.unwrap();
        assert!(lib.ends_with("contrib/lib.js"));
        assert!(resolve_static(&root, None, "/missing.js").await.is_none());
        assert!(resolve_static(&root, None, "/../etc/passwd").await.is_none());
        assert!(resolve_static(&root, None, "/dynamic/x.js").await.is_none());
    }

    #[test]
    fn reply_shapes() {
        assert_eq!(reply_ok(), json!({"success": true}));
        assert_eq!(
            reply_result(json!(7)),
            json!({"success": true, "result": 7})
        );
        let err = ApiError::new(ErrCode::AuthFailed, "denied");
        assert_eq!(
            reply_err(&err),
            json!({
                "success": false,
                "message": "denied",
                "errcode": "AUTH_FAILED",
            })
        );
    }

    #[test]
    fn content_types() {
        assert_eq!(content_type_for("index.html"), "text/html");
        assert_eq!(content_type_for("app.js"), "application/javascript");
        assert_eq!(content_type_for("unknown.bin"), "application/octet-stream");
    }

    async fn body_json(response: Response) -> Value {
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn set_cookies(response: &Response) -> Vec<String> {
        response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .collect()
    }

    /// Full front-door walk: first hit issues cookies, login without a
    /// salt is refused, a salted login with the wrong password is denied,
    /// and the real credentials produce a bound connection.
    #[tokio::test]
    async fn cookie_salt_and_login_flow() {
        let dir = std::env::temp_dir()
            .join(format!("copperline-conf-{}", copperline_utils::uuid()));
        std::fs::create_dir_all(&dir).unwrap();
        let conf = dir.join("copperline.conf");
        std::fs::write(
            &conf,
            format!(
                "key_path = \"{}\"\n\n[[store.agents]]\nlogin = \"alice\"\npassword = \"secret\"\n",
                dir.join("key").display()
            ),
        )
        .unwrap();
        std::env::set_var("COPPERLINE_CONF", conf.to_string_lossy().to_string());

        // first hit with no cookie: fresh cpx_id and cpx_lang
        let response =
            dispatch_call(Ok(ApiCall::CheckCookie), &HeaderMap::new()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let cookies = set_cookies(&response);
        assert!(cookies.iter().any(|c| c.starts_with("cpx_id=")));
        assert!(cookies.iter().any(|c| c.starts_with("cpx_lang=en")));
        let cookie = cookies
            .iter()
            .find(|c| c.starts_with("cpx_id="))
            .unwrap()
            .split(';')
            .next()
            .unwrap()
            .to_string();
        let body = body_json(response).await;
        assert_eq!(body["success"], json!(false));
        assert_eq!(body["errcode"], json!("BAD_COOKIE"));

        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, cookie.parse().unwrap());

        // login before get_salt is refused
        let login = |password: String| ApiCall::Login {
            username: "alice".to_string(),
            password,
            opts: LoginOpts::default(),
        };
        let response =
            dispatch_call(Ok(login("feedface".to_string())), &headers).await;
        let body = body_json(response).await;
        assert_eq!(body["errcode"], json!("NO_SALT"));

        // get_salt hands out the salt and pubkey
        let response = dispatch_call(Ok(ApiCall::GetSalt), &headers).await;
        let body = body_json(response).await;
        assert_eq!(body["success"], json!(true));
        let salt = body["result"]["salt"].as_str().unwrap().to_string();
        assert!(body["result"]["pubkey"]["N"].as_str().is_some());

        // wrong password, correctly salted
        let cipher = WEB_SERVICE
            .keys
            .encrypt_hex(&format!("{salt}wrong"))
            .unwrap();
        let response = dispatch_call(Ok(login(cipher)), &headers).await;
        let body = body_json(response).await;
        assert_eq!(body["errcode"], json!("AUTH_FAILED"));

        // the salt survives a failed attempt; real credentials bind
        let cipher = WEB_SERVICE
            .keys
            .encrypt_hex(&format!("{salt}secret"))
            .unwrap();
        let response = dispatch_call(Ok(login(cipher)), &headers).await;
        let body = body_json(response).await;
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["result"]["profile"], json!("Default"));

        // the cookie now identifies a logged-in agent
        let response = dispatch_call(Ok(ApiCall::CheckCookie), &headers).await;
        let body = body_json(response).await;
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["result"]["login"], json!("alice"));
        assert_eq!(body["result"]["state"], json!("available"));
    }
}
