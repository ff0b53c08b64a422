use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    io::AsyncWriteExt,
    net::TcpListener,
    process::Command,
    sync::Mutex,
    time::{Duration, timeout},
};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Clone)]
struct AppState {
    request_log: Arc<RequestLog>,
    proxy: Option<String>,
    server_cookies_file: PathBuf,
}

const YT_DLP_TIMEOUT_SECONDS: u64 = 15;
const RESOLVER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64)";
const DEFAULT_COOKIES_FILE: &str = "/cookies/youtube.txt";
const COOKIE_JAR_DOMAIN: &str = ".youtube.com";
const COOKIE_JAR_EXPIRY: i64 = 2_147_483_647;

#[derive(Debug, Serialize, Clone, Copy)]
#[serde(rename_all = "lowercase")]
enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    fn format_selector(self) -> &'static str {
        match self {
            MediaKind::Audio => "bestaudio",
            MediaKind::Video => "bestvideo[height<=1080]",
        }
    }

    fn quality(self) -> Option<&'static str> {
        match self {
            MediaKind::Audio => None,
            MediaKind::Video => Some("1080p"),
        }
    }

    fn note(self) -> &'static str {
        match self {
            MediaKind::Audio => "Link expira em alguns minutos",
            MediaKind::Video => "Sem áudio",
        }
    }

    fn label(self) -> &'static str {
        match self {
            MediaKind::Audio => "áudio",
            MediaKind::Video => "vídeo",
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    cookies: Option<String>,
}

#[derive(Debug, Serialize)]
struct ResolveResponse {
    #[serde(rename = "type")]
    kind: MediaKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    quality: Option<&'static str>,
    url: String,
    note: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    details: Option<String>,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            details: None,
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            details: None,
        }
    }

    fn resolver_failure(details: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "Falha ao gerar link".to_string(),
            details: Some(details.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            details: self.details,
        });

        (self.status, body).into_response()
    }
}

struct RequestLog {
    file: Mutex<tokio::fs::File>,
}

impl RequestLog {
    async fn open() -> Result<Self, ApiError> {
        let name = format!("app-{}.log", Utc::now().format("%Y-%m-%d"));
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&name)
            .await
            .map_err(|error| {
                ApiError::internal(format!(
                    "Não foi possível abrir o arquivo de log {name}: {error}"
                ))
            })?;

        Ok(Self {
            file: Mutex::new(file),
        })
    }

    async fn info(&self, message: &str) {
        info!("{message}");
        self.append("INFO", message, None).await;
    }

    async fn debug(&self, message: &str) {
        debug!("{message}");
        self.append("DEBUG", message, None).await;
    }

    async fn warn(&self, message: &str) {
        warn!("{message}");
        self.append("WARN", message, None).await;
    }

    async fn error(&self, message: &str, details: Option<&str>) {
        match details {
            Some(details) => error!("{message}: {details}"),
            None => error!("{message}"),
        }
        self.append("ERROR", message, details).await;
    }

    // Falha de escrita no log nunca derruba o pedido que a originou.
    async fn append(&self, level: &str, message: &str, details: Option<&str>) {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut line = format!("[{timestamp}] {level}: {message}\n");
        if let Some(details) = details {
            line.push_str(&format!("    {details}\n"));
        }

        let mut file = self.file.lock().await;
        if let Err(error) = file.write_all(line.as_bytes()).await {
            warn!("Não foi possível escrever no arquivo de log: {error}");
        }
    }
}

struct TempCookieJar {
    path: PathBuf,
}

impl TempCookieJar {
    async fn write(document: &str) -> Result<Self, ApiError> {
        let path = std::env::temp_dir().join(format!("cookies-{}.txt", Uuid::new_v4()));
        tokio::fs::write(&path, document).await.map_err(|error| {
            ApiError::internal(format!(
                "Não foi possível criar o arquivo temporário de cookies: {error}"
            ))
        })?;

        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn remove(self) {
        if let Err(error) = tokio::fs::remove_file(&self.path).await
            && error.kind() != ErrorKind::NotFound
        {
            warn!(
                "Não foi possível remover o arquivo temporário de cookies {:?}: {error}",
                self.path
            );
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "media_resolver=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Erro no servidor: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let request_log = Arc::new(RequestLog::open().await?);

    let proxy = std::env::var("PROXY")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string));
    let server_cookies_file = std::env::var("COOKIES_FILE")
        .ok()
        .and_then(|value| non_empty(&value).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_COOKIES_FILE));

    if let Some(proxy) = &proxy {
        request_log
            .info(&format!("Proxy de saída configurado: {proxy}"))
            .await;
    }
    if tokio::fs::try_exists(&server_cookies_file)
        .await
        .unwrap_or(false)
    {
        request_log
            .info(&format!(
                "Arquivo de cookies do servidor encontrado em {}",
                server_cookies_file.display()
            ))
            .await;
    } else {
        request_log
            .warn(&format!(
                "Arquivo de cookies do servidor ausente em {}; o yt-dlp rodará sem cookies quando o cliente não os enviar",
                server_cookies_file.display()
            ))
            .await;
    }

    let state = AppState {
        request_log,
        proxy,
        server_cookies_file,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/audio", get(resolve_audio_query).post(resolve_audio_body))
        .route("/video", get(resolve_video_query).post(resolve_video_body))
        .with_state(state.clone())
        .layer(cors);

    let addr = resolve_bind_addr();
    let listener = TcpListener::bind(&addr).await.map_err(|error| {
        ApiError::internal(format!("Não foi possível iniciar na porta {addr}: {error}"))
    })?;

    state
        .request_log
        .info(&format!("API rodando em http://{addr}"))
        .await;

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("Erro do servidor HTTP: {error}")))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn resolve_audio_query(
    State(state): State<AppState>,
    Query(request): Query<ResolveRequest>,
) -> Result<Json<ResolveResponse>, ApiError> {
    resolve_media(state, MediaKind::Audio, request).await
}

async fn resolve_audio_body(
    State(state): State<AppState>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<ResolveResponse>, ApiError> {
    resolve_media(state, MediaKind::Audio, request).await
}

async fn resolve_video_query(
    State(state): State<AppState>,
    Query(request): Query<ResolveRequest>,
) -> Result<Json<ResolveResponse>, ApiError> {
    resolve_media(state, MediaKind::Video, request).await
}

async fn resolve_video_body(
    State(state): State<AppState>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<ResolveResponse>, ApiError> {
    resolve_media(state, MediaKind::Video, request).await
}

async fn resolve_media(
    state: AppState,
    kind: MediaKind,
    request: ResolveRequest,
) -> Result<Json<ResolveResponse>, ApiError> {
    let log = &state.request_log;

    let url = match required_url(&request) {
        Ok(url) => url,
        Err(error) => {
            log.warn(&format!("Pedido de {} recusado: URL ausente", kind.label()))
                .await;
            return Err(error);
        }
    };

    log.info(&format!("Pedido de {} recebido: {url}", kind.label()))
        .await;

    let client_jar = match request.cookies.as_deref().and_then(cookie_jar_document) {
        Some(document) => Some(TempCookieJar::write(&document).await?),
        None => None,
    };

    let cookies_file = match &client_jar {
        Some(jar) => Some(jar.path().to_path_buf()),
        None => {
            if tokio::fs::try_exists(&state.server_cookies_file)
                .await
                .unwrap_or(false)
            {
                Some(state.server_cookies_file.clone())
            } else {
                None
            }
        }
    };

    let args = build_resolver_args(kind, url, cookies_file.as_deref(), state.proxy.as_deref());
    log.debug(&format!("Executando yt-dlp com argumentos {args:?}"))
        .await;

    let result = run_yt_dlp(args).await;

    // O jar temporário pertence a este pedido; some assim que o subprocesso termina.
    if let Some(jar) = client_jar {
        jar.remove().await;
    }

    match result {
        Ok(link) => {
            log.info(&format!("Link de {} gerado para {url}", kind.label()))
                .await;

            Ok(Json(ResolveResponse {
                kind,
                quality: kind.quality(),
                url: link,
                note: kind.note(),
            }))
        }
        Err(error) => {
            log.error(
                &format!("Falha ao gerar link de {} para {url}", kind.label()),
                error.details.as_deref(),
            )
            .await;

            Err(error)
        }
    }
}

fn required_url(request: &ResolveRequest) -> Result<&str, ApiError> {
    request
        .url
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::bad_request("URL obrigatória"))
}

fn build_resolver_args(
    kind: MediaKind,
    url: &str,
    cookies_file: Option<&Path>,
    proxy: Option<&str>,
) -> Vec<String> {
    let mut args = vec!["--user-agent".to_string(), RESOLVER_USER_AGENT.to_string()];

    if let Some(path) = cookies_file {
        args.push("--cookies".to_string());
        args.push(path.to_string_lossy().into_owned());
    }

    if let Some(proxy) = proxy {
        args.push("--proxy".to_string());
        args.push(proxy.to_string());
    }

    if url.contains("youtube") {
        args.push("-f".to_string());
        args.push(kind.format_selector().to_string());
        args.push("-g".to_string());
    }

    args.push(url.to_string());
    args
}

async fn run_yt_dlp(args: Vec<String>) -> Result<String, ApiError> {
    let command_future = Command::new("yt-dlp").args(args).kill_on_drop(true).output();
    let output = timeout(Duration::from_secs(YT_DLP_TIMEOUT_SECONDS), command_future)
        .await
        .map_err(|_| {
            ApiError::resolver_failure(format!(
                "yt-dlp excedeu o tempo limite de {YT_DLP_TIMEOUT_SECONDS} segundos"
            ))
        })?
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                ApiError::resolver_failure(
                    "yt-dlp não está instalado no sistema. Instale o yt-dlp e reinicie o servidor.",
                )
            } else {
                ApiError::resolver_failure(format!("Não foi possível executar yt-dlp: {error}"))
            }
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let details = if stderr.is_empty() {
            format!("yt-dlp terminou com {}", output.status)
        } else {
            stderr
        };
        return Err(ApiError::resolver_failure(details));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn cookie_jar_document(raw: &str) -> Option<String> {
    if raw.trim().is_empty() {
        return None;
    }

    let mut document = String::from(
        "# Netscape HTTP Cookie File\n\
         # https://curl.haxx.se/rfc/cookie_spec.html\n\
         # Gerado a partir dos cookies enviados pelo cliente.\n",
    );

    let mut records = 0;
    for pair in raw.split(';') {
        let pair = pair.trim();
        let (name, value) = match pair.split_once('=') {
            Some((name, value)) => (name.trim(), value.trim()),
            None => (pair, ""),
        };

        if name.is_empty() && value.is_empty() {
            continue;
        }

        document.push_str(&format!(
            "{COOKIE_JAR_DOMAIN}\tTRUE\t/\tTRUE\t{COOKIE_JAR_EXPIRY}\t{name}\t{value}\n"
        ));
        records += 1;
    }

    (records > 0).then_some(document)
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    "0.0.0.0:8080".to_string()
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_lines(document: &str) -> Vec<&str> {
        document
            .lines()
            .filter(|line| !line.starts_with('#'))
            .collect()
    }

    #[test]
    fn audio_args_for_youtube_use_format_selector() {
        let args = build_resolver_args(
            MediaKind::Audio,
            "https://www.youtube.com/watch?v=abc",
            None,
            None,
        );
        assert_eq!(
            args,
            vec![
                "--user-agent",
                RESOLVER_USER_AGENT,
                "-f",
                "bestaudio",
                "-g",
                "https://www.youtube.com/watch?v=abc",
            ]
        );
    }

    #[test]
    fn video_args_for_youtube_cap_height() {
        let args = build_resolver_args(
            MediaKind::Video,
            "https://youtube.com/watch?v=abc",
            None,
            None,
        );
        assert!(args.contains(&"bestvideo[height<=1080]".to_string()));
        assert!(args.contains(&"-g".to_string()));
    }

    #[test]
    fn args_for_other_sites_skip_format_selector() {
        let args = build_resolver_args(MediaKind::Audio, "https://vimeo.com/123", None, None);
        assert_eq!(
            args,
            vec!["--user-agent", RESOLVER_USER_AGENT, "https://vimeo.com/123"]
        );
    }

    #[test]
    fn cookies_and_proxy_args_precede_the_url() {
        let args = build_resolver_args(
            MediaKind::Video,
            "https://youtube.com/watch?v=abc",
            Some(Path::new("/tmp/jar.txt")),
            Some("http://proxy:3128"),
        );
        assert_eq!(
            args,
            vec![
                "--user-agent",
                RESOLVER_USER_AGENT,
                "--cookies",
                "/tmp/jar.txt",
                "--proxy",
                "http://proxy:3128",
                "-f",
                "bestvideo[height<=1080]",
                "-g",
                "https://youtube.com/watch?v=abc",
            ]
        );
    }

    #[test]
    fn cookie_jar_document_writes_one_record_per_pair() {
        let document = cookie_jar_document("a=1; b=2").unwrap();
        assert_eq!(
            record_lines(&document),
            vec![
                ".youtube.com\tTRUE\t/\tTRUE\t2147483647\ta\t1",
                ".youtube.com\tTRUE\t/\tTRUE\t2147483647\tb\t2",
            ]
        );
    }

    #[test]
    fn cookie_jar_document_has_three_comment_lines() {
        let document = cookie_jar_document("a=1").unwrap();
        let preamble = document
            .lines()
            .take_while(|line| line.starts_with('#'))
            .count();
        assert_eq!(preamble, 3);
    }

    #[test]
    fn cookie_jar_document_rejects_empty_input() {
        assert!(cookie_jar_document("").is_none());
        assert!(cookie_jar_document("   ").is_none());
    }

    #[test]
    fn cookie_jar_document_skips_blank_pairs() {
        let document = cookie_jar_document("a=1; ; b=2;").unwrap();
        assert_eq!(record_lines(&document).len(), 2);
        assert!(cookie_jar_document("; ;").is_none());
    }

    #[test]
    fn cookie_jar_document_keeps_pairs_missing_only_a_value() {
        let document = cookie_jar_document("SIDCC=").unwrap();
        assert_eq!(
            record_lines(&document),
            vec![".youtube.com\tTRUE\t/\tTRUE\t2147483647\tSIDCC\t"]
        );
    }

    #[test]
    fn missing_url_is_rejected_before_any_dispatch() {
        let request = ResolveRequest {
            url: None,
            cookies: None,
        };
        let error = required_url(&request).unwrap_err();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert_eq!(error.message, "URL obrigatória");

        let request = ResolveRequest {
            url: Some("   ".to_string()),
            cookies: None,
        };
        assert!(required_url(&request).is_err());
    }

    #[test]
    fn quality_is_reported_only_for_video() {
        let audio = serde_json::to_value(ResolveResponse {
            kind: MediaKind::Audio,
            quality: MediaKind::Audio.quality(),
            url: "https://cdn.example/a".to_string(),
            note: MediaKind::Audio.note(),
        })
        .unwrap();
        assert_eq!(audio["type"], "audio");
        assert!(audio.get("quality").is_none());
        assert_eq!(audio["note"], "Link expira em alguns minutos");

        let video = serde_json::to_value(ResolveResponse {
            kind: MediaKind::Video,
            quality: MediaKind::Video.quality(),
            url: "https://cdn.example/v".to_string(),
            note: MediaKind::Video.note(),
        })
        .unwrap();
        assert_eq!(video["type"], "video");
        assert_eq!(video["quality"], "1080p");
        assert_eq!(video["note"], "Sem áudio");
    }

    #[test]
    fn resolver_failure_carries_details() {
        let error = ApiError::resolver_failure("ERROR: Unsupported URL");
        assert_eq!(error.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error.message, "Falha ao gerar link");
        assert_eq!(error.details.as_deref(), Some("ERROR: Unsupported URL"));
    }

    #[tokio::test]
    async fn temp_cookie_jar_is_removed_after_use() {
        let jar = TempCookieJar::write("# Netscape HTTP Cookie File\n")
            .await
            .unwrap();
        let path = jar.path().to_path_buf();
        assert!(tokio::fs::try_exists(&path).await.unwrap());

        jar.remove().await;
        assert!(!tokio::fs::try_exists(&path).await.unwrap());
    }

    #[tokio::test]
    async fn temp_cookie_jar_names_are_unique() {
        let first = TempCookieJar::write("a=1").await.unwrap();
        let second = TempCookieJar::write("a=1").await.unwrap();
        assert_ne!(first.path(), second.path());

        first.remove().await;
        second.remove().await;
    }
}
