//! 엔진 에러 타입: 실패 종류별로 로그/종료/HTTP 응답 처리를 구분합니다.

use axum::http::StatusCode;
use switchyard_sdk::FailureStage;

/// Failures the engine distinguishes between.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("Failed to load settings from '{path}': {message}")]
    ConfigLoad { path: String, message: String },

    #[error("Module '{module}' failed during {stage}: {message}{}", render_causes(.causes))]
    ModuleInitialization {
        module: String,
        stage: FailureStage,
        message: String,
        causes: Vec<String>,
    },

    #[error("Cannot create directory '{path}': {source}")]
    DirectoryCreation {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot bind endpoint {addr}: {source}")]
    EndpointBind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Request to {url} from {remote} failed: {message}")]
    RequestHandling {
        url: String,
        remote: String,
        message: String,
    },

    #[error("Failed to dispose boundary #{boundary}: {message}")]
    Disposal { boundary: u64, message: String },

    #[error("No module is hooked to '{0}'")]
    NoModuleForUrl(String),

    #[error("Server could not start: {0}")]
    Startup(String),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

fn render_causes(causes: &[String]) -> String {
    causes.iter().map(|c| format!(": {}", c)).collect()
}

impl EngineError {
    pub fn module_init(module: &str, err: &switchyard_sdk::RemoteError) -> Self {
        Self::ModuleInitialization {
            module: module.to_string(),
            stage: err.stage,
            message: err.message.clone(),
            causes: err.causes.clone(),
        }
    }

    /// Engine-scoped failures abort the process; everything else stays local.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DirectoryCreation { .. } | Self::Startup(_))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NoModuleForUrl(_) => StatusCode::NOT_FOUND,
            Self::ModuleInitialization { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ConfigLoad { .. } => "CONFIG_LOAD",
            Self::ModuleInitialization { .. } => "MODULE_INITIALIZATION",
            Self::DirectoryCreation { .. } => "DIRECTORY_CREATION",
            Self::EndpointBind { .. } => "ENDPOINT_BIND",
            Self::RequestHandling { .. } => "REQUEST_HANDLING",
            Self::Disposal { .. } => "DISPOSAL",
            Self::NoModuleForUrl(_) => "NOT_FOUND",
            Self::Startup(_) => "STARTUP",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Client-facing body. Internal details stay in the log.
    pub fn to_json(&self) -> serde_json::Value {
        let message = match self {
            Self::NoModuleForUrl(_) => "Not Found",
            _ => "Internal Server Error",
        };
        serde_json::json!({
            "success": false,
            "error": message,
            "error_code": self.error_code(),
        })
    }
}

impl axum::response::IntoResponse for EngineError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(self.to_json());
        (status, body).into_response()
    }
}
