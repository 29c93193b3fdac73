use super::parsing::{
    env_optional, env_or_default, is_supported_sheet_extension, parse_bool, parse_cors_origins,
    parse_engine_kind, parse_environment, parse_string_list, parse_u16, parse_u32, parse_u64,
    parse_usize,
};
use super::types::{
    ApiSettings, ConfigError, CorsSettings, DatabaseSettings, EngineKind, GradingSettings,
    PipelineSettings, RuntimeSettings, S3Settings, SecuritySettings, ServerHost, ServerPort,
    ServerSettings, Settings, StorageSettings, TelemetrySettings,
};

impl Settings {
    pub(crate) fn load() -> Result<Self, ConfigError> {
        let host = env_or_default("EDUGRADE_HOST", "0.0.0.0");
        let port = env_or_default("EDUGRADE_PORT", "8000");

        let environment =
            parse_environment(env_optional("EDUGRADE_ENV").or_else(|| env_optional("ENVIRONMENT")));
        let strict_config =
            env_optional("EDUGRADE_STRICT_CONFIG").map(|value| parse_bool(&value)).unwrap_or(false)
                || environment.is_production();

        let project_name = env_or_default("PROJECT_NAME", "EduGrade API");
        let version = env_or_default("VERSION", env!("CARGO_PKG_VERSION"));
        let api_v1_str = env_or_default("API_V1_STR", "/api/v1");

        let secret_key = env_or_default("SECRET_KEY", "edugrade-dev-secret");
        let access_token_expire_minutes = parse_u64(
            "ACCESS_TOKEN_EXPIRE_MINUTES",
            env_or_default("ACCESS_TOKEN_EXPIRE_MINUTES", "10080"),
        )?;
        let algorithm = env_or_default("ALGORITHM", "HS256");

        let cors_origins = parse_cors_origins(env_optional("BACKEND_CORS_ORIGINS"))?;

        let postgres_server = env_or_default("POSTGRES_SERVER", "localhost");
        let postgres_port = parse_u16("POSTGRES_PORT", env_or_default("POSTGRES_PORT", "5432"))?;
        let postgres_user = env_or_default("POSTGRES_USER", "edugradesuperuser");
        let postgres_password = env_or_default("POSTGRES_PASSWORD", "");
        let postgres_db = env_or_default("POSTGRES_DB", "edugrade_db");
        let database_url = env_optional("DATABASE_URL");

        let engine = parse_engine_kind(env_optional("GRADING_ENGINE"))?;
        let openai_api_key = env_or_default("OPENAI_API_KEY", "");
        let openai_base_url = env_or_default("OPENAI_BASE_URL", "");
        let model = env_or_default("AI_MODEL", "gpt-4o");
        let max_tokens = parse_u32("AI_MAX_TOKENS", env_or_default("AI_MAX_TOKENS", "4000"))?;
        let stub_delay_ms =
            parse_u64("STUB_ENGINE_DELAY_MS", env_or_default("STUB_ENGINE_DELAY_MS", "3000"))?;

        let max_processing_seconds = parse_u64(
            "MAX_PROCESSING_SECONDS",
            env_or_default("MAX_PROCESSING_SECONDS", "600"),
        )?;
        let worker_concurrency = parse_usize(
            "GRADING_WORKER_CONCURRENCY",
            env_or_default("GRADING_WORKER_CONCURRENCY", "3"),
        )?;
        let analytics_max_retries = parse_u32(
            "ANALYTICS_MAX_RETRIES",
            env_or_default("ANALYTICS_MAX_RETRIES", "5"),
        )?;
        let analytics_retry_backoff_ms = parse_u64(
            "ANALYTICS_RETRY_BACKOFF_MS",
            env_or_default("ANALYTICS_RETRY_BACKOFF_MS", "50"),
        )?;
        let analytics_track_failures = env_optional("ANALYTICS_TRACK_FAILURES")
            .map(|value| parse_bool(&value))
            .unwrap_or(false);

        let max_upload_size_mb =
            parse_u64("MAX_UPLOAD_SIZE_MB", env_or_default("MAX_UPLOAD_SIZE_MB", "10"))?;
        let allowed_sheet_extensions = parse_string_list(
            env_optional("ALLOWED_SHEET_EXTENSIONS"),
            &["jpg", "jpeg", "png", "pdf"],
        );

        let s3_endpoint = env_or_default("S3_ENDPOINT", "https://storage.yandexcloud.net");
        let s3_access_key = env_or_default("S3_ACCESS_KEY", "");
        let s3_secret_key = env_or_default("S3_SECRET_KEY", "");
        let s3_bucket = env_or_default("S3_BUCKET", "edugrade-answer-sheets");
        let s3_region = env_or_default("S3_REGION", "ru-central1");

        let log_level = env_or_default("EDUGRADE_LOG_LEVEL", "info");
        let json = env_optional("EDUGRADE_LOG_JSON").map(|value| parse_bool(&value)).unwrap_or(false);
        let prometheus_enabled =
            env_optional("PROMETHEUS_ENABLED").map(|value| parse_bool(&value)).unwrap_or(false);

        let settings = Self {
            server: ServerSettings {
                host: ServerHost::parse(host)?,
                port: ServerPort::parse(port)?,
            },
            runtime: RuntimeSettings { environment, strict_config },
            api: ApiSettings { project_name, version, api_v1_str },
            security: SecuritySettings { secret_key, access_token_expire_minutes, algorithm },
            cors: CorsSettings { origins: cors_origins },
            database: DatabaseSettings {
                postgres_server,
                postgres_port,
                postgres_user,
                postgres_password,
                postgres_db,
                database_url,
            },
            grading: GradingSettings {
                engine,
                openai_api_key,
                openai_base_url,
                model,
                max_tokens,
                stub_delay_ms,
            },
            pipeline: PipelineSettings {
                max_processing_seconds,
                worker_concurrency,
                analytics_max_retries,
                analytics_retry_backoff_ms,
                analytics_track_failures,
            },
            storage: StorageSettings { max_upload_size_mb, allowed_sheet_extensions },
            s3: S3Settings {
                endpoint: s3_endpoint,
                access_key: s3_access_key,
                secret_key: s3_secret_key,
                bucket: s3_bucket,
                region: s3_region,
            },
            telemetry: TelemetrySettings { log_level, json, prometheus_enabled },
        };

        settings.validate()?;
        Ok(settings)
    }

    pub(crate) fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host.0, self.server.port.0)
    }

    pub(crate) fn server_host(&self) -> &str {
        &self.server.host.0
    }

    pub(crate) fn server_port(&self) -> u16 {
        self.server.port.0
    }

    pub(crate) fn api(&self) -> &ApiSettings {
        &self.api
    }

    pub(crate) fn security(&self) -> &SecuritySettings {
        &self.security
    }

    pub(crate) fn cors(&self) -> &CorsSettings {
        &self.cors
    }

    pub(crate) fn database(&self) -> &DatabaseSettings {
        &self.database
    }

    pub(crate) fn grading(&self) -> &GradingSettings {
        &self.grading
    }

    pub(crate) fn pipeline(&self) -> &PipelineSettings {
        &self.pipeline
    }

    pub(crate) fn storage(&self) -> &StorageSettings {
        &self.storage
    }

    pub(crate) fn s3(&self) -> &S3Settings {
        &self.s3
    }

    pub(crate) fn telemetry(&self) -> &TelemetrySettings {
        &self.telemetry
    }

    pub(crate) fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.allowed_sheet_extensions.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "ALLOWED_SHEET_EXTENSIONS",
                value: String::from("<empty>"),
            });
        }

        for extension in &self.storage.allowed_sheet_extensions {
            if !is_supported_sheet_extension(extension) {
                return Err(ConfigError::InvalidValue {
                    field: "ALLOWED_SHEET_EXTENSIONS",
                    value: extension.clone(),
                });
            }
        }

        if self.pipeline.max_processing_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "MAX_PROCESSING_SECONDS",
                value: "0".to_string(),
            });
        }

        if self.pipeline.worker_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "GRADING_WORKER_CONCURRENCY",
                value: "0".to_string(),
            });
        }

        if !(self.runtime.strict_config || self.runtime.environment.is_production()) {
            return Ok(());
        }

        if self.security.secret_key == "edugrade-dev-secret" {
            return Err(ConfigError::MissingSecret("SECRET_KEY"));
        }
        if self.database.database_url.is_none() && self.database.postgres_password.is_empty() {
            return Err(ConfigError::MissingSecret("POSTGRES_PASSWORD"));
        }
        if self.s3.access_key.is_empty() || self.s3.secret_key.is_empty() {
            return Err(ConfigError::MissingSecret("S3_ACCESS_KEY/S3_SECRET_KEY"));
        }
        if self.grading.engine == EngineKind::OpenAi {
            if self.grading.openai_api_key.is_empty() {
                return Err(ConfigError::MissingSecret("OPENAI_API_KEY"));
            }
            if self.grading.openai_base_url.is_empty() {
                return Err(ConfigError::MissingSecret("OPENAI_BASE_URL"));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Settings;
    use crate::test_support;

    #[tokio::test]
    async fn load_defaults_in_test_env() {
        let _guard = test_support::env_lock().await;
        test_support::set_test_env();

        let settings = Settings::load().expect("settings");
        assert_eq!(settings.pipeline().worker_concurrency, 3);
        assert_eq!(settings.storage().max_upload_size_mb, 10);
        assert!(settings
            .storage()
            .allowed_sheet_extensions
            .iter()
            .any(|extension| extension == "pdf"));
    }

    #[tokio::test]
    async fn strict_mode_requires_real_secret() {
        let _guard = test_support::env_lock().await;
        test_support::set_test_env();
        std::env::set_var("EDUGRADE_STRICT_CONFIG", "1");
        std::env::remove_var("SECRET_KEY");

        assert!(Settings::load().is_err());

        std::env::set_var("EDUGRADE_STRICT_CONFIG", "0");
    }
}
