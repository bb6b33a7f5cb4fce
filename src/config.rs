pub use self::parser::{
    AuthConfig, BotConfig, Config, DatabaseConfig, DbType, LoggingConfig, RequestsConfig,
    SchedulerConfig, WebConfig,
};
pub use self::validator::ConfigError;

mod parser;
mod validator;
