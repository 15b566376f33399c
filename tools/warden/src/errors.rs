use thiserror::Error;

#[derive(Debug, Error)]
pub enum WardenError {
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("launch error: {0}")]
    Launch(String),
    #[error("process error: {0}")]
    Process(String),
    #[error("signal error: {0}")]
    Signal(String),
    #[error("illegal transition: {0}")]
    IllegalTransition(String),
}
