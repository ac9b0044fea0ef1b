use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Hfs(#[from] hfsconv::Error),

    #[error("no HFS or HFS+ partition found in {0}")]
    NoHfsPartition(String),

    #[error("missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("unknown subcommand: {0}")]
    UnknownSubcommand(String),

    #[error("unrecognized text encoding: {0}")]
    UnknownEncoding(String),
}

pub type Result<T> = std::result::Result<T, CliError>;
