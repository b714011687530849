//! CLI error handling with user-facing messages and exit codes.

use slidepipe_lib::CoreError;

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    #[error("{failed} of {total} conversions did not complete")]
    ConversionsFailed { failed: usize, total: usize },

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            CliError::Config(_) => 2,
            CliError::ConversionsFailed { .. } => 3,
            CliError::Core(error) => core_exit_code(error),
            CliError::LoggingInit(_) => 1,
        }
    }

    /// Extra guidance printed after the error line
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            CliError::Core(error) => core_hint(error),
            CliError::Config(_) => {
                Some("Run `slidepipe init-config` to write a default settings file.")
            }
            _ => None,
        }
    }
}

fn core_exit_code(error: &CoreError) -> u8 {
    match error {
        CoreError::InvalidSettings(_) => 2,
        CoreError::WatchRootMissing(_) => 4,
        _ => 1,
    }
}

fn core_hint(error: &CoreError) -> Option<&'static str> {
    match error {
        CoreError::WatchRootMissing(_) => {
            Some("Create the directory or pass --watch-root to point at an existing one.")
        }
        CoreError::InvalidSettings(_) => {
            Some("Output root and work directory must differ from the watch root.")
        }
        _ => None,
    }
}

/// Prints an error reaching `main` and maps it to an exit code.
pub fn report(error: &anyhow::Error) -> u8 {
    eprintln!("Error: {:#}", error);

    let (code, hint) = if let Some(cli_error) = error.downcast_ref::<CliError>() {
        (cli_error.exit_code(), cli_error.hint())
    } else if let Some(core_error) = error.downcast_ref::<CoreError>() {
        (core_exit_code(core_error), core_hint(core_error))
    } else {
        (1, None)
    };

    if let Some(hint) = hint {
        eprintln!();
        eprintln!("{}", hint);
    }
    code
}
