use ddff::DdffError;
use thiserror::Error;

/// Exit status for any failure that is not one of the cases below.
pub const EXIT_FAILURE: i32 = 1;
/// Exit status for a malformed command line.
pub const EXIT_USAGE: i32 = 2;
/// Exit status when the file fails its integrity checks.
pub const EXIT_CORRUPT: i32 = 3;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("cannot open '{path}': {source}")]
    Open { path: String, source: DdffError },

    #[error("no stream named '{0}'")]
    UnknownKey(String),

    #[error("'{path}': {problems} problem(s) found")]
    Corrupt { path: String, problems: usize },

    #[error(transparent)]
    Ddff(#[from] DdffError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Process exit status for this error. Damaged files get their own
    /// status so scripts can tell them apart from a missing file or a held
    /// lock.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Usage(_) | CliError::UnknownCommand(_) => EXIT_USAGE,
            CliError::Corrupt { .. } => EXIT_CORRUPT,
            CliError::Open { source, .. } | CliError::Ddff(source) if is_damage(source) => EXIT_CORRUPT,
            _ => EXIT_FAILURE,
        }
    }

    /// Output cut short by a closed pipe, e.g. `ddff cat f key | head`.
    pub fn is_broken_pipe(&self) -> bool {
        matches!(self, CliError::Io(e) if e.kind() == std::io::ErrorKind::BrokenPipe)
    }
}

/// Errors that mean the file content itself is bad.
fn is_damage(e: &DdffError) -> bool {
    matches!(
        e,
        DdffError::BlockCrc { .. }
            | DdffError::StreamIdMismatch { .. }
            | DdffError::FirstBlock { .. }
            | DdffError::BlockSizeMismatch { .. }
            | DdffError::BufferTooSmall { .. }
            | DdffError::InvalidBlockSize(_)
            | DdffError::MalformedRecord(_)
            | DdffError::UnexpectedEnd(_)
    )
}

/// All command functions return this type.
pub type CliResult = Result<(), CliError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_exit_codes() {
        assert_eq!(CliError::Usage("ddff ls <ddff-file>").exit_code(), EXIT_USAGE);
        assert_eq!(CliError::UnknownCommand("rm".into()).exit_code(), EXIT_USAGE);
        let crc = DdffError::BlockCrc {
            offset: 0,
            fill: 40,
            stored: 1,
            computed: 2,
        };
        let open = CliError::Open {
            path: "a.ddff".into(),
            source: crc,
        };
        assert_eq!(open.exit_code(), EXIT_CORRUPT);
        assert!(open.to_string().starts_with("cannot open 'a.ddff': block checksum mismatch"));
        let missing = CliError::Open {
            path: "b.ddff".into(),
            source: DdffError::FileMissing(PathBuf::from("b.ddff")),
        };
        assert_eq!(missing.exit_code(), EXIT_FAILURE);
        assert_eq!(
            CliError::Corrupt {
                path: "c.ddff".into(),
                problems: 2
            }
            .exit_code(),
            EXIT_CORRUPT
        );
    }

    #[test]
    fn test_broken_pipe_detected() {
        let e = CliError::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(e.is_broken_pipe());
        assert_eq!(e.exit_code(), EXIT_FAILURE);
    }
}
