/// Fatal startup errors.
///
/// Worker loops never propagate failures: insufficient evidence, geometric
/// degeneracy and dangling references are recovered by fallback or by
/// dropping the work unit. The only errors a caller ever sees are the ones
/// that make starting the engine impossible.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{source}")]
    Config {
        #[from]
        source: skein_types::ConfigError,
    },
    #[error("{source}")]
    Mvg {
        #[from]
        source: skein_mvg::MvgError,
    },
    #[error("vocabulary is unusable: {reason}")]
    Vocabulary { reason: &'static str },
}

pub type Result<T> = std::result::Result<T, Error>;
