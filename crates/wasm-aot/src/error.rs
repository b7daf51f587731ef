#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or ill-typed input module. The message carries the
    /// canonical load-error text ("integer too large", "type mismatch", ...)
    /// that callers and tests match on.
    #[error("WASM module load failed: {0}")]
    Load(String),

    /// Valid module that uses a feature this compiler does not lower.
    #[error("Unsupported WASM feature: {0}")]
    Unsupported(String),

    /// Bad target / option combination in the compilation options.
    #[error("Invalid compilation option: {0}")]
    InvalidOption(String),

    /// LLVM rejected something we built.
    #[error("LLVM error: {0}")]
    Llvm(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn load(msg: impl Into<String>) -> Self {
        Self::Load(msg.into())
    }
}

impl From<inkwell::builder::BuilderError> for Error {
    fn from(e: inkwell::builder::BuilderError) -> Self {
        Self::Llvm(format!("builder error: {e:?}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
