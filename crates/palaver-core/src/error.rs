use palaver_channels::ChannelError;
use palaver_schema::ChainOutput;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Expected control-flow outcome: a generation was cancelled mid-stream.
    /// Carries whatever partial output had accumulated.
    #[error("generation cancelled")]
    GenerationCancelled(ChainOutput),

    /// Permanent generation failure (provider error, retry exhaustion).
    #[error("generation failed: {0}")]
    Generation(String),

    /// Programming-contract violation in channel/session wiring.
    #[error("message handler error: {0}")]
    Handler(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    pub fn cancelled_output(self) -> Option<ChainOutput> {
        match self {
            Self::GenerationCancelled(output) => Some(output),
            _ => None,
        }
    }
}
