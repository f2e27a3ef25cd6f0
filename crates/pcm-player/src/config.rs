/// Playback tuning parameters for a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlaybackConfig {
    /// Length of audio moved per read/write step, in milliseconds.
    pub buffer_ms: u32,
}

impl PlaybackConfig {
    pub const DEFAULT_BUFFER_MS: u32 = 40;
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            buffer_ms: Self::DEFAULT_BUFFER_MS,
        }
    }
}
