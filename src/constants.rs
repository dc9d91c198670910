// Defaults and fixed user-facing strings.

lazy_static::lazy_static! {
    /// Transcription locales used when neither the app file nor SPEECH_LOCALES set any.
    pub static ref DEFAULT_SPEECH_LOCALES: Vec<String> = vec!["en-IN".to_string(), "hi-IN".to_string()];
}

pub const DEFAULT_APP_FILE: &str = "app.toml";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8000;

pub const SPEECH_API_VERSION: &str = "2024-11-15";
pub const TRANSLATOR_API_VERSION: &str = "3.0";
pub const COSMOS_API_VERSION: &str = "2018-12-31";
pub const DEFAULT_TTS_VOICE: &str = "en-US-AvaMultilingualNeural";
pub const TTS_OUTPUT_FORMAT: &str = "riff-24khz-16bit-mono-pcm";

/// Recording format expected from the browser.
pub const AUDIO_SAMPLE_RATE: u32 = 24_000;
pub const AUDIO_CHANNELS: u16 = 1;
pub const AUDIO_BITS_PER_SAMPLE: u16 = 16;

pub const ANSWER_STEP_NAME: &str = "Answer generator...";
pub const SPEECH_STEP_NAME: &str = "Speech to text...";
pub const MESSAGE_RUN_STEP: &str = "on_message";
pub const AUDIO_RUN_STEP: &str = "on_audio_end";
pub const USER_AUTHOR: &str = "You";

pub const ANSWER_FAILED: &str = "I apologize, but I encountered an error. Please try again.";
pub const NO_AUDIO: &str = "No audio recorded. Please try again.";
pub const AUDIO_FAILED: &str = "Sorry, I encountered an error processing the audio. Please try again.";
pub const TASK_STOPPED: &str = "Task stopped as requested.";
pub const WELCOME_BACK: &str = "Welcome back! Continuing your previous conversation.";
pub const RESUME_FAILED: &str =
    "There was an error resuming your previous session. Starting a new conversation.";
pub const SETTINGS_UPDATED: &str = "Settings updated successfully.";
pub const SETTINGS_FAILED: &str = "Failed to update settings. Please try again.";
