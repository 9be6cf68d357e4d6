use std::sync::{Arc, LazyLock};
use std::time::Duration;

use crate::relay::transcoder::EncoderProfile;

/// Per-session settings, shared as `Arc` so tests can inject a
/// test-double encoder command.
pub struct RelaySettings {
    /// Encoder binary, `ffmpeg` unless overridden.
    pub encoder_program: String,
    /// Named encoding parameter set (see `EncoderProfile`).
    pub encoder_profile: EncoderProfile,
    /// Full argument override for custom encoders. The destination url is
    /// still appended as the final argument.
    pub encoder_args: Option<Vec<String>>,
    /// How long a stopping session waits for the encoder to exit before
    /// escalating to a kill.
    pub stop_grace: Duration,
    /// Bounded chunk queue depth between ingress and the stdin writer.
    pub chunk_capacity: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            encoder_program: "ffmpeg".to_string(),
            encoder_profile: EncoderProfile::Standard,
            encoder_args: None,
            stop_grace: Duration::from_secs(5),
            chunk_capacity: 64,
        }
    }
}

pub struct RelayConfig {
    bind_addr: String,
    pub settings: Arc<RelaySettings>,
}

impl RelayConfig {
    fn from_env() -> Self {
        let mut settings = RelaySettings::default();
        if let Ok(program) = std::env::var("RELAY_ENCODER_BIN") {
            settings.encoder_program = program;
        }
        if let Ok(profile) = std::env::var("RELAY_ENCODER_PROFILE") {
            settings.encoder_profile = EncoderProfile::by_name(&profile).unwrap_or_else(|| {
                log::warn!("unknown encoder profile {:?}, using standard", profile);
                EncoderProfile::Standard
            });
        }
        if let Ok(args) = std::env::var("RELAY_ENCODER_ARGS") {
            settings.encoder_args = Some(args.split_whitespace().map(str::to_string).collect());
        }
        if let Ok(secs) = std::env::var("RELAY_STOP_GRACE_SECS") {
            if let Ok(secs) = secs.parse() {
                settings.stop_grace = Duration::from_secs(secs);
            }
        }
        Self {
            bind_addr: std::env::var("RELAY_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            settings: Arc::new(settings),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.bind_addr
    }
}

pub fn config() -> &'static RelayConfig {
    static CONFIG: LazyLock<RelayConfig> = LazyLock::new(RelayConfig::from_env);
    &CONFIG
}
