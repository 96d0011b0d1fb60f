// Audio parameters of the voice transport and the remote service
pub const VOICE_SAMPLE_RATE: u32 = 48000; // voice channel, both directions
pub const VOICE_CHANNELS: u16 = 2; // voice channel frames arrive interleaved stereo
pub const REMOTE_INPUT_SAMPLE_RATE: u32 = 16000; // what we send upstream
pub const REMOTE_OUTPUT_SAMPLE_RATE: u32 = 24000; // what the remote speaks back

/// Duration of a single voice activity frame.
pub const VAD_FRAME_MS: u32 = 20;

/// Capacity of each session queue. At 100ms per item this bounds the added
/// latency to roughly 10 seconds.
pub const SESSION_QUEUE_CAPACITY: usize = 100;
