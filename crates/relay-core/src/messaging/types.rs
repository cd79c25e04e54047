/// Capabilities / limits of a platform implementation.
#[derive(Clone, Copy, Debug)]
pub struct PlatformCapabilities {
    pub supports_images: bool,
    pub supports_mentions: bool,
    pub max_message_len: usize,
}

impl Default for PlatformCapabilities {
    fn default() -> Self {
        Self {
            supports_images: false,
            supports_mentions: false,
            max_message_len: 4096,
        }
    }
}
