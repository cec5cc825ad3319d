//! Connection configuration.

use h3_codec::VarInt;

/// Configures an HTTP/3 server connection.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Largest field section accepted on a request. Larger header blocks
    /// reset the stream.
    pub max_field_section_size: u64,
    /// Include a reserved-identifier entry in the SETTINGS frame.
    ///
    /// Just like in HTTP/2, HTTP/3 uses "grease" to keep unknown-identifier
    /// handling honest across implementations.
    pub send_grease: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_field_section_size: VarInt::MAX.0,
            send_grease: true,
        }
    }
}

impl Config {
    pub(crate) fn machine(&self) -> h3_machine::Config {
        h3_machine::Config {
            max_field_section_size: self.max_field_section_size,
            send_grease: self.send_grease,
        }
    }
}
